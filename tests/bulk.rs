//! tests/bulk.rs
//! Bulk submission over a target catalog in `missing` and `all` mode.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use phasekeeper::{
  BulkMode, BulkResult, CatalogError, DeadLetterEntry, DeadLetterPage, DeadLetterStatus,
  EnqueueOutcome, EnqueueRequest, InsertOutcome, Job, JobId, JobStatus, JobStore, MemoryStore,
  Phase, PipelineError, StoreError, TargetId, TriggerConfig,
};

use crate::common::{
  exec_counter, exec_until_cancelled, fixed_catalog, manual_builder, setup_tracing, wait_for_count,
  wait_for_status,
};

const TARGETS: [&str; 10] = [
  "scene-0", "scene-1", "scene-2", "scene-3", "scene-4", "scene-5", "scene-6", "scene-7", "scene-8",
  "scene-9",
];

// Writes a finished job for `target` straight into the store.
fn seed_completed(store: &MemoryStore, phase: Phase, target: &str) {
  let now = Utc::now();
  let mut job = Job::new(EnqueueRequest::new(phase, target), 3, now);
  job.status = JobStatus::Completed;
  job.progress = Some(100);
  job.completed_at = Some(now);
  store.insert(job).expect("seed insert");
}

#[tokio::test]
async fn test_missing_mode_skips_completed_and_active() -> anyhow::Result<()> {
  setup_tracing();
  let store = MemoryStore::arc();
  for target in &TARGETS[..3] {
    seed_completed(&store, Phase::Sprites, target);
  }

  let started = Arc::new(AtomicUsize::new(0));
  let saw_cancel = Arc::new(AtomicBool::new(false));
  let scheduler = manual_builder()
    .store(store.clone())
    .catalog(fixed_catalog(&TARGETS))
    .executor(Phase::Sprites, exec_until_cancelled(started, saw_cancel))
    .build()?;

  // Two targets already have a job in flight.
  for target in &TARGETS[3..5] {
    let outcome = scheduler
      .enqueue(EnqueueRequest::new(Phase::Sprites, *target))
      .await?;
    assert!(outcome.is_created());
  }

  let result = scheduler.submit_bulk(Phase::Sprites, BulkMode::Missing).await?;
  assert_eq!(
    result,
    BulkResult {
      submitted: 5,
      skipped: 5,
      errors: 0
    }
  );

  // Running it again submits nothing new.
  let again = scheduler.submit_bulk(Phase::Sprites, BulkMode::Missing).await?;
  assert_eq!(again.submitted, 0);
  assert_eq!(again.skipped, 10);

  let active = store.active()?;
  assert_eq!(active.len(), 7);
  assert!(active.iter().all(|job| job.phase == Phase::Sprites));

  scheduler.shutdown_force(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}

#[tokio::test]
async fn test_all_mode_regenerates_completed_targets() -> anyhow::Result<()> {
  setup_tracing();
  let store = MemoryStore::arc();
  for target in &TARGETS[..3] {
    seed_completed(&store, Phase::Fingerprint, target);
  }

  let started = Arc::new(AtomicUsize::new(0));
  let saw_cancel = Arc::new(AtomicBool::new(false));
  let scheduler = manual_builder()
    .store(store.clone())
    .catalog(fixed_catalog(&TARGETS[..5]))
    .executor(Phase::Fingerprint, exec_until_cancelled(started, saw_cancel))
    .build()?;

  scheduler
    .enqueue(EnqueueRequest::new(Phase::Fingerprint, TARGETS[4]))
    .await?;

  let result = scheduler.submit_bulk(Phase::Fingerprint, BulkMode::All).await?;
  // The active job is still skipped; completed targets are resubmitted.
  assert_eq!(
    result,
    BulkResult {
      submitted: 4,
      skipped: 1,
      errors: 0
    }
  );

  scheduler.shutdown_force(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}

#[tokio::test]
async fn test_bulk_without_catalog_is_rejected() -> anyhow::Result<()> {
  setup_tracing();
  let scheduler = manual_builder().build()?;

  assert_eq!(
    scheduler.submit_bulk(Phase::Thumbnail, BulkMode::Missing).await,
    Err(PipelineError::NoTargetCatalog)
  );

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}

#[tokio::test]
async fn test_catalog_failure_is_reported() -> anyhow::Result<()> {
  setup_tracing();
  let scheduler = manual_builder()
    .catalog(|_phase: Phase| -> Result<Vec<TargetId>, CatalogError> {
      Err(CatalogError("scene table unavailable".to_string()))
    })
    .build()?;

  let result = scheduler.submit_bulk(Phase::Thumbnail, BulkMode::All).await;
  assert_eq!(
    result,
    Err(PipelineError::Catalog(CatalogError(
      "scene table unavailable".to_string()
    )))
  );
  assert!(scheduler.job_history(1, 10).await?.jobs.is_empty());

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}

#[test]
fn test_bulk_mode_parses_wire_names() {
  assert_eq!("missing".parse::<BulkMode>(), Ok(BulkMode::Missing));
  assert_eq!("all".parse::<BulkMode>(), Ok(BulkMode::All));
  assert!("some".parse::<BulkMode>().is_err());
  assert_eq!(BulkMode::default(), BulkMode::Missing);
}

// --- Per-target failures ---

/// Delegates to a [`MemoryStore`] but refuses inserts for one target.
// Rejects inserts for one target, or for one (target, phase) pair when
// `broken_phase` is set.
struct FlakyStore {
  inner: MemoryStore,
  broken_target: TargetId,
  broken_phase: Option<Phase>,
}

impl JobStore for FlakyStore {
  fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError> {
    let phase_matches = self.broken_phase.map_or(true, |phase| phase == job.phase);
    if job.target_id == self.broken_target && phase_matches {
      return Err(StoreError::Backend("disk full".to_string()));
    }
    self.inner.insert(job)
  }

  fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
    self.inner.get(job_id)
  }

  fn update(
    &self,
    job_id: JobId,
    expected: &[JobStatus],
    apply: &mut dyn FnMut(&mut Job),
  ) -> Result<Job, StoreError> {
    self.inner.update(job_id, expected, apply)
  }

  fn list(&self, page: usize, limit: usize) -> Result<(Vec<Job>, usize), StoreError> {
    self.inner.list(page, limit)
  }

  fn active(&self) -> Result<Vec<Job>, StoreError> {
    self.inner.active()
  }

  fn active_for(&self, target_id: &TargetId, phase: Phase) -> Result<Option<JobId>, StoreError> {
    self.inner.active_for(target_id, phase)
  }

  fn has_completed(&self, target_id: &TargetId, phase: Phase) -> Result<bool, StoreError> {
    self.inner.has_completed(target_id, phase)
  }

  fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    self.inner.purge_finished_before(cutoff)
  }

  fn record_dead_letter(
    &self,
    job: &Job,
    error: &str,
    now: DateTime<Utc>,
  ) -> Result<DeadLetterEntry, StoreError> {
    self.inner.record_dead_letter(job, error, now)
  }

  fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
    self.inner.dead_letter(job_id)
  }

  fn transition_dead_letter(
    &self,
    job_id: JobId,
    expected: DeadLetterStatus,
    next: DeadLetterStatus,
    now: DateTime<Utc>,
  ) -> Result<DeadLetterEntry, StoreError> {
    self.inner.transition_dead_letter(job_id, expected, next, now)
  }

  fn remove_dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
    self.inner.remove_dead_letter(job_id)
  }

  fn list_dead_letters(
    &self,
    page: usize,
    limit: usize,
    status: Option<DeadLetterStatus>,
  ) -> Result<DeadLetterPage, StoreError> {
    self.inner.list_dead_letters(page, limit, status)
  }
}

#[tokio::test]
async fn test_store_failure_counts_as_error_and_batch_continues() -> anyhow::Result<()> {
  setup_tracing();
  let store = Arc::new(FlakyStore {
    inner: MemoryStore::new(),
    broken_target: TargetId::from("scene-2"),
    broken_phase: None,
  });
  let started = Arc::new(AtomicUsize::new(0));
  let saw_cancel = Arc::new(AtomicBool::new(false));
  let scheduler = manual_builder()
    .store(store.clone())
    .catalog(fixed_catalog(&TARGETS[..4]))
    .executor(Phase::AnimatedThumbnails, exec_until_cancelled(started, saw_cancel))
    .build()?;

  let result = scheduler
    .submit_bulk(Phase::AnimatedThumbnails, BulkMode::Missing)
    .await?;
  assert_eq!(
    result,
    BulkResult {
      submitted: 3,
      skipped: 0,
      errors: 1
    }
  );
  assert_eq!(store.inner.len(), 3);

  // The same failure surfaces directly on a single enqueue.
  let single = scheduler
    .enqueue(EnqueueRequest::new(Phase::AnimatedThumbnails, "scene-2"))
    .await;
  assert!(matches!(single, Err(PipelineError::Store(StoreError::Backend(_)))));

  scheduler.shutdown_force(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}

#[tokio::test]
async fn test_import_reports_each_phase_separately() -> anyhow::Result<()> {
  setup_tracing();
  let store = Arc::new(FlakyStore {
    inner: MemoryStore::new(),
    broken_target: TargetId::from("scene-7"),
    broken_phase: Some(Phase::AnimatedThumbnails),
  });
  let started = Arc::new(AtomicUsize::new(0));
  let saw_cancel = Arc::new(AtomicBool::new(false));
  let scheduler = manual_builder()
    .store(store.clone())
    .trigger(TriggerConfig::on_import(Phase::Metadata))
    .trigger(TriggerConfig::on_import(Phase::Fingerprint))
    .trigger(TriggerConfig::on_import(Phase::AnimatedThumbnails))
    .executor(Phase::Metadata, exec_until_cancelled(started.clone(), saw_cancel.clone()))
    .executor(Phase::Fingerprint, exec_until_cancelled(started, saw_cancel))
    .build()?;

  let outcomes = scheduler.import("scene-7").await?;
  let phases: Vec<Phase> = outcomes.iter().map(|(phase, _)| *phase).collect();
  assert_eq!(
    phases,
    vec![Phase::Metadata, Phase::AnimatedThumbnails, Phase::Fingerprint]
  );
  for (phase, outcome) in &outcomes {
    match phase {
      Phase::AnimatedThumbnails => assert!(matches!(
        outcome,
        Err(PipelineError::Store(StoreError::Backend(_)))
      )),
      _ => assert!(outcome.as_ref().is_ok_and(EnqueueOutcome::is_created)),
    }
  }
  // Phases before and after the failing one were both enqueued.
  assert_eq!(store.inner.len(), 2);

  scheduler.shutdown_force(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}

#[tokio::test]
async fn test_slow_catalog_does_not_stall_other_work() -> anyhow::Result<()> {
  setup_tracing();
  let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
  let release_rx = parking_lot::Mutex::new(release_rx);
  let listings = Arc::new(AtomicUsize::new(0));
  let listing_started = listings.clone();
  let thumbnails = Arc::new(AtomicUsize::new(0));
  let sprites = Arc::new(AtomicUsize::new(0));
  let scheduler = manual_builder()
    .catalog(move |_phase: Phase| -> Result<Vec<TargetId>, CatalogError> {
      listing_started.fetch_add(1, Ordering::SeqCst);
      // Holds the listing open until the test releases it.
      let _ = release_rx.lock().recv_timeout(StdDuration::from_secs(10));
      Ok(vec![TargetId::from("scene-1"), TargetId::from("scene-2")])
    })
    .executor(Phase::Thumbnail, exec_counter(thumbnails.clone(), StdDuration::ZERO))
    .executor(Phase::Sprites, exec_counter(sprites.clone(), StdDuration::ZERO))
    .build()?;

  let bulk = tokio::spawn({
    let scheduler = scheduler.clone();
    async move { scheduler.submit_bulk(Phase::Sprites, BulkMode::All).await }
  });
  wait_for_count(&listings, 1, StdDuration::from_secs(3)).await;

  // The listing is still blocked, yet a single job runs to completion.
  let job_id = scheduler
    .enqueue(EnqueueRequest::new(Phase::Thumbnail, "scene-9"))
    .await?
    .job_id();
  wait_for_status(&scheduler, job_id, JobStatus::Completed, StdDuration::from_secs(3)).await;
  assert!(!bulk.is_finished());
  assert_eq!(sprites.load(Ordering::SeqCst), 0);

  release_tx.send(())?;
  let result = bulk.await??;
  assert_eq!(
    result,
    BulkResult {
      submitted: 2,
      skipped: 0,
      errors: 0
    }
  );
  wait_for_count(&sprites, 2, StdDuration::from_secs(3)).await;
  assert_eq!(thumbnails.load(Ordering::SeqCst), 1);

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}
