//! tests/config.rs
//! Runtime retry configuration, job history and the retention purge.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use phasekeeper::scheduler::{DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT};
use phasekeeper::{
  BulkMode, ConfigError, EnqueueRequest, EventKind, JobStatus, Phase, PhaseRetryConfig,
  PipelineError, RetentionPolicy, RetryConfig,
};

use crate::common::{
  exec_always_fail, exec_counter, fixed_catalog, manual_builder, setup_tracing, wait_for_event,
  wait_for_status,
};

fn retry_for(configs: &[PhaseRetryConfig], phase: Phase) -> RetryConfig {
  configs
    .iter()
    .find(|entry| entry.phase == phase)
    .map(|entry| entry.config)
    .expect("every phase has a retry config")
}

#[tokio::test]
async fn test_retry_configs_update_atomically() -> anyhow::Result<()> {
  setup_tracing();
  let scheduler = manual_builder().build()?;

  let defaults = scheduler.retry_configs();
  assert_eq!(defaults.len(), Phase::ALL.len());
  assert_eq!(retry_for(&defaults, Phase::Thumbnail), RetryConfig::new(3, 30, 3_600, 2.0));
  assert_eq!(retry_for(&defaults, Phase::Scan), RetryConfig::new(1, 60, 600, 2.0));

  let sprites = RetryConfig::new(5, 10, 100, 3.0);
  scheduler
    .update_retry_configs(vec![PhaseRetryConfig::new(Phase::Sprites, sprites)])
    .await?;
  assert_eq!(retry_for(&scheduler.retry_configs(), Phase::Sprites), sprites);

  // One bad entry rejects the whole list.
  let result = scheduler
    .update_retry_configs(vec![
      PhaseRetryConfig::new(Phase::Metadata, RetryConfig::new(2, 5, 50, 2.0)),
      PhaseRetryConfig::new(Phase::Thumbnail, RetryConfig::new(11, 5, 50, 2.0)),
    ])
    .await;
  assert!(matches!(
    result,
    Err(PipelineError::InvalidConfiguration(ConfigError::OutOfRange {
      phase: Phase::Thumbnail,
      field: "max_retries",
      ..
    }))
  ));
  assert_eq!(
    retry_for(&scheduler.retry_configs(), Phase::Metadata),
    RetryConfig::new(3, 30, 3_600, 2.0)
  );

  let duplicate = scheduler
    .update_retry_configs(vec![
      PhaseRetryConfig::new(Phase::Sprites, sprites),
      PhaseRetryConfig::new(Phase::Sprites, sprites),
    ])
    .await;
  assert_eq!(
    duplicate,
    Err(PipelineError::InvalidConfiguration(ConfigError::DuplicatePhase(Phase::Sprites)))
  );

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}

#[tokio::test]
async fn test_updated_retry_budget_applies_to_next_failure() -> anyhow::Result<()> {
  setup_tracing();
  let calls = Arc::new(AtomicUsize::new(0));
  let scheduler = manual_builder()
    .executor(Phase::Metadata, exec_always_fail(calls.clone(), false))
    .retry_config(Phase::Metadata, RetryConfig::new(3, 1, 1, 1.0))
    .build()?;
  let mut events = scheduler.subscribe();

  scheduler
    .update_retry_configs(vec![PhaseRetryConfig::new(
      Phase::Metadata,
      RetryConfig::new(0, 1, 1, 1.0),
    )])
    .await?;

  let job_id = scheduler
    .enqueue(EnqueueRequest::new(Phase::Metadata, "scene-1"))
    .await?
    .job_id();
  wait_for_event(&mut events, EventKind::Failed, job_id, StdDuration::from_secs(3)).await;
  let job = scheduler.get_job(job_id).await?;
  assert_eq!(job.max_retries, 0);
  assert_eq!(calls.load(Ordering::SeqCst), 1);

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}

#[test]
fn test_retention_describes_its_window() {
  let day = 86_400;
  assert_eq!(RetentionPolicy::default().describe(), "7 days");
  assert_eq!(RetentionPolicy::new(StdDuration::from_secs(day)).describe(), "1 day");
  assert_eq!(RetentionPolicy::new(StdDuration::from_secs(12 * 3_600)).describe(), "12 hours");
  assert_eq!(RetentionPolicy::new(StdDuration::from_secs(120)).describe(), "2 minutes");
  assert_eq!(RetentionPolicy::new(StdDuration::from_secs(90)).describe(), "90 seconds");
}

#[tokio::test]
async fn test_job_history_pages_newest_first() -> anyhow::Result<()> {
  setup_tracing();
  let runs = Arc::new(AtomicUsize::new(0));
  let scheduler = manual_builder()
    .executor(Phase::Thumbnail, exec_counter(runs.clone(), StdDuration::ZERO))
    .retention(RetentionPolicy::new(StdDuration::from_secs(3 * 86_400)))
    .build()?;

  let mut ids = Vec::new();
  for n in 0..5 {
    let id = scheduler
      .enqueue(EnqueueRequest::new(Phase::Thumbnail, format!("scene-{}", n)))
      .await?
      .job_id();
    ids.push(id);
    tokio::time::sleep(StdDuration::from_millis(5)).await;
  }
  for id in &ids {
    wait_for_status(&scheduler, *id, JobStatus::Completed, StdDuration::from_secs(3)).await;
  }

  let first = scheduler.job_history(1, 2).await?;
  assert_eq!(first.total, 5);
  assert_eq!((first.page, first.limit), (1, 2));
  let first_ids: Vec<_> = first.jobs.iter().map(|job| job.id).collect();
  assert_eq!(first_ids, vec![ids[4], ids[3]]);
  assert!(first.active_jobs.is_empty());
  assert_eq!(first.retention, "3 days");
  assert_eq!(first.pool_config, scheduler.pool_config());
  assert_eq!(first.queue_status.len(), Phase::ALL.len());

  let last = scheduler.job_history(3, 2).await?;
  assert_eq!(last.jobs.len(), 1);
  assert_eq!(last.jobs[0].id, ids[0]);

  let defaulted = scheduler.job_history(0, 0).await?;
  assert_eq!((defaulted.page, defaulted.limit), (1, DEFAULT_PAGE_LIMIT));
  let capped = scheduler.job_history(1, 10_000).await?;
  assert_eq!(capped.limit, MAX_PAGE_LIMIT);

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}

#[tokio::test]
async fn test_purge_removes_old_jobs_but_keeps_dead_letters() -> anyhow::Result<()> {
  setup_tracing();
  let runs = Arc::new(AtomicUsize::new(0));
  let failures = Arc::new(AtomicUsize::new(0));
  let retention = RetentionPolicy {
    keep_finished: StdDuration::ZERO,
    purge_interval: StdDuration::from_millis(50),
  };
  let scheduler = manual_builder()
    .catalog(fixed_catalog(&["scene-1"]))
    .executor(Phase::Thumbnail, exec_counter(runs.clone(), StdDuration::ZERO))
    .executor(Phase::Sprites, exec_always_fail(failures.clone(), true))
    .retention(retention)
    .build()?;
  let mut events = scheduler.subscribe();

  let done = scheduler
    .enqueue(EnqueueRequest::new(Phase::Thumbnail, "scene-1"))
    .await?
    .job_id();
  let failed = scheduler
    .enqueue(EnqueueRequest::new(Phase::Sprites, "scene-1"))
    .await?
    .job_id();
  wait_for_event(&mut events, EventKind::Completed, done, StdDuration::from_secs(3)).await;
  wait_for_event(&mut events, EventKind::Failed, failed, StdDuration::from_secs(3)).await;

  let deadline = tokio::time::Instant::now() + StdDuration::from_secs(3);
  while scheduler.get_job(done).await.is_ok() {
    assert!(tokio::time::Instant::now() < deadline, "finished job was never purged");
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
  assert_eq!(scheduler.get_job(done).await, Err(PipelineError::JobNotFound(done)));
  // Referenced by a dead-letter entry, so it stays.
  assert_eq!(scheduler.get_job(failed).await?.status, JobStatus::Failed);
  assert!(scheduler.metrics_snapshot().jobs_purged >= 1);

  // Completion is remembered after the record is gone.
  let bulk = scheduler.submit_bulk(Phase::Thumbnail, BulkMode::Missing).await?;
  assert_eq!((bulk.submitted, bulk.skipped), (0, 1));

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}
