//! tests/cancel.rs
//! Cancelling queued, running and finished jobs.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use phasekeeper::{EnqueueRequest, EventKind, JobStatus, Phase, PipelineError};
use uuid::Uuid;

use crate::common::{
  exec_counter, exec_until_cancelled, manual_builder, setup_tracing, wait_for_count,
  wait_for_event, wait_for_status,
};

#[tokio::test]
async fn test_cancel_queued_job_never_runs() -> anyhow::Result<()> {
  setup_tracing();
  let started = Arc::new(AtomicUsize::new(0));
  let saw_cancel = Arc::new(AtomicBool::new(false));
  let scheduler = manual_builder()
    .workers(Phase::Metadata, 1)
    .executor(Phase::Metadata, exec_until_cancelled(started.clone(), saw_cancel.clone()))
    .build()?;

  let running = scheduler
    .enqueue(EnqueueRequest::new(Phase::Metadata, "scene-1"))
    .await?
    .job_id();
  wait_for_count(&started, 1, StdDuration::from_secs(3)).await;
  let queued = scheduler
    .enqueue(EnqueueRequest::new(Phase::Metadata, "scene-2"))
    .await?
    .job_id();

  scheduler.cancel_job(queued).await?;
  let job = scheduler.get_job(queued).await?;
  assert_eq!(job.status, JobStatus::Cancelled);
  assert!(job.completed_at.is_some());
  let status = scheduler.queue_status().await?;
  assert_eq!(status[&Phase::Metadata].queued, 0);
  assert_eq!(status[&Phase::Metadata].running, 1);

  // Free the only worker; the cancelled job must not be picked up.
  scheduler.cancel_job(running).await?;
  tokio::time::sleep(StdDuration::from_millis(200)).await;
  assert_eq!(started.load(Ordering::SeqCst), 1);
  assert_eq!(scheduler.get_job(queued).await?.status, JobStatus::Cancelled);

  scheduler.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}

#[tokio::test]
async fn test_cancel_running_job_signals_executor() -> anyhow::Result<()> {
  setup_tracing();
  let started = Arc::new(AtomicUsize::new(0));
  let saw_cancel = Arc::new(AtomicBool::new(false));
  let scheduler = manual_builder()
    .executor(Phase::Sprites, exec_until_cancelled(started.clone(), saw_cancel.clone()))
    .build()?;
  let mut events = scheduler.subscribe();

  let job_id = scheduler
    .enqueue(EnqueueRequest::new(Phase::Sprites, "scene-3"))
    .await?
    .job_id();
  wait_for_status(&scheduler, job_id, JobStatus::Running, StdDuration::from_secs(3)).await;

  scheduler.cancel_job(job_id).await?;
  let event = wait_for_event(&mut events, EventKind::Cancelled, job_id, StdDuration::from_secs(2)).await;
  assert_eq!(event.name(), "cancelled");

  let deadline = tokio::time::Instant::now() + StdDuration::from_secs(2);
  while !saw_cancel.load(Ordering::SeqCst) {
    assert!(tokio::time::Instant::now() < deadline, "executor never saw the cancel signal");
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }

  // The executor's late result does not overwrite the cancellation.
  tokio::time::sleep(StdDuration::from_millis(100)).await;
  let job = scheduler.get_job(job_id).await?;
  assert_eq!(job.status, JobStatus::Cancelled);
  assert_eq!(scheduler.list_dead_letters(1, 10, None).await?.counts.total, 0);
  assert_eq!(scheduler.metrics_snapshot().jobs_cancelled, 1);

  // The slot is free again.
  let again = scheduler
    .enqueue(EnqueueRequest::new(Phase::Sprites, "scene-3"))
    .await?;
  assert!(again.is_created());
  assert_ne!(again.job_id(), job_id);

  scheduler.cancel_job(again.job_id()).await?;
  scheduler.shutdown_graceful(Some(StdDuration::from_secs(5))).await?;
  Ok(())
}

#[tokio::test]
async fn test_cancel_finished_job_is_a_no_op() -> anyhow::Result<()> {
  setup_tracing();
  let runs = Arc::new(AtomicUsize::new(0));
  let scheduler = manual_builder()
    .executor(Phase::Thumbnail, exec_counter(runs.clone(), StdDuration::ZERO))
    .build()?;

  let job_id = scheduler
    .enqueue(EnqueueRequest::new(Phase::Thumbnail, "scene-4"))
    .await?
    .job_id();
  let finished = wait_for_status(&scheduler, job_id, JobStatus::Completed, StdDuration::from_secs(3)).await;

  scheduler.cancel_job(job_id).await?;
  let after = scheduler.get_job(job_id).await?;
  assert_eq!(after, finished);
  assert_eq!(scheduler.metrics_snapshot().jobs_cancelled, 0);

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}

#[tokio::test]
async fn test_cancel_unknown_job_is_not_found() -> anyhow::Result<()> {
  setup_tracing();
  let scheduler = manual_builder().build()?;
  let missing = Uuid::new_v4();

  assert_eq!(
    scheduler.cancel_job(missing).await,
    Err(PipelineError::JobNotFound(missing))
  );
  assert_eq!(
    scheduler.get_job(missing).await,
    Err(PipelineError::JobNotFound(missing))
  );

  scheduler.shutdown_graceful(None).await?;
  Ok(())
}
