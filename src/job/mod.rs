#[cfg(feature = "job_context")]
pub mod context;

use crate::config::PoolConfig;
use crate::error::ExecutionError;
use crate::phase::Phase;
use crate::store::JobStore;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::trace;
use uuid::Uuid;

// --- Public Type Aliases ---

/// Type alias for the unique identifier of a job. Uses UUID v4.
pub type JobId = Uuid;

/// Per-coordinator sequence number of a spawned attempt, used in log spans.
pub(crate) type WorkerId = u64;

/// Phase-specific parameters handed to the executor, and payload fields it
/// hands back.
pub type Params = BTreeMap<String, String>;

/// Outcome of one executor invocation.
pub type ExecutionResult = Result<ExecutionOutput, ExecutionError>;

/// The function type phase executors are registered as.
///
/// The function must be asynchronous, `Send + Sync + 'static`, and return a
/// `Future` resolving to an [`ExecutionResult`]:
/// - `Ok(output)` completes the job; `output.payload` is attached to the
///   `{phase}_complete` event.
/// - `Err(ExecutionError::Transient(_))` consumes one retry.
/// - `Err(ExecutionError::Terminal(_))` sends the job straight to the dead-letter queue.
///
/// Panics are caught by the worker and treated as transient failures.
pub type BoxedExecFn = Box<
  dyn Fn(ExecutionRequest) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

// --- Identifiers & Status ---

/// Opaque identifier of the entity a job processes (e.g. a scene ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TargetId(String);

impl TargetId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TargetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for TargetId {
  fn from(id: &str) -> Self {
    Self(id.to_string())
  }
}

impl From<String> for TargetId {
  fn from(id: String) -> Self {
    Self(id)
  }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum JobStatus {
  Queued,
  Running,
  Completed,
  Failed,
  Cancelled,
  TimedOut,
}

impl JobStatus {
  /// Queued or running: the job holds the (target, phase) slot.
  pub fn is_active(&self) -> bool {
    matches!(self, JobStatus::Queued | JobStatus::Running)
  }

  pub fn is_terminal(&self) -> bool {
    !self.is_active()
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      JobStatus::Queued => "queued",
      JobStatus::Running => "running",
      JobStatus::Completed => "completed",
      JobStatus::Failed => "failed",
      JobStatus::Cancelled => "cancelled",
      JobStatus::TimedOut => "timed_out",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// --- Job Record ---

/// The unit of work: one phase applied to one target.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Job {
  pub id: JobId,
  pub phase: Phase,
  pub target_id: TargetId,
  pub status: JobStatus,
  /// Failed attempts already retried in the current budget.
  pub retry_count: u32,
  /// Retry ceiling as of the last failure evaluation.
  pub max_retries: u32,
  /// Advisory completion percentage reported by the executor.
  pub progress: Option<u8>,
  pub params: Params,
  pub created_at: DateTime<Utc>,
  /// The job is not claimable before this instant (retry backoff).
  pub eligible_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  /// `None` while the job is active.
  pub completed_at: Option<DateTime<Utc>>,
  /// Detail of the most recent failure.
  pub error_message: Option<String>,
}

impl Job {
  /// A fresh queued job, eligible immediately.
  pub fn new(request: EnqueueRequest, max_retries: u32, now: DateTime<Utc>) -> Self {
    Self {
      id: Uuid::new_v4(),
      phase: request.phase,
      target_id: request.target_id,
      status: JobStatus::Queued,
      retry_count: 0,
      max_retries,
      progress: None,
      params: request.params,
      created_at: now,
      eligible_at: now,
      started_at: None,
      completed_at: None,
      error_message: None,
    }
  }

  /// 1-based number of the attempt currently running (or next to run).
  pub fn attempt(&self) -> u32 {
    self.retry_count + 1
  }
}

/// A request to create a job for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnqueueRequest {
  pub phase: Phase,
  pub target_id: TargetId,
  #[cfg_attr(feature = "serde", serde(default))]
  pub params: Params,
}

impl EnqueueRequest {
  pub fn new(phase: Phase, target_id: impl Into<TargetId>) -> Self {
    Self {
      phase,
      target_id: target_id.into(),
      params: Params::new(),
    }
  }

  pub fn with_param(mut self, key: &str, value: &str) -> Self {
    self.params.insert(key.to_string(), value.to_string());
    self
  }
}

/// Result of an enqueue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "outcome", content = "job_id", rename_all = "snake_case"))]
pub enum EnqueueOutcome {
  /// A new job was created.
  Created(JobId),
  /// The target already had a queued or running job for the phase; nothing was created.
  AlreadyActive(JobId),
}

impl EnqueueOutcome {
  pub fn job_id(&self) -> JobId {
    match self {
      EnqueueOutcome::Created(id) | EnqueueOutcome::AlreadyActive(id) => *id,
    }
  }

  pub fn is_created(&self) -> bool {
    matches!(self, EnqueueOutcome::Created(_))
  }
}

// --- Execution Interface ---

/// Everything an executor receives for one attempt.
#[derive(Debug)]
pub struct ExecutionRequest {
  pub job_id: JobId,
  pub phase: Phase,
  pub target_id: TargetId,
  /// 1-based attempt number within the current retry budget.
  pub attempt: u32,
  pub params: Params,
  /// Fires when the job is cancelled or exceeds its phase timeout.
  pub cancel: CancelSignal,
  pub progress: ProgressReporter,
}

/// Successful executor output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
  /// Phase-specific fields published with the completion event.
  pub payload: Params,
}

impl ExecutionOutput {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, key: &str, value: impl ToString) -> Self {
    self.payload.insert(key.to_string(), value.to_string());
    self
  }
}

/// Cooperative stop signal handed to executors.
///
/// Executors that can abort early should poll [`CancelSignal::is_cancelled`]
/// or race their work against [`CancelSignal::cancelled`]. Executors that
/// ignore it run to completion and their result is discarded.
#[derive(Debug, Clone)]
pub struct CancelSignal {
  rx: watch::Receiver<bool>,
}

impl CancelSignal {
  pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
    Self { rx }
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once the job is asked to stop. Never resolves if the job
  /// finishes first.
  pub async fn cancelled(&mut self) {
    loop {
      if *self.rx.borrow_and_update() {
        return;
      }
      if self.rx.changed().await.is_err() {
        std::future::pending::<()>().await;
      }
    }
  }
}

/// Writes advisory progress onto the running job.
#[derive(Clone)]
pub struct ProgressReporter {
  job_id: JobId,
  store: Arc<dyn JobStore>,
}

impl ProgressReporter {
  pub(crate) fn new(job_id: JobId, store: Arc<dyn JobStore>) -> Self {
    Self { job_id, store }
  }

  /// Records `percent` (clamped to 100). Ignored once the job is no longer running.
  pub fn report(&self, percent: u8) {
    let percent = percent.min(100);
    let result = self
      .store
      .update(self.job_id, &[JobStatus::Running], &mut |job: &mut Job| {
        job.progress = Some(percent)
      });
    if let Err(e) = result {
      trace!(job_id = %self.job_id, error = %e, "Progress update ignored.");
    }
  }
}

impl fmt::Debug for ProgressReporter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ProgressReporter")
      .field("job_id", &self.job_id)
      .field("store", &format_args!("Arc<dyn JobStore>"))
      .finish()
  }
}

// --- Public Snapshot Structs for Querying ---

/// Per-phase queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QueueStatus {
  /// Jobs in the queued state, including those waiting out a retry delay.
  pub queued: usize,
  /// Queued jobs that are eligible now but not yet claimed by a worker.
  pub pending: usize,
  /// Jobs currently held by a worker.
  pub running: usize,
}

/// A page of job history plus the live pipeline state shown next to it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct JobHistory {
  /// Jobs on this page, newest first.
  pub jobs: Vec<Job>,
  /// Total number of jobs known to the store.
  pub total: usize,
  pub page: usize,
  pub limit: usize,
  pub active_jobs: Vec<Job>,
  pub queue_status: BTreeMap<Phase, QueueStatus>,
  pub pool_config: PoolConfig,
  /// Human readable retention window, e.g. `"7 days"`.
  pub retention: String,
}
