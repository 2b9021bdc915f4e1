use crate::dlq::DeadLetterStatus;
use crate::job::{JobId, JobStatus, TargetId};
use crate::phase::Phase;

use thiserror::Error;

/// Errors that can occur while building a scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BuildError {
  #[error("Scheduler must be built from within a Tokio runtime")]
  NoRuntime,
  #[error("Invalid scheduler configuration: {0}")]
  InvalidConfiguration(#[from] ConfigError),
}

/// Malformed retry, trigger or pool configuration. Rejected at write time and
/// never persisted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
  #[error("Unknown phase `{0}`")]
  UnknownPhase(String),
  #[error("Unknown trigger type `{0}`")]
  UnknownTriggerType(String),
  #[error("Unknown bulk mode `{0}`")]
  UnknownBulkMode(String),
  #[error("Phase `{phase}`: {field} = {value} is outside the accepted range {min}..={max}")]
  OutOfRange {
    phase: Phase,
    field: &'static str,
    value: String,
    min: String,
    max: String,
  },
  #[error("Phase `{phase}`: initial_delay_seconds ({initial}) exceeds max_delay_seconds ({max})")]
  InitialDelayExceedsMax { phase: Phase, initial: u64, max: u64 },
  #[error("Phase `{0}`: after_job trigger requires after_phase")]
  MissingAfterPhase(Phase),
  #[error("Phase `{0}`: after_job trigger cannot depend on itself")]
  SelfDependency(Phase),
  #[error("Phase `{0}`: after_job triggers form a dependency cycle")]
  DependencyCycle(Phase),
  #[error("Phase `{0}`: scheduled trigger requires cron_expression")]
  MissingCronExpression(Phase),
  #[error("Phase `{phase}`: invalid cron expression `{expression}`: {reason}")]
  InvalidCron {
    phase: Phase,
    expression: String,
    reason: String,
  },
  #[error("Phase `{0}` does not act on a single entity and cannot use the on_import trigger")]
  ImportTriggerUnsupported(Phase),
  #[error("Phase `{0}` appears more than once in the update")]
  DuplicatePhase(Phase),
}

/// Failure reported by a phase executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
  /// Eligible for retry under the phase's retry policy.
  #[error("{0}")]
  Transient(String),
  /// Not worth retrying (e.g. corrupt input); the job goes straight to the dead-letter queue.
  #[error("{0}")]
  Terminal(String),
}

impl ExecutionError {
  pub fn transient(message: impl Into<String>) -> Self {
    ExecutionError::Transient(message.into())
  }

  pub fn terminal(message: impl Into<String>) -> Self {
    ExecutionError::Terminal(message.into())
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, ExecutionError::Terminal(_))
  }
}

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  #[error("Job {0} not found")]
  NotFound(JobId),
  #[error("Job {job_id} is {actual}, not in an expected state")]
  StatusMismatch { job_id: JobId, actual: JobStatus },
  #[error("Target `{target_id}` already has active {phase} job {existing}")]
  DuplicateActive {
    target_id: TargetId,
    phase: Phase,
    existing: JobId,
  },
  #[error("No dead-letter entry for job {0}")]
  DeadLetterNotFound(JobId),
  #[error("Dead-letter entry for job {job_id} is {actual}, not in an expected state")]
  DeadLetterStatusMismatch {
    job_id: JobId,
    actual: DeadLetterStatus,
  },
  #[error("Store backend error: {0}")]
  Backend(String),
}

/// Errors raised by a [`TargetCatalog`](crate::bulk::TargetCatalog) while listing targets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Target catalog error: {0}")]
pub struct CatalogError(pub String);

// --- Pipeline Errors ---

/// Errors returned by [`Scheduler`](crate::Scheduler) operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
  #[error("Scheduler command channel is closed (likely shut down or panicked).")]
  SchedulerShutdown,
  #[error("Scheduler did not respond to the request (Coordinator task may have panicked or shutdown unexpectedly).")]
  ResponseFailed,
  #[error("Job {0} not found.")]
  JobNotFound(JobId),
  #[error("No dead-letter entry for job {0}.")]
  DeadLetterNotFound(JobId),
  #[error("Invalid configuration: {0}")]
  InvalidConfiguration(#[from] ConfigError),
  #[error("Cannot move {entity} {id} from `{from}` to `{to}`.")]
  InvalidStateTransition {
    entity: &'static str,
    id: JobId,
    from: String,
    to: String,
  },
  #[error("Job {0} changed state concurrently; request not applied.")]
  ConcurrencyConflict(JobId),
  #[error("Target `{target_id}` already has active {phase} job {existing}.")]
  DuplicateActiveJob {
    target_id: TargetId,
    phase: Phase,
    existing: JobId,
  },
  #[error("Bulk submission requires a target catalog, but none was configured.")]
  NoTargetCatalog,
  #[error(transparent)]
  Catalog(#[from] CatalogError),
  #[error(transparent)]
  Store(StoreError),
}

impl From<StoreError> for PipelineError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::NotFound(job_id) => PipelineError::JobNotFound(job_id),
      StoreError::StatusMismatch { job_id, .. } => PipelineError::ConcurrencyConflict(job_id),
      StoreError::DuplicateActive {
        target_id,
        phase,
        existing,
      } => PipelineError::DuplicateActiveJob {
        target_id,
        phase,
        existing,
      },
      StoreError::DeadLetterNotFound(job_id) => PipelineError::DeadLetterNotFound(job_id),
      other => PipelineError::Store(other),
    }
  }
}

// --- Shutdown Errors ---

/// Errors related to the scheduler shutdown process (`shutdown_graceful`, `shutdown_force`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Failed to send shutdown signal (scheduler already shut down or watch channel error).")]
  SignalFailed,
  #[error("Timed out waiting for the coordinator and its workers to complete shutdown.")]
  Timeout,
  #[error("The coordinator task panicked during the shutdown process.")]
  TaskPanic,
  #[error("Shutdown already in progress or completed.")]
  AlreadyShuttingDown,
}
