use crate::bulk::{BulkMode, BulkResult};
use crate::config::PoolConfig;
use crate::error::{ExecutionError, PipelineError};
use crate::job::{EnqueueOutcome, EnqueueRequest, ExecutionOutput, JobHistory, JobId, QueueStatus, TargetId, WorkerId};
use crate::phase::Phase;
use crate::retry::PhaseRetryConfig;
use crate::trigger::TriggerConfig;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::oneshot;

pub(crate) type Responder<T> = oneshot::Sender<Result<T, PipelineError>>;

/// Commands sent from the `Scheduler` handle to the central Coordinator task.
///
/// Each command carries a `oneshot::Sender` for the Coordinator to send the
/// response back to the requesting task.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Create a job for one target unless one is already active.
  Enqueue {
    request: EnqueueRequest,
    responder: Responder<EnqueueOutcome>,
  },
  /// Fire every `on_import` phase for a freshly imported entity. Each phase
  /// carries its own result.
  Import {
    target_id: TargetId,
    responder: Responder<Vec<(Phase, Result<EnqueueOutcome, PipelineError>)>>,
  },
  SubmitBulk {
    phase: Phase,
    mode: BulkMode,
    responder: Responder<BulkResult>,
  },
  /// Idempotent: cancelling a finished job succeeds without change.
  CancelJob {
    job_id: JobId,
    responder: Responder<()>,
  },
  RetryDeadLetter {
    job_id: JobId,
    responder: Responder<()>,
  },
  AbandonDeadLetter {
    job_id: JobId,
    responder: Responder<()>,
  },
  /// Replies with the configuration actually applied after clamping.
  UpdatePoolConfig {
    pool: PoolConfig,
    responder: Responder<PoolConfig>,
  },
  UpdateRetryConfigs {
    configs: Vec<PhaseRetryConfig>,
    responder: Responder<()>,
  },
  /// Routed through the coordinator so cron schedules are rebuilt in step.
  UpdateTriggerConfigs {
    configs: Vec<TriggerConfig>,
    responder: Responder<()>,
  },
  GetHistory {
    page: usize,
    limit: usize,
    responder: Responder<JobHistory>,
  },
  GetQueueStatus {
    responder: Responder<BTreeMap<Phase, QueueStatus>>,
  },
}

/// Represents the requested shutdown mode. Sent via a `watch` channel.
/// `None` indicates the scheduler is running normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stop dispatching and wait for running jobs to finish.
  /// Mutating requests are rejected from this point on.
  Graceful,
  /// Signal and abort running executors and stop immediately. Their jobs
  /// stay `running` in the store and are requeued on the next start.
  Force,
}

/// How one execution attempt ended, as observed by the worker.
#[derive(Debug)]
pub(crate) enum AttemptResult {
  Succeeded(ExecutionOutput),
  Failed(ExecutionError),
  /// The executor panicked; the payload message if one could be extracted.
  Panicked(String),
  /// The cancel signal fired before the executor finished.
  Cancelled,
  /// The attempt ran past the phase timeout.
  TimedOut(Duration),
}

/// Message sent from a Worker task back to the Coordinator after a job execution attempt.
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
  pub worker_id: WorkerId,
  pub job_id: JobId,
  pub phase: Phase,
  pub result: AttemptResult,
  pub duration: Duration,
}
