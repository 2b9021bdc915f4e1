use crate::command::{AttemptResult, WorkerOutcome};
use crate::error::ExecutionError;
use crate::job::{BoxedExecFn, CancelSignal, ExecutionRequest, Job, ProgressReporter, WorkerId};
use crate::metrics::SchedulerMetrics;
use crate::store::JobStore;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn, Instrument};

/// Runs one claimed attempt of a job and reports how it ended.
///
/// Spawned by the Coordinator once per dispatch. The executor future runs in
/// its own task so a panic surfaces as a `JoinError` instead of tearing down
/// the worker. The worker stops waiting as soon as the job's cancel signal
/// fires or the phase timeout elapses; an executor that ignores the signal
/// keeps running detached and its result is dropped.
pub(crate) struct Worker {
  id: WorkerId,
  job: Job,
  exec_fn: Option<Arc<BoxedExecFn>>,
  store: Arc<dyn JobStore>,
  timeout: Option<Duration>,
  cancel_tx: Arc<watch::Sender<bool>>,
  metrics: SchedulerMetrics,
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
}

impl Worker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: WorkerId,
    job: Job,
    exec_fn: Option<Arc<BoxedExecFn>>,
    store: Arc<dyn JobStore>,
    timeout: Option<Duration>,
    cancel_tx: Arc<watch::Sender<bool>>,
    metrics: SchedulerMetrics,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  ) -> Self {
    Self {
      id,
      job,
      exec_fn,
      store,
      timeout,
      cancel_tx,
      metrics,
      worker_outcome_tx,
    }
  }

  pub async fn run(self) {
    let job_span = tracing::span!(
      tracing::Level::INFO,
      "job_exec",
      worker_id = self.id,
      job_id = %self.job.id,
      phase = %self.job.phase,
      target_id = %self.job.target_id,
      attempt = self.job.attempt()
    );
    self.execute_and_report().instrument(job_span).await;
  }

  async fn execute_and_report(self) {
    info!("Starting job execution.");
    let start_time = Instant::now();
    let result = self.execute().await;
    let duration = start_time.elapsed();
    self.metrics.job_execution_duration.record(duration);

    let outcome_str = match &result {
      AttemptResult::Succeeded(_) => "Success",
      AttemptResult::Failed(e) if e.is_terminal() => "TerminalFailure",
      AttemptResult::Failed(_) => "Failure",
      AttemptResult::Panicked(_) => "Panic",
      AttemptResult::Cancelled => "Cancelled",
      AttemptResult::TimedOut(_) => "TimedOut",
    };
    info!(
      duration_ms = duration.as_millis(),
      outcome = outcome_str,
      "Finished job execution."
    );

    let outcome = WorkerOutcome {
      worker_id: self.id,
      job_id: self.job.id,
      phase: self.job.phase,
      result,
      duration,
    };
    if self.worker_outcome_tx.send(outcome).await.is_err() {
      // Coordinator already gone; the job stays `running` and is recovered on restart.
      warn!("Failed to send job outcome to coordinator (scheduler likely shutdown).");
    }
  }

  async fn execute(&self) -> AttemptResult {
    let Some(exec_fn) = self.exec_fn.clone() else {
      error!("No executor registered for phase.");
      return AttemptResult::Failed(ExecutionError::terminal(format!(
        "no executor registered for phase `{}`",
        self.job.phase
      )));
    };

    let request = ExecutionRequest {
      job_id: self.job.id,
      phase: self.job.phase,
      target_id: self.job.target_id.clone(),
      attempt: self.job.attempt(),
      params: self.job.params.clone(),
      cancel: CancelSignal::new(self.cancel_tx.subscribe()),
      progress: ProgressReporter::new(self.job.id, self.store.clone()),
    };
    let future_to_run = exec_fn(request);

    #[cfg(feature = "job_context")]
    let mut task = {
      let context = JobContext {
        job_id: self.job.id,
        phase: self.job.phase,
        target_id: self.job.target_id.clone(),
        attempt: self.job.attempt(),
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, future_to_run))
    };
    #[cfg(not(feature = "job_context"))]
    let mut task = tokio::spawn(future_to_run);

    let mut cancel = CancelSignal::new(self.cancel_tx.subscribe());
    let deadline = async {
      match self.timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending::<()>().await,
      }
    };

    tokio::select! {
      biased;

      joined = &mut task => match joined {
        Ok(Ok(output)) => AttemptResult::Succeeded(output),
        Ok(Err(e)) => {
          warn!(error = %e, terminal = e.is_terminal(), "Executor reported failure.");
          AttemptResult::Failed(e)
        }
        Err(join_error) if join_error.is_panic() => {
          let message = panic_message(join_error.into_panic());
          error!(panic = %message, "Executor panicked!");
          AttemptResult::Panicked(message)
        }
        Err(join_error) => {
          warn!(error = %join_error, "Executor task was aborted.");
          AttemptResult::Cancelled
        }
      },

      _ = cancel.cancelled() => {
        debug!("Cancel signal received, detaching executor.");
        AttemptResult::Cancelled
      }

      _ = deadline => {
        let limit = self.timeout.unwrap_or_default();
        warn!(timeout_secs = limit.as_secs_f64(), "Attempt exceeded phase timeout, signalling executor.");
        self.cancel_tx.send_replace(true);
        AttemptResult::TimedOut(limit)
      }
    }
  }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "executor panicked".to_string()
  }
}
