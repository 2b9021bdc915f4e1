use crate::job::{JobId, Params, TargetId};
use crate::phase::Phase;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EventKind {
  /// Phase-specific completion, published as `{phase}_complete` with the executor's payload.
  PhaseComplete,
  Completed,
  /// A failed attempt was requeued with a delay.
  RetryScheduled,
  /// The job exhausted its retries (or failed terminally) and was dead-lettered.
  Failed,
  Cancelled,
  /// An attempt exceeded the phase timeout.
  TimedOut,
}

/// A status change pushed to subscribers of [`Scheduler::subscribe`](crate::Scheduler::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PipelineEvent {
  pub kind: EventKind,
  pub phase: Phase,
  pub job_id: JobId,
  pub target_id: TargetId,
  /// Executor output for completion events; retry details for `retry_scheduled`.
  pub payload: Params,
  pub error: Option<String>,
  pub at: DateTime<Utc>,
}

impl PipelineEvent {
  pub(crate) fn new(kind: EventKind, phase: Phase, job_id: JobId, target_id: TargetId) -> Self {
    Self {
      kind,
      phase,
      job_id,
      target_id,
      payload: Params::new(),
      error: None,
      at: Utc::now(),
    }
  }

  pub(crate) fn with_payload(mut self, payload: Params) -> Self {
    self.payload = payload;
    self
  }

  pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
    self.error = Some(error.into());
    self
  }

  /// Wire name of the event, e.g. `thumbnail_complete` or `retry_scheduled`.
  pub fn name(&self) -> String {
    match self.kind {
      EventKind::PhaseComplete => self.phase.completion_event(),
      EventKind::Completed => "completed".to_string(),
      EventKind::RetryScheduled => "retry_scheduled".to_string(),
      EventKind::Failed => "failed".to_string(),
      EventKind::Cancelled => "cancelled".to_string(),
      EventKind::TimedOut => "timed_out".to_string(),
    }
  }
}

/// Fan-out of pipeline events. Publishing never blocks; slow subscribers
/// observe `RecvError::Lagged` and skip ahead.
#[derive(Debug, Clone)]
pub(crate) struct EventPublisher {
  tx: broadcast::Sender<PipelineEvent>,
}

impl EventPublisher {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity.max(1));
    Self { tx }
  }

  pub fn publish(&self, event: PipelineEvent) {
    let name = event.name();
    // An error only means nobody is listening.
    if self.tx.send(event).is_err() {
      trace!(event = %name, "No subscribers for event.");
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
    self.tx.subscribe()
  }
}
