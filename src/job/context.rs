use super::{JobId, TargetId};
use crate::phase::Phase;

/// Contextual information available to a running executor via task-locals.
/// Accessible within a `BoxedExecFn` using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobContext {
  pub job_id: JobId,
  pub phase: Phase,
  pub target_id: TargetId,
  /// 1-based attempt number within the current retry budget.
  pub attempt: u32,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within an executor's scope.
    /// Set by the worker if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing job.
///
/// Returns `None` when called outside an executor run by a phasekeeper worker.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside an
/// executor run by a phasekeeper worker.
///
/// Use `try_get_current_job_context()` for safe, optional access.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}
