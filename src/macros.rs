/// Builds a phase executor closure usable as a [`BoxedExecFn`](crate::job::BoxedExecFn).
///
/// Takes an optional synchronous setup block, a binding for the
/// [`ExecutionRequest`](crate::job::ExecutionRequest), and an async logic
/// block that must evaluate to an [`ExecutionResult`](crate::job::ExecutionResult).
/// The returned future is pinned and boxed.
///
/// # Usage
///
/// ```ignore
/// # use phasekeeper::{executor_fn, ExecutionOutput};
/// # use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// # let counter = Arc::new(AtomicUsize::new(0));
/// // With setup block (runs on every invocation, before the future is built):
/// let exec_1 = executor_fn! {
///     { let runs = counter.clone(); }
///     |request| {
///         runs.fetch_add(1, Ordering::SeqCst);
///         Ok(ExecutionOutput::new().with("target", &request.target_id))
///     }
/// };
///
/// // Without setup block:
/// let exec_2 = executor_fn! {
///     |request| {
///         tracing::info!(target_id = %request.target_id, "thumbnail");
///         Ok(ExecutionOutput::new())
///     }
/// };
/// ```
#[macro_export]
macro_rules! executor_fn {
    // `{ setup } |request| { body }`: setup runs per call, outside the future.
    (
        { $($setup_stmts:stmt);* $(;)? }
        |$request:ident| $main_block:block
    ) => {
        move |$request: $crate::job::ExecutionRequest| {
            $($setup_stmts;)*

            let fut = async move { $main_block };

            Box::pin(fut) as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::ExecutionResult> + Send + 'static>>
        }
    };

    (
        |$request:ident| $main_block:block
    ) => {
        move |$request: $crate::job::ExecutionRequest| {
            let fut = async move { $main_block };

            Box::pin(fut) as std::pin::Pin<Box<dyn std::future::Future<Output = $crate::job::ExecutionResult> + Send + 'static>>
        }
    };
}
