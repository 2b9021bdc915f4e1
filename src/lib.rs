//! PhaseKeeper: A Multi-Phase Background Job Pipeline
//!
//! Runs the background processing of a media library: every imported entity
//! (a scene, a file) passes through a set of phases such as metadata
//! extraction, thumbnail generation or fingerprinting. Each phase has its own
//! worker pool, retry policy, trigger and timeout.
//!
//! # Features
//!
//! - One bounded worker pool per [`Phase`], resizable at runtime (1 to 10 workers).
//! - At most one queued or running job per (target, phase); duplicate
//!   submissions return the existing job.
//! - Exponential retry backoff per phase (`min(initial * factor^n, max)`), with
//!   delayed jobs kept out of worker slots until they are eligible.
//! - A dead-letter queue for jobs that exhausted their retries or failed
//!   terminally, with review, retry (fresh budget) and abandon.
//! - Triggers:
//!   - `on_import`: fires when an entity is imported ([`Scheduler::import`]).
//!   - `after_job`: fires when another phase completes for the same target.
//!   - `scheduled`: 5-field CRON expressions (UTC) running a bulk submission.
//!   - `manual`: only through [`Scheduler::enqueue`] or [`Scheduler::submit_bulk`].
//! - Bulk submission over a [`TargetCatalog`] in `missing` or `all` mode.
//! - Cooperative cancellation and per-phase run timeouts.
//! - Event stream ([`PipelineEvent`]) and metrics snapshots ([`MetricsSnapshot`]).
//! - Retention purge of finished jobs and startup recovery from a [`JobStore`].
//! - Graceful drain or forced stop, each with an optional wait limit.
//! - Optional task-local job context (`JobContext`) for executors (requires `job_context` feature).
//! - Optional Serde support for public types (requires `serde` feature).
//!
//! # Usage
//!
//! ```no_run
//! use phasekeeper::{
//!     executor_fn, BulkMode, CatalogError, EnqueueRequest, ExecutionError, ExecutionOutput, Phase,
//!     Scheduler, TargetId,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // tracing_subscriber::fmt().with_env_filter("warn,phasekeeper=info").init();
//!
//!     let scheduler = Scheduler::builder()
//!         .catalog(|_phase: Phase| -> Result<Vec<TargetId>, CatalogError> {
//!             Ok(vec![TargetId::from("scene-1"), TargetId::from("scene-2")])
//!         })
//!         .executor(Phase::Metadata, executor_fn! {
//!             |request| {
//!                 // probe request.target_id ...
//!                 Ok(ExecutionOutput::new().with("duration_secs", 1312))
//!             }
//!         })
//!         .executor(Phase::Thumbnail, executor_fn! {
//!             |request| {
//!                 if request.params.contains_key("corrupt") {
//!                     return Err(ExecutionError::terminal("unreadable source"));
//!                 }
//!                 request.progress.report(50);
//!                 Ok(ExecutionOutput::new().with("path", format!("/thumbs/{}.jpg", request.target_id)))
//!             }
//!         })
//!         .workers(Phase::Thumbnail, 4)
//!         .build()?;
//!
//!     let mut events = scheduler.subscribe();
//!
//!     // Metadata runs on import; thumbnails follow once metadata completes.
//!     scheduler.import("scene-1").await?;
//!
//!     // Manual and bulk submissions.
//!     scheduler.enqueue(EnqueueRequest::new(Phase::Thumbnail, "scene-2")).await?;
//!     let result = scheduler.submit_bulk(Phase::Thumbnail, BulkMode::Missing).await?;
//!     println!("bulk: {:?}", result);
//!
//!     if let Ok(event) = events.recv().await {
//!         println!("{} for {}", event.name(), event.target_id);
//!     }
//!
//!     println!("{:#?}", scheduler.metrics_snapshot());
//!     scheduler.shutdown_graceful(Some(Duration::from_secs(10))).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] to configure the scheduler. Every phase starts
//! from the defaults of its [`Phase`] entry; the builder overrides:
//! - `executor`: the async function run for each job of a phase.
//! - `workers` / `pool_config`: pool sizes.
//! - `retry_config`, `trigger`, `phase_timeout`: per-phase policies.
//! - `store`, `catalog`, `retention`: persistence, bulk targets and purge window.
//! - `clock`: the wall clock behind due times and cron fires ([`ManualClock`] in tests).
//! - `command_buffer_size`, `event_buffer_size`: internal channel capacities.
//!
//! Pool, retry and trigger settings can also be changed on a running
//! scheduler. Updates are validated completely before anything is applied.
//!
//! # Job Lifecycle & State
//!
//! - A job starts `queued`, is claimed by a worker (`running`), and ends
//!   `completed`, `failed`, `timed_out` or `cancelled`.
//! - A failed attempt is requeued with a backoff delay while retries remain;
//!   afterwards the job is recorded in the dead-letter queue.
//! - Executors return [`ExecutionError::Transient`] to consume a retry or
//!   [`ExecutionError::Terminal`] to skip straight to the dead-letter queue.
//!   Panics count as transient failures.
//!
//! # Observability
//!
//! - Retrieve metrics snapshots using [`Scheduler::metrics_snapshot`]. See [`MetricsSnapshot`].
//! - Page through jobs with [`Scheduler::job_history`] and dead letters with
//!   [`Scheduler::list_dead_letters`].
//! - Subscribe to [`PipelineEvent`]s with [`Scheduler::subscribe`].
//! - Coordinator and attempt activity is logged through `tracing` spans.

#[cfg(all(doc, feature = "job_context"))]
pub mod job_context_docs {
  //! # Reading the running attempt (`job_context` feature)
  //!
  //! Every attempt is awaited inside a task-local scope carrying its
  //! [`JobContext`](crate::JobContext): job ID, phase, target and attempt number.
  //! Code deep inside an executor can read it without threading the request through.
  //!
  //! [`try_get_current_job_context`](crate::try_get_current_job_context) returns
  //! `None` outside an attempt. [`job_context!`](crate::job_context) panics there
  //! instead, so reserve it for code that only ever runs as part of an executor.
  //!
  //! ```no_run
  //! # #[cfg(feature = "job_context")] {
  //! use phasekeeper::{executor_fn, job_context, try_get_current_job_context, ExecutionOutput};
  //!
  //! let exec = executor_fn! {
  //!   |request| {
  //!     if let Some(ctx) = try_get_current_job_context() {
  //!       tracing::debug!(target_id = %ctx.target_id, attempt = ctx.attempt, "rendering");
  //!     }
  //!     let ctx = job_context!();
  //!     Ok(ExecutionOutput::new().with("phase", ctx.phase))
  //!   }
  //! };
  //! # }
  //! ```
}

pub mod bulk;
pub mod clock;
pub mod command;
pub mod config;
mod coordinator;
pub mod dlq;
pub mod error;
pub mod events;
pub mod job;
mod macros;
pub mod metrics;
pub mod phase;
mod queue;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod trigger;
mod worker;

// Scheduler handle and its settings
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use command::ShutdownMode;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{PhaseSettings, PoolConfig, RetentionPolicy};
pub use phase::Phase;

// Error types
pub use error::{
  BuildError, CatalogError, ConfigError, ExecutionError, PipelineError, ShutdownError, StoreError,
};

// Job related types
pub use job::{
  BoxedExecFn, CancelSignal, EnqueueOutcome, EnqueueRequest, ExecutionOutput, ExecutionRequest,
  ExecutionResult, Job, JobHistory, JobId, JobStatus, Params, ProgressReporter, QueueStatus,
  TargetId,
};
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

// Policies, triggers and bulk submission
pub use bulk::{BulkMode, BulkResult, TargetCatalog};
pub use retry::{PhaseRetryConfig, RetryConfig};
pub use trigger::{CronExpression, TriggerConfig, TriggerType};

// Dead-letter queue and storage
pub use dlq::{DeadLetterCounts, DeadLetterEntry, DeadLetterPage, DeadLetterStatus};
pub use store::{InsertOutcome, JobStore, MemoryStore};

// Events and metrics
pub use events::{EventKind, PipelineEvent};
pub use metrics::MetricsSnapshot;
