use crate::bulk::{BulkMode, BulkResult, TargetCatalog};
use crate::clock::{Clock, SystemClock};
use crate::command::{CoordinatorCommand, ShutdownMode, WorkerOutcome};
use crate::config::{PhaseSettings, PoolConfig, RetentionPolicy, Settings};
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::dlq::{DeadLetterPage, DeadLetterStatus};
use crate::error::{BuildError, PipelineError, ShutdownError};
use crate::events::{EventPublisher, PipelineEvent};
use crate::job::{
  BoxedExecFn, EnqueueOutcome, EnqueueRequest, ExecutionRequest, ExecutionResult, Job, JobHistory,
  JobId, QueueStatus, TargetId,
};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::phase::Phase;
use crate::retry::{PhaseRetryConfig, RetryConfig};
use crate::store::{JobStore, MemoryStore};
use crate::trigger::TriggerConfig;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_CHANNEL_BOUND: usize = 128; // Commands and worker outcomes
const DEFAULT_EVENT_BUFFER: usize = 1024;
/// Page size used when a caller passes `limit = 0`.
pub const DEFAULT_PAGE_LIMIT: usize = 50;
/// Largest page size served by history and dead-letter queries.
pub const MAX_PAGE_LIMIT: usize = 200;

/// Builder for configuring and creating a [`Scheduler`] instance.
///
/// Every phase starts from its registry defaults; the builder only records
/// overrides. Configuration is validated as a whole in [`SchedulerBuilder::build`].
///
/// # Example
///
/// ```no_run
/// use phasekeeper::{executor_fn, ExecutionOutput, Phase, RetryConfig, Scheduler};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = Scheduler::builder()
///     .executor(Phase::Thumbnail, executor_fn! {
///         |request| {
///             // generate the thumbnail for request.target_id ...
///             Ok(ExecutionOutput::new().with("path", "/thumbs/1.jpg"))
///         }
///     })
///     .workers(Phase::Thumbnail, 4)
///     .retry_config(Phase::Thumbnail, RetryConfig::new(3, 5, 30, 2.0))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  store: Option<Arc<dyn JobStore>>,
  catalog: Option<Arc<dyn TargetCatalog>>,
  clock: Arc<dyn Clock>,
  executors: HashMap<Phase, Arc<BoxedExecFn>>,
  pool: PoolConfig,
  phases: BTreeMap<Phase, PhaseSettings>,
  retention: RetentionPolicy,
  command_buffer_size: usize,
  event_buffer_size: usize,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      store: None,
      catalog: None,
      clock: Arc::new(SystemClock),
      executors: HashMap::new(),
      pool: PoolConfig::default(),
      phases: BTreeMap::new(),
      retention: RetentionPolicy::default(),
      command_buffer_size: DEFAULT_CHANNEL_BOUND,
      event_buffer_size: DEFAULT_EVENT_BUFFER,
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("store", &self.store.as_ref().map(|_| "Arc<dyn JobStore>"))
      .field("catalog", &self.catalog.as_ref().map(|_| "Arc<dyn TargetCatalog>"))
      .field("executors", &self.executors.keys().collect::<Vec<_>>())
      .field("pool", &self.pool)
      .field("phases", &self.phases)
      .field("retention", &self.retention)
      .field("command_buffer_size", &self.command_buffer_size)
      .field("event_buffer_size", &self.event_buffer_size)
      .finish()
  }
}

impl SchedulerBuilder {
  /// Creates a new builder with registry defaults and an in-memory store.
  pub fn new() -> Self {
    Self::default()
  }

  /// Uses `store` for job records and dead-letter entries instead of a fresh [`MemoryStore`].
  /// Active jobs already in the store are recovered when the scheduler starts.
  pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Sets the source of targets for bulk and scheduled submissions.
  pub fn catalog<C: TargetCatalog>(mut self, catalog: C) -> Self {
    self.catalog = Some(Arc::new(catalog));
    self
  }

  /// Replaces the wall clock used for due times, cron fires and retention.
  pub fn clock<C: Clock>(mut self, clock: C) -> Self {
    self.clock = Arc::new(clock);
    self
  }

  /// Registers the executor for `phase`, replacing any earlier one.
  ///
  /// See [`executor_fn!`](crate::executor_fn) for building the closure.
  pub fn executor<F>(mut self, phase: Phase, exec_fn: F) -> Self
  where
    F: Fn(ExecutionRequest) -> Pin<Box<dyn Future<Output = ExecutionResult> + Send + 'static>>
      + Send
      + Sync
      + 'static,
  {
    self
      .executors
      .insert(phase, Arc::new(Box::new(exec_fn) as BoxedExecFn));
    self
  }

  /// Sets every pool size at once. Values are clamped to 1..=10.
  pub fn pool_config(mut self, pool: PoolConfig) -> Self {
    self.pool = pool;
    self
  }

  /// Sets the pool size of one phase. Clamped to 1..=10.
  pub fn workers(mut self, phase: Phase, count: usize) -> Self {
    self.pool.set_workers(phase, count);
    self
  }

  pub fn retry_config(mut self, phase: Phase, config: RetryConfig) -> Self {
    self.phase_settings(phase).retry = config;
    self
  }

  /// Overrides the trigger of the phase named in `config`.
  pub fn trigger(mut self, config: TriggerConfig) -> Self {
    let phase = config.phase;
    self.phase_settings(phase).trigger = config;
    self
  }

  /// Sets the per-attempt run limit of `phase`. `None` disables it.
  pub fn phase_timeout(mut self, phase: Phase, timeout: Option<Duration>) -> Self {
    self.phase_settings(phase).timeout = timeout;
    self
  }

  pub fn retention(mut self, retention: RetentionPolicy) -> Self {
    self.retention = retention;
    self
  }

  /// Sets the size of the internal buffers for commands and worker outcomes.
  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Sets how many events a subscriber may fall behind before it lags.
  pub fn event_buffer_size(mut self, size: usize) -> Self {
    self.event_buffer_size = size.max(1);
    self
  }

  fn phase_settings(&mut self, phase: Phase) -> &mut PhaseSettings {
    self
      .phases
      .entry(phase)
      .or_insert_with(|| PhaseSettings::defaults_for(phase))
  }

  /// Validates the configuration and starts the scheduler.
  ///
  /// This spawns the central Coordinator task, which recovers active jobs
  /// from the store before dispatching.
  ///
  /// # Errors
  ///
  /// - [`BuildError::NoRuntime`] if called outside a Tokio runtime.
  /// - [`BuildError::InvalidConfiguration`] for an invalid retry or trigger override.
  pub fn build(self) -> Result<Scheduler, BuildError> {
    let runtime = Handle::try_current().map_err(|_| BuildError::NoRuntime)?;
    let settings = Arc::new(Settings::new(self.phases, self.pool, self.retention)?);

    for phase in Phase::ALL {
      if !self.executors.contains_key(&phase) {
        warn!(%phase, "No executor registered. Jobs for this phase will fail terminally.");
      }
    }

    // Store, counters and the channels the coordinator listens on.
    let store: Arc<dyn JobStore> = match self.store {
      Some(store) => store,
      None => MemoryStore::arc(),
    };
    let metrics = SchedulerMetrics::new();
    let events = EventPublisher::new(self.event_buffer_size);

    let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(self.command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel::<Option<ShutdownMode>>(None);
    let (worker_outcome_tx, worker_outcome_rx) =
      mpsc::channel::<WorkerOutcome>(self.command_buffer_size);

    let coordinator_state = CoordinatorState::new(
      cmd_rx,
      shutdown_rx,
      worker_outcome_rx,
      worker_outcome_tx,
      store.clone(),
      settings.clone(),
      Arc::new(self.executors),
      self.catalog,
      self.clock,
      events.clone(),
      metrics.clone(),
    );

    let coordinator_handle = runtime.spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
      info!("Pipeline coordinator exited.");
    });

    Ok(Scheduler {
      store,
      settings,
      metrics,
      events,
      cmd_tx,
      shutdown_tx: Arc::new(shutdown_tx),
      coordinator_handle: Arc::new(Mutex::new(Some(coordinator_handle))),
    })
  }
}

/// Handle to a running job pipeline.
///
/// Cheap to clone; every clone talks to the same coordinator. Dropping the
/// last clone starts a graceful shutdown, but an explicit
/// [`Scheduler::shutdown_graceful`] is recommended so running jobs can be awaited.
///
/// Use [`Scheduler::builder()`] to create and configure an instance.
#[derive(Clone)]
pub struct Scheduler {
  store: Arc<dyn JobStore>,
  settings: Arc<Settings>,
  metrics: SchedulerMetrics,
  events: EventPublisher,
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
  shutdown_tx: Arc<watch::Sender<Option<ShutdownMode>>>,
  coordinator_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for Scheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Scheduler")
      .field("settings", &self.settings)
      .field("metrics", &self.metrics)
      .field("shutdown", &*self.shutdown_tx.borrow())
      .finish_non_exhaustive()
  }
}

impl Scheduler {
  /// Returns a builder to configure and create a `Scheduler` instance.
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  /// Sends a command and waits for the coordinator's reply.
  async fn request<T>(
    &self,
    make: impl FnOnce(oneshot::Sender<Result<T, PipelineError>>) -> CoordinatorCommand,
  ) -> Result<T, PipelineError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(make(responder))
      .await
      .map_err(|_| PipelineError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| PipelineError::ResponseFailed)? // Unpack inner Result
  }

  // --- Jobs ---

  /// Creates a queued job for one target.
  ///
  /// Returns [`EnqueueOutcome::AlreadyActive`] with the existing job's ID if
  /// the target already has a queued or running job for the phase.
  ///
  /// # Errors
  ///
  /// - [`PipelineError::SchedulerShutdown`]: Scheduler is shutting down.
  /// - [`PipelineError::Store`]: The store rejected the insert.
  pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, PipelineError> {
    self
      .request(|responder| CoordinatorCommand::Enqueue { request, responder })
      .await
  }

  /// Fires the `on_import` triggers for a newly imported entity.
  ///
  /// Returns one entry per `on_import` phase. A phase the store rejects
  /// carries its error without undoing the phases that were enqueued.
  ///
  /// # Errors
  ///
  /// - [`PipelineError::SchedulerShutdown`]: Scheduler is shutting down.
  pub async fn import(
    &self,
    target_id: impl Into<TargetId>,
  ) -> Result<Vec<(Phase, Result<EnqueueOutcome, PipelineError>)>, PipelineError> {
    let target_id = target_id.into();
    self
      .request(|responder| CoordinatorCommand::Import {
        target_id,
        responder,
      })
      .await
  }

  /// Enqueues `phase` for every target listed by the catalog.
  ///
  /// In [`BulkMode::Missing`] targets that already completed the phase are
  /// skipped. Targets with an active job are always skipped.
  ///
  /// The catalog is listed on a blocking thread, so a slow listing does not
  /// hold up dispatch or other requests.
  ///
  /// # Errors
  ///
  /// - [`PipelineError::NoTargetCatalog`]: No catalog was configured.
  /// - [`PipelineError::Catalog`]: The catalog could not list targets.
  pub async fn submit_bulk(&self, phase: Phase, mode: BulkMode) -> Result<BulkResult, PipelineError> {
    self
      .request(|responder| CoordinatorCommand::SubmitBulk {
        phase,
        mode,
        responder,
      })
      .await
  }

  /// Cancels a queued or running job.
  ///
  /// A queued job is removed from dispatch and never runs. A running job is
  /// marked cancelled and its executor signalled. Cancelling a finished job
  /// succeeds without change.
  ///
  /// # Errors
  ///
  /// - [`PipelineError::JobNotFound`]: No job with the given ID exists.
  /// - [`PipelineError::ConcurrencyConflict`]: The job changed state mid-request.
  pub async fn cancel_job(&self, job_id: JobId) -> Result<(), PipelineError> {
    self
      .request(|responder| CoordinatorCommand::CancelJob { job_id, responder })
      .await
  }

  /// Reads one job straight from the store.
  pub async fn get_job(&self, job_id: JobId) -> Result<Job, PipelineError> {
    self
      .store
      .get(job_id)?
      .ok_or(PipelineError::JobNotFound(job_id))
  }

  /// One page of job history (newest first) with the live pipeline state.
  /// `page` is 1-based; `limit = 0` means [`DEFAULT_PAGE_LIMIT`].
  pub async fn job_history(&self, page: usize, limit: usize) -> Result<JobHistory, PipelineError> {
    let (page, limit) = normalize_page(page, limit);
    self
      .request(|responder| CoordinatorCommand::GetHistory {
        page,
        limit,
        responder,
      })
      .await
  }

  pub async fn queue_status(&self) -> Result<BTreeMap<Phase, QueueStatus>, PipelineError> {
    self
      .request(|responder| CoordinatorCommand::GetQueueStatus { responder })
      .await
  }

  // --- Dead-Letter Queue ---

  /// One page of dead-letter entries (newest first), optionally filtered by
  /// status. The counts always cover every entry.
  pub async fn list_dead_letters(
    &self,
    page: usize,
    limit: usize,
    status: Option<DeadLetterStatus>,
  ) -> Result<DeadLetterPage, PipelineError> {
    let (page, limit) = normalize_page(page, limit);
    Ok(self.store.list_dead_letters(page, limit, status)?)
  }

  /// Re-enqueues a dead-lettered job with a fresh retry budget.
  ///
  /// # Errors
  ///
  /// - [`PipelineError::DeadLetterNotFound`]: No entry for the job.
  /// - [`PipelineError::InvalidStateTransition`]: The entry is not `pending_review`.
  /// - [`PipelineError::DuplicateActiveJob`]: Another job is active for the same
  ///   target and phase; the entry stays `pending_review`.
  pub async fn retry_dead_letter(&self, job_id: JobId) -> Result<(), PipelineError> {
    self
      .request(|responder| CoordinatorCommand::RetryDeadLetter { job_id, responder })
      .await
  }

  /// Marks a dead-letter entry as abandoned. Abandoned entries are final.
  ///
  /// # Errors
  ///
  /// - [`PipelineError::DeadLetterNotFound`]: No entry for the job.
  /// - [`PipelineError::InvalidStateTransition`]: The entry is not `pending_review`.
  pub async fn abandon_dead_letter(&self, job_id: JobId) -> Result<(), PipelineError> {
    self
      .request(|responder| CoordinatorCommand::AbandonDeadLetter { job_id, responder })
      .await
  }

  // --- Configuration ---

  pub fn pool_config(&self) -> PoolConfig {
    self.settings.pool()
  }

  /// Resizes the phase pools. Running jobs are unaffected; the new sizes
  /// apply to subsequent dispatches. Returns the clamped configuration.
  pub async fn update_pool_config(&self, pool: PoolConfig) -> Result<PoolConfig, PipelineError> {
    self
      .request(|responder| CoordinatorCommand::UpdatePoolConfig { pool, responder })
      .await
  }

  pub fn retry_configs(&self) -> Vec<PhaseRetryConfig> {
    self.settings.retry_configs()
  }

  /// Replaces the retry configuration of the listed phases. The whole list
  /// is rejected if any entry is invalid.
  pub async fn update_retry_configs(&self, configs: Vec<PhaseRetryConfig>) -> Result<(), PipelineError> {
    self
      .request(|responder| CoordinatorCommand::UpdateRetryConfigs { configs, responder })
      .await
  }

  pub fn trigger_configs(&self) -> Vec<TriggerConfig> {
    self.settings.trigger_configs()
  }

  /// Replaces the triggers of the listed phases. Records are normalized and
  /// the merged dependency graph is checked for cycles before anything is applied.
  pub async fn update_trigger_configs(&self, configs: Vec<TriggerConfig>) -> Result<(), PipelineError> {
    self
      .request(|responder| CoordinatorCommand::UpdateTriggerConfigs { configs, responder })
      .await
  }

  // --- Observability ---

  /// Subscribes to job events published from now on.
  pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
    self.events.subscribe()
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  // --- Shutdown ---

  /// Stops the pipeline after running attempts report back.
  ///
  /// The coordinator stops dispatching, rejects new submissions, and waits
  /// for running jobs to report back. Waits for the coordinator to finish
  /// or until the optional timeout elapses.
  ///
  /// # Errors
  ///
  /// Returns [`ShutdownError::AlreadyShuttingDown`] when this mode was already
  /// requested or a forced stop is underway, [`ShutdownError::Timeout`] when the
  /// coordinator outlives `timeout`, and [`ShutdownError::TaskPanic`] if it panicked.
  pub async fn shutdown_graceful(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!(mode = "graceful", "Pipeline shutdown requested.");
    self.signal_shutdown(ShutdownMode::Graceful)?;
    self.await_shutdown(timeout).await
  }

  /// Stops the pipeline without waiting for running attempts.
  ///
  /// Running executors are signalled and aborted. Their jobs stay `running`
  /// in the store and are requeued when a scheduler starts on the same store.
  ///
  /// # Errors
  ///
  /// Same as [`Scheduler::shutdown_graceful`].
  pub async fn shutdown_force(&self, timeout: Option<Duration>) -> Result<(), ShutdownError> {
    info!(mode = "force", "Pipeline shutdown requested.");
    self.signal_shutdown(ShutdownMode::Force)?;
    self.await_shutdown(timeout).await
  }

  fn signal_shutdown(&self, mode: ShutdownMode) -> Result<(), ShutdownError> {
    let current = *self.shutdown_tx.borrow();
    if current == Some(mode) || current == Some(ShutdownMode::Force) {
      return Err(ShutdownError::AlreadyShuttingDown);
    }
    self
      .shutdown_tx
      .send(Some(mode))
      .map_err(|_| ShutdownError::SignalFailed)
  }

  async fn await_shutdown(&self, timeout_duration: Option<Duration>) -> Result<(), ShutdownError> {
    let mut guard = self.coordinator_handle.lock().await;
    let Some(handle) = guard.as_mut() else {
      debug!("Coordinator already joined.");
      return Ok(());
    };

    let joined = match timeout_duration {
      Some(timeout) => match tokio::time::timeout(timeout, handle).await {
        Ok(joined) => joined,
        Err(_) => {
          // The handle stays in place so a later call can keep waiting.
          error!(?timeout, "Coordinator still running when the shutdown wait expired.");
          return Err(ShutdownError::Timeout);
        }
      },
      None => handle.await,
    };
    guard.take();

    match joined {
      Ok(()) => {
        info!("Pipeline stopped.");
        Ok(())
      }
      Err(e) => {
        error!(error = ?e, "Pipeline coordinator panicked.");
        Err(ShutdownError::TaskPanic)
      }
    }
  }
}

fn normalize_page(page: usize, limit: usize) -> (usize, usize) {
  let limit = if limit == 0 { DEFAULT_PAGE_LIMIT } else { limit.min(MAX_PAGE_LIMIT) };
  (page.max(1), limit)
}
