use crate::bulk::{BulkMode, BulkResult, TargetCatalog};
use crate::clock::Clock;
use crate::command::{AttemptResult, CoordinatorCommand, Responder, ShutdownMode, WorkerOutcome};
use crate::config::Settings;
use crate::dlq::DeadLetterStatus;
use crate::error::{CatalogError, ExecutionError, PipelineError, StoreError};
use crate::events::{EventKind, EventPublisher, PipelineEvent};
use crate::job::{
  BoxedExecFn, EnqueueOutcome, EnqueueRequest, ExecutionOutput, Job, JobHistory, JobId, JobStatus,
  Params, QueueStatus, TargetId, WorkerId,
};
use crate::metrics::SchedulerMetrics;
use crate::phase::Phase;
use crate::queue::DelayQueue;
use crate::retry::RetryDecision;
use crate::store::{InsertOutcome, JobStore};
use crate::trigger::CronExpression;
use crate::worker::Worker;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// Longest the loop sleeps without re-checking queues, cron and retention.
const MAX_IDLE_SLEEP: Duration = Duration::from_secs(60);
/// Poll interval while waiting for running jobs during a graceful shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
/// Back-off before re-trying a claim that failed on a store error.
const STORE_ERROR_BACKOFF_SECS: i64 = 5;

/// Channels and shared state handed to the Coordinator by the builder.
pub(crate) struct CoordinatorState {
  // Receivers
  cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
  worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
  // Cloned into every worker
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  // Shared
  store: Arc<dyn JobStore>,
  settings: Arc<Settings>,
  executors: Arc<HashMap<Phase, Arc<BoxedExecFn>>>,
  catalog: Option<Arc<dyn TargetCatalog>>,
  clock: Arc<dyn Clock>,
  events: EventPublisher,
  metrics: SchedulerMetrics,
}

impl CoordinatorState {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    cmd_rx: mpsc::Receiver<CoordinatorCommand>,
    shutdown_rx: watch::Receiver<Option<ShutdownMode>>,
    worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
    store: Arc<dyn JobStore>,
    settings: Arc<Settings>,
    executors: Arc<HashMap<Phase, Arc<BoxedExecFn>>>,
    catalog: Option<Arc<dyn TargetCatalog>>,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
    metrics: SchedulerMetrics,
  ) -> Self {
    Self {
      cmd_rx,
      shutdown_rx,
      worker_outcome_rx,
      worker_outcome_tx,
      store,
      settings,
      executors,
      catalog,
      clock,
      events,
      metrics,
    }
  }
}

type ImportOutcome = (Phase, Result<EnqueueOutcome, PipelineError>);

/// Targets of a bulk submission, listed on a blocking thread.
struct CatalogListing {
  phase: Phase,
  mode: BulkMode,
  targets: Result<Vec<TargetId>, CatalogError>,
  // `None` for scheduled triggers.
  responder: Option<Responder<BulkResult>>,
}

/// A dispatched attempt the coordinator is waiting on.
struct RunningJob {
  worker_id: WorkerId,
  cancel_tx: Arc<watch::Sender<bool>>,
  handle: JoinHandle<()>,
}

/// Dispatch state of one phase: queued job IDs by eligible time, plus the
/// attempts currently held by workers.
struct PhasePool {
  queue: DelayQueue<JobId>,
  running: HashMap<JobId, RunningJob>,
}

impl PhasePool {
  fn new() -> Self {
    Self {
      queue: DelayQueue::new(),
      running: HashMap::new(),
    }
  }
}

/// The central Coordinator task.
///
/// Owns every phase queue and the cron schedule, and is the only writer of
/// job state transitions apart from progress updates. Workers report back
/// through the outcome channel; the handle talks to it through commands.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  pools: BTreeMap<Phase, PhasePool>,
  cron: DelayQueue<Phase>,
  schedules: HashMap<Phase, CronExpression>,
  next_worker_id: WorkerId,
  next_purge: DateTime<Utc>,
  // Catalog listings finished off-loop, waiting to be enqueued.
  listing_tx: mpsc::UnboundedSender<CatalogListing>,
  listing_rx: mpsc::UnboundedReceiver<CatalogListing>,
  commands_closed: bool,
  shutting_down: Option<ShutdownMode>,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    let pools = Phase::ALL
      .iter()
      .map(|phase| (*phase, PhasePool::new()))
      .collect();
    let next_purge = state.clock.now();
    let (listing_tx, listing_rx) = mpsc::unbounded_channel();
    Self {
      state,
      pools,
      cron: DelayQueue::new(),
      schedules: HashMap::new(),
      next_worker_id: 0,
      next_purge,
      listing_tx,
      listing_rx,
      commands_closed: false,
      shutting_down: None,
    }
  }

  /// Runs the main event loop for the Coordinator.
  pub async fn run(&mut self) {
    info!("Coordinator started.");
    let started = self.state.clock.now();
    self.recover(started);
    self.rebuild_cron_schedule(started);

    loop {
      if self.shutting_down.is_none() {
        let now = self.state.clock.now();
        self.fire_due_cron(now);
        self.dispatch_ready(now);
        self.purge_if_due(now);
      }
      self.update_gauge_metrics();

      // --- Graceful shutdown completes once every worker reported back ---
      if self.shutting_down == Some(ShutdownMode::Graceful) {
        let running = self.running_count();
        if running == 0 {
          info!("Graceful shutdown: no jobs running. Coordinator exiting.");
          break;
        }
        trace!(running, "Graceful shutdown: waiting for running jobs.");
      }

      let sleep_duration = self.calculate_sleep();

      tokio::select! {
        biased;

        Ok(()) = self.state.shutdown_rx.changed() => {
          let requested = *self.state.shutdown_rx.borrow();
          if requested.is_some() && requested != self.shutting_down {
            info!(mode = ?requested, "Coordinator received shutdown signal.");
            self.shutting_down = requested;
            if requested == Some(ShutdownMode::Force) {
              self.abort_workers().await;
              info!("Forced shutdown: abandoning queues and aborting attempts.");
              break;
            }
          }
        },

        // Outcomes are handled during a graceful shutdown so the jobs land
        // in a consistent state.
        Some(outcome) = self.state.worker_outcome_rx.recv() => {
          trace!(job_id = %outcome.job_id, "Received worker outcome.");
          self.handle_worker_outcome(outcome);
        },

        Some(listing) = self.listing_rx.recv() => {
          self.finish_bulk(listing);
        },

        maybe_cmd = self.state.cmd_rx.recv(), if !self.commands_closed => {
          match maybe_cmd {
            Some(cmd) => self.handle_command(cmd),
            None => {
              // Every scheduler handle was dropped.
              self.commands_closed = true;
              if self.shutting_down.is_none() {
                warn!("Command channel closed. Initiating graceful shutdown.");
                self.shutting_down = Some(ShutdownMode::Graceful);
              }
            }
          }
        },

        _ = sleep(sleep_duration) => {
          trace!("Timer fired.");
        }
      }
    }

    info!("Coordinator task shutting down.");
  }

  // --- Loop Helpers ---

  fn running_count(&self) -> usize {
    self.pools.values().map(|pool| pool.running.len()).sum()
  }

  fn update_gauge_metrics(&self) {
    let queued: usize = self.pools.values().map(|pool| pool.queue.len()).sum();
    let metrics = &self.state.metrics;
    metrics
      .jobs_queued_current
      .store(queued, AtomicOrdering::Relaxed);
    metrics
      .workers_active_current
      .store(self.running_count(), AtomicOrdering::Relaxed);
  }

  /// Time until the earliest thing the loop has to act on: a cron fire, a
  /// queued job in a pool with a free slot, or the next retention purge.
  fn calculate_sleep(&self) -> Duration {
    if self.shutting_down.is_some() {
      return SHUTDOWN_POLL;
    }

    let mut next_wakeup = Some(self.next_purge);
    let mut consider = |candidate: Option<DateTime<Utc>>| {
      if let Some(at) = candidate {
        next_wakeup = Some(next_wakeup.map_or(at, |current| current.min(at)));
      }
    };
    consider(self.cron.next_due());
    for (phase, pool) in &self.pools {
      if pool.running.len() < self.state.settings.workers_for(*phase) {
        consider(pool.queue.next_due());
      }
    }

    let now = self.state.clock.now();
    match next_wakeup {
      Some(at) if at > now => (at - now)
        .to_std()
        .unwrap_or(MAX_IDLE_SLEEP)
        .clamp(Duration::from_millis(1), MAX_IDLE_SLEEP),
      Some(_) => Duration::from_millis(1),
      None => MAX_IDLE_SLEEP,
    }
  }

  /// Requeues what a previous run left behind. `running` jobs lost their
  /// worker with the old process and become eligible immediately.
  fn recover(&mut self, now: DateTime<Utc>) {
    let active = match self.state.store.active() {
      Ok(jobs) => jobs,
      Err(e) => {
        error!(error = %e, "Failed to load active jobs from store during recovery.");
        return;
      }
    };

    let mut reset = 0usize;
    for job in active {
      let eligible_at = match job.status {
        JobStatus::Queued => job.eligible_at,
        _ => {
          let requeued = self.state.store.update(job.id, &[JobStatus::Running], &mut |j: &mut Job| {
            j.status = JobStatus::Queued;
            j.started_at = None;
            j.progress = None;
            j.eligible_at = now;
          });
          match requeued {
            Ok(_) => {
              reset += 1;
              now
            }
            Err(e) => {
              warn!(job_id = %job.id, error = %e, "Could not requeue interrupted job.");
              continue;
            }
          }
        }
      };
      self.pool_mut(job.phase).queue.push(job.id, eligible_at);
    }

    let queued: usize = self.pools.values().map(|pool| pool.queue.len()).sum();
    if queued > 0 {
      info!(queued, reset_running = reset, "Recovered active jobs from store.");
    }
  }

  fn pool_mut(&mut self, phase: Phase) -> &mut PhasePool {
    self.pools.entry(phase).or_insert_with(PhasePool::new)
  }

  // --- Dispatch ---

  /// Claims due jobs for every pool with free slots and spawns their workers.
  fn dispatch_ready(&mut self, now: DateTime<Utc>) {
    for phase in Phase::ALL {
      let capacity = self.state.settings.workers_for(phase);
      loop {
        let pool = self.pool_mut(phase);
        if pool.running.len() >= capacity {
          trace!(%phase, capacity, "Dispatch check: pool full.");
          break;
        }
        let Some((job_id, eligible_at)) = pool.queue.pop_due(now) else {
          break;
        };
        self.claim_and_spawn(phase, job_id, eligible_at, now);
      }
    }
  }

  fn claim_and_spawn(&mut self, phase: Phase, job_id: JobId, eligible_at: DateTime<Utc>, now: DateTime<Utc>) {
    let claimed = self.state.store.update(job_id, &[JobStatus::Queued], &mut |job: &mut Job| {
      job.status = JobStatus::Running;
      job.started_at = Some(now);
      job.progress = None;
    });
    let job = match claimed {
      Ok(job) => job,
      Err(StoreError::StatusMismatch { actual, .. }) => {
        SchedulerMetrics::incr(&self.state.metrics.dispatch_conflicts);
        debug!(%job_id, %phase, status = %actual, "Lost claim to a concurrent change, skipping.");
        return;
      }
      Err(StoreError::NotFound(_)) => {
        warn!(%job_id, %phase, "Queued job no longer in store, dropping from queue.");
        return;
      }
      Err(e) => {
        error!(%job_id, %phase, error = %e, "Store error while claiming job, will retry.");
        let retry_at = now + ChronoDuration::seconds(STORE_ERROR_BACKOFF_SECS);
        self.pool_mut(phase).queue.push(job_id, retry_at);
        return;
      }
    };

    let metrics = &self.state.metrics;
    SchedulerMetrics::incr(&metrics.jobs_dispatched);
    match (now - eligible_at).to_std() {
      Ok(wait) => metrics.job_queue_wait_duration.record(wait),
      Err(_) => metrics.job_queue_wait_duration.record(Duration::ZERO),
    }

    let worker_id = self.next_worker_id;
    self.next_worker_id += 1;
    let (cancel_tx, _) = watch::channel(false);
    let cancel_tx = Arc::new(cancel_tx);
    debug!(%job_id, %phase, worker_id, attempt = job.attempt(), "Dispatching job.");

    let worker = Worker::new(
      worker_id,
      job,
      self.state.executors.get(&phase).cloned(),
      self.state.store.clone(),
      self.state.settings.timeout(phase),
      cancel_tx.clone(),
      self.state.metrics.clone(),
      self.state.worker_outcome_tx.clone(),
    );
    let handle = tokio::spawn(worker.run());
    self.pool_mut(phase).running.insert(
      job_id,
      RunningJob {
        worker_id,
        cancel_tx,
        handle,
      },
    );
  }

  /// Signals and aborts every worker. Their jobs stay `running` in the
  /// store and are requeued by the next start's recovery.
  async fn abort_workers(&mut self) {
    let mut handles = Vec::new();
    for pool in self.pools.values_mut() {
      pool.queue.clear();
      for (job_id, running) in pool.running.drain() {
        trace!(%job_id, worker_id = running.worker_id, "Aborting worker.");
        running.cancel_tx.send_replace(true);
        running.handle.abort();
        handles.push(running.handle);
      }
    }
    if !handles.is_empty() {
      info!(workers = handles.len(), "Aborted running workers.");
      join_all(handles).await;
    }
  }

  // --- Triggers ---

  /// Recomputes the next fire time of every `scheduled` phase.
  fn rebuild_cron_schedule(&mut self, now: DateTime<Utc>) {
    self.cron.clear();
    self.schedules.clear();
    for (phase, expression) in self.state.settings.schedules() {
      match expression.next_after(now) {
        Some(next) => {
          debug!(%phase, cron = expression.as_str(), next_fire = %next, "Scheduled trigger armed.");
          self.cron.push(phase, next);
        }
        None => warn!(%phase, cron = expression.as_str(), "Cron expression never fires."),
      }
      self.schedules.insert(phase, expression);
    }
  }

  /// Starts a `missing`-mode bulk submission for every due cron trigger and
  /// re-arms it.
  fn fire_due_cron(&mut self, now: DateTime<Utc>) {
    while let Some((phase, due)) = self.cron.pop_due(now) {
      SchedulerMetrics::incr(&self.state.metrics.cron_fires);
      info!(%phase, scheduled_for = %due, "Scheduled trigger fired.");
      self.start_bulk(phase, BulkMode::Missing, None);
      let next = self
        .schedules
        .get(&phase)
        .and_then(|expression| expression.next_after(now));
      if let Some(next) = next {
        self.cron.push(phase, next);
      }
    }
  }

  /// Creates a queued job unless the (target, phase) slot is taken.
  fn enqueue(&mut self, request: EnqueueRequest, now: DateTime<Utc>) -> Result<EnqueueOutcome, PipelineError> {
    let max_retries = self.state.settings.retry(request.phase).max_retries;
    let job = Job::new(request, max_retries, now);
    let (job_id, phase, eligible_at) = (job.id, job.phase, job.eligible_at);
    let target_id = job.target_id.clone();

    match self.state.store.insert(job)? {
      InsertOutcome::Inserted(_) => {
        self.pool_mut(phase).queue.push(job_id, eligible_at);
        SchedulerMetrics::incr(&self.state.metrics.jobs_enqueued);
        debug!(%job_id, %phase, %target_id, "Job enqueued.");
        Ok(EnqueueOutcome::Created(job_id))
      }
      InsertOutcome::Duplicate(existing) => {
        SchedulerMetrics::incr(&self.state.metrics.jobs_deduplicated);
        debug!(%phase, %target_id, %existing, "Active job already present, not enqueued.");
        Ok(EnqueueOutcome::AlreadyActive(existing))
      }
    }
  }

  /// Enqueues every `on_import` phase. A failing phase does not stop the
  /// others; each reports its own result.
  fn import(&mut self, target_id: TargetId, now: DateTime<Utc>) -> Vec<ImportOutcome> {
    let phases = self.state.settings.import_phases();
    let mut outcomes = Vec::with_capacity(phases.len());
    for phase in phases {
      let outcome = self.enqueue(EnqueueRequest::new(phase, target_id.clone()), now);
      if let Err(e) = &outcome {
        warn!(%phase, %target_id, error = %e, "Import trigger failed to enqueue.");
      }
      outcomes.push((phase, outcome));
    }
    let failed = outcomes.iter().filter(|(_, outcome)| outcome.is_err()).count();
    info!(%target_id, jobs = outcomes.len(), failed, "Import triggers fired.");
    outcomes
  }

  /// Lists the catalog on a blocking thread. The targets come back through
  /// the listing channel and are enqueued by `finish_bulk`.
  fn start_bulk(&mut self, phase: Phase, mode: BulkMode, responder: Option<Responder<BulkResult>>) {
    let Some(catalog) = self.state.catalog.clone() else {
      match responder {
        Some(responder) => {
          let _ = responder.send(Err(PipelineError::NoTargetCatalog));
        }
        None => warn!(%phase, "Scheduled trigger fired without a target catalog."),
      }
      return;
    };
    debug!(%phase, %mode, "Listing bulk targets.");
    let listing_tx = self.listing_tx.clone();
    tokio::spawn(async move {
      let targets = match tokio::task::spawn_blocking(move || catalog.targets(phase)).await {
        Ok(targets) => targets,
        Err(e) => Err(CatalogError(format!("target listing panicked: {}", e))),
      };
      let _ = listing_tx.send(CatalogListing {
        phase,
        mode,
        targets,
        responder,
      });
    });
  }

  fn finish_bulk(&mut self, listing: CatalogListing) {
    let CatalogListing {
      phase,
      mode,
      targets,
      responder,
    } = listing;
    let now = self.state.clock.now();
    let result = self
      .reject_if_stopping()
      .and_then(|()| targets.map_err(PipelineError::from))
      .map(|targets| self.enqueue_targets(phase, mode, targets, now));
    match responder {
      Some(responder) => {
        let _ = responder.send(result);
      }
      None => {
        if let Err(e) = result {
          warn!(%phase, error = %e, "Scheduled bulk submission failed.");
        }
      }
    }
  }

  fn enqueue_targets(
    &mut self,
    phase: Phase,
    mode: BulkMode,
    targets: Vec<TargetId>,
    now: DateTime<Utc>,
  ) -> BulkResult {
    let mut result = BulkResult::default();
    for target_id in targets {
      if mode == BulkMode::Missing {
        match self.state.store.has_completed(&target_id, phase) {
          Ok(true) => {
            result.skipped += 1;
            continue;
          }
          Ok(false) => {}
          Err(e) => {
            warn!(%phase, %target_id, error = %e, "Bulk submission could not check completion.");
            result.errors += 1;
            continue;
          }
        }
      }
      match self.enqueue(EnqueueRequest::new(phase, target_id.clone()), now) {
        Ok(EnqueueOutcome::Created(_)) => result.submitted += 1,
        Ok(EnqueueOutcome::AlreadyActive(_)) => result.skipped += 1,
        Err(e) => {
          warn!(%phase, %target_id, error = %e, "Bulk submission failed for target.");
          result.errors += 1;
        }
      }
    }
    info!(
      %phase,
      %mode,
      submitted = result.submitted,
      skipped = result.skipped,
      errors = result.errors,
      "Bulk submission processed."
    );
    result
  }

  fn enqueue_dependents(&mut self, completed: &Job, now: DateTime<Utc>) {
    for phase in self.state.settings.dependents_of(completed.phase) {
      let request = EnqueueRequest::new(phase, completed.target_id.clone());
      match self.enqueue(request, now) {
        Ok(outcome) => debug!(
          after = %completed.phase,
          %phase,
          target_id = %completed.target_id,
          created = outcome.is_created(),
          "after_job trigger evaluated."
        ),
        Err(e) => warn!(
          after = %completed.phase,
          %phase,
          target_id = %completed.target_id,
          error = %e,
          "after_job trigger failed to enqueue."
        ),
      }
    }
  }

  // --- Retention ---

  fn purge_if_due(&mut self, now: DateTime<Utc>) {
    if now < self.next_purge {
      return;
    }
    let retention = self.state.settings.retention();
    let interval = ChronoDuration::from_std(retention.purge_interval)
      .unwrap_or_else(|_| ChronoDuration::hours(1));
    self.next_purge = now + interval;

    let keep = ChronoDuration::from_std(retention.keep_finished)
      .unwrap_or_else(|_| ChronoDuration::days(365));
    let cutoff = now.checked_sub_signed(keep).unwrap_or(DateTime::<Utc>::MIN_UTC);
    match self.state.store.purge_finished_before(cutoff) {
      Ok(0) => trace!(%cutoff, "Retention purge found nothing to remove."),
      Ok(purged) => {
        SchedulerMetrics::add(&self.state.metrics.jobs_purged, purged);
        info!(purged, %cutoff, "Purged finished jobs past retention.");
      }
      Err(e) => warn!(error = %e, "Retention purge failed."),
    }
  }

  // --- Worker Outcomes ---

  fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) {
    let WorkerOutcome {
      worker_id,
      job_id,
      phase,
      result,
      duration,
    } = outcome;
    if self.pool_mut(phase).running.remove(&job_id).is_none() {
      trace!(%job_id, worker_id, "Outcome for a worker no longer tracked.");
    }

    let now = self.state.clock.now();
    let job = match self.state.store.get(job_id) {
      Ok(Some(job)) => job,
      Ok(None) => {
        warn!(%job_id, "Outcome for a job missing from the store, discarding.");
        return;
      }
      Err(e) => {
        error!(%job_id, error = %e, "Failed to load job for outcome.");
        return;
      }
    };
    if job.status != JobStatus::Running {
      // Cancelled while the attempt ran; whatever the executor produced is dropped.
      debug!(%job_id, status = %job.status, "Discarding outcome for job no longer running.");
      return;
    }

    let metrics = self.state.metrics.clone();
    match result {
      AttemptResult::Succeeded(output) => self.complete_job(job, output, now),
      AttemptResult::Failed(e) => {
        SchedulerMetrics::incr(&metrics.attempts_failed);
        self.fail_job(job, e, false, now);
      }
      AttemptResult::Panicked(message) => {
        SchedulerMetrics::incr(&metrics.attempts_failed);
        SchedulerMetrics::incr(&metrics.jobs_panicked);
        let error = ExecutionError::transient(format!("executor panicked: {}", message));
        self.fail_job(job, error, false, now);
      }
      AttemptResult::TimedOut(limit) => {
        SchedulerMetrics::incr(&metrics.attempts_failed);
        SchedulerMetrics::incr(&metrics.jobs_timed_out);
        let message = format!("timed out after {}s", limit.as_secs_f64());
        self.publish(&job, EventKind::TimedOut, Params::new(), Some(message.clone()));
        self.fail_job(job, ExecutionError::transient(message), true, now);
      }
      AttemptResult::Cancelled => {
        // The signal only fires on cancel or timeout, both of which move the
        // job out of `running` first. Seeing it here means the worker was
        // aborted from outside; put the job back.
        warn!(%job_id, ?duration, "Attempt interrupted without a state change, requeueing.");
        let requeued = self.state.store.update(job_id, &[JobStatus::Running], &mut |j: &mut Job| {
          j.status = JobStatus::Queued;
          j.started_at = None;
          j.eligible_at = now;
        });
        if requeued.is_ok() {
          self.pool_mut(phase).queue.push(job_id, now);
        }
      }
    }
  }

  fn complete_job(&mut self, job: Job, output: ExecutionOutput, now: DateTime<Utc>) {
    let completed = self.state.store.update(job.id, &[JobStatus::Running], &mut |j: &mut Job| {
      j.status = JobStatus::Completed;
      j.completed_at = Some(now);
      j.progress = Some(100);
      j.error_message = None;
    });
    let job = match completed {
      Ok(job) => job,
      Err(e) => {
        warn!(job_id = %job.id, error = %e, "Could not record completion.");
        return;
      }
    };
    SchedulerMetrics::incr(&self.state.metrics.jobs_completed);
    info!(job_id = %job.id, phase = %job.phase, target_id = %job.target_id, "Job completed.");

    match self.state.store.remove_dead_letter(job.id) {
      Ok(Some(_)) => info!(job_id = %job.id, "Retried dead-letter job completed, entry removed."),
      Ok(None) => {}
      Err(e) => warn!(job_id = %job.id, error = %e, "Failed to remove dead-letter entry."),
    }

    self.publish(&job, EventKind::PhaseComplete, output.payload, None);
    self.publish(&job, EventKind::Completed, Params::new(), None);
    self.enqueue_dependents(&job, now);
  }

  /// Requeues with backoff or, once the budget is spent (or the error is
  /// terminal), records the final status and dead-letters the job.
  fn fail_job(&mut self, job: Job, error: ExecutionError, timed_out: bool, now: DateTime<Utc>) {
    let message = error.to_string();
    let config = self.state.settings.retry(job.phase);
    let decision = if error.is_terminal() {
      RetryDecision::Exhausted
    } else {
      config.evaluate_failure(job.retry_count, now)
    };

    match decision {
      RetryDecision::Retry {
        next_retry_count,
        delay,
        eligible_at,
      } => {
        let requeued = self.state.store.update(job.id, &[JobStatus::Running], &mut |j: &mut Job| {
          j.status = JobStatus::Queued;
          j.retry_count = next_retry_count;
          j.max_retries = config.max_retries;
          j.eligible_at = eligible_at;
          j.started_at = None;
          j.progress = None;
          j.error_message = Some(message.clone());
        });
        let job = match requeued {
          Ok(job) => job,
          Err(e) => {
            warn!(job_id = %job.id, error = %e, "Could not requeue failed job.");
            return;
          }
        };
        self.pool_mut(job.phase).queue.push(job.id, eligible_at);
        SchedulerMetrics::incr(&self.state.metrics.jobs_retried);
        warn!(
          job_id = %job.id,
          phase = %job.phase,
          retry_count = next_retry_count,
          max_retries = config.max_retries,
          delay_secs = delay.as_secs_f64(),
          error = %message,
          "Job failed, retry scheduled."
        );
        let mut payload = Params::new();
        payload.insert("retry_count".to_string(), next_retry_count.to_string());
        payload.insert("delay_seconds".to_string(), delay.as_secs_f64().to_string());
        payload.insert("eligible_at".to_string(), eligible_at.to_rfc3339());
        self.publish(&job, EventKind::RetryScheduled, payload, Some(message));
      }
      RetryDecision::Exhausted => {
        let final_status = if timed_out {
          JobStatus::TimedOut
        } else {
          JobStatus::Failed
        };
        let finished = self.state.store.update(job.id, &[JobStatus::Running], &mut |j: &mut Job| {
          j.status = final_status;
          j.max_retries = config.max_retries;
          j.completed_at = Some(now);
          j.error_message = Some(message.clone());
        });
        let job = match finished {
          Ok(job) => job,
          Err(e) => {
            warn!(job_id = %job.id, error = %e, "Could not record failure.");
            return;
          }
        };
        match self.state.store.record_dead_letter(&job, &message, now) {
          Ok(entry) => {
            SchedulerMetrics::incr(&self.state.metrics.jobs_dead_lettered);
            error!(
              job_id = %job.id,
              phase = %job.phase,
              target_id = %job.target_id,
              failure_count = entry.failure_count,
              terminal = error.is_terminal(),
              error = %message,
              "Job failed permanently, moved to dead-letter queue."
            );
          }
          Err(e) => error!(job_id = %job.id, error = %e, "Failed to record dead-letter entry."),
        }
        self.publish(&job, EventKind::Failed, Params::new(), Some(message));
      }
    }
  }

  fn publish(&self, job: &Job, kind: EventKind, payload: Params, error: Option<String>) {
    let mut event = PipelineEvent::new(kind, job.phase, job.id, job.target_id.clone()).with_payload(payload);
    if let Some(error) = error {
      event = event.with_error(error);
    }
    self.state.events.publish(event);
  }

  // --- Commands ---

  fn reject_if_stopping(&self) -> Result<(), PipelineError> {
    if self.shutting_down.is_some() {
      Err(PipelineError::SchedulerShutdown)
    } else {
      Ok(())
    }
  }

  fn handle_command(&mut self, cmd: CoordinatorCommand) {
    let now = self.state.clock.now();
    match cmd {
      CoordinatorCommand::Enqueue { request, responder } => {
        let result = self
          .reject_if_stopping()
          .and_then(|()| self.enqueue(request, now));
        let _ = responder.send(result);
      }
      CoordinatorCommand::Import { target_id, responder } => {
        let result = self
          .reject_if_stopping()
          .map(|()| self.import(target_id, now));
        let _ = responder.send(result);
      }
      CoordinatorCommand::SubmitBulk {
        phase,
        mode,
        responder,
      } => {
        match self.reject_if_stopping() {
          Ok(()) => self.start_bulk(phase, mode, Some(responder)),
          Err(e) => {
            let _ = responder.send(Err(e));
          }
        }
      }
      CoordinatorCommand::CancelJob { job_id, responder } => {
        let _ = responder.send(self.cancel_job(job_id, now));
      }
      CoordinatorCommand::RetryDeadLetter { job_id, responder } => {
        let result = self
          .reject_if_stopping()
          .and_then(|()| self.retry_dead_letter(job_id, now));
        let _ = responder.send(result);
      }
      CoordinatorCommand::AbandonDeadLetter { job_id, responder } => {
        let _ = responder.send(self.abandon_dead_letter(job_id, now));
      }
      CoordinatorCommand::UpdatePoolConfig { pool, responder } => {
        let _ = responder.send(Ok(self.state.settings.apply_pool_config(pool)));
      }
      CoordinatorCommand::UpdateRetryConfigs { configs, responder } => {
        let result = self
          .state
          .settings
          .apply_retry_configs(&configs)
          .map_err(PipelineError::from);
        let _ = responder.send(result);
      }
      CoordinatorCommand::UpdateTriggerConfigs { configs, responder } => {
        let result = self
          .state
          .settings
          .apply_trigger_configs(configs)
          .map_err(PipelineError::from);
        if result.is_ok() {
          self.rebuild_cron_schedule(now);
        }
        let _ = responder.send(result);
      }
      CoordinatorCommand::GetHistory {
        page,
        limit,
        responder,
      } => {
        let _ = responder.send(self.history(page, limit, now));
      }
      CoordinatorCommand::GetQueueStatus { responder } => {
        let _ = responder.send(Ok(self.queue_status(now)));
      }
    }
  }

  fn cancel_job(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<(), PipelineError> {
    let job = self
      .state
      .store
      .get(job_id)?
      .ok_or(PipelineError::JobNotFound(job_id))?;
    if job.status.is_terminal() {
      debug!(%job_id, status = %job.status, "Cancel requested for finished job, nothing to do.");
      return Ok(());
    }

    let cancelled = self.state.store.update(job_id, &[job.status], &mut |j: &mut Job| {
      j.status = JobStatus::Cancelled;
      j.completed_at = Some(now);
    })?;

    let pool = self.pool_mut(job.phase);
    if job.status == JobStatus::Queued {
      pool.queue.remove(&job_id);
    } else if let Some(running) = pool.running.get(&job_id) {
      // The slot frees up when the worker reports back.
      running.cancel_tx.send_replace(true);
    }
    SchedulerMetrics::incr(&self.state.metrics.jobs_cancelled);
    info!(%job_id, phase = %job.phase, was = %job.status, "Job cancelled.");
    self.publish(&cancelled, EventKind::Cancelled, Params::new(), None);

    // A retried dead letter goes back to review when its job is cancelled.
    if let Ok(Some(entry)) = self.state.store.dead_letter(job_id) {
      if entry.status == DeadLetterStatus::Retrying {
        if let Err(e) = self.state.store.transition_dead_letter(
          job_id,
          DeadLetterStatus::Retrying,
          DeadLetterStatus::PendingReview,
          now,
        ) {
          warn!(%job_id, error = %e, "Failed to return dead-letter entry to review.");
        }
      }
    }
    Ok(())
  }

  fn retry_dead_letter(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<(), PipelineError> {
    let entry = self
      .state
      .store
      .dead_letter(job_id)?
      .ok_or(PipelineError::DeadLetterNotFound(job_id))?;
    self
      .state
      .store
      .transition_dead_letter(
        job_id,
        DeadLetterStatus::PendingReview,
        DeadLetterStatus::Retrying,
        now,
      )
      .map_err(|e| dead_letter_error(e, job_id, DeadLetterStatus::Retrying))?;

    let max_retries = self.state.settings.retry(entry.phase).max_retries;
    let requeued = self.state.store.update(
      job_id,
      &[JobStatus::Failed, JobStatus::TimedOut, JobStatus::Cancelled],
      &mut |j: &mut Job| {
        j.status = JobStatus::Queued;
        j.retry_count = 0;
        j.max_retries = max_retries;
        j.eligible_at = now;
        j.started_at = None;
        j.completed_at = None;
        j.progress = None;
      },
    );
    match requeued {
      Ok(job) => {
        self.pool_mut(job.phase).queue.push(job_id, now);
        SchedulerMetrics::incr(&self.state.metrics.dead_letters_retried);
        info!(%job_id, phase = %job.phase, target_id = %job.target_id, "Dead-letter job re-enqueued.");
        Ok(())
      }
      Err(e) => {
        // Leave the entry reviewable if the job could not be requeued.
        if let Err(rollback) = self.state.store.transition_dead_letter(
          job_id,
          DeadLetterStatus::Retrying,
          DeadLetterStatus::PendingReview,
          now,
        ) {
          error!(%job_id, error = %rollback, "Failed to roll back dead-letter entry.");
        }
        warn!(%job_id, error = %e, "Dead-letter retry rejected.");
        Err(e.into())
      }
    }
  }

  fn abandon_dead_letter(&mut self, job_id: JobId, now: DateTime<Utc>) -> Result<(), PipelineError> {
    self
      .state
      .store
      .transition_dead_letter(
        job_id,
        DeadLetterStatus::PendingReview,
        DeadLetterStatus::Abandoned,
        now,
      )
      .map_err(|e| dead_letter_error(e, job_id, DeadLetterStatus::Abandoned))?;
    SchedulerMetrics::incr(&self.state.metrics.dead_letters_abandoned);
    info!(%job_id, "Dead-letter entry abandoned.");
    Ok(())
  }

  fn queue_status(&self, now: DateTime<Utc>) -> BTreeMap<Phase, QueueStatus> {
    self
      .pools
      .iter()
      .map(|(phase, pool)| {
        let status = QueueStatus {
          queued: pool.queue.len(),
          pending: pool.queue.count_due(now),
          running: pool.running.len(),
        };
        (*phase, status)
      })
      .collect()
  }

  fn history(&self, page: usize, limit: usize, now: DateTime<Utc>) -> Result<JobHistory, PipelineError> {
    let (jobs, total) = self.state.store.list(page, limit)?;
    Ok(JobHistory {
      jobs,
      total,
      page,
      limit,
      active_jobs: self.state.store.active()?,
      queue_status: self.queue_status(now),
      pool_config: self.state.settings.pool(),
      retention: self.state.settings.retention().describe(),
    })
  }
}

/// Maps a failed dead-letter compare-and-set onto the caller-facing error.
fn dead_letter_error(err: StoreError, job_id: JobId, to: DeadLetterStatus) -> PipelineError {
  match err {
    StoreError::DeadLetterStatusMismatch { actual, .. } => PipelineError::InvalidStateTransition {
      entity: "dead_letter",
      id: job_id,
      from: actual.to_string(),
      to: to.to_string(),
    },
    other => other.into(),
  }
}
