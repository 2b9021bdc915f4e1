use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// Lock-free count and sum of observed durations, in microseconds.
///
/// Suitable for simple latency tracking without percentile information.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
}

impl SimpleHistogram {
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of all recorded durations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Atomic counters shared between the Coordinator and Workers. Cloning only
/// clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub(crate) struct SchedulerMetrics {
  // --- Counters ---
  /// Jobs created by any trigger or request.
  pub jobs_enqueued: Arc<AtomicUsize>,
  /// Enqueue requests answered with an already active job.
  pub jobs_deduplicated: Arc<AtomicUsize>,
  /// Jobs claimed by a worker (one per attempt).
  pub jobs_dispatched: Arc<AtomicUsize>,
  pub jobs_completed: Arc<AtomicUsize>,
  /// Attempts that ended in an error, panic or timeout.
  pub attempts_failed: Arc<AtomicUsize>,
  pub jobs_panicked: Arc<AtomicUsize>,
  pub jobs_timed_out: Arc<AtomicUsize>,
  /// Failed attempts requeued with a backoff delay.
  pub jobs_retried: Arc<AtomicUsize>,
  pub jobs_dead_lettered: Arc<AtomicUsize>,
  pub jobs_cancelled: Arc<AtomicUsize>,
  /// Claims lost to a concurrent state change.
  pub dispatch_conflicts: Arc<AtomicUsize>,
  pub dead_letters_retried: Arc<AtomicUsize>,
  pub dead_letters_abandoned: Arc<AtomicUsize>,
  pub jobs_purged: Arc<AtomicUsize>,
  pub cron_fires: Arc<AtomicUsize>,

  // --- Gauges ---
  /// Jobs waiting in a phase queue, including those in a retry delay.
  pub jobs_queued_current: Arc<AtomicUsize>,
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  pub job_execution_duration: Arc<SimpleHistogram>,
  /// Time between a job becoming eligible and a worker claiming it.
  pub job_queue_wait_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn add(counter: &AtomicUsize, amount: usize) {
    counter.fetch_add(amount, Ordering::Relaxed);
  }

  /// Point-in-time copy of every metric.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      jobs_enqueued: self.jobs_enqueued.load(order),
      jobs_deduplicated: self.jobs_deduplicated.load(order),
      jobs_dispatched: self.jobs_dispatched.load(order),
      jobs_completed: self.jobs_completed.load(order),
      attempts_failed: self.attempts_failed.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      jobs_timed_out: self.jobs_timed_out.load(order),
      jobs_retried: self.jobs_retried.load(order),
      jobs_dead_lettered: self.jobs_dead_lettered.load(order),
      jobs_cancelled: self.jobs_cancelled.load(order),
      dispatch_conflicts: self.dispatch_conflicts.load(order),
      dead_letters_retried: self.dead_letters_retried.load(order),
      dead_letters_abandoned: self.dead_letters_abandoned.load(order),
      jobs_purged: self.jobs_purged.load(order),
      cron_fires: self.cron_fires.load(order),
      jobs_queued_current: self.jobs_queued_current.load(order),
      workers_active_current: self.workers_active_current.load(order),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
      job_queue_wait_duration_count: self.job_queue_wait_duration.get_count(),
      job_queue_wait_duration_sum_micros: self.job_queue_wait_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
  // Counters
  pub jobs_enqueued: usize,
  pub jobs_deduplicated: usize,
  pub jobs_dispatched: usize,
  pub jobs_completed: usize,
  pub attempts_failed: usize,
  pub jobs_panicked: usize,
  pub jobs_timed_out: usize,
  pub jobs_retried: usize,
  pub jobs_dead_lettered: usize,
  pub jobs_cancelled: usize,
  pub dispatch_conflicts: usize,
  pub dead_letters_retried: usize,
  pub dead_letters_abandoned: usize,
  pub jobs_purged: usize,
  pub cron_fires: usize,
  // Gauges
  pub jobs_queued_current: usize,
  pub workers_active_current: usize,
  // Histogram Data
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
  pub job_queue_wait_duration_count: usize,
  pub job_queue_wait_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean job execution duration, if any attempt finished.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    mean(
      self.job_execution_duration_sum_micros,
      self.job_execution_duration_count,
    )
  }

  /// Mean time jobs spent eligible but unclaimed, if any were claimed.
  pub fn mean_queue_wait_duration(&self) -> Option<Duration> {
    mean(
      self.job_queue_wait_duration_sum_micros,
      self.job_queue_wait_duration_count,
    )
  }
}

fn mean(sum_micros: usize, count: usize) -> Option<Duration> {
  if count == 0 {
    None
  } else {
    Some(Duration::from_micros((sum_micros / count) as u64))
  }
}
