//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use phasekeeper::{
  BoxedExecFn, CatalogError, EventKind, ExecutionError, ExecutionOutput, ExecutionRequest, Job,
  JobId, JobStatus, Phase, PipelineEvent, RetryConfig, Scheduler, SchedulerBuilder, TargetId,
  TriggerConfig,
};
use tokio::sync::broadcast;
use tracing_subscriber::fmt::TestWriter;

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Every test calls this; only the first install wins.
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

// A builder where no phase fires on its own, so tests only see the jobs they submit.
pub fn manual_builder() -> SchedulerBuilder {
  Phase::ALL
    .iter()
    .fold(Scheduler::builder(), |builder, phase| {
      builder.trigger(TriggerConfig::manual(*phase))
    })
}

// Shortest accepted backoff: one second between attempts.
pub fn fast_retry(max_retries: u32) -> RetryConfig {
  RetryConfig::new(max_retries, 1, 1, 1.0)
}

// A catalog returning the same fixed targets for every phase.
pub fn fixed_catalog(
  targets: &[&str],
) -> impl Fn(Phase) -> Result<Vec<TargetId>, CatalogError> + Send + Sync + 'static {
  let targets: Vec<TargetId> = targets.iter().map(|t| TargetId::from(*t)).collect();
  move |_phase: Phase| Ok(targets.clone())
}

// Increments a counter, optionally delays, then succeeds.
pub fn exec_counter(counter: Arc<AtomicUsize>, delay: StdDuration) -> BoxedExecFn {
  Box::new(move |request: ExecutionRequest| {
    let ctr = counter.clone();
    Box::pin(async move {
      let count = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      tracing::debug!(target_id = %request.target_id, "Counter executor running (Count: {})", count);
      if delay > StdDuration::ZERO {
        tokio::time::sleep(delay).await;
      }
      Ok(ExecutionOutput::new().with("count", count))
    })
  })
}

// Fails transiently for the first `failures` invocations, then succeeds.
pub fn exec_fail_times(counter: Arc<AtomicUsize>, failures: usize) -> BoxedExecFn {
  Box::new(move |_request: ExecutionRequest| {
    let ctr = counter.clone();
    Box::pin(async move {
      let call = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      if call <= failures {
        tracing::debug!("Failing executor call {} of {}", call, failures);
        Err(ExecutionError::transient(format!("transient failure {}", call)))
      } else {
        Ok(ExecutionOutput::new())
      }
    })
  })
}

// Fails on every invocation.
pub fn exec_always_fail(counter: Arc<AtomicUsize>, terminal: bool) -> BoxedExecFn {
  Box::new(move |_request: ExecutionRequest| {
    let ctr = counter.clone();
    Box::pin(async move {
      ctr.fetch_add(1, Ordering::SeqCst);
      if terminal {
        Err(ExecutionError::terminal("corrupt source file"))
      } else {
        Err(ExecutionError::transient("device busy"))
      }
    })
  })
}

// Fails terminally while `failing` is set, succeeds otherwise.
pub fn exec_switchable(counter: Arc<AtomicUsize>, failing: Arc<AtomicBool>) -> BoxedExecFn {
  Box::new(move |_request: ExecutionRequest| {
    let ctr = counter.clone();
    let fail = failing.load(Ordering::SeqCst);
    Box::pin(async move {
      ctr.fetch_add(1, Ordering::SeqCst);
      if fail {
        Err(ExecutionError::terminal("switched to failing"))
      } else {
        Ok(ExecutionOutput::new())
      }
    })
  })
}

// Panics on the first `panics` invocations, then succeeds.
pub fn exec_panic_times(counter: Arc<AtomicUsize>, panics: usize) -> BoxedExecFn {
  Box::new(move |_request: ExecutionRequest| {
    let ctr = counter.clone();
    Box::pin(async move {
      let call = ctr.fetch_add(1, Ordering::SeqCst) + 1;
      if call <= panics {
        panic!("executor blew up on call {}", call);
      }
      Ok(ExecutionOutput::new())
    })
  })
}

// Tracks how many invocations overlap.
pub fn exec_concurrency(
  current: Arc<AtomicUsize>,
  max_seen: Arc<AtomicUsize>,
  delay: StdDuration,
) -> BoxedExecFn {
  Box::new(move |_request: ExecutionRequest| {
    let current = current.clone();
    let max_seen = max_seen.clone();
    Box::pin(async move {
      let now_running = current.fetch_add(1, Ordering::SeqCst) + 1;
      max_seen.fetch_max(now_running, Ordering::SeqCst);
      tokio::time::sleep(delay).await;
      current.fetch_sub(1, Ordering::SeqCst);
      Ok(ExecutionOutput::new())
    })
  })
}

// Counts the call, then waits for the cancel signal (or gives up after 30s).
pub fn exec_until_cancelled(started: Arc<AtomicUsize>, saw_cancel: Arc<AtomicBool>) -> BoxedExecFn {
  Box::new(move |mut request: ExecutionRequest| {
    let started = started.clone();
    let saw_cancel = saw_cancel.clone();
    Box::pin(async move {
      started.fetch_add(1, Ordering::SeqCst);
      tokio::select! {
        _ = request.cancel.cancelled() => {
          saw_cancel.store(true, Ordering::SeqCst);
          Err(ExecutionError::transient("cancelled"))
        }
        _ = tokio::time::sleep(StdDuration::from_secs(30)) => Ok(ExecutionOutput::new()),
      }
    })
  })
}

// Fails terminally on the first call and waits for cancellation on every later one.
pub fn exec_fail_then_block(started: Arc<AtomicUsize>) -> BoxedExecFn {
  Box::new(move |mut request: ExecutionRequest| {
    let started = started.clone();
    Box::pin(async move {
      let call = started.fetch_add(1, Ordering::SeqCst) + 1;
      if call == 1 {
        return Err(ExecutionError::terminal("first run fails"));
      }
      request.cancel.cancelled().await;
      Err(ExecutionError::transient("cancelled"))
    })
  })
}

// Polls the store until the job reaches `status`.
pub async fn wait_for_status(
  scheduler: &Scheduler,
  job_id: JobId,
  status: JobStatus,
  timeout: StdDuration,
) -> Job {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    let job = scheduler.get_job(job_id).await.expect("job should exist");
    if job.status == status {
      return job;
    }
    if tokio::time::Instant::now() >= deadline {
      panic!(
        "job {} did not reach {} within {:?} (last status {}, retry_count {})",
        job_id, status, timeout, job.status, job.retry_count
      );
    }
    tokio::time::sleep(StdDuration::from_millis(20)).await;
  }
}

// Polls a counter until it reaches at least `expected`.
pub async fn wait_for_count(counter: &AtomicUsize, expected: usize, timeout: StdDuration) {
  let deadline = tokio::time::Instant::now() + timeout;
  while counter.load(Ordering::SeqCst) < expected {
    if tokio::time::Instant::now() >= deadline {
      panic!(
        "counter stayed at {} (wanted {}) for {:?}",
        counter.load(Ordering::SeqCst),
        expected,
        timeout
      );
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

// Reads events until one of `kind` for `job_id` arrives.
pub async fn wait_for_event(
  events: &mut broadcast::Receiver<PipelineEvent>,
  kind: EventKind,
  job_id: JobId,
  timeout: StdDuration,
) -> PipelineEvent {
  let found = tokio::time::timeout(timeout, async {
    loop {
      match events.recv().await {
        Ok(event) if event.kind == kind && event.job_id == job_id => return event,
        Ok(_) => continue,
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "Test subscriber lagged.");
        }
        Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
      }
    }
  })
  .await;
  match found {
    Ok(event) => event,
    Err(_) => panic!("no {:?} event for job {} within {:?}", kind, job_id, timeout),
  }
}
