//! Wall-clock source for the coordinator.
//!
//! Due times, cron fires, retry eligibility and retention cutoffs are all
//! computed from [`Clock::now`]. Timers still run on tokio time; a clock that
//! jumps ahead takes effect the next time the coordinator wakes up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

pub trait Clock: Send + Sync + 'static {
  fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can keep one and hand another to
/// [`SchedulerBuilder::clock`](crate::SchedulerBuilder::clock).
#[derive(Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn set(&self, at: DateTime<Utc>) {
    *self.now.lock() = at;
  }

  /// Moves the clock forward. A step past chrono's range leaves it unchanged.
  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock();
    let current = *now;
    if let Some(next) = ChronoDuration::from_std(by)
      .ok()
      .and_then(|by| current.checked_add_signed(by))
    {
      *now = next;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}

impl fmt::Debug for ManualClock {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("ManualClock").field(&*self.now.lock()).finish()
  }
}
