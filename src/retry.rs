use crate::error::ConfigError;
use crate::phase::Phase;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Upper bound accepted for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;
/// Bounds accepted for both delay fields, in seconds.
pub const DELAY_SECONDS_RANGE: (u64, u64) = (1, 86_400);
/// Bounds accepted for `backoff_factor`.
pub const BACKOFF_FACTOR_RANGE: (f64, f64) = (1.0, 5.0);

/// Per-phase retry policy.
///
/// The delay before retry attempt `n + 1` (where `n` failures were already
/// recorded) is `min(initial_delay_seconds * backoff_factor^n, max_delay_seconds)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryConfig {
  /// Retries allowed after the first attempt. `0` makes every failure terminal.
  pub max_retries: u32,
  pub initial_delay_seconds: u64,
  pub max_delay_seconds: u64,
  /// Growth factor between successive delays. `1.0` gives a constant delay.
  pub backoff_factor: f64,
}

/// A retry policy tagged with its phase, as exchanged on the retry-config endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PhaseRetryConfig {
  pub phase: Phase,
  #[cfg_attr(feature = "serde", serde(flatten))]
  pub config: RetryConfig,
}

/// What the retry engine decided for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
  /// Requeue the job, not claimable before `eligible_at`.
  Retry {
    next_retry_count: u32,
    delay: StdDuration,
    eligible_at: DateTime<Utc>,
  },
  /// The budget is spent; the job belongs in the dead-letter queue.
  Exhausted,
}

impl RetryConfig {
  pub fn new(
    max_retries: u32,
    initial_delay_seconds: u64,
    max_delay_seconds: u64,
    backoff_factor: f64,
  ) -> Self {
    Self {
      max_retries,
      initial_delay_seconds,
      max_delay_seconds,
      backoff_factor,
    }
  }

  /// Checks every field against its accepted range.
  ///
  /// # Errors
  ///
  /// - [`ConfigError::OutOfRange`] for a field outside its bounds.
  /// - [`ConfigError::InitialDelayExceedsMax`] when `initial_delay_seconds > max_delay_seconds`.
  pub fn validate(&self, phase: Phase) -> Result<(), ConfigError> {
    let out_of_range = |field: &'static str, value: String, min: String, max: String| {
      ConfigError::OutOfRange {
        phase,
        field,
        value,
        min,
        max,
      }
    };

    if self.max_retries > MAX_RETRIES_LIMIT {
      return Err(out_of_range(
        "max_retries",
        self.max_retries.to_string(),
        "0".into(),
        MAX_RETRIES_LIMIT.to_string(),
      ));
    }
    let (min_delay, max_delay) = DELAY_SECONDS_RANGE;
    for (field, value) in [
      ("initial_delay_seconds", self.initial_delay_seconds),
      ("max_delay_seconds", self.max_delay_seconds),
    ] {
      if !(min_delay..=max_delay).contains(&value) {
        return Err(out_of_range(
          field,
          value.to_string(),
          min_delay.to_string(),
          max_delay.to_string(),
        ));
      }
    }
    let (min_factor, max_factor) = BACKOFF_FACTOR_RANGE;
    // NaN fails the range check as well.
    if !(min_factor..=max_factor).contains(&self.backoff_factor) {
      return Err(out_of_range(
        "backoff_factor",
        self.backoff_factor.to_string(),
        min_factor.to_string(),
        max_factor.to_string(),
      ));
    }
    if self.initial_delay_seconds > self.max_delay_seconds {
      return Err(ConfigError::InitialDelayExceedsMax {
        phase,
        initial: self.initial_delay_seconds,
        max: self.max_delay_seconds,
      });
    }
    Ok(())
  }

  /// Delay to wait after a failure when `retry_count` failures were already
  /// recorded before it.
  pub fn delay(&self, retry_count: u32) -> StdDuration {
    let cap = self.max_delay_seconds as f64;
    let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
    let raw = self.initial_delay_seconds as f64 * self.backoff_factor.powi(exponent);
    let seconds = if raw.is_finite() { raw.min(cap) } else { cap };
    StdDuration::from_secs_f64(seconds.max(0.0))
  }

  /// Decides the fate of a job whose attempt just failed.
  ///
  /// `retry_count` is the job's count before this failure is recorded. The
  /// caller passes the config as it stands *now*; earlier decisions are not
  /// revisited.
  pub fn evaluate_failure(&self, retry_count: u32, now: DateTime<Utc>) -> RetryDecision {
    if retry_count >= self.max_retries {
      return RetryDecision::Exhausted;
    }
    let delay = self.delay(retry_count);
    let chrono_delay = ChronoDuration::from_std(delay)
      .unwrap_or_else(|_| ChronoDuration::seconds(DELAY_SECONDS_RANGE.1 as i64));
    RetryDecision::Retry {
      next_retry_count: retry_count + 1,
      delay,
      eligible_at: now + chrono_delay,
    }
  }
}

impl PhaseRetryConfig {
  pub fn new(phase: Phase, config: RetryConfig) -> Self {
    Self { phase, config }
  }
}
