use crate::job::{JobId, TargetId};
use crate::phase::Phase;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Review state of a dead-lettered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeadLetterStatus {
  /// Waiting for an operator to retry or abandon it.
  PendingReview,
  /// Re-enqueued by an operator; the job is in flight again.
  Retrying,
  /// Given up on. Never transitions again.
  Abandoned,
}

impl DeadLetterStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      DeadLetterStatus::PendingReview => "pending_review",
      DeadLetterStatus::Retrying => "retrying",
      DeadLetterStatus::Abandoned => "abandoned",
    }
  }

  /// Whether moving from `self` to `next` is allowed.
  pub fn can_transition_to(&self, next: DeadLetterStatus) -> bool {
    matches!(
      (self, next),
      (DeadLetterStatus::PendingReview, DeadLetterStatus::Retrying)
        | (DeadLetterStatus::PendingReview, DeadLetterStatus::Abandoned)
        | (DeadLetterStatus::Retrying, DeadLetterStatus::PendingReview)
    )
  }
}

impl fmt::Display for DeadLetterStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for DeadLetterStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "pending_review" => Ok(DeadLetterStatus::PendingReview),
      "retrying" => Ok(DeadLetterStatus::Retrying),
      "abandoned" => Ok(DeadLetterStatus::Abandoned),
      other => Err(format!("unknown dead-letter status `{}`", other)),
    }
  }
}

/// A job that exhausted its retries (or failed terminally), keyed by job ID.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeadLetterEntry {
  pub job_id: JobId,
  pub phase: Phase,
  pub target_id: TargetId,
  pub status: DeadLetterStatus,
  /// Failed attempts across every retry budget the job went through.
  pub failure_count: u32,
  pub last_error: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

/// Number of entries per status. Not affected by a listing's status filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeadLetterCounts {
  pub pending_review: usize,
  pub retrying: usize,
  pub abandoned: usize,
  pub total: usize,
}

impl DeadLetterCounts {
  pub(crate) fn add(&mut self, status: DeadLetterStatus) {
    match status {
      DeadLetterStatus::PendingReview => self.pending_review += 1,
      DeadLetterStatus::Retrying => self.retrying += 1,
      DeadLetterStatus::Abandoned => self.abandoned += 1,
    }
    self.total += 1;
  }
}

/// One page of the dead-letter queue, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeadLetterPage {
  pub entries: Vec<DeadLetterEntry>,
  pub counts: DeadLetterCounts,
  pub page: usize,
  pub limit: usize,
}
