use crate::dlq::{DeadLetterCounts, DeadLetterEntry, DeadLetterPage, DeadLetterStatus};
use crate::error::StoreError;
use crate::job::{Job, JobId, JobStatus, TargetId};
use crate::phase::Phase;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Result of [`JobStore::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
  Inserted(JobId),
  /// An active job already holds the (target, phase) slot; nothing was written.
  Duplicate(JobId),
}

/// Persistence for job records and dead-letter entries.
///
/// Every method is atomic with respect to the others. In particular
/// [`JobStore::update`] is a compare-and-set on the job's status, and the
/// store guarantees at most one active (queued or running) job per
/// (target, phase) pair across inserts and updates.
pub trait JobStore: Send + Sync + 'static {
  /// Inserts `job` unless another active job exists for its (target, phase).
  fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError>;

  fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;

  /// Applies `apply` to the job if its current status is in `expected`
  /// (an empty slice accepts any status) and returns the updated record.
  ///
  /// # Errors
  ///
  /// - [`StoreError::NotFound`] if the job does not exist.
  /// - [`StoreError::StatusMismatch`] if the status check fails; nothing is written.
  /// - [`StoreError::DuplicateActive`] if the mutation moves the job back into an
  ///   active state while another active job holds its (target, phase) slot.
  fn update(
    &self,
    job_id: JobId,
    expected: &[JobStatus],
    apply: &mut dyn FnMut(&mut Job),
  ) -> Result<Job, StoreError>;

  /// One page of jobs, newest first. `page` is 1-based. Also returns the total job count.
  fn list(&self, page: usize, limit: usize) -> Result<(Vec<Job>, usize), StoreError>;

  /// All queued or running jobs, oldest first.
  fn active(&self) -> Result<Vec<Job>, StoreError>;

  /// The active job holding the (target, phase) slot, if any.
  fn active_for(&self, target_id: &TargetId, phase: Phase) -> Result<Option<JobId>, StoreError>;

  /// Whether a job for (target, phase) has ever completed. Survives purges.
  fn has_completed(&self, target_id: &TargetId, phase: Phase) -> Result<bool, StoreError>;

  /// Deletes terminal jobs finished before `cutoff` that no dead-letter entry
  /// references. Returns the number removed.
  fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

  /// Creates the dead-letter entry for an exhausted `job`, or advances an
  /// existing one (a `retrying` entry returns to `pending_review`).
  /// `failure_count` grows by the attempts made in the job's current budget.
  fn record_dead_letter(
    &self,
    job: &Job,
    error: &str,
    now: DateTime<Utc>,
  ) -> Result<DeadLetterEntry, StoreError>;

  fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError>;

  /// Compare-and-set on a dead-letter entry's status.
  ///
  /// # Errors
  ///
  /// - [`StoreError::DeadLetterNotFound`] if no entry exists.
  /// - [`StoreError::DeadLetterStatusMismatch`] if the entry is not in `expected`
  ///   or `expected -> next` is not an allowed transition.
  fn transition_dead_letter(
    &self,
    job_id: JobId,
    expected: DeadLetterStatus,
    next: DeadLetterStatus,
    now: DateTime<Utc>,
  ) -> Result<DeadLetterEntry, StoreError>;

  fn remove_dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError>;

  /// One page of entries, newest first, optionally filtered by status.
  /// Counts always cover the whole queue.
  fn list_dead_letters(
    &self,
    page: usize,
    limit: usize,
    status: Option<DeadLetterStatus>,
  ) -> Result<DeadLetterPage, StoreError>;
}

// --- In-Memory Store ---

type SlotKey = (TargetId, Phase);

#[derive(Debug, Default)]
struct MemoryState {
  jobs: HashMap<JobId, Job>,
  active: HashMap<SlotKey, JobId>,
  completed: HashSet<SlotKey>,
  dead_letters: HashMap<JobId, DeadLetterEntry>,
}

/// A [`JobStore`] kept in process memory behind one mutex.
///
/// Suitable for tests and single-process deployments; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
  state: Mutex<MemoryState>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn arc() -> Arc<Self> {
    Arc::new(Self::new())
  }

  /// Number of job records currently held.
  pub fn len(&self) -> usize {
    self.state.lock().jobs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn slot_key(job: &Job) -> SlotKey {
  (job.target_id.clone(), job.phase)
}

fn paginate<T>(items: Vec<T>, page: usize, limit: usize) -> Vec<T> {
  let limit = limit.max(1);
  let skip = page.max(1).saturating_sub(1).saturating_mul(limit);
  items.into_iter().skip(skip).take(limit).collect()
}

impl JobStore for MemoryStore {
  fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError> {
    let mut state = self.state.lock();
    let key = slot_key(&job);
    if job.status.is_active() {
      if let Some(existing) = state.active.get(&key) {
        trace!(target_id = %job.target_id, phase = %job.phase, %existing, "Insert rejected, slot occupied.");
        return Ok(InsertOutcome::Duplicate(*existing));
      }
      state.active.insert(key.clone(), job.id);
    }
    if job.status == JobStatus::Completed {
      state.completed.insert(key);
    }
    let id = job.id;
    state.jobs.insert(id, job);
    Ok(InsertOutcome::Inserted(id))
  }

  fn get(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
    Ok(self.state.lock().jobs.get(&job_id).cloned())
  }

  fn update(
    &self,
    job_id: JobId,
    expected: &[JobStatus],
    apply: &mut dyn FnMut(&mut Job),
  ) -> Result<Job, StoreError> {
    let mut state = self.state.lock();
    let current = state
      .jobs
      .get(&job_id)
      .cloned()
      .ok_or(StoreError::NotFound(job_id))?;
    if !expected.is_empty() && !expected.contains(&current.status) {
      return Err(StoreError::StatusMismatch {
        job_id,
        actual: current.status,
      });
    }

    let mut updated = current.clone();
    apply(&mut updated);
    // Identity fields are fixed for the life of a job.
    updated.id = current.id;
    updated.phase = current.phase;
    updated.target_id = current.target_id.clone();

    let key = slot_key(&updated);
    match (current.status.is_active(), updated.status.is_active()) {
      (false, true) => {
        if let Some(existing) = state.active.get(&key) {
          if *existing != job_id {
            return Err(StoreError::DuplicateActive {
              target_id: updated.target_id.clone(),
              phase: updated.phase,
              existing: *existing,
            });
          }
        }
        state.active.insert(key.clone(), job_id);
      }
      (true, false) => {
        if state.active.get(&key) == Some(&job_id) {
          state.active.remove(&key);
        }
      }
      _ => {}
    }
    if updated.status == JobStatus::Completed {
      state.completed.insert(key);
    }
    state.jobs.insert(job_id, updated.clone());
    Ok(updated)
  }

  fn list(&self, page: usize, limit: usize) -> Result<(Vec<Job>, usize), StoreError> {
    let state = self.state.lock();
    let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
    let total = jobs.len();
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    Ok((paginate(jobs, page, limit), total))
  }

  fn active(&self) -> Result<Vec<Job>, StoreError> {
    let state = self.state.lock();
    let mut jobs: Vec<Job> = state
      .active
      .values()
      .filter_map(|id| state.jobs.get(id).cloned())
      .collect();
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    Ok(jobs)
  }

  fn active_for(&self, target_id: &TargetId, phase: Phase) -> Result<Option<JobId>, StoreError> {
    let key = (target_id.clone(), phase);
    Ok(self.state.lock().active.get(&key).copied())
  }

  fn has_completed(&self, target_id: &TargetId, phase: Phase) -> Result<bool, StoreError> {
    let key = (target_id.clone(), phase);
    Ok(self.state.lock().completed.contains(&key))
  }

  fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
    let mut state = self.state.lock();
    let MemoryState {
      jobs, dead_letters, ..
    } = &mut *state;
    let before = jobs.len();
    jobs.retain(|id, job| {
      let expired = job.status.is_terminal()
        && job.completed_at.map_or(false, |finished| finished < cutoff);
      !expired || dead_letters.contains_key(id)
    });
    let purged = before - jobs.len();
    if purged > 0 {
      debug!(purged, %cutoff, "Purged finished jobs.");
    }
    Ok(purged)
  }

  fn record_dead_letter(
    &self,
    job: &Job,
    error: &str,
    now: DateTime<Utc>,
  ) -> Result<DeadLetterEntry, StoreError> {
    let mut state = self.state.lock();
    let attempts = job.retry_count.saturating_add(1);
    let entry = state
      .dead_letters
      .entry(job.id)
      .and_modify(|entry| {
        if entry.status == DeadLetterStatus::Retrying {
          entry.status = DeadLetterStatus::PendingReview;
        }
        entry.failure_count = entry.failure_count.saturating_add(attempts);
        entry.last_error = error.to_string();
        entry.updated_at = now;
      })
      .or_insert_with(|| DeadLetterEntry {
        job_id: job.id,
        phase: job.phase,
        target_id: job.target_id.clone(),
        status: DeadLetterStatus::PendingReview,
        failure_count: attempts,
        last_error: error.to_string(),
        created_at: now,
        updated_at: now,
      });
    Ok(entry.clone())
  }

  fn dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
    Ok(self.state.lock().dead_letters.get(&job_id).cloned())
  }

  fn transition_dead_letter(
    &self,
    job_id: JobId,
    expected: DeadLetterStatus,
    next: DeadLetterStatus,
    now: DateTime<Utc>,
  ) -> Result<DeadLetterEntry, StoreError> {
    let mut state = self.state.lock();
    let entry = state
      .dead_letters
      .get_mut(&job_id)
      .ok_or(StoreError::DeadLetterNotFound(job_id))?;
    if entry.status != expected || !expected.can_transition_to(next) {
      return Err(StoreError::DeadLetterStatusMismatch {
        job_id,
        actual: entry.status,
      });
    }
    entry.status = next;
    entry.updated_at = now;
    Ok(entry.clone())
  }

  fn remove_dead_letter(&self, job_id: JobId) -> Result<Option<DeadLetterEntry>, StoreError> {
    Ok(self.state.lock().dead_letters.remove(&job_id))
  }

  fn list_dead_letters(
    &self,
    page: usize,
    limit: usize,
    status: Option<DeadLetterStatus>,
  ) -> Result<DeadLetterPage, StoreError> {
    let state = self.state.lock();
    let mut counts = DeadLetterCounts::default();
    let mut entries = Vec::new();
    for entry in state.dead_letters.values() {
      counts.add(entry.status);
      if status.map_or(true, |wanted| wanted == entry.status) {
        entries.push(entry.clone());
      }
    }
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.job_id.cmp(&a.job_id)));
    Ok(DeadLetterPage {
      entries: paginate(entries, page, limit),
      counts,
      page: page.max(1),
      limit: limit.max(1),
    })
  }
}
