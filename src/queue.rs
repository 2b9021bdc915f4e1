use std::cmp::Reverse;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use priority_queue::priority_queue::PriorityQueue;

/// Items ordered by the instant they become due, earliest first.
///
/// Backed by a handle-based priority queue so entries can be removed or
/// rescheduled by key in O(log n). A per-push sequence number breaks ties,
/// keeping items that share a due time in insertion order.
#[derive(Debug)]
pub(crate) struct DelayQueue<K: Hash + Eq> {
  pq: PriorityQueue<K, Reverse<(DateTime<Utc>, u64)>>,
  seq: u64,
}

impl<K: Hash + Eq + Clone> DelayQueue<K> {
  pub fn new() -> Self {
    Self {
      pq: PriorityQueue::new(),
      seq: 0,
    }
  }

  /// Schedules `key` at `due`, replacing any earlier schedule for the same key.
  pub fn push(&mut self, key: K, due: DateTime<Utc>) {
    self.seq = self.seq.wrapping_add(1);
    let priority = Reverse((due, self.seq));
    if self.pq.change_priority(&key, priority).is_none() {
      self.pq.push(key, priority);
    }
  }

  /// Returns `true` if `key` was queued.
  pub fn remove(&mut self, key: &K) -> bool {
    self.pq.remove(key).is_some()
  }

  /// Due time of the earliest entry.
  pub fn next_due(&self) -> Option<DateTime<Utc>> {
    self.pq.peek().map(|(_, Reverse((due, _)))| *due)
  }

  /// Pops the earliest entry if it is due at `now`.
  pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<(K, DateTime<Utc>)> {
    match self.next_due() {
      Some(due) if due <= now => self.pq.pop().map(|(key, Reverse((due, _)))| (key, due)),
      _ => None,
    }
  }

  /// Entries due at `now`.
  pub fn count_due(&self, now: DateTime<Utc>) -> usize {
    self
      .pq
      .iter()
      .filter(|(_, Reverse((due, _)))| *due <= now)
      .count()
  }

  pub fn len(&self) -> usize {
    self.pq.len()
  }

  pub fn clear(&mut self) {
    self.pq.clear();
  }
}
