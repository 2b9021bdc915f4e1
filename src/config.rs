use crate::error::ConfigError;
use crate::phase::Phase;
use crate::retry::{PhaseRetryConfig, RetryConfig};
use crate::trigger::{self, CronExpression, TriggerConfig, TriggerType};

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

/// Smallest accepted worker count for a phase pool.
pub const MIN_POOL_WORKERS: usize = 1;
/// Largest accepted worker count for a phase pool.
pub const MAX_POOL_WORKERS: usize = 10;

const SECONDS_PER_DAY: u64 = 86_400;
const SECONDS_PER_HOUR: u64 = 3_600;

// --- Pool Configuration ---

/// Number of concurrent workers per phase pool. Values are clamped to
/// `MIN_POOL_WORKERS..=MAX_POOL_WORKERS` when applied.
///
/// Fields omitted from a deserialized payload keep the phase default, so a
/// client that only knows the metadata/thumbnail/sprites pools can still
/// round-trip the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
  pub metadata_workers: usize,
  pub thumbnail_workers: usize,
  pub sprites_workers: usize,
  pub animated_thumbnails_workers: usize,
  pub fingerprint_workers: usize,
  pub scan_workers: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      metadata_workers: Phase::Metadata.default_workers(),
      thumbnail_workers: Phase::Thumbnail.default_workers(),
      sprites_workers: Phase::Sprites.default_workers(),
      animated_thumbnails_workers: Phase::AnimatedThumbnails.default_workers(),
      fingerprint_workers: Phase::Fingerprint.default_workers(),
      scan_workers: Phase::Scan.default_workers(),
    }
  }
}

impl PoolConfig {
  pub fn workers_for(&self, phase: Phase) -> usize {
    match phase {
      Phase::Metadata => self.metadata_workers,
      Phase::Thumbnail => self.thumbnail_workers,
      Phase::Sprites => self.sprites_workers,
      Phase::AnimatedThumbnails => self.animated_thumbnails_workers,
      Phase::Fingerprint => self.fingerprint_workers,
      Phase::Scan => self.scan_workers,
    }
  }

  pub fn set_workers(&mut self, phase: Phase, workers: usize) {
    let slot = match phase {
      Phase::Metadata => &mut self.metadata_workers,
      Phase::Thumbnail => &mut self.thumbnail_workers,
      Phase::Sprites => &mut self.sprites_workers,
      Phase::AnimatedThumbnails => &mut self.animated_thumbnails_workers,
      Phase::Fingerprint => &mut self.fingerprint_workers,
      Phase::Scan => &mut self.scan_workers,
    };
    *slot = workers;
  }

  /// Copy with every pool size forced into the accepted range.
  pub fn clamped(mut self) -> Self {
    for phase in Phase::ALL {
      let workers = self
        .workers_for(phase)
        .clamp(MIN_POOL_WORKERS, MAX_POOL_WORKERS);
      self.set_workers(phase, workers);
    }
    self
  }
}

// --- Retention ---

/// How long terminal jobs are kept before being purged from the store.
/// Jobs referenced by a dead-letter entry are never purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
  pub keep_finished: Duration,
  /// How often the coordinator runs the purge.
  pub purge_interval: Duration,
}

impl Default for RetentionPolicy {
  fn default() -> Self {
    Self {
      keep_finished: Duration::from_secs(7 * SECONDS_PER_DAY),
      purge_interval: Duration::from_secs(SECONDS_PER_HOUR),
    }
  }
}

impl RetentionPolicy {
  pub fn new(keep_finished: Duration) -> Self {
    Self {
      keep_finished,
      ..Self::default()
    }
  }

  /// Human readable retention window, e.g. `"7 days"` or `"12 hours"`.
  pub fn describe(&self) -> String {
    let secs = self.keep_finished.as_secs();
    let (amount, unit) = if secs >= SECONDS_PER_DAY && secs % SECONDS_PER_DAY == 0 {
      (secs / SECONDS_PER_DAY, "day")
    } else if secs >= SECONDS_PER_HOUR && secs % SECONDS_PER_HOUR == 0 {
      (secs / SECONDS_PER_HOUR, "hour")
    } else if secs >= 60 && secs % 60 == 0 {
      (secs / 60, "minute")
    } else {
      (secs, "second")
    };
    if amount == 1 {
      format!("1 {}", unit)
    } else {
      format!("{} {}s", amount, unit)
    }
  }
}

// --- Phase Settings ---

/// Everything configurable about one phase apart from its pool size.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
  pub retry: RetryConfig,
  pub trigger: TriggerConfig,
  /// Maximum run duration of one attempt. `None` disables the limit.
  pub timeout: Option<Duration>,
}

impl PhaseSettings {
  pub fn defaults_for(phase: Phase) -> Self {
    Self {
      retry: phase.default_retry(),
      trigger: phase.default_trigger(),
      timeout: phase.default_timeout(),
    }
  }
}

/// Runtime-mutable configuration shared by the scheduler handle, the
/// coordinator and its workers.
///
/// Readers clone what they need out of the lock; a worker running on a
/// slightly stale copy is fine. Writers validate the whole update first and
/// then swap it in under a single write lock, so no partial update is visible.
#[derive(Debug)]
pub(crate) struct Settings {
  phases: RwLock<BTreeMap<Phase, PhaseSettings>>,
  pool: RwLock<PoolConfig>,
  retention: RetentionPolicy,
}

impl Settings {
  /// Validates a complete set of phase settings and wraps it.
  pub fn new(
    phases: BTreeMap<Phase, PhaseSettings>,
    pool: PoolConfig,
    retention: RetentionPolicy,
  ) -> Result<Self, ConfigError> {
    let mut complete = BTreeMap::new();
    for phase in Phase::ALL {
      let mut settings = phases
        .get(&phase)
        .cloned()
        .unwrap_or_else(|| PhaseSettings::defaults_for(phase));
      settings.retry.validate(phase)?;
      settings.trigger = settings.trigger.normalized();
      settings.trigger.validate()?;
      complete.insert(phase, settings);
    }
    validate_triggers(&complete)?;
    Ok(Self {
      phases: RwLock::new(complete),
      pool: RwLock::new(pool.clamped()),
      retention,
    })
  }

  pub fn phase(&self, phase: Phase) -> PhaseSettings {
    self
      .phases
      .read()
      .get(&phase)
      .cloned()
      .unwrap_or_else(|| PhaseSettings::defaults_for(phase))
  }

  pub fn retry(&self, phase: Phase) -> RetryConfig {
    self.phase(phase).retry
  }

  pub fn timeout(&self, phase: Phase) -> Option<Duration> {
    self.phase(phase).timeout
  }

  pub fn retry_configs(&self) -> Vec<PhaseRetryConfig> {
    self
      .phases
      .read()
      .iter()
      .map(|(phase, settings)| PhaseRetryConfig::new(*phase, settings.retry))
      .collect()
  }

  pub fn trigger_configs(&self) -> Vec<TriggerConfig> {
    self
      .phases
      .read()
      .values()
      .map(|settings| settings.trigger.clone())
      .collect()
  }

  pub fn pool(&self) -> PoolConfig {
    *self.pool.read()
  }

  pub fn workers_for(&self, phase: Phase) -> usize {
    self.pool.read().workers_for(phase)
  }

  pub fn retention(&self) -> RetentionPolicy {
    self.retention
  }

  /// Phases whose `after_job` trigger follows `completed`.
  pub fn dependents_of(&self, completed: Phase) -> Vec<Phase> {
    let phases = self.phases.read();
    let triggers: BTreeMap<Phase, TriggerConfig> = phases
      .iter()
      .map(|(phase, settings)| (*phase, settings.trigger.clone()))
      .collect();
    trigger::dependents_of(&triggers, completed)
  }

  /// Phases that fire when an entity is imported.
  pub fn import_phases(&self) -> Vec<Phase> {
    self
      .phases
      .read()
      .values()
      .filter(|settings| settings.trigger.trigger_type == TriggerType::OnImport)
      .map(|settings| settings.trigger.phase)
      .collect()
  }

  /// Parsed schedules of every `scheduled` phase.
  pub fn schedules(&self) -> Vec<(Phase, CronExpression)> {
    self
      .phases
      .read()
      .iter()
      .filter_map(|(phase, settings)| settings.trigger.schedule().map(|cron| (*phase, cron)))
      .collect()
  }

  /// Clamps and stores a new pool configuration, returning what was applied.
  pub fn apply_pool_config(&self, pool: PoolConfig) -> PoolConfig {
    let clamped = pool.clamped();
    if clamped != pool {
      warn!(requested = ?pool, applied = ?clamped, "Pool sizes clamped to accepted range.");
    }
    *self.pool.write() = clamped;
    info!(pool = ?clamped, "Pool configuration updated.");
    clamped
  }

  /// Validates every entry, then replaces the listed phases' retry configs.
  pub fn apply_retry_configs(&self, updates: &[PhaseRetryConfig]) -> Result<(), ConfigError> {
    ensure_unique(updates.iter().map(|u| u.phase))?;
    for update in updates {
      update.config.validate(update.phase)?;
    }
    let mut phases = self.phases.write();
    for update in updates {
      if let Some(settings) = phases.get_mut(&update.phase) {
        settings.retry = update.config;
      }
    }
    info!(phases = updates.len(), "Retry configuration updated.");
    Ok(())
  }

  /// Normalizes and validates every entry, checks the merged trigger graph,
  /// then replaces the listed phases' triggers.
  pub fn apply_trigger_configs(&self, updates: Vec<TriggerConfig>) -> Result<(), ConfigError> {
    ensure_unique(updates.iter().map(|u| u.phase))?;
    let normalized: Vec<TriggerConfig> = updates.into_iter().map(TriggerConfig::normalized).collect();
    for update in &normalized {
      update.validate()?;
    }

    let mut phases = self.phases.write();
    let mut merged = phases.clone();
    for update in &normalized {
      if let Some(settings) = merged.get_mut(&update.phase) {
        settings.trigger = update.clone();
      }
    }
    validate_triggers(&merged)?;
    *phases = merged;
    info!(phases = normalized.len(), "Trigger configuration updated.");
    Ok(())
  }
}

fn validate_triggers(phases: &BTreeMap<Phase, PhaseSettings>) -> Result<(), ConfigError> {
  let triggers: BTreeMap<Phase, TriggerConfig> = phases
    .iter()
    .map(|(phase, settings)| (*phase, settings.trigger.clone()))
    .collect();
  trigger::validate_trigger_graph(&triggers)
}

fn ensure_unique(phases: impl Iterator<Item = Phase>) -> Result<(), ConfigError> {
  let mut seen = HashSet::new();
  for phase in phases {
    if !seen.insert(phase) {
      return Err(ConfigError::DuplicatePhase(phase));
    }
  }
  Ok(())
}
