use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::trigger::TriggerConfig;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A named stage of media processing. Each phase owns a worker pool, a retry
/// policy, a trigger policy and an optional run timeout.
///
/// The set is closed: transition and trigger logic match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Phase {
  /// Probe the media file for container/stream metadata.
  Metadata,
  /// Extract a poster thumbnail.
  Thumbnail,
  /// Build the seek-preview sprite sheet.
  Sprites,
  /// Render short animated preview clips.
  AnimatedThumbnails,
  /// Compute a perceptual fingerprint.
  Fingerprint,
  /// Walk a library root and import new entities.
  Scan,
}

impl Phase {
  /// Every registered phase, in pipeline order.
  pub const ALL: [Phase; 6] = [
    Phase::Metadata,
    Phase::Thumbnail,
    Phase::Sprites,
    Phase::AnimatedThumbnails,
    Phase::Fingerprint,
    Phase::Scan,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Phase::Metadata => "metadata",
      Phase::Thumbnail => "thumbnail",
      Phase::Sprites => "sprites",
      Phase::AnimatedThumbnails => "animated_thumbnails",
      Phase::Fingerprint => "fingerprint",
      Phase::Scan => "scan",
    }
  }

  /// Name of the event published when a job of this phase completes,
  /// e.g. `thumbnail_complete`.
  pub fn completion_event(&self) -> String {
    format!("{}_complete", self.as_str())
  }

  /// Whether jobs of this phase act on a single imported entity.
  /// Only per-target phases may use the `on_import` trigger.
  pub fn is_per_target(&self) -> bool {
    !matches!(self, Phase::Scan)
  }

  /// Trigger policy applied when the builder is not given one.
  ///
  /// Metadata runs on import, thumbnails follow metadata; everything else is
  /// manual until configured otherwise.
  pub fn default_trigger(&self) -> TriggerConfig {
    match self {
      Phase::Metadata => TriggerConfig::on_import(*self),
      Phase::Thumbnail => TriggerConfig::after_job(*self, Phase::Metadata),
      Phase::Sprites | Phase::AnimatedThumbnails | Phase::Fingerprint | Phase::Scan => {
        TriggerConfig::manual(*self)
      }
    }
  }

  /// Retry policy applied when the builder is not given one.
  pub fn default_retry(&self) -> RetryConfig {
    match self {
      Phase::Scan => RetryConfig::new(1, 60, 600, 2.0),
      _ => RetryConfig::new(3, 30, 3_600, 2.0),
    }
  }

  /// Maximum run duration applied when the builder is not given one.
  pub fn default_timeout(&self) -> Option<Duration> {
    let minutes = match self {
      Phase::Metadata | Phase::Thumbnail => 10,
      Phase::Sprites | Phase::AnimatedThumbnails | Phase::Fingerprint => 30,
      Phase::Scan => 120,
    };
    Some(Duration::from_secs(minutes * 60))
  }

  /// Default number of concurrent workers in this phase's pool.
  pub fn default_workers(&self) -> usize {
    match self {
      Phase::Metadata | Phase::Thumbnail => 2,
      _ => 1,
    }
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Phase {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Phase::ALL
      .iter()
      .copied()
      .find(|phase| phase.as_str() == s.trim())
      .ok_or_else(|| ConfigError::UnknownPhase(s.to_string()))
  }
}
