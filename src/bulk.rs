use crate::error::{CatalogError, ConfigError};
use crate::job::TargetId;
use crate::phase::Phase;

use std::fmt;
use std::str::FromStr;

/// Which targets a bulk submission covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum BulkMode {
  /// Only targets that never completed the phase.
  #[default]
  Missing,
  /// Every target, regenerating existing output.
  All,
}

impl BulkMode {
  pub fn as_str(&self) -> &'static str {
    match self {
      BulkMode::Missing => "missing",
      BulkMode::All => "all",
    }
  }
}

impl fmt::Display for BulkMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for BulkMode {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "missing" => Ok(BulkMode::Missing),
      "all" => Ok(BulkMode::All),
      other => Err(ConfigError::UnknownBulkMode(other.to_string())),
    }
  }
}

/// Tally of a bulk submission. Per-target failures land in `errors` and do
/// not stop the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BulkResult {
  pub submitted: usize,
  pub skipped: usize,
  pub errors: usize,
}

/// Enumerates the entities a phase can run on.
///
/// Implemented by the embedding application (e.g. a query over its scene
/// table). `targets` runs on tokio's blocking pool, so it may do synchronous
/// I/O. Plain closures work too:
///
/// ```ignore
/// let catalog = |_phase: Phase| -> Result<Vec<TargetId>, CatalogError> {
///   Ok(vec![TargetId::from("scene-1")])
/// };
/// ```
pub trait TargetCatalog: Send + Sync + 'static {
  fn targets(&self, phase: Phase) -> Result<Vec<TargetId>, CatalogError>;
}

impl<F> TargetCatalog for F
where
  F: Fn(Phase) -> Result<Vec<TargetId>, CatalogError> + Send + Sync + 'static,
{
  fn targets(&self, phase: Phase) -> Result<Vec<TargetId>, CatalogError> {
    self(phase)
  }
}
