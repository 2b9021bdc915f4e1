use crate::error::ConfigError;
use crate::phase::Phase;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;

/// When jobs for a phase are created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TriggerType {
  /// Synchronously when the owning entity is imported.
  OnImport,
  /// When a job of `after_phase` completes for the same target.
  AfterJob,
  /// Only on explicit single-target or bulk requests.
  Manual,
  /// On every match of `cron_expression`, as a `missing`-mode bulk submission.
  Scheduled,
}

impl TriggerType {
  pub fn as_str(&self) -> &'static str {
    match self {
      TriggerType::OnImport => "on_import",
      TriggerType::AfterJob => "after_job",
      TriggerType::Manual => "manual",
      TriggerType::Scheduled => "scheduled",
    }
  }
}

impl fmt::Display for TriggerType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TriggerType {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim() {
      "on_import" => Ok(TriggerType::OnImport),
      "after_job" => Ok(TriggerType::AfterJob),
      "manual" => Ok(TriggerType::Manual),
      "scheduled" => Ok(TriggerType::Scheduled),
      other => Err(ConfigError::UnknownTriggerType(other.to_string())),
    }
  }
}

/// Trigger policy for one phase.
///
/// `after_phase` is meaningful only for [`TriggerType::AfterJob`] and
/// `cron_expression` only for [`TriggerType::Scheduled`]; [`TriggerConfig::normalized`]
/// clears whichever does not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TriggerConfig {
  pub phase: Phase,
  pub trigger_type: TriggerType,
  #[cfg_attr(feature = "serde", serde(default))]
  pub after_phase: Option<Phase>,
  #[cfg_attr(feature = "serde", serde(default))]
  pub cron_expression: Option<String>,
}

impl TriggerConfig {
  pub fn on_import(phase: Phase) -> Self {
    Self::bare(phase, TriggerType::OnImport)
  }

  pub fn after_job(phase: Phase, after_phase: Phase) -> Self {
    Self {
      after_phase: Some(after_phase),
      ..Self::bare(phase, TriggerType::AfterJob)
    }
  }

  pub fn manual(phase: Phase) -> Self {
    Self::bare(phase, TriggerType::Manual)
  }

  pub fn scheduled(phase: Phase, cron_expression: &str) -> Self {
    Self {
      cron_expression: Some(cron_expression.to_string()),
      ..Self::bare(phase, TriggerType::Scheduled)
    }
  }

  fn bare(phase: Phase, trigger_type: TriggerType) -> Self {
    Self {
      phase,
      trigger_type,
      after_phase: None,
      cron_expression: None,
    }
  }

  /// Builds a config from loosely typed input (e.g. a form or query string),
  /// rejecting unknown phase names and trigger types.
  pub fn parse(
    phase: &str,
    trigger_type: &str,
    after_phase: Option<&str>,
    cron_expression: Option<&str>,
  ) -> Result<Self, ConfigError> {
    Ok(Self {
      phase: phase.parse()?,
      trigger_type: trigger_type.parse()?,
      after_phase: after_phase.map(str::parse).transpose()?,
      cron_expression: cron_expression.map(str::to_string),
    })
  }

  /// Clears the fields that do not apply to `trigger_type`.
  pub fn normalized(mut self) -> Self {
    match self.trigger_type {
      TriggerType::AfterJob => self.cron_expression = None,
      TriggerType::Scheduled => self.after_phase = None,
      TriggerType::OnImport | TriggerType::Manual => {
        self.after_phase = None;
        self.cron_expression = None;
      }
    }
    self
  }

  /// Validates this config in isolation. Dependency cycles across phases are
  /// checked by [`validate_trigger_graph`].
  pub fn validate(&self) -> Result<(), ConfigError> {
    match self.trigger_type {
      TriggerType::OnImport if !self.phase.is_per_target() => {
        Err(ConfigError::ImportTriggerUnsupported(self.phase))
      }
      TriggerType::AfterJob => match self.after_phase {
        None => Err(ConfigError::MissingAfterPhase(self.phase)),
        Some(after) if after == self.phase => Err(ConfigError::SelfDependency(self.phase)),
        Some(_) => Ok(()),
      },
      TriggerType::Scheduled => match self.cron_expression.as_deref() {
        None => Err(ConfigError::MissingCronExpression(self.phase)),
        Some(expression) => CronExpression::parse(expression)
          .map(|_| ())
          .map_err(|reason| ConfigError::InvalidCron {
            phase: self.phase,
            expression: expression.to_string(),
            reason,
          }),
      },
      TriggerType::OnImport | TriggerType::Manual => Ok(()),
    }
  }

  /// The parsed schedule, when this is a valid `scheduled` trigger.
  pub fn schedule(&self) -> Option<CronExpression> {
    match (self.trigger_type, self.cron_expression.as_deref()) {
      (TriggerType::Scheduled, Some(expression)) => CronExpression::parse(expression).ok(),
      _ => None,
    }
  }
}

/// Rejects `after_job` chains that loop back onto themselves.
///
/// Every phase has at most one `after_phase`, so following the chain from each
/// phase either terminates or revisits a phase.
pub fn validate_trigger_graph(configs: &BTreeMap<Phase, TriggerConfig>) -> Result<(), ConfigError> {
  for start in configs.keys() {
    let mut seen = HashSet::new();
    let mut current = *start;
    while let Some(config) = configs.get(&current) {
      if !seen.insert(current) {
        return Err(ConfigError::DependencyCycle(*start));
      }
      match (config.trigger_type, config.after_phase) {
        (TriggerType::AfterJob, Some(next)) => current = next,
        _ => break,
      }
    }
  }
  Ok(())
}

/// Phases configured to run after `completed` finishes, in phase order.
pub fn dependents_of(configs: &BTreeMap<Phase, TriggerConfig>, completed: Phase) -> Vec<Phase> {
  configs
    .values()
    .filter(|c| c.trigger_type == TriggerType::AfterJob && c.after_phase == Some(completed))
    .map(|c| c.phase)
    .collect()
}

/// A standard 5-field cron expression (`minute hour day month weekday`),
/// evaluated in UTC.
///
/// Weekdays use the usual numbering (0 or 7 = Sunday, 6 = Saturday) and also
/// accept names such as `MON-FRI`. When both the day-of-month and weekday
/// fields are restricted, a time matching either one fires, as in classic
/// cron: `0 0 13 * 5` runs on every 13th and on every Friday.
#[derive(Clone)]
pub struct CronExpression {
  source: String,
  // One schedule, or two when day-of-month and weekday match independently.
  schedules: Vec<CronSchedule>,
}

impl CronExpression {
  /// Parses a 5-field expression. The error is a human readable reason.
  pub fn parse(expression: &str) -> Result<Self, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
      return Err(format!("expected 5 fields, found {}", fields.len()));
    }
    let (minute, hour, day, month) = (fields[0], fields[1], fields[2], fields[3]);
    let weekday = expand_weekday_field(fields[4])?;

    let day_restricted = !day.starts_with('*');
    let weekday_restricted = !fields[4].starts_with('*');
    let variants = if day_restricted && weekday_restricted {
      vec![(day, "*".to_string()), ("*", weekday)]
    } else {
      vec![(day, weekday)]
    };

    let schedules = variants
      .into_iter()
      .map(|(day, weekday)| {
        // The cron crate wants a leading seconds field.
        let extended = format!("0 {} {} {} {} {}", minute, hour, day, month, weekday);
        CronSchedule::from_str(&extended).map_err(|e| e.to_string())
      })
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self {
      source: expression.trim().to_string(),
      schedules,
    })
  }

  /// The first fire time strictly after `after`.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self
      .schedules
      .iter()
      .filter_map(|schedule| schedule.after(&after).next())
      .min()
  }

  pub fn as_str(&self) -> &str {
    &self.source
  }
}

impl fmt::Debug for CronExpression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("CronExpression").field(&self.source).finish()
  }
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Expands a weekday field into the explicit day list the cron crate reads
/// (Sunday = 1 .. Saturday = 7). `*` passes through unchanged.
///
/// Steps are applied in 0-7 numbering before 7 folds onto Sunday, so `1-7/2`
/// is Monday, Wednesday, Friday and Sunday.
fn expand_weekday_field(field: &str) -> Result<String, String> {
  if field == "*" {
    return Ok(field.to_string());
  }
  let mut days = BTreeSet::new();
  for item in field.split(',') {
    let (range, step) = match item.split_once('/') {
      Some((range, step)) => {
        let step = step
          .parse::<u8>()
          .ok()
          .filter(|step| *step > 0)
          .ok_or_else(|| format!("invalid weekday step `{}`", step))?;
        (range, step)
      }
      None => (item, 1),
    };
    let (start, end) = match range {
      "*" => (0, 6),
      _ => match range.split_once('-') {
        Some((start, end)) => (weekday_number(start)?, weekday_number(end)?),
        // `5/2` runs from Friday to the end of the week.
        None if step > 1 => (weekday_number(range)?, 7),
        None => {
          let day = weekday_number(range)?;
          (day, day)
        }
      },
    };
    if start > end {
      return Err(format!("weekday range `{}` runs backwards", range));
    }
    for day in (start..=end).step_by(usize::from(step)) {
      days.insert(day % 7);
    }
  }
  let days: Vec<String> = days.into_iter().map(|day| (day + 1).to_string()).collect();
  Ok(days.join(","))
}

/// A weekday token as 0-7 with Sunday = 0 (or 7).
fn weekday_number(token: &str) -> Result<u8, String> {
  let token = token.trim();
  match token.parse::<u8>() {
    Ok(n @ 0..=7) => Ok(n),
    Ok(n) => Err(format!("weekday {} out of range 0-7", n)),
    Err(_) => WEEKDAY_NAMES
      .iter()
      .position(|name| name.eq_ignore_ascii_case(token))
      .map(|index| index as u8)
      .ok_or_else(|| format!("unknown weekday `{}`", token)),
  }
}
