//! Status reporting for a running update.
//!
//! The updater never prints; it reports message keys (such as `m.validating`) and an overall
//! percentage to a [`StatusDisplay`]. Overall progress is split into [`Step`]s, each owning a
//! slice of the 0..=100 range.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::config::Config;

/// Sink for status messages and overall progress.
pub trait StatusDisplay: Send + Sync {
  /// Reports what the updater is doing, as a message key.
  fn update_status(&self, message: &str);

  /// Reports overall progress and, when known, the estimated time remaining.
  fn set_progress(&self, percent: u32, remaining: Option<Duration>);

  /// Reports a fatal error, as a message key. The run stops afterwards.
  fn fail(&self, message: &str);
}

/// Ignores all status updates.
pub struct NoStatus;

impl StatusDisplay for NoStatus {
  fn update_status(&self, _message: &str) {}
  fn set_progress(&self, _percent: u32, _remaining: Option<Duration>) {}
  fn fail(&self, _message: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
  UpdateRuntime,
  VerifyMetadata,
  Download,
  Patch,
  VerifyResources,
  RedownloadResources,
  Unpack,
  Launch,
}

impl Step {
  pub const ALL: [Step; 8] = [
    Step::UpdateRuntime,
    Step::VerifyMetadata,
    Step::Download,
    Step::Patch,
    Step::VerifyResources,
    Step::RedownloadResources,
    Step::Unpack,
    Step::Launch,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Step::UpdateRuntime => "UPDATE_RUNTIME",
      Step::VerifyMetadata => "VERIFY_METADATA",
      Step::Download => "DOWNLOAD",
      Step::Patch => "PATCH",
      Step::VerifyResources => "VERIFY_RESOURCES",
      Step::RedownloadResources => "REDOWNLOAD_RESOURCES",
      Step::Unpack => "UNPACK",
      Step::Launch => "LAUNCH",
    }
  }

  /// Global percentages at which this step ends, one per time it may run.
  pub fn default_percents(self) -> &'static [u32] {
    match self {
      Step::UpdateRuntime => &[10],
      Step::VerifyMetadata => &[15, 65, 95],
      Step::Download => &[40],
      Step::Patch => &[60],
      Step::VerifyResources => &[70, 97],
      Step::RedownloadResources => &[90],
      Step::Unpack => &[98],
      Step::Launch => &[99],
    }
  }
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Per-step percentages, with overrides from `ui.percents.<STEP>` manifest keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPercents {
  overrides: HashMap<Step, Vec<u32>>,
}

impl StepPercents {
  pub fn from_config(config: &Config) -> Self {
    let mut overrides = HashMap::new();
    for step in Step::ALL {
      let key = format!("ui.percents.{}", step.as_str());
      let values: Vec<u32> = config
        .list(&key)
        .iter()
        .filter_map(|v| v.parse().ok())
        .filter(|&v| v <= 100)
        .collect();
      if !values.is_empty() {
        overrides.insert(step, values);
      }
    }
    Self { overrides }
  }

  pub fn get(&self, step: Step) -> &[u32] {
    self
      .overrides
      .get(&step)
      .map(Vec::as_slice)
      .unwrap_or_else(|| step.default_percents())
  }
}

/// Maps progress within the current step onto the overall range.
///
/// Entering a step moves the window to end at the first of the step's percentages beyond the
/// current end. The overall percentage never decreases.
#[derive(Debug, Clone, Default)]
pub struct StepTracker {
  percents: StepPercents,
  step: Option<Step>,
  min: u32,
  max: u32,
  last: u32,
}

impl StepTracker {
  pub fn new(percents: StepPercents) -> Self {
    Self {
      percents,
      ..Self::default()
    }
  }

  pub fn set_percents(&mut self, percents: StepPercents) {
    self.percents = percents;
  }

  pub fn set_step(&mut self, step: Step) {
    self.step = Some(step);
    if let Some(&end) = self.percents.get(step).iter().find(|&&p| p > self.max) {
      self.min = self.max;
      self.max = end;
    }
  }

  pub fn step(&self) -> Option<Step> {
    self.step
  }

  /// Converts a percentage of the current step into an overall percentage.
  pub fn global(&mut self, percent: u32) -> u32 {
    let percent = percent.min(100);
    let value = self.min + percent * (self.max - self.min) / 100;
    self.last = self.last.max(value);
    self.last
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn steps_claim_successive_windows() {
    let mut tracker = StepTracker::default();
    tracker.set_step(Step::VerifyMetadata);
    assert_eq!(tracker.global(0), 0);
    assert_eq!(tracker.global(100), 15);

    tracker.set_step(Step::VerifyResources);
    assert_eq!(tracker.global(50), 42);
    assert_eq!(tracker.global(100), 70);

    tracker.set_step(Step::VerifyMetadata);
    assert_eq!(tracker.global(100), 95);

    tracker.set_step(Step::Launch);
    assert_eq!(tracker.global(100), 99);
  }

  #[test]
  fn global_percent_is_monotonic() {
    let mut tracker = StepTracker::default();
    tracker.set_step(Step::Download);
    assert_eq!(tracker.global(100), 40);
    assert_eq!(tracker.global(10), 40);
  }

  #[test]
  fn exhausted_step_keeps_last_window() {
    let mut tracker = StepTracker::default();
    tracker.set_step(Step::Launch);
    tracker.set_step(Step::Download);
    assert_eq!(tracker.step(), Some(Step::Download));
    assert_eq!(tracker.global(50), 49);
  }

  #[test]
  fn percents_overridden_from_config() {
    let config = Config::from_pairs([("ui.percents.DOWNLOAD", "20, 80"), ("ui.percents.PATCH", "bogus")]);
    let percents = StepPercents::from_config(&config);
    assert_eq!(percents.get(Step::Download), &[20, 80]);
    assert_eq!(percents.get(Step::Patch), &[60]);
  }
}
