//! Terminal rendering for `updraft`.
//!
//! Status keys and a coarse progress bar for a running update, summary lines for the finished
//! command, and JSON for `-o json`. Anything shown while an update runs goes to stderr, so JSON
//! on stdout stays parseable.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};
use tracing::debug;

use updraft_lib::status::StatusDisplay;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

const OK: &str = "✓";
const FAILED: &str = "✗";
const CAUTION: &str = "⚠";
const NOTE: &str = "•";

const BAR_WIDTH: usize = 20;

/// Progress is redrawn once it has advanced by this many percent.
const PROGRESS_STEP: u32 = 10;

/// Size in binary units, one decimal above plain bytes.
pub fn format_bytes(bytes: u64) -> String {
  const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

  if bytes < 1024 {
    return format!("{bytes} B");
  }
  let mut value = bytes as f64 / 1024.0;
  let mut unit = 0;
  while value >= 1024.0 && unit + 1 < UNITS.len() {
    value /= 1024.0;
    unit += 1;
  }
  format!("{value:.1} {}", UNITS[unit])
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  match secs {
    0 => format!("{}ms", duration.subsec_millis()),
    1..60 => format!("{:.1}s", duration.as_secs_f64()),
    60..3600 => format!("{}m {}s", secs / 60, secs % 60),
    _ => format!("{}h {}m", secs / 3600, secs % 3600 / 60),
  }
}

/// `[#####---------------]  25%`, followed by the time left when the updater estimated one.
pub fn format_progress(percent: u32, remaining: Option<Duration>) -> String {
  let percent = percent.min(100);
  let filled = BAR_WIDTH * percent as usize / 100;
  let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));
  match remaining {
    Some(left) => format!("[{bar}] {percent:>3}% ({} left)", format_duration(left)),
    None => format!("[{bar}] {percent:>3}%"),
  }
}

pub fn print_success(message: &str) {
  println!("{} {message}", OK.if_supports_color(Stream::Stdout, |s| s.green()));
}

pub fn print_info(message: &str) {
  println!("{} {message}", NOTE.if_supports_color(Stream::Stdout, |s| s.blue()));
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    CAUTION.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    FAILED.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{json}");
  Ok(())
}

#[derive(Default)]
struct Shown {
  message: String,
  percent: Option<u32>,
}

/// [`StatusDisplay`] for the terminal.
///
/// A status key is printed when it changes, progress every [`PROGRESS_STEP`] percent and once
/// more at 100. Failures are always printed; with JSON output nothing else is.
pub struct TerminalStatus {
  quiet: bool,
  shown: Mutex<Shown>,
}

impl TerminalStatus {
  pub fn new(format: OutputFormat) -> Self {
    Self {
      quiet: format.is_json(),
      shown: Mutex::default(),
    }
  }

  fn status_changed(&self, message: &str) -> bool {
    let mut shown = self.shown.lock().unwrap_or_else(|p| p.into_inner());
    if shown.message == message {
      return false;
    }
    shown.message = message.to_string();
    true
  }

  /// The progress line to draw for `percent`, if it moved far enough since the last one.
  fn progress_line(&self, percent: u32, remaining: Option<Duration>) -> Option<String> {
    let mut shown = self.shown.lock().unwrap_or_else(|p| p.into_inner());
    let due = match shown.percent {
      None => true,
      Some(last) => percent >= last + PROGRESS_STEP || (percent >= 100 && last < 100),
    };
    if !due {
      return None;
    }
    shown.percent = Some(percent);
    Some(format_progress(percent, remaining))
  }
}

impl StatusDisplay for TerminalStatus {
  fn update_status(&self, message: &str) {
    if self.status_changed(message) && !self.quiet {
      eprintln!("{} {message}", NOTE.if_supports_color(Stream::Stderr, |s| s.blue()));
    }
  }

  fn set_progress(&self, percent: u32, remaining: Option<Duration>) {
    debug!(percent, ?remaining, "progress");
    if let Some(line) = self.progress_line(percent, remaining)
      && !self.quiet
    {
      eprintln!("  {}", line.if_supports_color(Stream::Stderr, |s| s.dimmed()));
    }
  }

  fn fail(&self, message: &str) {
    print_error(message);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tracing_test::traced_test;

  #[test]
  fn bytes_use_binary_units() {
    assert_eq!(format_bytes(0), "0 B");
    assert_eq!(format_bytes(1023), "1023 B");
    assert_eq!(format_bytes(1536), "1.5 KB");
    assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
  }

  #[test]
  fn durations_scale_with_length() {
    assert_eq!(format_duration(Duration::from_millis(40)), "40ms");
    assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
    assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 120)), "3h 2m");
  }

  #[test]
  fn progress_bar_fills_with_percent() {
    assert_eq!(format_progress(0, None), "[--------------------]   0%");
    assert_eq!(format_progress(25, None), "[#####---------------]  25%");
    assert_eq!(
      format_progress(150, Some(Duration::from_secs(90))),
      "[####################] 100% (1m 30s left)"
    );
  }

  #[test]
  fn progress_is_drawn_in_steps() {
    let status = TerminalStatus::new(OutputFormat::Text);
    assert!(status.progress_line(0, None).is_some());
    assert!(status.progress_line(5, None).is_none());
    assert!(status.progress_line(12, None).is_some());
    assert!(status.progress_line(21, None).is_none());
    assert!(status.progress_line(100, None).is_some());
    assert!(status.progress_line(100, None).is_none());
  }

  #[test]
  fn repeated_status_is_shown_once() {
    let status = TerminalStatus::new(OutputFormat::Text);
    assert!(status.status_changed("m.validating"));
    assert!(!status.status_changed("m.validating"));
    assert!(status.status_changed("m.downloading"));
    assert!(status.status_changed("m.validating"));
  }

  #[test]
  #[traced_test]
  fn quiet_status_still_logs_progress() {
    let status = TerminalStatus::new(OutputFormat::Json);
    status.set_progress(42, None);
    assert!(logs_contain("progress"));
    assert!(logs_contain("percent=42"));
  }
}
