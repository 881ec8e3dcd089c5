//! Implementation of the `updraft update` command.
//!
//! Brings an install directory up to date with its appbase and reports what changed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use updraft_lib::app::Application;
use updraft_lib::env::{self, EnvConfig};
use updraft_lib::net::HttpConnector;
use updraft_lib::signature::CertificateSet;
use updraft_lib::update::{UpdateOptions, Updater};

use crate::output::{OutputFormat, TerminalStatus, format_duration, print_info, print_json, print_stat, print_success};

pub struct UpdateArgs {
  pub app_dir: PathBuf,
  pub appbase: Option<String>,
  pub certs: Vec<PathBuf>,
  pub delay: Option<Duration>,
  pub no_update: bool,
  pub check_unpacked: bool,
  pub output: OutputFormat,
}

/// The delay asked for on the command line, else the one from the environment.
fn start_delay(requested: Option<Duration>) -> Duration {
  requested.unwrap_or_else(env::start_delay)
}

/// Execute the update command.
///
/// # Errors
///
/// Returns an error if a certificate cannot be loaded or the update fails.
pub fn cmd_update(args: UpdateArgs) -> Result<()> {
  let start = Instant::now();

  let certs = CertificateSet::load(&args.certs).context("Failed to load certificates")?;
  let mut env_config = EnvConfig::new(&args.app_dir).with_certs(certs);
  if let Some(appbase) = args.appbase {
    env_config = env_config.with_app_base(appbase);
  }
  let app = Application::new(env_config, Arc::new(HttpConnector::new()));

  let options = UpdateOptions {
    start_delay: start_delay(args.delay),
    no_update: args.no_update,
    check_unpacked: args.check_unpacked,
    command: format!("updraft update {}", args.app_dir.display()),
  };
  let status = Arc::new(TerminalStatus::new(args.output));
  let updater = Updater::new(app).with_status(status).with_options(options);

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let outcome = rt.block_on(updater.run()).context("Update failed")?;

  if args.output.is_json() {
    print_json(&outcome)?;
  } else {
    println!();
    if outcome.skipped_update {
      print_info("Updates disabled - install left as is");
    } else {
      print_success("Application is up to date!");
    }
    print_stat("Version", &outcome.version.to_string());
    print_stat("Passes", &outcome.passes.to_string());
    print_stat("Already valid", &outcome.already_valid.to_string());
    print_stat("Downloaded", &outcome.downloaded.to_string());
    print_stat("Installed", &outcome.installed.to_string());
    if !outcome.cleaned.is_empty() {
      print_stat("Cleaned up", &outcome.cleaned.len().to_string());
    }
    if !outcome.cached_code.is_empty() {
      print_stat("Cached", &outcome.cached_code.len().to_string());
    }
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn delay_falls_back_to_environment_minutes() {
    temp_env::with_var(env::START_DELAY_ENV, Some("2"), || {
      assert_eq!(start_delay(None), Duration::from_secs(120));
      assert_eq!(start_delay(Some(Duration::from_secs(5))), Duration::from_secs(5));
    });
  }

  #[test]
  #[serial]
  fn no_delay_by_default() {
    temp_env::with_var_unset(env::START_DELAY_ENV, || {
      assert_eq!(start_delay(None), Duration::ZERO);
    });
  }
}
