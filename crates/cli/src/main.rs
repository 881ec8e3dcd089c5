mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use updraft_lib::consts::DEFAULT_CODE_CACHE_RETENTION_DAYS;

use crate::cmd::update::UpdateArgs;
use crate::output::OutputFormat;

/// updraft - keeps an application install in step with its server
#[derive(Parser)]
#[command(name = "updraft")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Bring an install directory up to date
  Update {
    /// Install directory holding manifest.txt
    app_dir: PathBuf,

    /// Appbase to bootstrap from when the directory has no usable manifest
    #[arg(long)]
    appbase: Option<String>,

    /// File of trusted public keys; digests must be signed by one of them
    #[arg(long = "cert")]
    certs: Vec<PathBuf>,

    /// Wait before updating, e.g. "10m" (default: UPDRAFT_START_DELAY minutes)
    #[arg(long, value_parser = humantime::parse_duration)]
    delay: Option<Duration>,

    /// Skip contacting the server
    #[arg(long)]
    no_update: bool,

    /// Unpack archive resources again after a version change
    #[arg(long)]
    check_unpacked: bool,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Write (and optionally sign) digest files for a published directory
  Digest {
    /// Directory holding manifest.txt and its resources
    app_dir: PathBuf,

    /// Hex encoded ed25519 secret key to sign the digests with
    #[arg(long)]
    key: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },

  /// Remove cache entries unused within the retention period
  Gc {
    /// Code cache directory, usually <app_dir>/.cache
    cache_dir: PathBuf,

    /// Days an unused entry is kept
    #[arg(long, default_value_t = DEFAULT_CODE_CACHE_RETENTION_DAYS)]
    retention_days: u64,

    /// Collect native bundles instead of code resources
    #[arg(long)]
    native: bool,

    /// Show what would be removed without removing it
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long, value_enum, default_value_t)]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let level = if cli.verbose { "debug" } else { "info" };
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  match cli.command {
    Commands::Update {
      app_dir,
      appbase,
      certs,
      delay,
      no_update,
      check_unpacked,
      output,
    } => cmd::cmd_update(UpdateArgs {
      app_dir,
      appbase,
      certs,
      delay,
      no_update,
      check_unpacked,
      output,
    }),
    Commands::Digest { app_dir, key, output } => cmd::cmd_digest(&app_dir, key.as_deref(), output),
    Commands::Gc {
      cache_dir,
      retention_days,
      native,
      dry_run,
      output,
    } => cmd::cmd_gc(&cache_dir, retention_days, native, dry_run, output),
  }
}
