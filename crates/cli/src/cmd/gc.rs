use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use updraft_lib::gc::{collect, collect_native};

use crate::output::{OutputFormat, format_bytes, format_duration, print_info, print_json, print_stat, print_success};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

pub fn cmd_gc(cache_dir: &Path, retention_days: u64, native: bool, dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let retention = DAY * retention_days as u32;

  let result = if native {
    collect_native(cache_dir, retention, dry_run)
  } else {
    collect(cache_dir, retention, dry_run)
  }
  .with_context(|| format!("Failed to collect {}", cache_dir.display()))?;

  if output.is_json() {
    print_json(&result)?;
  } else {
    println!();
    if dry_run {
      print_info("Dry run - no changes made");
    } else {
      print_success("Garbage collection complete!");
    }
    print_stat("Entries scanned", &result.stats.files_scanned.to_string());
    print_stat("Entries removed", &result.stats.total_deleted().to_string());
    if native {
      print_stat("Bundles removed", &result.stats.bundles_deleted.to_string());
    }
    print_stat("Space freed", &format_bytes(result.stats.bytes_freed));
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(())
}
