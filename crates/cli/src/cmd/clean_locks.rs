use std::time::Instant;

use anyhow::Result;

use formwork_lib::config::RuntimeConfig;

use crate::output::{OutputFormat, format_duration, print_json, print_stat, print_success, print_warning};

/// Remove cache lock files older than the stale threshold that no live
/// process still holds, along with abandoned staging directories.
pub fn cmd_clean_locks(config: &RuntimeConfig, output: OutputFormat) -> Result<()> {
  let start = Instant::now();

  let report = config.cache_store().perform_maintenance();

  if output.is_json() {
    print_json(&report)?;
    return Ok(());
  }

  for warning in &report.warnings {
    print_warning(&format!("{}: {}", warning.path.display(), warning.message));
  }
  print_success("Lock maintenance complete");
  print_stat("Cache", &config.cache_dir.display().to_string());
  print_stat("Scanned", &report.scanned.to_string());
  print_stat("Removed", &report.removed.len().to_string());
  print_stat("Still held", &report.held.len().to_string());
  print_stat("Duration", &format_duration(start.elapsed()));

  Ok(())
}
