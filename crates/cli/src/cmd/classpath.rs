use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use formwork_lib::classpath::{LibraryManifest, LibrarySource};
use formwork_lib::platform::Platform;

use crate::output::{OutputFormat, print_detail, print_json, print_stat, print_success};

#[derive(Serialize)]
struct ClasspathEntry {
  coordinate: String,
  source: LibrarySource,
  #[serde(skip_serializing_if = "Option::is_none")]
  path: Option<String>,
}

#[derive(Serialize)]
struct ClasspathOutput {
  platform: String,
  entries: Vec<ClasspathEntry>,
}

/// Resolve a library list against the current platform and print the
/// effective classpath, later explicit libraries overriding platform ones.
pub fn cmd_classpath(
  path: &Path,
  features: Vec<String>,
  libraries_dir: Option<&Path>,
  output: OutputFormat,
) -> Result<()> {
  let manifest = LibraryManifest::load(path).with_context(|| format!("Failed to load libraries {}", path.display()))?;
  let platform = Platform::current().context("Unsupported platform")?;
  let features: BTreeSet<String> = features.into_iter().collect();

  let classpath = manifest.resolve(&platform, &features);

  let entries: Vec<ClasspathEntry> = classpath
    .iter()
    .map(|item| ClasspathEntry {
      coordinate: item.coordinate.to_string(),
      source: item.source,
      path: libraries_dir.map(|dir| dir.join(item.coordinate.relative_path()).display().to_string()),
    })
    .collect();

  let result = ClasspathOutput {
    platform: platform.triple(),
    entries,
  };

  if output.is_json() {
    print_json(&result)?;
    return Ok(());
  }

  for entry in &result.entries {
    println!("  {} [{}]", entry.coordinate, entry.source);
    if let Some(path) = &entry.path {
      print_detail(path);
    }
  }
  println!();
  print_success(&format!("Resolved {} classpath entries", result.entries.len()));
  print_stat("Platform", &result.platform);

  Ok(())
}
