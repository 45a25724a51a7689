use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use formwork_lib::util::hash::{HashAlgorithm, hash_file};

use crate::output::{OutputFormat, print_error, print_json, print_stat, print_success};

#[derive(Serialize)]
struct HashOutput {
  path: String,
  algorithm: HashAlgorithm,
  hash: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  matches: Option<bool>,
}

pub fn cmd_hash(path: &Path, algorithm: HashAlgorithm, expected: Option<&str>, output: OutputFormat) -> Result<()> {
  let hash = hash_file(algorithm, path).with_context(|| format!("Failed to hash {}", path.display()))?;
  let matches = expected.map(|expected| hash.matches(expected));

  let result = HashOutput {
    path: path.display().to_string(),
    algorithm,
    hash: hash.to_string(),
    matches,
  };

  if output.is_json() {
    print_json(&result)?;
  } else {
    match matches {
      Some(true) => print_success(&format!("{} matches", result.path)),
      Some(false) => print_error(&format!("{} does not match", result.path)),
      None => println!("{}  {}", result.hash, result.path),
    }
    if matches.is_some() {
      print_stat(algorithm.as_str(), &result.hash);
    }
  }

  if matches == Some(false) {
    bail!("{} checksum mismatch for {}", algorithm, path.display());
  }
  Ok(())
}
