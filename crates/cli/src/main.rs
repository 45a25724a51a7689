mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use formwork_lib::config::RuntimeConfig;
use formwork_lib::util::hash::HashAlgorithm;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use output::OutputFormat;

/// formwork - plan build graphs and maintain the shared artifact cache
#[derive(Parser)]
#[command(name = "formwork")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short = 'o', long, global = true, value_enum, default_value = "text")]
  output: OutputFormat,

  /// Shared cache directory (overrides FORMWORK_CACHE_DIR)
  #[arg(long, global = true)]
  cache_dir: Option<PathBuf>,

  /// How long to wait for a busy cache lock (e.g. "30s", "10m")
  #[arg(long, global = true, value_parser = humantime::parse_duration)]
  lock_timeout: Option<Duration>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build a recipe's graph, apply its overrides and print the execution waves
  Plan {
    /// Path to the recipe JSON file
    recipe: PathBuf,

    /// Only plan what the named result needs (repeatable)
    #[arg(short, long = "result")]
    results: Vec<String>,
  },

  /// Print the effective classpath for a library list on this platform
  Classpath {
    /// Path to the library list JSON file
    libraries: PathBuf,

    /// Feature flags considered enabled when evaluating rules (repeatable)
    #[arg(long = "feature")]
    features: Vec<String>,

    /// Maven-layout directory to resolve artifact paths against
    #[arg(long)]
    libraries_dir: Option<PathBuf>,
  },

  /// Compute or verify the checksum of a file
  Hash {
    /// File to hash
    file: PathBuf,

    /// Hash algorithm (md5, sha1, sha256, sha512)
    #[arg(short, long, default_value = "sha1")]
    algorithm: HashAlgorithm,

    /// Expected checksum; fails if the file does not match
    #[arg(long)]
    expected: Option<String>,
  },

  /// Remove lock files abandoned by crashed processes
  CleanLocks,
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let mut config = RuntimeConfig::from_env().context("Invalid environment configuration")?;
  if let Some(dir) = cli.cache_dir {
    config.cache_dir = dir;
  }
  if let Some(timeout) = cli.lock_timeout {
    config.lock.timeout = timeout;
  }
  debug!(cache_dir = %config.cache_dir.display(), lock_timeout = ?config.lock.timeout, "runtime configuration");

  match cli.command {
    Commands::Plan { recipe, results } => cmd::cmd_plan(&recipe, &results, cli.verbose, cli.output),
    Commands::Classpath {
      libraries,
      features,
      libraries_dir,
    } => cmd::cmd_classpath(&libraries, features, libraries_dir.as_deref(), cli.output),
    Commands::Hash {
      file,
      algorithm,
      expected,
    } => cmd::cmd_hash(&file, algorithm, expected.as_deref(), cli.output),
    Commands::CleanLocks => cmd::cmd_clean_locks(&config, cli.output),
  }
}
