//! Runtime configuration assembled from the environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheStore;
use crate::classpath::ClasspathItem;
use crate::consts::{LOCK_TIMEOUT_ENV, PARALLELISM_ENV};
use crate::execute::ExecuteConfig;
use crate::execute::types::num_cpus;
use crate::lock::{LockConfig, LockManager};
use crate::platform::paths::cache_dir;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("invalid value `{value}` for {name}: expected a non-negative integer")]
  InvalidEnv { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
  /// Root of the shared cache.
  pub cache_dir: PathBuf,
  pub lock: LockConfig,
  /// Maximum number of steps run at once.
  pub parallelism: usize,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      cache_dir: cache_dir(),
      lock: LockConfig::default(),
      parallelism: num_cpus(),
    }
  }
}

impl RuntimeConfig {
  /// Defaults, overridden by `FORMWORK_*` environment variables.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(secs) = env_number(LOCK_TIMEOUT_ENV)? {
      config.lock.timeout = Duration::from_secs(secs);
    }
    if let Some(parallelism) = env_number(PARALLELISM_ENV)? {
      config.parallelism = usize::try_from(parallelism).unwrap_or(usize::MAX).max(1);
    }

    Ok(config)
  }

  pub fn lock_manager(&self) -> LockManager {
    LockManager::new(&self.cache_dir, self.lock)
  }

  pub fn cache_store(&self) -> CacheStore {
    CacheStore::new(self.lock_manager())
  }

  pub fn execute_config(&self, classpath: Vec<ClasspathItem>) -> ExecuteConfig {
    ExecuteConfig {
      parallelism: self.parallelism,
      classpath: Arc::new(classpath),
      ..ExecuteConfig::default()
    }
  }
}

fn env_number(name: &'static str) -> Result<Option<u64>, ConfigError> {
  match std::env::var(name) {
    Ok(value) if value.trim().is_empty() => Ok(None),
    Ok(value) => value
      .trim()
      .parse()
      .map(Some)
      .map_err(|_| ConfigError::InvalidEnv { name, value }),
    Err(_) => Ok(None),
  }
}
