//! Shared constants.

use std::time::Duration;

/// Application name used for cache and config directories.
pub const APP_NAME: &str = "formwork";

/// Environment variable overriding the shared cache directory.
pub const CACHE_DIR_ENV: &str = "FORMWORK_CACHE_DIR";

/// Environment variable overriding the lock acquisition timeout, in seconds.
pub const LOCK_TIMEOUT_ENV: &str = "FORMWORK_LOCK_TIMEOUT_SECS";

/// Environment variable overriding executor parallelism.
pub const PARALLELISM_ENV: &str = "FORMWORK_PARALLELISM";

/// Prefix of every lock file in the cache tree.
pub const LOCK_FILE_PREFIX: &str = "_";

/// Suffix of every lock file in the cache tree.
pub const LOCK_FILE_SUFFIX: &str = ".lock";

/// Locks older than this are presumed orphaned by a crashed process.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Default time to wait for a contended lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default delay between lock acquisition attempts.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Length of the truncated hex digest used for cache keys.
pub const CACHE_KEY_LEN: usize = 20;

/// Marker file written into a cache entry once it is complete.
pub const CACHE_COMPLETE_MARKER: &str = ".formwork-complete";

/// The only recipe format version this runtime understands.
pub const RECIPE_VERSION: u32 = 1;
