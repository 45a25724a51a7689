//! Cross-process locks over entries of the shared cache directory.
//!
//! A lock for key `a/b/c` is the file `<root>/a/b/_c.lock`, held with an OS
//! advisory exclusive lock (`flock` on Unix, `LockFileEx` on Windows) for as
//! long as the [`CacheLock`] handle lives. The file's presence alone means
//! nothing: a crashed holder leaves the file behind but releases the OS lock.
//! [`LockManager::perform_maintenance`] reclaims such leftovers once they are
//! older than the staleness threshold.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::{
  DEFAULT_LOCK_POLL_INTERVAL, DEFAULT_LOCK_TIMEOUT, LOCK_FILE_PREFIX, LOCK_FILE_SUFFIX, STALE_LOCK_AGE,
};

const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMetadata {
  pub version: u32,
  pub pid: u32,
  pub started_at_unix: u64,
  pub key: String,
}

fn describe_holder(holder: &Option<LockMetadata>) -> String {
  match holder {
    Some(meta) => format!(
      "held by PID {} since Unix timestamp {}",
      meta.pid, meta.started_at_unix
    ),
    None => "holder unknown".to_string(),
  }
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("invalid lock key `{0}`")]
  InvalidKey(String),

  #[error("failed to create lock directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open lock file {path}: {source}")]
  OpenFile {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock {path}: {source}")]
  LockFailed {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write lock metadata to {path}: {source}")]
  WriteMetadata {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(
    "cache entry `{key}` is busy: gave up after {waited:?} ({})\n\
     If you're sure no other process is running, remove the lock file:\n  {}",
    describe_holder(.holder),
    .path.display()
  )]
  Timeout {
    key: String,
    path: PathBuf,
    waited: Duration,
    holder: Option<LockMetadata>,
  },
}

impl LockError {
  /// Contention may clear up; everything else will fail the same way again.
  pub fn is_retryable(&self) -> bool {
    matches!(self, LockError::Timeout { .. })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
  /// How long [`LockManager::acquire`] waits for a busy lock.
  pub timeout: Duration,
  pub poll_interval: Duration,
  /// Minimum age before maintenance deletes an abandoned lock file.
  pub stale_after: Duration,
}

impl Default for LockConfig {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_LOCK_TIMEOUT,
      poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
      stale_after: STALE_LOCK_AGE,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceWarning {
  pub path: PathBuf,
  pub message: String,
}

/// Outcome of a stale-lock sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
  /// Lock-named files examined.
  pub scanned: usize,
  pub removed: Vec<PathBuf>,
  /// Stale-aged lock files left alone because a live process holds them.
  pub held: Vec<PathBuf>,
  pub warnings: Vec<MaintenanceWarning>,
}

enum Attempt {
  Acquired(CacheLock),
  Busy,
  /// Locked a file that was unlinked in the meantime.
  Unlinked,
}

#[derive(Debug, Clone)]
pub struct LockManager {
  root: PathBuf,
  config: LockConfig,
}

impl LockManager {
  pub fn new(root: impl Into<PathBuf>, config: LockConfig) -> Self {
    Self {
      root: root.into(),
      config,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn config(&self) -> &LockConfig {
    &self.config
  }

  /// Where the lock file for `key` lives.
  ///
  /// Keys are `/`-separated; empty, `.` and `..` segments are rejected.
  pub fn lock_path(&self, key: &str) -> Result<PathBuf, LockError> {
    let segments: Vec<&str> = key.split('/').collect();
    let valid = segments
      .iter()
      .all(|s| !s.is_empty() && *s != "." && *s != ".." && !s.contains(['\\', ':']));
    let Some((last, parents)) = segments.split_last().filter(|_| valid) else {
      return Err(LockError::InvalidKey(key.to_string()));
    };

    let mut path = self.root.clone();
    path.extend(parents);
    path.push(format!("{LOCK_FILE_PREFIX}{last}{LOCK_FILE_SUFFIX}"));
    Ok(path)
  }

  /// Acquire the lock for `key`, waiting up to the configured timeout.
  ///
  /// # Errors
  ///
  /// `Timeout` if another holder keeps the lock for the whole wait. The call
  /// does not retry beyond that; retrying is up to the caller.
  pub fn acquire(&self, key: &str) -> Result<CacheLock, LockError> {
    let path = self.lock_path(key)?;
    let start = Instant::now();
    let mut announced = false;

    loop {
      match self.attempt(key, &path)? {
        Attempt::Acquired(lock) => {
          debug!(key, path = %path.display(), waited = ?start.elapsed(), "acquired cache lock");
          return Ok(lock);
        }
        Attempt::Unlinked => continue,
        Attempt::Busy => {
          let waited = start.elapsed();
          if waited >= self.config.timeout {
            return Err(LockError::Timeout {
              key: key.to_string(),
              holder: read_holder(&path),
              path,
              waited,
            });
          }
          if !announced {
            info!(key, path = %path.display(), "waiting for cache lock held by another process");
            announced = true;
          }
          thread::sleep(self.config.poll_interval.min(self.config.timeout - waited));
        }
      }
    }
  }

  /// Acquire the lock for `key` only if nobody holds it right now.
  pub fn try_acquire(&self, key: &str) -> Result<Option<CacheLock>, LockError> {
    let path = self.lock_path(key)?;
    loop {
      match self.attempt(key, &path)? {
        Attempt::Acquired(lock) => return Ok(Some(lock)),
        Attempt::Busy => return Ok(None),
        Attempt::Unlinked => continue,
      }
    }
  }

  fn attempt(&self, key: &str, path: &Path) -> Result<Attempt, LockError> {
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|source| LockError::CreateDir {
        path: parent.to_path_buf(),
        source,
      })?;
    }

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(path)
      .map_err(|source| LockError::OpenFile {
        path: path.to_path_buf(),
        source,
      })?;

    if let Err(err) = try_lock(&file) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Ok(Attempt::Busy);
      }
      return Err(LockError::LockFailed {
        path: path.to_path_buf(),
        source: err,
      });
    }

    // The previous holder unlinks the file on release, possibly between our
    // open and our lock.
    if !still_linked(&file, path) {
      debug!(key, path = %path.display(), "lock file was released underneath us, retrying");
      return Ok(Attempt::Unlinked);
    }

    write_metadata(&file, key).map_err(|source| LockError::WriteMetadata {
      path: path.to_path_buf(),
      source,
    })?;

    Ok(Attempt::Acquired(CacheLock {
      file,
      path: path.to_path_buf(),
      key: key.to_string(),
      released: false,
    }))
  }

  /// Delete lock files abandoned for longer than the staleness threshold.
  ///
  /// Only regular files named `_*.lock` are candidates; directories and other
  /// files are never touched, whatever their age. Locks still held by a live
  /// process are skipped. Failures are collected as warnings and the sweep
  /// carries on.
  pub fn perform_maintenance(&self) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    if !self.root.exists() {
      return report;
    }

    let now = SystemTime::now();
    for entry in WalkDir::new(&self.root).min_depth(1) {
      let entry = match entry {
        Ok(entry) => entry,
        Err(err) => {
          let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
          push_warning(&mut report, path, err.to_string());
          continue;
        }
      };

      if !entry.file_type().is_file() || !is_lock_file_name(&entry.file_name().to_string_lossy()) {
        continue;
      }
      report.scanned += 1;

      let path = entry.path();
      let modified = match entry.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(err) => {
          push_warning(&mut report, path.to_path_buf(), err.to_string());
          continue;
        }
      };

      // A timestamp in the future counts as fresh.
      let age = now.duration_since(modified).unwrap_or_default();
      if age <= self.config.stale_after {
        continue;
      }

      match remove_if_unheld(path, self.config.stale_after) {
        Ok(Removal::Removed) => {
          info!(path = %path.display(), age = ?age, "removed stale lock");
          report.removed.push(path.to_path_buf());
        }
        Ok(Removal::Held) => {
          debug!(path = %path.display(), "stale-aged lock is still held, leaving it");
          report.held.push(path.to_path_buf());
        }
        Ok(Removal::Fresh) => {
          debug!(path = %path.display(), "lock was renewed during the sweep, leaving it");
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => push_warning(&mut report, path.to_path_buf(), err.to_string()),
      }
    }

    info!(
      root = %self.root.display(),
      scanned = report.scanned,
      removed = report.removed.len(),
      warnings = report.warnings.len(),
      "lock maintenance finished"
    );
    report
  }
}

/// Scoped ownership of one cache lock. Dropping it removes the lock file and
/// releases the OS lock.
#[derive(Debug)]
pub struct CacheLock {
  file: File,
  path: PathBuf,
  key: String,
  released: bool,
}

impl CacheLock {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Read the metadata through the held handle.
  ///
  /// Opening a second handle would fail on Windows, where the lock is mandatory.
  pub fn read_metadata(&self) -> io::Result<LockMetadata> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  /// Release explicitly, reporting a failure to remove the lock file.
  pub fn release(mut self) -> io::Result<()> {
    self.released = true;
    match fs::remove_file(&self.path) {
      Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
      _ => Ok(()),
    }
  }
}

impl Drop for CacheLock {
  fn drop(&mut self) {
    if self.released {
      return;
    }
    // Unlink while still holding the OS lock; `file` unlocks when dropped.
    if let Err(err) = fs::remove_file(&self.path)
      && err.kind() != io::ErrorKind::NotFound
    {
      warn!(path = %self.path.display(), error = %err, "failed to remove lock file");
    }
  }
}

pub fn is_lock_file_name(name: &str) -> bool {
  name.starts_with(LOCK_FILE_PREFIX) && name.ends_with(LOCK_FILE_SUFFIX)
}

fn push_warning(report: &mut MaintenanceReport, path: PathBuf, message: String) {
  warn!(path = %path.display(), error = %message, "lock maintenance could not process entry");
  report.warnings.push(MaintenanceWarning { path, message });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
  Removed,
  Held,
  /// The file at `path` is younger than the threshold once locked; it was
  /// recreated after the scan looked at it.
  Fresh,
}

/// Remove `path` unless another process holds its lock or it is no longer
/// older than `stale_after`.
fn remove_if_unheld(path: &Path, stale_after: Duration) -> io::Result<Removal> {
  // flock needs no write access, and stale locks may have lost it.
  let file = File::open(path)?;
  match try_lock(&file) {
    Ok(()) => {}
    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Removal::Held),
    Err(err) => return Err(err),
  }

  let modified = fs::metadata(path)?.modified()?;
  let age = SystemTime::now().duration_since(modified).unwrap_or_default();
  if age <= stale_after || !still_linked(&file, path) {
    return Ok(Removal::Fresh);
  }

  fs::remove_file(path)?;
  drop(file);
  Ok(Removal::Removed)
}

fn write_metadata(file: &File, key: &str) -> io::Result<()> {
  let metadata = LockMetadata {
    version: METADATA_VERSION,
    pid: std::process::id(),
    started_at_unix: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    key: key.to_string(),
  };

  file.set_len(0)?;
  let mut writer = io::BufWriter::new(file);
  writer.seek(SeekFrom::Start(0))?;
  serde_json::to_writer_pretty(&mut writer, &metadata).map_err(io::Error::other)?;
  writer.flush()
}

fn read_holder(path: &Path) -> Option<LockMetadata> {
  let mut contents = String::new();
  File::open(path).ok()?.read_to_string(&mut contents).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> bool {
  use std::os::unix::fs::MetadataExt;

  match (file.metadata(), fs::metadata(path)) {
    (Ok(held), Ok(current)) => held.dev() == current.dev() && held.ino() == current.ino(),
    _ => false,
  }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> bool {
  path.exists()
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};
  use windows_sys::Win32::System::IO::OVERLAPPED;

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: OVERLAPPED is a plain data struct that is valid when zero-initialized.
  // LockFileEx is safe to call with a valid file handle and zeroed OVERLAPPED.
  let result = unsafe {
    let mut overlapped: OVERLAPPED = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if result != 0 {
    return Ok(());
  }
  let err = io::Error::last_os_error();
  if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION as i32) {
    return Err(io::ErrorKind::WouldBlock.into());
  }
  Err(err)
}
