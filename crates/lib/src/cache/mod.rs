//! The shared on-disk cache.
//!
//! Entries live at `<root>/<namespace>/<digest>/`. Every read-or-create goes
//! through the entry's [`LockManager`] lock, whose file sits next to the entry
//! (`<root>/<namespace>/_<digest>.lock`). Entries are produced in a staging
//! directory, sealed with a completion marker recording the content hash, and
//! renamed into place, so other processes never see a half-written entry.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::consts::{CACHE_COMPLETE_MARKER, CACHE_KEY_LEN};
use crate::lock::{LockError, LockManager, MaintenanceReport, MaintenanceWarning};
use crate::util::hash::{HashAlgorithm, HashError, hash_bytes, hash_directory, verify_file};

const MARKER_VERSION: u32 = 1;
const STAGING_PREFIX: &str = ".staging-";
const HASH_EXCLUSIONS: &[&str] = &[CACHE_COMPLETE_MARKER];
const DOWNLOAD_NAMESPACE: &str = "downloads";

#[derive(Debug, Error)]
pub enum CacheError {
  #[error(transparent)]
  Lock(#[from] LockError),

  #[error("cache io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("invalid cache marker at {path}: {message}")]
  Marker { path: PathBuf, message: String },

  #[error("size mismatch for {uri}: expected {expected} bytes, got {actual}")]
  SizeMismatch { uri: String, expected: u64, actual: u64 },

  #[error("failed to download {uri}: {message}")]
  Download { uri: String, message: String },
}

impl CacheError {
  pub fn is_retryable(&self) -> bool {
    match self {
      CacheError::Lock(err) => err.is_retryable(),
      _ => false,
    }
  }

  fn io(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Address of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  namespace: String,
  digest: String,
}

impl CacheKey {
  /// Start a key whose digest is derived from named fields.
  pub fn builder(namespace: &str) -> CacheKeyBuilder {
    CacheKeyBuilder {
      namespace: sanitize_segment(namespace),
      fields: BTreeMap::new(),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn digest(&self) -> &str {
    &self.digest
  }

  pub fn lock_key(&self) -> String {
    format!("{}/{}", self.namespace, self.digest)
  }

  pub fn relative_path(&self) -> PathBuf {
    Path::new(&self.namespace).join(&self.digest)
  }
}

/// Collects the fields a key depends on. Field order does not matter.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
  namespace: String,
  fields: BTreeMap<String, String>,
}

impl CacheKeyBuilder {
  pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.fields.insert(name.into(), value.into());
    self
  }

  pub fn finish(self) -> CacheKey {
    let mut canonical = format!("{}\n", self.namespace);
    for (name, value) in &self.fields {
      canonical.push_str(&format!("{}={}\n", name.len(), name));
      canonical.push_str(&format!("{}={}\n", value.len(), value));
    }

    let mut digest = hash_bytes(HashAlgorithm::Sha256, canonical.as_bytes()).0;
    digest.truncate(CACHE_KEY_LEN);
    CacheKey {
      namespace: self.namespace,
      digest,
    }
  }
}

/// Written into an entry last; its presence means the entry is complete.
#[derive(Debug, Serialize, Deserialize)]
struct CacheMarker {
  version: u32,
  /// SHA-256 of the entry's contents, marker excluded.
  content_hash: String,
  metadata: serde_json::Value,
}

/// A cache entry together with the metadata its producer returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry<T> {
  pub path: PathBuf,
  pub value: T,
  /// Whether the entry already existed.
  pub hit: bool,
}

/// Artifact reference as handed over by distribution metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSpec {
  pub uri: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub size: Option<u64>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checksum: Option<String>,

  /// Defaults to `sha1`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checksum_algorithm: Option<String>,
}

impl DownloadSpec {
  pub fn new(uri: impl Into<String>) -> Self {
    Self {
      uri: uri.into(),
      size: None,
      checksum: None,
      checksum_algorithm: None,
    }
  }

  pub fn algorithm(&self) -> Result<HashAlgorithm, HashError> {
    match &self.checksum_algorithm {
      Some(name) => HashAlgorithm::from_str(name),
      None => Ok(HashAlgorithm::Sha1),
    }
  }
}

/// Network retrieval, supplied by the caller.
pub trait Downloader: Send + Sync {
  /// Write the bytes behind `uri` to `dest`.
  fn download(&self, uri: &str, dest: &Path) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone)]
pub struct CacheStore {
  root: PathBuf,
  locks: LockManager,
}

impl CacheStore {
  pub fn new(locks: LockManager) -> Self {
    Self {
      root: locks.root().to_path_buf(),
      locks,
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn locks(&self) -> &LockManager {
    &self.locks
  }

  pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
    self.root.join(key.relative_path())
  }

  /// Return the entry for `key`, running `produce` to create it if needed.
  ///
  /// `produce` writes into the directory it is given and returns metadata,
  /// which is stored in the marker and handed back on later hits. It runs at
  /// most once per key across all processes sharing the cache, unless the
  /// entry is found corrupted, in which case it is discarded and rebuilt.
  pub fn get_or_create<T, E, F>(&self, key: &CacheKey, produce: F) -> Result<CachedEntry<T>, E>
  where
    T: Serialize + DeserializeOwned,
    E: From<CacheError>,
    F: FnOnce(&Path) -> Result<T, E>,
  {
    let entry = self.entry_path(key);
    let _lock = self.locks.acquire(&key.lock_key()).map_err(CacheError::from)?;

    // Another process may have finished the entry while we waited.
    if let Some(value) = read_verified::<T>(&entry) {
      debug!(key = %key.lock_key(), "cache hit");
      return Ok(CachedEntry {
        path: entry,
        value,
        hit: true,
      });
    }

    let parent = self.root.join(key.namespace());
    fs::create_dir_all(&parent).map_err(CacheError::io(&parent))?;
    let staging = tempfile::Builder::new()
      .prefix(STAGING_PREFIX)
      .tempdir_in(&parent)
      .map_err(CacheError::io(&parent))?;

    let value = produce(staging.path())?;
    seal(staging.path(), &value)?;

    if entry.exists() {
      fs::remove_dir_all(&entry).map_err(CacheError::io(&entry))?;
    }
    fs::rename(staging.path(), &entry).map_err(CacheError::io(&entry))?;

    info!(key = %key.lock_key(), path = %entry.display(), "cache entry created");
    Ok(CachedEntry {
      path: entry,
      value,
      hit: false,
    })
  }

  /// Fetch an artifact into the cache, verifying its size and checksum.
  ///
  /// Nothing is published unless verification passes. Returns the path of
  /// the cached file.
  pub fn fetch_verified(&self, spec: &DownloadSpec, downloader: &dyn Downloader) -> Result<PathBuf, CacheError> {
    let algorithm = spec.algorithm()?;
    let key = CacheKey::builder(DOWNLOAD_NAMESPACE)
      .field("uri", spec.uri.as_str())
      .field("checksum", spec.checksum.as_deref().unwrap_or_default())
      .field("algorithm", algorithm.as_str())
      .finish();

    let entry = self.get_or_create(&key, |dir: &Path| -> Result<String, CacheError> {
      let file_name = url_to_filename(&spec.uri);
      let dest = dir.join(&file_name);

      info!(uri = %spec.uri, "downloading");
      downloader
        .download(&spec.uri, &dest)
        .map_err(|e| CacheError::Download {
          uri: spec.uri.clone(),
          message: e.to_string(),
        })?;

      if let Some(expected) = spec.size {
        let actual = fs::metadata(&dest).map_err(CacheError::io(&dest))?.len();
        if actual != expected {
          return Err(CacheError::SizeMismatch {
            uri: spec.uri.clone(),
            expected,
            actual,
          });
        }
      }

      if let Some(checksum) = &spec.checksum {
        verify_file(&dest, algorithm, checksum)?;
      }

      Ok(file_name)
    })?;

    Ok(entry.path.join(entry.value))
  }

  /// Sweep stale lock files, then staging directories left by producers
  /// that died before sealing, using the same age threshold.
  pub fn perform_maintenance(&self) -> MaintenanceReport {
    let mut report = self.locks.perform_maintenance();
    if !self.root.exists() {
      return report;
    }

    let stale_after = self.locks.config().stale_after;
    let now = SystemTime::now();
    let staging = WalkDir::new(&self.root)
      .min_depth(2)
      .max_depth(2)
      .into_iter()
      .filter_entry(|e| e.depth() < 2 || e.file_name().to_string_lossy().starts_with(STAGING_PREFIX));

    for entry in staging {
      let entry = match entry {
        Ok(entry) if entry.file_type().is_dir() => entry,
        Ok(_) => continue,
        Err(err) => {
          let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
          staging_warning(&mut report, path, err.to_string());
          continue;
        }
      };

      let path = entry.path();
      let age = match entry.metadata().map_err(io::Error::from).and_then(|m| m.modified()) {
        Ok(modified) => now.duration_since(modified).unwrap_or_default(),
        Err(err) => {
          staging_warning(&mut report, path.to_path_buf(), err.to_string());
          continue;
        }
      };
      if age <= stale_after {
        continue;
      }

      match fs::remove_dir_all(path) {
        Ok(()) => {
          info!(path = %path.display(), age = ?age, "removed abandoned staging directory");
          report.removed.push(path.to_path_buf());
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => staging_warning(&mut report, path.to_path_buf(), err.to_string()),
      }
    }

    report
  }
}

fn staging_warning(report: &mut MaintenanceReport, path: PathBuf, message: String) {
  warn!(path = %path.display(), error = %message, "could not reclaim staging directory");
  report.warnings.push(MaintenanceWarning { path, message });
}

/// Read the marker and re-hash the entry. `None` means the entry must be (re)built.
fn read_verified<T: DeserializeOwned>(entry: &Path) -> Option<T> {
  let marker_path = entry.join(CACHE_COMPLETE_MARKER);
  let content = match fs::read_to_string(&marker_path) {
    Ok(content) => content,
    Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
    Err(err) => {
      warn!(path = %marker_path.display(), error = %err, "unreadable cache marker, will rebuild");
      return None;
    }
  };

  let marker = match serde_json::from_str::<CacheMarker>(&content) {
    Ok(marker) if marker.version == MARKER_VERSION => marker,
    Ok(marker) => {
      warn!(path = %marker_path.display(), version = marker.version, "unsupported cache marker, will rebuild");
      return None;
    }
    Err(err) => {
      warn!(path = %marker_path.display(), error = %err, "corrupt cache marker, will rebuild");
      return None;
    }
  };

  match hash_directory(entry, HASH_EXCLUSIONS) {
    Ok(actual) if actual.matches(&marker.content_hash) => {}
    Ok(actual) => {
      warn!(
        path = %entry.display(),
        expected = %marker.content_hash,
        actual = %actual,
        "cache entry corrupted, will rebuild"
      );
      return None;
    }
    Err(err) => {
      warn!(path = %entry.display(), error = %err, "failed to hash cache entry, will rebuild");
      return None;
    }
  }

  match serde_json::from_value(marker.metadata) {
    Ok(value) => Some(value),
    Err(err) => {
      warn!(path = %marker_path.display(), error = %err, "cache metadata does not match, will rebuild");
      None
    }
  }
}

fn seal<T: Serialize>(dir: &Path, value: &T) -> Result<(), CacheError> {
  let marker_path = dir.join(CACHE_COMPLETE_MARKER);
  let marker_error = |message: String| CacheError::Marker {
    path: marker_path.clone(),
    message,
  };

  let marker = CacheMarker {
    version: MARKER_VERSION,
    content_hash: hash_directory(dir, HASH_EXCLUSIONS)?.0,
    metadata: serde_json::to_value(value).map_err(|e| marker_error(e.to_string()))?,
  };
  let content = serde_json::to_string(&marker).map_err(|e| marker_error(e.to_string()))?;
  fs::write(&marker_path, format!("{content}\n")).map_err(CacheError::io(&marker_path))
}

fn sanitize_segment(segment: &str) -> String {
  let sanitized: String = segment
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect();
  if sanitized.is_empty() { "_".to_string() } else { sanitized }
}

/// Last path component of a URL, sanitized; a hash of the URL if there is none.
fn url_to_filename(url: &str) -> String {
  if let Some(filename) = url.rsplit('/').next() {
    let filename = filename.split(['?', '#']).next().unwrap_or(filename);
    let sanitized: String = filename
      .chars()
      .map(|c| {
        if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
          c
        } else {
          '_'
        }
      })
      .collect();

    if !sanitized.is_empty() && sanitized != "." && sanitized != ".." && sanitized != CACHE_COMPLETE_MARKER {
      return sanitized;
    }
  }

  format!("download_{}", &hash_bytes(HashAlgorithm::Sha256, url.as_bytes()).0[..16])
}
