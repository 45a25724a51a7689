//! Content hashing for download verification and cache keys.
//!
//! This module provides:
//! - `HashAlgorithm`: the digest algorithms a downloader may name
//! - `ContentHash`: a lowercase hexadecimal digest
//! - `hash_bytes()` / `hash_file()` / `hash_reader()`: one-shot hashing
//! - `verify_file()`: checksum verification with a typed mismatch error
//! - `hash_directory()`: deterministic directory hashing for cache entries

use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum HashError {
  #[error("unsupported checksum algorithm: {0}")]
  UnsupportedAlgorithm(String),

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk directory {path}: {message}")]
  WalkDir { path: PathBuf, message: String },

  #[error("{algorithm} checksum mismatch for {path}: expected {expected}, got {actual}")]
  Mismatch {
    path: PathBuf,
    algorithm: HashAlgorithm,
    expected: String,
    actual: String,
  },
}

/// Digest algorithms understood by the hasher.
///
/// Names are parsed case-insensitively and accept both the bare (`sha1`) and
/// the hyphenated (`SHA-1`) spelling used by artifact manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HashAlgorithm {
  Md5,
  Sha1,
  Sha256,
  Sha512,
}

impl HashAlgorithm {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Md5 => "md5",
      Self::Sha1 => "sha1",
      Self::Sha256 => "sha256",
      Self::Sha512 => "sha512",
    }
  }

  /// Length of the hex-encoded digest.
  pub fn hex_len(&self) -> usize {
    match self {
      Self::Md5 => 32,
      Self::Sha1 => 40,
      Self::Sha256 => 64,
      Self::Sha512 => 128,
    }
  }

  fn hasher(&self) -> Hasher {
    match self {
      Self::Md5 => Hasher::Md5(md5::Context::new()),
      Self::Sha1 => Hasher::Sha1(Sha1::new()),
      Self::Sha256 => Hasher::Sha256(Sha256::new()),
      Self::Sha512 => Hasher::Sha512(Sha512::new()),
    }
  }
}

impl fmt::Display for HashAlgorithm {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for HashAlgorithm {
  type Err = HashError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized: String = s.chars().filter(|c| *c != '-' && *c != '_').collect();
    match normalized.to_ascii_lowercase().as_str() {
      "md5" => Ok(Self::Md5),
      "sha1" => Ok(Self::Sha1),
      "sha256" => Ok(Self::Sha256),
      "sha512" => Ok(Self::Sha512),
      _ => Err(HashError::UnsupportedAlgorithm(s.to_string())),
    }
  }
}

impl TryFrom<String> for HashAlgorithm {
  type Error = HashError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<HashAlgorithm> for String {
  fn from(value: HashAlgorithm) -> Self {
    value.as_str().to_string()
  }
}

enum Hasher {
  Md5(md5::Context),
  Sha1(Sha1),
  Sha256(Sha256),
  Sha512(Sha512),
}

impl Hasher {
  fn update(&mut self, data: &[u8]) {
    match self {
      Hasher::Md5(ctx) => ctx.consume(data),
      Hasher::Sha1(h) => h.update(data),
      Hasher::Sha256(h) => h.update(data),
      Hasher::Sha512(h) => h.update(data),
    }
  }

  fn finalize(self) -> ContentHash {
    let hex = match self {
      Hasher::Md5(ctx) => format!("{:x}", ctx.compute()),
      Hasher::Sha1(h) => hex::encode(h.finalize()),
      Hasher::Sha256(h) => hex::encode(h.finalize()),
      Hasher::Sha512(h) => hex::encode(h.finalize()),
    };
    ContentHash(hex)
  }
}

/// A lowercase hexadecimal digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// Compare against a checksum from an external source, ignoring case.
  pub fn matches(&self, expected: &str) -> bool {
    self.0.eq_ignore_ascii_case(expected.trim())
  }
}

impl fmt::Display for ContentHash {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> ContentHash {
  let mut hasher = algorithm.hasher();
  hasher.update(data);
  hasher.finalize()
}

/// Hash everything a reader yields.
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> io::Result<ContentHash> {
  let mut hasher = algorithm.hasher();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = reader.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(hasher.finalize())
}

/// Hash a file's contents without loading it into memory.
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<ContentHash, HashError> {
  let read_err = |source| HashError::Read {
    path: path.to_path_buf(),
    source,
  };
  let file = fs::File::open(path).map_err(read_err)?;
  hash_reader(algorithm, file).map_err(read_err)
}

/// Hash a file and fail with `HashError::Mismatch` unless it matches `expected`.
pub fn verify_file(path: &Path, algorithm: HashAlgorithm, expected: &str) -> Result<ContentHash, HashError> {
  let actual = hash_file(algorithm, path)?;
  if !actual.matches(expected) {
    return Err(HashError::Mismatch {
      path: path.to_path_buf(),
      algorithm,
      expected: expected.trim().to_ascii_lowercase(),
      actual: actual.0,
    });
  }
  Ok(actual)
}

/// Compute a deterministic SHA-256 of a directory's contents.
///
/// File contents, directory structure and symlink targets contribute to the
/// hash; timestamps and permissions do not. Entries named in `exclude` are
/// skipped along with everything beneath them.
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, HashError> {
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    e.file_name()
      .to_str()
      .map(|name| !exclude.contains(&name))
      .unwrap_or(true)
  });

  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(HashAlgorithm::Sha256, entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|source| HashError::Read {
        path: entry_path.to_path_buf(),
        source,
      })?;
      let target_hash = hash_bytes(HashAlgorithm::Sha256, target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = HashAlgorithm::Sha256.hasher();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::tempdir;

  #[test]
  fn empty_input_yields_known_digests() {
    assert_eq!(hash_bytes(HashAlgorithm::Md5, b"").0, "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(
      hash_bytes(HashAlgorithm::Sha1, b"").0,
      "da39a3ee5e6b4b0d3255bfef95601890afd80709"
    );
    assert_eq!(
      hash_bytes(HashAlgorithm::Sha256, b"").0,
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
    assert_eq!(
      hash_bytes(HashAlgorithm::Sha512, b"").0,
      "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce\
       47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
    );
  }

  #[test]
  fn file_and_memory_digests_agree() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("data.bin");
    let content = b"client.jar contents";
    fs::write(&path, content).unwrap();

    for algorithm in [
      HashAlgorithm::Md5,
      HashAlgorithm::Sha1,
      HashAlgorithm::Sha256,
      HashAlgorithm::Sha512,
    ] {
      let from_file = hash_file(algorithm, &path).unwrap();
      let from_memory = hash_bytes(algorithm, content);
      assert_eq!(from_file, from_memory, "{algorithm}");
      assert_eq!(from_file.0.len(), algorithm.hex_len());
    }
  }

  #[test]
  fn algorithm_names_parse_loosely() {
    assert_eq!("sha1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
    assert_eq!("SHA-1".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha1);
    assert_eq!("Sha-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
    assert_eq!("MD5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
    assert!(matches!(
      "crc32".parse::<HashAlgorithm>(),
      Err(HashError::UnsupportedAlgorithm(name)) if name == "crc32"
    ));
  }

  #[test]
  fn algorithm_serde_uses_plain_names() {
    let json = serde_json::to_string(&HashAlgorithm::Sha512).unwrap();
    assert_eq!(json, "\"sha512\"");
    let parsed: HashAlgorithm = serde_json::from_str("\"SHA-256\"").unwrap();
    assert_eq!(parsed, HashAlgorithm::Sha256);
  }

  #[test]
  fn verify_file_reports_mismatch() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("file.txt");
    fs::write(&path, "hello").unwrap();

    let expected = hash_bytes(HashAlgorithm::Sha1, b"hello").0.to_uppercase();
    assert!(verify_file(&path, HashAlgorithm::Sha1, &expected).is_ok());

    let err = verify_file(&path, HashAlgorithm::Sha1, "0000").unwrap_err();
    match err {
      HashError::Mismatch { expected, actual, .. } => {
        assert_eq!(expected, "0000");
        assert_eq!(actual, hash_bytes(HashAlgorithm::Sha1, b"hello").0);
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn hash_file_missing_is_read_error() {
    let temp = tempdir().unwrap();
    let err = hash_file(HashAlgorithm::Sha256, &temp.path().join("missing")).unwrap_err();
    assert!(matches!(err, HashError::Read { .. }));
  }

  #[test]
  fn directory_hash_is_deterministic() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("a.txt"), "content a").unwrap();
    fs::write(temp.path().join("b.txt"), "content b").unwrap();

    let hash1 = hash_directory(temp.path(), &[]).unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();
    assert_eq!(hash1, hash2);
    assert_eq!(hash1.0.len(), 64);
  }

  #[test]
  fn directory_hash_changes_with_content() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "original").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join("file.txt"), "modified").unwrap();
    let hash2 = hash_directory(temp.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }

  #[test]
  fn directory_hash_respects_exclusions() {
    let temp = tempdir().unwrap();
    fs::write(temp.path().join("file.txt"), "content").unwrap();
    let hash1 = hash_directory(temp.path(), &[]).unwrap();

    fs::write(temp.path().join(".formwork-complete"), "marker").unwrap();
    let hash2 = hash_directory(temp.path(), &[".formwork-complete"]).unwrap();

    assert_eq!(hash1, hash2);
  }

  #[test]
  fn same_content_different_structure_different_hash() {
    let temp1 = tempdir().unwrap();
    fs::write(temp1.path().join("file.txt"), "content").unwrap();

    let temp2 = tempdir().unwrap();
    fs::create_dir(temp2.path().join("subdir")).unwrap();
    fs::write(temp2.path().join("subdir/file.txt"), "content").unwrap();

    let hash1 = hash_directory(temp1.path(), &[]).unwrap();
    let hash2 = hash_directory(temp2.path(), &[]).unwrap();

    assert_ne!(hash1, hash2);
  }
}
