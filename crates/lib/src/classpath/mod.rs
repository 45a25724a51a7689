//! Tool classpath assembly from platform and explicit library declarations.
//!
//! Libraries are keyed by identity `(group, artifact, classifier)`. Adding a
//! library whose identity is already present replaces its content but keeps
//! the position where that identity first appeared, so the last declaration
//! wins while the ordering stays stable. Version, extension and source are
//! never part of identity.

pub mod rules;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::platform::Platform;
pub use rules::{LibraryDeclaration, LibraryRule, RuleAction};

#[derive(Debug, Error)]
pub enum ClasspathError {
  #[error("invalid library coordinate `{0}` (expected group:artifact:version[:classifier][@extension])")]
  InvalidCoordinate(String),

  #[error("failed to read library list {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse library list: {0}")]
  Parse(#[from] serde_json::Error),
}

/// A Maven-style library coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MavenCoordinate {
  pub group_id: String,
  pub artifact_id: String,
  pub version: String,
  pub classifier: Option<String>,
  pub extension: String,
}

impl MavenCoordinate {
  pub fn identity(&self) -> ClasspathIdentity {
    ClasspathIdentity {
      group_id: self.group_id.clone(),
      artifact_id: self.artifact_id.clone(),
      classifier: self.classifier.clone(),
    }
  }

  /// Path of the artifact inside a Maven-layout repository.
  pub fn relative_path(&self) -> PathBuf {
    let mut path: PathBuf = self.group_id.split('.').collect();
    path.push(&self.artifact_id);
    path.push(&self.version);

    let file_name = match &self.classifier {
      Some(classifier) => format!(
        "{}-{}-{}.{}",
        self.artifact_id, self.version, classifier, self.extension
      ),
      None => format!("{}-{}.{}", self.artifact_id, self.version, self.extension),
    };
    path.push(file_name);
    path
  }
}

impl FromStr for MavenCoordinate {
  type Err = ClasspathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || ClasspathError::InvalidCoordinate(s.to_string());

    let (coordinate, extension) = match s.rsplit_once('@') {
      Some((coordinate, extension)) if !extension.is_empty() => (coordinate, extension),
      Some(_) => return Err(invalid()),
      None => (s, "jar"),
    };

    let parts: Vec<&str> = coordinate.split(':').collect();
    if parts.iter().any(|p| p.trim().is_empty()) {
      return Err(invalid());
    }

    let (group_id, artifact_id, version, classifier) = match parts.as_slice() {
      [g, a, v] => (*g, *a, *v, None),
      [g, a, v, c] => (*g, *a, *v, Some(c.to_string())),
      _ => return Err(invalid()),
    };

    Ok(Self {
      group_id: group_id.to_string(),
      artifact_id: artifact_id.to_string(),
      version: version.to_string(),
      classifier,
      extension: extension.to_string(),
    })
  }
}

impl TryFrom<String> for MavenCoordinate {
  type Error = ClasspathError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<MavenCoordinate> for String {
  fn from(value: MavenCoordinate) -> Self {
    value.to_string()
  }
}

impl fmt::Display for MavenCoordinate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)?;
    if let Some(classifier) = &self.classifier {
      write!(f, ":{classifier}")?;
    }
    if self.extension != "jar" {
      write!(f, "@{}", self.extension)?;
    }
    Ok(())
  }
}

/// The part of a coordinate that decides whether two libraries collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClasspathIdentity {
  pub group_id: String,
  pub artifact_id: String,
  pub classifier: Option<String>,
}

impl fmt::Display for ClasspathIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.group_id, self.artifact_id)?;
    if let Some(classifier) = &self.classifier {
      write!(f, ":{classifier}")?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibrarySource {
  /// Declared by the distribution being rebuilt.
  Platform,
  /// Declared by override configuration.
  Explicit,
}

impl fmt::Display for LibrarySource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      LibrarySource::Platform => f.write_str("platform"),
      LibrarySource::Explicit => f.write_str("explicit"),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClasspathItem {
  pub coordinate: MavenCoordinate,
  pub source: LibrarySource,
}

/// Ordered, de-duplicated classpath fed from two provenance classes.
#[derive(Debug, Clone, Default)]
pub struct ExtensibleClasspath {
  order: Vec<ClasspathIdentity>,
  items: HashMap<ClasspathIdentity, ClasspathItem>,
}

impl ExtensibleClasspath {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_platform_libraries(&mut self, libraries: impl IntoIterator<Item = MavenCoordinate>) {
    self.add_libraries(LibrarySource::Platform, libraries);
  }

  pub fn add_explicit_libraries(&mut self, libraries: impl IntoIterator<Item = MavenCoordinate>) {
    self.add_libraries(LibrarySource::Explicit, libraries);
  }

  pub fn add_libraries(&mut self, source: LibrarySource, libraries: impl IntoIterator<Item = MavenCoordinate>) {
    for coordinate in libraries {
      let identity = coordinate.identity();
      let item = ClasspathItem { coordinate, source };

      match self.items.insert(identity.clone(), item) {
        Some(previous) => {
          debug!(
            library = %identity,
            from = %previous.coordinate.version,
            to = %self.items[&identity].coordinate.version,
            source = %source,
            "library overridden"
          );
        }
        None => self.order.push(identity),
      }
    }
  }

  /// One item per identity, in first-insertion order, with the latest content.
  pub fn effective_classpath(&self) -> Vec<ClasspathItem> {
    self.iter().cloned().collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = &ClasspathItem> {
    self.order.iter().filter_map(|identity| self.items.get(identity))
  }

  /// Locate every item under a Maven-layout library directory.
  pub fn resolve_paths(&self, libraries_dir: &Path) -> Vec<PathBuf> {
    self
      .iter()
      .map(|item| libraries_dir.join(item.coordinate.relative_path()))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.order.len()
  }

  pub fn is_empty(&self) -> bool {
    self.order.is_empty()
  }
}

/// Platform and explicit library declarations, as read from a JSON file.
///
/// ```json
/// {
///   "platform": [{ "name": "org.lwjgl:lwjgl:3.3.3:natives-linux",
///                  "rules": [{ "action": "allow", "os": { "name": "linux" } }] }],
///   "explicit": [{ "name": "org.ow2.asm:asm:9.7" }]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryManifest {
  #[serde(default)]
  pub platform: Vec<LibraryDeclaration>,

  #[serde(default)]
  pub explicit: Vec<LibraryDeclaration>,
}

impl LibraryManifest {
  pub fn from_json(content: &str) -> Result<Self, ClasspathError> {
    Ok(serde_json::from_str(content)?)
  }

  pub fn load(path: &Path) -> Result<Self, ClasspathError> {
    let content = fs::read_to_string(path).map_err(|source| ClasspathError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content)
  }

  /// Filter both lists by their rules and merge them, platform first.
  pub fn resolve(&self, platform: &Platform, features: &BTreeSet<String>) -> ExtensibleClasspath {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_platform_libraries(rules::filter_applicable(&self.platform, platform, features));
    classpath.add_explicit_libraries(rules::filter_applicable(&self.explicit, platform, features));
    classpath
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn coord(s: &str) -> MavenCoordinate {
    s.parse().unwrap()
  }

  fn versions(classpath: &ExtensibleClasspath) -> Vec<String> {
    classpath.iter().map(|i| i.coordinate.to_string()).collect()
  }

  #[test]
  fn parses_coordinates() {
    let c = coord("org.lwjgl:lwjgl:3.3.3:natives-linux@zip");
    assert_eq!(c.group_id, "org.lwjgl");
    assert_eq!(c.artifact_id, "lwjgl");
    assert_eq!(c.version, "3.3.3");
    assert_eq!(c.classifier.as_deref(), Some("natives-linux"));
    assert_eq!(c.extension, "zip");
    assert_eq!(c.to_string(), "org.lwjgl:lwjgl:3.3.3:natives-linux@zip");

    let c = coord("com.google.guava:guava:33.0.0-jre");
    assert_eq!(c.classifier, None);
    assert_eq!(c.extension, "jar");
  }

  #[test]
  fn rejects_malformed_coordinates() {
    for bad in ["", "g:a", "g::1.0", "g:a:1.0:c:x", "g:a:1.0@", ":a:1.0"] {
      assert!(
        matches!(bad.parse::<MavenCoordinate>(), Err(ClasspathError::InvalidCoordinate(_))),
        "{bad} should be rejected"
      );
    }
  }

  #[test]
  fn relative_path_follows_maven_layout() {
    assert_eq!(
      coord("org.ow2.asm:asm:9.7").relative_path(),
      PathBuf::from("org/ow2/asm/asm/9.7/asm-9.7.jar")
    );
    assert_eq!(
      coord("org.lwjgl:lwjgl:3.3.3:natives-linux").relative_path(),
      PathBuf::from("org/lwjgl/lwjgl/3.3.3/lwjgl-3.3.3-natives-linux.jar")
    );
  }

  #[test]
  fn explicit_after_platform_wins() {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_platform_libraries([coord("g:a:1.0")]);
    classpath.add_explicit_libraries([coord("g:a:2.0")]);

    let effective = classpath.effective_classpath();
    assert_eq!(effective.len(), 1);
    assert_eq!(effective[0].coordinate.version, "2.0");
    assert_eq!(effective[0].source, LibrarySource::Explicit);
  }

  #[test]
  fn platform_after_explicit_wins() {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_explicit_libraries([coord("g:a:2.0")]);
    classpath.add_platform_libraries([coord("g:a:1.0")]);

    let effective = classpath.effective_classpath();
    assert_eq!(effective.len(), 1);
    assert_eq!(effective[0].coordinate.version, "1.0");
    assert_eq!(effective[0].source, LibrarySource::Platform);
  }

  #[test]
  fn override_keeps_first_position() {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_platform_libraries([coord("g:a:1.0"), coord("g:b:1.0")]);
    classpath.add_explicit_libraries([coord("g:a:2.0"), coord("g:a:2.0:natives")]);

    assert_eq!(versions(&classpath), vec!["g:a:2.0", "g:b:1.0", "g:a:2.0:natives"]);
  }

  #[test]
  fn classifiers_are_distinct_identities() {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_platform_libraries([coord("g:a:1.0"), coord("g:a:1.0:natives")]);

    assert_eq!(classpath.len(), 2);
    assert_eq!(versions(&classpath), vec!["g:a:1.0", "g:a:1.0:natives"]);
  }

  #[test]
  fn extension_is_not_part_of_identity() {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_platform_libraries([coord("g:a:1.0"), coord("g:a:1.0@zip")]);
    assert_eq!(versions(&classpath), vec!["g:a:1.0@zip"]);
  }

  #[test]
  fn resolve_paths_joins_library_dir() {
    let mut classpath = ExtensibleClasspath::new();
    classpath.add_explicit_libraries([coord("net.fabricmc:tiny-remapper:0.10.4")]);

    assert_eq!(
      classpath.resolve_paths(Path::new("/libs")),
      vec![PathBuf::from("/libs/net/fabricmc/tiny-remapper/0.10.4/tiny-remapper-0.10.4.jar")]
    );
  }

  #[test]
  fn coordinate_serializes_as_string() {
    let item = ClasspathItem {
      coordinate: coord("g:a:1.0:sources"),
      source: LibrarySource::Explicit,
    };
    let json = serde_json::to_value(&item).unwrap();
    assert_eq!(json, serde_json::json!({"coordinate": "g:a:1.0:sources", "source": "explicit"}));
    assert!(serde_json::from_str::<MavenCoordinate>("\"nope\"").is_err());
  }

  #[test]
  fn manifest_resolves_platform_then_explicit() {
    use crate::platform::arch::Arch;
    use crate::platform::os::Os;

    let manifest = LibraryManifest::from_json(
      r#"{
        "platform": [
          { "name": "g:a:1.0" },
          { "name": "g:natives:1.0:natives-windows",
            "rules": [{ "action": "allow", "os": { "name": "windows" } }] }
        ],
        "explicit": [{ "name": "g:a:2.0" }]
      }"#,
    )
    .unwrap();

    let classpath = manifest.resolve(&Platform::new(Arch::X86_64, Os::Linux), &BTreeSet::new());
    assert_eq!(versions(&classpath), vec!["g:a:2.0"]);

    let classpath = manifest.resolve(&Platform::new(Arch::X86_64, Os::Windows), &BTreeSet::new());
    assert_eq!(versions(&classpath), vec!["g:a:2.0", "g:natives:1.0:natives-windows"]);
  }
}
