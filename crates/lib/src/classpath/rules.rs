//! Platform rules attached to library declarations.
//!
//! With no rules a library always applies. Otherwise it starts disallowed and
//! each rule whose conditions match the host sets the outcome to its action,
//! so later matching rules override earlier ones.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::MavenCoordinate;
use crate::platform::Platform;
use crate::platform::arch::Arch;
use crate::platform::os::Os;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
  Allow,
  Disallow,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsCondition {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub arch: Option<String>,
}

impl OsCondition {
  /// Unknown names never match.
  fn matches(&self, platform: &Platform) -> bool {
    let name_ok = self
      .name
      .as_deref()
      .is_none_or(|name| Os::from_name(name) == Some(platform.os));
    let arch_ok = self
      .arch
      .as_deref()
      .is_none_or(|arch| Arch::from_name(arch) == Some(platform.arch));
    name_ok && arch_ok
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRule {
  pub action: RuleAction,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub os: Option<OsCondition>,

  /// Feature flags that must have the given state.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub features: BTreeMap<String, bool>,
}

impl LibraryRule {
  pub fn matches(&self, platform: &Platform, features: &BTreeSet<String>) -> bool {
    let os_ok = self.os.as_ref().is_none_or(|os| os.matches(platform));
    let features_ok = self
      .features
      .iter()
      .all(|(feature, wanted)| features.contains(feature) == *wanted);
    os_ok && features_ok
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryDeclaration {
  pub name: MavenCoordinate,

  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub rules: Vec<LibraryRule>,
}

impl LibraryDeclaration {
  pub fn applies_to(&self, platform: &Platform, features: &BTreeSet<String>) -> bool {
    if self.rules.is_empty() {
      return true;
    }

    let mut action = RuleAction::Disallow;
    for rule in &self.rules {
      if rule.matches(platform, features) {
        action = rule.action;
      }
    }
    action == RuleAction::Allow
  }
}

/// Coordinates of the declarations that apply to `platform`, in order.
pub fn filter_applicable(
  declarations: &[LibraryDeclaration],
  platform: &Platform,
  features: &BTreeSet<String>,
) -> Vec<MavenCoordinate> {
  declarations
    .iter()
    .filter(|decl| {
      let applies = decl.applies_to(platform, features);
      if !applies {
        trace!(library = %decl.name, platform = %platform, "library excluded by rules");
      }
      applies
    })
    .map(|decl| decl.name.clone())
    .collect()
}
