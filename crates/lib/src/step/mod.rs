//! Step kinds and the registry that dispatches them.
//!
//! The set of step kinds is data: a recipe names a `type` per step and the
//! registry maps that name to a [`StepAction`]. The core never implements a
//! decompiler, renamer or patcher itself; those are registered by the caller.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classpath::ClasspathItem;
use crate::graph::{NodeId, OutputKind};
use crate::recipe::StepDescriptor;

/// The materialized value of one output slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum OutputValue {
  Value(String),
  File(PathBuf),
}

impl OutputValue {
  pub fn as_path(&self) -> Option<&Path> {
    match self {
      OutputValue::File(path) => Some(path),
      OutputValue::Value(_) => None,
    }
  }
}

impl fmt::Display for OutputValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      OutputValue::Value(value) => f.write_str(value),
      OutputValue::File(path) => write!(f, "{}", path.display()),
    }
  }
}

/// Outputs produced by one step run, keyed by output name.
pub type StepOutputs = BTreeMap<String, OutputValue>;

#[derive(Debug, Error)]
pub enum ActionError {
  #[error("missing input `{0}`")]
  MissingInput(String),

  #[error("input `{0}` is not a file")]
  NotAFile(String),

  #[error("missing parameter `{0}`")]
  MissingParameter(String),

  #[error("no implementation registered for step type `{0}`")]
  NotImplemented(String),

  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("{0}")]
  Failed(String),
}

/// Everything a step sees while it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
  pub node: NodeId,
  pub step_type: String,
  pub parameters: BTreeMap<String, String>,
  pub inputs: BTreeMap<String, OutputValue>,
  /// Directory the step writes its files into. For cacheable steps this is a
  /// staging directory that is published atomically once the step succeeds.
  pub output_dir: PathBuf,
  /// Effective tool classpath, for steps that launch JVM tools.
  pub classpath: Arc<Vec<ClasspathItem>>,
}

impl StepContext {
  pub fn parameter(&self, name: &str) -> Result<&str, ActionError> {
    self
      .parameters
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| ActionError::MissingParameter(name.to_string()))
  }

  pub fn input(&self, name: &str) -> Result<&OutputValue, ActionError> {
    self
      .inputs
      .get(name)
      .ok_or_else(|| ActionError::MissingInput(name.to_string()))
  }

  pub fn input_path(&self, name: &str) -> Result<&Path, ActionError> {
    self
      .input(name)?
      .as_path()
      .ok_or_else(|| ActionError::NotAFile(name.to_string()))
  }

  /// Conventional location for an artifact output inside `output_dir`.
  pub fn output_path(&self, name: &str, extension: &str) -> PathBuf {
    self.output_dir.join(format!("{name}.{extension}"))
  }
}

/// A step kind's behaviour.
pub trait StepAction: Send + Sync {
  /// Outputs a node of this kind declares.
  ///
  /// Defaults to a single `output` jar.
  fn outputs(&self, _step: &StepDescriptor) -> Vec<(String, OutputKind)> {
    vec![("output".to_string(), OutputKind::artifact("jar"))]
  }

  /// Whether results may be stored in and reused from the shared cache.
  fn cacheable(&self) -> bool {
    true
  }

  fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError>;
}

/// Placeholder for step kinds whose implementation lives elsewhere.
///
/// It declares the default outputs so graphs can be built and planned, and
/// fails if asked to run.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueStep;

impl StepAction for OpaqueStep {
  fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
    Err(ActionError::NotImplemented(ctx.step_type.clone()))
  }
}

/// Step kinds keyed by type name.
#[derive(Clone, Default)]
pub struct StepRegistry {
  actions: HashMap<String, Arc<dyn StepAction>>,
  fallback: Option<Arc<dyn StepAction>>,
}

impl StepRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use `action` for any type without an explicit registration.
  pub fn with_fallback(mut self, action: Arc<dyn StepAction>) -> Self {
    self.fallback = Some(action);
    self
  }

  /// Register (or replace) the action for `step_type`.
  pub fn register(&mut self, step_type: impl Into<String>, action: Arc<dyn StepAction>) -> &mut Self {
    self.actions.insert(step_type.into(), action);
    self
  }

  pub fn contains(&self, step_type: &str) -> bool {
    self.actions.contains_key(step_type)
  }

  pub fn resolve(&self, step_type: &str) -> Option<Arc<dyn StepAction>> {
    self.actions.get(step_type).or(self.fallback.as_ref()).cloned()
  }

  pub fn types(&self) -> Vec<&str> {
    let mut types: Vec<&str> = self.actions.keys().map(String::as_str).collect();
    types.sort_unstable();
    types
  }
}

impl fmt::Debug for StepRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StepRegistry")
      .field("types", &self.types())
      .field("fallback", &self.fallback.is_some())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Echo;

  impl StepAction for Echo {
    fn outputs(&self, _step: &StepDescriptor) -> Vec<(String, OutputKind)> {
      vec![("text".to_string(), OutputKind::artifact("txt"))]
    }

    fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      let path = ctx.output_path("text", "txt");
      std::fs::write(&path, ctx.parameter("message")?)?;
      Ok(BTreeMap::from([("text".to_string(), OutputValue::File(path))]))
    }
  }

  fn context(dir: &Path) -> StepContext {
    StepContext {
      node: NodeId::from("echo"),
      step_type: "echo".to_string(),
      parameters: BTreeMap::new(),
      inputs: BTreeMap::new(),
      output_dir: dir.to_path_buf(),
      classpath: Arc::new(Vec::new()),
    }
  }

  #[test]
  fn registry_resolves_registered_and_fallback() {
    let mut registry = StepRegistry::new();
    registry.register("echo", Arc::new(Echo));

    assert!(registry.resolve("echo").is_some());
    assert!(registry.resolve("decompile").is_none());

    let registry = registry.with_fallback(Arc::new(OpaqueStep));
    assert!(registry.resolve("decompile").is_some());
    assert!(!registry.contains("decompile"));
    assert_eq!(registry.types(), vec!["echo"]);
  }

  #[test]
  fn opaque_step_refuses_to_run() {
    let temp = tempfile::tempdir().unwrap();
    let mut ctx = context(temp.path());
    ctx.step_type = "decompile".to_string();

    let err = OpaqueStep.run(&ctx).unwrap_err();
    assert!(matches!(err, ActionError::NotImplemented(ref t) if t == "decompile"));
    assert_eq!(
      OpaqueStep.outputs(&StepDescriptor::new("decompile")),
      vec![("output".to_string(), OutputKind::artifact("jar"))]
    );
  }

  #[test]
  fn context_accessors_report_missing_slots() {
    let temp = tempfile::tempdir().unwrap();
    let mut ctx = context(temp.path());
    ctx.inputs.insert("mappings".to_string(), OutputValue::Value("official".to_string()));

    assert!(matches!(ctx.parameter("message"), Err(ActionError::MissingParameter(_))));
    assert!(matches!(ctx.input("input"), Err(ActionError::MissingInput(_))));
    assert!(matches!(ctx.input_path("mappings"), Err(ActionError::NotAFile(_))));

    ctx.parameters.insert("message".to_string(), "hi".to_string());
    let outputs = Echo.run(&ctx).unwrap();
    let path = outputs["text"].as_path().unwrap();
    assert_eq!(std::fs::read_to_string(path).unwrap(), "hi");
  }

  #[test]
  fn output_value_serializes_tagged() {
    let json = serde_json::to_value(OutputValue::Value("1.21".to_string())).unwrap();
    assert_eq!(json, serde_json::json!({"kind": "value", "value": "1.21"}));
  }
}
