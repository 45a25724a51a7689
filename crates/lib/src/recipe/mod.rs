//! Recipes: ordered step descriptors and their translation into a graph.
//!
//! # Recipe format
//!
//! ```json
//! {
//!   "version": 1,
//!   "steps": [
//!     { "type": "downloadClient" },
//!     { "type": "strip", "parameters": { "input": "{downloadClientOutput}" } },
//!     { "type": "rename", "parameters": { "input": "{strip.output}", "mappings": "{mappings}" } }
//!   ],
//!   "results": { "compiled": "rename.output" },
//!   "overrides": []
//! }
//! ```
//!
//! A parameter whose whole value is `{node.output}`, or `{nodeOutput}` for a
//! node that already exists, becomes an input wired to that output. Any other
//! value, including placeholders such as `{mappings}`, is handed to the step
//! as a literal parameter.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::consts::RECIPE_VERSION;
use crate::graph::{ExecutionGraph, GraphError, NodeBuilder, NodeId, OutputRef};
use crate::step::{StepAction, StepRegistry};
use crate::transform::{self, TransformContext, TransformError, TransformSpec};

#[derive(Debug, Error)]
pub enum RecipeError {
  #[error("failed to read recipe {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse recipe: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("unsupported recipe version {found} (supported: {supported})")]
  UnsupportedVersion { found: u32, supported: u32 },

  #[error("step `{node}` has unknown type `{step_type}`")]
  UnknownStepType { node: NodeId, step_type: String },

  #[error("result `{name}` has invalid address `{address}` (expected `node.output`)")]
  InvalidResult { name: String, address: String },

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Transform(#[from] TransformError),
}

/// One step of a recipe, as parsed from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
  #[serde(rename = "type")]
  pub step_type: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,

  #[serde(default)]
  pub parameters: BTreeMap<String, String>,
}

impl StepDescriptor {
  pub fn new(step_type: impl Into<String>) -> Self {
    Self {
      step_type: step_type.into(),
      name: None,
      parameters: BTreeMap::new(),
    }
  }

  pub fn named(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.parameters.insert(name.into(), value.into());
    self
  }

  /// The step's identity: its name, or its type when unnamed.
  pub fn id(&self) -> &str {
    self.name.as_deref().unwrap_or(&self.step_type)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
  pub version: u32,

  pub steps: Vec<StepDescriptor>,

  /// Named deliverables, as `node.output` addresses.
  #[serde(default)]
  pub results: BTreeMap<String, String>,

  /// Graph rewrites applied after the steps are wired, in order.
  #[serde(default)]
  pub overrides: Vec<TransformSpec>,
}

impl Recipe {
  pub fn from_json(content: &str) -> Result<Self, RecipeError> {
    let recipe: Recipe = serde_json::from_str(content)?;
    recipe.check_version()?;
    Ok(recipe)
  }

  pub fn load(path: &Path) -> Result<Self, RecipeError> {
    let content = fs::read_to_string(path).map_err(|source| RecipeError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content)
  }

  fn check_version(&self) -> Result<(), RecipeError> {
    if self.version != RECIPE_VERSION {
      return Err(RecipeError::UnsupportedVersion {
        found: self.version,
        supported: RECIPE_VERSION,
      });
    }
    Ok(())
  }
}

/// How a raw parameter value is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterValue<'a> {
  Literal(&'a str),
  Reference(OutputRef),
}

/// Classify a parameter value against the nodes already in `graph`.
pub fn parse_parameter<'a>(value: &'a str, graph: &ExecutionGraph) -> ParameterValue<'a> {
  let Some(inner) = value
    .strip_prefix('{')
    .and_then(|v| v.strip_suffix('}'))
    .filter(|v| !v.is_empty() && !v.contains(['{', '}']))
  else {
    return ParameterValue::Literal(value);
  };

  if let Some((node, output)) = inner.split_once('.') {
    if !node.is_empty() && !output.is_empty() {
      return ParameterValue::Reference(OutputRef::new(node, output));
    }
    return ParameterValue::Literal(value);
  }

  if let Some(node) = inner.strip_suffix("Output")
    && graph.contains_node(node)
  {
    return ParameterValue::Reference(OutputRef::new(node, "output"));
  }

  ParameterValue::Literal(value)
}

/// Parse a result address, accepting `node.output` or `{node.output}`.
pub fn parse_address(address: &str) -> Option<OutputRef> {
  let trimmed = address
    .strip_prefix('{')
    .and_then(|v| v.strip_suffix('}'))
    .unwrap_or(address);
  let (node, output) = trimmed.split_once('.')?;
  (!node.is_empty() && !output.is_empty()).then(|| OutputRef::new(node, output))
}

/// Configure `builder` from a step descriptor and declare its outputs.
///
/// Reference parameters become inputs; literals become parameters.
pub fn wire_step(
  builder: &mut NodeBuilder<'_>,
  step: &StepDescriptor,
  action: &dyn StepAction,
) -> Result<Vec<OutputRef>, GraphError> {
  builder.step_type(step.step_type.clone());

  for (name, value) in &step.parameters {
    match parse_parameter(value, builder.graph()) {
      ParameterValue::Reference(source) => {
        builder.input(name.clone(), source)?;
      }
      ParameterValue::Literal(literal) => {
        builder.parameter(name.clone(), literal);
      }
    }
  }

  action
    .outputs(step)
    .into_iter()
    .map(|(name, kind)| builder.output(name, kind))
    .collect()
}

/// Build one node per step, in recipe order, and register the named results.
///
/// Overrides are not applied; see [`prepare`].
pub fn build_graph(recipe: &Recipe, registry: &StepRegistry) -> Result<ExecutionGraph, RecipeError> {
  recipe.check_version()?;
  let mut graph = ExecutionGraph::new();

  for step in &recipe.steps {
    let action = registry
      .resolve(&step.step_type)
      .ok_or_else(|| RecipeError::UnknownStepType {
        node: NodeId::from(step.id()),
        step_type: step.step_type.clone(),
      })?;

    let mut builder = graph.add_node(step.id())?;
    wire_step(&mut builder, step, action.as_ref())?;
    builder.build();
  }

  for (name, address) in &recipe.results {
    let output = parse_address(address).ok_or_else(|| RecipeError::InvalidResult {
      name: name.clone(),
      address: address.clone(),
    })?;
    let output = graph.get_output(output.node.as_str(), &output.output)?;
    debug!(result = %name, output = %output, "registered result");
    graph.set_result(name.clone(), output)?;
  }

  Ok(graph)
}

/// Build the graph, apply the recipe's overrides in order, and validate it.
pub fn prepare(recipe: &Recipe, registry: &StepRegistry) -> Result<ExecutionGraph, RecipeError> {
  let mut graph = build_graph(recipe, registry)?;

  let transforms = recipe
    .overrides
    .iter()
    .map(|spec| spec.to_transform())
    .collect::<Vec<_>>();
  let ctx = TransformContext { steps: registry };
  transform::apply_transforms(&mut graph, &transforms, &ctx)?;

  info!(
    nodes = graph.len(),
    results = graph.results().len(),
    overrides = recipe.overrides.len(),
    "prepared execution graph"
  );

  Ok(graph)
}
