//! Node, output and input types for the execution graph.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier of a node within one graph.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Borrow<str> for NodeId {
  fn borrow(&self) -> &str {
    &self.0
  }
}

impl From<&str> for NodeId {
  fn from(value: &str) -> Self {
    NodeId(value.to_string())
  }
}

impl From<String> for NodeId {
  fn from(value: String) -> Self {
    NodeId(value)
  }
}

/// Address of one output slot: `(node, output)`.
///
/// Outputs are referred to by value rather than by pointer, so rewiring an
/// input is a plain equality-based substitution of handles.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
  pub node: NodeId,
  pub output: String,
}

impl OutputRef {
  pub fn new(node: impl Into<NodeId>, output: impl Into<String>) -> Self {
    Self {
      node: node.into(),
      output: output.into(),
    }
  }
}

impl fmt::Display for OutputRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}.{}", self.node, self.output)
  }
}

/// What an output slot will hold once its node has run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OutputKind {
  /// A concrete value known without running anything.
  Value { value: String },
  /// A file produced lazily by the node's action.
  Artifact { extension: String },
}

impl OutputKind {
  pub fn artifact(extension: impl Into<String>) -> Self {
    OutputKind::Artifact {
      extension: extension.into(),
    }
  }

  pub fn value(value: impl Into<String>) -> Self {
    OutputKind::Value { value: value.into() }
  }
}

/// An input slot: a reference to exactly one output somewhere in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
  source: OutputRef,
}

impl Input {
  pub fn new(source: OutputRef) -> Self {
    Self { source }
  }

  /// The output this input currently reads from.
  pub fn source(&self) -> &OutputRef {
    &self.source
  }

  /// Point this input at `new` if it currently points at `old`.
  ///
  /// Returns whether the input was rewired.
  pub fn replace_references(&mut self, old: &OutputRef, new: &OutputRef) -> bool {
    if &self.source == old {
      self.source = new.clone();
      true
    } else {
      false
    }
  }
}

/// One step's representation in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
  pub(crate) id: NodeId,
  pub(crate) step_type: String,
  pub(crate) parameters: BTreeMap<String, String>,
  pub(crate) outputs: BTreeMap<String, OutputKind>,
  pub(crate) inputs: BTreeMap<String, Input>,
}

impl Node {
  pub fn id(&self) -> &NodeId {
    &self.id
  }

  /// The step kind this node executes; resolved through the step registry.
  pub fn step_type(&self) -> &str {
    &self.step_type
  }

  pub fn parameters(&self) -> &BTreeMap<String, String> {
    &self.parameters
  }

  pub fn outputs(&self) -> &BTreeMap<String, OutputKind> {
    &self.outputs
  }

  pub fn inputs(&self) -> &BTreeMap<String, Input> {
    &self.inputs
  }

  pub fn inputs_mut(&mut self) -> impl Iterator<Item = (&String, &mut Input)> {
    self.inputs.iter_mut()
  }

  pub fn output(&self, name: &str) -> Option<OutputRef> {
    self
      .outputs
      .contains_key(name)
      .then(|| OutputRef::new(self.id.clone(), name))
  }

  /// Nodes this node reads from, without duplicates, in input-name order.
  pub fn dependencies(&self) -> Vec<&NodeId> {
    let mut deps: Vec<&NodeId> = Vec::new();
    for input in self.inputs.values() {
      let node = &input.source().node;
      if !deps.contains(&node) {
        deps.push(node);
      }
    }
    deps
  }
}

/// Malformed graph construction or lookup.
///
/// All variants are configuration errors: re-running will not fix them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
  #[error("node `{0}` already exists in the graph")]
  DuplicateNode(NodeId),

  #[error("unknown node `{0}`")]
  UnknownNode(NodeId),

  #[error("unknown output `{output}` of node `{node}`")]
  UnknownOutput { node: NodeId, output: String },

  #[error("node `{node}` declares {slot} `{name}` more than once")]
  DuplicateSlot {
    node: NodeId,
    slot: &'static str,
    name: String,
  },

  #[error("node `{node}` input `{input}` references its own output `{output}`")]
  SelfReference {
    node: NodeId,
    input: String,
    output: String,
  },

  #[error("node `{0}` is part of a dependency cycle")]
  Cycle(NodeId),

  #[error("unknown result `{0}`")]
  UnknownResult(String),
}
