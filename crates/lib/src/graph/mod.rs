//! The execution graph: steps as nodes, wired output-to-input.
//!
//! An [`ExecutionGraph`] is an arena of [`Node`]s indexed by id. Each node owns
//! named output slots and named input slots; an input holds an [`OutputRef`]
//! (a `(node, output)` address) rather than a pointer, so graph transforms can
//! rewire consumers by substituting one handle for another.
//!
//! Nodes are only ever added. Removing a node would invalidate handles other
//! parts of the pipeline may still hold.

pub mod plan;
pub mod types;

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

pub use plan::ExecutionPlan;
pub use types::{GraphError, Input, Node, NodeId, OutputKind, OutputRef};

#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
  nodes: Vec<Node>,
  index: HashMap<NodeId, usize>,
  results: BTreeMap<String, OutputRef>,
}

impl ExecutionGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Start declaring a node under a fresh id.
  ///
  /// The node is inserted when [`NodeBuilder::build`] is called; dropping the
  /// builder discards it.
  pub fn add_node(&mut self, id: impl Into<NodeId>) -> Result<NodeBuilder<'_>, GraphError> {
    let id = id.into();
    if self.index.contains_key(&id) {
      return Err(GraphError::DuplicateNode(id));
    }

    Ok(NodeBuilder {
      node: Node {
        step_type: id.0.clone(),
        id,
        parameters: BTreeMap::new(),
        outputs: BTreeMap::new(),
        inputs: BTreeMap::new(),
      },
      graph: self,
    })
  }

  pub fn contains_node(&self, id: &str) -> bool {
    self.index.contains_key(id)
  }

  pub fn node(&self, id: &str) -> Option<&Node> {
    self.index.get(id).map(|&idx| &self.nodes[idx])
  }

  /// Look up an output slot by address, failing if the node or slot is absent.
  ///
  /// Lookup goes through the live node table, so an output that has been
  /// superseded by a transform is still addressable under its original name.
  pub fn get_output(&self, node: &str, output: &str) -> Result<OutputRef, GraphError> {
    self
      .node(node)
      .and_then(|n| n.output(output))
      .ok_or_else(|| GraphError::UnknownOutput {
        node: NodeId::from(node),
        output: output.to_string(),
      })
  }

  /// The declared kind of the output a handle points at.
  pub fn output_kind(&self, output: &OutputRef) -> Result<&OutputKind, GraphError> {
    self
      .node(output.node.as_str())
      .and_then(|n| n.outputs.get(&output.output))
      .ok_or_else(|| GraphError::UnknownOutput {
        node: output.node.clone(),
        output: output.output.clone(),
      })
  }

  /// All nodes in insertion order.
  pub fn nodes(&self) -> &[Node] {
    &self.nodes
  }

  pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
    self.nodes.iter_mut()
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub(crate) fn index_of(&self, id: &str) -> Option<usize> {
    self.index.get(id).copied()
  }

  /// Named deliverables of the graph.
  pub fn results(&self) -> &BTreeMap<String, OutputRef> {
    &self.results
  }

  pub fn results_mut(&mut self) -> &mut BTreeMap<String, OutputRef> {
    &mut self.results
  }

  pub fn result(&self, name: &str) -> Result<&OutputRef, GraphError> {
    self
      .results
      .get(name)
      .ok_or_else(|| GraphError::UnknownResult(name.to_string()))
  }

  /// Register `output` as the named result `name`, returning the previous binding.
  pub fn set_result(&mut self, name: impl Into<String>, output: OutputRef) -> Result<Option<OutputRef>, GraphError> {
    self.output_kind(&output)?;
    Ok(self.results.insert(name.into(), output))
  }

  /// Rewire every input that reads `old` to read `new` instead.
  ///
  /// Inputs of the node `except` are left alone so a node spliced in front of
  /// `old` keeps reading the original. Returns the number of rewired inputs.
  pub fn replace_references(&mut self, old: &OutputRef, new: &OutputRef, except: &NodeId) -> usize {
    let mut replaced = 0;
    for node in self.nodes.iter_mut().filter(|n| &n.id != except) {
      for (name, input) in node.inputs.iter_mut() {
        if input.replace_references(old, new) {
          debug!(node = %node.id, input = %name, from = %old, to = %new, "rewired input");
          replaced += 1;
        }
      }
    }
    replaced
  }

  /// Rebind every named result currently pointing at `old` to `new`.
  pub fn rebind_results(&mut self, old: &OutputRef, new: &OutputRef) -> usize {
    let mut rebound = 0;
    for (name, output) in self.results.iter_mut() {
      if output == old {
        debug!(result = %name, from = %old, to = %new, "rebound result");
        *output = new.clone();
        rebound += 1;
      }
    }
    rebound
  }

  /// Fail fast if the graph contains a dependency cycle.
  pub fn validate(&self) -> Result<(), GraphError> {
    ExecutionPlan::new(self).map(|_| ())
  }
}

/// Accumulates a node's slots before inserting it into the graph.
pub struct NodeBuilder<'g> {
  graph: &'g mut ExecutionGraph,
  node: Node,
}

impl<'g> NodeBuilder<'g> {
  pub fn id(&self) -> &NodeId {
    &self.node.id
  }

  /// Read access to the graph being extended.
  pub fn graph(&self) -> &ExecutionGraph {
    &*self.graph
  }

  /// Set the step kind. Defaults to the node id.
  pub fn step_type(&mut self, step_type: impl Into<String>) -> &mut Self {
    self.node.step_type = step_type.into();
    self
  }

  pub fn parameter(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
    self.node.parameters.insert(name.into(), value.into());
    self
  }

  /// Wire the input `name` to an existing output.
  pub fn input(&mut self, name: impl Into<String>, source: OutputRef) -> Result<&mut Self, GraphError> {
    let name = name.into();

    if self.node.inputs.contains_key(&name) {
      return Err(GraphError::DuplicateSlot {
        node: self.node.id.clone(),
        slot: "input",
        name,
      });
    }

    if source.node == self.node.id {
      return Err(GraphError::SelfReference {
        node: self.node.id.clone(),
        input: name,
        output: source.output,
      });
    }

    self.graph.output_kind(&source)?;
    self.node.inputs.insert(name, Input::new(source));
    Ok(self)
  }

  /// Declare an output slot and return its handle.
  pub fn output(&mut self, name: impl Into<String>, kind: OutputKind) -> Result<OutputRef, GraphError> {
    let name = name.into();
    if self.node.outputs.contains_key(&name) {
      return Err(GraphError::DuplicateSlot {
        node: self.node.id.clone(),
        slot: "output",
        name,
      });
    }

    self.node.outputs.insert(name.clone(), kind);
    Ok(OutputRef::new(self.node.id.clone(), name))
  }

  pub fn has_output(&self, name: &str) -> bool {
    self.node.outputs.contains_key(name)
  }

  /// Insert the node into the graph.
  pub fn build(self) -> NodeId {
    let id = self.node.id.clone();
    debug!(
      node = %id,
      step = %self.node.step_type,
      inputs = self.node.inputs.len(),
      outputs = self.node.outputs.len(),
      "added node"
    );
    self.graph.index.insert(id.clone(), self.graph.nodes.len());
    self.graph.nodes.push(self.node);
    id
  }
}
