//! Dependency ordering over an [`ExecutionGraph`].
//!
//! The plan mirrors the graph's input wiring as a petgraph DAG with an edge
//! from every producer to each of its consumers. Building a plan is where
//! cycles are detected: a cyclic recipe fails here, before anything runs.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use super::ExecutionGraph;
use super::types::{GraphError, NodeId};

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
  dag: DiGraph<NodeId, ()>,
  indices: HashMap<NodeId, NodeIndex>,
}

impl ExecutionPlan {
  /// Plan every node of the graph.
  ///
  /// # Errors
  ///
  /// `UnknownOutput` if an input points at a slot that does not exist, or
  /// `Cycle` naming a node that takes part in a dependency cycle.
  pub fn new(graph: &ExecutionGraph) -> Result<Self, GraphError> {
    let mut dag = DiGraph::new();
    let mut indices = HashMap::new();

    for node in graph.nodes() {
      let idx = dag.add_node(node.id().clone());
      indices.insert(node.id().clone(), idx);
    }

    for node in graph.nodes() {
      for input in node.inputs().values() {
        graph.output_kind(input.source())?;
      }

      let dependent_idx = indices[node.id()];
      for dep in node.dependencies() {
        let dep_idx = indices[dep];
        dag.add_edge(dep_idx, dependent_idx, ());
      }
    }

    toposort(&dag, None).map_err(|cycle| GraphError::Cycle(dag[cycle.node_id()].clone()))?;

    Ok(Self { dag, indices })
  }

  /// Plan only the nodes needed to produce the named results.
  ///
  /// The whole graph is still checked for cycles first.
  pub fn for_results<S: AsRef<str>>(graph: &ExecutionGraph, names: &[S]) -> Result<Self, GraphError> {
    let full = Self::new(graph)?;
    let mut keep: HashSet<NodeIndex> = HashSet::new();

    for name in names {
      let output = graph.result(name.as_ref())?;
      let start = full
        .indices
        .get(&output.node)
        .copied()
        .ok_or_else(|| GraphError::UnknownOutput {
          node: output.node.clone(),
          output: output.output.clone(),
        })?;

      let reversed = Reversed(&full.dag);
      let mut dfs = Dfs::new(reversed, start);
      while let Some(idx) = dfs.next(reversed) {
        keep.insert(idx);
      }
    }

    let dag = full
      .dag
      .filter_map(|idx, id| keep.contains(&idx).then(|| id.clone()), |_, _| Some(()));
    let indices = dag.node_indices().map(|idx| (dag[idx].clone(), idx)).collect();

    Ok(Self { dag, indices })
  }

  pub fn len(&self) -> usize {
    self.dag.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.dag.node_count() == 0
  }

  pub fn contains(&self, id: &str) -> bool {
    self.indices.contains_key(id)
  }

  /// Group nodes into waves that can run in parallel.
  ///
  /// Every node's dependencies sit in earlier waves. Within a wave nodes keep
  /// graph insertion order, so the result is stable across runs.
  pub fn waves(&self) -> Vec<Vec<NodeId>> {
    let mut in_degree: Vec<usize> = self
      .dag
      .node_indices()
      .map(|idx| self.dag.neighbors_directed(idx, Direction::Incoming).count())
      .collect();

    let mut remaining: Vec<NodeIndex> = self.dag.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let (ready, rest): (Vec<NodeIndex>, Vec<NodeIndex>) =
        std::mem::take(&mut remaining).into_iter().partition(|idx| in_degree[idx.index()] == 0);

      // Unreachable for a validated plan; stop rather than loop forever.
      if ready.is_empty() {
        break;
      }

      for &idx in &ready {
        for neighbor in self.dag.neighbors_directed(idx, Direction::Outgoing) {
          in_degree[neighbor.index()] = in_degree[neighbor.index()].saturating_sub(1);
        }
      }

      waves.push(ready.into_iter().map(|idx| self.dag[idx].clone()).collect());
      remaining = rest;
    }

    waves
  }

  /// Nodes in dependency order; ties broken by insertion order.
  pub fn topological_order(&self) -> Vec<NodeId> {
    self.waves().into_iter().flatten().collect()
  }

  /// Direct producers a node reads from.
  pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct consumers of a node's outputs.
  pub fn dependents(&self, id: &str) -> Vec<NodeId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &str, direction: Direction) -> Vec<NodeId> {
    let Some(&idx) = self.indices.get(id) else {
      return Vec::new();
    };

    let mut ids: Vec<(usize, NodeId)> = self
      .dag
      .neighbors_directed(idx, direction)
      .map(|n| (n.index(), self.dag[n].clone()))
      .collect();
    ids.sort_by_key(|(index, _)| *index);
    ids.into_iter().map(|(_, id)| id).collect()
  }
}
