//! Types for node execution.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use thiserror::Error;

use crate::cache::CacheError;
use crate::classpath::ClasspathItem;
use crate::graph::{ExecutionGraph, GraphError, NodeId};
use crate::step::{ActionError, OutputValue, StepOutputs};
use crate::util::hash::HashError;

/// Errors that can occur while executing a node.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("node `{node}` has unknown step type `{step_type}`")]
  UnknownStepType { node: NodeId, step_type: String },

  #[error("step `{node}` failed: {source}")]
  Action {
    node: NodeId,
    #[source]
    source: ActionError,
  },

  /// A declared artifact output was not produced, or an input's producer did
  /// not materialize the referenced output.
  #[error("node `{node}` is missing output `{output}`")]
  MissingOutput { node: NodeId, output: String },

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error("failed to hash input of `{node}`: {source}")]
  InputHash {
    node: NodeId,
    #[source]
    source: HashError,
  },

  #[error("io error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The node's task panicked or was cancelled.
  #[error("task for `{node}` did not complete: {message}")]
  Join { node: NodeId, message: String },
}

impl ExecuteError {
  /// Lock contention is worth retrying after a backoff; nothing else is.
  pub fn is_retryable(&self) -> bool {
    match self {
      ExecuteError::Cache(err) => err.is_retryable(),
      _ => false,
    }
  }
}

/// What one node produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeResult {
  /// Output values by name; file outputs are absolute paths.
  pub outputs: StepOutputs,

  /// Cache entry holding the outputs, for cacheable steps.
  pub cache_path: Option<PathBuf>,

  /// Whether the outputs were reused rather than produced.
  pub cache_hit: bool,
}

/// Result of executing a plan.
#[derive(Debug, Default)]
pub struct ExecutionResult {
  pub completed: HashMap<NodeId, NodeResult>,

  /// Nodes that failed, in the order they were observed.
  pub failed: Vec<(NodeId, ExecuteError)>,

  /// Nodes not run because a dependency failed or was skipped.
  /// Maps skipped node -> the dependency responsible.
  pub skipped: HashMap<NodeId, NodeId>,

  /// Scratch directory created for this run when the config named none.
  /// Uncached outputs live here and are removed when the result is dropped.
  pub work_dir: Option<TempDir>,
}

impl ExecutionResult {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty()
  }

  pub fn total(&self) -> usize {
    self.completed.len() + self.failed.len() + self.skipped.len()
  }

  pub fn cache_hits(&self) -> usize {
    self.completed.values().filter(|r| r.cache_hit).count()
  }

  /// The materialized value of the named graph result, if its node completed.
  pub fn result_value(&self, graph: &ExecutionGraph, name: &str) -> Result<Option<&OutputValue>, GraphError> {
    let output = graph.result(name)?;
    Ok(
      self
        .completed
        .get(&output.node)
        .and_then(|r| r.outputs.get(&output.output)),
    )
  }
}

/// Configuration for plan execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of nodes to run at once.
  pub parallelism: usize,

  /// Effective tool classpath handed to every step.
  pub classpath: Arc<Vec<ClasspathItem>>,

  /// Scratch space for steps whose results are not cached. When unset, each
  /// run gets a fresh temporary directory.
  pub work_dir: Option<PathBuf>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      classpath: Arc::new(Vec::new()),
      work_dir: None,
    }
  }
}

/// Get the number of CPUs for default parallelism.
pub(crate) fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::OutputKind;
  use std::collections::BTreeMap;

  #[test]
  fn execution_result_success_when_empty() {
    let result = ExecutionResult::default();
    assert!(result.is_success());
    assert_eq!(result.total(), 0);
  }

  #[test]
  fn execution_result_failure_with_skips() {
    let mut result = ExecutionResult::default();
    result.failed.push((
      NodeId::from("a"),
      ExecuteError::MissingOutput {
        node: NodeId::from("a"),
        output: "output".to_string(),
      },
    ));
    result.skipped.insert(NodeId::from("b"), NodeId::from("a"));

    assert!(!result.is_success());
    assert_eq!(result.total(), 2);
  }

  #[test]
  fn result_value_follows_named_result() {
    let mut graph = ExecutionGraph::new();
    let mut builder = graph.add_node("version").unwrap();
    let out = builder.output("id", OutputKind::value("1.21")).unwrap();
    builder.build();
    graph.set_result("version", out).unwrap();

    let mut result = ExecutionResult::default();
    assert_eq!(result.result_value(&graph, "version").unwrap(), None);

    result.completed.insert(
      NodeId::from("version"),
      NodeResult {
        outputs: BTreeMap::from([("id".to_string(), OutputValue::Value("1.21".to_string()))]),
        cache_path: None,
        cache_hit: false,
      },
    );
    assert_eq!(
      result.result_value(&graph, "version").unwrap(),
      Some(&OutputValue::Value("1.21".to_string()))
    );
    assert!(result.result_value(&graph, "missing").is_err());
  }

  #[test]
  fn only_lock_contention_is_retryable() {
    let err = ExecuteError::MissingOutput {
      node: NodeId::from("a"),
      output: "output".to_string(),
    };
    assert!(!err.is_retryable());
  }
}
