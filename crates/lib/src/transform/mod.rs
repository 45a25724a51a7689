//! Graph rewrites applied between graph construction and execution.
//!
//! A transform gets full mutable access to an [`ExecutionGraph`]. Transforms
//! only add nodes and rewire handles, so one that fails part way leaves every
//! earlier rewrite intact.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::graph::{ExecutionGraph, GraphError, NodeBuilder, NodeId, OutputRef};
use crate::recipe::{StepDescriptor, wire_step};
use crate::step::StepRegistry;

#[derive(Debug, Error)]
pub enum TransformError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error("replacement node `{node}` declared no outputs")]
  NoOutput { node: NodeId },

  #[error("replacement node `{node}` returned `{output}`, which is not one of its own outputs")]
  ForeignOutput { node: NodeId, output: OutputRef },

  #[error("replacement node `{node}` has unknown step type `{step_type}`")]
  UnknownStepType { node: NodeId, step_type: String },
}

/// What a transform may consult besides the graph itself.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
  pub steps: &'a StepRegistry,
}

pub trait GraphTransform: Send + Sync {
  fn name(&self) -> &str;

  fn apply(&self, graph: &mut ExecutionGraph, ctx: &TransformContext<'_>) -> Result<(), TransformError>;
}

/// Splice a new node between an output and all of its consumers.
///
/// The factory configures the new node (usually wiring the original output
/// into one of its inputs) and returns the output that supersedes the
/// original. Every other node's input that read the original, and every named
/// result bound to it, is redirected to that output.
pub struct ReplaceNodeOutput<F> {
  node: NodeId,
  output: String,
  new_node: NodeId,
  factory: F,
}

impl<F> ReplaceNodeOutput<F>
where
  F: Fn(&mut NodeBuilder<'_>, &OutputRef, &TransformContext<'_>) -> Result<OutputRef, TransformError> + Send + Sync,
{
  pub fn new(node: impl Into<NodeId>, output: impl Into<String>, new_node: impl Into<NodeId>, factory: F) -> Self {
    Self {
      node: node.into(),
      output: output.into(),
      new_node: new_node.into(),
      factory,
    }
  }
}

impl<F> fmt::Debug for ReplaceNodeOutput<F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReplaceNodeOutput")
      .field("node", &self.node)
      .field("output", &self.output)
      .field("new_node", &self.new_node)
      .finish_non_exhaustive()
  }
}

impl<F> GraphTransform for ReplaceNodeOutput<F>
where
  F: Fn(&mut NodeBuilder<'_>, &OutputRef, &TransformContext<'_>) -> Result<OutputRef, TransformError> + Send + Sync,
{
  fn name(&self) -> &str {
    "replaceNodeOutput"
  }

  fn apply(&self, graph: &mut ExecutionGraph, ctx: &TransformContext<'_>) -> Result<(), TransformError> {
    let original = graph.get_output(self.node.as_str(), &self.output)?;

    let mut builder = graph.add_node(self.new_node.clone())?;
    let replacement = (self.factory)(&mut builder, &original, ctx)?;
    if &replacement.node != builder.id() || !builder.has_output(&replacement.output) {
      return Err(TransformError::ForeignOutput {
        node: self.new_node.clone(),
        output: replacement,
      });
    }
    let new_id = builder.build();

    let rewired = graph.replace_references(&original, &replacement, &new_id);
    let rebound = graph.rebind_results(&original, &replacement);

    info!(
      original = %original,
      replacement = %replacement,
      rewired,
      rebound,
      "replaced node output"
    );
    Ok(())
  }
}

fn default_input_name() -> String {
  "input".to_string()
}

/// Transforms as they appear in a recipe's `overrides` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransformSpec {
  /// Insert a node running `step` in front of every consumer of `node.output`.
  ///
  /// The original output is wired into the new node's `input_name` input. The
  /// replacement is the new node's output of the same name, or its first
  /// declared output if it has none by that name.
  #[serde(rename_all = "camelCase")]
  ReplaceNodeOutput {
    node: NodeId,
    output: String,
    new_node: NodeId,
    step: StepDescriptor,
    #[serde(default = "default_input_name")]
    input_name: String,
  },
}

impl TransformSpec {
  pub fn to_transform(&self) -> Box<dyn GraphTransform> {
    match self {
      TransformSpec::ReplaceNodeOutput {
        node,
        output,
        new_node,
        step,
        input_name,
      } => {
        let step = step.clone();
        let input_name = input_name.clone();
        Box::new(ReplaceNodeOutput::new(
          node.clone(),
          output.clone(),
          new_node.clone(),
          move |builder: &mut NodeBuilder<'_>, original: &OutputRef, ctx: &TransformContext<'_>| {
            let action = ctx
              .steps
              .resolve(&step.step_type)
              .ok_or_else(|| TransformError::UnknownStepType {
                node: builder.id().clone(),
                step_type: step.step_type.clone(),
              })?;

            builder.input(input_name.clone(), original.clone())?;
            let outputs = wire_step(builder, &step, action.as_ref())?;

            outputs
              .iter()
              .find(|o| o.output == original.output)
              .or_else(|| outputs.first())
              .cloned()
              .ok_or_else(|| TransformError::NoOutput {
                node: builder.id().clone(),
              })
          },
        ))
      }
    }
  }
}

/// Apply `transforms` in order, then check the result is still acyclic.
///
/// Each transform sees the graph as rewired by the ones before it.
pub fn apply_transforms(
  graph: &mut ExecutionGraph,
  transforms: &[Box<dyn GraphTransform>],
  ctx: &TransformContext<'_>,
) -> Result<(), TransformError> {
  for transform in transforms {
    debug!(transform = transform.name(), "applying transform");
    transform.apply(graph, ctx)?;
  }
  graph.validate()?;
  Ok(())
}
