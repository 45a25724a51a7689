use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use formwork_lib::graph::ExecutionPlan;
use formwork_lib::recipe::{self, Recipe};
use formwork_lib::step::{OpaqueStep, StepRegistry};

use crate::output::{OutputFormat, print_detail, print_info, print_json, print_stat, print_success};

#[derive(Serialize)]
struct PlannedNode {
  id: String,
  step_type: String,
  depends_on: Vec<String>,
}

#[derive(Serialize)]
struct PlanOutput {
  recipe: String,
  nodes: usize,
  waves: Vec<Vec<PlannedNode>>,
  /// Result name -> `node.output` after overrides.
  results: BTreeMap<String, String>,
}

/// Build the recipe's graph, apply its overrides and show what would run.
///
/// Step kinds are not executed here, so every type resolves to a placeholder
/// declaring the default `output` artifact.
pub fn cmd_plan(path: &Path, results: &[String], verbose: bool, output: OutputFormat) -> Result<()> {
  let recipe = Recipe::load(path).with_context(|| format!("Failed to load recipe {}", path.display()))?;
  let registry = StepRegistry::new().with_fallback(Arc::new(OpaqueStep));

  let graph = recipe::prepare(&recipe, &registry).context("Failed to prepare execution graph")?;
  let plan = match results {
    [] => ExecutionPlan::new(&graph),
    names => ExecutionPlan::for_results(&graph, names),
  };
  let plan = plan.context("Failed to plan execution")?;

  let waves: Vec<Vec<PlannedNode>> = plan
    .waves()
    .into_iter()
    .map(|wave| {
      wave
        .into_iter()
        .filter_map(|id| {
          let node = graph.node(id.as_str())?;
          Some(PlannedNode {
            id: id.to_string(),
            step_type: node.step_type().to_string(),
            depends_on: plan.dependencies(id.as_str()).iter().map(ToString::to_string).collect(),
          })
        })
        .collect()
    })
    .collect();

  let shown_results: BTreeMap<String, String> = graph
    .results()
    .iter()
    .filter(|(name, _)| results.is_empty() || results.contains(name))
    .map(|(name, out)| (name.clone(), out.to_string()))
    .collect();

  let summary = PlanOutput {
    recipe: path.display().to_string(),
    nodes: plan.len(),
    waves,
    results: shown_results,
  };

  if output.is_json() {
    print_json(&summary)?;
    return Ok(());
  }

  for (index, wave) in summary.waves.iter().enumerate() {
    print_info(&format!("Wave {}", index + 1));
    for node in wave {
      println!("    {} ({})", node.id, node.step_type);
      if verbose && !node.depends_on.is_empty() {
        print_detail(&format!("after {}", node.depends_on.join(", ")));
      }
    }
  }

  println!();
  print_success(&format!(
    "Planned {} node(s) in {} wave(s)",
    summary.nodes,
    summary.waves.len()
  ));
  for (name, address) in &summary.results {
    print_stat(name, address);
  }

  Ok(())
}
