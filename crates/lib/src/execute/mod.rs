//! Plan execution.
//!
//! Waves run in order and the nodes of a wave run concurrently, bounded by
//! `parallelism`. Step actions are blocking and run on the blocking pool.
//! When a node fails, everything downstream of it is skipped; unrelated
//! nodes still run.
//!
//! Cacheable steps go through [`CacheStore::get_or_create`], keyed by step
//! type, parameters, declared outputs, the tool classpath and the content of
//! every input, so the shared cache lock brackets each materialization.
//! Uncached steps write under a scratch directory private to the run unless
//! the caller supplies one.

pub mod types;

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheKey, CacheStore};
use crate::classpath::ClasspathItem;
use crate::consts::{APP_NAME, RECIPE_VERSION};
use crate::graph::{ExecutionGraph, ExecutionPlan, GraphError, Node, NodeId, OutputKind};
use crate::step::{OutputValue, StepAction, StepContext, StepOutputs, StepRegistry};
use crate::util::hash::{HashAlgorithm, hash_bytes, hash_directory, hash_file};

pub use types::{ExecuteConfig, ExecuteError, ExecutionResult, NodeResult};

/// A node ready to run: its inputs are materialized and its action resolved.
struct NodeTask {
  node: Node,
  action: Arc<dyn StepAction>,
  inputs: BTreeMap<String, OutputValue>,
}

/// Execute every node of `plan`.
///
/// Node failures are reported in the returned [`ExecutionResult`]; an `Err`
/// means the plan does not match the graph.
pub async fn execute(
  graph: &ExecutionGraph,
  plan: &ExecutionPlan,
  registry: &StepRegistry,
  cache: Arc<CacheStore>,
  config: &ExecuteConfig,
) -> Result<ExecutionResult, ExecuteError> {
  let waves = plan.waves();
  info!(nodes = plan.len(), waves = waves.len(), "starting execution");

  let mut result = ExecutionResult::default();
  let mut failed: HashSet<NodeId> = HashSet::new();
  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));

  let mut config = config.clone();
  if config.work_dir.is_none() {
    let scratch = tempfile::Builder::new()
      .prefix(&format!("{APP_NAME}-run-"))
      .tempdir()
      .map_err(|source| ExecuteError::Io {
        path: std::env::temp_dir(),
        source,
      })?;
    debug!(dir = %scratch.path().display(), "created run scratch directory");
    config.work_dir = Some(scratch.path().to_path_buf());
    result.work_dir = Some(scratch);
  }

  for (wave_idx, wave) in waves.iter().enumerate() {
    debug!(wave = wave_idx, nodes = wave.len(), "executing wave");
    let mut tasks = Vec::new();

    for id in wave {
      let node = graph
        .node(id.as_str())
        .ok_or_else(|| GraphError::UnknownNode(id.clone()))?;

      if let Some(dep) = plan.dependencies(id.as_str()).into_iter().find(|d| failed.contains(d)) {
        warn!(node = %id, failed_dep = %dep, "skipping node due to failed dependency");
        failed.insert(id.clone());
        result.skipped.insert(id.clone(), dep);
        continue;
      }

      match prepare_task(node, registry, &result) {
        Ok(task) => tasks.push(task),
        Err(e) => {
          error!(node = %id, error = %e, "node failed");
          failed.insert(id.clone());
          result.failed.push((id.clone(), e));
        }
      }
    }

    if tasks.is_empty() {
      continue;
    }

    for (id, outcome) in execute_wave(tasks, &cache, &config, &semaphore).await {
      match outcome {
        Ok(node_result) => {
          info!(node = %id, cache_hit = node_result.cache_hit, "node completed");
          result.completed.insert(id, node_result);
        }
        Err(e) => {
          error!(node = %id, error = %e, "node failed");
          failed.insert(id.clone());
          result.failed.push((id, e));
        }
      }
    }
  }

  info!(
    completed = result.completed.len(),
    cache_hits = result.cache_hits(),
    failed = result.failed.len(),
    skipped = result.skipped.len(),
    "execution complete"
  );

  Ok(result)
}

fn prepare_task(node: &Node, registry: &StepRegistry, done: &ExecutionResult) -> Result<NodeTask, ExecuteError> {
  let action = registry
    .resolve(node.step_type())
    .ok_or_else(|| ExecuteError::UnknownStepType {
      node: node.id().clone(),
      step_type: node.step_type().to_string(),
    })?;

  let mut inputs = BTreeMap::new();
  for (name, input) in node.inputs() {
    let source = input.source();
    let value = done
      .completed
      .get(&source.node)
      .and_then(|r| r.outputs.get(&source.output))
      .cloned()
      .ok_or_else(|| ExecuteError::MissingOutput {
        node: source.node.clone(),
        output: source.output.clone(),
      })?;
    inputs.insert(name.clone(), value);
  }

  Ok(NodeTask {
    node: node.clone(),
    action,
    inputs,
  })
}

async fn execute_wave(
  tasks: Vec<NodeTask>,
  cache: &Arc<CacheStore>,
  config: &ExecuteConfig,
  semaphore: &Arc<Semaphore>,
) -> Vec<(NodeId, Result<NodeResult, ExecuteError>)> {
  let mut join_set = JoinSet::new();
  let mut pending: HashSet<NodeId> = tasks.iter().map(|t| t.node.id().clone()).collect();

  for task in tasks {
    let cache = Arc::clone(cache);
    let config = config.clone();
    let semaphore = Arc::clone(semaphore);

    join_set.spawn(async move {
      let id = task.node.id().clone();
      let join_error = |message: String| ExecuteError::Join {
        node: id.clone(),
        message,
      };

      let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => return (id.clone(), Err(join_error(e.to_string()))),
      };

      let outcome = tokio::task::spawn_blocking(move || run_node(&task, &cache, &config))
        .await
        .unwrap_or_else(|e| Err(join_error(e.to_string())));
      (id, outcome)
    });
  }

  let mut results = Vec::new();
  let mut lost = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(result) => {
        pending.remove(&result.0);
        results.push(result);
      }
      Err(e) => {
        error!(error = %e, "node task panicked");
        lost.push(e.to_string());
      }
    }
  }

  // A task that died never reported its id.
  let message = if lost.is_empty() { "task aborted".to_string() } else { lost.join("; ") };
  let mut pending: Vec<NodeId> = pending.into_iter().collect();
  pending.sort();
  for node in pending {
    results.push((
      node.clone(),
      Err(ExecuteError::Join {
        node,
        message: message.clone(),
      }),
    ));
  }
  results
}

fn run_node(task: &NodeTask, cache: &CacheStore, config: &ExecuteConfig) -> Result<NodeResult, ExecuteError> {
  let node = &task.node;
  let mut ctx = StepContext {
    node: node.id().clone(),
    step_type: node.step_type().to_string(),
    parameters: node.parameters().clone(),
    inputs: task.inputs.clone(),
    output_dir: PathBuf::new(),
    classpath: Arc::clone(&config.classpath),
  };
  let run_action = |ctx: &StepContext| {
    task.action.run(ctx).map_err(|source| ExecuteError::Action {
      node: node.id().clone(),
      source,
    })
  };

  if !task.action.cacheable() {
    let dir = config
      .work_dir
      .clone()
      .unwrap_or_else(std::env::temp_dir)
      .join(sanitize_id(node.id()));
    fs::create_dir_all(&dir).map_err(|source| ExecuteError::Io {
      path: dir.clone(),
      source,
    })?;
    ctx.output_dir = dir.clone();

    debug!(node = %node.id(), dir = %dir.display(), "running uncached step");
    let produced = run_action(&ctx)?;
    let outputs = collect_outputs(node, produced, &dir, false)?;
    return Ok(NodeResult {
      outputs,
      cache_path: None,
      cache_hit: false,
    });
  }

  let key = cache_key(node, &task.inputs, &config.classpath)?;
  let entry = cache.get_or_create(&key, |dir: &Path| -> Result<StepOutputs, ExecuteError> {
    ctx.output_dir = dir.to_path_buf();
    debug!(node = %node.id(), key = %key.lock_key(), "running step");
    let produced = run_action(&ctx)?;
    collect_outputs(node, produced, dir, true)
  })?;

  let outputs = entry
    .value
    .into_iter()
    .map(|(name, value)| {
      let value = match value {
        OutputValue::File(relative) => OutputValue::File(entry.path.join(relative)),
        other => other,
      };
      (name, value)
    })
    .collect();

  Ok(NodeResult {
    outputs,
    cache_path: Some(entry.path),
    cache_hit: entry.hit,
  })
}

/// The key a node's outputs are cached under.
fn cache_key(
  node: &Node,
  inputs: &BTreeMap<String, OutputValue>,
  classpath: &[ClasspathItem],
) -> Result<CacheKey, ExecuteError> {
  let mut builder = CacheKey::builder(node.step_type())
    .field("step", node.step_type())
    .field("recipe", RECIPE_VERSION.to_string())
    .field("classpath", classpath_digest(classpath));

  for (name, value) in node.parameters() {
    builder = builder.field(format!("param:{name}"), value.as_str());
  }

  for (name, kind) in node.outputs() {
    let kind = match kind {
      OutputKind::Value { value } => format!("value:{value}"),
      OutputKind::Artifact { extension } => format!("artifact:{extension}"),
    };
    builder = builder.field(format!("output:{name}"), kind);
  }

  for (name, value) in inputs {
    let digest = match value {
      OutputValue::Value(value) => format!("value:{value}"),
      OutputValue::File(path) => {
        let hash = if path.is_dir() {
          hash_directory(path, &[])
        } else {
          hash_file(HashAlgorithm::Sha256, path)
        };
        let hash = hash.map_err(|source| ExecuteError::InputHash {
          node: node.id().clone(),
          source,
        })?;
        format!("file:{hash}")
      }
    };
    builder = builder.field(format!("input:{name}"), digest);
  }

  Ok(builder.finish())
}

/// Check what an action produced against the node's declared outputs.
///
/// Value outputs the action left out take their declared value. Artifact
/// outputs must exist. With `relative`, file paths are made relative to `dir`
/// and files produced elsewhere are copied into it, so a cache entry is
/// self-contained.
fn collect_outputs(node: &Node, produced: StepOutputs, dir: &Path, relative: bool) -> Result<StepOutputs, ExecuteError> {
  let missing = |name: &str| ExecuteError::MissingOutput {
    node: node.id().clone(),
    output: name.to_string(),
  };

  let mut outputs = StepOutputs::new();
  for (name, kind) in node.outputs() {
    let value = match (produced.get(name), kind) {
      (Some(OutputValue::File(path)), _) => {
        let path = if path.is_relative() { dir.join(path) } else { path.clone() };
        if !path.exists() {
          return Err(missing(name));
        }
        if relative {
          OutputValue::File(relativize(&path, dir, name)?)
        } else {
          OutputValue::File(path)
        }
      }
      (Some(value @ OutputValue::Value(_)), _) => value.clone(),
      (None, OutputKind::Value { value }) => OutputValue::Value(value.clone()),
      (None, OutputKind::Artifact { .. }) => return Err(missing(name)),
    };
    outputs.insert(name.clone(), value);
  }

  for extra in produced.keys().filter(|k| !node.outputs().contains_key(*k)) {
    debug!(node = %node.id(), output = %extra, "ignoring undeclared output");
  }

  Ok(outputs)
}

fn relativize(path: &Path, dir: &Path, name: &str) -> Result<PathBuf, ExecuteError> {
  if let Ok(relative) = path.strip_prefix(dir) {
    return Ok(relative.to_path_buf());
  }

  let file_name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_else(|| name.to_string());
  let mut relative = PathBuf::from(&file_name);
  if dir.join(&relative).exists() {
    relative = PathBuf::from(format!("{name}-{file_name}"));
  }

  let dest = dir.join(&relative);
  fs::copy(path, &dest).map_err(|source| ExecuteError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(relative)
}

/// Order matters: earlier entries shadow later ones on a JVM classpath.
fn classpath_digest(classpath: &[ClasspathItem]) -> String {
  let lines: Vec<String> = classpath
    .iter()
    .map(|item| format!("{} {}", item.coordinate, item.source))
    .collect();
  hash_bytes(HashAlgorithm::Sha256, lines.join("\n").as_bytes()).0
}

/// A directory name for a node. The digest suffix keeps ids that sanitize
/// alike (`remap.client`, `remap_client`) apart.
fn sanitize_id(id: &NodeId) -> String {
  let readable: String = id
    .as_str()
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
    .collect();
  let digest = hash_bytes(HashAlgorithm::Sha256, id.as_str().as_bytes()).0;
  format!("{readable}-{}", &digest[..8])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::classpath::{ClasspathItem, LibrarySource};
  use crate::lock::{LockConfig, LockManager};
  use crate::recipe::{Recipe, StepDescriptor, build_graph};
  use crate::step::ActionError;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tempfile::TempDir;

  /// Appends its `text` parameter to its `input` and writes the result.
  struct Concat {
    calls: Arc<AtomicUsize>,
  }

  impl StepAction for Concat {
    fn outputs(&self, _step: &StepDescriptor) -> Vec<(String, OutputKind)> {
      vec![("output".to_string(), OutputKind::artifact("txt"))]
    }

    fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let mut text = match ctx.inputs.get("input") {
        Some(OutputValue::File(path)) => fs::read_to_string(path)?,
        Some(OutputValue::Value(value)) => value.clone(),
        None => String::new(),
      };
      text.push_str(ctx.parameters.get("text").map(String::as_str).unwrap_or_default());

      let path = ctx.output_path("output", "txt");
      fs::write(&path, text)?;
      Ok(BTreeMap::from([("output".to_string(), OutputValue::File(path))]))
    }
  }

  struct Fail;

  impl StepAction for Fail {
    fn run(&self, _ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      Err(ActionError::Failed("decompiler crashed".to_string()))
    }
  }

  /// Declares a constant value output and produces nothing itself.
  struct Version;

  impl StepAction for Version {
    fn outputs(&self, _step: &StepDescriptor) -> Vec<(String, OutputKind)> {
      vec![("id".to_string(), OutputKind::value("1.21"))]
    }

    fn run(&self, _ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      Ok(StepOutputs::new())
    }
  }

  /// Uncached step that records the classpath it was given.
  struct Launch;

  impl StepAction for Launch {
    fn cacheable(&self) -> bool {
      false
    }

    fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      let path = ctx.output_path("output", "jar");
      let classpath: Vec<String> = ctx.classpath.iter().map(|i| i.coordinate.to_string()).collect();
      fs::write(&path, classpath.join("\n"))?;
      Ok(BTreeMap::from([("output".to_string(), OutputValue::File(path))]))
    }
  }

  /// Uncached step that writes its `text` parameter.
  struct Label;

  impl StepAction for Label {
    fn cacheable(&self) -> bool {
      false
    }

    fn outputs(&self, _step: &StepDescriptor) -> Vec<(String, OutputKind)> {
      vec![("output".to_string(), OutputKind::artifact("txt"))]
    }

    fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      let path = ctx.output_path("output", "txt");
      fs::write(&path, &ctx.parameters["text"])?;
      Ok(BTreeMap::from([("output".to_string(), OutputValue::File(path))]))
    }
  }

  /// Cacheable step whose output depends only on the classpath.
  struct Tool {
    calls: Arc<AtomicUsize>,
  }

  impl StepAction for Tool {
    fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      let path = ctx.output_path("output", "jar");
      let classpath: Vec<String> = ctx.classpath.iter().map(|i| i.coordinate.to_string()).collect();
      fs::write(&path, classpath.join("\n"))?;
      Ok(BTreeMap::from([("output".to_string(), OutputValue::File(path))]))
    }
  }

  struct Panic;

  impl StepAction for Panic {
    fn run(&self, _ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      panic!("decompiler aborted");
    }
  }

  /// Hands its input back unchanged.
  struct Passthrough;

  impl StepAction for Passthrough {
    fn run(&self, ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      Ok(BTreeMap::from([("output".to_string(), ctx.input("input")?.clone())]))
    }
  }

  /// Claims an artifact output but never writes it.
  struct Forgetful;

  impl StepAction for Forgetful {
    fn run(&self, _ctx: &StepContext) -> Result<StepOutputs, ActionError> {
      Ok(StepOutputs::new())
    }
  }

  struct Fixture {
    temp: TempDir,
    calls: Arc<AtomicUsize>,
    registry: StepRegistry,
  }

  impl Fixture {
    fn new() -> Self {
      let calls = Arc::new(AtomicUsize::new(0));
      let concat = Arc::new(Concat {
        calls: Arc::clone(&calls),
      });
      let tool = Arc::new(Tool {
        calls: Arc::clone(&calls),
      });

      let mut registry = StepRegistry::new();
      registry
        .register("concat", concat)
        .register("fail", Arc::new(Fail))
        .register("version", Arc::new(Version))
        .register("launch", Arc::new(Launch))
        .register("passthrough", Arc::new(Passthrough))
        .register("forgetful", Arc::new(Forgetful))
        .register("label", Arc::new(Label))
        .register("tool", tool)
        .register("panic", Arc::new(Panic));

      Self {
        temp: TempDir::new().unwrap(),
        calls,
        registry,
      }
    }

    fn cache(&self) -> Arc<CacheStore> {
      Arc::new(CacheStore::new(LockManager::new(
        self.temp.path().join("cache"),
        LockConfig::default(),
      )))
    }

    fn config(&self) -> ExecuteConfig {
      ExecuteConfig {
        parallelism: 2,
        classpath: Arc::new(Vec::new()),
        work_dir: Some(self.temp.path().join("work")),
      }
    }

    fn graph(&self, recipe: &str) -> ExecutionGraph {
      build_graph(&Recipe::from_json(recipe).unwrap(), &self.registry).unwrap()
    }

    async fn run(&self, graph: &ExecutionGraph) -> ExecutionResult {
      let plan = ExecutionPlan::new(graph).unwrap();
      execute(graph, &plan, &self.registry, self.cache(), &self.config())
        .await
        .unwrap()
    }
  }

  fn chain(first: &str) -> String {
    format!(
      r#"{{
        "version": 1,
        "steps": [
          {{ "type": "concat", "name": "download", "parameters": {{ "text": "{first}" }} }},
          {{ "type": "concat", "name": "patch", "parameters": {{ "input": "{{download.output}}", "text": "b" }} }},
          {{ "type": "concat", "name": "rename", "parameters": {{ "input": "{{patchOutput}}", "text": "c" }} }}
        ],
        "results": {{ "final": "rename.output" }}
      }}"#
    )
  }

  fn read(result: &ExecutionResult, graph: &ExecutionGraph, name: &str) -> String {
    let value = result.result_value(graph, name).unwrap().unwrap();
    fs::read_to_string(value.as_path().unwrap()).unwrap()
  }

  #[tokio::test]
  async fn chain_runs_in_order_and_reuses_cache() {
    let fixture = Fixture::new();
    let graph = fixture.graph(&chain("a"));

    let first = fixture.run(&graph).await;
    assert!(first.is_success(), "{:?}", first.failed);
    assert_eq!(first.completed.len(), 3);
    assert_eq!(first.cache_hits(), 0);
    assert_eq!(read(&first, &graph, "final"), "abc");

    let second = fixture.run(&graph).await;
    assert_eq!(second.cache_hits(), 3);
    assert_eq!(fixture.calls.load(Ordering::SeqCst), 3);
    assert_eq!(read(&second, &graph, "final"), "abc");
    assert!(second.completed[&NodeId::from("rename")].cache_path.is_some());
  }

  #[tokio::test]
  async fn upstream_change_invalidates_downstream() {
    let fixture = Fixture::new();
    fixture.run(&fixture.graph(&chain("a"))).await;

    let graph = fixture.graph(&chain("x"));
    let result = fixture.run(&graph).await;
    assert_eq!(result.cache_hits(), 0);
    assert_eq!(fixture.calls.load(Ordering::SeqCst), 6);
    assert_eq!(read(&result, &graph, "final"), "xbc");
  }

  #[tokio::test]
  async fn failure_skips_dependents_only() {
    let fixture = Fixture::new();
    let graph = fixture.graph(
      r#"{
        "version": 1,
        "steps": [
          { "type": "fail", "name": "decompile" },
          { "type": "concat", "name": "patch", "parameters": { "input": "{decompileOutput}" } },
          { "type": "concat", "name": "remap", "parameters": { "input": "{patch.output}" } },
          { "type": "concat", "name": "assets", "parameters": { "text": "ok" } }
        ]
      }"#,
    );

    let result = fixture.run(&graph).await;
    assert!(!result.is_success());
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, NodeId::from("decompile"));
    assert!(matches!(result.failed[0].1, ExecuteError::Action { .. }));
    assert_eq!(result.skipped[&NodeId::from("patch")], NodeId::from("decompile"));
    assert_eq!(result.skipped[&NodeId::from("remap")], NodeId::from("patch"));
    assert!(result.completed.contains_key(&NodeId::from("assets")));
    assert_eq!(result.total(), 4);
  }

  #[tokio::test]
  async fn declared_values_flow_into_inputs() {
    let fixture = Fixture::new();
    let graph = fixture.graph(
      r#"{
        "version": 1,
        "steps": [
          { "type": "version" },
          { "type": "concat", "name": "label", "parameters": { "input": "{version.id}", "text": "-client" } }
        ],
        "results": { "label": "label.output" }
      }"#,
    );

    let result = fixture.run(&graph).await;
    assert_eq!(
      result.completed[&NodeId::from("version")].outputs["id"],
      OutputValue::Value("1.21".to_string())
    );
    assert_eq!(read(&result, &graph, "label"), "1.21-client");
  }

  #[tokio::test]
  async fn uncached_steps_use_work_dir_and_see_classpath() {
    let fixture = Fixture::new();
    let graph = fixture.graph(r#"{"version": 1, "steps": [{ "type": "launch" }], "results": { "jar": "launch.output" }}"#);

    let mut config = fixture.config();
    config.classpath = Arc::new(vec![ClasspathItem {
      coordinate: "org.ow2.asm:asm:9.7".parse().unwrap(),
      source: LibrarySource::Explicit,
    }]);
    let plan = ExecutionPlan::new(&graph).unwrap();
    let result = execute(&graph, &plan, &fixture.registry, fixture.cache(), &config)
      .await
      .unwrap();

    let node = &result.completed[&NodeId::from("launch")];
    assert!(node.cache_path.is_none());
    let path = node.outputs["output"].as_path().unwrap();
    assert!(path.starts_with(config.work_dir.as_ref().unwrap()));
    assert_eq!(fs::read_to_string(path).unwrap(), "org.ow2.asm:asm:9.7");
    assert!(result.work_dir.is_none());
  }

  #[tokio::test]
  async fn default_work_dir_is_private_to_the_run() {
    let fixture = Fixture::new();
    let graph = fixture.graph(r#"{"version": 1, "steps": [{ "type": "launch" }]}"#);
    let config = ExecuteConfig {
      work_dir: None,
      ..fixture.config()
    };
    let plan = ExecutionPlan::new(&graph).unwrap();

    let first = execute(&graph, &plan, &fixture.registry, fixture.cache(), &config)
      .await
      .unwrap();
    let second = execute(&graph, &plan, &fixture.registry, fixture.cache(), &config)
      .await
      .unwrap();

    let first_dir = first.work_dir.as_ref().unwrap().path().to_path_buf();
    let second_dir = second.work_dir.as_ref().unwrap().path();
    assert_ne!(first_dir, second_dir);

    let path = first.completed[&NodeId::from("launch")].outputs["output"]
      .as_path()
      .unwrap()
      .to_path_buf();
    assert!(path.starts_with(&first_dir));
    assert!(path.is_file());

    drop(first);
    assert!(!first_dir.exists());
  }

  #[tokio::test]
  async fn uncached_ids_that_sanitize_alike_keep_separate_outputs() {
    let fixture = Fixture::new();
    let graph = fixture.graph(
      r#"{
        "version": 1,
        "steps": [
          { "type": "label", "name": "remap.client", "parameters": { "text": "client" } },
          { "type": "label", "name": "remap_client", "parameters": { "text": "server" } }
        ]
      }"#,
    );

    let result = fixture.run(&graph).await;
    assert!(result.is_success(), "{:?}", result.failed);

    let dotted = result.completed[&NodeId::from("remap.client")].outputs["output"].as_path().unwrap();
    let underscored = result.completed[&NodeId::from("remap_client")].outputs["output"].as_path().unwrap();
    assert_ne!(dotted.parent(), underscored.parent());
    assert_eq!(fs::read_to_string(dotted).unwrap(), "client");
    assert_eq!(fs::read_to_string(underscored).unwrap(), "server");
  }

  #[test]
  fn node_dir_names_are_distinct_and_readable() {
    let dotted = sanitize_id(&NodeId::from("remap.client"));
    let underscored = sanitize_id(&NodeId::from("remap_client"));
    assert_ne!(dotted, underscored);
    assert!(dotted.starts_with("remap_client-"));
    assert_eq!(dotted, sanitize_id(&NodeId::from("remap.client")));
  }

  #[tokio::test]
  async fn classpath_change_misses_cache() {
    let fixture = Fixture::new();
    let graph = fixture.graph(r#"{"version": 1, "steps": [{ "type": "tool" }], "results": { "jar": "tool.output" }}"#);
    let plan = ExecutionPlan::new(&graph).unwrap();
    let with_decompiler = |version: &str| ExecuteConfig {
      classpath: Arc::new(vec![ClasspathItem {
        coordinate: format!("org.vineflower:vineflower:{version}").parse().unwrap(),
        source: LibrarySource::Explicit,
      }]),
      ..fixture.config()
    };

    let first = execute(&graph, &plan, &fixture.registry, fixture.cache(), &with_decompiler("1.9.0"))
      .await
      .unwrap();
    assert_eq!(read(&first, &graph, "jar"), "org.vineflower:vineflower:1.9.0");

    let again = execute(&graph, &plan, &fixture.registry, fixture.cache(), &with_decompiler("1.9.0"))
      .await
      .unwrap();
    assert_eq!(again.cache_hits(), 1);

    let second = execute(&graph, &plan, &fixture.registry, fixture.cache(), &with_decompiler("1.10.0"))
      .await
      .unwrap();
    assert_eq!(second.cache_hits(), 0);
    assert_eq!(fixture.calls.load(Ordering::SeqCst), 2);
    assert_eq!(read(&second, &graph, "jar"), "org.vineflower:vineflower:1.10.0");
  }

  #[tokio::test]
  async fn panicking_step_fails_node_and_skips_dependents() {
    let fixture = Fixture::new();
    let graph = fixture.graph(
      r#"{
        "version": 1,
        "steps": [
          { "type": "panic", "name": "decompile" },
          { "type": "concat", "name": "patch", "parameters": { "input": "{decompileOutput}" } },
          { "type": "concat", "name": "assets", "parameters": { "text": "ok" } }
        ]
      }"#,
    );

    let result = fixture.run(&graph).await;
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, NodeId::from("decompile"));
    assert!(matches!(
      &result.failed[0].1,
      ExecuteError::Join { node, .. } if node == &NodeId::from("decompile")
    ));
    assert_eq!(result.skipped[&NodeId::from("patch")], NodeId::from("decompile"));
    assert!(result.completed.contains_key(&NodeId::from("assets")));
    assert_eq!(result.total(), 3);
  }

  #[tokio::test]
  async fn outputs_from_outside_are_copied_into_entry() {
    let fixture = Fixture::new();
    let graph = fixture.graph(
      r#"{
        "version": 1,
        "steps": [
          { "type": "launch", "name": "source" },
          { "type": "passthrough", "name": "copy", "parameters": { "input": "{sourceOutput}" } }
        ]
      }"#,
    );

    let result = fixture.run(&graph).await;
    let copy = &result.completed[&NodeId::from("copy")];
    let entry = copy.cache_path.as_ref().unwrap();
    let path = copy.outputs["output"].as_path().unwrap();
    assert!(path.starts_with(entry));
    assert!(path.is_file());
  }

  #[tokio::test]
  async fn missing_artifact_fails_node() {
    let fixture = Fixture::new();
    let graph = fixture.graph(r#"{"version": 1, "steps": [{ "type": "forgetful" }]}"#);

    let result = fixture.run(&graph).await;
    assert!(matches!(
      &result.failed[0].1,
      ExecuteError::MissingOutput { output, .. } if output == "output"
    ));
    assert!(!fixture.temp.path().join("cache").join("forgetful").read_dir().unwrap().any(|e| {
      e.unwrap().file_name().to_string_lossy().starts_with('.')
    }));
  }

  #[tokio::test]
  async fn plan_for_results_runs_only_ancestors() {
    let fixture = Fixture::new();
    let graph = fixture.graph(
      r#"{
        "version": 1,
        "steps": [
          { "type": "concat", "name": "server", "parameters": { "text": "s" } },
          { "type": "concat", "name": "client", "parameters": { "text": "c" } },
          { "type": "concat", "name": "remapClient", "parameters": { "input": "{clientOutput}" } }
        ],
        "results": { "client": "remapClient.output", "server": "server.output" }
      }"#,
    );

    let plan = ExecutionPlan::for_results(&graph, &["client"]).unwrap();
    let result = execute(&graph, &plan, &fixture.registry, fixture.cache(), &fixture.config())
      .await
      .unwrap();

    assert_eq!(result.completed.len(), 2);
    assert!(!result.completed.contains_key(&NodeId::from("server")));
    assert_eq!(result.result_value(&graph, "server").unwrap(), None);
  }

  #[tokio::test]
  async fn unregistered_step_type_fails_node() {
    let fixture = Fixture::new();
    let mut graph = ExecutionGraph::new();
    let mut builder = graph.add_node("mystery").unwrap();
    builder.output("output", OutputKind::artifact("jar")).unwrap();
    builder.build();

    let result = fixture.run(&graph).await;
    assert!(matches!(result.failed[0].1, ExecuteError::UnknownStepType { .. }));
  }
}
