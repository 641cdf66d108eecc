//! The construction environment.
//!
//! An [`Environment`] owns every node, builder and alias of one construction
//! run together with its configuration variables and signature store. Host
//! code declares the graph through it and then asks it to build names.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::builder::{Builder, config_signature};
use crate::config::EnvConfig;
use crate::error::ConfigError;
use crate::execute::{self, BuildReport, ExecuteConfig, ExecuteError, PreparedBuild};
use crate::graph::{BuilderId, DependencyGraph, GraphError};
use crate::node::{Identity, NodeId, NodeInfo, NodeKind, NodeRegistry, NodeSpec};
use crate::state::{SignatureStore, StaleReason};
use crate::util::hash::Signature;
use crate::util::paths::normalize;

pub(crate) struct BuilderEntry {
  pub(crate) builder: Arc<dyn Builder>,
  pub(crate) name: String,
  pub(crate) config: Signature,
}

pub struct Environment {
  pub(crate) config: EnvConfig,
  pub(crate) registry: NodeRegistry,
  pub(crate) graph: DependencyGraph,
  pub(crate) builders: Vec<BuilderEntry>,
  pub(crate) aliases: BTreeMap<String, NodeId>,
  pub(crate) vars: BTreeMap<String, serde_json::Value>,
  pub(crate) store: SignatureStore,
  pub(crate) execute: ExecuteConfig,
}

impl std::fmt::Debug for Environment {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Environment")
      .field("root", &self.config.root)
      .field("nodes", &self.registry.len())
      .field("builders", &self.builders.len())
      .finish_non_exhaustive()
  }
}

impl Environment {
  /// Create an environment. The root is canonicalized when it exists.
  pub fn new(config: EnvConfig) -> Self {
    let mut config = config;
    if let Ok(root) = dunce::canonicalize(&config.root)
      && root != config.root
    {
      let rebase = |p: &Path| match p.strip_prefix(&config.root) {
        Ok(rel) => root.join(rel),
        Err(_) => p.to_path_buf(),
      };
      config.build_root = rebase(&config.build_root);
      config.state_dir = rebase(&config.state_dir);
      config.root = root;
    }

    Self {
      registry: NodeRegistry::new(config.signature_mode),
      graph: DependencyGraph::new(),
      builders: Vec::new(),
      aliases: BTreeMap::new(),
      vars: BTreeMap::new(),
      store: SignatureStore::new(config.state_dir.clone()),
      execute: ExecuteConfig::default(),
      config,
    }
  }

  /// Environment rooted at `root` with default locations.
  pub fn at(root: impl Into<PathBuf>) -> Self {
    Self::new(EnvConfig::new(root))
  }

  pub fn config(&self) -> &EnvConfig {
    &self.config
  }

  pub fn root(&self) -> &Path {
    &self.config.root
  }

  pub fn build_root(&self) -> &Path {
    &self.config.build_root
  }

  pub fn store(&self) -> &SignatureStore {
    &self.store
  }

  pub fn registry(&self) -> &NodeRegistry {
    &self.registry
  }

  pub fn graph(&self) -> &DependencyGraph {
    &self.graph
  }

  /// Execution settings used by [`request_build`](Self::request_build).
  pub fn set_execute_config(&mut self, config: ExecuteConfig) {
    self.execute = config;
  }

  pub fn execute_config(&self) -> &ExecuteConfig {
    &self.execute
  }

  /// Intern a node and give it a graph slot.
  pub fn intern_node(&mut self, identity: Identity, kind: NodeKind) -> Result<NodeId, ConfigError> {
    let id = self.registry.intern(identity, kind)?;
    self.graph.add_node(id);
    Ok(id)
  }

  pub(crate) fn intern_spec(&mut self, spec: &NodeSpec) -> Result<NodeId, ConfigError> {
    self.intern_node(spec.identity.clone(), spec.kind)
  }

  /// A file node; relative paths are taken from the root.
  pub fn file(&mut self, path: impl AsRef<Path>) -> Result<NodeId, ConfigError> {
    let path = normalize(&self.config.root, path.as_ref());
    self.intern_node(Identity::path(path), NodeKind::File)
  }

  /// A directory node; relative paths are taken from the root.
  pub fn dir(&mut self, path: impl AsRef<Path>) -> Result<NodeId, ConfigError> {
    let path = normalize(&self.config.root, path.as_ref());
    self.intern_node(Identity::path(path), NodeKind::Dir)
  }

  /// A value node. Interning an existing value replaces its content.
  pub fn value(
    &mut self,
    scope: impl Into<String>,
    name: impl Into<String>,
    value: serde_json::Value,
  ) -> Result<NodeId, ConfigError> {
    let id = self.intern_node(Identity::value(scope, name), NodeKind::Value)?;
    self.registry.set_value(id, value)?;
    Ok(id)
  }

  /// Register a builder producing `targets` from `sources`.
  pub fn register_builder(
    &mut self,
    builder: impl Builder + 'static,
    targets: &[NodeId],
    sources: &[NodeId],
  ) -> Result<BuilderId, ConfigError> {
    self.register_shared(Arc::new(builder), targets, sources)
  }

  pub fn register_shared(
    &mut self,
    builder: Arc<dyn Builder>,
    targets: &[NodeId],
    sources: &[NodeId],
  ) -> Result<BuilderId, ConfigError> {
    let name = builder.name();
    for &node in targets.iter().chain(sources) {
      self.registry.check(node)?;
    }
    for &target in targets {
      if !self.registry.kind(target).is_some_and(NodeKind::is_path) {
        return Err(ConfigError::NotBuildable(self.node_name(target)));
      }
    }

    let id = self
      .graph
      .register(targets, sources)
      .map_err(|e| self.graph_error(e, &name))?;
    debug!(builder = %name, targets = targets.len(), sources = sources.len(), "registered builder");

    self.builders.push(BuilderEntry {
      config: config_signature(builder.as_ref()),
      builder,
      name,
    });
    Ok(id)
  }

  /// Create or replace an alias naming `members`.
  pub fn register_alias(&mut self, name: &str, members: &[NodeId]) -> Result<NodeId, ConfigError> {
    for &member in members {
      self.registry.check(member)?;
    }
    let id = self.intern_node(Identity::alias(name), NodeKind::Alias)?;
    self.graph.set_alias_members(id, members);
    self.aliases.insert(name.to_string(), id);
    Ok(id)
  }

  /// Resolve a name: an alias first, then a path relative to the root.
  pub fn resolve(&self, name: &str) -> Result<NodeId, ConfigError> {
    if let Some(&id) = self.aliases.get(name) {
      return Ok(id);
    }
    let path = normalize(&self.config.root, Path::new(name));
    self
      .registry
      .lookup(&Identity::path(path))
      .ok_or_else(|| ConfigError::UnknownTarget(name.to_string()))
  }

  pub fn alias(&self, name: &str) -> Option<NodeId> {
    self.aliases.get(name).copied()
  }

  pub fn set_var(&mut self, name: impl Into<String>, value: serde_json::Value) {
    self.vars.insert(name.into(), value);
  }

  pub fn var(&self, name: &str) -> Option<&serde_json::Value> {
    self.vars.get(name)
  }

  /// `src` relative to the root, or unchanged if it is outside.
  pub fn rel_path(&self, src: impl AsRef<Path>) -> PathBuf {
    let path = normalize(&self.config.root, src.as_ref());
    match path.strip_prefix(&self.config.root) {
      Ok(rel) => rel.to_path_buf(),
      Err(_) => path,
    }
  }

  /// Mirror `src` under `build_dir` (relative to the build root), optionally
  /// replacing its extension.
  ///
  /// `build_path("src/main.c", "obj", Some("o"))` gives
  /// `<build_root>/obj/src/main.o`.
  pub fn build_path(&self, src: impl AsRef<Path>, build_dir: impl AsRef<Path>, new_ext: Option<&str>) -> PathBuf {
    let rel = self.rel_path(src);
    let rel = if rel.is_absolute() {
      rel.components().filter(|c| matches!(c, std::path::Component::Normal(_))).collect()
    } else {
      rel
    };
    let mut out = normalize(&self.config.build_root, build_dir.as_ref()).join(rel);
    if let Some(ext) = new_ext {
      out.set_extension(ext);
    }
    out
  }

  /// Static and dynamic targets of `builder`.
  pub fn builder_targets(&self, builder: BuilderId) -> Vec<NodeId> {
    self.graph.targets(builder)
  }

  pub fn builder_name(&self, builder: BuilderId) -> Option<&str> {
    self.builders.get(builder.index()).map(|b| b.name.as_str())
  }

  pub fn producer(&self, node: NodeId) -> Option<BuilderId> {
    self.graph.producer(node)
  }

  pub fn node_info(&self, node: NodeId) -> Result<NodeInfo, ConfigError> {
    self.registry.info(node)
  }

  /// Display name relative to the root.
  pub fn node_name(&self, node: NodeId) -> String {
    self.registry.display_name(node, &self.config.root)
  }

  pub fn closure(&self, roots: &[NodeId]) -> BTreeSet<NodeId> {
    self.graph.closure(roots)
  }

  pub fn topo_order(&self, nodes: &BTreeSet<NodeId>) -> Result<Vec<NodeId>, ExecuteError> {
    self.graph.topo_order(nodes).map_err(|e| ExecuteError::CycleDetected {
      path: e.path.iter().map(|&n| self.node_name(n)).collect(),
    })
  }

  /// Construction-only pass: hydrate recorded discoveries, order the
  /// closure of `names` and classify staleness. No builder runs.
  pub fn prepare(&mut self, names: &[&str]) -> Result<PreparedBuild, ExecuteError> {
    let roots = self.resolve_all(names)?;
    execute::prepare(self, &roots)
  }

  /// Why `node` would be rebuilt now, if at all.
  pub fn is_stale(&mut self, node: NodeId) -> Result<Option<StaleReason>, ExecuteError> {
    self.registry.check(node)?;
    let prepared = execute::prepare(self, &[node])?;
    Ok(prepared.stale_reason(node).cloned())
  }

  /// Build `names` with the environment's execution settings.
  pub async fn request_build(&mut self, names: &[&str]) -> Result<BuildReport, ExecuteError> {
    let config = self.execute.clone();
    self.request_build_with(names, &config).await
  }

  pub async fn request_build_with(&mut self, names: &[&str], config: &ExecuteConfig) -> Result<BuildReport, ExecuteError> {
    let roots = self.resolve_all(names)?;
    execute::build(self, &roots, config).await
  }

  pub async fn build_nodes(&mut self, nodes: &[NodeId], config: &ExecuteConfig) -> Result<BuildReport, ExecuteError> {
    for &node in nodes {
      self.registry.check(node)?;
    }
    execute::build(self, nodes, config).await
  }

  fn resolve_all(&self, names: &[&str]) -> Result<Vec<NodeId>, ConfigError> {
    names.iter().map(|name| self.resolve(name)).collect()
  }

  pub(crate) fn graph_error(&self, err: GraphError, builder: &str) -> ConfigError {
    match err {
      GraphError::DuplicateProducer { node, existing } => ConfigError::DuplicateProducer {
        node: self.node_name(node),
        existing: self.builder_name(existing).unwrap_or("?").to_string(),
      },
      GraphError::NoTargets => ConfigError::NoTargets(builder.to_string()),
      GraphError::BuilderComplete(node) => ConfigError::BuilderComplete(self.node_name(node)),
      GraphError::UnknownBuilder(id) => ConfigError::UnknownTarget(format!("builder #{}", id.index())),
    }
  }
}
