//! What a builder sees while it runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::node::{Identity, NodeInfo, NodeKind, NodeSpec};
use crate::util::paths::normalize;

use super::types::{BuilderError, Discoveries};

/// Handed to [`Builder::build`](super::Builder::build).
///
/// Dynamic declarations are collected here and applied to the graph by the
/// scheduler once the builder has returned successfully. The scoped
/// temporary directory is deleted when the context is dropped.
#[derive(Debug)]
pub struct BuildContext {
  name: String,
  root: PathBuf,
  build_root: PathBuf,
  targets: Vec<NodeInfo>,
  static_len: usize,
  sources: Vec<NodeInfo>,
  vars: Arc<BTreeMap<String, serde_json::Value>>,
  temp_dir: Option<TempDir>,
  discoveries: Discoveries,
}

impl BuildContext {
  pub fn new(
    name: impl Into<String>,
    root: impl Into<PathBuf>,
    build_root: impl Into<PathBuf>,
    targets: Vec<NodeInfo>,
    sources: Vec<NodeInfo>,
    vars: Arc<BTreeMap<String, serde_json::Value>>,
  ) -> Self {
    Self {
      name: name.into(),
      root: root.into(),
      build_root: build_root.into(),
      static_len: targets.len(),
      targets,
      sources,
      vars,
      temp_dir: None,
      discoveries: Discoveries::default(),
    }
  }

  /// Append dynamic targets recorded by the previous run. They must be
  /// declared again to survive this one.
  pub(crate) fn with_recorded_targets(mut self, recorded: Vec<NodeInfo>) -> Self {
    self.targets.extend(recorded);
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn build_root(&self) -> &Path {
    &self.build_root
  }

  /// Static targets, then dynamic targets recorded by the previous run.
  pub fn targets(&self) -> &[NodeInfo] {
    &self.targets
  }

  pub fn sources(&self) -> &[NodeInfo] {
    &self.sources
  }

  /// Path of the first target, for the common single-output builder.
  pub fn target_path(&self) -> Option<&Path> {
    self.targets.iter().find_map(NodeInfo::path)
  }

  pub fn source_paths(&self) -> impl Iterator<Item = &Path> {
    self.sources.iter().filter_map(NodeInfo::path)
  }

  pub fn var(&self, name: &str) -> Option<&serde_json::Value> {
    self.vars.get(name)
  }

  /// A directory private to this invocation.
  pub fn temp_dir(&mut self) -> Result<&Path, BuilderError> {
    if self.temp_dir.is_none() {
      std::fs::create_dir_all(&self.build_root)?;
      let dir = tempfile::Builder::new().prefix(".tmp-").tempdir_in(&self.build_root)?;
      self.temp_dir = Some(dir);
    }
    match &self.temp_dir {
      Some(dir) => Ok(dir.path()),
      None => Err(BuilderError::msg("temporary directory unavailable")),
    }
  }

  /// Declare a source discovered while building; every target depends on it.
  pub fn add_dynamic_source(&mut self, spec: NodeSpec) -> Result<(), BuilderError> {
    let spec = self.resolve(spec)?;
    if !self.discoveries.sources.contains(&spec) {
      self.discoveries.sources.push(spec);
    }
    Ok(())
  }

  /// Declare that one of this builder's targets depends on `source`.
  pub fn add_dynamic_edge(&mut self, target: NodeSpec, source: NodeSpec) -> Result<(), BuilderError> {
    let target = self.resolve(target)?;
    let source = self.resolve(source)?;
    if !self.owns(&target.identity) {
      return Err(BuilderError::Dynamic(format!(
        "{} is not a target of {}",
        target.identity, self.name
      )));
    }
    let edge = (target, source);
    if !self.discoveries.edges.contains(&edge) {
      self.discoveries.edges.push(edge);
    }
    Ok(())
  }

  /// Declare an output that was not known before the build.
  pub fn add_dynamic_target(&mut self, spec: NodeSpec) -> Result<(), BuilderError> {
    let spec = self.resolve(spec)?;
    let declared = self.targets[..self.static_len].iter().any(|t| t.identity == spec.identity)
      || self.discoveries.targets.iter().any(|t| t.identity == spec.identity);
    if !declared {
      self.discoveries.targets.push(spec);
    }
    Ok(())
  }

  pub fn discoveries(&self) -> &Discoveries {
    &self.discoveries
  }

  pub fn into_discoveries(self) -> Discoveries {
    self.discoveries
  }

  fn owns(&self, identity: &Identity) -> bool {
    self.targets.iter().any(|t| &t.identity == identity)
      || self.discoveries.targets.iter().any(|t| &t.identity == identity)
  }

  /// Only files and directories can be discovered; relative paths are
  /// taken from the root.
  fn resolve(&self, spec: NodeSpec) -> Result<NodeSpec, BuilderError> {
    match (&spec.identity, spec.kind) {
      (Identity::Path { path }, NodeKind::File | NodeKind::Dir) => Ok(NodeSpec {
        identity: Identity::path(normalize(&self.root, path)),
        kind: spec.kind,
      }),
      _ => Err(BuilderError::Dynamic(format!(
        "{} cannot be discovered as a {}",
        spec.identity, spec.kind
      ))),
    }
  }
}
