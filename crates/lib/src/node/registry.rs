//! Interning of node identities.

use std::collections::HashMap;
use std::path::Path;

use crate::config::SignatureMode;
use crate::error::ConfigError;
use crate::util::hash::Signature;

use super::signature::SignatureCache;
use super::types::{Identity, NodeId, NodeInfo, NodeKind, NodeSpec};

#[derive(Debug, Clone)]
struct NodeEntry {
  identity: Identity,
  kind: NodeKind,
  value: Option<serde_json::Value>,
}

/// Owns every node of an environment.
///
/// Identities are unique: interning an identity twice yields the same
/// [`NodeId`].
#[derive(Debug)]
pub struct NodeRegistry {
  nodes: Vec<NodeEntry>,
  index: HashMap<Identity, NodeId>,
  mode: SignatureMode,
  cache: SignatureCache,
}

impl NodeRegistry {
  pub fn new(mode: SignatureMode) -> Self {
    Self {
      nodes: Vec::new(),
      index: HashMap::new(),
      mode,
      cache: SignatureCache::new(),
    }
  }

  pub fn mode(&self) -> SignatureMode {
    self.mode
  }

  pub fn cache(&self) -> &SignatureCache {
    &self.cache
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Return the node for `identity`, creating it if needed.
  pub fn intern(&mut self, identity: Identity, kind: NodeKind) -> Result<NodeId, ConfigError> {
    validate(&identity, kind)?;

    if let Some(&id) = self.index.get(&identity) {
      let existing = self.nodes[id.0].kind;
      if existing != kind {
        return Err(ConfigError::KindMismatch {
          identity: identity.to_string(),
          existing: existing.to_string(),
          requested: kind.to_string(),
        });
      }
      return Ok(id);
    }

    let id = NodeId(self.nodes.len());
    self.nodes.push(NodeEntry {
      identity: identity.clone(),
      kind,
      value: None,
    });
    self.index.insert(identity, id);
    Ok(id)
  }

  pub fn intern_spec(&mut self, spec: &NodeSpec) -> Result<NodeId, ConfigError> {
    self.intern(spec.identity.clone(), spec.kind)
  }

  /// Replace the value carried by a value node.
  pub fn set_value(&mut self, id: NodeId, value: serde_json::Value) -> Result<(), ConfigError> {
    let entry = self.nodes.get_mut(id.0).ok_or(ConfigError::UnknownNode(id.0))?;
    if entry.kind != NodeKind::Value {
      return Err(ConfigError::KindMismatch {
        identity: entry.identity.to_string(),
        existing: entry.kind.to_string(),
        requested: NodeKind::Value.to_string(),
      });
    }
    if entry.value.as_ref() != Some(&value) {
      entry.value = Some(value);
      self.cache.invalidate(&entry.identity);
    }
    Ok(())
  }

  pub fn lookup(&self, identity: &Identity) -> Option<NodeId> {
    self.index.get(identity).copied()
  }

  pub fn contains(&self, id: NodeId) -> bool {
    id.0 < self.nodes.len()
  }

  pub fn check(&self, id: NodeId) -> Result<NodeId, ConfigError> {
    if self.contains(id) { Ok(id) } else { Err(ConfigError::UnknownNode(id.0)) }
  }

  pub fn identity(&self, id: NodeId) -> Option<&Identity> {
    self.nodes.get(id.0).map(|n| &n.identity)
  }

  pub fn kind(&self, id: NodeId) -> Option<NodeKind> {
    self.nodes.get(id.0).map(|n| n.kind)
  }

  pub fn path(&self, id: NodeId) -> Option<&Path> {
    self.identity(id).and_then(Identity::as_path)
  }

  pub fn value(&self, id: NodeId) -> Option<&serde_json::Value> {
    self.nodes.get(id.0).and_then(|n| n.value.as_ref())
  }

  pub fn spec(&self, id: NodeId) -> Option<NodeSpec> {
    self.nodes.get(id.0).map(|n| NodeSpec {
      identity: n.identity.clone(),
      kind: n.kind,
    })
  }

  pub fn info(&self, id: NodeId) -> Result<NodeInfo, ConfigError> {
    let entry = self.nodes.get(id.0).ok_or(ConfigError::UnknownNode(id.0))?;
    Ok(NodeInfo {
      id,
      identity: entry.identity.clone(),
      kind: entry.kind,
      value: entry.value.clone(),
    })
  }

  /// Current signature of a node, read through the cache.
  pub fn signature_of(&self, id: NodeId) -> Option<Signature> {
    let info = self.info(id).ok()?;
    self.cache.signature_of(&info, self.mode)
  }

  pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
    (0..self.nodes.len()).map(NodeId)
  }

  /// Human-readable name, relative to `root` for paths beneath it.
  pub fn display_name(&self, id: NodeId, root: &Path) -> String {
    match self.identity(id) {
      Some(Identity::Path { path }) => crate::util::paths::display_relative(root, path),
      Some(Identity::Alias { name }) => name.clone(),
      Some(other) => other.to_string(),
      None => format!("#{}", id.0),
    }
  }
}

fn validate(identity: &Identity, kind: NodeKind) -> Result<(), ConfigError> {
  let ok = match identity {
    Identity::Path { path } => kind.is_path() && path.is_absolute(),
    Identity::Value { name, .. } => kind == NodeKind::Value && !name.is_empty(),
    Identity::Alias { name } => kind == NodeKind::Alias && !name.is_empty(),
  };
  if ok {
    Ok(())
  } else {
    Err(ConfigError::MalformedIdentity(format!("{} as {}", identity, kind)))
  }
}
