//! Node identity types.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::util::hash::Hashable;
use crate::util::paths::normalize;

/// Handle to a node interned in an [`Environment`](crate::environment::Environment).
///
/// Ids are dense and assigned in registration order, which is also the
/// tie-break order for topological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
  pub fn index(self) -> usize {
    self.0
  }
}

/// What kind of entity a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
  File,
  Dir,
  Value,
  Alias,
}

impl NodeKind {
  pub fn as_str(self) -> &'static str {
    match self {
      NodeKind::File => "file",
      NodeKind::Dir => "dir",
      NodeKind::Value => "value",
      NodeKind::Alias => "alias",
    }
  }

  /// Whether nodes of this kind live on the filesystem.
  pub fn is_path(self) -> bool {
    matches!(self, NodeKind::File | NodeKind::Dir)
  }
}

impl fmt::Display for NodeKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The unique identity of a node within an environment.
///
/// Files and directories share the path namespace: one path is either a
/// file or a directory, never both.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Identity {
  Path { path: PathBuf },
  Value { scope: String, name: String },
  Alias { name: String },
}

impl Hashable for Identity {}

impl Identity {
  pub fn path(path: impl Into<PathBuf>) -> Self {
    Identity::Path { path: path.into() }
  }

  pub fn value(scope: impl Into<String>, name: impl Into<String>) -> Self {
    Identity::Value {
      scope: scope.into(),
      name: name.into(),
    }
  }

  pub fn alias(name: impl Into<String>) -> Self {
    Identity::Alias { name: name.into() }
  }

  /// Parse the textual form produced by `Display`: `value:<scope>/<name>`,
  /// `alias:<name>`, or a path taken relative to `root`.
  pub fn parse(root: &Path, text: &str) -> Result<Self, ConfigError> {
    let malformed = || ConfigError::MalformedIdentity(text.to_string());
    if let Some(rest) = text.strip_prefix("value:") {
      let (scope, name) = rest.split_once('/').ok_or_else(malformed)?;
      if name.is_empty() {
        return Err(malformed());
      }
      return Ok(Identity::value(scope, name));
    }
    if let Some(name) = text.strip_prefix("alias:") {
      if name.is_empty() {
        return Err(malformed());
      }
      return Ok(Identity::alias(name));
    }
    if text.is_empty() {
      return Err(malformed());
    }
    Ok(Identity::path(normalize(root, Path::new(text))))
  }

  pub fn as_path(&self) -> Option<&Path> {
    match self {
      Identity::Path { path } => Some(path),
      _ => None,
    }
  }
}

impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Identity::Path { path } => write!(f, "{}", path.display()),
      Identity::Value { scope, name } => write!(f, "value:{}/{}", scope, name),
      Identity::Alias { name } => write!(f, "alias:{}", name),
    }
  }
}

/// An identity paired with its kind.
///
/// Used for nodes that builders discover while running and for node
/// references persisted in signature records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSpec {
  pub identity: Identity,
  pub kind: NodeKind,
}

impl NodeSpec {
  pub fn file(path: impl Into<PathBuf>) -> Self {
    Self {
      identity: Identity::path(path),
      kind: NodeKind::File,
    }
  }

  pub fn dir(path: impl Into<PathBuf>) -> Self {
    Self {
      identity: Identity::path(path),
      kind: NodeKind::Dir,
    }
  }
}

/// Resolved view of a node handed to builders and signature computation.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
  pub id: NodeId,
  pub identity: Identity,
  pub kind: NodeKind,
  /// Current value of a value node.
  pub value: Option<serde_json::Value>,
}

impl NodeInfo {
  pub fn path(&self) -> Option<&Path> {
    self.identity.as_path()
  }

  pub fn spec(&self) -> NodeSpec {
    NodeSpec {
      identity: self.identity.clone(),
      kind: self.kind,
    }
  }
}
