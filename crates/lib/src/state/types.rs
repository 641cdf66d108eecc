//! Persisted signature records.

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::RECORD_VERSION;
use crate::node::{Identity, NodeKind, NodeSpec};
use crate::util::hash::Signature;

/// Errors reading or writing the signature store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to create records directory: {0}")]
  CreateDir(#[source] io::Error),

  #[error("failed to read record: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write record: {0}")]
  Write(#[source] io::Error),

  #[error("failed to parse record: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize record: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported record version {0}")]
  UnsupportedVersion(u32),

  #[error("record file holds {found} instead of {expected}")]
  IdentityMismatch { expected: String, found: String },
}

/// A dependency as it was when its dependent was last built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
  pub identity: Identity,
  pub kind: NodeKind,
  pub signature: Option<Signature>,
  /// Discovered during the build rather than declared.
  #[serde(default)]
  pub dynamic: bool,
}

/// Everything remembered about one node after its builder succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
  pub version: u32,
  pub identity: Identity,
  pub kind: NodeKind,
  /// The node's own signature right after the build.
  pub signature: Option<Signature>,
  /// Configuration signature of the producing builder.
  pub config: Signature,
  pub dependencies: Vec<DependencyRecord>,
  /// Outputs the builder discovered while running.
  #[serde(default)]
  pub dynamic_targets: Vec<NodeSpec>,
  pub built_at_unix: u64,
}

impl SignatureRecord {
  pub fn new(identity: Identity, kind: NodeKind, signature: Option<Signature>, config: Signature) -> Self {
    Self {
      version: RECORD_VERSION,
      identity,
      kind,
      signature,
      config,
      dependencies: Vec::new(),
      dynamic_targets: Vec::new(),
      built_at_unix: std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    }
  }

  pub fn dependency(&self, identity: &Identity) -> Option<&DependencyRecord> {
    self.dependencies.iter().find(|d| &d.identity == identity)
  }

  /// Dependencies discovered while building.
  pub fn dynamic_dependencies(&self) -> impl Iterator<Item = &DependencyRecord> {
    self.dependencies.iter().filter(|d| d.dynamic)
  }
}
