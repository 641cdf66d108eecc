//! Signature computation and the per-pass signature cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::config::SignatureMode;
use crate::util::hash::{Signature, hash_directory, hash_file, hash_value, timestamp_signature};

use super::types::{Identity, NodeInfo, NodeKind, NodeSpec};

/// Compute the current signature of a node.
///
/// Returns `None` when the node does not exist (a missing file, a path that
/// is a directory when a file was expected, ...) or has no signature of its
/// own (aliases). Unreadable files are logged and treated as missing.
pub fn compute_signature(info: &NodeInfo, mode: SignatureMode) -> Option<Signature> {
  signature_for(&info.identity, info.kind, info.value.as_ref(), mode)
}

/// Signature of a path node known only by its spec.
pub fn spec_signature(spec: &NodeSpec, mode: SignatureMode) -> Option<Signature> {
  signature_for(&spec.identity, spec.kind, None, mode)
}

fn signature_for(
  identity: &Identity,
  kind: NodeKind,
  value: Option<&serde_json::Value>,
  mode: SignatureMode,
) -> Option<Signature> {
  match kind {
    NodeKind::File => {
      let path = identity.as_path()?;
      if !path.is_file() {
        return None;
      }
      match mode {
        SignatureMode::Timestamp => timestamp_signature(path),
        SignatureMode::Content => match hash_file(path) {
          Ok(sig) => Some(sig),
          Err(e) => {
            warn!(node = %identity, error = %e, "failed to hash file");
            None
          }
        },
      }
    }
    NodeKind::Dir => {
      let path = identity.as_path()?;
      if !path.is_dir() {
        return None;
      }
      match hash_directory(path, &[]) {
        Ok(sig) => Some(sig),
        Err(e) => {
          warn!(node = %identity, error = %e, "failed to hash directory");
          None
        }
      }
    }
    NodeKind::Value => Some(hash_value(value.unwrap_or(&serde_json::Value::Null))),
    NodeKind::Alias => None,
  }
}

/// Signatures computed during one build pass.
///
/// Each node is read at most once per pass; entries for a builder's targets
/// are invalidated when that builder completes. Cloning shares the cache.
#[derive(Debug, Clone, Default)]
pub struct SignatureCache {
  inner: Arc<RwLock<HashMap<Identity, Option<Signature>>>>,
}

impl SignatureCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, identity: &Identity) -> Option<Option<Signature>> {
    let map = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.get(identity).cloned()
  }

  pub fn insert(&self, identity: Identity, signature: Option<Signature>) {
    let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.insert(identity, signature);
  }

  pub fn invalidate(&self, identity: &Identity) {
    let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.remove(identity);
  }

  pub fn clear(&self) {
    let mut map = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    map.clear();
  }

  /// Cached signature of `info`, computing and storing it on a miss.
  pub fn signature_of(&self, info: &NodeInfo, mode: SignatureMode) -> Option<Signature> {
    if let Some(cached) = self.get(&info.identity) {
      return cached;
    }
    let signature = compute_signature(info, mode);
    self.insert(info.identity.clone(), signature.clone());
    signature
  }
}
