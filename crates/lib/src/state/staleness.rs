//! Deciding whether a built node must be rebuilt.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::node::{Identity, NodeKind};
use crate::util::hash::Signature;

use super::types::SignatureRecord;

/// Why a node needs rebuilding. The first trigger found wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
  NoRecord,
  Missing,
  SignatureChanged,
  ConfigChanged,
  DependencySetChanged,
  DependencyChanged(String),
  DependencyStale(String),
}

impl StaleReason {
  /// Stale only because something upstream will be rebuilt.
  pub fn is_propagated(&self) -> bool {
    matches!(self, StaleReason::DependencyStale(_))
  }
}

impl fmt::Display for StaleReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StaleReason::NoRecord => write!(f, "never built"),
      StaleReason::Missing => write!(f, "output is missing"),
      StaleReason::SignatureChanged => write!(f, "output changed since last build"),
      StaleReason::ConfigChanged => write!(f, "builder configuration changed"),
      StaleReason::DependencySetChanged => write!(f, "set of dependencies changed"),
      StaleReason::DependencyChanged(dep) => write!(f, "dependency {} changed", dep),
      StaleReason::DependencyStale(dep) => write!(f, "dependency {} is out of date", dep),
    }
  }
}

/// A dependency as it is right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyState {
  pub identity: Identity,
  pub kind: NodeKind,
  pub signature: Option<Signature>,
  pub dynamic: bool,
}

/// Check a node against its record, ignoring upstream staleness.
///
/// `current` is the node's fresh signature. Dependencies listed in
/// `assume_unchanged` are treated as equal to their recorded signature.
pub fn direct_staleness(
  record: Option<&SignatureRecord>,
  kind: NodeKind,
  current: Option<&Signature>,
  config: &Signature,
  deps: &[DependencyState],
  assume_unchanged: &HashSet<Identity>,
) -> Option<StaleReason> {
  let Some(record) = record else {
    return Some(StaleReason::NoRecord);
  };

  if kind.is_path() && current.is_none() {
    return Some(StaleReason::Missing);
  }
  if record.signature.as_ref() != current {
    return Some(StaleReason::SignatureChanged);
  }
  if &record.config != config {
    return Some(StaleReason::ConfigChanged);
  }

  let recorded: BTreeSet<&Identity> = record.dependencies.iter().map(|d| &d.identity).collect();
  let present: BTreeSet<&Identity> = deps.iter().map(|d| &d.identity).collect();
  if recorded != present {
    return Some(StaleReason::DependencySetChanged);
  }

  for dep in deps {
    if assume_unchanged.contains(&dep.identity) {
      continue;
    }
    let before = record.dependency(&dep.identity).and_then(|d| d.signature.as_ref());
    if before != dep.signature.as_ref() {
      return Some(StaleReason::DependencyChanged(dep.identity.to_string()));
    }
  }

  None
}
