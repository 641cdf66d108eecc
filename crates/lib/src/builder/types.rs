use std::io;

use thiserror::Error;

use crate::node::NodeSpec;

/// What a successful builder reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
  /// Outputs were (re)written.
  Built,
  /// The builder ran but its outputs are equivalent to the previous ones;
  /// dependents are not rebuilt on its account.
  Unchanged,
}

#[derive(Debug, Error)]
pub enum BuilderError {
  #[error("{0}")]
  Failed(String),

  #[error("io error: {0}")]
  Io(#[from] io::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("builder reported success but {0} does not exist")]
  MissingOutput(String),

  #[error("invalid dynamic declaration: {0}")]
  Dynamic(String),

  #[error("builder panicked: {0}")]
  Panicked(String),
}

impl BuilderError {
  pub fn msg(message: impl Into<String>) -> Self {
    BuilderError::Failed(message.into())
  }
}

/// Dependencies and outputs declared while a builder ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discoveries {
  /// Sources of every target of the builder.
  pub sources: Vec<NodeSpec>,
  /// `(target, source)` pairs for a single target.
  pub edges: Vec<(NodeSpec, NodeSpec)>,
  pub targets: Vec<NodeSpec>,
}

impl Discoveries {
  pub fn is_empty(&self) -> bool {
    self.sources.is_empty() && self.edges.is_empty() && self.targets.is_empty()
  }
}
