//! Construction-time errors.

use thiserror::Error;

/// Errors raised while building the graph, before any builder runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  /// A second builder was registered for a node that already has a producer.
  #[error("{node} is already built by {existing}")]
  DuplicateProducer { node: String, existing: String },

  /// The same identity was interned with two different kinds.
  #[error("{identity} is already registered as a {existing}, not a {requested}")]
  KindMismatch {
    identity: String,
    existing: String,
    requested: String,
  },

  /// An identity that cannot name a node (empty name, relative path, ...).
  #[error("malformed identity: {0}")]
  MalformedIdentity(String),

  /// A value could not be serialized for signing.
  #[error("invalid value for {identity}: {message}")]
  InvalidValue { identity: String, message: String },

  /// A builder was registered without any target.
  #[error("builder {0} declares no targets")]
  NoTargets(String),

  /// Aliases and values cannot be produced by a builder.
  #[error("{0} cannot be a builder target")]
  NotBuildable(String),

  /// A requested name resolves to neither an alias nor a registered node.
  #[error("unknown target: {0}")]
  UnknownTarget(String),

  /// A node id that does not belong to this environment.
  #[error("unknown node id {0}")]
  UnknownNode(usize),

  /// An environment variable holds a value that cannot be parsed.
  #[error("invalid value {value:?} for {name}")]
  InvalidSetting { name: String, value: String },

  /// Dynamic graph mutation after the owning builder finished.
  #[error("builder for {0} has already completed; dynamic declarations are closed")]
  BuilderComplete(String),
}
