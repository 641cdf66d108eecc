//! The builder contract.
//!
//! A builder turns sources into targets. The engine decides when it runs;
//! the builder only does the work and, through [`BuildContext`], reports
//! dependencies and outputs it discovers on the way.

mod context;
mod types;

use serde_json::json;

use crate::util::hash::{Signature, hash_value};

pub use context::BuildContext;
pub use types::{BuildOutcome, BuilderError, Discoveries};

pub trait Builder: Send + Sync {
  /// Stable name, also the default scope of value nodes the builder owns.
  fn name(&self) -> String;

  /// Settings that affect the output. Changing them triggers a rebuild.
  fn config(&self) -> serde_json::Value {
    serde_json::Value::Null
  }

  fn build(&self, ctx: &mut BuildContext) -> Result<BuildOutcome, BuilderError>;
}

/// Configuration signature of a builder: its name and config together.
pub fn config_signature(builder: &dyn Builder) -> Signature {
  hash_value(&json!({
    "name": builder.name(),
    "config": builder.config(),
  }))
}

/// A builder backed by a closure.
pub struct FnBuilder<F> {
  name: String,
  config: serde_json::Value,
  func: F,
}

impl<F> FnBuilder<F>
where
  F: Fn(&mut BuildContext) -> Result<BuildOutcome, BuilderError> + Send + Sync,
{
  pub fn new(name: impl Into<String>, func: F) -> Self {
    Self {
      name: name.into(),
      config: serde_json::Value::Null,
      func,
    }
  }

  pub fn with_config(mut self, config: serde_json::Value) -> Self {
    self.config = config;
    self
  }
}

impl<F> Builder for FnBuilder<F>
where
  F: Fn(&mut BuildContext) -> Result<BuildOutcome, BuilderError> + Send + Sync,
{
  fn name(&self) -> String {
    self.name.clone()
  }

  fn config(&self) -> serde_json::Value {
    self.config.clone()
  }

  fn build(&self, ctx: &mut BuildContext) -> Result<BuildOutcome, BuilderError> {
    (self.func)(ctx)
  }
}

impl<F> std::fmt::Debug for FnBuilder<F> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FnBuilder")
      .field("name", &self.name)
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}
