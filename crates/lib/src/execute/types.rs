//! Types for build execution.
//!
//! This module defines the error types, report types and configuration
//! for running builders.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::consts::{ENV_JOBS, ENV_KEEP_GOING};
use crate::error::ConfigError;
use crate::state::StoreLockError;

/// Errors that stop a build before any builder runs.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  /// Cycle detected among nodes or among builders.
  #[error("dependency cycle detected: {}", path.join(" -> "))]
  CycleDetected { path: Vec<String> },

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

impl ExecuteError {
  /// Process exit code a CLI should use for this error.
  pub fn exit_code(&self) -> i32 {
    match self {
      ExecuteError::Config(_) | ExecuteError::CycleDetected { .. } => 2,
      ExecuteError::Lock(_) => 1,
    }
  }
}

/// Why a target was not built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BlockCause {
  /// A dependency failed or was itself blocked.
  FailedDependency { node: String },
  /// A declared source does not exist and nothing builds it.
  MissingSource { node: String },
}

impl std::fmt::Display for BlockCause {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BlockCause::FailedDependency { node } => write!(f, "dependency {} failed", node),
      BlockCause::MissingSource { node } => write!(f, "source {} is missing", node),
    }
  }
}

/// Final state of a node after a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
  /// The builder ran and produced new outputs.
  Built,
  /// The builder ran and reported its outputs unchanged.
  Unchanged,
  /// Nothing to do.
  UpToDate,
  /// Dry run: the builder would have run.
  WouldBuild,
  Failed { error: String },
  Blocked { cause: BlockCause },
  /// Never started because the build stopped after a failure.
  Cancelled,
}

impl TargetStatus {
  pub fn is_success(&self) -> bool {
    matches!(
      self,
      TargetStatus::Built | TargetStatus::Unchanged | TargetStatus::UpToDate | TargetStatus::WouldBuild
    )
  }

  /// Ranking used when aggregating the members of an alias.
  fn severity(&self) -> u8 {
    match self {
      TargetStatus::Failed { .. } => 6,
      TargetStatus::Blocked { .. } => 5,
      TargetStatus::Cancelled => 4,
      TargetStatus::WouldBuild => 3,
      TargetStatus::Built => 2,
      TargetStatus::Unchanged => 1,
      TargetStatus::UpToDate => 0,
    }
  }

  /// The most severe of `statuses`; `UpToDate` when empty.
  pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a TargetStatus>) -> TargetStatus {
    statuses
      .into_iter()
      .max_by_key(|s| s.severity())
      .cloned()
      .unwrap_or(TargetStatus::UpToDate)
  }
}

impl std::fmt::Display for TargetStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TargetStatus::Built => write!(f, "built"),
      TargetStatus::Unchanged => write!(f, "unchanged"),
      TargetStatus::UpToDate => write!(f, "up to date"),
      TargetStatus::WouldBuild => write!(f, "would build"),
      TargetStatus::Failed { error } => write!(f, "failed: {}", error),
      TargetStatus::Blocked { cause } => write!(f, "blocked: {}", cause),
      TargetStatus::Cancelled => write!(f, "cancelled"),
    }
  }
}

/// Outcome of one build request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
  /// Status per requested name; aliases aggregate their members.
  pub requested: BTreeMap<String, TargetStatus>,
  /// Status per target of every builder considered.
  pub targets: BTreeMap<String, TargetStatus>,
  /// Sources that were needed but do not exist.
  pub missing: Vec<String>,
  /// Number of builder invocations.
  pub invocations: usize,
  pub dry_run: bool,
}

impl BuildReport {
  /// True if every requested name and every considered target succeeded.
  pub fn is_success(&self) -> bool {
    self.requested.values().all(TargetStatus::is_success) && self.targets.values().all(TargetStatus::is_success)
  }

  pub fn status(&self, name: &str) -> Option<&TargetStatus> {
    self.requested.get(name).or_else(|| self.targets.get(name))
  }

  pub fn count(&self, pred: impl Fn(&TargetStatus) -> bool) -> usize {
    self.targets.values().filter(|s| pred(s)).count()
  }

  pub fn built(&self) -> usize {
    self.count(|s| matches!(s, TargetStatus::Built | TargetStatus::Unchanged))
  }

  pub fn up_to_date(&self) -> usize {
    self.count(|s| matches!(s, TargetStatus::UpToDate))
  }

  pub fn failed(&self) -> usize {
    self.count(|s| matches!(s, TargetStatus::Failed { .. }))
  }

  pub fn blocked(&self) -> usize {
    self.count(|s| matches!(s, TargetStatus::Blocked { .. }))
  }

  pub fn cancelled(&self) -> usize {
    self.count(|s| matches!(s, TargetStatus::Cancelled))
  }
}

/// Configuration for build execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteConfig {
  /// Maximum number of builders running at once.
  pub parallelism: usize,

  /// Keep dispatching unrelated work after a failure.
  pub keep_going: bool,

  /// Report what would run without running builders or touching records.
  pub dry_run: bool,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      keep_going: false,
      dry_run: false,
    }
  }
}

impl ExecuteConfig {
  /// Defaults overridden by `MINICONS_JOBS` and `MINICONS_KEEP_GOING`.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Ok(jobs) = std::env::var(ENV_JOBS)
      && !jobs.is_empty()
    {
      config.parallelism = match jobs.trim().parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
          return Err(ConfigError::InvalidSetting {
            name: ENV_JOBS.to_string(),
            value: jobs,
          });
        }
      };
    }

    if let Ok(flag) = std::env::var(ENV_KEEP_GOING)
      && !flag.is_empty()
    {
      config.keep_going = match flag.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
          return Err(ConfigError::InvalidSetting {
            name: ENV_KEEP_GOING.to_string(),
            value: flag,
          });
        }
      };
    }

    Ok(config)
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  pub fn with_keep_going(mut self, keep_going: bool) -> Self {
    self.keep_going = keep_going;
    self
  }

  pub fn with_dry_run(mut self, dry_run: bool) -> Self {
    self.dry_run = dry_run;
    self
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
