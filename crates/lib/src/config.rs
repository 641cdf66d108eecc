//! Environment configuration.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::consts::{BUILD_DIR_NAME, ENV_SIGNATURE_MODE, ENV_STATE_DIR, RECORDS_DIR_NAME, STATE_DIR_NAME};
use crate::error::ConfigError;

/// How file signatures are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureMode {
  /// SHA-256 of the file contents.
  #[default]
  Content,
  /// Modification time and size. Cheaper, but touching a file counts as a change.
  Timestamp,
}

impl FromStr for SignatureMode {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "content" => Ok(SignatureMode::Content),
      "timestamp" => Ok(SignatureMode::Timestamp),
      _ => Err(ConfigError::InvalidSetting {
        name: ENV_SIGNATURE_MODE.to_string(),
        value: s.to_string(),
      }),
    }
  }
}

/// Locations and policies of one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
  /// Directory relative paths are resolved against.
  pub root: PathBuf,
  /// Base directory for [`Environment::build_path`](crate::environment::Environment::build_path).
  pub build_root: PathBuf,
  /// Where signature records and the state lock live.
  pub state_dir: PathBuf,
  pub signature_mode: SignatureMode,
}

impl EnvConfig {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    Self {
      build_root: root.join(BUILD_DIR_NAME),
      state_dir: root.join(STATE_DIR_NAME),
      root,
      signature_mode: SignatureMode::default(),
    }
  }

  /// Defaults for `root`, overridden by `MINICONS_STATE_DIR` and
  /// `MINICONS_SIGNATURE_MODE` when set.
  pub fn from_env(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
    let mut config = Self::new(root);

    if let Ok(dir) = std::env::var(ENV_STATE_DIR)
      && !dir.is_empty()
    {
      config.state_dir = config.root.join(dir);
    }

    if let Ok(mode) = std::env::var(ENV_SIGNATURE_MODE)
      && !mode.is_empty()
    {
      config.signature_mode = mode.parse()?;
    }

    Ok(config)
  }

  pub fn with_build_root(mut self, build_root: impl AsRef<Path>) -> Self {
    self.build_root = self.root.join(build_root);
    self
  }

  pub fn with_state_dir(mut self, state_dir: impl AsRef<Path>) -> Self {
    self.state_dir = self.root.join(state_dir);
    self
  }

  pub fn with_signature_mode(mut self, mode: SignatureMode) -> Self {
    self.signature_mode = mode;
    self
  }

  pub fn records_dir(&self) -> PathBuf {
    self.state_dir.join(RECORDS_DIR_NAME)
  }
}
