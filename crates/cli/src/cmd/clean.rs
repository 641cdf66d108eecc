//! Clean command implementation.

use anyhow::{Context, Result};

use minicons_lib::state::{LockMode, StateLock};
use minicons_lib::{EnvConfig, SignatureStore};

use crate::output::{print_info, print_success};

pub fn cmd_clean(config: &EnvConfig) -> Result<()> {
  let _lock = StateLock::acquire(&config.state_dir, LockMode::Exclusive, "clean")
    .context("failed to lock state directory")?;
  let store = SignatureStore::new(&config.state_dir);

  let removed = store.clear().context("failed to remove signature records")?;
  if removed == 0 {
    print_info("No signature records to remove");
  } else {
    print_success(&format!("Removed {} signature record(s)", removed));
  }
  Ok(())
}
