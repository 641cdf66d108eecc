//! Forget command implementation.
//!
//! Drops individual records so their nodes are rebuilt by the next build.

use anyhow::{Context, Result};
use tracing::debug;

use minicons_lib::state::{LockMode, StateLock};
use minicons_lib::{EnvConfig, Identity, SignatureStore};

use crate::output::{print_success, print_warning};

pub fn cmd_forget(config: &EnvConfig, identities: &[String]) -> Result<()> {
  let identities = identities
    .iter()
    .map(|text| Identity::parse(&config.root, text))
    .collect::<Result<Vec<_>, _>>()?;

  let _lock = StateLock::acquire(&config.state_dir, LockMode::Exclusive, "forget")
    .context("failed to lock state directory")?;
  let store = SignatureStore::new(&config.state_dir);

  let mut removed = 0;
  for identity in &identities {
    if store
      .remove(identity)
      .with_context(|| format!("failed to remove record for {}", identity))?
    {
      debug!(node = %identity, "record removed");
      removed += 1;
    } else {
      print_warning(&format!("no record for {}", identity));
    }
  }

  print_success(&format!("Forgot {} record(s)", removed));
  Ok(())
}
