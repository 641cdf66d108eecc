//! Status command implementation.
//!
//! Lists every node recorded in the state directory.

use anyhow::{Context, Result};
use serde::Serialize;

use minicons_lib::state::{LockMode, StateLock};
use minicons_lib::util::paths::display_relative;
use minicons_lib::{EnvConfig, Identity, NodeKind, SignatureStore};

use crate::output::{format_age, now_unix, print_info, print_json, print_stat, print_success, symbols, truncate_hash};

#[derive(Serialize)]
struct StatusEntry {
  name: String,
  identity: Identity,
  kind: NodeKind,
  signature: Option<String>,
  dependencies: usize,
  dynamic_dependencies: usize,
  dynamic_targets: usize,
  built_at_unix: u64,
}

pub fn cmd_status(config: &EnvConfig, verbose: bool, json: bool) -> Result<()> {
  let _lock = StateLock::acquire(&config.state_dir, LockMode::Shared, "status").context("failed to lock state directory")?;
  let store = SignatureStore::new(&config.state_dir);
  let records = store.list().context("failed to list signature records")?;

  let entries: Vec<StatusEntry> = records
    .iter()
    .map(|record| StatusEntry {
      name: match record.identity.as_path() {
        Some(path) => display_relative(&config.root, path),
        None => record.identity.to_string(),
      },
      identity: record.identity.clone(),
      kind: record.kind,
      signature: record.signature.as_ref().map(|s| s.0.clone()),
      dependencies: record.dependencies.len(),
      dynamic_dependencies: record.dynamic_dependencies().count(),
      dynamic_targets: record.dynamic_targets.len(),
      built_at_unix: record.built_at_unix,
    })
    .collect();

  if json {
    return print_json(&serde_json::json!({
      "state_dir": config.state_dir,
      "count": entries.len(),
      "records": entries,
    }));
  }

  if entries.is_empty() {
    print_info("No signature records. Nothing has been built yet.");
    return Ok(());
  }

  print_success(&format!("{} recorded node(s)", entries.len()));
  print_stat("State", &config.state_dir.display().to_string());
  println!();

  let now = now_unix();
  for entry in &entries {
    let signature = entry.signature.as_deref().map(truncate_hash).unwrap_or("-");
    println!(
      "  {} {} [{}] {} {}",
      symbols::INFO,
      entry.name,
      entry.kind,
      signature,
      format_age(now, entry.built_at_unix)
    );
    if verbose {
      println!(
        "      {} {} dependencies ({} discovered), {} discovered outputs",
        symbols::ARROW,
        entry.dependencies,
        entry.dynamic_dependencies,
        entry.dynamic_targets
      );
    }
  }

  Ok(())
}
