//! Show command implementation.

use anyhow::{Context, Result, bail};

use minicons_lib::state::{LockMode, StateLock};
use minicons_lib::util::paths::display_relative;
use minicons_lib::{EnvConfig, Identity, SignatureStore};

use crate::output::{format_age, now_unix, print_json, print_stat, print_success, symbols, truncate_hash};

fn display(config: &EnvConfig, identity: &Identity) -> String {
  match identity.as_path() {
    Some(path) => display_relative(&config.root, path),
    None => identity.to_string(),
  }
}

pub fn cmd_show(config: &EnvConfig, text: &str, json: bool) -> Result<()> {
  let identity = Identity::parse(&config.root, text)?;
  let _lock = StateLock::acquire(&config.state_dir, LockMode::Shared, "show").context("failed to lock state directory")?;
  let store = SignatureStore::new(&config.state_dir);

  let Some(record) = store
    .load(&identity)
    .with_context(|| format!("failed to read record for {}", identity))?
  else {
    bail!("no signature record for {}", display(config, &identity));
  };

  if json {
    return print_json(&record);
  }

  print_success(&display(config, &record.identity));
  print_stat("Kind", &record.kind.to_string());
  print_stat(
    "Signature",
    record.signature.as_ref().map(|s| truncate_hash(&s.0)).unwrap_or("-"),
  );
  print_stat("Config", truncate_hash(&record.config.0));
  print_stat("Built", &format_age(now_unix(), record.built_at_unix));

  if !record.dependencies.is_empty() {
    println!();
    println!("Dependencies:");
    for dep in &record.dependencies {
      let signature = dep.signature.as_ref().map(|s| truncate_hash(&s.0)).unwrap_or("-");
      let origin = if dep.dynamic { " (discovered)" } else { "" };
      println!(
        "  {} {} {}{}",
        symbols::ARROW,
        display(config, &dep.identity),
        signature,
        origin
      );
    }
  }

  if !record.dynamic_targets.is_empty() {
    println!();
    println!("Discovered outputs:");
    for spec in &record.dynamic_targets {
      println!("  {} {}", symbols::INFO, display(config, &spec.identity));
    }
  }

  Ok(())
}
