//! On-disk signature store.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/
//! ├── .lock               # advisory lock, see `lock.rs`
//! └── records/
//!     └── <hash>.json     # one SignatureRecord per built node
//! ```
//!
//! `<hash>` is a prefix of the SHA-256 of the node identity. Records are
//! written to a temporary file and renamed into place, so a reader sees
//! either the old or the new record, never a partial one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::consts::{RECORD_NAME_LEN, RECORD_VERSION, RECORDS_DIR_NAME};
use crate::node::Identity;
use crate::util::hash::{Hashable, hash_bytes};

use super::types::{SignatureRecord, StoreError};

#[derive(Debug, Clone)]
pub struct SignatureStore {
  state_dir: PathBuf,
}

impl SignatureStore {
  pub fn new(state_dir: impl Into<PathBuf>) -> Self {
    Self {
      state_dir: state_dir.into(),
    }
  }

  pub fn state_dir(&self) -> &Path {
    &self.state_dir
  }

  pub fn records_dir(&self) -> PathBuf {
    self.state_dir.join(RECORDS_DIR_NAME)
  }

  /// File holding the record for `identity`.
  pub fn record_path(&self, identity: &Identity) -> PathBuf {
    let hash = identity
      .compute_hash()
      .unwrap_or_else(|_| hash_bytes(identity.to_string().as_bytes()));
    let name: String = hash.0.chars().take(RECORD_NAME_LEN).collect();
    self.records_dir().join(format!("{}.json", name))
  }

  fn ensure_dir(&self) -> Result<(), StoreError> {
    fs::create_dir_all(self.records_dir()).map_err(StoreError::CreateDir)
  }

  /// Load the record for `identity`.
  ///
  /// Returns `Ok(None)` if nothing was recorded.
  pub fn load(&self, identity: &Identity) -> Result<Option<SignatureRecord>, StoreError> {
    let Some(record) = read_record(&self.record_path(identity))? else {
      return Ok(None);
    };
    if &record.identity != identity {
      return Err(StoreError::IdentityMismatch {
        expected: identity.to_string(),
        found: record.identity.to_string(),
      });
    }
    Ok(Some(record))
  }

  /// Like [`load`](Self::load), but unreadable records count as absent.
  pub fn lookup(&self, identity: &Identity) -> Option<SignatureRecord> {
    match self.load(identity) {
      Ok(record) => record,
      Err(e) => {
        warn!(node = %identity, error = %e, "ignoring unreadable signature record");
        None
      }
    }
  }

  /// Atomically create or replace the record of `record.identity`.
  pub fn commit(&self, record: &SignatureRecord) -> Result<(), StoreError> {
    self.ensure_dir()?;

    let path = self.record_path(&record.identity);
    let temp_path = path.with_extension(format!("json.{}.tmp", std::process::id()));

    let content = serde_json::to_string_pretty(record).map_err(StoreError::Serialize)?;
    fs::write(&temp_path, &content).map_err(StoreError::Write)?;
    if let Err(e) = fs::rename(&temp_path, &path) {
      let _ = fs::remove_file(&temp_path);
      return Err(StoreError::Write(e));
    }

    Ok(())
  }

  /// Drop the record for `identity`. Returns whether one existed.
  pub fn remove(&self, identity: &Identity) -> Result<bool, StoreError> {
    match fs::remove_file(self.record_path(identity)) {
      Ok(()) => Ok(true),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(StoreError::Write(e)),
    }
  }

  /// Every readable record, sorted by identity. Unreadable files are
  /// logged and skipped.
  pub fn list(&self) -> Result<Vec<SignatureRecord>, StoreError> {
    let entries = match fs::read_dir(self.records_dir()) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(StoreError::Read(e)),
    };

    let mut records = Vec::new();
    for entry in entries {
      let path = entry.map_err(StoreError::Read)?.path();
      if path.extension().and_then(|e| e.to_str()) != Some("json") {
        continue;
      }
      match read_record(&path) {
        Ok(Some(record)) => records.push(record),
        Ok(None) => {}
        Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable signature record"),
      }
    }
    records.sort_by(|a, b| a.identity.cmp(&b.identity));
    Ok(records)
  }

  /// Remove every record. Returns how many files were deleted.
  pub fn clear(&self) -> Result<usize, StoreError> {
    let entries = match fs::read_dir(self.records_dir()) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
      Err(e) => return Err(StoreError::Read(e)),
    };

    let mut removed = 0;
    for entry in entries {
      let path = entry.map_err(StoreError::Read)?.path();
      if path.is_file() {
        fs::remove_file(&path).map_err(StoreError::Write)?;
        removed += 1;
      }
    }
    Ok(removed)
  }
}

fn read_record(path: &Path) -> Result<Option<SignatureRecord>, StoreError> {
  let content = match fs::read_to_string(path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
    Err(e) => return Err(StoreError::Read(e)),
  };

  let record: SignatureRecord = serde_json::from_str(&content).map_err(StoreError::Parse)?;
  if record.version != RECORD_VERSION {
    return Err(StoreError::UnsupportedVersion(record.version));
  }
  Ok(Some(record))
}
