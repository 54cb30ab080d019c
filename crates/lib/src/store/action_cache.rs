//! Persisted process results, keyed by process fingerprint.
//!
//! Entries live as `<store>/action_cache/<hex>.json`. They only reference digests, so a
//! store without a directory simply has no persisted entries.

use std::fs;
use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::{Store, StoreError};
use crate::platform::Platform;
use crate::util::hash::{Digest, Fingerprint};

/// The outcome of one process run, as recorded in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResult {
  pub exit_code: i32,
  pub stdout_digest: Digest,
  pub stderr_digest: Digest,
  pub output_digest: Digest,
  pub platform: Platform,
  pub elapsed_ms: u64,
}

impl ActionResult {
  pub fn digests(&self) -> [Digest; 3] {
    [self.stdout_digest, self.stderr_digest, self.output_digest]
  }
}

impl Store {
  pub fn load_action_result(&self, key: &Fingerprint) -> Result<Option<ActionResult>, StoreError> {
    let Some(local) = self.local_store() else {
      return Ok(None);
    };
    let path = local.action_cache_dir().join(format!("{}.json", key.to_hex()));
    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(StoreError::Io { path, source }),
    };
    match serde_json::from_slice(&bytes) {
      Ok(result) => Ok(Some(result)),
      Err(e) => {
        // An unreadable entry is a miss; the next run overwrites it.
        warn!(path = %path.display(), error = %e, "ignoring unreadable action cache entry");
        Ok(None)
      }
    }
  }

  pub fn record_action_result(&self, key: &Fingerprint, result: &ActionResult) -> Result<(), StoreError> {
    let Some(local) = self.local_store() else {
      return Ok(());
    };
    let dir = local.action_cache_dir();
    let path = dir.join(format!("{}.json", key.to_hex()));
    let bytes = serde_json::to_vec_pretty(result).map_err(StoreError::Serialize)?;

    let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(|source| StoreError::Io {
      path: dir.clone(),
      source,
    })?;
    temp.write_all(&bytes).map_err(|source| StoreError::Io {
      path: temp.path().to_path_buf(),
      source,
    })?;
    temp.persist(&path).map_err(|e| StoreError::Io {
      path: path.clone(),
      source: e.error,
    })?;
    trace!(key = %key, "recorded action result");
    Ok(())
  }

  /// Every readable persisted action result.
  pub(crate) fn action_results(&self) -> Result<Vec<ActionResult>, StoreError> {
    let Some(local) = self.local_store() else {
      return Ok(Vec::new());
    };
    let dir = local.action_cache_dir();
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => return Err(StoreError::Io { path: dir, source }),
    };

    let mut results = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_none_or(|ext| ext != "json") {
        continue;
      }
      match fs::read(&path).map(|bytes| serde_json::from_slice::<ActionResult>(&bytes)) {
        Ok(Ok(result)) => results.push(result),
        Ok(Err(e)) => warn!(path = %path.display(), error = %e, "skipping unreadable action cache entry"),
        Err(e) => warn!(path = %path.display(), error = %e, "failed to read action cache entry"),
      }
    }
    Ok(results)
  }
}
