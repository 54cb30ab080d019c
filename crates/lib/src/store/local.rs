//! On-disk persistence for store entries.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── files/<aa>/<hash>          # blob bytes
//! ├── directories/<aa>/<hash>    # canonical directory JSON
//! ├── action_cache/<hash>.json   # process cache entries
//! └── .lock
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use super::StoreError;
use super::lock::{LockMode, StoreLock};
use crate::util::hash::{Digest, Fingerprint};

pub(crate) const FILES_DIR: &str = "files";
pub(crate) const DIRECTORIES_DIR: &str = "directories";
pub(crate) const ACTION_CACHE_DIR: &str = "action_cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
  File,
  Directory,
}

impl EntryKind {
  fn dir_name(self) -> &'static str {
    match self {
      EntryKind::File => FILES_DIR,
      EntryKind::Directory => DIRECTORIES_DIR,
    }
  }
}

#[derive(Debug, Clone)]
pub(crate) struct LocalStore {
  root: PathBuf,
  /// Held shared until the last clone is dropped.
  lock: Arc<Mutex<StoreLock>>,
}

impl LocalStore {
  pub fn open(root: &Path) -> Result<Self, StoreError> {
    for sub in [FILES_DIR, DIRECTORIES_DIR, ACTION_CACHE_DIR] {
      let dir = root.join(sub);
      fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir, source })?;
    }
    let lock = StoreLock::acquire(root, LockMode::Shared, "open")?;
    Ok(Self {
      root: root.to_path_buf(),
      lock: Arc::new(Mutex::new(lock)),
    })
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn lock(&self) -> MutexGuard<'_, StoreLock> {
    self.lock.lock()
  }

  pub fn action_cache_dir(&self) -> PathBuf {
    self.root.join(ACTION_CACHE_DIR)
  }

  pub fn entry_path(&self, kind: EntryKind, hash: &Fingerprint) -> PathBuf {
    self.root.join(kind.dir_name()).join(hash.shard()).join(hash.to_hex())
  }

  pub fn contains(&self, kind: EntryKind, hash: &Fingerprint) -> bool {
    self.entry_path(kind, hash).is_file()
  }

  /// Write an entry unless it already exists.
  ///
  /// Content is written to a temp file in the target shard and moved into place, so
  /// readers never observe a partial entry and an existing entry is never replaced.
  pub fn write(&self, kind: EntryKind, digest: &Digest, bytes: &[u8]) -> Result<(), StoreError> {
    let path = self.entry_path(kind, &digest.hash);
    if path.is_file() {
      return Ok(());
    }
    let Some(shard) = path.parent() else {
      return Err(StoreError::Io {
        path,
        source: io::Error::other("entry path has no parent"),
      });
    };
    fs::create_dir_all(shard).map_err(|source| StoreError::Io {
      path: shard.to_path_buf(),
      source,
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(shard).map_err(|source| StoreError::Io {
      path: shard.to_path_buf(),
      source,
    })?;
    temp.write_all(bytes).map_err(|source| StoreError::Io {
      path: temp.path().to_path_buf(),
      source,
    })?;

    match temp.persist_noclobber(&path) {
      Ok(_) => {
        trace!(digest = %digest, kind = ?kind, "persisted store entry");
        Ok(())
      }
      // Another writer got there first; content is identical by construction.
      Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(()),
      Err(e) => Err(StoreError::Io { path, source: e.error }),
    }
  }

  /// Read an entry and verify it against its fingerprint.
  pub fn read(&self, kind: EntryKind, digest: &Digest) -> Result<Option<Vec<u8>>, StoreError> {
    let path = self.entry_path(kind, &digest.hash);
    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(StoreError::Io { path, source }),
    };
    if Digest::of_bytes(&bytes) != *digest {
      return Err(StoreError::CorruptEntry {
        digest: *digest,
        message: format!("content at {} does not match its fingerprint", path.display()),
      });
    }
    Ok(Some(bytes))
  }

  /// Every fingerprint persisted for `kind`.
  pub fn list(&self, kind: EntryKind) -> Result<Vec<(Fingerprint, PathBuf)>, StoreError> {
    let base = self.root.join(kind.dir_name());
    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(&base).min_depth(2).max_depth(2) {
      let entry = entry.map_err(|e| StoreError::Io {
        path: base.clone(),
        source: e.into(),
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      // Leftover temp files have non-hex names and are skipped.
      if let Some(name) = entry.file_name().to_str()
        && let Ok(hash) = Fingerprint::from_hex(name)
      {
        entries.push((hash, entry.into_path()));
      }
    }
    Ok(entries)
  }
}
