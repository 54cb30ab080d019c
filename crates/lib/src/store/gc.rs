use std::collections::HashSet;
use std::fs;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::local::{EntryKind, LocalStore};
use super::{Store, StoreError};
use crate::util::hash::{Digest, Fingerprint};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GcStats {
  pub files_scanned: usize,
  pub files_deleted: usize,
  pub directories_scanned: usize,
  pub directories_deleted: usize,
  pub bytes_freed: u64,
}

impl GcStats {
  pub fn total_deleted(&self) -> usize {
    self.files_deleted + self.directories_deleted
  }
}

#[derive(Default)]
struct LiveSet {
  files: HashSet<Fingerprint>,
  directories: HashSet<Fingerprint>,
}

impl Store {
  /// Delete persisted entries not reachable from `roots` or from any action cache entry.
  ///
  /// Upgrades this store's lock to exclusive for the duration, so it fails while any other
  /// store handle on the same directory is open. With `dry_run` nothing is deleted, but the
  /// statistics report what would have been.
  pub fn garbage_collect(&self, roots: &[Digest], dry_run: bool) -> Result<GcStats, StoreError> {
    let Some(local) = self.local_store() else {
      return Err(StoreError::NotPersistent);
    };
    let mut lock = local.lock();
    lock.upgrade("gc")?;
    let result = self.collect(local, roots, dry_run);
    if let Err(e) = lock.downgrade() {
      warn!(error = %e, "could not return store lock to shared");
    }
    result
  }

  fn collect(&self, local: &LocalStore, roots: &[Digest], dry_run: bool) -> Result<GcStats, StoreError> {
    let mut live = LiveSet::default();
    let mut pending: Vec<Digest> = roots.to_vec();
    for result in self.action_results()? {
      pending.extend(result.digests());
    }
    debug!(roots = pending.len(), "marking live entries");
    for digest in pending {
      self.mark(&digest, &mut live)?;
    }

    let mut stats = GcStats::default();
    for (hash, path) in local.list(EntryKind::Directory)? {
      stats.directories_scanned += 1;
      if live.directories.contains(&hash) {
        continue;
      }
      if self.sweep(EntryKind::Directory, &hash, &path, dry_run, &mut stats) {
        stats.directories_deleted += 1;
      }
    }
    for (hash, path) in local.list(EntryKind::File)? {
      stats.files_scanned += 1;
      if live.files.contains(&hash) {
        continue;
      }
      if self.sweep(EntryKind::File, &hash, &path, dry_run, &mut stats) {
        stats.files_deleted += 1;
      }
    }

    info!(
      files_deleted = stats.files_deleted,
      directories_deleted = stats.directories_deleted,
      bytes_freed = stats.bytes_freed,
      dry_run,
      "garbage collection complete"
    );
    Ok(stats)
  }

  fn mark(&self, digest: &Digest, live: &mut LiveSet) -> Result<(), StoreError> {
    if live.directories.contains(&digest.hash) || live.files.contains(&digest.hash) {
      return Ok(());
    }
    if self.contains_directory(digest) {
      live.directories.insert(digest.hash);
      let directory = self.load_directory(digest)?;
      for file in &directory.files {
        live.files.insert(file.digest.hash);
      }
      for child in &directory.directories {
        self.mark(&child.digest, live)?;
      }
    } else {
      // Blob roots (stdout/stderr) and digests already gone are both fine here.
      live.files.insert(digest.hash);
    }
    Ok(())
  }

  fn sweep(
    &self,
    kind: EntryKind,
    hash: &Fingerprint,
    path: &std::path::Path,
    dry_run: bool,
    stats: &mut GcStats,
  ) -> bool {
    let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    debug!(path = %path.display(), ?kind, "removing unreferenced entry");
    if !dry_run {
      if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to delete store entry");
        return false;
      }
      self.forget(kind, hash);
    }
    stats.bytes_freed += size;
    true
  }
}
