//! Moving trees between the store and a real filesystem.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, trace};
use walkdir::WalkDir;

use super::directory::path_components;
use super::{CreateEntry, Store, StoreError};
use crate::util::hash::Digest;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
  move |source| StoreError::Io {
    path: path.to_path_buf(),
    source,
  }
}

#[cfg(unix)]
pub(crate) fn is_executable(metadata: &fs::Metadata) -> bool {
  use std::os::unix::fs::PermissionsExt;
  metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_metadata: &fs::Metadata) -> bool {
  false
}

#[cfg(unix)]
fn set_mode(path: &Path, is_executable: bool) -> Result<(), StoreError> {
  use std::os::unix::fs::PermissionsExt;
  let mode = if is_executable { 0o755 } else { 0o644 };
  fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err(path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _is_executable: bool) -> Result<(), StoreError> {
  Ok(())
}

impl Store {
  /// Capture files and directories below `root` into a tree.
  ///
  /// Each relative path may name a file or a directory (captured recursively, empty
  /// directories included). Paths that do not exist are skipped.
  pub fn ingest_paths(&self, root: &Path, paths: &[String]) -> Result<Digest, StoreError> {
    let mut entries = Vec::new();
    for relative in paths {
      let components = path_components(relative)?;
      let relative = components.join("/");
      let absolute = root.join(&relative);
      let metadata = match fs::metadata(&absolute) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
          trace!(path = %absolute.display(), "skipping missing path");
          continue;
        }
        Err(source) => return Err(StoreError::Io { path: absolute, source }),
      };

      if metadata.is_dir() {
        self.ingest_tree(root, &absolute, &mut entries)?;
      } else {
        entries.push(self.ingest_file(&absolute, relative, &metadata)?);
      }
    }
    self.store_directory(entries)
  }

  fn ingest_file(&self, absolute: &Path, relative: String, metadata: &fs::Metadata) -> Result<CreateEntry, StoreError> {
    let bytes = fs::read(absolute).map_err(io_err(absolute))?;
    let digest = self.store_file_bytes(bytes)?;
    Ok(CreateEntry::FileDigest {
      path: relative,
      digest,
      is_executable: is_executable(metadata),
    })
  }

  fn ingest_tree(&self, root: &Path, dir: &Path, entries: &mut Vec<CreateEntry>) -> Result<(), StoreError> {
    for entry in WalkDir::new(dir).sort_by_file_name() {
      let entry = entry.map_err(|e| StoreError::Io {
        path: dir.to_path_buf(),
        source: e.into(),
      })?;
      let Some(relative) = relative_string(root, entry.path()) else {
        continue;
      };
      if relative.is_empty() {
        continue;
      }

      let metadata = match fs::metadata(entry.path()) {
        Ok(metadata) => metadata,
        // Dangling symlink.
        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
        Err(source) => {
          return Err(StoreError::Io {
            path: entry.path().to_path_buf(),
            source,
          });
        }
      };
      if metadata.is_dir() {
        if entry.path_is_symlink() {
          debug!(path = %entry.path().display(), "not following directory symlink");
          continue;
        }
        entries.push(CreateEntry::Directory { path: relative });
      } else {
        entries.push(self.ingest_file(entry.path(), relative, &metadata)?);
      }
    }
    Ok(())
  }

  /// Write the tree at `digest` into `destination`, creating it if needed.
  pub fn materialize_directory(&self, destination: &Path, digest: &Digest) -> Result<(), StoreError> {
    fs::create_dir_all(destination).map_err(io_err(destination))?;
    let directory = self.load_directory(digest)?;
    for file in &directory.files {
      let path = destination.join(&file.name);
      let bytes = self.load_file_bytes(&file.digest)?;
      fs::write(&path, &bytes).map_err(io_err(&path))?;
      set_mode(&path, file.is_executable)?;
    }
    for child in &directory.directories {
      self.materialize_directory(&destination.join(&child.name), &child.digest)?;
    }
    Ok(())
  }
}

/// `path` relative to `root`, with `/` separators.
pub(crate) fn relative_string(root: &Path, path: &Path) -> Option<String> {
  let relative = path.strip_prefix(root).ok()?;
  let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
  Some(parts?.join("/"))
}
