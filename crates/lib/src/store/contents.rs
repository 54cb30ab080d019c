//! Flattened views of a tree: every file with its bytes, or every entry with its digest.

use bytes::Bytes;
use serde::Serialize;

use super::directory::join_path;
use super::{Store, StoreError};
use crate::util::hash::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileContent {
  pub path: String,
  pub content: Bytes,
  pub is_executable: bool,
}

/// All files of a tree with their bytes loaded, in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DigestContents(pub Vec<FileContent>);

impl DigestContents {
  pub fn get(&self, path: &str) -> Option<&FileContent> {
    self.0.iter().find(|f| f.path == path)
  }

  pub fn iter(&self) -> impl Iterator<Item = &FileContent> {
    self.0.iter()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DigestEntry {
  File {
    path: String,
    digest: Digest,
    is_executable: bool,
  },
  EmptyDirectory {
    path: String,
  },
}

impl DigestEntry {
  pub fn path(&self) -> &str {
    match self {
      DigestEntry::File { path, .. } | DigestEntry::EmptyDirectory { path } => path,
    }
  }
}

/// Files (by digest) and empty directories of a tree, without loading any bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DigestEntries(pub Vec<DigestEntry>);

/// Callback view of one tree entry during [`Store::walk`].
#[derive(Debug, Clone, Copy)]
pub enum WalkEntry<'a> {
  File { digest: &'a Digest, is_executable: bool },
  Directory { digest: &'a Digest, is_empty: bool },
}

impl Store {
  /// Visit every entry below `digest` depth-first, in path order.
  pub fn walk<F>(&self, digest: &Digest, visit: &mut F) -> Result<(), StoreError>
  where
    F: FnMut(&str, WalkEntry<'_>) -> Result<(), StoreError>,
  {
    self.walk_at("", digest, visit)
  }

  fn walk_at<F>(&self, path: &str, digest: &Digest, visit: &mut F) -> Result<(), StoreError>
  where
    F: FnMut(&str, WalkEntry<'_>) -> Result<(), StoreError>,
  {
    let directory = self.load_directory(digest)?;
    // Files and directories interleave by name so callers see global path order.
    let mut files = directory.files.iter().peekable();
    let mut dirs = directory.directories.iter().peekable();
    loop {
      let take_file = match (files.peek(), dirs.peek()) {
        (Some(f), Some(d)) => f.name < d.name,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => break,
      };
      if take_file {
        if let Some(file) = files.next() {
          visit(
            &join_path(path, &file.name),
            WalkEntry::File {
              digest: &file.digest,
              is_executable: file.is_executable,
            },
          )?;
        }
      } else if let Some(dir) = dirs.next() {
        let child_path = join_path(path, &dir.name);
        let child = self.load_directory(&dir.digest)?;
        visit(
          &child_path,
          WalkEntry::Directory {
            digest: &dir.digest,
            is_empty: child.is_empty(),
          },
        )?;
        self.walk_at(&child_path, &dir.digest, visit)?;
      }
    }
    Ok(())
  }

  pub fn contents(&self, digest: &Digest) -> Result<DigestContents, StoreError> {
    let mut files = Vec::new();
    self.walk(digest, &mut |path, entry| {
      if let WalkEntry::File { digest, is_executable } = entry {
        files.push(FileContent {
          path: path.to_string(),
          content: self.load_file_bytes(digest)?,
          is_executable,
        });
      }
      Ok(())
    })?;
    Ok(DigestContents(files))
  }

  pub fn entries(&self, digest: &Digest) -> Result<DigestEntries, StoreError> {
    let mut entries = Vec::new();
    self.walk(digest, &mut |path, entry| {
      match entry {
        WalkEntry::File { digest, is_executable } => entries.push(DigestEntry::File {
          path: path.to_string(),
          digest: *digest,
          is_executable,
        }),
        WalkEntry::Directory { is_empty: true, .. } => entries.push(DigestEntry::EmptyDirectory {
          path: path.to_string(),
        }),
        WalkEntry::Directory { .. } => {}
      }
      Ok(())
    })?;
    Ok(DigestEntries(entries))
  }
}
