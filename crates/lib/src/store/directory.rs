//! Merkle directory nodes.
//!
//! A `Directory` lists the files and subdirectories of one tree level by name,
//! each referencing its content by `Digest`. Its own digest is the SHA-256 of
//! its canonical JSON encoding, so equal trees always share a digest.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::util::hash::Digest;

/// Canonical encoding of a directory with no entries.
const EMPTY_DIRECTORY_BYTES: &[u8] = br#"{"files":[],"directories":[]}"#;

pub static EMPTY_DIRECTORY_DIGEST: LazyLock<Digest> = LazyLock::new(|| Digest::of_bytes(EMPTY_DIRECTORY_BYTES));

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileNode {
  pub name: String,
  pub digest: Digest,
  pub is_executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryNode {
  pub name: String,
  pub digest: Digest,
}

/// One level of a content-addressed tree. Entries are sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Directory {
  pub files: Vec<FileNode>,
  pub directories: Vec<DirectoryNode>,
}

impl Directory {
  /// Build a directory, sorting entries and rejecting invalid or duplicate names.
  pub fn new(mut files: Vec<FileNode>, mut directories: Vec<DirectoryNode>) -> Result<Self, StoreError> {
    files.sort_by(|a, b| a.name.cmp(&b.name));
    directories.sort_by(|a, b| a.name.cmp(&b.name));

    let mut seen = BTreeSet::new();
    for name in files.iter().map(|f| &f.name).chain(directories.iter().map(|d| &d.name)) {
      validate_name(name)?;
      if !seen.insert(name.as_str()) {
        return Err(StoreError::MergeCollision {
          path: name.clone(),
          details: "name appears more than once in the same directory".to_string(),
        });
      }
    }

    Ok(Self { files, directories })
  }

  pub fn is_empty(&self) -> bool {
    self.files.is_empty() && self.directories.is_empty()
  }

  pub fn file(&self, name: &str) -> Option<&FileNode> {
    self
      .files
      .binary_search_by(|f| f.name.as_str().cmp(name))
      .ok()
      .map(|idx| &self.files[idx])
  }

  pub fn directory(&self, name: &str) -> Option<&DirectoryNode> {
    self
      .directories
      .binary_search_by(|d| d.name.as_str().cmp(name))
      .ok()
      .map(|idx| &self.directories[idx])
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
    if self.is_empty() {
      return Ok(EMPTY_DIRECTORY_BYTES.to_vec());
    }
    serde_json::to_vec(self).map_err(StoreError::Serialize)
  }

  pub fn from_bytes(digest: Digest, bytes: &[u8]) -> Result<Self, StoreError> {
    let directory: Directory = serde_json::from_slice(bytes).map_err(|e| StoreError::CorruptEntry {
      digest,
      message: e.to_string(),
    })?;
    // Re-validate: a stored node must already be canonical.
    let canonical = Directory::new(directory.files.clone(), directory.directories.clone())?;
    if canonical != directory {
      return Err(StoreError::CorruptEntry {
        digest,
        message: "directory entries are not in canonical order".to_string(),
      });
    }
    Ok(directory)
  }

  pub fn digest(&self) -> Result<Digest, StoreError> {
    Ok(Digest::of_bytes(&self.to_bytes()?))
  }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
  let reason = if name.is_empty() {
    "empty name"
  } else if name == "." || name == ".." {
    "relative components are not allowed"
  } else if name.contains('/') || name.contains('\\') {
    "names may not contain path separators"
  } else {
    return Ok(());
  };
  Err(StoreError::InvalidPath {
    path: name.to_string(),
    reason: reason.to_string(),
  })
}

/// Split a relative path into validated components.
///
/// The empty string (and `.`) is the root and yields no components.
pub fn path_components(path: &str) -> Result<Vec<&str>, StoreError> {
  if path.starts_with('/') {
    return Err(StoreError::InvalidPath {
      path: path.to_string(),
      reason: "absolute paths are not allowed".to_string(),
    });
  }
  let mut components = Vec::new();
  for component in path.split('/') {
    if component.is_empty() || component == "." {
      continue;
    }
    validate_name(component).map_err(|_| StoreError::InvalidPath {
      path: path.to_string(),
      reason: format!("invalid component {component:?}"),
    })?;
    components.push(component);
  }
  Ok(components)
}

/// Join a parent path and a child name with `/`.
pub fn join_path(parent: &str, name: &str) -> String {
  if parent.is_empty() {
    name.to_string()
  } else {
    format!("{parent}/{name}")
  }
}
