//! Tree transformations: merge, subset, and prefix manipulation.
//!
//! Each operation produces a new digest and reuses unchanged subtrees by digest, so the
//! cost is proportional to the part of the tree that actually differs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use super::directory::{join_path, path_components};
use super::{Directory, DirectoryNode, EMPTY_DIRECTORY_DIGEST, FileNode, Store, StoreError};
use crate::fs::glob::PathGlobMatcher;
use crate::util::hash::Digest;

impl Store {
  /// Union of several trees.
  ///
  /// Fails with [`StoreError::MergeCollision`] if two inputs put different content at the
  /// same path: different bytes, different executable bits, or a file against a directory.
  pub fn merge(&self, digests: &[Digest]) -> Result<Digest, StoreError> {
    let result = self.merge_at("", digests)?;
    trace!(inputs = digests.len(), digest = %result, "merged digests");
    Ok(result)
  }

  fn merge_at(&self, path: &str, digests: &[Digest]) -> Result<Digest, StoreError> {
    let unique: BTreeSet<Digest> = digests
      .iter()
      .copied()
      .filter(|d| *d != *EMPTY_DIRECTORY_DIGEST)
      .collect();
    let unique: Vec<Digest> = unique.into_iter().collect();
    match unique.as_slice() {
      [] => return Ok(*EMPTY_DIRECTORY_DIGEST),
      [only] => {
        // Still confirm it is a directory we know about.
        self.load_directory(only)?;
        return Ok(*only);
      }
      _ => {}
    }

    let mut files: BTreeMap<String, FileNode> = BTreeMap::new();
    let mut dirs: BTreeMap<String, Vec<Digest>> = BTreeMap::new();
    for digest in &unique {
      let directory = self.load_directory(digest)?;
      for file in &directory.files {
        match files.get(&file.name) {
          Some(existing) if existing.digest != file.digest => {
            return Err(StoreError::MergeCollision {
              path: join_path(path, &file.name),
              details: format!("content differs ({} vs {})", existing.digest, file.digest),
            });
          }
          Some(existing) if existing.is_executable != file.is_executable => {
            return Err(StoreError::MergeCollision {
              path: join_path(path, &file.name),
              details: "executable bit differs".to_string(),
            });
          }
          Some(_) => {}
          None => {
            files.insert(file.name.clone(), file.clone());
          }
        }
      }
      for child in &directory.directories {
        dirs.entry(child.name.clone()).or_default().push(child.digest);
      }
    }

    if let Some(name) = files.keys().find(|name| dirs.contains_key(*name)) {
      return Err(StoreError::MergeCollision {
        path: join_path(path, name),
        details: "path is a file in one input and a directory in another".to_string(),
      });
    }

    let mut directories = Vec::with_capacity(dirs.len());
    for (name, children) in dirs {
      let child_path = join_path(path, &name);
      let digest = self.merge_at(&child_path, &children)?;
      directories.push(DirectoryNode { name, digest });
    }
    self.record_directory(Directory::new(files.into_values().collect(), directories)?)
  }

  /// Keep only files matched by `matcher`, plus whole subtrees of matched directories.
  pub fn subset(&self, digest: &Digest, matcher: &PathGlobMatcher) -> Result<Digest, StoreError> {
    self.subset_at("", digest, matcher, false)
  }

  fn subset_at(
    &self,
    path: &str,
    digest: &Digest,
    matcher: &PathGlobMatcher,
    inherited: bool,
  ) -> Result<Digest, StoreError> {
    let directory = self.load_directory(digest)?;

    let files: Vec<FileNode> = directory
      .files
      .iter()
      .filter(|f| {
        let file_path = join_path(path, &f.name);
        (inherited || matcher.is_included(&file_path)) && !matcher.is_excluded(&file_path)
      })
      .cloned()
      .collect();

    let mut directories = Vec::new();
    for child in &directory.directories {
      let child_path = join_path(path, &child.name);
      if matcher.is_excluded(&child_path) {
        continue;
      }
      let child_inherited = inherited || matcher.is_included(&child_path);
      if child_inherited && !matcher.has_excludes() {
        directories.push(child.clone());
        continue;
      }
      let subset = self.subset_at(&child_path, &child.digest, matcher, child_inherited)?;
      let keep_empty = child_inherited && child.digest == *EMPTY_DIRECTORY_DIGEST;
      if subset != *EMPTY_DIRECTORY_DIGEST || keep_empty {
        directories.push(DirectoryNode {
          name: child.name.clone(),
          digest: subset,
        });
      }
    }

    if files.len() == directory.files.len() && directories == directory.directories {
      return Ok(*digest);
    }
    self.record_directory(Directory::new(files, directories)?)
  }

  /// Remove a leading directory prefix from every path in the tree.
  ///
  /// Fails with [`StoreError::PrefixNotFound`] when the prefix does not exist, or when
  /// the tree has entries outside it.
  pub fn strip_prefix(&self, digest: &Digest, prefix: &str) -> Result<Digest, StoreError> {
    let components = path_components(prefix)?;
    let mut current = *digest;
    let mut walked = String::new();
    for component in components {
      let directory = self.load_directory(&current)?;
      let Some(child) = directory.directory(component) else {
        return Err(StoreError::PrefixNotFound {
          prefix: prefix.to_string(),
          digest: *digest,
          details: format!("no directory named {:?} under {:?}", component, display_root(&walked)),
        });
      };
      let others: Vec<String> = directory
        .files
        .iter()
        .map(|f| join_path(&walked, &f.name))
        .chain(
          directory
            .directories
            .iter()
            .filter(|d| d.name != component)
            .map(|d| join_path(&walked, &d.name)),
        )
        .collect();
      if !others.is_empty() {
        return Err(StoreError::PrefixNotFound {
          prefix: prefix.to_string(),
          digest: *digest,
          details: format!("entries exist outside the prefix: {}", others.join(", ")),
        });
      }
      current = child.digest;
      walked = join_path(&walked, component);
    }
    Ok(current)
  }

  /// Nest the whole tree under `prefix`.
  pub fn add_prefix(&self, digest: &Digest, prefix: &str) -> Result<Digest, StoreError> {
    let components = path_components(prefix)?;
    self.load_directory(digest)?;
    let mut current = *digest;
    for component in components.into_iter().rev() {
      current = self.record_directory(Directory::new(
        vec![],
        vec![DirectoryNode {
          name: component.to_string(),
          digest: current,
        }],
      )?)?;
    }
    Ok(current)
  }
}

fn display_root(path: &str) -> &str {
  if path.is_empty() { "." } else { path }
}
