//! Which nodes read which filesystem locations.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use super::graph::NodeId;
use crate::fs::{PathGlobMatcher, PathGlobs};

/// How many nodes an invalidation touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationResult {
  /// Completed nodes reset to not started.
  pub cleared: usize,
  /// Running nodes that were aborted and will start again for their waiters.
  pub restarted: usize,
}

impl InvalidationResult {
  pub fn total(&self) -> usize {
    self.cleared + self.restarted
  }
}

#[derive(Default)]
pub(crate) struct InvalidationIndex {
  files: HashMap<String, HashSet<NodeId>>,
  dirs: HashMap<String, HashSet<NodeId>>,
  globs: HashMap<NodeId, HashMap<PathGlobs, PathGlobMatcher>>,
  /// Reverse of `files` and `dirs`, for forgetting a node.
  recorded: HashMap<NodeId, Recorded>,
}

#[derive(Default)]
struct Recorded {
  files: HashSet<String>,
  dirs: HashSet<String>,
}

pub(crate) fn normalize(path: &str) -> &str {
  let path = path.trim_end_matches('/');
  let path = path.strip_prefix("./").unwrap_or(path);
  if path == "." { "" } else { path }
}

fn parent(path: &str) -> &str {
  path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

impl InvalidationIndex {
  pub(crate) fn record_file(&mut self, node: NodeId, path: &str) {
    let path = normalize(path).to_string();
    self.files.entry(path.clone()).or_default().insert(node);
    self.recorded.entry(node).or_default().files.insert(path);
  }

  pub(crate) fn record_dir(&mut self, node: NodeId, path: &str) {
    let path = normalize(path).to_string();
    self.dirs.entry(path.clone()).or_default().insert(node);
    self.recorded.entry(node).or_default().dirs.insert(path);
  }

  /// Drops everything `node` recorded. Called before it runs again.
  pub(crate) fn forget(&mut self, node: NodeId) {
    self.globs.remove(&node);
    let Some(recorded) = self.recorded.remove(&node) else {
      return;
    };
    for (paths, index) in [(recorded.files, &mut self.files), (recorded.dirs, &mut self.dirs)] {
      for path in paths {
        if let Some(nodes) = index.get_mut(&path) {
          nodes.remove(&node);
          if nodes.is_empty() {
            index.remove(&path);
          }
        }
      }
    }
  }

  pub(crate) fn record_globs(&mut self, node: NodeId, globs: &PathGlobs, matcher: PathGlobMatcher) {
    self.globs.entry(node).or_default().insert(globs.clone(), matcher);
  }

  /// Nodes that directly consulted `changed`: the path itself, anything read below it, the
  /// listing of its parent, or a glob that matches it.
  pub(crate) fn affected(&self, changed: &str) -> HashSet<NodeId> {
    let changed = normalize(changed);
    let mut nodes = HashSet::new();

    if let Some(readers) = self.files.get(changed) {
      nodes.extend(readers);
    }
    if let Some(listers) = self.dirs.get(parent(changed)) {
      nodes.extend(listers);
    }
    if let Some(listers) = self.dirs.get(changed) {
      nodes.extend(listers);
    }
    // A changed directory affects everything that was read beneath it.
    if !changed.is_empty() {
      let prefix = format!("{changed}/");
      for (path, readers) in self.files.iter().chain(self.dirs.iter()) {
        if path.starts_with(&prefix) {
          nodes.extend(readers);
        }
      }
    }
    for (node, matchers) in &self.globs {
      if matchers.values().any(|m| m.matches(changed)) {
        nodes.insert(*node);
      }
    }
    nodes
  }

  pub(crate) fn clear(&mut self) {
    self.files.clear();
    self.dirs.clear();
    self.globs.clear();
    self.recorded.clear();
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.files.len() + self.dirs.len() + self.globs.len()
  }
}
