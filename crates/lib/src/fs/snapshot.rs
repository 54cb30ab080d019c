//! Snapshots: a digest plus the paths it contains.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::glob::{GlobExpansionConjunction, GlobMatchErrorBehavior, PathGlobMatcher, PathGlobs};
use super::SnapshotError;
use crate::store::contents::WalkEntry;
use crate::store::materialize::{is_executable, relative_string};
use crate::store::{CreateEntry, EMPTY_DIRECTORY_DIGEST, Store};
use crate::util::hash::Digest;

/// An immutable tree with its file and directory paths listed in path order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Snapshot {
  pub digest: Digest,
  pub files: Vec<String>,
  pub dirs: Vec<String>,
}

/// Filesystem locations consulted while capturing a snapshot from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsReads {
  /// Files whose content was read, or literal paths that were looked up.
  pub files: BTreeSet<String>,
  /// Directories whose listing was read. The root is `""`.
  pub dirs: BTreeSet<String>,
}

impl Snapshot {
  pub fn empty() -> Self {
    Self {
      digest: *EMPTY_DIRECTORY_DIGEST,
      files: Vec::new(),
      dirs: Vec::new(),
    }
  }

  pub fn from_digest(store: &Store, digest: Digest) -> Result<Self, SnapshotError> {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    store.walk(&digest, &mut |path, entry| {
      match entry {
        WalkEntry::File { .. } => files.push(path.to_string()),
        WalkEntry::Directory { .. } => dirs.push(path.to_string()),
      }
      Ok(())
    })?;
    Ok(Self { digest, files, dirs })
  }

  /// Expand `globs` against the directory `root` and store what matched.
  ///
  /// Paths matched by `ignore` are never read. Returns the snapshot and the locations it
  /// consulted, so callers can be invalidated when any of them change.
  pub fn capture(
    store: &Store,
    root: &Path,
    globs: &PathGlobs,
    ignore: &PathGlobMatcher,
  ) -> Result<(Self, FsReads), SnapshotError> {
    let matcher = globs.matcher()?;
    let mut capture = Capture {
      store,
      root,
      matcher: &matcher,
      ignore,
      entries: BTreeMap::new(),
      matched: BTreeSet::new(),
      reads: FsReads::default(),
    };

    for start in walk_roots(&matcher) {
      capture.walk_from(&start)?;
    }

    let Capture {
      entries, matched, reads, ..
    } = capture;
    check_unmatched(globs, &matcher, &matched)?;
    let digest = store.store_directory(entries.into_values().collect())?;
    debug!(digest = %digest, globs = ?globs.globs, files_read = reads.files.len(), "captured snapshot");
    Ok((Self::from_digest(store, digest)?, reads))
  }

  /// Filter a stored tree by `globs`, honouring the unmatched-glob behavior.
  pub fn subset(store: &Store, digest: &Digest, globs: &PathGlobs) -> Result<Digest, SnapshotError> {
    let matcher = globs.matcher()?;
    let subset = store.subset(digest, &matcher)?;
    if globs.glob_match_error_behavior != GlobMatchErrorBehavior::Ignore {
      let mut matched = BTreeSet::new();
      store.walk(&subset, &mut |path, _| {
        matched.extend(matcher.matching_includes_within(path));
        Ok(())
      })?;
      check_unmatched(globs, &matcher, &matched)?;
    }
    Ok(subset)
  }
}

struct Capture<'a> {
  store: &'a Store,
  root: &'a Path,
  matcher: &'a PathGlobMatcher,
  ignore: &'a PathGlobMatcher,
  entries: BTreeMap<String, CreateEntry>,
  matched: BTreeSet<usize>,
  reads: FsReads,
}

fn skipped(matcher: &PathGlobMatcher, ignore: &PathGlobMatcher, relative: &str) -> bool {
  !relative.is_empty() && (ignore.is_excluded(relative) || matcher.is_excluded(relative))
}

impl Capture<'_> {
  fn walk_from(&mut self, start: &str) -> Result<(), SnapshotError> {
    let (root, matcher, ignore) = (self.root, self.matcher, self.ignore);
    if skipped(matcher, ignore, start) {
      return Ok(());
    }
    let absolute = root.join(start);
    let metadata = match fs::metadata(&absolute) {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        // Creating the path later changes its parent's listing.
        self.reads.files.insert(start.to_string());
        self.reads.dirs.insert(parent_of(start).to_string());
        return Ok(());
      }
      Err(source) => return Err(SnapshotError::Io { path: absolute, source }),
    };
    if !metadata.is_dir() {
      return self.visit_file(start.to_string(), &absolute, &metadata);
    }

    let walker = WalkDir::new(&absolute)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(|e| relative_string(root, e.path()).is_some_and(|rel| !skipped(matcher, ignore, &rel)));
    for entry in walker {
      let entry = entry.map_err(|e| SnapshotError::Io {
        path: absolute.clone(),
        source: e.into(),
      })?;
      let Some(relative) = relative_string(root, entry.path()) else {
        continue;
      };
      let metadata = match fs::metadata(entry.path()) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
        Err(source) => {
          return Err(SnapshotError::Io {
            path: entry.path().to_path_buf(),
            source,
          });
        }
      };

      if metadata.is_dir() {
        if entry.path_is_symlink() {
          continue;
        }
        self.reads.dirs.insert(relative.clone());
        if !relative.is_empty() && self.matcher.matches(&relative) {
          self.matched.extend(self.matcher.matching_includes(&relative));
          self.entries.insert(relative.clone(), CreateEntry::Directory { path: relative });
        }
      } else {
        self.visit_file(relative, entry.path(), &metadata)?;
      }
    }
    Ok(())
  }

  fn visit_file(&mut self, relative: String, absolute: &Path, metadata: &fs::Metadata) -> Result<(), SnapshotError> {
    if !self.matcher.matches(&relative) {
      return Ok(());
    }
    let bytes = fs::read(absolute).map_err(|source| SnapshotError::Io {
      path: absolute.to_path_buf(),
      source,
    })?;
    let digest = self.store.store_file_bytes(bytes)?;
    self.matched.extend(self.matcher.matching_includes(&relative));
    self.reads.files.insert(relative.clone());
    self.entries.insert(
      relative.clone(),
      CreateEntry::FileDigest {
        path: relative,
        digest,
        is_executable: is_executable(metadata),
      },
    );
    Ok(())
  }
}

/// Literal prefixes of the includes, dropping any nested under another.
fn walk_roots(matcher: &PathGlobMatcher) -> Vec<String> {
  let prefixes: BTreeSet<String> = matcher.includes().iter().map(|p| p.literal_prefix()).collect();
  let mut roots: Vec<String> = Vec::new();
  for prefix in prefixes {
    let covered = roots
      .iter()
      .any(|r| r.is_empty() || prefix == *r || prefix.starts_with(&format!("{r}/")));
    if !covered {
      roots.push(prefix);
    }
  }
  roots
}

fn parent_of(path: &str) -> &str {
  path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
}

pub(crate) fn check_unmatched(
  globs: &PathGlobs,
  matcher: &PathGlobMatcher,
  matched: &BTreeSet<usize>,
) -> Result<(), SnapshotError> {
  if globs.glob_match_error_behavior == GlobMatchErrorBehavior::Ignore || matcher.includes().is_empty() {
    return Ok(());
  }
  let unmatched: Vec<String> = matcher
    .includes()
    .iter()
    .enumerate()
    .filter(|(idx, _)| !matched.contains(idx))
    .map(|(_, p)| p.source.clone())
    .collect();
  let failed = match globs.conjunction {
    GlobExpansionConjunction::AllMatch => !unmatched.is_empty(),
    GlobExpansionConjunction::AnyMatch => matched.is_empty(),
  };
  if !failed {
    return Ok(());
  }

  let origin = globs
    .description_of_origin
    .clone()
    .unwrap_or_else(|| "path globs".to_string());
  match globs.glob_match_error_behavior {
    GlobMatchErrorBehavior::Error => Err(SnapshotError::UnmatchedGlob {
      globs: unmatched,
      origin,
    }),
    _ => {
      warn!(globs = ?unmatched, origin = %origin, "unmatched globs");
      Ok(())
    }
  }
}
