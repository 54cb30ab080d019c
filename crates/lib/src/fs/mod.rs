//! Path globs and snapshots.
//!
//! Turns glob patterns into digests, either by reading the build root or by filtering a
//! tree already in the store.

pub mod glob;
pub mod snapshot;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use glob::{GlobExpansionConjunction, GlobMatchErrorBehavior, PathGlobMatcher, PathGlobs};
pub use snapshot::{FsReads, Snapshot};

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SnapshotError {
  #[error("invalid glob {glob:?}: {reason}")]
  InvalidGlob { glob: String, reason: String },

  #[error("unmatched {} from {origin}: {}", if .globs.len() == 1 { "glob" } else { "globs" }, format_globs(.globs))]
  UnmatchedGlob { globs: Vec<String>, origin: String },

  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Store(#[from] StoreError),
}

fn format_globs(globs: &[String]) -> String {
  globs.iter().map(|g| format!("{g:?}")).collect::<Vec<_>>().join(", ")
}
