//! Content-addressed storage of blobs and directory trees.
//!
//! Every value handed between rules that touches the filesystem is a [`Digest`] into this
//! store. Blobs are raw bytes; trees are Merkle [`Directory`] nodes that reference their
//! children by digest, so equal trees share a digest and unchanged subtrees are shared
//! between derived trees.
//!
//! The store always keeps an in-memory index. When opened on a directory it also persists
//! entries there (see [`local`] for the layout) and reads them back on a memory miss.

pub mod action_cache;
pub mod contents;
pub mod directory;
pub mod gc;
pub mod local;
pub mod lock;
pub mod materialize;
pub mod ops;

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

pub use contents::{DigestContents, DigestEntries, DigestEntry, FileContent};
pub use directory::{Directory, DirectoryNode, EMPTY_DIRECTORY_DIGEST, FileNode};
pub use gc::GcStats;
pub use lock::{LockMode, StoreLock, StoreLockError};

use crate::config::EngineConfig;
use crate::util::hash::{Digest, EMPTY_DIGEST, Fingerprint};
use directory::{join_path, path_components};
use local::{EntryKind, LocalStore};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("{kind} {digest} is not present in the store")]
  Missing { kind: &'static str, digest: Digest },

  #[error("merge collision at {path:?}: {details}")]
  MergeCollision { path: String, details: String },

  #[error("cannot strip prefix {prefix:?} from {digest}: {details}")]
  PrefixNotFound {
    prefix: String,
    digest: Digest,
    details: String,
  },

  #[error("invalid path {path:?}: {reason}")]
  InvalidPath { path: String, reason: String },

  #[error("store entry {digest} is corrupt: {message}")]
  CorruptEntry { digest: Digest, message: String },

  #[error("failed to serialize store entry: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("garbage collection requires a store backed by a directory")]
  NotPersistent,

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

/// A store entry loaded without knowing its kind up front.
#[derive(Debug, Clone)]
pub enum Loaded {
  File(Bytes),
  Directory(Arc<Directory>),
}

/// One entry of a tree being created from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CreateEntry {
  File {
    path: String,
    content: Bytes,
    is_executable: bool,
  },
  /// A file whose content is already in the store.
  FileDigest {
    path: String,
    digest: Digest,
    is_executable: bool,
  },
  Directory {
    path: String,
  },
}

impl CreateEntry {
  pub fn file(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
    CreateEntry::File {
      path: path.into(),
      content: content.into(),
      is_executable: false,
    }
  }

  pub fn executable(path: impl Into<String>, content: impl Into<Bytes>) -> Self {
    CreateEntry::File {
      path: path.into(),
      content: content.into(),
      is_executable: true,
    }
  }

  pub fn directory(path: impl Into<String>) -> Self {
    CreateEntry::Directory { path: path.into() }
  }

  pub fn path(&self) -> &str {
    match self {
      CreateEntry::File { path, .. } | CreateEntry::FileDigest { path, .. } | CreateEntry::Directory { path } => path,
    }
  }
}

#[derive(Debug, Default)]
struct StoreInner {
  files: DashMap<Fingerprint, Bytes>,
  directories: DashMap<Fingerprint, Arc<Directory>>,
  local: Option<LocalStore>,
}

/// Handle to the digest store. Cheap to clone; clones share the same indices.
#[derive(Debug, Clone, Default)]
pub struct Store {
  inner: Arc<StoreInner>,
}

impl Store {
  /// A store that never touches disk.
  pub fn in_memory() -> Self {
    Self::default()
  }

  /// A store persisting entries under `root`.
  pub fn local(root: &Path) -> Result<Self, StoreError> {
    let local = LocalStore::open(root)?;
    debug!(root = %root.display(), "opened local store");
    Ok(Self {
      inner: Arc::new(StoreInner {
        local: Some(local),
        ..StoreInner::default()
      }),
    })
  }

  pub fn from_config(config: &EngineConfig) -> Result<Self, StoreError> {
    if config.in_memory_store {
      Ok(Self::in_memory())
    } else {
      Self::local(&config.store_dir)
    }
  }

  /// Directory backing this store, if any.
  pub fn root(&self) -> Option<&Path> {
    self.inner.local.as_ref().map(LocalStore::root)
  }

  pub(crate) fn local_store(&self) -> Option<&LocalStore> {
    self.inner.local.as_ref()
  }

  pub fn store_file_bytes(&self, bytes: impl Into<Bytes>) -> Result<Digest, StoreError> {
    let bytes = bytes.into();
    let digest = Digest::of_bytes(&bytes);
    match &self.inner.local {
      // Persisted blobs are read back from disk rather than pinned in memory.
      Some(local) => local.write(EntryKind::File, &digest, &bytes)?,
      None => {
        self.inner.files.entry(digest.hash).or_insert(bytes);
      }
    }
    Ok(digest)
  }

  /// Store a single directory node whose children are already present.
  pub fn record_directory(&self, directory: Directory) -> Result<Digest, StoreError> {
    let bytes = directory.to_bytes()?;
    let digest = Digest::of_bytes(&bytes);
    if let Some(local) = &self.inner.local {
      local.write(EntryKind::Directory, &digest, &bytes)?;
    }
    self
      .inner
      .directories
      .entry(digest.hash)
      .or_insert_with(|| Arc::new(directory));
    Ok(digest)
  }

  /// Build a tree from a flat list of entries.
  ///
  /// Intermediate directories are created as needed. Two entries at the same path must
  /// agree exactly, otherwise this fails with [`StoreError::MergeCollision`].
  pub fn store_directory(&self, entries: Vec<CreateEntry>) -> Result<Digest, StoreError> {
    let mut root = PendingDir::default();
    for entry in entries {
      let components: Vec<String> = path_components(entry.path())?.into_iter().map(str::to_string).collect();
      let Some((name, parents)) = components.split_last() else {
        // The root itself: only an explicit directory entry makes sense.
        if matches!(entry, CreateEntry::Directory { .. }) {
          continue;
        }
        return Err(StoreError::InvalidPath {
          path: entry.path().to_string(),
          reason: "a file needs a name".to_string(),
        });
      };

      let mut dir = &mut root;
      let mut walked = String::new();
      for parent in parents {
        walked = join_path(&walked, parent);
        dir = dir.child_dir(parent, &walked)?;
      }
      let full = join_path(&walked, name);

      match entry {
        CreateEntry::Directory { .. } => {
          dir.child_dir(name, &full)?;
        }
        CreateEntry::File {
          content, is_executable, ..
        } => {
          let digest = self.store_file_bytes(content)?;
          dir.add_file(name, &full, digest, is_executable)?;
        }
        CreateEntry::FileDigest {
          digest, is_executable, ..
        } => {
          if !self.contains_file(&digest) {
            return Err(StoreError::Missing { kind: "file", digest });
          }
          dir.add_file(name, &full, digest, is_executable)?;
        }
      }
    }
    self.record_pending(root)
  }

  fn record_pending(&self, pending: PendingDir) -> Result<Digest, StoreError> {
    let mut files = Vec::with_capacity(pending.files.len());
    for (name, (digest, is_executable)) in pending.files {
      files.push(FileNode {
        name,
        digest,
        is_executable,
      });
    }
    let mut directories = Vec::with_capacity(pending.dirs.len());
    for (name, child) in pending.dirs {
      let digest = self.record_pending(child)?;
      directories.push(DirectoryNode { name, digest });
    }
    self.record_directory(Directory::new(files, directories)?)
  }

  pub fn load_file_bytes(&self, digest: &Digest) -> Result<Bytes, StoreError> {
    if *digest == EMPTY_DIGEST {
      return Ok(Bytes::new());
    }
    if let Some(bytes) = self.inner.files.get(&digest.hash) {
      return Ok(bytes.clone());
    }
    if let Some(local) = &self.inner.local
      && let Some(bytes) = local.read(EntryKind::File, digest)?
    {
      return Ok(Bytes::from(bytes));
    }
    Err(StoreError::Missing {
      kind: "file",
      digest: *digest,
    })
  }

  pub fn load_directory(&self, digest: &Digest) -> Result<Arc<Directory>, StoreError> {
    if *digest == *EMPTY_DIRECTORY_DIGEST {
      return Ok(Arc::new(Directory::default()));
    }
    if let Some(directory) = self.inner.directories.get(&digest.hash) {
      return Ok(directory.clone());
    }
    if let Some(local) = &self.inner.local
      && let Some(bytes) = local.read(EntryKind::Directory, digest)?
    {
      let directory = Arc::new(Directory::from_bytes(*digest, &bytes)?);
      self.inner.directories.entry(digest.hash).or_insert_with(|| directory.clone());
      return Ok(directory);
    }
    Err(StoreError::Missing {
      kind: "directory",
      digest: *digest,
    })
  }

  /// Load a digest as whichever kind of entry it is.
  pub fn load(&self, digest: &Digest) -> Result<Loaded, StoreError> {
    match self.load_directory(digest) {
      Ok(directory) => Ok(Loaded::Directory(directory)),
      Err(StoreError::Missing { .. }) => self.load_file_bytes(digest).map(Loaded::File),
      Err(e) => Err(e),
    }
  }

  pub fn contains_file(&self, digest: &Digest) -> bool {
    *digest == EMPTY_DIGEST
      || self.inner.files.contains_key(&digest.hash)
      || self
        .inner
        .local
        .as_ref()
        .is_some_and(|l| l.contains(EntryKind::File, &digest.hash))
  }

  pub fn contains_directory(&self, digest: &Digest) -> bool {
    *digest == *EMPTY_DIRECTORY_DIGEST
      || self.inner.directories.contains_key(&digest.hash)
      || self
        .inner
        .local
        .as_ref()
        .is_some_and(|l| l.contains(EntryKind::Directory, &digest.hash))
  }

  /// Whether a directory and everything it references is present.
  pub fn contains_tree(&self, digest: &Digest) -> bool {
    let Ok(directory) = self.load_directory(digest) else {
      return false;
    };
    directory.files.iter().all(|f| self.contains_file(&f.digest))
      && directory.directories.iter().all(|d| self.contains_tree(&d.digest))
  }

  pub(crate) fn forget(&self, kind: EntryKind, hash: &Fingerprint) {
    match kind {
      EntryKind::File => {
        self.inner.files.remove(hash);
      }
      EntryKind::Directory => {
        self.inner.directories.remove(hash);
      }
    }
  }
}

#[derive(Default)]
struct PendingDir {
  files: BTreeMap<String, (Digest, bool)>,
  dirs: BTreeMap<String, PendingDir>,
}

impl PendingDir {
  fn child_dir(&mut self, name: &str, full: &str) -> Result<&mut PendingDir, StoreError> {
    if self.files.contains_key(name) {
      return Err(StoreError::MergeCollision {
        path: full.to_string(),
        details: "path is both a file and a directory".to_string(),
      });
    }
    Ok(self.dirs.entry(name.to_string()).or_default())
  }

  fn add_file(&mut self, name: &str, full: &str, digest: Digest, is_executable: bool) -> Result<(), StoreError> {
    if self.dirs.contains_key(name) {
      return Err(StoreError::MergeCollision {
        path: full.to_string(),
        details: "path is both a file and a directory".to_string(),
      });
    }
    match self.files.get(name) {
      Some(existing) if *existing != (digest, is_executable) => Err(StoreError::MergeCollision {
        path: full.to_string(),
        details: format!(
          "conflicting entries {} (executable: {}) and {} (executable: {})",
          existing.0, existing.1, digest, is_executable
        ),
      }),
      Some(_) => Ok(()),
      None => {
        self.files.insert(name.to_string(), (digest, is_executable));
        Ok(())
      }
    }
  }
}
