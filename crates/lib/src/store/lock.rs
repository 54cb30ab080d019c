//! Advisory lock on `<store>/.lock` coordinating store handles with garbage collection.
//!
//! Every [`Store`](super::Store) opened on a directory holds the lock shared for as long as it
//! lives. Adding entries needs nothing more, since entries are immutable and written atomically.
//! Garbage collection deletes entries, so it upgrades its own handle to exclusive, which fails
//! while any other handle on the same store is open.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

const LOCK_FILENAME: &str = ".lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  Shared,
  Exclusive,
}

/// Written to the lock file while it is held exclusively, so contenders can say who holds it.
#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
  pid: u32,
  operation: String,
  started_at_unix: u64,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error(
    "store {} is busy: {operation} has been running in PID {pid} since unix time {started_at_unix}",
    .store.display()
  )]
  Busy {
    store: PathBuf,
    operation: String,
    pid: u32,
    started_at_unix: u64,
  },

  #[error("store {} is in use by another cairn process", .store.display())]
  InUse { store: PathBuf },

  #[error("failed to open lock file {}: {source}", .path.display())]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to lock {}: {source}", .path.display())]
  Lock {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to record the lock holder in {}: {source}", .path.display())]
  Holder {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// A held lock on one store directory. Released when dropped.
#[derive(Debug)]
pub struct StoreLock {
  file: File,
  path: PathBuf,
  store: PathBuf,
  mode: LockMode,
}

impl StoreLock {
  /// Takes the lock on `store` without blocking.
  pub fn acquire(store: &Path, mode: LockMode, operation: &str) -> Result<Self, StoreLockError> {
    let path = store.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&path)
      .map_err(|source| StoreLockError::Open {
        path: path.clone(),
        source,
      })?;
    let lock = Self {
      file,
      path,
      store: store.to_path_buf(),
      mode,
    };
    lock.lock(mode)?;
    if mode == LockMode::Exclusive {
      lock.write_holder(operation)?;
    }
    Ok(lock)
  }

  pub fn mode(&self) -> LockMode {
    self.mode
  }

  /// Converts a shared lock to exclusive without blocking.
  ///
  /// Fails with [`StoreLockError::Busy`] or [`StoreLockError::InUse`] while any other handle
  /// holds the lock; the shared lock is kept in that case.
  pub fn upgrade(&mut self, operation: &str) -> Result<(), StoreLockError> {
    if self.mode == LockMode::Exclusive {
      return Ok(());
    }
    if let Err(e) = self.lock(LockMode::Exclusive) {
      // A failed conversion may have dropped the shared lock.
      if let Err(relock) = self.lock(LockMode::Shared) {
        warn!(store = %self.store.display(), error = %relock, "could not retake shared store lock");
      }
      return Err(e);
    }
    self.mode = LockMode::Exclusive;
    self.write_holder(operation)?;
    debug!(store = %self.store.display(), operation, "store locked exclusively");
    Ok(())
  }

  /// Returns an exclusive lock to shared, clearing the recorded holder first.
  pub fn downgrade(&mut self) -> Result<(), StoreLockError> {
    if self.mode == LockMode::Shared {
      return Ok(());
    }
    self.file.set_len(0).map_err(|source| StoreLockError::Holder {
      path: self.path.clone(),
      source,
    })?;
    self.lock(LockMode::Shared)?;
    self.mode = LockMode::Shared;
    Ok(())
  }

  fn lock(&self, mode: LockMode) -> Result<(), StoreLockError> {
    match try_lock(&self.file, mode) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(self.contention()),
      Err(source) => Err(StoreLockError::Lock {
        path: self.path.clone(),
        source,
      }),
    }
  }

  fn write_holder(&self, operation: &str) -> Result<(), StoreLockError> {
    let holder = LockHolder {
      pid: std::process::id(),
      operation: operation.to_string(),
      started_at_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default(),
    };
    let to_holder_error = |source| StoreLockError::Holder {
      path: self.path.clone(),
      source,
    };
    let json = serde_json::to_vec(&holder).map_err(|e| to_holder_error(io::Error::other(e)))?;
    let mut file = &self.file;
    file.set_len(0).map_err(to_holder_error)?;
    file.seek(SeekFrom::Start(0)).map_err(to_holder_error)?;
    file.write_all(&json).map_err(to_holder_error)?;
    file.flush().map_err(to_holder_error)
  }

  /// Reads the holder through this handle. A second handle cannot read it on Windows.
  fn contention(&self) -> StoreLockError {
    let mut contents = String::new();
    let mut file = &self.file;
    let holder = file
      .seek(SeekFrom::Start(0))
      .and_then(|_| file.read_to_string(&mut contents))
      .ok()
      .and_then(|_| serde_json::from_str::<LockHolder>(&contents).ok());
    match holder {
      Some(holder) => StoreLockError::Busy {
        store: self.store.clone(),
        operation: holder.operation,
        pid: holder.pid,
        started_at_unix: holder.started_at_unix,
      },
      None => StoreLockError::InUse {
        store: self.store.clone(),
      },
    }
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  // flock converts an existing lock held through the same handle.
  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };
  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{
    LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx, UnlockFileEx,
  };

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: OVERLAPPED is valid zero-initialized and the handle is open for the call.
  // LockFileEx does not convert locks, so any lock this handle holds is released first.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    UnlockFileEx(handle, 0, 1, 0, &mut overlapped);
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };
  if result == 0 {
    let err = io::Error::last_os_error();
    // ERROR_LOCK_VIOLATION
    if err.raw_os_error() == Some(33) {
      return Err(io::Error::new(io::ErrorKind::WouldBlock, err));
    }
    return Err(err);
  }
  Ok(())
}
