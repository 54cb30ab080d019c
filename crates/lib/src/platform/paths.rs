use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Returns the user's home directory, if one is configured.
#[cfg(windows)]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").map(PathBuf::from)
}

/// Returns the user's home directory, if one is configured.
#[cfg(not(windows))]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").map(PathBuf::from)
}

/// Returns the directory for cache files for the application.
///
/// Falls back to the system temp directory when no home is configured.
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var_os("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(std::env::temp_dir)
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application.
///
/// Falls back to the system temp directory when no home is configured.
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  std::env::var_os("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .or_else(|| home_dir().map(|home| home.join(".cache")))
    .unwrap_or_else(std::env::temp_dir)
    .join(APP_NAME)
}

/// Default location of the persistent content store.
pub fn default_store_dir() -> PathBuf {
  cache_dir().join("store")
}
