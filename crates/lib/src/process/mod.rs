//! Hermetic process execution.
//!
//! A [`Process`] is an immutable description of a command run against an input tree.
//! [`CommandRunner`]s turn it into a [`FallibleProcessResult`]: the local runner executes it
//! in a sandbox, and the caching runner wraps any other runner with a fingerprint-keyed
//! cache.

pub mod cache;
pub mod local;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::CachingCommandRunner;
pub use local::LocalCommandRunner;

use crate::consts::PROCESS_CACHE_KEY_VERSION;
use crate::platform::Platform;
use crate::store::action_cache::ActionResult;
use crate::store::{EMPTY_DIRECTORY_DIGEST, StoreError};
use crate::util::hash::{Digest, Fingerprint, HashError, Hashable};

#[derive(Debug, Error)]
pub enum ProcessError {
  #[error("process has an empty argv")]
  EmptyArgv,

  #[error("process requires platform {requested}, but this runner executes on {available}")]
  UnsupportedPlatform { requested: Platform, available: Platform },

  #[error("failed to create sandbox under {path}: {source}")]
  SandboxCreation {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("binary not found: {binary}")]
  BinaryNotFound {
    binary: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to spawn {binary}: {source}")]
  Spawn {
    binary: String,
    #[source]
    source: io::Error,
  },

  #[error("{description} exceeded its timeout of {}", humanize(.timeout))]
  Timeout { description: String, timeout: Duration },

  #[error("{context}: {source}")]
  Io {
    context: String,
    #[source]
    source: io::Error,
  },

  #[error("failed to fingerprint process: {0}")]
  Fingerprint(#[source] HashError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

fn humanize(duration: &Duration) -> String {
  format!("{:.3}s", duration.as_secs_f64())
}

/// How a process result may be reused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessCacheScope {
  /// Cache every result, on disk and in memory.
  Always,
  /// Cache only results with exit code 0, on disk and in memory.
  #[default]
  Successful,
  /// Cache every result in memory only; lost on restart.
  PerRestartAlways,
  /// Cache successful results in memory only; lost on restart.
  PerRestartSuccessful,
  /// Run once per session.
  PerSession,
  /// Never read or write the process cache. Like `PerSession`, identical requests made within
  /// one session still share a single run.
  Never,
}

impl ProcessCacheScope {
  /// Whether the process cache is consulted at all.
  pub fn uses_cache(self) -> bool {
    !matches!(self, ProcessCacheScope::PerSession | ProcessCacheScope::Never)
  }

  pub fn persists(self) -> bool {
    matches!(self, ProcessCacheScope::Always | ProcessCacheScope::Successful)
  }

  /// Whether a result with `exit_code` may be stored.
  pub fn caches(self, exit_code: i32) -> bool {
    match self {
      ProcessCacheScope::Always | ProcessCacheScope::PerRestartAlways => true,
      ProcessCacheScope::Successful | ProcessCacheScope::PerRestartSuccessful => exit_code == 0,
      ProcessCacheScope::PerSession | ProcessCacheScope::Never => false,
    }
  }

  /// Whether the engine keys this process's node per session.
  pub fn is_per_session(self) -> bool {
    !self.uses_cache()
  }
}

/// A command to run against an input tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Process {
  pub argv: Vec<String>,
  pub env: BTreeMap<String, String>,
  /// Relative to the sandbox root. Outputs are captured relative to it too.
  pub working_directory: Option<String>,
  pub input_digest: Digest,
  pub output_files: BTreeSet<String>,
  pub output_directories: BTreeSet<String>,
  pub timeout: Option<Duration>,
  pub description: String,
  pub cache_scope: ProcessCacheScope,
  /// `None` runs on whatever platform the runner executes on.
  pub platform: Option<Platform>,
}

impl Process {
  pub fn new(argv: Vec<String>) -> Self {
    let description = argv.join(" ");
    Self {
      argv,
      env: BTreeMap::new(),
      working_directory: None,
      input_digest: *EMPTY_DIRECTORY_DIGEST,
      output_files: BTreeSet::new(),
      output_directories: BTreeSet::new(),
      timeout: None,
      description,
      cache_scope: ProcessCacheScope::default(),
      platform: None,
    }
  }

  pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = env;
    self
  }

  pub fn input_digest(mut self, digest: Digest) -> Self {
    self.input_digest = digest;
    self
  }

  pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
    self.working_directory = Some(dir.into());
    self
  }

  pub fn output_files<I, S>(mut self, files: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.output_files = files.into_iter().map(Into::into).collect();
    self
  }

  pub fn output_directories<I, S>(mut self, dirs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.output_directories = dirs.into_iter().map(Into::into).collect();
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn cache_scope(mut self, scope: ProcessCacheScope) -> Self {
    self.cache_scope = scope;
    self
  }

  pub fn platform(mut self, platform: Platform) -> Self {
    self.platform = Some(platform);
    self
  }

  /// Cache key of this process when run on `host`.
  ///
  /// Covers everything that can change the result. The description and cache scope
  /// are excluded, so relabelling a process does not invalidate its cached result.
  pub fn cache_key(&self, host: Platform) -> Result<Fingerprint, ProcessError> {
    ProcessCacheKey {
      version: PROCESS_CACHE_KEY_VERSION,
      argv: &self.argv,
      env: &self.env,
      working_directory: self.working_directory.as_deref(),
      input_digest: &self.input_digest,
      output_files: &self.output_files,
      output_directories: &self.output_directories,
      timeout_ms: self.timeout.map(|t| t.as_millis()),
      platform: self.platform.unwrap_or(host),
    }
    .fingerprint()
    .map_err(ProcessError::Fingerprint)
  }
}

#[derive(Serialize)]
struct ProcessCacheKey<'a> {
  version: u32,
  argv: &'a [String],
  env: &'a BTreeMap<String, String>,
  working_directory: Option<&'a str>,
  input_digest: &'a Digest,
  output_files: &'a BTreeSet<String>,
  output_directories: &'a BTreeSet<String>,
  timeout_ms: Option<u128>,
  platform: Platform,
}

impl Hashable for ProcessCacheKey<'_> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResultSource {
  Ran,
  HitMemory,
  HitDisk,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessResultMetadata {
  pub elapsed: Duration,
  pub source: ProcessResultSource,
  pub platform: Platform,
}

/// The outcome of a process that ran to completion. A non-zero exit code is data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FallibleProcessResult {
  pub exit_code: i32,
  pub stdout_digest: Digest,
  pub stderr_digest: Digest,
  pub output_digest: Digest,
  pub metadata: ProcessResultMetadata,
}

impl FallibleProcessResult {
  pub(crate) fn to_action_result(&self) -> ActionResult {
    ActionResult {
      exit_code: self.exit_code,
      stdout_digest: self.stdout_digest,
      stderr_digest: self.stderr_digest,
      output_digest: self.output_digest,
      platform: self.metadata.platform,
      elapsed_ms: u64::try_from(self.metadata.elapsed.as_millis()).unwrap_or(u64::MAX),
    }
  }

  pub(crate) fn from_action_result(result: &ActionResult, source: ProcessResultSource) -> Self {
    Self {
      exit_code: result.exit_code,
      stdout_digest: result.stdout_digest,
      stderr_digest: result.stderr_digest,
      output_digest: result.output_digest,
      metadata: ProcessResultMetadata {
        elapsed: Duration::from_millis(result.elapsed_ms),
        source,
        platform: result.platform,
      },
    }
  }
}

/// A successful process result with its output streams loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessResult {
  pub stdout: Bytes,
  pub stderr: Bytes,
  pub output_digest: Digest,
  pub metadata: ProcessResultMetadata,
}

/// A process exited non-zero where success was required.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("process '{description}' failed with exit code {exit_code}.\nstdout:\n{stdout}\nstderr:\n{stderr}")]
pub struct ProcessExecutionFailure {
  pub exit_code: i32,
  pub stdout: String,
  pub stderr: String,
  pub description: String,
}

/// Something that can execute a [`Process`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
  async fn run(&self, process: &Process) -> Result<FallibleProcessResult, ProcessError>;
}
