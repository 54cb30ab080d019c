//! Runtime execution of compiled rules.
//!
//! A [`Scheduler`] owns the node table for one [`RuleGraph`](crate::rules::RuleGraph) and an
//! [`EngineContext`]. Callers open a [`Session`] and request products; each distinct
//! (rule entry, params) pair runs at most once and stays memoized until invalidated.

mod context;
mod failure;
mod graph;
mod intrinsics;
mod invalidation;
mod session;
mod value;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::config::EngineConfig;
use crate::fs::{PathGlobMatcher, SnapshotError};
use crate::platform::Platform;
use crate::process::CommandRunner;
use crate::process::cache::CachingCommandRunner;
use crate::process::local::LocalCommandRunner;
use crate::store::{Store, StoreError};

pub use context::{RuleContext, arg};
pub use failure::{Failure, RuleError};
pub use intrinsics::{AddPrefix, CreateDigest, DigestSubset, MergeDigests, RemovePrefix, intrinsics};
pub use invalidation::InvalidationResult;
pub use session::{Scheduler, Session};
pub use value::{DynValue, Params, Value};

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("unsupported host platform: {os}-{arch}", os = std::env::consts::OS, arch = std::env::consts::ARCH)]
  UnsupportedPlatform,

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Snapshot(#[from] SnapshotError),

  #[error("no query was declared for {product} with params {params}")]
  MissingQuery { product: String, params: String },

  #[error("rule {rule} did not declare a request for {request}")]
  UndeclaredDependency { rule: String, request: String },

  #[error("expected a value of type {expected}, got {actual}")]
  TypeMismatch { expected: String, actual: String },

  #[error("param {param} is not in scope")]
  MissingParam { param: String },

  #[error("rule {rule} has no body")]
  MissingBody { rule: String },

  #[error("background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// Everything rules share: configuration, storage, process execution and where the sources live.
pub struct EngineContext {
  pub config: EngineConfig,
  pub store: Store,
  pub command_runner: Arc<dyn CommandRunner>,
  /// Directory that path globs are expanded against.
  pub build_root: PathBuf,
  pub platform: Platform,
  /// Compiled `config.ignore_patterns`.
  pub ignore: PathGlobMatcher,
}

impl EngineContext {
  /// Opens the configured store and sets up cached local process execution.
  pub fn new(config: EngineConfig, build_root: impl Into<PathBuf>) -> Result<Self, EngineError> {
    let platform = Platform::current().ok_or(EngineError::UnsupportedPlatform)?;
    let store = Store::from_config(&config)?;
    let local = Arc::new(LocalCommandRunner::from_config(store.clone(), &config, platform));
    let command_runner: Arc<dyn CommandRunner> = Arc::new(CachingCommandRunner::new(local, store.clone(), platform));
    let ignore = PathGlobMatcher::ignore(&config.ignore_patterns)?;
    let build_root = build_root.into();
    debug!(
      build_root = %build_root.display(),
      store = ?store.root(),
      platform = %platform,
      "engine context ready"
    );
    Ok(Self {
      config,
      store,
      command_runner,
      build_root,
      platform,
      ignore,
    })
  }

  pub fn with_command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
    self.command_runner = runner;
    self
  }
}

/// Builds the multi-threaded runtime rules execute on, honouring `rule_threads`.
pub fn runtime(config: &EngineConfig) -> std::io::Result<tokio::runtime::Runtime> {
  let mut builder = tokio::runtime::Builder::new_multi_thread();
  if let Some(threads) = config.rule_threads {
    builder.worker_threads(threads);
  }
  builder.enable_all().build()
}
