//! Engine configuration.
//!
//! `EngineConfig::default()` gives the built-in defaults; `EngineConfig::from_env()`
//! layers `CAIRN_*` environment overrides on top of them.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{
  EXECUTION_ROOT_ENV, IN_MEMORY_STORE_ENV, KEEP_SANDBOXES_ENV, PROCESS_PARALLELISM_ENV, RULE_THREADS_ENV,
  STORE_DIR_ENV,
};
use crate::platform::paths::default_store_dir;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("invalid value {value:?} for {key}: {reason}")]
  InvalidValue {
    key: &'static str,
    value: String,
    reason: String,
  },
}

/// Whether sandbox directories survive after their process exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepSandboxes {
  #[default]
  Never,
  Always,
  OnFailure,
}

impl FromStr for KeepSandboxes {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "never" => Ok(Self::Never),
      "always" => Ok(Self::Always),
      "on_failure" | "on-failure" => Ok(Self::OnFailure),
      other => Err(format!("expected never, always or on_failure, got {other:?}")),
    }
  }
}

/// What happens to in-flight siblings when one request of a fan-out fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
  /// Siblings keep running in the background so their results are memoized.
  #[default]
  DrainSiblings,
  /// Siblings are dropped, cancelling nodes nobody else is waiting on.
  FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
  /// Persistent content store. Ignored when `in_memory_store` is set.
  pub store_dir: PathBuf,
  /// Parent directory for process sandboxes.
  pub execution_root: PathBuf,
  pub process_parallelism: usize,
  /// Worker threads for rule execution. `None` uses the runtime default.
  pub rule_threads: Option<usize>,
  pub keep_sandboxes: KeepSandboxes,
  pub fan_out: FanOutPolicy,
  /// Glob patterns excluded whenever the filesystem is read.
  pub ignore_patterns: Vec<String>,
  pub in_memory_store: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      store_dir: default_store_dir(),
      execution_root: std::env::temp_dir(),
      process_parallelism: default_parallelism(),
      rule_threads: None,
      keep_sandboxes: KeepSandboxes::Never,
      fan_out: FanOutPolicy::DrainSiblings,
      ignore_patterns: vec![".git".to_string()],
      in_memory_store: false,
    }
  }
}

impl EngineConfig {
  /// Defaults with `CAIRN_*` environment overrides applied.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(dir) = std::env::var_os(STORE_DIR_ENV) {
      config.store_dir = PathBuf::from(dir);
    }
    if let Some(dir) = std::env::var_os(EXECUTION_ROOT_ENV) {
      config.execution_root = PathBuf::from(dir);
    }
    if let Some(value) = env_string(PROCESS_PARALLELISM_ENV) {
      config.process_parallelism = parse_positive(PROCESS_PARALLELISM_ENV, &value)?;
    }
    if let Some(value) = env_string(RULE_THREADS_ENV) {
      config.rule_threads = Some(parse_positive(RULE_THREADS_ENV, &value)?);
    }
    if let Some(value) = env_string(KEEP_SANDBOXES_ENV) {
      config.keep_sandboxes = value.parse().map_err(|reason| ConfigError::InvalidValue {
        key: KEEP_SANDBOXES_ENV,
        value: value.clone(),
        reason,
      })?;
    }
    if let Some(value) = env_string(IN_MEMORY_STORE_ENV) {
      config.in_memory_store = parse_bool(IN_MEMORY_STORE_ENV, &value)?;
    }

    Ok(config)
  }

  /// A fully in-memory configuration, used by tests and throwaway sessions.
  pub fn in_memory() -> Self {
    Self {
      in_memory_store: true,
      ..Self::default()
    }
  }
}

fn default_parallelism() -> usize {
  std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn env_string(key: &str) -> Option<String> {
  std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
  match value.trim().parse::<usize>() {
    Ok(n) if n > 0 => Ok(n),
    Ok(_) => Err(ConfigError::InvalidValue {
      key,
      value: value.to_string(),
      reason: "must be greater than zero".to_string(),
    }),
    Err(e) => Err(ConfigError::InvalidValue {
      key,
      value: value.to_string(),
      reason: e.to_string(),
    }),
  }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" => Ok(true),
    "0" | "false" | "no" => Ok(false),
    _ => Err(ConfigError::InvalidValue {
      key,
      value: value.to_string(),
      reason: "expected a boolean".to_string(),
    }),
  }
}
