//! Node failures and their tracebacks.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::fs::SnapshotError;
use crate::process::{ProcessError, ProcessExecutionFailure};
use crate::store::StoreError;

use super::EngineError;

/// Why a node did not produce a value.
///
/// `Throw` and `Cycle` are memoized like values. `Invalidated` and `Cancelled` describe the
/// scheduler interrupting a run and never become a node's final state.
#[derive(Debug, Clone, Error)]
pub enum Failure {
  #[error("{error}")]
  Throw {
    error: Arc<dyn StdError + Send + Sync>,
    /// Descriptions of the rules the failure propagated through, innermost first.
    traceback: Vec<String>,
  },

  #[error("dependency cycle: {}", .path.join(" -> "))]
  Cycle { path: Vec<String> },

  #[error("node was invalidated while running")]
  Invalidated,

  #[error("node was cancelled")]
  Cancelled,
}

/// An error raised by a rule body that has no richer type.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct RuleError(pub String);

impl Failure {
  pub fn throw<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    Failure::Throw {
      error: Arc::new(error),
      traceback: Vec::new(),
    }
  }

  pub fn msg(message: impl Into<String>) -> Self {
    Self::throw(RuleError(message.into()))
  }

  /// The typed error behind a `Throw`, if it is an `E`.
  pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
    match self {
      Failure::Throw { error, .. } => error.downcast_ref::<E>(),
      _ => None,
    }
  }

  pub(crate) fn with_frame(self, description: &str) -> Self {
    match self {
      Failure::Throw { error, mut traceback } => {
        traceback.push(description.to_string());
        Failure::Throw { error, traceback }
      }
      other => other,
    }
  }

  pub fn traceback(&self) -> &[String] {
    match self {
      Failure::Throw { traceback, .. } => traceback,
      _ => &[],
    }
  }

  /// Multi-line rendering: the error followed by the rule chain it travelled through.
  pub fn render(&self) -> String {
    let mut out = self.to_string();
    if let Failure::Throw { error, .. } = self {
      let mut source = error.source();
      while let Some(cause) = source {
        let _ = write!(out, "\n  caused by: {cause}");
        source = cause.source();
      }
    }
    let traceback = self.traceback();
    if !traceback.is_empty() {
      out.push_str("\n\nTraceback (innermost first):");
      for frame in traceback {
        let _ = write!(out, "\n  in {frame}");
      }
    }
    out
  }

  pub(crate) fn is_interrupt(&self) -> bool {
    matches!(self, Failure::Invalidated | Failure::Cancelled)
  }
}

impl From<StoreError> for Failure {
  fn from(e: StoreError) -> Self {
    Failure::throw(e)
  }
}

impl From<SnapshotError> for Failure {
  fn from(e: SnapshotError) -> Self {
    Failure::throw(e)
  }
}

impl From<ProcessError> for Failure {
  fn from(e: ProcessError) -> Self {
    Failure::throw(e)
  }
}

impl From<ProcessExecutionFailure> for Failure {
  fn from(e: ProcessExecutionFailure) -> Self {
    Failure::throw(e)
  }
}

impl From<EngineError> for Failure {
  fn from(e: EngineError) -> Self {
    Failure::throw(e)
  }
}
