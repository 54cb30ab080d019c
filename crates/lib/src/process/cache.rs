//! Fingerprint-keyed process cache wrapping another runner.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{CommandRunner, FallibleProcessResult, Process, ProcessError, ProcessResultSource};
use crate::platform::Platform;
use crate::store::Store;
use crate::store::action_cache::ActionResult;
use crate::util::hash::Fingerprint;

pub struct CachingCommandRunner {
  inner: Arc<dyn CommandRunner>,
  store: Store,
  memory: DashMap<Fingerprint, ActionResult>,
  platform: Platform,
}

impl CachingCommandRunner {
  pub fn new(inner: Arc<dyn CommandRunner>, store: Store, platform: Platform) -> Self {
    Self {
      inner,
      store,
      memory: DashMap::new(),
      platform,
    }
  }

  /// A cached result is only usable while everything it references is still stored.
  fn is_complete(&self, result: &ActionResult) -> bool {
    self.store.contains_file(&result.stdout_digest)
      && self.store.contains_file(&result.stderr_digest)
      && self.store.contains_tree(&result.output_digest)
  }

  fn lookup(&self, key: &Fingerprint, process: &Process) -> Result<Option<FallibleProcessResult>, ProcessError> {
    if let Some(hit) = self.memory.get(key).map(|r| r.clone()) {
      if self.is_complete(&hit) {
        return Ok(Some(FallibleProcessResult::from_action_result(
          &hit,
          ProcessResultSource::HitMemory,
        )));
      }
      self.memory.remove(key);
    }

    if process.cache_scope.persists()
      && let Some(hit) = self.store.load_action_result(key)?
    {
      if self.is_complete(&hit) {
        let result = FallibleProcessResult::from_action_result(&hit, ProcessResultSource::HitDisk);
        self.memory.insert(*key, hit);
        return Ok(Some(result));
      }
      debug!(key = %key, "action cache entry references missing digests");
    }
    Ok(None)
  }
}

#[async_trait]
impl CommandRunner for CachingCommandRunner {
  async fn run(&self, process: &Process) -> Result<FallibleProcessResult, ProcessError> {
    let scope = process.cache_scope;
    if !scope.uses_cache() {
      return self.inner.run(process).await;
    }

    let key = process.cache_key(self.platform)?;
    if let Some(hit) = self.lookup(&key, process)? {
      debug!(description = %process.description, key = %key, source = ?hit.metadata.source, "process cache hit");
      return Ok(hit);
    }
    debug!(description = %process.description, key = %key, "process cache miss");

    let result = self.inner.run(process).await?;
    if scope.caches(result.exit_code) {
      let entry = result.to_action_result();
      if scope.persists()
        && let Err(e) = self.store.record_action_result(&key, &entry)
      {
        warn!(key = %key, error = %e, "failed to persist process result");
      }
      self.memory.insert(key, entry);
    }
    Ok(result)
  }
}
