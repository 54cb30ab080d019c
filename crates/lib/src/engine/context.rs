//! The handle a rule body uses to reach the rest of the graph.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{FuturesUnordered, StreamExt};

use super::graph::{Graph, NodeId, NodeKey};
use super::{EngineContext, EngineError, Failure, Params, Value};
use crate::config::FanOutPolicy;
use crate::fs::{PathGlobs, SnapshotError};
use crate::rules::{DependencyKey, EntryId, Source, TypeId};
use crate::store::Store;

/// Passed to every rule body. Cloning is cheap.
#[derive(Clone)]
pub struct RuleContext {
  graph: Arc<Graph>,
  node: NodeId,
  entry: EntryId,
  params: Params,
  session: u64,
  session_bound: Arc<AtomicBool>,
}

impl RuleContext {
  pub(crate) fn new(
    graph: Arc<Graph>,
    node: NodeId,
    entry: EntryId,
    params: Params,
    session: u64,
    session_bound: Arc<AtomicBool>,
  ) -> Self {
    Self {
      graph,
      node,
      entry,
      params,
      session,
      session_bound,
    }
  }

  pub fn context(&self) -> &EngineContext {
    &self.graph.context
  }

  pub fn store(&self) -> &Store {
    &self.graph.context.store
  }

  /// The params this node is keyed by.
  pub fn params(&self) -> &Params {
    &self.params
  }

  pub fn session_id(&self) -> u64 {
    self.session
  }

  /// Requests `P` computed for `subject` in addition to the params in scope.
  pub async fn get<P, S>(&self, subject: S) -> Result<Arc<P>, Failure>
  where
    P: Any + Send + Sync,
    S: Any + Send + Sync + fmt::Debug + Eq + Hash,
  {
    let value = self.get_value(TypeId::of::<P>(), Value::new(subject)).await?;
    arg_value(value)
  }

  pub async fn get_value(&self, product: TypeId, subject: Value) -> Result<Value, Failure> {
    let key = DependencyKey::new(product, [subject.type_id()]);
    self.request(key, Some(subject)).await
  }

  /// Requests `P` for each subject concurrently. Results keep the order of `subjects`.
  pub async fn get_many<P, S>(&self, subjects: impl IntoIterator<Item = S>) -> Result<Vec<Arc<P>>, Failure>
  where
    P: Any + Send + Sync,
    S: Any + Send + Sync + fmt::Debug + Eq + Hash,
  {
    let requests = subjects.into_iter().map(|subject| {
      let ctx = self.clone();
      async move { ctx.get::<P, S>(subject).await }
    });
    fan_out(self.graph.context.config.fan_out, requests).await
  }

  /// Requests `P` from the params already in scope.
  pub async fn get_in_scope<P: Any + Send + Sync>(&self) -> Result<Arc<P>, Failure> {
    let value = self.request(DependencyKey::in_scope(TypeId::of::<P>()), None).await?;
    arg_value(value)
  }

  pub(crate) async fn request(&self, key: DependencyKey, subject: Option<Value>) -> Result<Value, Failure> {
    let rules = &self.graph.rules;
    let source = rules
      .dependency(self.entry, &key)
      .ok_or_else(|| EngineError::UndeclaredDependency {
        rule: rules.rule(self.entry).name.clone(),
        request: key.to_string(),
      })?;
    let params = match subject {
      Some(subject) => self.params.with(subject),
      None => self.params.clone(),
    };

    match source {
      Source::Param(type_id) => params.find(type_id).cloned().ok_or_else(|| {
        Failure::from(EngineError::MissingParam {
          param: type_id.name(),
        })
      }),
      Source::Entry(entry) => {
        let params = params.restrict(&rules.entry(entry).params);
        let session = (!rules.rule(entry).is_cacheable(&params)).then_some(self.session);
        let key = NodeKey { entry, params, session };
        let output = self.graph.get(Some(self.node), key, self.session).await;
        if output.session_bound.is_some() {
          self.session_bound.store(true, Ordering::Release);
        }
        output.result
      }
    }
  }

  /// Ties this node's result to the current session, so later sessions compute it again.
  /// Dependents inherit the binding.
  pub fn mark_uncacheable(&self) {
    self.session_bound.store(true, Ordering::Release);
  }

  /// The node's result depends on the content of `path`, relative to the build root.
  pub fn record_dependency(&self, path: &str) {
    self.graph.invalidation.lock().record_file(self.node, path);
  }

  /// The node's result depends on the listing of directory `dir`. The build root is `""`.
  pub fn record_dir_listing(&self, dir: &str) {
    self.graph.invalidation.lock().record_dir(self.node, dir);
  }

  /// The node's result depends on every path `globs` may match, including ones not created yet.
  pub fn record_glob_dependency(&self, globs: &PathGlobs) -> Result<(), SnapshotError> {
    let matcher = globs.matcher()?;
    self.graph.invalidation.lock().record_globs(self.node, globs, matcher);
    Ok(())
  }
}

/// Downcasts positional input `index` of a rule body.
pub fn arg<T: Any + Send + Sync>(args: &[Value], index: usize) -> Result<Arc<T>, Failure> {
  let value = args.get(index).cloned().ok_or_else(|| EngineError::TypeMismatch {
    expected: TypeId::of::<T>().name(),
    actual: format!("missing argument {index}"),
  })?;
  arg_value(value)
}

pub(crate) fn arg_value<T: Any + Send + Sync>(value: Value) -> Result<Arc<T>, Failure> {
  value.downcast::<T>().ok_or_else(|| {
    Failure::from(EngineError::TypeMismatch {
      expected: TypeId::of::<T>().name(),
      actual: value.type_id().name(),
    })
  })
}

/// Drives `requests` concurrently and fails with the first failure observed.
///
/// Under [`FanOutPolicy::DrainSiblings`] the requests still in flight after a failure keep
/// running in the background so that their nodes complete and are memoized.
pub(crate) async fn fan_out<T, F>(policy: FanOutPolicy, requests: impl IntoIterator<Item = F>) -> Result<Vec<T>, Failure>
where
  T: Send + 'static,
  F: Future<Output = Result<T, Failure>> + Send + 'static,
{
  let mut pending: FuturesUnordered<_> = requests
    .into_iter()
    .enumerate()
    .map(|(idx, request)| async move { (idx, request.await) })
    .collect();
  let mut results: Vec<Option<T>> = (0..pending.len()).map(|_| None).collect();

  while let Some((idx, result)) = pending.next().await {
    match result {
      Ok(value) => results[idx] = Some(value),
      Err(failure) => {
        if policy == FanOutPolicy::DrainSiblings && !pending.is_empty() {
          tokio::spawn(async move { while pending.next().await.is_some() {} });
        }
        return Err(failure);
      }
    }
  }
  Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
  use super::*;
  use futures::FutureExt;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  #[tokio::test]
  async fn fan_out_keeps_request_order() {
    let requests = [30_u64, 10, 20].map(|ms| async move {
      tokio::time::sleep(Duration::from_millis(ms)).await;
      Ok::<_, Failure>(ms)
    });
    let results = fan_out(FanOutPolicy::FailFast, requests).await.unwrap();
    assert_eq!(results, vec![30, 10, 20]);
  }

  #[tokio::test]
  async fn drain_siblings_lets_slow_requests_finish() {
    let finished = Arc::new(AtomicUsize::new(0));
    let slow = {
      let finished = Arc::clone(&finished);
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        finished.fetch_add(1, Ordering::SeqCst);
        Ok::<u8, Failure>(1)
      }
      .boxed()
    };
    let failing = async { Err::<u8, Failure>(Failure::msg("boom")) }.boxed();

    let err = fan_out(FanOutPolicy::DrainSiblings, vec![slow, failing])
      .await
      .unwrap_err();
    assert_eq!(err.to_string(), "boom");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn fail_fast_drops_siblings() {
    let finished = Arc::new(AtomicUsize::new(0));
    let slow = {
      let finished = Arc::clone(&finished);
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        finished.fetch_add(1, Ordering::SeqCst);
        Ok::<u8, Failure>(1)
      }
      .boxed()
    };
    let failing = async { Err::<u8, Failure>(Failure::msg("boom")) }.boxed();

    fan_out(FanOutPolicy::FailFast, vec![slow, failing]).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 0);
  }
}
