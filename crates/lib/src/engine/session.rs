//! Schedulers and the sessions requests are made through.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use super::context::{arg_value, fan_out};
use super::graph::{Graph, NodeKey};
use super::invalidation::InvalidationResult;
use super::{EngineContext, EngineError, Failure, Params, Value};
use crate::rules::{RuleGraph, Source, TypeId, type_list};

/// Owns the node table. Memoized results outlive sessions until invalidated.
pub struct Scheduler {
  graph: Arc<Graph>,
  sessions: AtomicU64,
}

impl Scheduler {
  pub fn new(rules: RuleGraph, context: EngineContext) -> Self {
    Self {
      graph: Arc::new(Graph::new(Arc::new(rules), Arc::new(context))),
      sessions: AtomicU64::new(0),
    }
  }

  /// Starts a new session. Uncacheable rules run again in every session.
  pub fn session(&self) -> Session {
    let id = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(session = id, "opened session");
    Session {
      graph: Arc::clone(&self.graph),
      id,
    }
  }

  pub fn rule_graph(&self) -> &RuleGraph {
    &self.graph.rules
  }

  pub fn context(&self) -> &EngineContext {
    &self.graph.context
  }

  /// Number of nodes ever created, including ones currently not started.
  pub fn node_count(&self) -> usize {
    self.graph.len()
  }

  /// Resets every node that consulted one of `changed` (paths relative to the build root), and
  /// everything depending on those nodes.
  pub fn invalidate<S: AsRef<str>>(&self, changed: &[S]) -> InvalidationResult {
    let paths: Vec<&str> = changed.iter().map(AsRef::as_ref).collect();
    let result = self.graph.invalidate_paths(&paths);
    info!(
      paths = paths.len(),
      cleared = result.cleared,
      restarted = result.restarted,
      "invalidated"
    );
    result
  }

  pub fn invalidate_all(&self) -> InvalidationResult {
    let result = self.graph.invalidate_all();
    info!(cleared = result.cleared, restarted = result.restarted, "invalidated all nodes");
    result
  }
}

/// A window of requests sharing one run id.
#[derive(Clone)]
pub struct Session {
  graph: Arc<Graph>,
  id: u64,
}

impl Session {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Computes `P` from `params`, which must match a declared query.
  pub async fn request<P: Any + Send + Sync>(&self, params: Vec<Value>) -> Result<Arc<P>, Failure> {
    let value = self.request_value(TypeId::of::<P>(), Params::new(params)).await?;
    arg_value(value)
  }

  pub async fn request_value(&self, product: TypeId, params: Params) -> Result<Value, Failure> {
    let rules = &self.graph.rules;
    let source = rules
      .query(product, &params.type_ids())
      .ok_or_else(|| EngineError::MissingQuery {
        product: product.name(),
        params: type_list(params.type_ids()),
      })?;

    match source {
      Source::Param(type_id) => params.find(type_id).cloned().ok_or_else(|| {
        Failure::from(EngineError::MissingParam {
          param: type_id.name(),
        })
      }),
      Source::Entry(entry) => {
        let params = params.restrict(&rules.entry(entry).params);
        let session = (!rules.rule(entry).is_cacheable(&params)).then_some(self.id);
        let key = NodeKey { entry, params, session };
        self.graph.get(None, key, self.id).await.result
      }
    }
  }

  /// Issues one request per param set concurrently. Results keep the order of `requests`.
  pub async fn request_many<P: Any + Send + Sync>(&self, requests: Vec<Vec<Value>>) -> Result<Vec<Arc<P>>, Failure> {
    let futures = requests.into_iter().map(|params| {
      let session = self.clone();
      async move { session.request::<P>(params).await }
    });
    fan_out(self.graph.context.config.fan_out, futures).await
  }
}
