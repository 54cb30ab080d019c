//! The runtime node table.
//!
//! Nodes live in an append-only arena and are found through a concurrent index keyed by
//! their identity. Each node guards its own state; dependency edges sit in a separate graph
//! behind a short lock used for cycle checks and invalidation walks.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use petgraph::Direction;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::context::RuleContext;
use super::invalidation::{InvalidationIndex, InvalidationResult};
use super::{EngineContext, EngineError, Failure, Params, Value};
use crate::rules::{DependencyKey, EntryId, RuleGraph};

pub(crate) type NodeId = usize;

/// Full identity of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct NodeKey {
  pub entry: EntryId,
  /// Restricted to the params the entry consumes.
  pub params: Params,
  /// Set for uncacheable rules, so each session computes its own value.
  pub session: Option<u64>,
}

/// What a finished run produced, and whether it is tied to the session that produced it.
#[derive(Debug, Clone)]
pub(crate) struct NodeOutput {
  pub result: Result<Value, Failure>,
  pub session_bound: Option<u64>,
}

impl NodeOutput {
  fn unbound(result: Result<Value, Failure>) -> Self {
    Self {
      result,
      session_bound: None,
    }
  }
}

enum NodeState {
  NotStarted,
  Running {
    run: u64,
    done: watch::Sender<Option<NodeOutput>>,
    abort: AbortHandle,
  },
  Completed(NodeOutput),
}

struct NodeInner {
  state: NodeState,
  waiters: usize,
}

pub(crate) struct Node {
  key: NodeKey,
  description: String,
  inner: Mutex<NodeInner>,
}

pub(crate) struct Graph {
  pub(crate) rules: Arc<RuleGraph>,
  pub(crate) context: Arc<EngineContext>,
  index: DashMap<NodeKey, NodeId>,
  nodes: RwLock<Vec<Arc<Node>>>,
  edges: Mutex<DiGraphMap<NodeId, ()>>,
  pub(crate) invalidation: Mutex<InvalidationIndex>,
  runs: AtomicU64,
}

/// Counts one interested requester; the last one to leave cancels a running node.
struct WaiterGuard {
  node: Arc<Node>,
}

impl WaiterGuard {
  fn new(node: Arc<Node>) -> Self {
    node.inner.lock().waiters += 1;
    Self { node }
  }
}

impl Drop for WaiterGuard {
  fn drop(&mut self) {
    let mut inner = self.node.inner.lock();
    inner.waiters -= 1;
    if inner.waiters == 0 && matches!(inner.state, NodeState::Running { .. }) {
      if let NodeState::Running { abort, .. } = std::mem::replace(&mut inner.state, NodeState::NotStarted) {
        abort.abort();
      }
      debug!(node = %self.node.description, "cancelled node with no remaining requesters");
    }
  }
}

impl Graph {
  pub(crate) fn new(rules: Arc<RuleGraph>, context: Arc<EngineContext>) -> Self {
    Self {
      rules,
      context,
      index: DashMap::new(),
      nodes: RwLock::new(Vec::new()),
      edges: Mutex::new(DiGraphMap::new()),
      invalidation: Mutex::new(InvalidationIndex::default()),
      runs: AtomicU64::new(0),
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.nodes.read().len()
  }

  fn node(&self, id: NodeId) -> Arc<Node> {
    Arc::clone(&self.nodes.read()[id])
  }

  fn describe(&self, id: NodeId) -> String {
    self.nodes.read()[id].description.clone()
  }

  fn ensure_node(&self, key: NodeKey) -> (NodeId, Arc<Node>) {
    if let Some(id) = self.index.get(&key).map(|id| *id) {
      return (id, self.node(id));
    }
    match self.index.entry(key.clone()) {
      Entry::Occupied(existing) => {
        let id = *existing.get();
        (id, self.node(id))
      }
      Entry::Vacant(slot) => {
        let description = format!("{} for {}", self.rules.rule(key.entry).name, key.params);
        let node = Arc::new(Node {
          key,
          description,
          inner: Mutex::new(NodeInner {
            state: NodeState::NotStarted,
            waiters: 0,
          }),
        });
        let mut nodes = self.nodes.write();
        let id = nodes.len();
        nodes.push(Arc::clone(&node));
        slot.insert(id);
        (id, node)
      }
    }
  }

  /// Requests the node for `key` on behalf of `caller`, starting it if needed.
  pub(crate) async fn get(self: &Arc<Self>, caller: Option<NodeId>, key: NodeKey, session: u64) -> NodeOutput {
    let (id, node) = self.ensure_node(key);
    if let Some(caller) = caller
      && let Err(cycle) = self.add_edge(caller, id)
    {
      return NodeOutput::unbound(Err(cycle));
    }

    let _waiter = WaiterGuard::new(Arc::clone(&node));
    loop {
      let mut done = {
        let mut inner = node.inner.lock();
        if let NodeState::Completed(output) = &inner.state {
          if output.session_bound.is_none_or(|bound| bound == session) {
            return output.clone();
          }
          trace!(node = %node.description, "result belongs to another session");
          inner.state = NodeState::NotStarted;
        }
        match &inner.state {
          NodeState::Running { done, .. } => done.subscribe(),
          _ => self.start(id, &node, &mut inner, session),
        }
      };

      let output = match done.wait_for(Option::is_some).await {
        Ok(output) => output.clone(),
        // The run was aborted by invalidation; ask again.
        Err(_) => continue,
      };
      match output {
        Some(output) if !matches!(&output.result, Err(f) if f.is_interrupt()) => return output,
        _ => continue,
      }
    }
  }

  fn start(
    self: &Arc<Self>,
    id: NodeId,
    node: &Arc<Node>,
    inner: &mut NodeInner,
    session: u64,
  ) -> watch::Receiver<Option<NodeOutput>> {
    let run = self.runs.fetch_add(1, Ordering::Relaxed);
    let (done, receiver) = watch::channel(None);
    let graph = Arc::clone(self);
    let task_node = Arc::clone(node);
    // The caller holds this node's lock, so `complete` cannot observe the state before it is set.
    let handle = tokio::spawn(async move {
      let output = graph.run_node(id, &task_node, session).await;
      graph.complete(&task_node, run, output);
    });
    inner.state = NodeState::Running {
      run,
      done,
      abort: handle.abort_handle(),
    };
    receiver
  }

  fn complete(&self, node: &Node, run: u64, output: NodeOutput) {
    let mut inner = node.inner.lock();
    let current = matches!(&inner.state, NodeState::Running { run: r, .. } if *r == run);
    if !current {
      trace!(node = %node.description, "discarding result of a superseded run");
      return;
    }
    let interrupted = matches!(&output.result, Err(f) if f.is_interrupt());
    let next = if interrupted {
      NodeState::NotStarted
    } else {
      NodeState::Completed(output.clone())
    };
    if let NodeState::Running { done, .. } = std::mem::replace(&mut inner.state, next)
      && !interrupted
    {
      done.send_replace(Some(output));
    }
  }

  async fn run_node(self: &Arc<Self>, id: NodeId, node: &Node, session: u64) -> NodeOutput {
    self.clear_dependencies(id);
    self.invalidation.lock().forget(id);
    let rule = self.rules.rule(node.key.entry);
    let started = Instant::now();
    debug!(node = %node.description, "running node");

    let session_bound = Arc::new(AtomicBool::new(false));
    let ctx = RuleContext::new(
      Arc::clone(self),
      id,
      node.key.entry,
      node.key.params.clone(),
      session,
      Arc::clone(&session_bound),
    );

    let result = async {
      let args = try_join_all(
        rule
          .params
          .iter()
          .map(|param| ctx.request(DependencyKey::in_scope(*param), None)),
      )
      .await?;
      let body = rule.body().ok_or_else(|| EngineError::MissingBody {
        rule: rule.name.clone(),
      })?;
      let value = body(ctx.clone(), args).await?;
      if value.type_id() != rule.product {
        return Err(Failure::from(EngineError::TypeMismatch {
          expected: rule.product.name(),
          actual: value.type_id().name(),
        }));
      }
      Ok(value)
    }
    .await
    .map_err(|failure| failure.with_frame(&node.description));

    debug!(
      node = %node.description,
      elapsed_ms = started.elapsed().as_millis() as u64,
      ok = result.is_ok(),
      "node finished"
    );
    let bound = node.key.session.is_some() || session_bound.load(Ordering::Acquire);
    NodeOutput {
      result,
      session_bound: bound.then_some(session),
    }
  }

  /// Adds `caller -> callee`, refusing edges that would close a cycle.
  fn add_edge(&self, caller: NodeId, callee: NodeId) -> Result<(), Failure> {
    let mut edges = self.edges.lock();
    if caller == callee || (edges.contains_node(callee) && has_path_connecting(&*edges, callee, caller, None)) {
      let mut path = vec![self.describe(caller)];
      path.extend(cycle_path(&edges, callee, caller).into_iter().map(|n| self.describe(n)));
      debug!(path = ?path, "dependency cycle detected");
      return Err(Failure::Cycle { path });
    }
    edges.add_edge(caller, callee, ());
    Ok(())
  }

  fn clear_dependencies(&self, id: NodeId) {
    let mut edges = self.edges.lock();
    let deps: Vec<NodeId> = edges.neighbors_directed(id, Direction::Outgoing).collect();
    for dep in deps {
      edges.remove_edge(id, dep);
    }
  }

  /// Resets `roots` and everything that transitively depends on them.
  pub(crate) fn invalidate_from(&self, roots: HashSet<NodeId>) -> InvalidationResult {
    let affected = {
      let edges = self.edges.lock();
      let mut seen = roots.clone();
      let mut queue: VecDeque<NodeId> = roots.into_iter().collect();
      while let Some(id) = queue.pop_front() {
        if !edges.contains_node(id) {
          continue;
        }
        for dependent in edges.neighbors_directed(id, Direction::Incoming) {
          if seen.insert(dependent) {
            queue.push_back(dependent);
          }
        }
      }
      seen
    };

    let mut result = InvalidationResult::default();
    for id in affected {
      let node = self.node(id);
      let mut inner = node.inner.lock();
      match std::mem::replace(&mut inner.state, NodeState::NotStarted) {
        NodeState::Completed(_) => result.cleared += 1,
        NodeState::Running { abort, .. } => {
          // Dropping `done` wakes the waiters, which start a fresh run.
          abort.abort();
          result.restarted += 1;
        }
        NodeState::NotStarted => {}
      }
    }
    result
  }

  pub(crate) fn invalidate_paths(&self, changed: &[&str]) -> InvalidationResult {
    let roots: HashSet<NodeId> = {
      let index = self.invalidation.lock();
      changed.iter().flat_map(|path| index.affected(path)).collect()
    };
    let result = self.invalidate_from(roots);
    debug!(
      paths = changed.len(),
      cleared = result.cleared,
      restarted = result.restarted,
      "invalidated nodes"
    );
    result
  }

  pub(crate) fn invalidate_all(&self) -> InvalidationResult {
    let all: HashSet<NodeId> = (0..self.len()).collect();
    let result = self.invalidate_from(all);
    self.invalidation.lock().clear();
    result
  }
}

/// Shortest path `from -> .. -> to` in the edge graph, inclusive of both ends.
fn cycle_path(edges: &DiGraphMap<NodeId, ()>, from: NodeId, to: NodeId) -> Vec<NodeId> {
  let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
  let mut queue = VecDeque::from([from]);
  while let Some(id) = queue.pop_front() {
    if id == to {
      break;
    }
    if !edges.contains_node(id) {
      continue;
    }
    for next in edges.neighbors_directed(id, Direction::Outgoing) {
      if next != from && !previous.contains_key(&next) {
        previous.insert(next, id);
        queue.push_back(next);
      }
    }
  }

  let mut path = vec![to];
  let mut current = to;
  while current != from {
    match previous.get(&current) {
      Some(prev) => {
        path.push(*prev);
        current = *prev;
      }
      None => break,
    }
  }
  path.reverse();
  path
}
