//! Shared fixtures for engine tests.

use std::any::Any;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cairn_lib::config::EngineConfig;
use cairn_lib::engine::{EngineContext, Scheduler, Value, arg};
use cairn_lib::rules::{Rule, RuleGraphBuilder, TypeId};

/// An engine context with an in-memory store rooted at `build_root`.
pub fn context(build_root: &Path) -> EngineContext {
  EngineContext::new(EngineConfig::in_memory(), build_root).unwrap()
}

pub fn scheduler(builder: RuleGraphBuilder, build_root: &Path) -> Scheduler {
  Scheduler::new(builder.build().unwrap(), context(build_root))
}

/// Counts rule executions across clones.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
  pub fn bump(&self) -> usize {
    self.0.fetch_add(1, Ordering::SeqCst) + 1
  }

  pub fn get(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

/// Subject for recursive rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fib(pub u64);

/// A rule computing `P` from a single param `A` with `f`, counting each run.
pub fn map_rule<A, P, F>(name: &str, counter: &Counter, f: F) -> Rule
where
  A: Any + Send + Sync,
  P: Any + Send + Sync + Debug + Eq + Hash,
  F: Fn(&A) -> P + Send + Sync + 'static,
{
  let counter = counter.clone();
  let f = Arc::new(f);
  Rule::new(name, TypeId::of::<P>()).param::<A>().run(move |_ctx, args| {
    let counter = counter.clone();
    let f = Arc::clone(&f);
    async move {
      counter.bump();
      let input = arg::<A>(&args, 0)?;
      Ok(Value::new(f(&input)))
    }
  })
}

pub fn write(root: &Path, path: &str, content: &str) {
  let path = root.join(path);
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).unwrap();
  }
  std::fs::write(path, content).unwrap();
}
