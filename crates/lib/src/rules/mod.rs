//! Rule declarations and the compiler that turns them into a [`RuleGraph`].
//!
//! A rule produces exactly one product type from positional params and may request other
//! products while it runs. [`RuleGraphBuilder::build`] statically resolves every such request
//! for every declared query, so that at run time each request maps to exactly one source.

mod builder;
mod graph;

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

use crate::engine::{Failure, Params, RuleContext, Value};

pub use builder::RuleGraphBuilder;
pub use graph::{EntryId, EntrySummary, RuleEntry, RuleGraph, Source};

/// A rule-level type: a Rust type identity plus its name for diagnostics.
#[derive(Clone, Copy)]
pub struct TypeId {
  id: std::any::TypeId,
  name: &'static str,
}

impl TypeId {
  pub fn of<T: 'static>() -> Self {
    Self {
      id: std::any::TypeId::of::<T>(),
      name: std::any::type_name::<T>(),
    }
  }

  /// The fully qualified type name.
  pub fn full_name(&self) -> &'static str {
    self.name
  }

  /// The type name without module paths, e.g. `Vec<String>`.
  pub fn name(&self) -> String {
    let mut out = String::with_capacity(self.name.len());
    let mut segment = String::new();
    for c in self.name.chars() {
      if c.is_alphanumeric() || c == '_' || c == ':' {
        segment.push(c);
      } else {
        out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
        segment.clear();
        out.push(c);
      }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
    out
  }
}

impl PartialEq for TypeId {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for TypeId {}

impl Hash for TypeId {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id.hash(state);
  }
}

// Ordered by name first so that compilation and rendering are stable across builds.
impl Ord for TypeId {
  fn cmp(&self, other: &Self) -> Ordering {
    self.name.cmp(other.name).then_with(|| self.id.cmp(&other.id))
  }
}

impl PartialOrd for TypeId {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl fmt::Debug for TypeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

impl fmt::Display for TypeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name())
  }
}

pub(crate) fn type_list(types: impl IntoIterator<Item = TypeId>) -> String {
  let names: Vec<String> = types.into_iter().map(|t| t.name()).collect();
  format!("[{}]", names.join(", "))
}

/// A request for `product`, made with `provided_params` added to the params in scope.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey {
  pub product: TypeId,
  pub provided_params: Vec<TypeId>,
}

impl DependencyKey {
  pub fn new(product: TypeId, provided_params: impl IntoIterator<Item = TypeId>) -> Self {
    let mut provided_params: Vec<TypeId> = provided_params.into_iter().collect();
    provided_params.sort();
    provided_params.dedup();
    Self {
      product,
      provided_params,
    }
  }

  pub fn in_scope(product: TypeId) -> Self {
    Self::new(product, [])
  }
}

impl fmt::Display for DependencyKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.provided_params.is_empty() {
      write!(f, "{}", self.product)
    } else {
      write!(f, "Get({}, {})", self.product, type_list(self.provided_params.iter().copied()))
    }
  }
}

pub type RuleFuture = BoxFuture<'static, Result<Value, Failure>>;
pub type RuleBody = Arc<dyn Fn(RuleContext, Vec<Value>) -> RuleFuture + Send + Sync>;
pub type CachePredicate = Arc<dyn Fn(&Params) -> bool + Send + Sync>;

/// A static rule declaration.
#[derive(Clone)]
pub struct Rule {
  pub name: String,
  pub product: TypeId,
  /// Positional inputs, resolved before the body starts.
  pub params: Vec<TypeId>,
  /// Products the body may request through its [`RuleContext`].
  pub gets: Vec<DependencyKey>,
  uncacheable: Option<CachePredicate>,
  body: Option<RuleBody>,
}

impl Rule {
  pub fn new(name: impl Into<String>, product: TypeId) -> Self {
    Self {
      name: name.into(),
      product,
      params: Vec::new(),
      gets: Vec::new(),
      uncacheable: None,
      body: None,
    }
  }

  pub fn param<T: 'static>(mut self) -> Self {
    self.params.push(TypeId::of::<T>());
    self
  }

  /// Declares that the body requests `P` for a provided `S`.
  pub fn get<P: 'static, S: 'static>(mut self) -> Self {
    self.gets.push(DependencyKey::new(TypeId::of::<P>(), [TypeId::of::<S>()]));
    self
  }

  /// Declares that the body requests `P` from the params already in scope.
  pub fn get_in_scope<P: 'static>(mut self) -> Self {
    self.gets.push(DependencyKey::in_scope(TypeId::of::<P>()));
    self
  }

  pub fn get_key(mut self, key: DependencyKey) -> Self {
    self.gets.push(key);
    self
  }

  /// Results computed for params matching `predicate` are only shared within one session.
  pub fn uncacheable_when<F>(mut self, predicate: F) -> Self
  where
    F: Fn(&Params) -> bool + Send + Sync + 'static,
  {
    self.uncacheable = Some(Arc::new(predicate));
    self
  }

  pub fn uncacheable(self) -> Self {
    self.uncacheable_when(|_| true)
  }

  pub fn run<F, Fut>(mut self, body: F) -> Self
  where
    F: Fn(RuleContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Failure>> + Send + 'static,
  {
    self.body = Some(Arc::new(move |ctx, args| -> RuleFuture { Box::pin(body(ctx, args)) }));
    self
  }

  pub fn is_cacheable(&self, params: &Params) -> bool {
    self.uncacheable.as_ref().is_none_or(|p| !p(params))
  }

  pub(crate) fn body(&self) -> Option<&RuleBody> {
    self.body.as_ref()
  }

  /// Positional params first, then declared gets, each once.
  pub(crate) fn dependency_keys(&self) -> Vec<DependencyKey> {
    let mut keys: Vec<DependencyKey> = self.params.iter().map(|t| DependencyKey::in_scope(*t)).collect();
    for key in &self.gets {
      if !keys.contains(key) {
        keys.push(key.clone());
      }
    }
    keys
  }

  pub fn signature(&self) -> String {
    let params: Vec<String> = self.params.iter().map(TypeId::name).collect();
    format!("{}({}) -> {}", self.name, params.join(", "), self.product)
  }
}

impl fmt::Debug for Rule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Rule")
      .field("name", &self.name)
      .field("product", &self.product)
      .field("params", &self.params)
      .field("gets", &self.gets)
      .finish_non_exhaustive()
  }
}

#[derive(Debug, Error)]
pub enum RuleGraphError {
  #[error("ambiguous rules to compute {product} with params {params}: {}", .candidates.join(", "))]
  AmbiguousRule {
    product: String,
    params: String,
    candidates: Vec<String>,
  },

  #[error("no rule can compute {product} with params {params}{}", render_reasons(.reasons))]
  MissingProduct {
    product: String,
    params: String,
    reasons: Vec<String>,
  },

  #[error("rule graph cycle: {}", .path.join(" -> "))]
  RuleGraphCycle { path: Vec<String> },

  #[error("rule {name} is registered more than once")]
  DuplicateRule { name: String },

  #[error("rule {name} has no body")]
  MissingBody { name: String },
}

fn render_reasons(reasons: &[String]) -> String {
  reasons.iter().map(|r| format!("\n  - {r}")).collect()
}
