//! Type-erased values flowing between rules.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::rules::TypeId;

/// Object-safe view of a value that can be memoized: comparable, hashable and shareable.
pub trait DynValue: Any + Send + Sync + fmt::Debug {
  fn dyn_eq(&self, other: &dyn DynValue) -> bool;
  fn dyn_hash(&self, state: &mut dyn Hasher);
  fn as_any(&self) -> &dyn Any;
  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> DynValue for T
where
  T: Any + Send + Sync + fmt::Debug + Eq + Hash,
{
  fn dyn_eq(&self, other: &dyn DynValue) -> bool {
    other.as_any().downcast_ref::<T>().is_some_and(|o| o == self)
  }

  fn dyn_hash(&self, mut state: &mut dyn Hasher) {
    self.hash(&mut state);
  }

  fn as_any(&self) -> &dyn Any {
    self
  }

  fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
    self
  }
}

/// A reference-counted value tagged with its rule-level type.
///
/// Cloning a `Value` shares the underlying allocation, so every requester of a memoized node
/// observes the same object (see [`Value::ptr_eq`]).
#[derive(Clone)]
pub struct Value {
  type_id: TypeId,
  inner: Arc<dyn DynValue>,
}

impl Value {
  pub fn new<T>(value: T) -> Self
  where
    T: Any + Send + Sync + fmt::Debug + Eq + Hash,
  {
    Self::from_arc(Arc::new(value))
  }

  pub fn from_arc<T>(value: Arc<T>) -> Self
  where
    T: Any + Send + Sync + fmt::Debug + Eq + Hash,
  {
    Self {
      type_id: TypeId::of::<T>(),
      inner: value,
    }
  }

  pub fn type_id(&self) -> TypeId {
    self.type_id
  }

  pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    Arc::clone(&self.inner).into_any().downcast::<T>().ok()
  }

  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    self.inner.as_any().downcast_ref::<T>()
  }

  /// True when both values share one allocation.
  pub fn ptr_eq(&self, other: &Value) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    self.type_id == other.type_id && self.inner.dyn_eq(other.inner.as_ref())
  }
}

impl Eq for Value {}

impl Hash for Value {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.type_id.hash(state);
    self.inner.dyn_hash(state);
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(&*self.inner, f)
  }
}

/// The concrete parameter values a node is keyed by, at most one per type, sorted by type.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<Value>);

impl Params {
  /// Builds a param set. A later value replaces an earlier one of the same type.
  pub fn new(values: impl IntoIterator<Item = Value>) -> Self {
    let mut params = Self::default();
    for value in values {
      params.put(value);
    }
    params
  }

  pub fn put(&mut self, value: Value) {
    match self.0.binary_search_by(|v| v.type_id().cmp(&value.type_id())) {
      Ok(idx) => self.0[idx] = value,
      Err(idx) => self.0.insert(idx, value),
    }
  }

  pub fn with(&self, value: Value) -> Self {
    let mut params = self.clone();
    params.put(value);
    params
  }

  pub fn find(&self, type_id: TypeId) -> Option<&Value> {
    self
      .0
      .binary_search_by(|v| v.type_id().cmp(&type_id))
      .ok()
      .map(|idx| &self.0[idx])
  }

  pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self.find(TypeId::of::<T>()).and_then(Value::downcast::<T>)
  }

  pub fn type_ids(&self) -> Vec<TypeId> {
    self.0.iter().map(Value::type_id).collect()
  }

  /// Keeps only the values whose types appear in `types`.
  pub fn restrict<'a>(&self, types: impl IntoIterator<Item = &'a TypeId>) -> Self {
    let wanted: Vec<&TypeId> = types.into_iter().collect();
    Self(
      self
        .0
        .iter()
        .filter(|v| wanted.contains(&&Value::type_id(v)))
        .cloned()
        .collect(),
    )
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Value> {
    self.0.iter()
  }
}

impl fmt::Debug for Params {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.0.iter()).finish()
  }
}

impl fmt::Display for Params {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let rendered: Vec<String> = self.0.iter().map(|v| format!("{v:?}")).collect();
    write!(f, "[{}]", rendered.join(", "))
  }
}
