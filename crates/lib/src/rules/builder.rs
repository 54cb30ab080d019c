//! Monomorphizing compiler from rule declarations to a [`RuleGraph`].
//!
//! Every request a rule can make is resolved against the param types in scope at that point:
//! a param of the requested type wins, otherwise each rule producing the type is tried under
//! the same params. Viable candidates consuming a strict superset of another's params are
//! pruned. More than one survivor is ambiguous, however differently the survivors are derived.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use tracing::debug;

use super::graph::{RuleEntry, RuleGraph, Source};
use super::{DependencyKey, Rule, RuleGraphError, TypeId, type_list};

#[derive(Default)]
pub struct RuleGraphBuilder {
  rules: Vec<Rule>,
  queries: Vec<(TypeId, BTreeSet<TypeId>)>,
}

impl RuleGraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn rule(mut self, rule: Rule) -> Self {
    self.rules.push(rule);
    self
  }

  pub fn rules(mut self, rules: impl IntoIterator<Item = Rule>) -> Self {
    self.rules.extend(rules);
    self
  }

  /// Declares that `P` may be requested from a session with exactly these param types.
  pub fn query<P: 'static>(self, params: &[TypeId]) -> Self {
    self.query_type(TypeId::of::<P>(), params)
  }

  pub fn query_type(mut self, product: TypeId, params: &[TypeId]) -> Self {
    let params: BTreeSet<TypeId> = params.iter().copied().collect();
    if !self.queries.iter().any(|(p, ps)| *p == product && *ps == params) {
      self.queries.push((product, params));
    }
    self
  }

  pub fn build(self) -> Result<RuleGraph, RuleGraphError> {
    let mut names = HashSet::new();
    for rule in &self.rules {
      if !names.insert(rule.name.as_str()) {
        return Err(RuleGraphError::DuplicateRule { name: rule.name.clone() });
      }
      if rule.body().is_none() {
        return Err(RuleGraphError::MissingBody { name: rule.name.clone() });
      }
    }

    let mut compiler = Compiler::new(&self.rules);
    let mut roots = BTreeMap::new();
    for (product, params) in &self.queries {
      let source = compiler.resolve_query(*product, params)?;
      roots.insert((*product, params.iter().copied().collect::<Vec<_>>()), source);
    }
    let (entries, queries) = compiler.finish(roots);

    let reached: BTreeSet<usize> = entries.iter().map(|e| e.rule).collect();
    let unreachable: Vec<String> = self
      .rules
      .iter()
      .enumerate()
      .filter(|(idx, _)| !reached.contains(idx))
      .map(|(_, rule)| rule.name.clone())
      .collect();
    for name in &unreachable {
      debug!(rule = %name, "rule is not reachable from any query");
    }
    debug!(
      rules = self.rules.len(),
      entries = entries.len(),
      queries = queries.len(),
      "compiled rule graph"
    );

    Ok(RuleGraph {
      rules: self.rules,
      entries,
      queries,
      unreachable,
    })
  }
}

#[derive(Clone)]
struct Candidate {
  source: Source,
  used: BTreeSet<TypeId>,
}

enum Unresolved {
  Missing(Vec<String>),
  Cycle(Vec<String>),
  Fatal(RuleGraphError),
}

#[derive(Clone, Copy)]
enum Memo {
  InProgress(usize),
  Done(usize),
}

impl Memo {
  fn id(self) -> usize {
    match self {
      Memo::InProgress(id) | Memo::Done(id) => id,
    }
  }
}

struct Partial {
  rule: usize,
  used: BTreeSet<TypeId>,
  dependencies: BTreeMap<DependencyKey, Source>,
}

struct Frame {
  rule: usize,
  available: BTreeSet<TypeId>,
  /// Whether the request leading into this frame provided params.
  via_provided: bool,
}

struct Compiler<'a> {
  rules: &'a [Rule],
  by_product: HashMap<TypeId, Vec<usize>>,
  memo: HashMap<(usize, BTreeSet<TypeId>), Memo>,
  entries: Vec<Partial>,
  stack: Vec<Frame>,
}

impl<'a> Compiler<'a> {
  fn new(rules: &'a [Rule]) -> Self {
    let mut by_product: HashMap<TypeId, Vec<usize>> = HashMap::new();
    for (idx, rule) in rules.iter().enumerate() {
      by_product.entry(rule.product).or_default().push(idx);
    }
    Self {
      rules,
      by_product,
      memo: HashMap::new(),
      entries: Vec::new(),
      stack: Vec::new(),
    }
  }

  fn resolve_query(&mut self, product: TypeId, params: &BTreeSet<TypeId>) -> Result<Source, RuleGraphError> {
    match self.resolve(product, params, false) {
      Ok(candidate) => Ok(candidate.source),
      Err(Unresolved::Missing(reasons)) => Err(RuleGraphError::MissingProduct {
        product: product.name(),
        params: type_list(params.iter().copied()),
        reasons,
      }),
      Err(Unresolved::Cycle(path)) => Err(RuleGraphError::RuleGraphCycle { path }),
      Err(Unresolved::Fatal(e)) => Err(e),
    }
  }

  fn candidate(&self, id: usize) -> Candidate {
    Candidate {
      source: Source::Entry(id),
      used: self.entries[id].used.clone(),
    }
  }

  fn resolve(
    &mut self,
    product: TypeId,
    available: &BTreeSet<TypeId>,
    via_provided: bool,
  ) -> Result<Candidate, Unresolved> {
    if available.contains(&product) {
      return Ok(Candidate {
        source: Source::Param(product),
        used: BTreeSet::from([product]),
      });
    }

    let rules = self.by_product.get(&product).cloned().unwrap_or_default();
    if rules.is_empty() {
      return Err(Unresolved::Missing(vec![format!(
        "no rule produces {product} and it is not among the params {}",
        type_list(available.iter().copied())
      )]));
    }

    let mut viable = Vec::new();
    let mut reasons = Vec::new();
    let mut cycle = None;
    let mut missing = 0;
    for rule in rules {
      match self.monomorphize(rule, available, via_provided) {
        Ok(candidate) => viable.push((rule, candidate)),
        Err(Unresolved::Missing(why)) => {
          missing += 1;
          reasons.extend(why);
        }
        Err(Unresolved::Cycle(path)) => {
          reasons.push(format!("{} is part of a cycle: {}", self.rules[rule].signature(), path.join(" -> ")));
          cycle.get_or_insert(path);
        }
        Err(fatal) => return Err(fatal),
      }
    }

    if viable.is_empty() {
      return Err(match cycle {
        Some(path) if missing == 0 => Unresolved::Cycle(path),
        _ => Unresolved::Missing(reasons),
      });
    }

    // Prefer candidates that consume fewer params.
    let chosen: Vec<&(usize, Candidate)> = viable
      .iter()
      .filter(|(_, c)| {
        !viable
          .iter()
          .any(|(_, other)| other.used.is_subset(&c.used) && other.used != c.used)
      })
      .collect();

    match chosen.as_slice() {
      [(_, candidate)] => Ok(candidate.clone()),
      _ => Err(Unresolved::Fatal(RuleGraphError::AmbiguousRule {
        product: product.name(),
        params: type_list(available.iter().copied()),
        candidates: chosen.iter().map(|(rule, _)| self.rules[*rule].signature()).collect(),
      })),
    }
  }

  fn monomorphize(
    &mut self,
    rule: usize,
    available: &BTreeSet<TypeId>,
    via_provided: bool,
  ) -> Result<Candidate, Unresolved> {
    let key = (rule, available.clone());
    match self.memo.get(&key).copied() {
      Some(Memo::Done(id)) => return Ok(self.candidate(id)),
      Some(Memo::InProgress(id)) => {
        let start = self
          .stack
          .iter()
          .rposition(|f| f.rule == rule && f.available == *available)
          .unwrap_or(0);
        let provides_new_params = via_provided || self.stack[start + 1..].iter().any(|f| f.via_provided);
        if provides_new_params {
          return Ok(self.candidate(id));
        }
        let mut path: Vec<String> = self.stack[start..]
          .iter()
          .map(|f| self.rules[f.rule].name.clone())
          .collect();
        path.push(self.rules[rule].name.clone());
        return Err(Unresolved::Cycle(path));
      }
      None => {}
    }

    let id = self.entries.len();
    self.entries.push(Partial {
      rule,
      used: BTreeSet::new(),
      dependencies: BTreeMap::new(),
    });
    self.memo.insert(key.clone(), Memo::InProgress(id));
    self.stack.push(Frame {
      rule,
      available: available.clone(),
      via_provided,
    });

    let mut used = BTreeSet::new();
    let mut dependencies = BTreeMap::new();
    for dep in self.rules[rule].dependency_keys() {
      let mut dep_available = available.clone();
      dep_available.extend(dep.provided_params.iter().copied());
      match self.resolve(dep.product, &dep_available, !dep.provided_params.is_empty()) {
        Ok(candidate) => {
          used.extend(
            candidate
              .used
              .iter()
              .filter(|t| !dep.provided_params.contains(t))
              .copied(),
          );
          dependencies.insert(dep, candidate.source);
        }
        Err(Unresolved::Missing(reasons)) => {
          self.abandon(id);
          return Err(Unresolved::Missing(vec![format!(
            "{} cannot get {dep} with params {}: {}",
            self.rules[rule].signature(),
            type_list(dep_available.iter().copied()),
            reasons.join("; ")
          )]));
        }
        Err(other) => {
          self.abandon(id);
          return Err(other);
        }
      }
    }

    self.stack.pop();
    self.entries[id] = Partial {
      rule,
      used,
      dependencies,
    };
    self.memo.insert(key, Memo::Done(id));
    Ok(self.candidate(id))
  }

  /// Drops the in-progress entry `id` and everything created after it.
  fn abandon(&mut self, id: usize) {
    self.stack.pop();
    self.entries.truncate(id);
    self.memo.retain(|_, memo| memo.id() < id);
  }

  /// Settles consumed params, merges equivalent entries and keeps only what the roots reach.
  fn finish(
    mut self,
    roots: BTreeMap<(TypeId, Vec<TypeId>), Source>,
  ) -> (Vec<RuleEntry>, BTreeMap<(TypeId, Vec<TypeId>), Source>) {
    // Recursive entries were linked before their own params were known.
    loop {
      let mut changed = false;
      for id in 0..self.entries.len() {
        let used = {
          let mut used = BTreeSet::new();
          for (key, source) in &self.entries[id].dependencies {
            match source {
              Source::Param(t) => {
                used.insert(*t);
              }
              Source::Entry(e) => used.extend(
                self.entries[*e]
                  .used
                  .iter()
                  .filter(|t| !key.provided_params.contains(t))
                  .copied(),
              ),
            }
          }
          used
        };
        if used != self.entries[id].used {
          self.entries[id].used = used;
          changed = true;
        }
      }
      if !changed {
        break;
      }
    }

    let mut canonical_by_key: HashMap<(usize, BTreeSet<TypeId>), usize> = HashMap::new();
    let canonical: Vec<usize> = self
      .entries
      .iter()
      .enumerate()
      .map(|(id, entry)| *canonical_by_key.entry((entry.rule, entry.used.clone())).or_insert(id))
      .collect();
    let canon = |source: Source| match source {
      Source::Entry(e) => Source::Entry(canonical[e]),
      param => param,
    };

    let mut renumbered: HashMap<usize, usize> = HashMap::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    let mut visit = |source: Source, queue: &mut VecDeque<usize>, order: &mut Vec<usize>| {
      if let Source::Entry(e) = canon(source)
        && !renumbered.contains_key(&e)
      {
        renumbered.insert(e, order.len());
        order.push(e);
        queue.push_back(e);
      }
    };
    for source in roots.values() {
      visit(*source, &mut queue, &mut order);
    }
    while let Some(e) = queue.pop_front() {
      for source in self.entries[e].dependencies.values() {
        visit(*source, &mut queue, &mut order);
      }
    }

    let renumber = |source: Source| match canon(source) {
      Source::Entry(e) => Source::Entry(renumbered[&e]),
      param => param,
    };
    let entries = order
      .iter()
      .map(|&old| {
        let partial = &self.entries[old];
        RuleEntry {
          rule: partial.rule,
          params: partial.used.clone(),
          dependencies: partial
            .dependencies
            .iter()
            .map(|(key, source)| (key.clone(), renumber(*source)))
            .collect(),
        }
      })
      .collect();
    let queries = roots
      .into_iter()
      .map(|(key, source)| (key, renumber(source)))
      .collect();
    (entries, queries)
  }
}
