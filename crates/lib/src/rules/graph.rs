//! The compiled, immutable rule graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use super::{DependencyKey, Rule, TypeId, type_list};

/// Index of a [`RuleEntry`] within its graph.
pub type EntryId = usize;

/// Where a dependency's value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Source {
  /// A param value already in scope.
  Param(TypeId),
  /// The product of running another entry.
  Entry(EntryId),
}

/// A rule monomorphized for the params it actually consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleEntry {
  pub rule: usize,
  /// Params this entry (transitively) consumes. Runtime node identity only includes these.
  pub params: BTreeSet<TypeId>,
  pub dependencies: BTreeMap<DependencyKey, Source>,
}

pub struct RuleGraph {
  pub(crate) rules: Vec<Rule>,
  pub(crate) entries: Vec<RuleEntry>,
  pub(crate) queries: BTreeMap<(TypeId, Vec<TypeId>), Source>,
  pub(crate) unreachable: Vec<String>,
}

/// Serializable summary of one entry, for tooling.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
  pub id: EntryId,
  pub rule: String,
  pub product: String,
  pub params: Vec<String>,
  pub dependencies: Vec<(String, String)>,
}

impl RuleGraph {
  pub fn rule(&self, entry: EntryId) -> &Rule {
    &self.rules[self.entries[entry].rule]
  }

  pub fn entry(&self, entry: EntryId) -> &RuleEntry {
    &self.entries[entry]
  }

  pub fn entries(&self) -> &[RuleEntry] {
    &self.entries
  }

  /// The source answering a declared query. `params` need not be sorted.
  pub fn query(&self, product: TypeId, params: &[TypeId]) -> Option<Source> {
    let mut params = params.to_vec();
    params.sort();
    self.queries.get(&(product, params)).copied()
  }

  pub fn queries(&self) -> impl Iterator<Item = (TypeId, &[TypeId])> {
    self.queries.keys().map(|(p, params)| (*p, params.as_slice()))
  }

  /// The source resolved for a request made by `entry`.
  pub fn dependency(&self, entry: EntryId, key: &DependencyKey) -> Option<Source> {
    self.entries[entry].dependencies.get(key).copied()
  }

  /// Names of registered rules that no query can reach.
  pub fn unreachable_rules(&self) -> &[String] {
    &self.unreachable
  }

  fn source_label(&self, source: Source) -> String {
    match source {
      Source::Param(t) => format!("Param({t})"),
      Source::Entry(e) => self.entry_label(e),
    }
  }

  fn entry_label(&self, entry: EntryId) -> String {
    let rule = self.rule(entry);
    format!(
      "{} for {}",
      rule.signature(),
      type_list(self.entries[entry].params.iter().copied())
    )
  }

  pub fn summaries(&self) -> Vec<EntrySummary> {
    self
      .entries
      .iter()
      .enumerate()
      .map(|(id, entry)| {
        let rule = &self.rules[entry.rule];
        EntrySummary {
          id,
          rule: rule.name.clone(),
          product: rule.product.name(),
          params: entry.params.iter().map(TypeId::name).collect(),
          dependencies: entry
            .dependencies
            .iter()
            .map(|(key, source)| (key.to_string(), self.source_label(*source)))
            .collect(),
        }
      })
      .collect()
  }

  /// Graphviz rendering of queries, entries and params.
  pub fn render_dot(&self) -> String {
    let mut graph: DiGraph<String, String> = DiGraph::new();
    let mut nodes: HashMap<Source, NodeIndex> = HashMap::new();

    let mut node_for = |graph: &mut DiGraph<String, String>, source: Source| {
      *nodes
        .entry(source)
        .or_insert_with(|| graph.add_node(self.source_label(source)))
    };

    for ((product, params), source) in &self.queries {
      let query = graph.add_node(format!("Query({product} for {})", type_list(params.iter().copied())));
      let target = node_for(&mut graph, *source);
      graph.add_edge(query, target, String::new());
    }
    for (id, entry) in self.entries.iter().enumerate() {
      let from = node_for(&mut graph, Source::Entry(id));
      for (key, source) in &entry.dependencies {
        let to = node_for(&mut graph, *source);
        graph.add_edge(from, to, key.to_string());
      }
    }

    format!("{}", Dot::new(&graph))
  }
}

impl fmt::Debug for RuleGraph {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RuleGraph")
      .field("entries", &self.entries)
      .field("queries", &self.queries)
      .field("unreachable", &self.unreachable)
      .finish()
  }
}
