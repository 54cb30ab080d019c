//! Glob patterns over relative paths.
//!
//! Includes use `glob::Pattern` syntax with literal separators: `*` stays within one
//! segment and `**` spans any number of segments. A leading `!` makes a pattern an
//! exclude. Excludes behave like gitignore entries: excluding a directory excludes
//! everything below it, and a pattern without `/` matches a name at any depth.

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::SnapshotError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: true,
  require_literal_leading_dot: false,
};

/// What to do when an include glob matches nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobMatchErrorBehavior {
  #[default]
  Ignore,
  Warn,
  Error,
}

/// Whether every include must match, or just one of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobExpansionConjunction {
  AllMatch,
  #[default]
  AnyMatch,
}

/// A request to match paths, either on disk or inside a digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathGlobs {
  pub globs: Vec<String>,
  pub glob_match_error_behavior: GlobMatchErrorBehavior,
  pub conjunction: GlobExpansionConjunction,
  /// Where the globs came from, for error messages.
  pub description_of_origin: Option<String>,
}

impl PathGlobs {
  pub fn new(globs: Vec<String>) -> Self {
    Self {
      globs,
      glob_match_error_behavior: GlobMatchErrorBehavior::Ignore,
      conjunction: GlobExpansionConjunction::AnyMatch,
      description_of_origin: None,
    }
  }

  pub fn error_on_unmatched(mut self, origin: impl Into<String>) -> Self {
    self.glob_match_error_behavior = GlobMatchErrorBehavior::Error;
    self.description_of_origin = Some(origin.into());
    self
  }

  pub fn warn_on_unmatched(mut self, origin: impl Into<String>) -> Self {
    self.glob_match_error_behavior = GlobMatchErrorBehavior::Warn;
    self.description_of_origin = Some(origin.into());
    self
  }

  pub fn conjunction(mut self, conjunction: GlobExpansionConjunction) -> Self {
    self.conjunction = conjunction;
    self
  }

  pub fn matcher(&self) -> Result<PathGlobMatcher, SnapshotError> {
    let mut includes = Vec::new();
    let mut excludes = Vec::new();
    for glob in &self.globs {
      if let Some(exclude) = glob.strip_prefix('!') {
        excludes.push(ExcludePattern::parse(exclude)?);
      } else {
        includes.push(IncludePattern::parse(glob)?);
      }
    }
    Ok(PathGlobMatcher { includes, excludes })
  }
}

#[derive(Debug, Clone)]
pub(crate) struct IncludePattern {
  pub source: String,
  pub normalized: String,
  pattern: Pattern,
}

impl IncludePattern {
  fn parse(source: &str) -> Result<Self, SnapshotError> {
    let normalized = normalize(source)?;
    let pattern = compile(source, &normalized)?;
    Ok(Self {
      source: source.to_string(),
      normalized,
      pattern,
    })
  }

  /// Leading components free of wildcards: the directory a disk walk can start from.
  pub fn literal_prefix(&self) -> String {
    self
      .normalized
      .split('/')
      .take_while(|c| !has_wildcard(c))
      .collect::<Vec<_>>()
      .join("/")
  }

  fn matches(&self, path: &str) -> bool {
    self.pattern.matches_with(path, MATCH_OPTIONS)
  }
}

#[derive(Debug, Clone)]
struct ExcludePattern {
  pattern: Pattern,
  /// Matches a single name at any depth.
  basename_only: bool,
}

impl ExcludePattern {
  fn parse(source: &str) -> Result<Self, SnapshotError> {
    let normalized = normalize(source)?;
    Ok(Self {
      pattern: compile(source, &normalized)?,
      basename_only: !normalized.contains('/'),
    })
  }

  fn matches(&self, path: &str) -> bool {
    if self.basename_only {
      path.split('/').any(|c| self.pattern.matches_with(c, MATCH_OPTIONS))
    } else {
      ancestors(path).any(|p| self.pattern.matches_with(p, MATCH_OPTIONS))
    }
  }
}

/// Compiled includes and excludes.
#[derive(Debug, Clone, Default)]
pub struct PathGlobMatcher {
  includes: Vec<IncludePattern>,
  excludes: Vec<ExcludePattern>,
}

impl PathGlobMatcher {
  /// A matcher made only of excludes, used for configured ignore patterns.
  pub fn ignore(patterns: &[String]) -> Result<Self, SnapshotError> {
    let excludes = patterns
      .iter()
      .map(|p| ExcludePattern::parse(p))
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self {
      includes: Vec::new(),
      excludes,
    })
  }

  pub(crate) fn includes(&self) -> &[IncludePattern] {
    &self.includes
  }

  pub fn is_included(&self, path: &str) -> bool {
    self.includes.iter().any(|p| p.matches(path))
  }

  pub fn is_excluded(&self, path: &str) -> bool {
    self.excludes.iter().any(|p| p.matches(path))
  }

  pub fn has_excludes(&self) -> bool {
    !self.excludes.is_empty()
  }

  /// `path` itself is included and not excluded. `*` never crosses a `/`.
  pub fn matches(&self, path: &str) -> bool {
    !self.is_excluded(path) && self.is_included(path)
  }

  /// Included directly or through an included ancestor directory, and not excluded.
  pub fn matches_within(&self, path: &str) -> bool {
    !self.is_excluded(path) && ancestors(path).any(|p| self.is_included(p))
  }

  /// Indices of the includes matching `path` itself.
  pub(crate) fn matching_includes<'a>(&'a self, path: &'a str) -> impl Iterator<Item = usize> + 'a {
    self
      .includes
      .iter()
      .enumerate()
      .filter(move |(_, p)| p.matches(path))
      .map(|(idx, _)| idx)
  }

  /// Indices of the includes matching `path` or one of its ancestors.
  pub(crate) fn matching_includes_within<'a>(&'a self, path: &'a str) -> impl Iterator<Item = usize> + 'a {
    self
      .includes
      .iter()
      .enumerate()
      .filter(move |(_, p)| ancestors(path).any(|a| p.matches(a)))
      .map(|(idx, _)| idx)
  }
}

/// `a/b/c` yields `a/b/c`, `a/b`, `a`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
  let mut next = Some(path);
  std::iter::from_fn(move || {
    let current = next?;
    next = current.rfind('/').map(|idx| &current[..idx]);
    Some(current)
  })
}

fn has_wildcard(component: &str) -> bool {
  component.contains(['*', '?', '['])
}

fn normalize(glob: &str) -> Result<String, SnapshotError> {
  let invalid = |reason: &str| SnapshotError::InvalidGlob {
    glob: glob.to_string(),
    reason: reason.to_string(),
  };
  if glob.starts_with('/') || std::path::Path::new(glob).has_root() {
    return Err(invalid("absolute paths are not allowed"));
  }
  let mut components = Vec::new();
  for component in glob.split('/') {
    match component {
      "" | "." => continue,
      ".." => return Err(invalid("`..` is not allowed")),
      other => components.push(other),
    }
  }
  if components.is_empty() {
    return Err(invalid("glob is empty"));
  }
  Ok(components.join("/"))
}

fn compile(source: &str, normalized: &str) -> Result<Pattern, SnapshotError> {
  Pattern::new(normalized).map_err(|e| SnapshotError::InvalidGlob {
    glob: source.to_string(),
    reason: e.to_string(),
  })
}
