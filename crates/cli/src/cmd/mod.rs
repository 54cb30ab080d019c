//! Subcommand implementations.

mod cat;
mod exec;
mod gc;
mod ls;
mod materialize;
mod rules;
mod snapshot;

use std::path::Path;

use anyhow::{Context, Result, anyhow};

use cairn_lib::config::EngineConfig;
use cairn_lib::engine::{EngineContext, Failure, Scheduler, intrinsics};
use cairn_lib::fs::{PathGlobs, Snapshot};
use cairn_lib::process::{FallibleProcessResult, Process};
use cairn_lib::rules::{RuleGraphBuilder, TypeId};
use cairn_lib::store::Store;
use cairn_lib::util::hash::Digest;

pub use cat::cmd_cat;
pub use exec::{ExecArgs, cmd_exec};
pub use gc::cmd_gc;
pub use ls::cmd_ls;
pub use materialize::cmd_materialize;
pub use rules::cmd_rules;
pub use snapshot::cmd_snapshot;

/// The built-in rules with the queries the subcommands issue.
fn builtin_rules() -> RuleGraphBuilder {
  RuleGraphBuilder::new()
    .rules(intrinsics())
    .query::<Snapshot>(&[TypeId::of::<PathGlobs>()])
    .query::<FallibleProcessResult>(&[TypeId::of::<Process>()])
}

fn scheduler(config: &EngineConfig, root: &Path) -> Result<Scheduler> {
  let rules = builtin_rules().build().context("Failed to compile built-in rules")?;
  let context = EngineContext::new(config.clone(), root).context("Failed to set up the engine")?;
  Ok(Scheduler::new(rules, context))
}

fn open_store(config: &EngineConfig) -> Result<Store> {
  Store::from_config(config).with_context(|| format!("Failed to open store at {}", config.store_dir.display()))
}

fn parse_digest(digest: &str) -> Result<Digest> {
  digest
    .parse()
    .with_context(|| format!("Invalid digest '{digest}', expected <hex>:<size>"))
}

/// Keeps the rule traceback in the reported error.
fn render_failure(failure: Failure) -> anyhow::Error {
  anyhow!(failure.render())
}
