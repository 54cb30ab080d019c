//! `cairn ls`: list a stored tree.

use anyhow::{Context, Result};

use cairn_lib::config::EngineConfig;

use super::{open_store, parse_digest};
use crate::output::{OutputFormat, print_json, report_tree};

pub fn cmd_ls(config: &EngineConfig, digest: &str, output: OutputFormat) -> Result<()> {
  let store = open_store(config)?;
  let digest = parse_digest(digest)?;
  let entries = store
    .entries(&digest)
    .with_context(|| format!("Failed to load tree {digest}"))?;

  if output.is_json() {
    return print_json(&entries);
  }
  report_tree(&entries);
  Ok(())
}
