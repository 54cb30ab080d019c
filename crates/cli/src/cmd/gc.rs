use std::time::Instant;

use anyhow::{Context, Result};

use cairn_lib::config::EngineConfig;

use super::{open_store, parse_digest};
use crate::output::{OutputFormat, print_json, report_gc};

pub fn cmd_gc(config: &EngineConfig, roots: &[String], dry_run: bool, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let store = open_store(config)?;
  let roots = roots
    .iter()
    .map(|root| parse_digest(root))
    .collect::<Result<Vec<_>>>()?;

  let stats = store
    .garbage_collect(&roots, dry_run)
    .context("Garbage collection failed")?;

  if output.is_json() {
    print_json(&stats)?;
  } else {
    report_gc(&stats, dry_run, start.elapsed());
  }

  Ok(())
}
