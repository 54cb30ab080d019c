//! `cairn materialize`: write a stored tree to disk.

use std::path::Path;

use anyhow::{Context, Result};

use cairn_lib::config::EngineConfig;

use super::{open_store, parse_digest};
use crate::output::{OutputFormat, print_json, report_materialized};

pub fn cmd_materialize(config: &EngineConfig, digest: &str, destination: &Path, output: OutputFormat) -> Result<()> {
  let store = open_store(config)?;
  let digest = parse_digest(digest)?;
  store
    .materialize_directory(destination, &digest)
    .with_context(|| format!("Failed to materialize {digest} into {}", destination.display()))?;

  if output.is_json() {
    print_json(&serde_json::json!({
      "digest": digest,
      "destination": destination.display().to_string(),
    }))?;
  } else {
    report_materialized(&digest, destination);
  }
  Ok(())
}
