//! `cairn cat`: print one file of a stored tree.

use std::io::Write;

use anyhow::{Context, Result};

use cairn_lib::config::EngineConfig;

use super::{open_store, parse_digest};

pub fn cmd_cat(config: &EngineConfig, digest: &str, path: &str) -> Result<()> {
  let store = open_store(config)?;
  let digest = parse_digest(digest)?;

  let contents = store
    .contents(&digest)
    .with_context(|| format!("Failed to load tree {digest}"))?;
  let file = contents
    .get(path)
    .with_context(|| format!("No file '{path}' in tree {digest}"))?;

  std::io::stdout()
    .write_all(&file.content)
    .context("Failed to write to stdout")?;
  Ok(())
}
