//! `cairn snapshot`: capture files from disk into the store.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};

use cairn_lib::config::EngineConfig;
use cairn_lib::engine::{Value, runtime};
use cairn_lib::fs::{PathGlobs, Snapshot};

use super::{render_failure, scheduler};
use crate::output::{OutputFormat, print_json, report_snapshot};

pub fn cmd_snapshot(config: &EngineConfig, root: &Path, globs: Vec<String>, output: OutputFormat) -> Result<()> {
  let start = Instant::now();
  let scheduler = scheduler(config, root)?;
  let rt = runtime(config).context("Failed to create async runtime")?;

  let globs = PathGlobs::new(globs).warn_on_unmatched("the command line");
  let snapshot = rt
    .block_on(scheduler.session().request::<Snapshot>(vec![Value::new(globs)]))
    .map_err(render_failure)?;

  if output.is_json() {
    print_json(&*snapshot)?;
  } else {
    report_snapshot(&snapshot, start.elapsed());
  }

  Ok(())
}
