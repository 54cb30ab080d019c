//! `cairn rules`: inspect the compiled built-in rule graph.

use anyhow::{Context, Result};

use super::builtin_rules;
use crate::output::{OutputFormat, print_json, report_rules};

pub fn cmd_rules(dot: bool, output: OutputFormat) -> Result<()> {
  let graph = builtin_rules().build().context("Failed to compile built-in rules")?;

  if dot {
    print!("{}", graph.render_dot());
    return Ok(());
  }
  if output.is_json() {
    return print_json(&graph.summaries());
  }

  report_rules(&graph.summaries());
  Ok(())
}
