//! `cairn exec`: run a command through the engine's sandboxed, cached process runner.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use cairn_lib::config::EngineConfig;
use cairn_lib::engine::{Value, runtime};
use cairn_lib::process::{FallibleProcessResult, Process};

use super::{parse_digest, render_failure, scheduler};
use crate::output::{OutputFormat, print_json, report_outputs, report_process_exit};

#[derive(Debug, Args)]
pub struct ExecArgs {
  /// Tree digest materialized into the sandbox before running
  #[arg(long, value_name = "DIGEST")]
  pub input: Option<String>,

  /// Environment variable for the process, as KEY=VALUE (repeatable)
  #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_var)]
  pub env: Vec<(String, String)>,

  /// File to capture after the run, relative to the working directory (repeatable)
  #[arg(long = "output-file", value_name = "PATH")]
  pub output_files: Vec<String>,

  /// Directory to capture after the run, relative to the working directory (repeatable)
  #[arg(long = "output-dir", value_name = "PATH")]
  pub output_dirs: Vec<String>,

  /// Kill the process after this long, e.g. "30s" or "2m"
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Working directory inside the sandbox
  #[arg(long, value_name = "PATH")]
  pub workdir: Option<String>,

  /// Program and arguments
  #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
  pub argv: Vec<String>,
}

fn parse_env_var(s: &str) -> Result<(String, String), String> {
  match s.split_once('=') {
    Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
    _ => Err(format!("expected KEY=VALUE, got '{s}'")),
  }
}

impl ExecArgs {
  fn to_process(&self) -> Result<Process> {
    let env: BTreeMap<String, String> = self.env.iter().cloned().collect();
    let mut process = Process::new(self.argv.clone())
      .env(env)
      .output_files(self.output_files.iter().cloned())
      .output_directories(self.output_dirs.iter().cloned());
    if let Some(input) = &self.input {
      process = process.input_digest(parse_digest(input)?);
    }
    if let Some(timeout) = self.timeout {
      process = process.timeout(timeout);
    }
    if let Some(workdir) = &self.workdir {
      process = process.working_directory(workdir.clone());
    }
    Ok(process)
  }
}

pub fn cmd_exec(config: &EngineConfig, root: &Path, args: ExecArgs, output: OutputFormat) -> Result<()> {
  let process = args.to_process()?;
  let scheduler = scheduler(config, root)?;
  let rt = runtime(config).context("Failed to create async runtime")?;

  let result = rt
    .block_on(
      scheduler
        .session()
        .request::<FallibleProcessResult>(vec![Value::new(process)]),
    )
    .map_err(render_failure)?;

  let store = &scheduler.context().store;
  let stdout = store
    .load_file_bytes(&result.stdout_digest)
    .context("Failed to load process stdout")?;
  let stderr = store
    .load_file_bytes(&result.stderr_digest)
    .context("Failed to load process stderr")?;

  if output.is_json() {
    print_json(&serde_json::json!({
      "exit_code": result.exit_code,
      "stdout": String::from_utf8_lossy(&stdout),
      "stderr": String::from_utf8_lossy(&stderr),
      "output_digest": result.output_digest,
      "source": result.metadata.source,
      "elapsed_ms": result.metadata.elapsed.as_millis() as u64,
    }))?;
  } else {
    std::io::stdout().write_all(&stdout).context("Failed to write to stdout")?;
    std::io::stderr().write_all(&stderr).context("Failed to write to stderr")?;
    if !args.output_files.is_empty() || !args.output_dirs.is_empty() {
      report_outputs(&result.output_digest);
    }
    if result.exit_code != 0 {
      report_process_exit(result.exit_code, result.metadata.elapsed);
    }
  }

  if result.exit_code != 0 {
    std::process::exit(result.exit_code);
  }
  Ok(())
}
