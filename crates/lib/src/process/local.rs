//! Local sandboxed execution.
//!
//! Each process runs in a fresh directory under the execution root:
//! - the input tree is materialized into it
//! - the environment is cleared and only the declared variables are set
//! - stdin is closed, stdout and stderr are captured
//! - declared outputs are captured back into the store afterwards
//!
//! The sandbox is removed when the run finishes unless the keep policy says otherwise.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use super::{
  CommandRunner, FallibleProcessResult, Process, ProcessError, ProcessResultMetadata, ProcessResultSource,
};
use crate::config::{EngineConfig, KeepSandboxes};
use crate::consts::RUN_SCRIPT_NAME;
use crate::platform::Platform;
use crate::store::Store;
use crate::store::directory::path_components;

pub struct LocalCommandRunner {
  store: Store,
  execution_root: PathBuf,
  semaphore: Arc<Semaphore>,
  keep_sandboxes: KeepSandboxes,
  platform: Platform,
}

impl LocalCommandRunner {
  pub fn new(
    store: Store,
    execution_root: PathBuf,
    parallelism: usize,
    keep_sandboxes: KeepSandboxes,
    platform: Platform,
  ) -> Self {
    Self {
      store,
      execution_root,
      semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
      keep_sandboxes,
      platform,
    }
  }

  pub fn from_config(store: Store, config: &EngineConfig, platform: Platform) -> Self {
    Self::new(
      store,
      config.execution_root.clone(),
      config.process_parallelism,
      config.keep_sandboxes,
      platform,
    )
  }

  async fn prepare_sandbox(&self, process: &Process) -> Result<(tempfile::TempDir, PathBuf), ProcessError> {
    tokio::fs::create_dir_all(&self.execution_root)
      .await
      .map_err(|source| ProcessError::SandboxCreation {
        path: self.execution_root.clone(),
        source,
      })?;
    let sandbox = tempfile::Builder::new()
      .prefix("cairn-sandbox-")
      .tempdir_in(&self.execution_root)
      .map_err(|source| ProcessError::SandboxCreation {
        path: self.execution_root.clone(),
        source,
      })?;

    let store = self.store.clone();
    let root = sandbox.path().to_path_buf();
    let input = process.input_digest;
    blocking(move || store.materialize_directory(&root, &input)).await?;

    let workdir = match &process.working_directory {
      Some(dir) => sandbox.path().join(path_components(dir)?.join("/")),
      None => sandbox.path().to_path_buf(),
    };
    tokio::fs::create_dir_all(&workdir)
      .await
      .map_err(|source| ProcessError::SandboxCreation {
        path: workdir.clone(),
        source,
      })?;

    for output in process.output_files.iter().chain(&process.output_directories) {
      let components = path_components(output)?;
      let target = workdir.join(components.join("/"));
      let parent = if process.output_directories.contains(output) {
        Some(target.as_path())
      } else {
        target.parent()
      };
      if let Some(parent) = parent {
        tokio::fs::create_dir_all(parent).await.map_err(|source| ProcessError::Io {
          context: format!("failed to create output directory {}", parent.display()),
          source,
        })?;
      }
    }

    Ok((sandbox, workdir))
  }

  fn should_keep(&self, exit_code: i32) -> bool {
    match self.keep_sandboxes {
      KeepSandboxes::Never => false,
      KeepSandboxes::Always => true,
      KeepSandboxes::OnFailure => exit_code != 0,
    }
  }
}

#[async_trait]
impl CommandRunner for LocalCommandRunner {
  async fn run(&self, process: &Process) -> Result<FallibleProcessResult, ProcessError> {
    if let Some(requested) = process.platform
      && requested != self.platform
    {
      return Err(ProcessError::UnsupportedPlatform {
        requested,
        available: self.platform,
      });
    }
    let Some(binary) = process.argv.first() else {
      return Err(ProcessError::EmptyArgv);
    };

    let _permit = self
      .semaphore
      .acquire()
      .await
      .map_err(|e| ProcessError::Io {
        context: "process semaphore closed".to_string(),
        source: io::Error::other(e),
      })?;

    let (sandbox, workdir) = self.prepare_sandbox(process).await?;

    // A relative program path is resolved against the working directory; a bare name
    // goes through the declared PATH.
    let program = if binary.contains('/') && Path::new(binary).is_relative() {
      workdir.join(binary)
    } else {
      PathBuf::from(binary)
    };

    let mut command = Command::new(&program);
    command
      .args(&process.argv[1..])
      .current_dir(&workdir)
      .env_clear()
      .envs(&process.env)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    debug!(description = %process.description, sandbox = %sandbox.path().display(), "spawning process");
    let started = Instant::now();
    let child = command.spawn().map_err(|source| {
      if source.kind() == io::ErrorKind::NotFound {
        ProcessError::BinaryNotFound {
          binary: binary.clone(),
          source,
        }
      } else {
        ProcessError::Spawn {
          binary: binary.clone(),
          source,
        }
      }
    })?;

    // Dropping the wait future (timeout or cancellation) kills the child.
    let output = match process.timeout {
      Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output,
        Err(_) => {
          return Err(ProcessError::Timeout {
            description: process.description.clone(),
            timeout,
          });
        }
      },
      None => child.wait_with_output().await,
    }
    .map_err(|source| ProcessError::Io {
      context: format!("failed waiting for {}", process.description),
      source,
    })?;
    let elapsed = started.elapsed();
    let exit_code = exit_code(&output.status);

    let store = self.store.clone();
    let capture_root = workdir.clone();
    let outputs: Vec<String> = process
      .output_files
      .iter()
      .chain(&process.output_directories)
      .cloned()
      .collect();
    let output_digest = blocking(move || store.ingest_paths(&capture_root, &outputs)).await?;
    let stdout_digest = self.store.store_file_bytes(output.stdout)?;
    let stderr_digest = self.store.store_file_bytes(output.stderr)?;

    if self.should_keep(exit_code) {
      let kept = sandbox.keep();
      write_run_script(&kept, &workdir, process).await?;
      info!(
        description = %process.description,
        sandbox = %kept.display(),
        exit_code,
        "preserved sandbox"
      );
    }

    debug!(
      description = %process.description,
      exit_code,
      elapsed_ms = elapsed.as_millis() as u64,
      "process finished"
    );

    Ok(FallibleProcessResult {
      exit_code,
      stdout_digest,
      stderr_digest,
      output_digest,
      metadata: ProcessResultMetadata {
        elapsed,
        source: ProcessResultSource::Ran,
        platform: self.platform,
      },
    })
  }
}

#[cfg(unix)]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
  use std::os::unix::process::ExitStatusExt;
  status.code().or_else(|| status.signal().map(|s| -s)).unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: &std::process::ExitStatus) -> i32 {
  status.code().unwrap_or(-1)
}

async fn blocking<T, F>(f: F) -> Result<T, ProcessError>
where
  F: FnOnce() -> Result<T, crate::store::StoreError> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| ProcessError::Io {
      context: "store task panicked".to_string(),
      source: io::Error::other(e),
    })?
    .map_err(ProcessError::from)
}

fn shell_quote(value: &str) -> String {
  format!("'{}'", value.replace('\'', r"'\''"))
}

/// Render a script that replays `process` from inside its preserved sandbox.
fn run_script(sandbox: &Path, workdir: &Path, process: &Process) -> String {
  let relative_workdir = workdir.strip_prefix(sandbox).unwrap_or(Path::new(""));
  let mut script = String::from("#!/bin/sh\n");
  let _ = writeln!(script, "# {}", process.description.replace('\n', " "));
  let _ = writeln!(
    script,
    "cd \"$(dirname \"$0\")\"/{}",
    shell_quote(&relative_workdir.to_string_lossy())
  );
  script.push_str("exec env -i");
  let env: &BTreeMap<String, String> = &process.env;
  for (key, value) in env {
    let _ = write!(script, " {}", shell_quote(&format!("{key}={value}")));
  }
  for arg in &process.argv {
    let _ = write!(script, " {}", shell_quote(arg));
  }
  script.push('\n');
  script
}

async fn write_run_script(sandbox: &Path, workdir: &Path, process: &Process) -> Result<(), ProcessError> {
  let path = sandbox.join(RUN_SCRIPT_NAME);
  tokio::fs::write(&path, run_script(sandbox, workdir, process))
    .await
    .map_err(|source| ProcessError::Io {
      context: format!("failed to write {}", path.display()),
      source,
    })?;
  #[cfg(unix)]
  {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
      .await
      .map_err(|source| ProcessError::Io {
        context: format!("failed to mark {} executable", path.display()),
        source,
      })?;
  }
  Ok(())
}
