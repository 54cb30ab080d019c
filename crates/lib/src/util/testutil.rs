//! Test utilities for cairn-lib.
//!
//! Helpers for tests that run real subprocesses through the sandbox.

use std::collections::BTreeMap;

use crate::process::Process;
use crate::store::EMPTY_DIRECTORY_DIGEST;
use crate::util::hash::Digest;

/// Returns argv that runs `script` under `/bin/sh -c`.
pub fn shell_argv(script: &str) -> Vec<String> {
  vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
}

/// A process running `script` against an empty input tree.
pub fn shell_process(script: &str) -> Process {
  shell_process_with_input(script, *EMPTY_DIRECTORY_DIGEST)
}

/// A process running `script` with `input_digest` materialized in its sandbox.
pub fn shell_process_with_input(script: &str, input_digest: Digest) -> Process {
  Process::new(shell_argv(script))
    .input_digest(input_digest)
    .env(BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]))
    .description(format!("sh -c {script:?}"))
}
