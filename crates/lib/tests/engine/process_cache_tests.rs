//! How process results are reused across sessions, with a runner that only counts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cairn_lib::engine::{EngineContext, Scheduler, Value, intrinsics};
use cairn_lib::platform::Platform;
use cairn_lib::process::{
  CommandRunner, FallibleProcessResult, Process, ProcessCacheScope, ProcessError, ProcessResultMetadata,
  ProcessResultSource,
};
use cairn_lib::rules::{RuleGraphBuilder, TypeId};
use cairn_lib::util::hash::EMPTY_DIGEST;
use tempfile::TempDir;

use super::common::{Counter, context};

/// Returns `exit_code` for every process without running anything.
struct FixedExit {
  exit_code: i32,
  runs: Counter,
}

#[async_trait]
impl CommandRunner for FixedExit {
  async fn run(&self, _process: &Process) -> Result<FallibleProcessResult, ProcessError> {
    self.runs.bump();
    Ok(FallibleProcessResult {
      exit_code: self.exit_code,
      stdout_digest: EMPTY_DIGEST,
      stderr_digest: EMPTY_DIGEST,
      output_digest: EMPTY_DIGEST,
      metadata: ProcessResultMetadata {
        elapsed: Duration::ZERO,
        source: ProcessResultSource::Ran,
        platform: Platform::current().unwrap(),
      },
    })
  }
}

fn fixed_scheduler(root: &TempDir, exit_code: i32, runs: &Counter) -> Scheduler {
  let rules = RuleGraphBuilder::new()
    .rules(intrinsics())
    .query::<FallibleProcessResult>(&[TypeId::of::<Process>()])
    .build()
    .unwrap();
  let runner = Arc::new(FixedExit {
    exit_code,
    runs: runs.clone(),
  });
  let context: EngineContext = context(root.path()).with_command_runner(runner);
  Scheduler::new(rules, context)
}

fn process(scope: ProcessCacheScope) -> Process {
  Process::new(vec!["compile".to_string()]).cache_scope(scope)
}

async fn run_in_two_sessions(scheduler: &Scheduler, process: Process) {
  for _ in 0..2 {
    let session = scheduler.session();
    for _ in 0..2 {
      session
        .request::<FallibleProcessResult>(vec![Value::new(process.clone())])
        .await
        .unwrap();
    }
  }
}

#[tokio::test]
async fn failed_result_is_not_reused_by_later_sessions() {
  let root = TempDir::new().unwrap();
  let runs = Counter::default();
  let scheduler = fixed_scheduler(&root, 1, &runs);

  run_in_two_sessions(&scheduler, process(ProcessCacheScope::Successful)).await;
  assert_eq!(runs.get(), 2);
}

#[tokio::test]
async fn failed_result_is_reused_when_every_result_is_cached() {
  let root = TempDir::new().unwrap();
  let runs = Counter::default();
  let scheduler = fixed_scheduler(&root, 1, &runs);

  run_in_two_sessions(&scheduler, process(ProcessCacheScope::Always)).await;
  assert_eq!(runs.get(), 1);
}

#[tokio::test]
async fn successful_result_is_reused_by_later_sessions() {
  let root = TempDir::new().unwrap();
  let runs = Counter::default();
  let scheduler = fixed_scheduler(&root, 0, &runs);

  run_in_two_sessions(&scheduler, process(ProcessCacheScope::PerRestartSuccessful)).await;
  assert_eq!(runs.get(), 1);
}

#[tokio::test]
async fn never_cached_process_runs_once_per_session() {
  let root = TempDir::new().unwrap();
  let runs = Counter::default();
  let scheduler = fixed_scheduler(&root, 0, &runs);

  run_in_two_sessions(&scheduler, process(ProcessCacheScope::Never)).await;
  assert_eq!(runs.get(), 2);
}
