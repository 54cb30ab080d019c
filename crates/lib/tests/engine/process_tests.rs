//! Processes run through the engine, with the local runner and its cache.

use std::collections::BTreeMap;

use cairn_lib::engine::{Scheduler, Value, intrinsics};
use cairn_lib::process::{
  FallibleProcessResult, Process, ProcessExecutionFailure, ProcessResult, ProcessResultSource,
};
use cairn_lib::rules::{RuleGraphBuilder, TypeId};
use cairn_lib::store::DigestContents;
use cairn_lib::util::hash::Digest;
use tempfile::TempDir;

use super::common::scheduler;

fn process_scheduler(root: &TempDir) -> Scheduler {
  let builder = RuleGraphBuilder::new()
    .rules(intrinsics())
    .query::<ProcessResult>(&[TypeId::of::<Process>()])
    .query::<FallibleProcessResult>(&[TypeId::of::<Process>()])
    .query::<DigestContents>(&[TypeId::of::<Digest>()]);
  scheduler(builder, root.path())
}

fn shell(script: &str) -> Process {
  Process::new(vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()])
    .env(BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]))
    .description(format!("sh -c {script:?}"))
}

#[tokio::test]
async fn successful_process_output_is_loaded() {
  let root = TempDir::new().unwrap();
  let scheduler = process_scheduler(&root);

  let result = scheduler
    .session()
    .request::<ProcessResult>(vec![Value::new(shell("echo hello"))])
    .await
    .unwrap();
  assert_eq!(&result.stdout[..], b"hello\n");
  assert!(result.stderr.is_empty());
}

#[tokio::test]
async fn declared_outputs_are_captured() {
  let root = TempDir::new().unwrap();
  let scheduler = process_scheduler(&root);
  let process = shell("mkdir -p out && printf hi > out/a.txt").output_directories(["out"]);

  let session = scheduler.session();
  let result = session
    .request::<ProcessResult>(vec![Value::new(process)])
    .await
    .unwrap();
  let contents = session
    .request::<DigestContents>(vec![Value::new(result.output_digest)])
    .await
    .unwrap();
  assert_eq!(&contents.get("out/a.txt").unwrap().content[..], b"hi");
}

#[tokio::test]
async fn runner_cache_survives_node_invalidation() {
  let root = TempDir::new().unwrap();
  let scheduler = process_scheduler(&root);
  let request = || vec![Value::new(shell("echo cached"))];

  let first = scheduler
    .session()
    .request::<FallibleProcessResult>(request())
    .await
    .unwrap();
  assert_eq!(first.metadata.source, ProcessResultSource::Ran);

  scheduler.invalidate_all();
  let second = scheduler
    .session()
    .request::<FallibleProcessResult>(request())
    .await
    .unwrap();
  assert_eq!(second.metadata.source, ProcessResultSource::HitMemory);
  assert_eq!(second.stdout_digest, first.stdout_digest);

  // Any change to the environment is a different cache key.
  let changed = shell("echo cached").env(BTreeMap::from([
    ("PATH".to_string(), "/usr/bin:/bin".to_string()),
    ("EXTRA".to_string(), "1".to_string()),
  ]));
  let third = scheduler
    .session()
    .request::<FallibleProcessResult>(vec![Value::new(changed)])
    .await
    .unwrap();
  assert_eq!(third.metadata.source, ProcessResultSource::Ran);
}

#[tokio::test]
async fn non_zero_exit_is_a_failure_only_when_success_is_required() {
  let root = TempDir::new().unwrap();
  let scheduler = process_scheduler(&root);
  let process = shell("echo broken >&2; exit 3");
  let session = scheduler.session();

  let fallible = session
    .request::<FallibleProcessResult>(vec![Value::new(process.clone())])
    .await
    .unwrap();
  assert_eq!(fallible.exit_code, 3);

  let err = session
    .request::<ProcessResult>(vec![Value::new(process)])
    .await
    .unwrap_err();
  let failure = err
    .downcast_ref::<ProcessExecutionFailure>()
    .expect("a process execution failure");
  assert_eq!(failure.exit_code, 3);
  assert_eq!(failure.stderr, "broken\n");
}
