//! Built-in rules over the store, the filesystem and processes.
//!
//! These are ordinary rules, so digest arithmetic and process runs are memoized and
//! deduplicated like any other node. Blocking store and filesystem work runs on tokio's
//! blocking pool.

use std::sync::Arc;

use super::context::{RuleContext, arg};
use super::{EngineError, Failure, Value};
use crate::fs::{PathGlobs, Snapshot};
use crate::process::{FallibleProcessResult, Process, ProcessExecutionFailure, ProcessResult};
use crate::rules::{Rule, TypeId};
use crate::store::{CreateEntry, DigestContents, DigestEntries};
use crate::util::hash::Digest;

/// Builds a tree from literal entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CreateDigest(pub Vec<CreateEntry>);

/// Combines trees; overlapping paths must agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeDigests(pub Vec<Digest>);

/// Keeps the parts of `digest` matched by `globs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DigestSubset {
  pub digest: Digest,
  pub globs: PathGlobs,
}

/// Re-roots `digest` at `prefix`, which must contain everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemovePrefix {
  pub digest: Digest,
  pub prefix: String,
}

/// Nests `digest` under `prefix`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddPrefix {
  pub digest: Digest,
  pub prefix: String,
}

async fn blocking<T, F>(work: F) -> Result<T, Failure>
where
  T: Send + 'static,
  F: FnOnce() -> Result<T, Failure> + Send + 'static,
{
  tokio::task::spawn_blocking(work)
    .await
    .map_err(|e| Failure::from(EngineError::Join(e)))?
}

/// Expands globs on disk and records everything consulted, including the globs themselves so
/// that files created later still invalidate the result.
async fn capture(ctx: &RuleContext, globs: Arc<PathGlobs>) -> Result<Snapshot, Failure> {
  ctx.record_glob_dependency(&globs)?;
  let store = ctx.store().clone();
  let root = ctx.context().build_root.clone();
  let ignore = ctx.context().ignore.clone();
  let (snapshot, reads) = blocking(move || Ok(Snapshot::capture(&store, &root, &globs, &ignore)?)).await?;
  for file in &reads.files {
    ctx.record_dependency(file);
  }
  for dir in &reads.dirs {
    ctx.record_dir_listing(dir);
  }
  Ok(snapshot)
}

fn digest_rules() -> Vec<Rule> {
  vec![
    Rule::new("create_digest", TypeId::of::<Digest>())
      .param::<CreateDigest>()
      .run(|ctx, args| async move {
        let request = arg::<CreateDigest>(&args, 0)?;
        let store = ctx.store().clone();
        let digest = blocking(move || Ok(store.store_directory(request.0.clone())?)).await?;
        Ok(Value::new(digest))
      }),
    Rule::new("merge_digests", TypeId::of::<Digest>())
      .param::<MergeDigests>()
      .run(|ctx, args| async move {
        let request = arg::<MergeDigests>(&args, 0)?;
        let store = ctx.store().clone();
        let digest = blocking(move || Ok(store.merge(&request.0)?)).await?;
        Ok(Value::new(digest))
      }),
    Rule::new("digest_subset", TypeId::of::<Digest>())
      .param::<DigestSubset>()
      .run(|ctx, args| async move {
        let request = arg::<DigestSubset>(&args, 0)?;
        let store = ctx.store().clone();
        let digest = blocking(move || Ok(Snapshot::subset(&store, &request.digest, &request.globs)?)).await?;
        Ok(Value::new(digest))
      }),
    Rule::new("remove_prefix", TypeId::of::<Digest>())
      .param::<RemovePrefix>()
      .run(|ctx, args| async move {
        let request = arg::<RemovePrefix>(&args, 0)?;
        let store = ctx.store().clone();
        let digest = blocking(move || Ok(store.strip_prefix(&request.digest, &request.prefix)?)).await?;
        Ok(Value::new(digest))
      }),
    Rule::new("add_prefix", TypeId::of::<Digest>())
      .param::<AddPrefix>()
      .run(|ctx, args| async move {
        let request = arg::<AddPrefix>(&args, 0)?;
        let store = ctx.store().clone();
        let digest = blocking(move || Ok(store.add_prefix(&request.digest, &request.prefix)?)).await?;
        Ok(Value::new(digest))
      }),
    Rule::new("path_globs_to_digest", TypeId::of::<Digest>())
      .param::<PathGlobs>()
      .run(|ctx, args| async move {
        let globs = arg::<PathGlobs>(&args, 0)?;
        let snapshot = capture(&ctx, globs).await?;
        Ok(Value::new(snapshot.digest))
      }),
  ]
}

fn snapshot_rules() -> Vec<Rule> {
  vec![
    Rule::new("digest_to_snapshot", TypeId::of::<Snapshot>())
      .param::<Digest>()
      .run(|ctx, args| async move {
        let digest = arg::<Digest>(&args, 0)?;
        let store = ctx.store().clone();
        let snapshot = blocking(move || Ok(Snapshot::from_digest(&store, *digest)?)).await?;
        Ok(Value::new(snapshot))
      }),
    Rule::new("digest_contents", TypeId::of::<DigestContents>())
      .param::<Digest>()
      .run(|ctx, args| async move {
        let digest = arg::<Digest>(&args, 0)?;
        let store = ctx.store().clone();
        let contents = blocking(move || Ok(store.contents(&digest)?)).await?;
        Ok(Value::new(contents))
      }),
    Rule::new("digest_entries", TypeId::of::<DigestEntries>())
      .param::<Digest>()
      .run(|ctx, args| async move {
        let digest = arg::<Digest>(&args, 0)?;
        let store = ctx.store().clone();
        let entries = blocking(move || Ok(store.entries(&digest)?)).await?;
        Ok(Value::new(entries))
      }),
  ]
}

fn process_rules() -> Vec<Rule> {
  vec![
    Rule::new("run_process", TypeId::of::<FallibleProcessResult>())
      .param::<Process>()
      .uncacheable_when(|params| {
        params
          .get::<Process>()
          .is_some_and(|process| process.cache_scope.is_per_session())
      })
      .run(|ctx, args| async move {
        let process = arg::<Process>(&args, 0)?;
        let runner = Arc::clone(&ctx.context().command_runner);
        let result = runner.run(&process).await?;
        if !process.cache_scope.caches(result.exit_code) {
          ctx.mark_uncacheable();
        }
        Ok(Value::new(result))
      }),
    Rule::new("require_success", TypeId::of::<ProcessResult>())
      .param::<Process>()
      .param::<FallibleProcessResult>()
      .run(|ctx, args| async move {
        let process = arg::<Process>(&args, 0)?;
        let result = arg::<FallibleProcessResult>(&args, 1)?;
        let store = ctx.store().clone();
        let (stdout_digest, stderr_digest) = (result.stdout_digest, result.stderr_digest);
        let (stdout, stderr) = blocking(move || {
          Ok((
            store.load_file_bytes(&stdout_digest)?,
            store.load_file_bytes(&stderr_digest)?,
          ))
        })
        .await?;

        if result.exit_code != 0 {
          return Err(Failure::from(ProcessExecutionFailure {
            exit_code: result.exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            description: process.description.clone(),
          }));
        }
        Ok(Value::new(ProcessResult {
          stdout,
          stderr,
          output_digest: result.output_digest,
          metadata: result.metadata.clone(),
        }))
      }),
  ]
}

/// Every built-in rule, ready for [`RuleGraphBuilder::rules`](crate::rules::RuleGraphBuilder::rules).
pub fn intrinsics() -> Vec<Rule> {
  let mut rules = digest_rules();
  rules.extend(snapshot_rules());
  rules.extend(process_rules());
  rules
}
