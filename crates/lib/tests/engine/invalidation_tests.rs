//! Filesystem-driven invalidation.

use std::time::Duration;

use cairn_lib::engine::{Value, arg, intrinsics};
use cairn_lib::fs::{PathGlobs, Snapshot};
use cairn_lib::rules::{Rule, RuleGraphBuilder, TypeId};
use cairn_lib::store::DigestContents;
use cairn_lib::util::hash::Digest;
use tempfile::TempDir;

use super::common::{Counter, map_rule, scheduler, write};

/// `read_config` depends on `config.txt`; `constant` depends on nothing on disk.
fn reader_builder(reads: &Counter, constants: &Counter) -> RuleGraphBuilder {
  let read_config = {
    let reads = reads.clone();
    Rule::new("read_config", TypeId::of::<String>())
      .param::<i64>()
      .get::<Snapshot, PathGlobs>()
      .get::<DigestContents, Digest>()
      .run(move |ctx, _args| {
        let reads = reads.clone();
        async move {
          reads.bump();
          let snapshot = ctx
            .get::<Snapshot, PathGlobs>(PathGlobs::new(vec!["config.txt".to_string()]))
            .await?;
          let contents = ctx.get::<DigestContents, Digest>(snapshot.digest).await?;
          let text = contents
            .iter()
            .map(|file| String::from_utf8_lossy(&file.content).into_owned())
            .collect::<String>();
          Ok(Value::new(text))
        }
      })
  };
  RuleGraphBuilder::new()
    .rules(intrinsics())
    .rule(read_config)
    .rule(map_rule::<i64, u8, _>("constant", constants, |_| 7))
    .query::<String>(&[TypeId::of::<i64>()])
    .query::<u8>(&[TypeId::of::<i64>()])
}

#[tokio::test]
async fn changed_file_reruns_only_its_dependents() {
  let root = TempDir::new().unwrap();
  write(root.path(), "config.txt", "v1");
  let (reads, constants) = (Counter::default(), Counter::default());
  let scheduler = scheduler(reader_builder(&reads, &constants), root.path());

  let session = scheduler.session();
  assert_eq!(*session.request::<String>(vec![Value::new(0_i64)]).await.unwrap(), "v1");
  assert_eq!(*session.request::<u8>(vec![Value::new(0_i64)]).await.unwrap(), 7);

  write(root.path(), "config.txt", "v2");
  let result = scheduler.invalidate(&["config.txt"]);
  assert!(result.cleared >= 2, "{result:?}");

  let session = scheduler.session();
  assert_eq!(*session.request::<String>(vec![Value::new(0_i64)]).await.unwrap(), "v2");
  assert_eq!(*session.request::<u8>(vec![Value::new(0_i64)]).await.unwrap(), 7);
  assert_eq!((reads.get(), constants.get()), (2, 1));
}

#[tokio::test]
async fn unrelated_paths_invalidate_nothing() {
  let root = TempDir::new().unwrap();
  write(root.path(), "config.txt", "v1");
  write(root.path(), "other/notes.txt", "n");
  let (reads, constants) = (Counter::default(), Counter::default());
  let scheduler = scheduler(reader_builder(&reads, &constants), root.path());

  scheduler
    .session()
    .request::<String>(vec![Value::new(0_i64)])
    .await
    .unwrap();
  let result = scheduler.invalidate(&["other/notes.txt"]);
  assert_eq!(result.total(), 0);

  scheduler
    .session()
    .request::<String>(vec![Value::new(0_i64)])
    .await
    .unwrap();
  assert_eq!(reads.get(), 1);
}

#[tokio::test]
async fn new_files_matching_a_glob_invalidate_it() {
  let root = TempDir::new().unwrap();
  write(root.path(), "src/a.rs", "fn a() {}");
  let builder = RuleGraphBuilder::new()
    .rules(intrinsics())
    .query::<Snapshot>(&[TypeId::of::<PathGlobs>()]);
  let scheduler = scheduler(builder, root.path());
  let globs = || vec![Value::new(PathGlobs::new(vec!["src/*.rs".to_string()]))];

  let before = scheduler.session().request::<Snapshot>(globs()).await.unwrap();
  assert_eq!(before.files, vec!["src/a.rs"]);

  write(root.path(), "src/b.rs", "fn b() {}");
  let result = scheduler.invalidate(&["src/b.rs"]);
  assert!(result.total() >= 1, "{result:?}");

  let after = scheduler.session().request::<Snapshot>(globs()).await.unwrap();
  assert_eq!(after.files, vec!["src/a.rs", "src/b.rs"]);
  assert_ne!(before.digest, after.digest);
}

#[tokio::test]
async fn invalidate_all_clears_every_node() {
  let root = TempDir::new().unwrap();
  let counter = Counter::default();
  let builder = RuleGraphBuilder::new()
    .rule(map_rule::<i64, String, _>("to_string", &counter, |n| n.to_string()))
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());

  scheduler.session().request::<String>(vec![Value::new(1_i64)]).await.unwrap();
  scheduler.session().request::<String>(vec![Value::new(2_i64)]).await.unwrap();
  let result = scheduler.invalidate_all();
  assert_eq!(result.cleared, 2);

  scheduler.session().request::<String>(vec![Value::new(1_i64)]).await.unwrap();
  assert_eq!(counter.get(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_nodes_restart_when_their_inputs_change() {
  let root = TempDir::new().unwrap();
  write(root.path(), "slow.txt", "old");
  let counter = Counter::default();
  let slow_read = {
    let counter = counter.clone();
    Rule::new("slow_read", TypeId::of::<String>())
      .param::<i64>()
      .run(move |ctx, args| {
        let counter = counter.clone();
        async move {
          arg::<i64>(&args, 0)?;
          counter.bump();
          ctx.record_dependency("slow.txt");
          let path = ctx.context().build_root.join("slow.txt");
          let text = std::fs::read_to_string(path).map_err(cairn_lib::engine::Failure::throw)?;
          tokio::time::sleep(Duration::from_millis(100)).await;
          Ok(Value::new(text))
        }
      })
  };
  let builder = RuleGraphBuilder::new()
    .rule(slow_read)
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());

  let session = scheduler.session();
  let pending = tokio::spawn(async move { session.request::<String>(vec![Value::new(1_i64)]).await });
  tokio::time::sleep(Duration::from_millis(30)).await;

  write(root.path(), "slow.txt", "new");
  let result = scheduler.invalidate(&["slow.txt"]);
  assert_eq!(result.restarted, 1);

  let value = pending.await.unwrap().unwrap();
  assert_eq!(*value, "new");
  assert_eq!(counter.get(), 2);
}

/// Reads `pointer.txt`, then the file it names, recording both reads itself.
fn follow_pointer(runs: &Counter) -> Rule {
  let runs = runs.clone();
  Rule::new("follow_pointer", TypeId::of::<String>())
    .param::<i64>()
    .run(move |ctx, _args| {
      let runs = runs.clone();
      async move {
        runs.bump();
        let root = ctx.context().build_root.clone();
        ctx.record_dependency("pointer.txt");
        let target = std::fs::read_to_string(root.join("pointer.txt")).unwrap();
        let target = target.trim().to_string();
        ctx.record_dependency(&target);
        let text = std::fs::read_to_string(root.join(&target)).unwrap();
        Ok(Value::new(text))
      }
    })
}

#[tokio::test]
async fn paths_no_longer_read_stop_invalidating() {
  let root = TempDir::new().unwrap();
  write(root.path(), "pointer.txt", "a.txt");
  write(root.path(), "a.txt", "from a");
  write(root.path(), "b.txt", "from b");
  let runs = Counter::default();
  let builder = RuleGraphBuilder::new()
    .rule(follow_pointer(&runs))
    .query::<String>(&[TypeId::of::<i64>()]);
  let scheduler = scheduler(builder, root.path());
  let request = || vec![Value::new(0_i64)];

  assert_eq!(*scheduler.session().request::<String>(request()).await.unwrap(), "from a");

  write(root.path(), "pointer.txt", "b.txt");
  assert_eq!(scheduler.invalidate(&["pointer.txt"]).cleared, 1);
  assert_eq!(*scheduler.session().request::<String>(request()).await.unwrap(), "from b");

  write(root.path(), "a.txt", "changed");
  assert_eq!(scheduler.invalidate(&["a.txt"]).total(), 0);
  assert_eq!(*scheduler.session().request::<String>(request()).await.unwrap(), "from b");
  assert_eq!(runs.get(), 2);

  assert_eq!(scheduler.invalidate(&["b.txt"]).cleared, 1);
}
