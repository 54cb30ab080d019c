//! Built-in digest and snapshot rules, driven through a scheduler.

use cairn_lib::engine::{AddPrefix, CreateDigest, DigestSubset, MergeDigests, RemovePrefix, Scheduler, Value, intrinsics};
use cairn_lib::fs::{PathGlobs, Snapshot, SnapshotError};
use cairn_lib::rules::{RuleGraphBuilder, TypeId};
use cairn_lib::store::{CreateEntry, DigestContents, DigestEntries, DigestEntry, StoreError};
use cairn_lib::util::hash::Digest;
use tempfile::TempDir;

use super::common::{scheduler, write};

fn intrinsic_scheduler(root: &TempDir) -> Scheduler {
  let builder = RuleGraphBuilder::new()
    .rules(intrinsics())
    .query::<Digest>(&[TypeId::of::<CreateDigest>()])
    .query::<Digest>(&[TypeId::of::<MergeDigests>()])
    .query::<Digest>(&[TypeId::of::<DigestSubset>()])
    .query::<Digest>(&[TypeId::of::<AddPrefix>()])
    .query::<Digest>(&[TypeId::of::<RemovePrefix>()])
    .query::<Digest>(&[TypeId::of::<PathGlobs>()])
    .query::<Snapshot>(&[TypeId::of::<PathGlobs>()])
    .query::<Snapshot>(&[TypeId::of::<Digest>()])
    .query::<DigestContents>(&[TypeId::of::<Digest>()])
    .query::<DigestEntries>(&[TypeId::of::<Digest>()]);
  scheduler(builder, root.path())
}

async fn create(scheduler: &Scheduler, entries: Vec<CreateEntry>) -> Digest {
  *scheduler
    .session()
    .request::<Digest>(vec![Value::new(CreateDigest(entries))])
    .await
    .unwrap()
}

#[tokio::test]
async fn created_digests_read_back() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);
  let digest = create(
    &scheduler,
    vec![
      CreateEntry::file("a.txt", "A"),
      CreateEntry::executable("bin/run", "#!/bin/sh\n"),
    ],
  )
  .await;

  let contents = scheduler
    .session()
    .request::<DigestContents>(vec![Value::new(digest)])
    .await
    .unwrap();
  assert_eq!(contents.len(), 2);
  assert_eq!(&contents.get("a.txt").unwrap().content[..], b"A");
  assert!(contents.get("bin/run").unwrap().is_executable);

  let snapshot = scheduler
    .session()
    .request::<Snapshot>(vec![Value::new(digest)])
    .await
    .unwrap();
  assert_eq!(snapshot.files, vec!["a.txt", "bin/run"]);
  assert_eq!(snapshot.dirs, vec!["bin"]);
}

#[tokio::test]
async fn same_content_yields_same_digest() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);
  let forward = create(
    &scheduler,
    vec![CreateEntry::file("x/1", "one"), CreateEntry::file("y/2", "two")],
  )
  .await;
  let backward = create(
    &scheduler,
    vec![CreateEntry::file("y/2", "two"), CreateEntry::file("x/1", "one")],
  )
  .await;
  assert_eq!(forward, backward);
}

#[tokio::test]
async fn empty_directories_are_listed_as_entries() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);
  let digest = create(
    &scheduler,
    vec![CreateEntry::directory("empty"), CreateEntry::file("full/f", "f")],
  )
  .await;

  let entries = scheduler
    .session()
    .request::<DigestEntries>(vec![Value::new(digest)])
    .await
    .unwrap();
  let paths: Vec<&str> = entries.0.iter().map(DigestEntry::path).collect();
  assert_eq!(paths, vec!["empty", "full/f"]);
  assert!(matches!(entries.0[0], DigestEntry::EmptyDirectory { .. }));
}

#[tokio::test]
async fn merging_conflicting_files_fails() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);
  let left = create(&scheduler, vec![CreateEntry::file("same.txt", "left")]).await;
  let right = create(&scheduler, vec![CreateEntry::file("same.txt", "right")]).await;
  let shared = create(&scheduler, vec![CreateEntry::file("same.txt", "left")]).await;

  let merged = scheduler
    .session()
    .request::<Digest>(vec![Value::new(MergeDigests(vec![left, shared]))])
    .await
    .unwrap();
  assert_eq!(*merged, left);

  let err = scheduler
    .session()
    .request::<Digest>(vec![Value::new(MergeDigests(vec![left, right]))])
    .await
    .unwrap_err();
  assert!(
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::MergeCollision { path, .. }) if path == "same.txt"),
    "{err:?}"
  );
}

#[tokio::test]
async fn prefixes_add_and_remove() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);
  let session = scheduler.session();
  let digest = create(&scheduler, vec![CreateEntry::file("lib.rs", "")]).await;

  let nested = *session
    .request::<Digest>(vec![Value::new(AddPrefix {
      digest,
      prefix: "crates/core".to_string(),
    })])
    .await
    .unwrap();
  let snapshot = session.request::<Snapshot>(vec![Value::new(nested)]).await.unwrap();
  assert_eq!(snapshot.files, vec!["crates/core/lib.rs"]);

  let restored = session
    .request::<Digest>(vec![Value::new(RemovePrefix {
      digest: nested,
      prefix: "crates/core".to_string(),
    })])
    .await
    .unwrap();
  assert_eq!(*restored, digest);

  let err = session
    .request::<Digest>(vec![Value::new(RemovePrefix {
      digest: nested,
      prefix: "elsewhere".to_string(),
    })])
    .await
    .unwrap_err();
  assert!(
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::PrefixNotFound { .. })),
    "{err:?}"
  );
}

#[tokio::test]
async fn subsets_keep_matching_paths() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);
  let digest = create(
    &scheduler,
    vec![
      CreateEntry::file("README.md", "#"),
      CreateEntry::file("src/lib.rs", ""),
      CreateEntry::file("src/notes.txt", ""),
    ],
  )
  .await;

  let subset = *scheduler
    .session()
    .request::<Digest>(vec![Value::new(DigestSubset {
      digest,
      globs: PathGlobs::new(vec!["src/**/*.rs".to_string()]),
    })])
    .await
    .unwrap();
  let snapshot = scheduler
    .session()
    .request::<Snapshot>(vec![Value::new(subset)])
    .await
    .unwrap();
  assert_eq!(snapshot.files, vec!["src/lib.rs"]);
}

#[tokio::test]
async fn snapshots_capture_the_build_root() {
  let root = TempDir::new().unwrap();
  write(root.path(), "src/main.rs", "fn main() {}");
  write(root.path(), "src/util/mod.rs", "");
  write(root.path(), "target/debug/junk", "");
  let scheduler = intrinsic_scheduler(&root);
  let session = scheduler.session();

  let snapshot = session
    .request::<Snapshot>(vec![Value::new(PathGlobs::new(vec![
      "**/*.rs".to_string(),
      "!target".to_string(),
    ]))])
    .await
    .unwrap();
  assert_eq!(snapshot.files, vec!["src/main.rs", "src/util/mod.rs"]);

  // The snapshot is built from this same capture.
  let digest = session
    .request::<Digest>(vec![Value::new(PathGlobs::new(vec![
      "**/*.rs".to_string(),
      "!target".to_string(),
    ]))])
    .await
    .unwrap();
  assert_eq!(*digest, snapshot.digest);
}

#[tokio::test]
async fn single_star_snapshot_stays_at_the_top_level() {
  let root = TempDir::new().unwrap();
  write(root.path(), "top.txt", "top");
  write(root.path(), "src/deep/lib.rs", "");
  let scheduler = intrinsic_scheduler(&root);

  let snapshot = scheduler
    .session()
    .request::<Snapshot>(vec![Value::new(PathGlobs::new(vec!["*".to_string()]))])
    .await
    .unwrap();
  assert_eq!(snapshot.files, vec!["top.txt"]);
  assert_eq!(snapshot.dirs, vec!["src"]);
}

#[tokio::test]
async fn unmatched_globs_can_be_errors() {
  let root = TempDir::new().unwrap();
  let scheduler = intrinsic_scheduler(&root);

  let globs = PathGlobs::new(vec!["missing/*.rs".to_string()]).error_on_unmatched("the test target");
  let err = scheduler
    .session()
    .request::<Snapshot>(vec![Value::new(globs)])
    .await
    .unwrap_err();
  assert!(
    matches!(err.downcast_ref::<SnapshotError>(), Some(SnapshotError::UnmatchedGlob { origin, .. }) if origin == "the test target"),
    "{err:?}"
  );

  let lenient = scheduler
    .session()
    .request::<Snapshot>(vec![Value::new(PathGlobs::new(vec!["missing/*.rs".to_string()]))])
    .await
    .unwrap();
  assert!(lenient.files.is_empty());
}
