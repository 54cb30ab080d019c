//! Algebraic properties of digest operations over generated trees.

use std::collections::BTreeMap;

use cairn_lib::fs::PathGlobs;
use cairn_lib::store::{CreateEntry, Store};
use proptest::prelude::*;

const DIRS: [&str; 4] = ["", "a", "b", "a/c"];

fn tree() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
  let path = (0..DIRS.len(), 0..3_usize).prop_map(|(dir, file)| match DIRS[dir] {
    "" => format!("f{file}"),
    dir => format!("{dir}/f{file}"),
  });
  prop::collection::btree_map(path, prop::collection::vec(any::<u8>(), 0..8), 0..10)
}

fn entries<'a>(files: impl IntoIterator<Item = (&'a String, &'a Vec<u8>)>) -> Vec<CreateEntry> {
  files
    .into_iter()
    .map(|(path, content)| CreateEntry::file(path.clone(), content.clone()))
    .collect()
}

proptest! {
  #[test]
  fn merge_is_associative(
    (files, parts) in tree().prop_flat_map(|files| {
      let len = files.len();
      (Just(files), prop::collection::vec(0..3_usize, len))
    })
  ) {
    let store = Store::in_memory();
    let digests: Vec<_> = (0..3)
      .map(|part| {
        let chosen = files.iter().zip(&parts).filter(|(_, p)| **p == part).map(|(file, _)| file);
        store.store_directory(entries(chosen)).unwrap()
      })
      .collect();

    let left = store.merge(&[store.merge(&digests[0..2]).unwrap(), digests[2]]).unwrap();
    let right = store.merge(&[digests[0], store.merge(&digests[1..3]).unwrap()]).unwrap();
    let whole = store.store_directory(entries(&files)).unwrap();
    prop_assert_eq!(left, right);
    prop_assert_eq!(left, whole);
  }

  #[test]
  fn subset_and_its_complement_rebuild_the_tree(files in tree()) {
    let store = Store::in_memory();
    let digest = store.store_directory(entries(&files)).unwrap();

    let inside = PathGlobs::new(vec!["a".to_string()]).matcher().unwrap();
    let outside = PathGlobs::new(vec!["**".to_string(), "!a".to_string()]).matcher().unwrap();
    let inside = store.subset(&digest, &inside).unwrap();
    let outside = store.subset(&digest, &outside).unwrap();

    prop_assert_eq!(store.merge(&[inside, outside]).unwrap(), digest);
  }
}
