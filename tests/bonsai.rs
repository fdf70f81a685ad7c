//! End-to-end tests over the public API.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bonsai::{
    AtomicOperationsManager, BonsaiError, BonsaiOptions, BonsaiTree, Change, PageCache, RecordId,
};
use tempfile::tempdir;

fn open_stack(dir: &Path) -> Arc<AtomicOperationsManager> {
    let options = BonsaiOptions {
        page_size: 4096,
        bucket_size: 256,
        free_space_reuse_trigger: 0.2,
        cache_pages: 64,
    };
    let cache = Arc::new(PageCache::new(dir, options).unwrap());
    Arc::new(AtomicOperationsManager::new(cache))
}

#[test]
fn put_get_remove_laws() {
    let dir = tempdir().unwrap();
    let atomics = open_stack(dir.path());
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "laws.sbt", 0).unwrap();

    // put; put; get observes the second value.
    assert!(tree.put(&1, &10).unwrap());
    assert!(tree.put(&1, &20).unwrap());
    assert_eq!(tree.get(&1).unwrap(), Some(20));

    // put; remove; get observes nothing.
    assert!(tree.put(&2, &22).unwrap());
    assert_eq!(tree.remove(&2).unwrap(), Some(22));
    assert_eq!(tree.get(&2).unwrap(), None);

    // Re-putting an identical value reports "not modified".
    assert!(!tree.put(&1, &20).unwrap());
    assert_eq!(tree.size().unwrap(), 1);
}

#[test]
fn persists_across_cache_instances() {
    let dir = tempdir().unwrap();
    let root;
    {
        let atomics = open_stack(dir.path());
        let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "persist.sbt", 3).unwrap();
        for key in 0..100u64 {
            tree.put(&key, &(key * 3)).unwrap();
        }
        root = tree.root_pointer();
        tree.close(true).unwrap();
    }

    let atomics = open_stack(dir.path());
    let tree: BonsaiTree<u64, u64> = BonsaiTree::load(&atomics, "persist.sbt", root)
        .unwrap()
        .expect("tree still lives at its root pointer");
    assert_eq!(tree.size().unwrap(), 100);
    assert_eq!(tree.identifier().unwrap(), 3);
    for key in 0..100u64 {
        assert_eq!(tree.get(&key).unwrap(), Some(key * 3));
    }
    assert_eq!(tree.first_key().unwrap(), Some(0));
    assert_eq!(tree.last_key().unwrap(), Some(99));
}

#[test]
fn clear_keeps_the_tree_usable() {
    let dir = tempdir().unwrap();
    let atomics = open_stack(dir.path());
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "clear.sbt", 5).unwrap();
    for key in 0..50u64 {
        tree.put(&key, &key).unwrap();
    }
    let root = tree.root_pointer();

    tree.clear().unwrap();
    assert_eq!(tree.size().unwrap(), 0);
    assert_eq!(tree.get(&25).unwrap(), None);
    assert_eq!(tree.root_pointer(), root);
    assert_eq!(tree.identifier().unwrap(), 5);

    assert!(tree.put(&7, &70).unwrap());
    assert_eq!(tree.get(&7).unwrap(), Some(70));
}

#[test]
fn many_trees_cohabit_one_file() {
    let dir = tempdir().unwrap();
    let atomics = open_stack(dir.path());

    let mut trees = Vec::new();
    for identifier in 0..16u64 {
        let tree: BonsaiTree<u64, u64> =
            BonsaiTree::create(&atomics, "bags.sbt", identifier).unwrap();
        trees.push(tree);
    }
    for (index, tree) in trees.iter().enumerate() {
        for key in 0..20u64 {
            tree.put(&key, &(key + index as u64 * 1_000)).unwrap();
        }
    }
    for (index, tree) in trees.iter().enumerate() {
        assert_eq!(tree.size().unwrap(), 20);
        assert_eq!(tree.identifier().unwrap(), index as u64);
        assert_eq!(tree.get(&10).unwrap(), Some(10 + index as u64 * 1_000));
    }

    // All roots are distinct addresses within the same file.
    let file_id = trees[0].file_id();
    let mut roots: Vec<_> = trees.iter().map(|t| t.root_pointer()).collect();
    roots.sort_by_key(|p| (p.page_index, p.page_offset));
    roots.dedup();
    assert_eq!(roots.len(), 16);
    assert!(trees.iter().all(|t| t.file_id() == file_id));
}

#[test]
fn deleted_tree_loads_as_none_and_buckets_recycle() {
    let dir = tempdir().unwrap();
    let atomics = open_stack(dir.path());
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "del.sbt", 0).unwrap();
    for key in 0..100u64 {
        tree.put(&key, &key).unwrap();
    }
    let root = tree.root_pointer();
    tree.delete().unwrap();

    assert!(BonsaiTree::<u64, u64>::load(&atomics, "del.sbt", root)
        .unwrap()
        .is_none());

    // A fresh tree in the same file keeps working on recycled space.
    let fresh: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "del.sbt", 0).unwrap();
    for key in 0..100u64 {
        fresh.put(&key, &(key * 2)).unwrap();
    }
    assert_eq!(fresh.size().unwrap(), 100);
    assert_eq!(fresh.get(&99).unwrap(), Some(198));
}

#[test]
fn rid_bag_workload_with_record_ids() {
    let dir = tempdir().unwrap();
    let atomics = open_stack(dir.path());
    let bag: BonsaiTree<RecordId, i32> = BonsaiTree::create(&atomics, "rids.sbt", 41).unwrap();

    for position in 0..30i64 {
        bag.put(&RecordId::new(12, position), &1).unwrap();
    }
    bag.put(&RecordId::new(12, 5), &3).unwrap();
    assert_eq!(bag.get(&RecordId::new(12, 5)).unwrap(), Some(3));
    assert_eq!(bag.size().unwrap(), 30);

    // Pending changes overlay the stored counters.
    let mut changes = HashMap::new();
    changes.insert(RecordId::new(12, 0), Change::Diff(2));
    changes.insert(RecordId::new(12, 5), Change::Absolute(1));
    changes.insert(RecordId::new(99, 7), Change::Diff(4));
    // Stored: 29 x 1 + 1 x 3 = 32. Overlay: +2, 3 -> 1, +4 for an absent key.
    assert_eq!(bag.real_bag_size(&changes).unwrap(), 32 + 2 - 2 + 4);

    // An empty bag short-circuits to the pending changes alone.
    let empty: BonsaiTree<RecordId, i32> = BonsaiTree::create(&atomics, "rids.sbt", 0).unwrap();
    assert_eq!(empty.real_bag_size(&HashMap::new()).unwrap(), 0);
    let mut pending = HashMap::new();
    pending.insert(RecordId::new(1, 1), Change::Diff(5));
    pending.insert(RecordId::new(1, 2), Change::Absolute(2));
    assert_eq!(empty.real_bag_size(&pending).unwrap(), 7);
}

#[test]
fn descending_scan_is_a_usage_error() {
    let dir = tempdir().unwrap();
    let atomics = open_stack(dir.path());
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "desc.sbt", 0).unwrap();
    tree.put(&1, &1).unwrap();
    let err = tree
        .load_entries_major(&0, true, false, |_, _| true)
        .unwrap_err();
    assert!(matches!(err, BonsaiError::Usage(_)));
}
