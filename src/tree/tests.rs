use std::collections::BTreeMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use super::alloc::SYS_BUCKET;
use super::bucket::BonsaiBucket;
use super::sys_bucket::SysBucket;
use super::BonsaiTree;
use crate::cache::{AtomicOperationsManager, PageCache};
use crate::codecs::RecordId;
use crate::config::BonsaiOptions;
use crate::error::BonsaiError;
use crate::types::BucketPointer;

/// Bucket size admitting exactly four `(u64, u64)` leaf entries:
/// 60 header + 4 x (16 payload + 2 slot) = 132 <= 136 < 150.
const LEAF4: usize = 136;

fn setup(bucket_size: usize, trigger: f64) -> (TempDir, Arc<AtomicOperationsManager>) {
    let dir = tempfile::tempdir().unwrap();
    let options = BonsaiOptions {
        page_size: 4096,
        bucket_size,
        free_space_reuse_trigger: trigger,
        cache_pages: 64,
    };
    let cache = Arc::new(PageCache::new(dir.path(), options).unwrap());
    (dir, Arc::new(AtomicOperationsManager::new(cache)))
}

fn scan_all(tree: &BonsaiTree<u64, u64>) -> Vec<(u64, u64)> {
    let mut entries = Vec::new();
    if let Some(first) = tree.first_key().unwrap() {
        tree.load_entries_major(&first, true, true, |k, v| {
            entries.push((*k, *v));
            true
        })
        .unwrap();
    }
    entries
}

fn root_is_leaf(tree: &BonsaiTree<u64, u64>) -> bool {
    let entry = tree.load_bucket_page(tree.root).unwrap();
    let guard = entry.shared_latch();
    let root =
        BonsaiBucket::<u64, u64>::new(&guard, tree.root.offset(), tree.bucket_size()).unwrap();
    root.is_leaf()
}

fn root_separator(tree: &BonsaiTree<u64, u64>) -> u64 {
    let entry = tree.load_bucket_page(tree.root).unwrap();
    let guard = entry.shared_latch();
    let root =
        BonsaiBucket::<u64, u64>::new(&guard, tree.root.offset(), tree.bucket_size()).unwrap();
    assert!(!root.is_leaf());
    root.get_key(0).unwrap()
}

fn free_list_state(tree: &BonsaiTree<u64, u64>) -> (BucketPointer, u64) {
    let entry = tree.load_bucket_page(SYS_BUCKET).unwrap();
    let mut guard = entry.exclusive_latch();
    let sys = SysBucket::new(&mut guard);
    (sys.free_list_head(), sys.free_list_length())
}

/// Walks the free list, checking the deleted flag on every bucket.
fn measure_free_list(tree: &BonsaiTree<u64, u64>) -> u64 {
    let (mut pointer, _) = free_list_state(tree);
    let mut length = 0;
    while pointer.is_valid() {
        let entry = tree.load_bucket_page(pointer).unwrap();
        let guard = entry.shared_latch();
        let bucket =
            BonsaiBucket::<u64, u64>::new(&guard, pointer.offset(), tree.bucket_size()).unwrap();
        assert!(bucket.is_deleted(), "free list reached a live bucket");
        pointer = bucket.free_list_pointer();
        length += 1;
    }
    length
}

fn assert_free_list_consistent(tree: &BonsaiTree<u64, u64>) {
    let (_, recorded) = free_list_state(tree);
    assert_eq!(recorded, measure_free_list(tree));
}

#[test]
fn insert_scan_and_boundaries_with_four_entry_leaves() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "s1.sbt", 0).unwrap();

    for key in [5u64, 1, 3, 7, 2] {
        assert!(tree.put(&key, &(key * 10)).unwrap());
    }
    assert_eq!(
        scan_all(&tree),
        vec![(1, 10), (2, 20), (3, 30), (5, 50), (7, 70)]
    );
    assert_eq!(tree.size().unwrap(), 5);
    assert_eq!(tree.first_key().unwrap(), Some(1));
    assert_eq!(tree.last_key().unwrap(), Some(7));

    // The fifth insert overflowed the root leaf [1,3,5,7]: a root split at
    // size >> 1 promoted key 5 into a depth-1 branch.
    assert!(!root_is_leaf(&tree));
    assert_eq!(root_separator(&tree), 5);
}

#[test]
fn put_update_protocol() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "s2.sbt", 0).unwrap();
    for key in [5u64, 1, 3, 7, 2] {
        tree.put(&key, &(key * 10)).unwrap();
    }

    assert!(tree.put(&5, &999).unwrap());
    assert_eq!(tree.get(&5).unwrap(), Some(999));
    // Same value again: not modified.
    assert!(!tree.put(&5, &999).unwrap());
    assert_eq!(tree.size().unwrap(), 5);
}

#[test]
fn remove_keeps_leaf_unrecycled() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "s3.sbt", 0).unwrap();
    for key in [5u64, 1, 3, 7, 2] {
        tree.put(&key, &(key * 10)).unwrap();
    }

    assert_eq!(tree.remove(&3).unwrap(), Some(30));
    assert_eq!(tree.get(&3).unwrap(), None);
    assert_eq!(tree.size().unwrap(), 4);
    assert_eq!(scan_all(&tree), vec![(1, 10), (2, 20), (5, 50), (7, 70)]);
    // No rebalance, no recycling on point removal.
    let (head, length) = free_list_state(&tree);
    assert!(!head.is_valid());
    assert_eq!(length, 0);

    assert_eq!(tree.remove(&3).unwrap(), None);
}

#[test]
fn clear_recycles_everything_but_the_root() {
    let (_dir, atomics) = setup(LEAF4, 0.1);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "s4.sbt", 9).unwrap();
    for key in 1..=20u64 {
        tree.put(&key, &key).unwrap();
    }
    let root_before = tree.root_pointer();
    assert!(!root_is_leaf(&tree));

    tree.clear().unwrap();
    assert_eq!(tree.size().unwrap(), 0);
    assert_eq!(tree.root_pointer(), root_before);
    assert_eq!(tree.identifier().unwrap(), 9);
    assert_eq!(tree.get(&7).unwrap(), None);
    assert_eq!(tree.first_key().unwrap(), None);

    let (_, freed) = free_list_state(&tree);
    assert!(freed > 0, "clear must recycle the non-root buckets");
    assert_free_list_consistent(&tree);

    // The tree is still usable, and the free list drains once the reuse
    // ratio is crossed.
    assert!(tree.put(&42, &42).unwrap());
    assert_eq!(tree.get(&42).unwrap(), Some(42));
    for key in 100..140u64 {
        tree.put(&key, &key).unwrap();
    }
    let (_, after) = free_list_state(&tree);
    assert!(after < freed, "splits should reuse recycled buckets");
    assert_free_list_consistent(&tree);
}

#[test]
fn delete_recycles_the_whole_tree() {
    let (_dir, atomics) = setup(LEAF4, 0.1);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "s5.sbt", 0).unwrap();
    for key in 1..=20u64 {
        tree.put(&key, &key).unwrap();
    }
    let root = tree.root_pointer();
    tree.delete().unwrap();

    // The root bucket is now on the free list; loading it reports a dead
    // tree.
    assert!(
        BonsaiTree::<u64, u64>::load(&atomics, "s5.sbt", root)
            .unwrap()
            .is_none()
    );

    // A second tree in the same file sees the recycled buckets and its
    // root allocation drains the free list by one.
    let probe: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "s5.sbt", 0).unwrap();
    let (_, after_create) = free_list_state(&probe);
    assert!(after_create > 0);
    assert_free_list_consistent(&probe);

    let freed_before_create = after_create + 1;
    assert!(
        freed_before_create >= 5,
        "a 20-entry tree with 4-entry leaves spans at least five buckets"
    );
}

#[test]
fn split_chain_reaches_multiple_levels() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "deep.sbt", 0).unwrap();
    for key in 0..200u64 {
        assert!(tree.put(&key, &(key + 1)).unwrap());
    }
    assert_eq!(tree.size().unwrap(), 200);
    let entries = scan_all(&tree);
    assert_eq!(entries.len(), 200);
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    for key in 0..200u64 {
        assert_eq!(tree.get(&key).unwrap(), Some(key + 1));
    }
    assert_eq!(tree.first_key().unwrap(), Some(0));
    assert_eq!(tree.last_key().unwrap(), Some(199));
}

#[test]
fn root_split_preserves_tree_size_and_identifier() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "meta.sbt", 0xAB).unwrap();
    for key in [5u64, 1, 3, 7, 2] {
        tree.put(&key, &key).unwrap();
    }
    assert!(!root_is_leaf(&tree));
    assert_eq!(tree.identifier().unwrap(), 0xAB);
    assert_eq!(tree.size().unwrap(), 5);
}

#[test]
fn first_key_unwinds_over_emptied_leaves() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "unwind.sbt", 0).unwrap();
    for key in 1..=8u64 {
        tree.put(&key, &key).unwrap();
    }
    assert!(!root_is_leaf(&tree));

    // Drain the leftmost leaf entirely; first_key must hop over the empty
    // leaf instead of giving up.
    for key in 1..=4u64 {
        tree.remove(&key).unwrap();
    }
    assert_eq!(tree.first_key().unwrap(), Some(5));
    assert_eq!(tree.last_key().unwrap(), Some(8));

    for key in 5..=8u64 {
        tree.remove(&key).unwrap();
    }
    assert_eq!(tree.first_key().unwrap(), None);
    assert_eq!(tree.last_key().unwrap(), None);
    assert_eq!(tree.size().unwrap(), 0);
}

#[test]
fn random_operations_match_reference_model() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "rand.sbt", 0).unwrap();
    let mut reference = BTreeMap::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0xB0_45A1);

    for _ in 0..2_000 {
        let key = rng.gen_range(0..256u64);
        if rng.gen_bool(0.6) {
            let value = rng.gen::<u64>();
            let modified = tree.put(&key, &value).unwrap();
            let previous = reference.insert(key, value);
            assert_eq!(modified, previous != Some(value));
        } else {
            assert_eq!(tree.remove(&key).unwrap(), reference.remove(&key));
        }
    }

    assert_eq!(tree.size().unwrap(), reference.len() as u64);
    let entries = scan_all(&tree);
    assert_eq!(
        entries,
        reference.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>()
    );
    assert_eq!(
        tree.first_key().unwrap(),
        reference.keys().next().copied()
    );
    assert_eq!(
        tree.last_key().unwrap(),
        reference.keys().next_back().copied()
    );
    for key in 0..256u64 {
        assert_eq!(tree.get(&key).unwrap(), reference.get(&key).copied());
    }
}

#[test]
fn range_scans_honor_bounds_and_inclusivity() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "range.sbt", 0).unwrap();
    for key in (0..40u64).map(|k| k * 2) {
        tree.put(&key, &key).unwrap();
    }

    // Major, from an absent key.
    assert_eq!(
        tree.values_major(&13, true, Some(3)).unwrap(),
        vec![14, 16, 18]
    );
    // Major, exclusive exact hit.
    assert_eq!(
        tree.values_major(&14, false, Some(2)).unwrap(),
        vec![16, 18]
    );
    // Minor walks down through left siblings.
    assert_eq!(
        tree.values_minor(&10, true, Some(3)).unwrap(),
        vec![10, 8, 6]
    );
    assert_eq!(tree.values_minor(&10, false, Some(2)).unwrap(), vec![8, 6]);
    // Between with all four inclusivity combinations.
    assert_eq!(
        tree.values_between(&10, true, &16, true, None).unwrap(),
        vec![10, 12, 14, 16]
    );
    assert_eq!(
        tree.values_between(&10, false, &16, true, None).unwrap(),
        vec![12, 14, 16]
    );
    assert_eq!(
        tree.values_between(&10, true, &16, false, None).unwrap(),
        vec![10, 12, 14]
    );
    assert_eq!(
        tree.values_between(&11, false, &15, false, None).unwrap(),
        vec![12, 14]
    );

    let err = tree
        .load_entries_major(&0, true, false, |_, _| true)
        .unwrap_err();
    assert!(matches!(err, BonsaiError::Usage(_)));
}

#[test]
fn allocator_crosses_page_boundaries() {
    // Two buckets per page: the sys bucket and the root fill page 0, so
    // the first split already extends the file.
    let (_dir, atomics) = setup(2048, 0.5);
    let cache = Arc::clone(atomics.cache());
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "grow.sbt", 0).unwrap();
    assert_eq!(cache.filled_up_to(tree.file_id).unwrap(), 1);

    for key in 0..2_000u64 {
        tree.put(&key, &key).unwrap();
    }
    let pages = cache.filled_up_to(tree.file_id).unwrap();
    assert!(pages > 4, "inserts must have extended the file, got {pages} pages");
    assert_eq!(scan_all(&tree).len(), 2_000);
}

#[test]
fn identifier_roundtrip_and_update() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "ident.sbt", 1).unwrap();
    assert_eq!(tree.identifier().unwrap(), 1);
    tree.set_identifier(77).unwrap();
    assert_eq!(tree.identifier().unwrap(), 77);

    // Survives reopen through the root bucket.
    let root = tree.root_pointer();
    let again: BonsaiTree<u64, u64> = BonsaiTree::load(&atomics, "ident.sbt", root)
        .unwrap()
        .unwrap();
    assert_eq!(again.identifier().unwrap(), 77);
}

#[test]
fn load_rejects_mismatched_codecs() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "codec.sbt", 0).unwrap();
    let root = tree.root_pointer();

    let err = BonsaiTree::<RecordId, i32>::load(&atomics, "codec.sbt", root).unwrap_err();
    assert!(matches!(err, BonsaiError::UnsupportedSerializer(id) if id == 10));
}

#[test]
fn collection_pointer_names_the_tree() {
    let (_dir, atomics) = setup(LEAF4, 0.5);
    let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "coll.sbt", 0).unwrap();
    let pointer = tree.collection_pointer();
    assert_eq!(pointer.file_id, tree.file_id());
    assert_eq!(pointer.root, tree.root_pointer());
}

#[test]
fn variable_length_values_update_through_reinsert() {
    let (_dir, atomics) = setup(256, 0.5);
    let tree: BonsaiTree<u64, Vec<u8>> = BonsaiTree::create(&atomics, "var.sbt", 0).unwrap();

    tree.put(&1, &b"short".to_vec()).unwrap();
    tree.put(&2, &b"other".to_vec()).unwrap();
    assert_eq!(tree.size().unwrap(), 2);

    // A longer encoding cannot be overwritten in place; the entry is
    // removed and re-inserted without disturbing the tree size.
    assert!(tree.put(&1, &b"a considerably longer payload".to_vec()).unwrap());
    assert_eq!(
        tree.get(&1).unwrap(),
        Some(b"a considerably longer payload".to_vec())
    );
    assert_eq!(tree.size().unwrap(), 2);

    // Shrinking works the same way, and identical bytes stay "not
    // modified".
    assert!(tree.put(&1, &b"x".to_vec()).unwrap());
    assert!(!tree.put(&1, &b"x".to_vec()).unwrap());
    assert_eq!(tree.get(&2).unwrap(), Some(b"other".to_vec()));
}

#[test]
fn options_validation_rejects_bad_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let tiny = BonsaiOptions {
        bucket_size: 64,
        ..BonsaiOptions::default()
    };
    assert!(matches!(
        PageCache::new(dir.path(), tiny),
        Err(BonsaiError::Usage(_))
    ));

    let oversized = BonsaiOptions {
        page_size: 512,
        bucket_size: 1024,
        ..BonsaiOptions::default()
    };
    assert!(matches!(
        PageCache::new(dir.path(), oversized),
        Err(BonsaiError::Usage(_))
    ));
}
