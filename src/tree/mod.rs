//! The bonsai tree engine.
//!
//! A tree's nodes are buckets (subpages of the pages of one shared file),
//! so hundreds of small trees cohabit a single file, each rooted at its own
//! bucket. The root bucket's address is the tree's stable handle: it never
//! changes, not even across [`clear`](BonsaiTree::clear) or root splits.
//!
//! Locking runs outside-in: the atomic-operations component lock, then the
//! per-file partitioned lock (shared for reads, exclusive for any mutation),
//! then per-page latches taken from the cache. Every mutator executes inside
//! an atomic operation that rolls back on failure.

pub(crate) mod alloc;
pub(crate) mod bucket;
mod scan;
pub(crate) mod sys_bucket;

#[cfg(test)]
mod tests;

pub use scan::Change;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::debug;

use crate::cache::{
    AtomicOperation, AtomicOperationsManager, CacheEntry, ComponentId, PageCache, PageWriteGuard,
};
use crate::codecs::{KeyCodec, ValCodec};
use crate::concurrency::PartitionedLockManager;
use crate::error::{BonsaiError, Result};
use crate::types::{BucketPointer, CollectionPointer, FileId};
use bucket::{BonsaiBucket, BonsaiBucketMut, BucketEntry, UpdateResult};

/// Hard ceiling on search-path depth; a deeper path means a pointer cycle.
const MAX_SEARCH_DEPTH: usize = 64;

type SearchPath = SmallVec<[BucketPointer; 8]>;

/// Where a key search ended: the visited buckets root-to-leaf and the
/// position inside the final bucket, `-(insertion_point) - 1` when absent.
pub(crate) struct BucketSearchResult {
    pub item_index: i32,
    pub path: SearchPath,
}

impl BucketSearchResult {
    pub fn last_path_item(&self) -> BucketPointer {
        *self.path.last().expect("search path is never empty")
    }
}

/// An ordered key-value index rooted at one bucket of a shared file.
///
/// Concurrent readers are allowed; writers are exclusive per tree. The tree
/// object is `Sync` and is shared behind an `Arc` by multi-threaded callers.
pub struct BonsaiTree<K: KeyCodec, V: ValCodec> {
    cache: Arc<PageCache>,
    atomics: Arc<AtomicOperationsManager>,
    file_locks: PartitionedLockManager,
    component: ComponentId,
    file_id: FileId,
    root: BucketPointer,
    name: String,
    _codecs: PhantomData<fn() -> (K, V)>,
}

impl<K: KeyCodec, V: ValCodec> std::fmt::Debug for BonsaiTree<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BonsaiTree")
            .field("component", &self.component)
            .field("file_id", &self.file_id)
            .field("root", &self.root)
            .field("name", &self.name)
            .finish()
    }
}

impl<K: KeyCodec, V: ValCodec> BonsaiTree<K, V> {
    /// Creates a new tree in `name`, initializing the file's system bucket
    /// on first use; subsequent trees share it. The caller remembers the
    /// returned tree's [`root_pointer`](Self::root_pointer) to find the
    /// tree again via [`load`](Self::load).
    pub fn create(
        atomics: &Arc<AtomicOperationsManager>,
        name: &str,
        identifier: u64,
    ) -> Result<Self> {
        let cache = Arc::clone(atomics.cache());
        let mut op = atomics.start();
        let file_id = if cache.is_file_exists(name) {
            cache.open_file(name)?
        } else {
            match cache.add_file(name) {
                Ok(file_id) => file_id,
                // Lost a race with a concurrent creator.
                Err(BonsaiError::Usage(_)) => cache.open_file(name)?,
                Err(err) => return Err(err),
            }
        };
        alloc::init_sys_bucket(&cache, &mut op, file_id)?;
        let (root, root_entry) = alloc::allocate_bucket::<K, V>(&cache, &mut op, file_id)?;
        {
            let mut guard = root_entry.exclusive_latch();
            op.capture_page(file_id, root.page(), &guard);
            let mut root_bucket = BonsaiBucketMut::<K, V>::new(
                &mut guard,
                root.offset(),
                cache.options().bucket_size,
            )?;
            root_bucket.init(true);
            root_bucket.set_tree_size(0);
            root_bucket.set_identifier(identifier);
        }
        drop(root_entry);
        op.commit()?;
        debug!(file = name, root = %root, "tree created");
        Ok(Self {
            cache,
            atomics: Arc::clone(atomics),
            file_locks: PartitionedLockManager::new(),
            component: atomics.register_component(),
            file_id,
            root,
            name: name.to_string(),
            _codecs: PhantomData,
        })
    }

    /// Loads the tree rooted at `root` from `name`. Returns `None` when the
    /// root bucket has been recycled (the tree was deleted), and an
    /// [`UnsupportedSerializer`](BonsaiError::UnsupportedSerializer) error
    /// when the recorded codec ids do not match `K` and `V`.
    pub fn load(
        atomics: &Arc<AtomicOperationsManager>,
        name: &str,
        root: BucketPointer,
    ) -> Result<Option<Self>> {
        if !root.is_valid() {
            return Err(BonsaiError::Usage("null root bucket pointer"));
        }
        let cache = Arc::clone(atomics.cache());
        let file_id = cache.open_file(name)?;
        let bucket_size = cache.options().bucket_size;
        {
            let entry = cache
                .load_page(file_id, root.page())?
                .ok_or(BonsaiError::Corruption("root bucket page missing"))?;
            let guard = entry.shared_latch();
            let root_bucket = BonsaiBucket::<K, V>::new(&guard, root.offset(), bucket_size)?;
            if root_bucket.is_deleted() {
                return Ok(None);
            }
            if root_bucket.key_codec_id() != K::CODEC_ID {
                return Err(BonsaiError::UnsupportedSerializer(root_bucket.key_codec_id()));
            }
            if root_bucket.value_codec_id() != V::CODEC_ID {
                return Err(BonsaiError::UnsupportedSerializer(
                    root_bucket.value_codec_id(),
                ));
            }
        }
        debug!(file = name, root = %root, "tree loaded");
        Ok(Some(Self {
            cache,
            atomics: Arc::clone(atomics),
            file_locks: PartitionedLockManager::new(),
            component: atomics.register_component(),
            file_id,
            root,
            name: name.to_string(),
            _codecs: PhantomData,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file_id(&self) -> FileId {
        let _lock = self.file_locks.shared(self.file_id.0);
        self.file_id
    }

    pub fn root_pointer(&self) -> BucketPointer {
        let _lock = self.file_locks.shared(self.file_id.0);
        self.root
    }

    /// The durable `(file, root)` handle clients persist for this tree.
    pub fn collection_pointer(&self) -> CollectionPointer {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);
        CollectionPointer {
            file_id: self.file_id,
            root: self.root,
        }
    }

    pub fn key_codec_id(&self) -> u8 {
        K::CODEC_ID
    }

    pub fn value_codec_id(&self) -> u8 {
        V::CODEC_ID
    }

    fn bucket_size(&self) -> usize {
        self.cache.options().bucket_size
    }

    pub(crate) fn load_bucket_page(&self, pointer: BucketPointer) -> Result<CacheEntry> {
        self.cache
            .load_page(self.file_id, pointer.page())?
            .ok_or(BonsaiError::Corruption("bucket page missing"))
    }

    fn bucket_mut<'g>(
        &self,
        guard: &'g mut PageWriteGuard<'_>,
        pointer: BucketPointer,
    ) -> Result<BonsaiBucketMut<'g, K, V>> {
        BonsaiBucketMut::new(&mut **guard, pointer.offset(), self.bucket_size())
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);
        let search = self.find_bucket(key)?;
        if search.item_index < 0 {
            return Ok(None);
        }
        let pointer = search.last_path_item();
        let entry = self.load_bucket_page(pointer)?;
        let guard = entry.shared_latch();
        let leaf = BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
        match leaf.get_entry(search.item_index as usize)? {
            BucketEntry::Leaf { value, .. } => Ok(Some(value)),
            BucketEntry::Branch { .. } => {
                Err(BonsaiError::Corruption("key search landed on a branch"))
            }
        }
    }

    /// Inserts or updates. Returns whether the tree changed: `false` only
    /// when the key was already present with a byte-identical value.
    pub fn put(&self, key: &K, value: &V) -> Result<bool> {
        // Both the leaf encoding and the branch encoding of the key (after
        // a split promotes it) must fit into an empty bucket, or splitting
        // could never make room.
        let capacity = self.bucket_size() - bucket::POSITIONS_ARRAY_OFFSET - bucket::SLOT_ENTRY_LEN;
        if key.encoded_len() + value.encoded_len() > capacity
            || key.encoded_len() + bucket::BRANCH_ENTRY_HEADER_LEN > capacity
        {
            return Err(BonsaiError::Usage("entry does not fit in an empty bucket"));
        }
        let mut op = self.atomics.start();
        let _lock = self.file_locks.exclusive(self.file_id.0);
        let modified = self.put_inner(&mut op, key, value)?;
        op.commit()?;
        Ok(modified)
    }

    fn put_inner(&self, op: &mut AtomicOperation<'_>, key: &K, value: &V) -> Result<bool> {
        let mut search = self.find_bucket(key)?;
        let item_found = search.item_index >= 0;
        let mut insertion_index;

        if item_found {
            let pointer = search.last_path_item();
            let entry = self.load_bucket_page(pointer)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, pointer.page(), &guard);
            let mut leaf = self.bucket_mut(&mut guard, pointer)?;
            match leaf.update_value(search.item_index as usize, value)? {
                UpdateResult::NoChange => return Ok(false),
                UpdateResult::Updated => return Ok(true),
                UpdateResult::Reinsert => {
                    // The new encoding has a different length; take the slow
                    // path through remove + insert at the same position.
                    leaf.remove(search.item_index as usize)?;
                    insertion_index = search.item_index;
                }
            }
        } else {
            insertion_index = -search.item_index - 1;
        }

        let mut pointer = search.last_path_item();
        loop {
            let entry = self.load_bucket_page(pointer)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, pointer.page(), &guard);
            let mut leaf = self.bucket_mut(&mut guard, pointer)?;
            let leaf_entry = BucketEntry::Leaf {
                key: key.clone(),
                value: value.clone(),
            };
            if leaf.add_entry(insertion_index as usize, &leaf_entry, true)? {
                break;
            }
            drop(leaf);
            drop(guard);
            drop(entry);

            search = self.split_bucket(op, search.path, insertion_index, key)?;
            pointer = search.last_path_item();
            insertion_index = search.item_index;
        }

        if !item_found {
            self.update_tree_size(op, 1)?;
        }
        Ok(true)
    }

    /// Removes `key`, returning its old value. No rebalancing happens on
    /// removal; emptied leaves stay in place until `clear` or `delete`.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let mut op = self.atomics.start();
        let _lock = self.file_locks.exclusive(self.file_id.0);

        let search = self.find_bucket(key)?;
        if search.item_index < 0 {
            op.commit()?;
            return Ok(None);
        }
        let pointer = search.last_path_item();
        let removed = {
            let entry = self.load_bucket_page(pointer)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, pointer.page(), &guard);
            let mut leaf = self.bucket_mut(&mut guard, pointer)?;
            let removed = match leaf.view().get_entry(search.item_index as usize)? {
                BucketEntry::Leaf { value, .. } => value,
                BucketEntry::Branch { .. } => {
                    return Err(BonsaiError::Corruption("key search landed on a branch"))
                }
            };
            leaf.remove(search.item_index as usize)?;
            removed
        };
        self.update_tree_size(&mut op, -1)?;
        op.commit()?;
        Ok(Some(removed))
    }

    /// Total number of entries, maintained in the root bucket.
    pub fn size(&self) -> Result<u64> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);
        let entry = self.load_bucket_page(self.root)?;
        let guard = entry.shared_latch();
        let root = BonsaiBucket::<K, V>::new(&guard, self.root.offset(), self.bucket_size())?;
        Ok(root.tree_size())
    }

    /// The opaque caller-supplied identifier stored in the root bucket.
    pub fn identifier(&self) -> Result<u64> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);
        let entry = self.load_bucket_page(self.root)?;
        let guard = entry.shared_latch();
        let root = BonsaiBucket::<K, V>::new(&guard, self.root.offset(), self.bucket_size())?;
        Ok(root.identifier())
    }

    pub fn set_identifier(&self, identifier: u64) -> Result<()> {
        let mut op = self.atomics.start();
        let _lock = self.file_locks.exclusive(self.file_id.0);
        {
            let entry = self.load_bucket_page(self.root)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, self.root.page(), &guard);
            let mut root = self.bucket_mut(&mut guard, self.root)?;
            root.set_identifier(identifier);
        }
        op.commit()
    }

    /// Removes every entry. The root keeps its address and identifier and
    /// is reset to an empty leaf; all other buckets go to the free list.
    pub fn clear(&self) -> Result<()> {
        let mut op = self.atomics.start();
        let _lock = self.file_locks.exclusive(self.file_id.0);
        let mut queue = VecDeque::new();
        {
            let entry = self.load_bucket_page(self.root)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, self.root.page(), &guard);
            let mut root = self.bucket_mut(&mut guard, self.root)?;
            let identifier = root.view().identifier();
            alloc::enqueue_children(&root.view(), &mut queue)?;
            root.init(true);
            root.set_tree_size(0);
            root.set_identifier(identifier);
        }
        alloc::recycle_subtrees::<K, V>(&self.cache, &mut op, self.file_id, queue)?;
        op.commit()
    }

    /// Recycles the whole tree, root included, and consumes the handle. The
    /// file itself is never shrunk.
    pub fn delete(self) -> Result<()> {
        let mut op = self.atomics.start();
        let _lock = self.file_locks.exclusive(self.file_id.0);
        let mut queue = VecDeque::new();
        queue.push_back(self.root);
        alloc::recycle_subtrees::<K, V>(&self.cache, &mut op, self.file_id, queue)?;
        op.commit()?;
        debug!(file = %self.name, root = %self.root, "tree deleted");
        Ok(())
    }

    /// Closes the backing file, optionally flushing dirty pages first. The
    /// file is shared: this also detaches every other tree loaded from it.
    pub fn close(self, flush: bool) -> Result<()> {
        let _lock = self.file_locks.exclusive(self.file_id.0);
        self.cache.close_file(self.file_id, flush)
    }

    /// Writes the file's dirty pages back to disk.
    pub fn flush(&self) -> Result<()> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);
        self.cache.flush_file(self.file_id)
    }

    /// Adds `delta` to the tree size stored in the root bucket, inside the
    /// caller's atomic operation.
    fn update_tree_size(&self, op: &mut AtomicOperation<'_>, delta: i64) -> Result<()> {
        let entry = self.load_bucket_page(self.root)?;
        let mut guard = entry.exclusive_latch();
        op.capture_page(self.file_id, self.root.page(), &guard);
        let mut root = self.bucket_mut(&mut guard, self.root)?;
        let current = root.view().tree_size() as i64;
        root.set_tree_size((current + delta) as u64);
        Ok(())
    }

    /// Descends from the root to the leaf responsible for `key`, recording
    /// every visited bucket. Keys equal to a branch separator live in its
    /// right subtree.
    pub(crate) fn find_bucket(&self, key: &K) -> Result<BucketSearchResult> {
        let mut pointer = self.root;
        let mut path: SearchPath = SmallVec::new();
        loop {
            if path.len() >= MAX_SEARCH_DEPTH {
                return Err(BonsaiError::Corruption("bucket pointer cycle in search"));
            }
            path.push(pointer);
            let next = {
                let entry = self.load_bucket_page(pointer)?;
                let guard = entry.shared_latch();
                let node = BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
                let index = node.find(key)?;
                if node.is_leaf() {
                    return Ok(BucketSearchResult {
                        item_index: index,
                        path,
                    });
                }
                if node.is_empty() {
                    return Err(BonsaiError::Corruption("branch bucket without entries"));
                }
                let branch_entry = if index >= 0 {
                    node.get_entry(index as usize)?
                } else {
                    let insertion = (-index - 1) as usize;
                    if insertion >= node.size() {
                        node.get_entry(insertion - 1)?
                    } else {
                        node.get_entry(insertion)?
                    }
                };
                if key >= branch_entry.key() {
                    branch_entry.right_child()
                } else {
                    branch_entry.left_child()
                }
            };
            if !next.is_valid() {
                return Err(BonsaiError::Corruption("invalid child pointer"));
            }
            pointer = next;
        }
    }

    /// Splits the bucket at the end of `path` at its midpoint and returns
    /// where `key_to_insert` (previously at position `key_index`) now
    /// belongs.
    ///
    /// Non-root buckets keep their address and shrink to the left half; a
    /// freshly allocated bucket takes the right half and the separator is
    /// pushed into the parent, recursing when the parent overflows. The
    /// root's address is a stable handle owned by external indexes, so a
    /// root split instead allocates both halves and rewrites the root as a
    /// one-entry branch, preserving its tree size and identifier.
    fn split_bucket(
        &self,
        op: &mut AtomicOperation<'_>,
        path: SearchPath,
        key_index: i32,
        key_to_insert: &K,
    ) -> Result<BucketSearchResult> {
        let bucket_pointer = *path.last().ok_or(BonsaiError::Corruption("empty search path"))?;

        // Read pass: everything the split needs from the overflowing bucket.
        let (split_leaf, bucket_len, separation_key, right_entries, right_sibling) = {
            let entry = self.load_bucket_page(bucket_pointer)?;
            let guard = entry.shared_latch();
            let node =
                BonsaiBucket::<K, V>::new(&guard, bucket_pointer.offset(), self.bucket_size())?;
            let split_leaf = node.is_leaf();
            let bucket_len = node.size();
            let index_to_split = bucket_len >> 1;
            let separation_key = node.get_key(index_to_split)?;
            let start_right = if split_leaf {
                index_to_split
            } else {
                index_to_split + 1
            };
            let mut right_entries = Vec::with_capacity(bucket_len - start_right);
            for i in start_right..bucket_len {
                right_entries.push(node.get_entry(i)?);
            }
            (
                split_leaf,
                bucket_len,
                separation_key,
                right_entries,
                node.right_sibling(),
            )
        };
        let index_to_split = bucket_len >> 1;

        if bucket_pointer != self.root {
            self.split_non_root(
                op,
                path,
                key_index,
                key_to_insert,
                NonRootSplit {
                    bucket_pointer,
                    split_leaf,
                    index_to_split,
                    separation_key,
                    right_entries,
                    right_sibling,
                },
            )
        } else {
            self.split_root(
                op,
                path,
                key_index,
                key_to_insert,
                split_leaf,
                index_to_split,
                separation_key,
                right_entries,
            )
        }
    }

    fn split_non_root(
        &self,
        op: &mut AtomicOperation<'_>,
        path: SearchPath,
        key_index: i32,
        key_to_insert: &K,
        split: NonRootSplit<K, V>,
    ) -> Result<BucketSearchResult> {
        let NonRootSplit {
            bucket_pointer,
            split_leaf,
            index_to_split,
            separation_key,
            right_entries,
            right_sibling,
        } = split;

        let (right_pointer, right_entry) =
            alloc::allocate_bucket::<K, V>(&self.cache, op, self.file_id)?;
        {
            let mut guard = right_entry.exclusive_latch();
            op.capture_page(self.file_id, right_pointer.page(), &guard);
            let mut right = self.bucket_mut(&mut guard, right_pointer)?;
            right.init(split_leaf);
            right.add_all(&right_entries)?;
            if split_leaf {
                right.set_right_sibling(right_sibling);
                right.set_left_sibling(bucket_pointer);
            }
        }
        drop(right_entry);

        {
            let entry = self.load_bucket_page(bucket_pointer)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, bucket_pointer.page(), &guard);
            let mut left = self.bucket_mut(&mut guard, bucket_pointer)?;
            left.shrink(index_to_split)?;
            if split_leaf {
                left.set_right_sibling(right_pointer);
            }
        }

        if split_leaf && right_sibling.is_valid() {
            let entry = self.load_bucket_page(right_sibling)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, right_sibling.page(), &guard);
            let mut sibling = self.bucket_mut(&mut guard, right_sibling)?;
            sibling.set_left_sibling(right_pointer);
        }

        // Push the separator into the parent, splitting upward as needed.
        let branch_entry = BucketEntry::Branch {
            left: bucket_pointer,
            right: right_pointer,
            key: separation_key.clone(),
        };
        let parent_path: SearchPath = SmallVec::from_slice(&path[..path.len() - 1]);
        let mut parent_pointer = path[path.len() - 2];
        let mut insertion: Option<i32> = None;
        loop {
            let entry = self.load_bucket_page(parent_pointer)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, parent_pointer.page(), &guard);
            let mut parent = self.bucket_mut(&mut guard, parent_pointer)?;
            let index = match insertion {
                Some(index) => index,
                None => {
                    let found = parent.view().find(&separation_key)?;
                    debug_assert!(found < 0, "separator already present in parent");
                    -found - 1
                }
            };
            if parent.add_entry(index as usize, &branch_entry, true)? {
                break;
            }
            drop(parent);
            drop(guard);
            drop(entry);

            let result = self.split_bucket(op, parent_path.clone(), index, &separation_key)?;
            parent_pointer = result.last_path_item();
            insertion = Some(result.item_index);
        }

        let mut result_path: SearchPath = SmallVec::from_slice(&path[..path.len() - 1]);
        if key_to_insert < &separation_key {
            result_path.push(bucket_pointer);
            return Ok(BucketSearchResult {
                item_index: key_index,
                path: result_path,
            });
        }
        result_path.push(right_pointer);
        let item_index = if split_leaf {
            key_index - index_to_split as i32
        } else {
            key_index - index_to_split as i32 - 1
        };
        Ok(BucketSearchResult {
            item_index,
            path: result_path,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn split_root(
        &self,
        op: &mut AtomicOperation<'_>,
        path: SearchPath,
        key_index: i32,
        key_to_insert: &K,
        split_leaf: bool,
        index_to_split: usize,
        separation_key: K,
        right_entries: Vec<BucketEntry<K, V>>,
    ) -> Result<BucketSearchResult> {
        // The left half also moves out: the root keeps its address and
        // becomes a one-entry branch over two new buckets.
        let (tree_size, identifier, left_entries) = {
            let entry = self.load_bucket_page(self.root)?;
            let guard = entry.shared_latch();
            let root = BonsaiBucket::<K, V>::new(&guard, self.root.offset(), self.bucket_size())?;
            let mut left_entries = Vec::with_capacity(index_to_split);
            for i in 0..index_to_split {
                left_entries.push(root.get_entry(i)?);
            }
            (root.tree_size(), root.identifier(), left_entries)
        };

        let (left_pointer, left_entry) =
            alloc::allocate_bucket::<K, V>(&self.cache, op, self.file_id)?;
        let (right_pointer, right_entry) =
            alloc::allocate_bucket::<K, V>(&self.cache, op, self.file_id)?;

        {
            let mut guard = left_entry.exclusive_latch();
            op.capture_page(self.file_id, left_pointer.page(), &guard);
            let mut left = self.bucket_mut(&mut guard, left_pointer)?;
            left.init(split_leaf);
            left.add_all(&left_entries)?;
            if split_leaf {
                left.set_right_sibling(right_pointer);
            }
        }
        drop(left_entry);

        {
            let mut guard = right_entry.exclusive_latch();
            op.capture_page(self.file_id, right_pointer.page(), &guard);
            let mut right = self.bucket_mut(&mut guard, right_pointer)?;
            right.init(split_leaf);
            right.add_all(&right_entries)?;
            if split_leaf {
                right.set_left_sibling(left_pointer);
            }
        }
        drop(right_entry);

        {
            let entry = self.load_bucket_page(self.root)?;
            let mut guard = entry.exclusive_latch();
            op.capture_page(self.file_id, self.root.page(), &guard);
            let mut root = self.bucket_mut(&mut guard, self.root)?;
            root.init(false);
            root.set_tree_size(tree_size);
            root.set_identifier(identifier);
            let placed = root.add_entry(
                0,
                &BucketEntry::Branch {
                    left: left_pointer,
                    right: right_pointer,
                    key: separation_key.clone(),
                },
                true,
            )?;
            if !placed {
                return Err(BonsaiError::Usage(
                    "bucket size cannot hold a one-entry branch root",
                ));
            }
        }

        let mut result_path: SearchPath = SmallVec::from_slice(&path[..path.len() - 1]);
        if key_to_insert < &separation_key {
            result_path.push(left_pointer);
            return Ok(BucketSearchResult {
                item_index: key_index,
                path: result_path,
            });
        }
        result_path.push(right_pointer);
        let item_index = if split_leaf {
            key_index - index_to_split as i32
        } else {
            key_index - index_to_split as i32 - 1
        };
        Ok(BucketSearchResult {
            item_index,
            path: result_path,
        })
    }
}

struct NonRootSplit<K, V> {
    bucket_pointer: BucketPointer,
    split_leaf: bool,
    index_to_split: usize,
    separation_key: K,
    right_entries: Vec<BucketEntry<K, V>>,
    right_sibling: BucketPointer,
}
