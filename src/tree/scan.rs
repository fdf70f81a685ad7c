//! Range scans, boundary keys, and the pending-change aggregate.
//!
//! Scans walk the leaf level through the sibling links, holding one shared
//! page latch at a time. Iteration stops as soon as the listener returns
//! `false`. Only ascending order is supported.

use std::collections::HashMap;
use std::hash::Hash;

use crate::codecs::{KeyCodec, ValCodec};
use crate::error::{BonsaiError, Result};
use crate::tree::bucket::{BonsaiBucket, BucketEntry};
use crate::tree::BonsaiTree;
use crate::types::BucketPointer;

/// A pending, not-yet-persisted modification of one counter value, applied
/// on top of the stored value by [`BonsaiTree::real_bag_size`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Change {
    /// Add the delta to the stored value.
    Diff(i32),
    /// Replace the stored value outright.
    Absolute(i32),
}

impl Change {
    pub fn apply_to(&self, value: i32) -> i32 {
        match self {
            Change::Diff(delta) => value + delta,
            Change::Absolute(absolute) => *absolute,
        }
    }
}

impl<K: KeyCodec, V: ValCodec> BonsaiTree<K, V> {
    fn leaf_entry(
        &self,
        bucket: &BonsaiBucket<'_, K, V>,
        index: usize,
    ) -> Result<(K, V)> {
        match bucket.get_entry(index)? {
            BucketEntry::Leaf { key, value } => Ok((key, value)),
            BucketEntry::Branch { .. } => {
                Err(BonsaiError::Corruption("scan visited a branch bucket"))
            }
        }
    }

    /// Visits every entry with key `>= key` (or `> key` when not inclusive)
    /// in ascending order until the listener returns `false`. Descending
    /// order is rejected.
    pub fn load_entries_major(
        &self,
        key: &K,
        inclusive: bool,
        ascending: bool,
        mut listener: impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        if !ascending {
            return Err(BonsaiError::Usage("descending iteration is not supported"));
        }
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);

        let search = self.find_bucket(key)?;
        let mut pointer = search.last_path_item();
        let mut index: i64 = if search.item_index >= 0 {
            search.item_index as i64 + if inclusive { 0 } else { 1 }
        } else {
            (-search.item_index - 1) as i64
        };

        loop {
            let next = {
                let entry = self.load_bucket_page(pointer)?;
                let guard = entry.shared_latch();
                let bucket =
                    BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
                let size = bucket.size() as i64;
                let mut i = index;
                while i < size {
                    let (entry_key, entry_value) = self.leaf_entry(&bucket, i as usize)?;
                    if !listener(&entry_key, &entry_value) {
                        return Ok(());
                    }
                    i += 1;
                }
                bucket.right_sibling()
            };
            if !next.is_valid() {
                return Ok(());
            }
            pointer = next;
            index = 0;
        }
    }

    /// Visits every entry with key `<= key` (or `< key`) in descending
    /// order within each leaf, following left siblings.
    pub fn load_entries_minor(
        &self,
        key: &K,
        inclusive: bool,
        mut listener: impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);

        let search = self.find_bucket(key)?;
        let mut pointer = search.last_path_item();
        let mut index: i64 = if search.item_index >= 0 {
            search.item_index as i64 - if inclusive { 0 } else { 1 }
        } else {
            (-search.item_index - 2) as i64
        };
        let mut first_bucket = true;

        loop {
            let next = {
                let entry = self.load_bucket_page(pointer)?;
                let guard = entry.shared_latch();
                let bucket =
                    BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
                if !first_bucket {
                    index = bucket.size() as i64 - 1;
                }
                let mut i = index;
                while i >= 0 {
                    let (entry_key, entry_value) = self.leaf_entry(&bucket, i as usize)?;
                    if !listener(&entry_key, &entry_value) {
                        return Ok(());
                    }
                    i -= 1;
                }
                bucket.left_sibling()
            };
            if !next.is_valid() {
                return Ok(());
            }
            pointer = next;
            first_bucket = false;
        }
    }

    /// Visits every entry between `from` and `to` in ascending order,
    /// honoring the inclusivity of both endpoints.
    pub fn load_entries_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        mut listener: impl FnMut(&K, &V) -> bool,
    ) -> Result<()> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);

        let search_from = self.find_bucket(from)?;
        let mut pointer = search_from.last_path_item();
        let mut start: i64 = if search_from.item_index >= 0 {
            search_from.item_index as i64 + if from_inclusive { 0 } else { 1 }
        } else {
            (-search_from.item_index - 1) as i64
        };

        let search_to = self.find_bucket(to)?;
        let pointer_to = search_to.last_path_item();
        let index_to: i64 = if search_to.item_index >= 0 {
            search_to.item_index as i64 - if to_inclusive { 0 } else { 1 }
        } else {
            (-search_to.item_index - 2) as i64
        };

        loop {
            let next = {
                let entry = self.load_bucket_page(pointer)?;
                let guard = entry.shared_latch();
                let bucket =
                    BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
                let end = if pointer == pointer_to {
                    index_to
                } else {
                    bucket.size() as i64 - 1
                };
                let mut i = start;
                while i <= end {
                    let (entry_key, entry_value) = self.leaf_entry(&bucket, i as usize)?;
                    if !listener(&entry_key, &entry_value) {
                        return Ok(());
                    }
                    i += 1;
                }
                if pointer == pointer_to {
                    return Ok(());
                }
                bucket.right_sibling()
            };
            if !next.is_valid() {
                return Ok(());
            }
            pointer = next;
            start = 0;
        }
    }

    /// Smallest key in the tree, or `None` when empty. Empty buckets left
    /// behind by removals are skipped by unwinding through the path stack.
    pub fn first_key(&self) -> Result<Option<K>> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);

        let mut path: Vec<(BucketPointer, i64)> = Vec::new();
        let mut pointer = self.root;
        let mut item_index: i64 = 0;
        loop {
            let entry = self.load_bucket_page(pointer)?;
            let guard = entry.shared_latch();
            let bucket = BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
            let size = bucket.size() as i64;
            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some(bucket.get_key(0)?));
                }
                match path.pop() {
                    None => return Ok(None),
                    Some((parent, index)) => {
                        pointer = parent;
                        item_index = index + 1;
                    }
                }
            } else if bucket.is_empty() || item_index > size {
                match path.pop() {
                    None => return Ok(None),
                    Some((parent, index)) => {
                        pointer = parent;
                        item_index = index + 1;
                    }
                }
            } else {
                path.push((pointer, item_index));
                // A branch with n entries has n + 1 children; index == n
                // walks the last entry's right child.
                pointer = if item_index < size {
                    bucket.get_entry(item_index as usize)?.left_child()
                } else {
                    bucket.get_entry((item_index - 1) as usize)?.right_child()
                };
                item_index = 0;
                if !pointer.is_valid() {
                    return Err(BonsaiError::Corruption("invalid child pointer"));
                }
            }
        }
    }

    /// Largest key in the tree, or `None` when empty.
    pub fn last_key(&self) -> Result<Option<K>> {
        let _component = self.atomics.acquire_read_lock(self.component);
        let _lock = self.file_locks.shared(self.file_id.0);

        let mut path: Vec<(BucketPointer, i64)> = Vec::new();
        let mut pointer = self.root;
        // `None` means "start from the last entry of the next bucket".
        let mut item_index: Option<i64> = None;
        loop {
            let entry = self.load_bucket_page(pointer)?;
            let guard = entry.shared_latch();
            let bucket = BonsaiBucket::<K, V>::new(&guard, pointer.offset(), self.bucket_size())?;
            let size = bucket.size() as i64;
            let index = item_index.unwrap_or(size - 1);
            if bucket.is_leaf() {
                if !bucket.is_empty() {
                    return Ok(Some(bucket.get_key((size - 1) as usize)?));
                }
                match path.pop() {
                    None => return Ok(None),
                    Some((parent, parent_index)) => {
                        pointer = parent;
                        item_index = Some(parent_index - 1);
                    }
                }
            } else if bucket.is_empty() || index < -1 {
                match path.pop() {
                    None => return Ok(None),
                    Some((parent, parent_index)) => {
                        pointer = parent;
                        item_index = Some(parent_index - 1);
                    }
                }
            } else {
                path.push((pointer, index));
                // index == -1 walks the first entry's left child, the
                // subtree before every separator.
                pointer = if index > -1 {
                    bucket.get_entry(index as usize)?.right_child()
                } else {
                    bucket.get_entry(0)?.left_child()
                };
                item_index = None;
                if !pointer.is_valid() {
                    return Err(BonsaiError::Corruption("invalid child pointer"));
                }
            }
        }
    }

    /// Collects up to `max_values` values with key `>= key` (resp. `>`).
    pub fn values_major(
        &self,
        key: &K,
        inclusive: bool,
        max_values: Option<usize>,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_major(key, inclusive, true, |_, value| {
            values.push(value.clone());
            max_values.map_or(true, |max| values.len() < max)
        })?;
        Ok(values)
    }

    /// Collects up to `max_values` values with key `<= key` (resp. `<`),
    /// largest keys first.
    pub fn values_minor(
        &self,
        key: &K,
        inclusive: bool,
        max_values: Option<usize>,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_minor(key, inclusive, |_, value| {
            values.push(value.clone());
            max_values.map_or(true, |max| values.len() < max)
        })?;
        Ok(values)
    }

    /// Collects up to `max_values` values between the two keys.
    pub fn values_between(
        &self,
        from: &K,
        from_inclusive: bool,
        to: &K,
        to_inclusive: bool,
        max_values: Option<usize>,
    ) -> Result<Vec<V>> {
        let mut values = Vec::new();
        self.load_entries_between(from, from_inclusive, to, to_inclusive, |_, value| {
            values.push(value.clone());
            max_values.map_or(true, |max| values.len() < max)
        })?;
        Ok(values)
    }
}

impl<K: KeyCodec + Hash> BonsaiTree<K, i32> {
    /// Sums every counter value in the tree with the pending `changes`
    /// overlaid: a change for a stored key replaces or adjusts its value,
    /// and changes for absent keys contribute `apply_to(0)`. An empty tree
    /// short-circuits to the pending changes alone.
    pub fn real_bag_size(&self, changes: &HashMap<K, Change>) -> Result<i32> {
        let mut not_applied: HashMap<&K, Change> =
            changes.iter().map(|(k, c)| (k, *c)).collect();
        let mut total: i32 = 0;
        if let Some(first) = self.first_key()? {
            self.load_entries_major(&first, true, true, |key, value| {
                total += match not_applied.remove(key) {
                    Some(change) => change.apply_to(*value),
                    None => *value,
                };
                true
            })?;
        }
        for change in not_applied.values() {
            total += change.apply_to(0);
        }
        Ok(total)
    }
}
