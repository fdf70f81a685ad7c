//! On-disk layout of one tree bucket (subpage).
//!
//! A bucket occupies `bucket_size` bytes at a fixed offset inside a page and
//! is fully self-contained: a header, a sorted slot directory growing upward
//! from the header, and entry payload packed downward from the bucket end.
//!
//! ```text
//!  0  u16  free_pointer    lowest payload byte; payload grows downward
//!  2  u16  size            entry count
//!  4  u8   flags           bit0 = leaf, bit1 = deleted
//!  5  u8   key codec id
//!  6  u8   value codec id
//!  7  u8   reserved
//!  8  12B  free list pointer (deleted buckets)
//! 20  12B  left sibling      (leaves)
//! 32  12B  right sibling     (leaves)
//! 44  u64  tree size         (root only)
//! 52  u64  identifier        (root only)
//! 60  ..   slot directory: size x u16 entry offsets, sorted by key
//!  ..      free space
//!  ..      entries, packed against the bucket end
//! ```
//!
//! Leaf entries are `key ++ value`; branch entries are `left_child(12) ++
//! right_child(12) ++ key`. Adjacent branch entries share a child: entry
//! `i`'s right child equals entry `i+1`'s left child.
//!
//! All multi-byte fields are big-endian. The codec never crosses bucket
//! boundaries and never touches other buckets of the page.

use std::marker::PhantomData;

use crate::codecs::{KeyCodec, ValCodec};
use crate::error::{BonsaiError, Result};
use crate::types::BucketPointer;

const FREE_POINTER_OFFSET: usize = 0;
const SIZE_OFFSET: usize = 2;
const FLAGS_OFFSET: usize = 4;
const KEY_CODEC_OFFSET: usize = 5;
const VALUE_CODEC_OFFSET: usize = 6;
const FREE_LIST_POINTER_OFFSET: usize = 8;
const LEFT_SIBLING_OFFSET: usize = 20;
const RIGHT_SIBLING_OFFSET: usize = 32;
const TREE_SIZE_OFFSET: usize = 44;
const IDENTIFIER_OFFSET: usize = 52;

/// Start of the slot directory; also the end of the fixed header.
pub const POSITIONS_ARRAY_OFFSET: usize = 60;

/// Bytes per slot directory entry.
pub const SLOT_ENTRY_LEN: usize = 2;

/// Fixed prefix of a branch entry: two child pointers.
pub const BRANCH_ENTRY_HEADER_LEN: usize = 2 * BucketPointer::ENCODED_LEN;

/// Smallest bucket geometry the engine accepts: header, one slot, and one
/// branch entry with a small key. Larger keys may still fail at runtime
/// with a usage error when a root split cannot place its separator.
pub const MIN_BUCKET_SIZE: usize =
    POSITIONS_ARRAY_OFFSET + SLOT_ENTRY_LEN + BRANCH_ENTRY_HEADER_LEN + 16;

const FLAG_LEAF: u8 = 0b0000_0001;
const FLAG_DELETED: u8 = 0b0000_0010;

/// One decoded bucket entry.
#[derive(Clone, Debug, PartialEq)]
pub enum BucketEntry<K, V> {
    Leaf {
        key: K,
        value: V,
    },
    Branch {
        left: BucketPointer,
        right: BucketPointer,
        key: K,
    },
}

impl<K, V> BucketEntry<K, V> {
    pub fn key(&self) -> &K {
        match self {
            BucketEntry::Leaf { key, .. } => key,
            BucketEntry::Branch { key, .. } => key,
        }
    }

    /// Left child of a branch entry; NULL for leaves.
    pub fn left_child(&self) -> BucketPointer {
        match self {
            BucketEntry::Leaf { .. } => BucketPointer::NULL,
            BucketEntry::Branch { left, .. } => *left,
        }
    }

    /// Right child of a branch entry; NULL for leaves.
    pub fn right_child(&self) -> BucketPointer {
        match self {
            BucketEntry::Leaf { .. } => BucketPointer::NULL,
            BucketEntry::Branch { right, .. } => *right,
        }
    }
}

/// Outcome of an in-place value update.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateResult {
    /// The new value encodes to the same bytes; nothing was written.
    NoChange,
    /// The value was overwritten in place.
    Updated,
    /// The new encoding has a different length; the caller must remove the
    /// entry and re-insert it.
    Reinsert,
}

/// Read-only view of a bucket under a shared (or exclusive) page latch.
pub struct BonsaiBucket<'a, K, V> {
    buf: &'a [u8],
    _codecs: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: KeyCodec, V: ValCodec> BonsaiBucket<'a, K, V> {
    /// Views the bucket at `offset` within `page`.
    pub fn new(page: &'a [u8], offset: usize, bucket_size: usize) -> Result<Self> {
        let buf = page
            .get(offset..offset + bucket_size)
            .ok_or(BonsaiError::Corruption("bucket extends past its page"))?;
        Ok(Self {
            buf,
            _codecs: PhantomData,
        })
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes(self.buf[offset..offset + 2].try_into().unwrap())
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_be_bytes(self.buf[offset..offset + 8].try_into().unwrap())
    }

    fn read_pointer(&self, offset: usize) -> BucketPointer {
        BucketPointer::decode(&self.buf[offset..offset + BucketPointer::ENCODED_LEN])
    }

    pub fn size(&self) -> usize {
        self.read_u16(SIZE_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.buf[FLAGS_OFFSET] & FLAG_LEAF != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.buf[FLAGS_OFFSET] & FLAG_DELETED != 0
    }

    pub fn key_codec_id(&self) -> u8 {
        self.buf[KEY_CODEC_OFFSET]
    }

    pub fn value_codec_id(&self) -> u8 {
        self.buf[VALUE_CODEC_OFFSET]
    }

    pub fn free_list_pointer(&self) -> BucketPointer {
        self.read_pointer(FREE_LIST_POINTER_OFFSET)
    }

    pub fn left_sibling(&self) -> BucketPointer {
        self.read_pointer(LEFT_SIBLING_OFFSET)
    }

    pub fn right_sibling(&self) -> BucketPointer {
        self.read_pointer(RIGHT_SIBLING_OFFSET)
    }

    pub fn tree_size(&self) -> u64 {
        self.read_u64(TREE_SIZE_OFFSET)
    }

    pub fn identifier(&self) -> u64 {
        self.read_u64(IDENTIFIER_OFFSET)
    }

    fn free_pointer(&self) -> usize {
        self.read_u16(FREE_POINTER_OFFSET) as usize
    }

    /// Bytes still available between the slot directory and the payload.
    fn free_space(&self) -> Result<usize> {
        let directory_end = POSITIONS_ARRAY_OFFSET + self.size() * SLOT_ENTRY_LEN;
        let free_pointer = self.free_pointer();
        if free_pointer > self.buf.len() || free_pointer < directory_end {
            return Err(BonsaiError::Corruption("bucket free pointer out of range"));
        }
        Ok(free_pointer - directory_end)
    }

    fn slot(&self, index: usize) -> Result<usize> {
        if index >= self.size() {
            return Err(BonsaiError::Corruption("bucket slot index out of range"));
        }
        let offset = self.read_u16(POSITIONS_ARRAY_OFFSET + index * SLOT_ENTRY_LEN) as usize;
        if offset < self.free_pointer() || offset >= self.buf.len() {
            return Err(BonsaiError::Corruption("bucket slot offset out of range"));
        }
        Ok(offset)
    }

    fn entry_slice(&self, index: usize) -> Result<&'a [u8]> {
        Ok(&self.buf[self.slot(index)?..])
    }

    /// Encoded length of entry `index` in bytes.
    fn entry_len(&self, index: usize) -> Result<usize> {
        let slice = self.entry_slice(index)?;
        if self.is_leaf() {
            let key_len = K::encoded_len_at(slice)?;
            let value_len = V::encoded_len_at(&slice[key_len..])?;
            Ok(key_len + value_len)
        } else {
            let key_len = K::encoded_len_at(&slice[BRANCH_ENTRY_HEADER_LEN..])?;
            Ok(BRANCH_ENTRY_HEADER_LEN + key_len)
        }
    }

    pub fn get_key(&self, index: usize) -> Result<K> {
        let slice = self.entry_slice(index)?;
        if self.is_leaf() {
            K::decode(slice)
        } else {
            K::decode(&slice[BRANCH_ENTRY_HEADER_LEN..])
        }
    }

    pub fn get_entry(&self, index: usize) -> Result<BucketEntry<K, V>> {
        let slice = self.entry_slice(index)?;
        if self.is_leaf() {
            let key_len = K::encoded_len_at(slice)?;
            let key = K::decode(slice)?;
            let value = V::decode(&slice[key_len..])?;
            Ok(BucketEntry::Leaf { key, value })
        } else {
            if slice.len() < BRANCH_ENTRY_HEADER_LEN {
                return Err(BonsaiError::Corruption("branch entry truncated"));
            }
            let left = BucketPointer::decode(&slice[..BucketPointer::ENCODED_LEN]);
            let right = BucketPointer::decode(
                &slice[BucketPointer::ENCODED_LEN..BRANCH_ENTRY_HEADER_LEN],
            );
            let key = K::decode(&slice[BRANCH_ENTRY_HEADER_LEN..])?;
            Ok(BucketEntry::Branch { left, right, key })
        }
    }

    /// Binary search over the slot directory. Returns the matching index, or
    /// `-(insertion_point) - 1` when the key is absent.
    pub fn find(&self, key: &K) -> Result<i32> {
        let mut low = 0i32;
        let mut high = self.size() as i32 - 1;
        while low <= high {
            let mid = (low + high) >> 1;
            let mid_key = self.get_key(mid as usize)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid - 1,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Ok(-(low + 1))
    }
}

/// Mutable view of a bucket under an exclusive page latch. Read accessors
/// are reached through [`view`](Self::view).
pub struct BonsaiBucketMut<'a, K, V> {
    buf: &'a mut [u8],
    _codecs: PhantomData<fn() -> (K, V)>,
}

impl<'a, K: KeyCodec, V: ValCodec> BonsaiBucketMut<'a, K, V> {
    pub fn new(page: &'a mut [u8], offset: usize, bucket_size: usize) -> Result<Self> {
        let buf = page
            .get_mut(offset..offset + bucket_size)
            .ok_or(BonsaiError::Corruption("bucket extends past its page"))?;
        Ok(Self {
            buf,
            _codecs: PhantomData,
        })
    }

    /// Read-only view over the same bytes.
    pub fn view(&self) -> BonsaiBucket<'_, K, V> {
        BonsaiBucket {
            buf: self.buf,
            _codecs: PhantomData,
        }
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    fn write_pointer(&mut self, offset: usize, pointer: BucketPointer) {
        pointer.encode(&mut self.buf[offset..offset + BucketPointer::ENCODED_LEN]);
    }

    /// Resets the bucket to an empty leaf or branch and records the codec
    /// ids. Root metadata and siblings are cleared; stale payload bytes
    /// become unreachable.
    pub fn init(&mut self, is_leaf: bool) {
        let bucket_len = self.buf.len();
        self.buf[..POSITIONS_ARRAY_OFFSET].fill(0);
        self.write_u16(FREE_POINTER_OFFSET, bucket_len as u16);
        self.write_u16(SIZE_OFFSET, 0);
        self.buf[FLAGS_OFFSET] = if is_leaf { FLAG_LEAF } else { 0 };
        self.buf[KEY_CODEC_OFFSET] = K::CODEC_ID;
        self.buf[VALUE_CODEC_OFFSET] = V::CODEC_ID;
        self.write_pointer(FREE_LIST_POINTER_OFFSET, BucketPointer::NULL);
        self.write_pointer(LEFT_SIBLING_OFFSET, BucketPointer::NULL);
        self.write_pointer(RIGHT_SIBLING_OFFSET, BucketPointer::NULL);
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        if deleted {
            self.buf[FLAGS_OFFSET] |= FLAG_DELETED;
        } else {
            self.buf[FLAGS_OFFSET] &= !FLAG_DELETED;
        }
    }

    pub fn set_free_list_pointer(&mut self, pointer: BucketPointer) {
        self.write_pointer(FREE_LIST_POINTER_OFFSET, pointer);
    }

    pub fn set_left_sibling(&mut self, pointer: BucketPointer) {
        self.write_pointer(LEFT_SIBLING_OFFSET, pointer);
    }

    pub fn set_right_sibling(&mut self, pointer: BucketPointer) {
        self.write_pointer(RIGHT_SIBLING_OFFSET, pointer);
    }

    pub fn set_tree_size(&mut self, size: u64) {
        self.write_u64(TREE_SIZE_OFFSET, size);
    }

    pub fn set_identifier(&mut self, identifier: u64) {
        self.write_u64(IDENTIFIER_OFFSET, identifier);
    }

    fn encode_entry(entry: &BucketEntry<K, V>) -> Vec<u8> {
        let mut bytes = Vec::new();
        match entry {
            BucketEntry::Leaf { key, value } => {
                bytes.reserve(key.encoded_len() + value.encoded_len());
                key.encode_into(&mut bytes);
                value.encode_into(&mut bytes);
            }
            BucketEntry::Branch { left, right, key } => {
                bytes.resize(BRANCH_ENTRY_HEADER_LEN, 0);
                left.encode(&mut bytes[..BucketPointer::ENCODED_LEN]);
                right.encode(&mut bytes[BucketPointer::ENCODED_LEN..]);
                key.encode_into(&mut bytes);
            }
        }
        bytes
    }

    /// Inserts `entry` at position `index`, keeping the slot directory
    /// sorted. Returns `false` when the bucket cannot hold the entry, in
    /// which case the caller must split. With `update_neighbors`, adjacent branch entries'
    /// shared child pointers are reconciled with the new entry's children.
    pub fn add_entry(
        &mut self,
        index: usize,
        entry: &BucketEntry<K, V>,
        update_neighbors: bool,
    ) -> Result<bool> {
        debug_assert_eq!(
            self.view().is_leaf(),
            matches!(entry, BucketEntry::Leaf { .. }),
            "entry kind must match the bucket kind",
        );
        let bytes = Self::encode_entry(entry);
        let size = self.view().size();
        if index > size {
            return Err(BonsaiError::Corruption("bucket insertion index out of range"));
        }
        if bytes.len() + SLOT_ENTRY_LEN > self.view().free_space()? {
            return Ok(false);
        }

        let new_free_pointer = self.view().free_pointer() - bytes.len();
        self.buf[new_free_pointer..new_free_pointer + bytes.len()].copy_from_slice(&bytes);
        self.write_u16(FREE_POINTER_OFFSET, new_free_pointer as u16);

        // Open a slot at `index`.
        let slot_start = POSITIONS_ARRAY_OFFSET + index * SLOT_ENTRY_LEN;
        let directory_end = POSITIONS_ARRAY_OFFSET + size * SLOT_ENTRY_LEN;
        self.buf
            .copy_within(slot_start..directory_end, slot_start + SLOT_ENTRY_LEN);
        self.write_u16(slot_start, new_free_pointer as u16);
        self.write_u16(SIZE_OFFSET, (size + 1) as u16);

        if update_neighbors {
            if let BucketEntry::Branch { left, right, .. } = entry {
                if index > 0 {
                    let neighbor = self.view().slot(index - 1)?;
                    self.write_pointer(neighbor + BucketPointer::ENCODED_LEN, *left);
                }
                if index + 1 < size + 1 {
                    let neighbor = self.view().slot(index + 1)?;
                    self.write_pointer(neighbor, *right);
                }
            }
        }
        Ok(true)
    }

    /// Overwrites the value of leaf entry `index` in place when the new
    /// encoding has the old length.
    pub fn update_value(&mut self, index: usize, value: &V) -> Result<UpdateResult> {
        debug_assert!(self.view().is_leaf());
        let offset = self.view().slot(index)?;
        let key_len = K::encoded_len_at(&self.buf[offset..])?;
        let old_len = V::encoded_len_at(&self.buf[offset + key_len..])?;

        let mut bytes = Vec::with_capacity(value.encoded_len());
        value.encode_into(&mut bytes);
        if bytes.len() != old_len {
            return Ok(UpdateResult::Reinsert);
        }
        let value_at = offset + key_len;
        if self.buf[value_at..value_at + old_len] == bytes[..] {
            return Ok(UpdateResult::NoChange);
        }
        self.buf[value_at..value_at + old_len].copy_from_slice(&bytes);
        Ok(UpdateResult::Updated)
    }

    /// Removes entry `index`, compacting the payload and the slot
    /// directory. On branches the entry's child pointers are simply
    /// discarded; ownership of the subtree rests with the neighbors' shared
    /// pointers.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        let entry_offset = self.view().slot(index)?;
        let entry_len = self.view().entry_len(index)?;
        let free_pointer = self.view().free_pointer();
        let size = self.view().size();

        // Slide the payload below the removed entry upward over it.
        self.buf
            .copy_within(free_pointer..entry_offset, free_pointer + entry_len);
        self.write_u16(FREE_POINTER_OFFSET, (free_pointer + entry_len) as u16);

        // Close the slot and rebase every offset that pointed below the
        // removed entry.
        let slot_start = POSITIONS_ARRAY_OFFSET + index * SLOT_ENTRY_LEN;
        let directory_end = POSITIONS_ARRAY_OFFSET + size * SLOT_ENTRY_LEN;
        self.buf
            .copy_within(slot_start + SLOT_ENTRY_LEN..directory_end, slot_start);
        self.write_u16(SIZE_OFFSET, (size - 1) as u16);
        for i in 0..size - 1 {
            let slot_at = POSITIONS_ARRAY_OFFSET + i * SLOT_ENTRY_LEN;
            let offset = u16::from_be_bytes(self.buf[slot_at..slot_at + 2].try_into().unwrap());
            if (offset as usize) < entry_offset {
                self.write_u16(slot_at, offset + entry_len as u16);
            }
        }
        Ok(())
    }

    /// Bulk-loads `entries` in order into an empty bucket; used by splits.
    pub fn add_all(&mut self, entries: &[BucketEntry<K, V>]) -> Result<()> {
        for (i, entry) in entries.iter().enumerate() {
            if !self.add_entry(i, entry, false)? {
                return Err(BonsaiError::Usage("bucket cannot hold split entries"));
            }
        }
        Ok(())
    }

    /// Truncates the bucket to its first `new_size` entries, compacting the
    /// payload so the freed bytes become available again.
    pub fn shrink(&mut self, new_size: usize) -> Result<()> {
        let size = self.view().size();
        if new_size > size {
            return Err(BonsaiError::Corruption("bucket shrink beyond size"));
        }
        let mut kept: Vec<Vec<u8>> = Vec::with_capacity(new_size);
        for i in 0..new_size {
            let offset = self.view().slot(i)?;
            let len = self.view().entry_len(i)?;
            kept.push(self.buf[offset..offset + len].to_vec());
        }
        let mut free_pointer = self.buf.len();
        for (i, bytes) in kept.iter().enumerate() {
            free_pointer -= bytes.len();
            self.buf[free_pointer..free_pointer + bytes.len()].copy_from_slice(bytes);
            self.write_u16(POSITIONS_ARRAY_OFFSET + i * SLOT_ENTRY_LEN, free_pointer as u16);
        }
        self.write_u16(FREE_POINTER_OFFSET, free_pointer as u16);
        self.write_u16(SIZE_OFFSET, new_size as u16);
        Ok(())
    }
}
