//! The per-file metadata bucket at `(0, 0)`.
//!
//! Holds the free-space pointer (the next never-used bucket slot) and the
//! head and length of the free list of recycled buckets. Accessed only
//! under an exclusive latch on page 0.

use crate::error::Result;
use crate::types::BucketPointer;

const MAGIC_OFFSET: usize = 0;
const FREE_SPACE_OFFSET: usize = 1;
const FREE_LIST_HEAD_OFFSET: usize = FREE_SPACE_OFFSET + BucketPointer::ENCODED_LEN;
const FREE_LIST_LENGTH_OFFSET: usize = FREE_LIST_HEAD_OFFSET + BucketPointer::ENCODED_LEN;

const SYS_MAGIC: u8 = 0xB5;

pub struct SysBucket<'a> {
    buf: &'a mut [u8],
}

impl<'a> SysBucket<'a> {
    /// Views the system bucket at the start of the latched page 0 buffer.
    pub fn new(page: &'a mut [u8]) -> Self {
        Self { buf: page }
    }

    pub fn is_initialized(&self) -> bool {
        self.buf[MAGIC_OFFSET] == SYS_MAGIC
    }

    /// First-time setup: the slot after the system bucket is the first
    /// allocatable one and the free list is empty.
    pub fn init(&mut self, bucket_size: usize) -> Result<()> {
        self.buf[MAGIC_OFFSET] = SYS_MAGIC;
        self.set_free_space_pointer(BucketPointer::new(0, bucket_size as i32));
        self.set_free_list_head(BucketPointer::NULL);
        self.set_free_list_length(0);
        Ok(())
    }

    pub fn free_space_pointer(&self) -> BucketPointer {
        BucketPointer::decode(&self.buf[FREE_SPACE_OFFSET..])
    }

    pub fn set_free_space_pointer(&mut self, pointer: BucketPointer) {
        pointer.encode(&mut self.buf[FREE_SPACE_OFFSET..]);
    }

    pub fn free_list_head(&self) -> BucketPointer {
        BucketPointer::decode(&self.buf[FREE_LIST_HEAD_OFFSET..])
    }

    pub fn set_free_list_head(&mut self, pointer: BucketPointer) {
        pointer.encode(&mut self.buf[FREE_LIST_HEAD_OFFSET..]);
    }

    pub fn free_list_length(&self) -> u64 {
        u64::from_be_bytes(
            self.buf[FREE_LIST_LENGTH_OFFSET..FREE_LIST_LENGTH_OFFSET + 8]
                .try_into()
                .unwrap(),
        )
    }

    pub fn set_free_list_length(&mut self, length: u64) {
        self.buf[FREE_LIST_LENGTH_OFFSET..FREE_LIST_LENGTH_OFFSET + 8]
            .copy_from_slice(&length.to_be_bytes());
    }
}
