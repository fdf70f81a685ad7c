use crate::error::{BonsaiError, Result};
use crate::tree::bucket;

/// Tuning knobs shared by the page cache and the tree engine.
#[derive(Clone, Debug)]
pub struct BonsaiOptions {
    /// Size of one page in bytes. Every file is a sequence of pages of this
    /// size.
    pub page_size: usize,
    /// Size of one bucket (subpage) in bytes. Each page holds
    /// `page_size / bucket_size` buckets at fixed offsets.
    pub bucket_size: usize,
    /// Fraction of total bucket slots that must sit on the free list before
    /// the allocator prefers reuse over bumping the free-space pointer.
    pub free_space_reuse_trigger: f64,
    /// Number of page frames the cache keeps resident before evicting
    /// unpinned frames.
    pub cache_pages: usize,
}

impl Default for BonsaiOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            bucket_size: 1024,
            free_space_reuse_trigger: 0.5,
            cache_pages: 128,
        }
    }
}

impl BonsaiOptions {
    /// Number of bucket slots per page.
    pub fn buckets_per_page(&self) -> usize {
        self.page_size / self.bucket_size
    }

    /// Rejects geometries the engine cannot operate on. A bucket must fit
    /// inside a page and must be able to hold its header plus at least one
    /// branch entry, otherwise a root split could never write the single
    /// promoted separator.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.bucket_size == 0 {
            return Err(BonsaiError::Usage("page and bucket sizes must be non-zero"));
        }
        if self.bucket_size > self.page_size {
            return Err(BonsaiError::Usage("bucket size exceeds page size"));
        }
        if self.bucket_size > u16::MAX as usize {
            return Err(BonsaiError::Usage("bucket size exceeds u16 offsets"));
        }
        if self.bucket_size < bucket::MIN_BUCKET_SIZE {
            return Err(BonsaiError::Usage(
                "bucket size cannot hold a header and one branch entry",
            ));
        }
        if !(0.0..=1.0).contains(&self.free_space_reuse_trigger) {
            return Err(BonsaiError::Usage(
                "free space reuse trigger must be within [0, 1]",
            ));
        }
        Ok(())
    }
}
