//! Bucket allocation and recycling.
//!
//! Fresh buckets come from two sources: the free list of recycled buckets
//! (preferred once it covers a configured fraction of all bucket slots in
//! the file) and the free-space pointer, which bumps through never-used
//! slots and extends the file by a page when the current one is exhausted.
//! Recycling pushes whole subtrees onto the free list in one pass.

use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::cache::{AtomicOperation, CacheEntry, PageCache};
use crate::codecs::{KeyCodec, ValCodec};
use crate::error::{BonsaiError, Result};
use crate::tree::bucket::{BonsaiBucket, BonsaiBucketMut};
use crate::tree::sys_bucket::SysBucket;
use crate::types::{BucketPointer, FileId};

/// Address of the system bucket.
pub const SYS_BUCKET: BucketPointer = BucketPointer::new(0, 0);

/// Creates page 0 on first use and initializes the system bucket when its
/// magic byte is absent. Idempotent for files that already carry one.
pub fn init_sys_bucket(
    cache: &PageCache,
    op: &mut AtomicOperation<'_>,
    file_id: FileId,
) -> Result<()> {
    let entry = match cache.load_page(file_id, SYS_BUCKET.page())? {
        Some(entry) => entry,
        None => {
            let entry = op.add_page(file_id)?;
            if entry.page_index() == SYS_BUCKET.page() {
                entry
            } else {
                // A concurrent creator added page 0 first; the stray page
                // stays unused and the real system page is loaded instead.
                drop(entry);
                cache
                    .load_page(file_id, SYS_BUCKET.page())?
                    .ok_or(BonsaiError::Corruption("system bucket page missing"))?
            }
        }
    };
    let mut guard = entry.exclusive_latch();
    op.capture_page(file_id, SYS_BUCKET.page(), &guard);
    let mut sys = SysBucket::new(&mut guard);
    if !sys.is_initialized() {
        sys.init(cache.options().bucket_size)?;
        debug!(file = file_id.0, "sys bucket initialized");
    }
    Ok(())
}

/// Hands out one bucket, preferring the free list once it covers the
/// configured fraction of all bucket slots in the file.
///
/// The returned cache entry is pinned but **unlatched**; the caller must
/// acquire the exclusive latch and initialize the bucket before use.
pub fn allocate_bucket<K: KeyCodec, V: ValCodec>(
    cache: &PageCache,
    op: &mut AtomicOperation<'_>,
    file_id: FileId,
) -> Result<(BucketPointer, CacheEntry)> {
    let options = cache.options();
    let bucket_size = options.bucket_size;

    let sys_entry = cache
        .load_page(file_id, SYS_BUCKET.page())?
        .ok_or(BonsaiError::Corruption("system bucket page missing"))?;
    let mut sys_guard = sys_entry.exclusive_latch();
    op.capture_page(file_id, SYS_BUCKET.page(), &sys_guard);

    let (free_list_head, free_list_length, free_space) = {
        let sys = SysBucket::new(&mut sys_guard);
        (
            sys.free_list_head(),
            sys.free_list_length(),
            sys.free_space_pointer(),
        )
    };
    let total_slots = cache.filled_up_to(file_id)? * options.buckets_per_page() as u64;
    let reuse = total_slots > 0
        && free_list_head.is_valid()
        && free_list_length as f64 / total_slots as f64 >= options.free_space_reuse_trigger;

    if reuse {
        // Detach the head. Its page may be page 0, whose latch this thread
        // already holds, so the next-pointer read goes through the held
        // buffer in that case instead of latching again.
        let next_head = if free_list_head.page() == SYS_BUCKET.page() {
            let bucket =
                BonsaiBucket::<K, V>::new(&sys_guard, free_list_head.offset(), bucket_size)?;
            bucket.free_list_pointer()
        } else {
            let entry = cache
                .load_page(file_id, free_list_head.page())?
                .ok_or(BonsaiError::Corruption("free list head page missing"))?;
            let guard = entry.shared_latch();
            let bucket =
                BonsaiBucket::<K, V>::new(&guard, free_list_head.offset(), bucket_size)?;
            bucket.free_list_pointer()
        };
        {
            let mut sys = SysBucket::new(&mut sys_guard);
            sys.set_free_list_head(next_head);
            sys.set_free_list_length(free_list_length - 1);
        }
        drop(sys_guard);
        let entry = cache
            .load_page(file_id, free_list_head.page())?
            .ok_or(BonsaiError::Corruption("free list head page missing"))?;
        trace!(file = file_id.0, bucket = %free_list_head, "allocator reused free-list bucket");
        return Ok((free_list_head, entry));
    }

    if free_space.offset() + bucket_size > options.page_size {
        // The current page is exhausted; extend the file and hand out the
        // new page's first slot.
        let entry = op.add_page(file_id)?;
        let page_index = entry.page_index() as i64;
        let mut sys = SysBucket::new(&mut sys_guard);
        sys.set_free_space_pointer(BucketPointer::new(page_index, bucket_size as i32));
        trace!(file = file_id.0, page = page_index, "allocator extended file");
        Ok((BucketPointer::new(page_index, 0), entry))
    } else {
        {
            let mut sys = SysBucket::new(&mut sys_guard);
            sys.set_free_space_pointer(BucketPointer::new(
                free_space.page_index,
                free_space.page_offset + bucket_size as i32,
            ));
        }
        drop(sys_guard);
        let entry = cache
            .load_page(file_id, free_space.page())?
            .ok_or(BonsaiError::Corruption("free space page missing"))?;
        trace!(file = file_id.0, bucket = %free_space, "allocator bumped free space");
        Ok((free_space, entry))
    }
}

/// Pushes the children of a branch bucket onto the recycle queue: the first
/// entry's left child plus every entry's right child covers all `n + 1`
/// subtrees.
pub fn enqueue_children<K: KeyCodec, V: ValCodec>(
    bucket: &BonsaiBucket<'_, K, V>,
    queue: &mut VecDeque<BucketPointer>,
) -> Result<()> {
    if bucket.is_leaf() {
        return Ok(());
    }
    let size = bucket.size();
    if size > 0 {
        queue.push_back(bucket.get_entry(0)?.left_child());
    }
    for i in 0..size {
        queue.push_back(bucket.get_entry(i)?.right_child());
    }
    Ok(())
}

/// Recycles every bucket reachable from the queued pointers (children
/// included) onto the free list.
///
/// The walk links the batch into a chain head-first, so the first bucket
/// dequeued ends up as the chain's terminal element; splicing writes that
/// tail bucket's free-list pointer to the previous head, then publishes the
/// new head and the grown length in the system bucket.
pub fn recycle_subtrees<K: KeyCodec, V: ValCodec>(
    cache: &PageCache,
    op: &mut AtomicOperation<'_>,
    file_id: FileId,
    mut queue: VecDeque<BucketPointer>,
) -> Result<()> {
    let bucket_size = cache.options().bucket_size;
    let mut head = BucketPointer::NULL;
    let mut tail = BucketPointer::NULL;
    let mut recycled: u64 = 0;

    while let Some(pointer) = queue.pop_front() {
        if !tail.is_valid() {
            tail = pointer;
        }
        let entry = cache
            .load_page(file_id, pointer.page())?
            .ok_or(BonsaiError::Corruption("recycled bucket page missing"))?;
        let mut guard = entry.exclusive_latch();
        op.capture_page(file_id, pointer.page(), &guard);
        let mut bucket = BonsaiBucketMut::<K, V>::new(&mut guard, pointer.offset(), bucket_size)?;
        enqueue_children(&bucket.view(), &mut queue)?;
        bucket.set_free_list_pointer(head);
        bucket.set_deleted(true);
        head = pointer;
        recycled += 1;
    }

    if !head.is_valid() {
        return Ok(());
    }

    let sys_entry = cache
        .load_page(file_id, SYS_BUCKET.page())?
        .ok_or(BonsaiError::Corruption("system bucket page missing"))?;
    let mut sys_guard = sys_entry.exclusive_latch();
    op.capture_page(file_id, SYS_BUCKET.page(), &sys_guard);
    let old_head;
    {
        let mut sys = SysBucket::new(&mut sys_guard);
        old_head = sys.free_list_head();
        sys.set_free_list_head(head);
        let length = sys.free_list_length();
        sys.set_free_list_length(length + recycled);
    }

    // Splice the batch tail onto the previous head. The tail may live on
    // page 0, whose latch this thread already holds; reuse that buffer
    // instead of latching the page again.
    if tail.page() == SYS_BUCKET.page() {
        let mut bucket = BonsaiBucketMut::<K, V>::new(&mut sys_guard, tail.offset(), bucket_size)?;
        bucket.set_free_list_pointer(old_head);
    } else {
        let entry = cache
            .load_page(file_id, tail.page())?
            .ok_or(BonsaiError::Corruption("free list tail page missing"))?;
        let mut guard = entry.exclusive_latch();
        op.capture_page(file_id, tail.page(), &guard);
        let mut bucket = BonsaiBucketMut::<K, V>::new(&mut guard, tail.offset(), bucket_size)?;
        bucket.set_free_list_pointer(old_head);
    }

    debug!(file = file_id.0, count = recycled, "recycled subtree buckets");
    Ok(())
}
