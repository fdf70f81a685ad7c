//! Atomic operations over cached pages.
//!
//! Every public mutator of a tree runs inside one [`AtomicOperation`].
//! Before a page is mutated its pre-image is captured once; when the
//! operation rolls back, every captured page is restored byte-exactly and
//! file growth performed by the operation is undone. Dropping an operation
//! without committing rolls it back, so an early `?` return cannot leave a
//! half-applied mutation behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::error;

use super::{CacheEntry, PageCache};
use crate::concurrency::{ExclusiveLock, PartitionedLockManager, SharedLock};
use crate::error::{BonsaiError, Result};
use crate::types::FileId;

/// Identity of a registered storage component (one tree instance), used for
/// the outer component lock that serializes lifecycle events against
/// regular operations.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ComponentId(u64);

/// Hands out atomic operations and component locks over one page cache.
pub struct AtomicOperationsManager {
    cache: Arc<PageCache>,
    component_locks: PartitionedLockManager,
    next_component: AtomicU64,
}

impl AtomicOperationsManager {
    pub fn new(cache: Arc<PageCache>) -> Self {
        Self {
            cache,
            component_locks: PartitionedLockManager::new(),
            next_component: AtomicU64::new(1),
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Registers a component and returns the id its locks are keyed by.
    pub fn register_component(&self) -> ComponentId {
        ComponentId(self.next_component.fetch_add(1, Ordering::Relaxed))
    }

    /// Component lock in shared mode; read and write operations of the
    /// component hold this while lifecycle events (freeze, teardown) take
    /// the exclusive side.
    pub fn acquire_read_lock(&self, component: ComponentId) -> SharedLock<'_> {
        self.component_locks.shared(component.0)
    }

    /// Component lock in exclusive mode.
    pub fn acquire_write_lock(&self, component: ComponentId) -> ExclusiveLock<'_> {
        self.component_locks.exclusive(component.0)
    }

    /// Begins an atomic operation. The operation commits explicitly and
    /// rolls back on drop otherwise.
    pub fn start(&self) -> AtomicOperation<'_> {
        AtomicOperation {
            cache: &self.cache,
            pre_images: HashMap::new(),
            file_lengths: HashMap::new(),
            finished: false,
        }
    }
}

/// One unit of mutation with commit/rollback semantics.
pub struct AtomicOperation<'a> {
    cache: &'a PageCache,
    pre_images: HashMap<(FileId, u64), Vec<u8>>,
    file_lengths: HashMap<FileId, u64>,
    finished: bool,
}

impl<'a> AtomicOperation<'a> {
    /// Records the page's pre-image. Callers invoke this right after taking
    /// the exclusive latch and before the first mutation; only the first
    /// capture of a page within one operation is kept.
    pub fn capture_page(&mut self, file_id: FileId, page_index: u64, data: &[u8]) {
        self.pre_images
            .entry((file_id, page_index))
            .or_insert_with(|| data.to_vec());
    }

    /// Appends a page to the file, remembering the pre-growth length so a
    /// rollback can shrink the file back.
    pub fn add_page(&mut self, file_id: FileId) -> Result<CacheEntry> {
        let filled = self.cache.filled_up_to(file_id)?;
        self.file_lengths.entry(file_id).or_insert(filled);
        self.cache.add_page(file_id)
    }

    /// Commits: captured pre-images are discarded and the mutated pages
    /// remain dirty in the cache for write-back.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }

    /// Rolls the operation back explicitly, surfacing restore failures.
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.undo()
    }

    fn undo(&mut self) -> Result<()> {
        // Shrink files first so pre-images of surviving pages restore into
        // valid bounds and pages added by this operation vanish.
        for (&file_id, &len) in &self.file_lengths {
            self.cache.truncate_file(file_id, len)?;
        }
        for ((file_id, page_index), image) in self.pre_images.drain() {
            if page_index >= self.cache.filled_up_to(file_id)? {
                continue;
            }
            let entry = self
                .cache
                .load_page(file_id, page_index)?
                .ok_or(BonsaiError::Corruption("journaled page vanished"))?;
            let mut guard = entry.exclusive_latch();
            guard.copy_from_slice(&image);
        }
        Ok(())
    }
}

impl Drop for AtomicOperation<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.undo() {
            // The original failure is already on its way to the caller;
            // never mask it with the rollback failure.
            error!(error = %err, "atomic operation rollback failed");
        }
    }
}
