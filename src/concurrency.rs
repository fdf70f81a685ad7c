//! Striped shared/exclusive lock table keyed by opaque ids.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

const DEFAULT_STRIPES: usize = 64;

/// Lock manager partitioning its keyspace over a fixed set of read/write
/// locks. Keys hashing to the same stripe contend with each other, which is
/// acceptable for the small id spaces it guards (file ids, component ids).
///
/// Guards release on drop; callers hold them for the duration of an
/// operation.
pub struct PartitionedLockManager {
    stripes: Box<[RwLock<()>]>,
}

/// Shared-mode guard returned by [`PartitionedLockManager::shared`].
pub struct SharedLock<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Exclusive-mode guard returned by [`PartitionedLockManager::exclusive`].
pub struct ExclusiveLock<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl PartitionedLockManager {
    pub fn new() -> Self {
        Self::with_stripes(DEFAULT_STRIPES)
    }

    pub fn with_stripes(stripes: usize) -> Self {
        debug_assert!(stripes.is_power_of_two());
        let stripes = (0..stripes.max(1))
            .map(|_| RwLock::new(()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { stripes }
    }

    fn stripe(&self, key: u64) -> &RwLock<()> {
        // Fibonacci hashing spreads sequential ids across stripes.
        let h = key.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.stripes[(h >> 32) as usize & (self.stripes.len() - 1)]
    }

    /// Acquires `key` in shared mode, blocking while an exclusive holder
    /// exists.
    pub fn shared(&self, key: u64) -> SharedLock<'_> {
        SharedLock {
            _guard: self.stripe(key).read(),
        }
    }

    /// Acquires `key` in exclusive mode, blocking out readers and other
    /// writers.
    pub fn exclusive(&self, key: u64) -> ExclusiveLock<'_> {
        ExclusiveLock {
            _guard: self.stripe(key).write(),
        }
    }
}

impl Default for PartitionedLockManager {
    fn default() -> Self {
        Self::new()
    }
}
