#![forbid(unsafe_code)]

//! Disk-resident ordered key-value indexes that share one file.
//!
//! A conventional disk B-tree spends a whole page per node, which is wasteful
//! when an application needs hundreds of small indexes, as an embedded
//! graph database does for its per-vertex edge bags. Here a
//! node occupies a *bucket*, a fixed-size subpage, so many independent trees
//! cohabit a single file. Each tree is addressed by the stable pointer of its
//! root bucket; recycled buckets feed a per-file free list that later
//! allocations drain.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bonsai::{AtomicOperationsManager, BonsaiOptions, BonsaiTree, PageCache};
//!
//! # fn main() -> bonsai::Result<()> {
//! let cache = Arc::new(PageCache::new("./data", BonsaiOptions::default())?);
//! let atomics = Arc::new(AtomicOperationsManager::new(cache));
//!
//! let tree: BonsaiTree<u64, u64> = BonsaiTree::create(&atomics, "edges.sbt", 7)?;
//! tree.put(&10, &100)?;
//! assert_eq!(tree.get(&10)?, Some(100));
//!
//! // The root pointer is the durable handle to find the tree again.
//! let root = tree.root_pointer();
//! let again: BonsaiTree<u64, u64> =
//!     BonsaiTree::load(&atomics, "edges.sbt", root)?.expect("tree exists");
//! assert_eq!(again.size()?, 1);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod codecs;
pub mod concurrency;
pub mod config;
pub mod error;
pub mod tree;
pub mod types;

pub use cache::{AtomicOperation, AtomicOperationsManager, CacheEntry, PageCache};
pub use codecs::{KeyCodec, RecordId, ValCodec};
pub use config::BonsaiOptions;
pub use error::{BonsaiError, Result};
pub use tree::{BonsaiTree, Change};
pub use types::{BucketPointer, CollectionPointer, FileId};
