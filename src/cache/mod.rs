//! Read-through / write-back page cache.
//!
//! The cache owns every open file in one directory and hands out pinned
//! [`CacheEntry`] handles. A pinned page stays resident until the handle is
//! dropped; unpinned frames are eviction candidates once the cache grows past
//! its configured capacity, with dirty frames written back before reuse.
//! Page latches are the per-frame read/write locks exposed through
//! [`CacheEntry::shared_latch`] and [`CacheEntry::exclusive_latch`].

mod atomic;
mod io;

pub use atomic::{AtomicOperation, AtomicOperationsManager, ComponentId};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::config::BonsaiOptions;
use crate::error::{BonsaiError, Result};
use crate::types::FileId;
use io::RandomAccessFile;

/// Shared page latch over the frame buffer.
pub type PageReadGuard<'a> = RwLockReadGuard<'a, Box<[u8]>>;
/// Exclusive page latch over the frame buffer.
pub type PageWriteGuard<'a> = RwLockWriteGuard<'a, Box<[u8]>>;

struct Frame {
    file_id: FileId,
    page_index: u64,
    buf: RwLock<Box<[u8]>>,
    pin_count: AtomicU32,
    dirty: AtomicBool,
}

impl Frame {
    fn new(file_id: FileId, page_index: u64, page_size: usize) -> Self {
        Self {
            file_id,
            page_index,
            buf: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            pin_count: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
        }
    }
}

/// Pinned handle to a cached page. The pin is released when the handle is
/// dropped; latches must not outlive the handle.
pub struct CacheEntry {
    frame: Arc<Frame>,
}

impl CacheEntry {
    fn pin(frame: &Arc<Frame>) -> Self {
        frame.pin_count.fetch_add(1, Ordering::AcqRel);
        Self {
            frame: Arc::clone(frame),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.frame.file_id
    }

    pub fn page_index(&self) -> u64 {
        self.frame.page_index
    }

    /// Acquires the page latch in shared mode for reading.
    pub fn shared_latch(&self) -> PageReadGuard<'_> {
        self.frame.buf.read()
    }

    /// Acquires the page latch in exclusive mode and marks the page dirty;
    /// the write-back path persists it on flush, eviction, or close.
    pub fn exclusive_latch(&self) -> PageWriteGuard<'_> {
        let guard = self.frame.buf.write();
        self.frame.dirty.store(true, Ordering::Release);
        guard
    }
}

impl Drop for CacheEntry {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

struct FileState {
    io: Arc<RandomAccessFile>,
    name: String,
    page_count: u64,
}

struct CacheInner {
    files: HashMap<FileId, FileState>,
    by_name: HashMap<String, FileId>,
    next_file_id: u64,
    frames: HashMap<(FileId, u64), Arc<Frame>>,
}

/// Page cache over one directory of page-structured files.
pub struct PageCache {
    dir: PathBuf,
    options: BonsaiOptions,
    inner: Mutex<CacheInner>,
}

impl PageCache {
    /// Opens a cache rooted at `dir`, creating the directory when absent.
    pub fn new(dir: impl AsRef<Path>, options: BonsaiOptions) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            options,
            inner: Mutex::new(CacheInner {
                files: HashMap::new(),
                by_name: HashMap::new(),
                next_file_id: 1,
                frames: HashMap::new(),
            }),
        })
    }

    pub fn options(&self) -> &BonsaiOptions {
        &self.options
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Creates a new empty file and returns its id. Fails if a file with
    /// that name already exists on disk or is already open.
    pub fn add_file(&self, name: &str) -> Result<FileId> {
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) || self.path_of(name).exists() {
            return Err(BonsaiError::Usage("file already exists"));
        }
        let io = Arc::new(RandomAccessFile::open(self.path_of(name), true)?);
        let file_id = FileId(inner.next_file_id);
        inner.next_file_id += 1;
        inner.files.insert(
            file_id,
            FileState {
                io,
                name: name.to_string(),
                page_count: 0,
            },
        );
        inner.by_name.insert(name.to_string(), file_id);
        debug!(file = name, id = file_id.0, "cache.add_file");
        Ok(file_id)
    }

    /// Opens an existing file, returning the id of the already-open instance
    /// when the name is known.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.by_name.get(name) {
            return Ok(id);
        }
        let io = Arc::new(RandomAccessFile::open(self.path_of(name), false)?);
        let len = io.len()?;
        let page_size = self.options.page_size as u64;
        if len % page_size != 0 {
            return Err(BonsaiError::Corruption("file length is not page aligned"));
        }
        let file_id = FileId(inner.next_file_id);
        inner.next_file_id += 1;
        inner.files.insert(
            file_id,
            FileState {
                io,
                name: name.to_string(),
                page_count: len / page_size,
            },
        );
        inner.by_name.insert(name.to_string(), file_id);
        debug!(file = name, id = file_id.0, pages = len / page_size, "cache.open_file");
        Ok(file_id)
    }

    pub fn is_file_exists(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        inner.by_name.contains_key(name) || self.path_of(name).exists()
    }

    /// Number of pages the file logically holds, counting pages added but
    /// not yet written back.
    pub fn filled_up_to(&self, file_id: FileId) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(file_state(&inner, file_id)?.page_count)
    }

    /// Loads and pins the page, or returns `None` when `page_index` lies
    /// past the end of the file.
    pub fn load_page(&self, file_id: FileId, page_index: u64) -> Result<Option<CacheEntry>> {
        let mut inner = self.inner.lock();
        if page_index >= file_state(&inner, file_id)?.page_count {
            return Ok(None);
        }
        if let Some(frame) = inner.frames.get(&(file_id, page_index)) {
            return Ok(Some(CacheEntry::pin(frame)));
        }
        self.evict_if_needed(&mut inner);
        let frame = Arc::new(Frame::new(file_id, page_index, self.options.page_size));
        {
            let state = file_state(&inner, file_id)?;
            let page_size = self.options.page_size as u64;
            let offset = page_index * page_size;
            // Pages past the physical end were added but never flushed
            // before their frame went away; they read back as zeroes.
            if offset + page_size <= state.io.len()? {
                let mut buf = frame.buf.write();
                state.io.read_exact_at(offset, &mut buf)?;
            }
        }
        let entry = CacheEntry::pin(&frame);
        inner.frames.insert((file_id, page_index), frame);
        Ok(Some(entry))
    }

    /// Appends a fresh zeroed page to the file and pins it.
    pub fn add_page(&self, file_id: FileId) -> Result<CacheEntry> {
        let mut inner = self.inner.lock();
        self.evict_if_needed(&mut inner);
        let page_index = {
            let state = file_state_mut(&mut inner, file_id)?;
            let idx = state.page_count;
            state.page_count += 1;
            idx
        };
        let frame = Arc::new(Frame::new(file_id, page_index, self.options.page_size));
        frame.dirty.store(true, Ordering::Release);
        let entry = CacheEntry::pin(&frame);
        inner.frames.insert((file_id, page_index), frame);
        Ok(entry)
    }

    /// Shrinks the file back to `page_count` pages, discarding frames past
    /// the new end. Used by atomic-operation rollback to undo growth.
    pub fn truncate_file(&self, file_id: FileId, page_count: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let doomed: Vec<(FileId, u64)> = inner
            .frames
            .iter()
            .filter(|((f, p), _)| *f == file_id && *p >= page_count)
            .map(|(&k, _)| k)
            .collect();
        for key in &doomed {
            let frame = &inner.frames[key];
            if frame.pin_count.load(Ordering::Acquire) != 0 {
                return Err(BonsaiError::Usage("cannot truncate a pinned page"));
            }
        }
        for key in doomed {
            inner.frames.remove(&key);
        }
        let page_size = self.options.page_size as u64;
        let state = file_state_mut(&mut inner, file_id)?;
        state.page_count = page_count;
        let byte_len = page_count * page_size;
        if state.io.len()? > byte_len {
            state.io.set_len(byte_len)?;
        }
        Ok(())
    }

    /// Writes every dirty frame of the file back and syncs it.
    ///
    /// Frames are snapshotted under the cache lock but written outside it:
    /// a pinned frame's latch may be held by a thread that is itself about
    /// to call into the cache.
    pub fn flush_file(&self, file_id: FileId) -> Result<()> {
        let (frames, io) = {
            let inner = self.inner.lock();
            let io = Arc::clone(&file_state(&inner, file_id)?.io);
            let frames: Vec<Arc<Frame>> = inner
                .frames
                .values()
                .filter(|frame| frame.file_id == file_id)
                .cloned()
                .collect();
            (frames, io)
        };
        for frame in frames {
            self.write_frame(&frame, &io)?;
        }
        io.sync()?;
        Ok(())
    }

    /// Flushes every open file.
    pub fn flush(&self) -> Result<()> {
        let (frames, files) = {
            let inner = self.inner.lock();
            let frames: Vec<(Arc<Frame>, Arc<RandomAccessFile>)> = inner
                .frames
                .values()
                .filter_map(|frame| {
                    inner
                        .files
                        .get(&frame.file_id)
                        .map(|state| (Arc::clone(frame), Arc::clone(&state.io)))
                })
                .collect();
            let files: Vec<Arc<RandomAccessFile>> = inner
                .files
                .values()
                .map(|state| Arc::clone(&state.io))
                .collect();
            (frames, files)
        };
        for (frame, io) in frames {
            self.write_frame(&frame, &io)?;
        }
        for io in files {
            io.sync()?;
        }
        Ok(())
    }

    /// Closes the file, optionally flushing dirty pages first. Pinned pages
    /// make the close a usage error.
    pub fn close_file(&self, file_id: FileId, flush: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let pinned = inner.frames.values().any(|f| {
            f.file_id == file_id && f.pin_count.load(Ordering::Acquire) != 0
        });
        if pinned {
            return Err(BonsaiError::Usage("cannot close a file with pinned pages"));
        }
        if flush {
            // No pins means no outstanding latches, so writing under the
            // cache lock cannot block on a latch holder here.
            let io = Arc::clone(&file_state(&inner, file_id)?.io);
            for frame in inner.frames.values() {
                if frame.file_id == file_id {
                    self.write_frame(frame, &io)?;
                }
            }
            io.sync()?;
        }
        inner.frames.retain(|(f, _), _| *f != file_id);
        if let Some(state) = inner.files.remove(&file_id) {
            inner.by_name.remove(&state.name);
            debug!(file = %state.name, id = file_id.0, "cache.close_file");
        }
        Ok(())
    }

    /// Writes one frame back when dirty. The dirty flag is cleared before
    /// the copy is taken, so a concurrent mutation re-dirties the frame and
    /// the next flush picks it up again.
    fn write_frame(&self, frame: &Frame, io: &RandomAccessFile) -> Result<()> {
        if !frame.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let buf = frame.buf.read();
        let offset = frame.page_index * self.options.page_size as u64;
        if let Err(err) = io.write_all_at(offset, &buf) {
            frame.dirty.store(true, Ordering::Release);
            return Err(err);
        }
        Ok(())
    }

    fn evict_if_needed(&self, inner: &mut CacheInner) {
        while inner.frames.len() >= self.options.cache_pages {
            let victim = inner
                .frames
                .iter()
                .find(|(_, f)| f.pin_count.load(Ordering::Acquire) == 0)
                .map(|(&k, _)| k);
            let Some(key) = victim else {
                warn!(
                    frames = inner.frames.len(),
                    capacity = self.options.cache_pages,
                    "cache.no_eviction_candidate"
                );
                return;
            };
            let frame = inner.frames.get(&key).cloned().expect("victim frame present");
            let Some(io) = inner.files.get(&frame.file_id).map(|s| Arc::clone(&s.io)) else {
                return;
            };
            if let Err(err) = self.write_frame(&frame, &io) {
                warn!(error = %err, page = key.1, "cache.evict_write_back_failed");
                return;
            }
            inner.frames.remove(&key);
            debug!(file = key.0 .0, page = key.1, "cache.evict");
        }
    }
}

fn file_state(inner: &CacheInner, file_id: FileId) -> Result<&FileState> {
    inner
        .files
        .get(&file_id)
        .ok_or(BonsaiError::Usage("file is not open"))
}

fn file_state_mut(inner: &mut CacheInner, file_id: FileId) -> Result<&mut FileState> {
    inner
        .files
        .get_mut(&file_id)
        .ok_or(BonsaiError::Usage("file is not open"))
}
