//! Page cache: block pool, hash index and eviction chains behind one mutex.
//!
//! All structural state lives in [`CacheState`], guarded by a single cache-wide
//! mutex. The mutex is held while deciding about a block (lookup, binding, lock
//! and pin transitions) and released around every disk I/O and every copy of
//! page content, so a slow disk never stalls operations on other pages.
//!
//! A thread working on a block registers itself as a request on it. While a block
//! has requests, pins or locks it is never evicted, which is what keeps its
//! buffer valid while the mutex is released.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};

use crate::background_worker::{
    BackgroundFlusher, BackgroundFlusherParams, BackgroundWorker, BackgroundWorkerHandle,
};
use crate::block::{Block, BlockId, BlockStatus, allocate_blocks};
use crate::config::PageCacheConfig;
use crate::dirty::DirtyTables;
use crate::error::CacheError;
use crate::flush::{FlushReport, FlushType};
use crate::hash_index::HashIndex;
use crate::io::{BlockIo, LogHandler};
use crate::lock::{LockMode, LockTransition, PinTransition};
use crate::lru::LruPartition;
use crate::page::{FileId, Lsn, PageRef, PageType, set_page_lsn};
use crate::stats::CacheStats;
use crate::wait_queue::WaitQueue;

/// Handle to a block returned by [`PageCache::read`] and [`PageCache::write`].
///
/// Lets the holder unlock or unpin the page without a hash lookup. The link
/// stops being valid once its block is unbound from the page (eviction,
/// [`PageCache::delete_page`], flush with release, resize).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageLink {
    block: BlockId,
    generation: u64,
}

/// How [`PageCache::write`] treats the new content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Mark the block dirty, write it back later.
    Delay,
    /// Write the block to its file before returning.
    Now,
    /// The caller already wrote this content to the file.
    Done,
}

/// What to do when a requested page is not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    /// Bind a block and read the page from disk.
    Read,
    /// Bind a block without reading, the caller overwrites the whole buffer.
    Overwrite,
    /// Do not bind anything.
    Existing,
}

pub(crate) type StateGuard<'a> = MutexGuard<'a, CacheState>;

pub(crate) struct CacheState {
    initialized: bool,
    config: PageCacheConfig,
    pub(crate) block_size: usize,
    pub(crate) blocks: Vec<Block>,
    free_blocks: Vec<BlockId>,
    hash: HashIndex,
    lru: LruPartition,
    pub(crate) dirty: DirtyTables,
    resizing: bool,
    resize_queue: WaitQueue,
    waiting_for_hash_link: WaitQueue,
    waiting_for_block: WaitQueue,
    next_generation: u64,
    read_requests: u64,
    reads: u64,
    write_requests: u64,
    pub(crate) writes: u64,
    evictions: u64,
}

impl CacheState {
    fn new(config: PageCacheConfig) -> Result<Self, CacheError> {
        config.validate()?;
        let count = config.blocks();
        let blocks = allocate_blocks(count, config.block_size)?;
        let hash = HashIndex::new(config.hash_link_count())?;
        Ok(Self {
            initialized: true,
            block_size: config.block_size,
            blocks,
            free_blocks: (0..count).rev().collect(),
            hash,
            lru: LruPartition::new(count, config.tuning(count)),
            dirty: DirtyTables::default(),
            resizing: false,
            resize_queue: WaitQueue::default(),
            waiting_for_hash_link: WaitQueue::default(),
            waiting_for_block: WaitQueue::default(),
            next_generation: 0,
            read_requests: 0,
            reads: 0,
            write_requests: 0,
            writes: 0,
            evictions: 0,
            config,
        })
    }

    pub(crate) fn check_initialized(&self) -> Result<(), CacheError> {
        if self.initialized {
            Ok(())
        } else {
            Err(CacheError::NotInitialized)
        }
    }

    fn check_buffer(&self, len: usize) -> Result<(), CacheError> {
        if len != self.block_size {
            return Err(CacheError::InvalidParameter(
                "buffer length must equal the block size",
            ));
        }
        Ok(())
    }

    /// Byte offset of `page` in its file. Fails for pages whose offset does not fit
    /// in a `u64`.
    pub(crate) fn page_offset(&self, page: PageRef) -> Result<u64, CacheError> {
        page.offset(self.block_size)
            .ok_or(CacheError::InvalidParameter("page offset overflows"))
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Registers the calling thread as working on block `id`.
    pub(crate) fn enter(&mut self, id: BlockId) {
        self.blocks[id].requests += 1;
        if self.lru.contains(id) {
            self.lru.unlink(id);
        }
    }

    /// Ends the calling thread's work on block `id`.
    pub(crate) fn leave(&mut self, id: BlockId) {
        let block = &mut self.blocks[id];
        debug_assert!(block.requests > 0, "block {id} left more often than entered");
        block.requests -= 1;
        if block.orphaned {
            if block.requests == 0 {
                block.orphaned = false;
                self.free_blocks.push(id);
                self.wake_resource_waiters();
            }
            return;
        }
        self.settle(id);
    }

    /// Links block `id` into the eviction chains if nobody uses it anymore.
    pub(crate) fn settle(&mut self, id: BlockId) {
        if self.blocks[id].is_idle() && !self.lru.contains(id) {
            self.lru.link(id);
            self.wake_resource_waiters();
        }
    }

    fn wake_resource_waiters(&mut self) {
        self.waiting_for_block.wake_all();
        self.waiting_for_hash_link.wake_all();
        if self.resizing {
            self.resize_queue.wake_all();
        }
    }

    /// Binds free block `id` to `key` with the calling thread as its only request.
    fn bind(
        &mut self,
        id: BlockId,
        key: PageRef,
        page_type: PageType,
        status: BlockStatus,
    ) -> Result<(), CacheError> {
        if !self.hash.insert(key, id) {
            return Err(CacheError::Corrupted(format!(
                "no hash link left to bind page {key}"
            )));
        }
        let generation = self.next_generation();
        self.lru.reset(id);
        self.lru.touch(id);
        let block = &mut self.blocks[id];
        debug_assert_eq!(block.requests, 0, "free block {id} has requests");
        block.key = key;
        block.status = status;
        block.generation = generation;
        block.page_type = page_type;
        block.requests = 1;
        Ok(())
    }

    /// Detaches block `id` from its page, dropping any unwritten changes. Locks and
    /// pins on the page are gone with it.
    pub(crate) fn unbind(&mut self, id: BlockId) {
        let generation = self.next_generation();
        let key = self.blocks[id].key;
        if self.blocks[id].dirty {
            self.dirty.remove(&key, id);
        }
        self.hash.remove(&key);
        if self.lru.contains(id) {
            self.lru.unlink(id);
        }
        let block = &mut self.blocks[id];
        block.clear_page_state();
        block.status = BlockStatus::Free;
        block.generation = generation;
        block.waiters.wake_all();
        if block.requests > 0 {
            block.orphaned = true;
        } else {
            self.free_blocks.push(id);
        }
        self.wake_resource_waiters();
    }

    pub(crate) fn mark_dirty(&mut self, id: BlockId) {
        let block = &mut self.blocks[id];
        if !block.dirty {
            block.dirty = true;
            let key = block.key;
            self.dirty.insert(key, id);
        }
    }

    pub(crate) fn mark_clean(&mut self, id: BlockId) {
        let block = &mut self.blocks[id];
        if block.dirty {
            block.dirty = false;
            block.rec_lsn = None;
            let key = block.key;
            self.dirty.remove(&key, id);
        }
    }

    /// Releases the calling thread's write lock on block `id`.
    pub(crate) fn release_write(&mut self, id: BlockId) {
        let block = &mut self.blocks[id];
        if block.lock.release_write() {
            block.waiters.wake_all();
        }
    }

    fn block_by_link(&self, link: PageLink) -> Result<BlockId, CacheError> {
        match self.blocks.get(link.block) {
            Some(block) if block.is_bound() && block.generation == link.generation => {
                Ok(link.block)
            }
            _ => Err(CacheError::StaleLink { block: link.block }),
        }
    }

    /// Returns files that have at least one cached page, sorted.
    pub(crate) fn cached_files(&self) -> Vec<FileId> {
        let mut files: Vec<_> = self
            .blocks
            .iter()
            .filter(|block| block.is_bound())
            .map(|block| block.key.file)
            .collect();
        files.sort_unstable();
        files.dedup();
        files
    }

    /// Unbinds clean blocks of `file` nobody uses. Returns how many were released.
    pub(crate) fn release_file_blocks(&mut self, file: FileId) -> usize {
        let mut released = 0;
        for id in 0..self.blocks.len() {
            let block = &self.blocks[id];
            if block.is_bound() && block.key.file == file && block.is_idle() && !block.dirty {
                self.unbind(id);
                released += 1;
            }
        }
        released
    }
}

/// Checks that the caller is in the state `lock` and `pin` claim it is in.
fn check_transition(
    block: &Block,
    lock: LockTransition,
    pin: PinTransition,
) -> Result<(), CacheError> {
    let holds = match lock {
        LockTransition::LeftReadLocked | LockTransition::ReadUnlock => {
            block.lock.reader_is_current()
        }
        LockTransition::LeftWriteLocked
        | LockTransition::WriteUnlock
        | LockTransition::WriteToRead => block.lock.writer_is_current(),
        LockTransition::LeftUnlocked | LockTransition::Read | LockTransition::Write => true,
    };
    if !holds {
        return Err(CacheError::LockNotHeld(block.key));
    }
    check_pin(block, pin)
}

fn check_pin(block: &Block, pin: PinTransition) -> Result<(), CacheError> {
    if matches!(pin, PinTransition::LeftPinned | PinTransition::Unpin) && !block.pinned_by_current()
    {
        return Err(CacheError::NotPinned(block.key));
    }
    Ok(())
}

/// Takes a lock on block `id`, parking the thread until it is granted.
///
/// The calling thread must be registered on the block. Returns `false` if the
/// block was unbound while waiting; the registration is dropped in that case and
/// the caller has to start over. Fails with [`CacheError::NotInitialized`] if the
/// cache is shut down meanwhile, leaving the registration to the caller.
pub(crate) fn lock_block(
    st: &mut StateGuard<'_>,
    id: BlockId,
    mode: LockMode,
) -> Result<bool, CacheError> {
    let block = &mut st.blocks[id];
    let key = block.key;
    let generation = block.generation;
    if block.lock.writer_is_current() || (mode == LockMode::Write && block.lock.reader_is_current())
    {
        return Err(CacheError::WouldDeadlock(key));
    }
    let granted = match mode {
        LockMode::Read => block.lock.try_read(),
        LockMode::Write => block.lock.try_write(),
    };
    if granted {
        return Ok(true);
    }
    let ticket = (mode == LockMode::Write).then(|| block.lock.enqueue_writer());
    debug!("Waiting for {mode:?} lock on page {key}");
    loop {
        let waiter = st.blocks[id].waiters.enqueue();
        waiter.park(st);
        if st.blocks[id].generation != generation {
            st.leave(id);
            return Ok(false);
        }
        let initialized = st.initialized;
        let block = &mut st.blocks[id];
        if !initialized {
            debug!("Page cache shut down while waiting for page {key}");
            if let Some(ticket) = ticket {
                block.lock.cancel_writer(ticket);
            }
            return Err(CacheError::NotInitialized);
        }
        let granted = match ticket {
            Some(ticket) => block.lock.try_write_with_ticket(ticket),
            None => block.lock.try_read(),
        };
        if granted {
            return Ok(true);
        }
    }
}

/// Fixed-block-size cache of file pages.
///
/// Pages are addressed by [`PageRef`]. Access goes through [`PageCache::read`]
/// and [`PageCache::write`], each applying a [`LockTransition`] and a
/// [`PinTransition`] to the page's block. Locks are owned by the thread that took
/// them. Every operation blocks, never fails, on contention: on locks held by
/// other threads, on a full cache and while the cache is being resized.
pub struct PageCache {
    state: Mutex<CacheState>,
    io: Arc<dyn BlockIo>,
    log: Option<Arc<dyn LogHandler>>,
}

impl PageCache {
    /// Allocates the block pool and hash index described by `config`.
    ///
    /// `log` is asked to flush up to a page's LSN before an [`PageType::Lsn`] page
    /// is written back.
    pub fn new(
        config: PageCacheConfig,
        io: Arc<dyn BlockIo>,
        log: Option<Arc<dyn LogHandler>>,
    ) -> Result<Self, CacheError> {
        let state = CacheState::new(config)?;
        info!(
            "Page cache initialized: {} blocks of {} bytes, {} hash links",
            state.blocks.len(),
            state.block_size,
            state.hash.free_links()
        );
        Ok(Self {
            state: Mutex::new(state),
            io,
            log,
        })
    }

    /// Creates new [`PageCache`] together with a [`BackgroundFlusher`] writing its
    /// dirty pages back every `interval`.
    pub fn with_background_flusher(
        config: PageCacheConfig,
        io: Arc<dyn BlockIo>,
        log: Option<Arc<dyn LogHandler>>,
        interval: Duration,
    ) -> Result<(Arc<Self>, BackgroundWorkerHandle), CacheError> {
        let cache = Arc::new(Self::new(config, io, log)?);
        let flusher = BackgroundFlusher::start(BackgroundFlusherParams {
            cache: cache.clone(),
            interval,
        });
        Ok((cache, flusher))
    }

    pub(crate) fn lock_state(&self) -> StateGuard<'_> {
        self.state.lock()
    }

    /// Makes previous writes to `file` durable. Called with the cache mutex released.
    pub(crate) fn sync_file(&self, file: FileId) -> io::Result<()> {
        self.io.sync(file)
    }

    pub fn block_size(&self) -> usize {
        self.state.lock().block_size
    }

    /// Returns the number of blocks.
    pub fn capacity(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Copies `page` into `buf`, loading it from disk if it is not cached, and
    /// applies `lock` to it.
    ///
    /// Accepted transitions are the ones a reader can be in afterwards:
    /// [`LockTransition::LeftUnlocked`], [`LockTransition::LeftReadLocked`],
    /// [`LockTransition::LeftWriteLocked`], [`LockTransition::Read`] and
    /// [`LockTransition::Write`]. Taking a lock also pins the page. `page_type` is
    /// recorded when the page is loaded.
    pub fn read(
        &self,
        page: PageRef,
        page_type: PageType,
        lock: LockTransition,
        buf: &mut [u8],
    ) -> Result<PageLink, CacheError> {
        let fetch = match lock {
            LockTransition::LeftUnlocked | LockTransition::Read | LockTransition::Write => {
                Fetch::Read
            }
            LockTransition::LeftReadLocked | LockTransition::LeftWriteLocked => Fetch::Existing,
            LockTransition::ReadUnlock
            | LockTransition::WriteUnlock
            | LockTransition::WriteToRead => {
                return Err(CacheError::InvalidParameter(
                    "read cannot release a lock",
                ));
            }
        };
        let pin = lock.implied_pin();

        let mut st = self.state.lock();
        st.check_initialized()?;
        st.check_buffer(buf.len())?;
        st.read_requests += 1;
        loop {
            let Some(id) = self.acquire(&mut st, page, page_type, fetch)? else {
                return Err(CacheError::LockNotHeld(page));
            };
            match self.apply_transition(&mut st, id, lock, pin) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    st.leave(id);
                    return Err(e);
                }
            }
            let link = PageLink {
                block: id,
                generation: st.blocks[id].generation,
            };
            let buffer = st.blocks[id].buffer.clone();
            MutexGuard::unlocked(&mut st, || buf.copy_from_slice(&buffer.lock()));
            st.leave(id);
            return Ok(link);
        }
    }

    /// Replaces the content of `page` with `buf`.
    ///
    /// The page does not have to be cached: a block is bound without reading the
    /// page from disk. `lock` must end or start in the write-locked state;
    /// [`LockTransition::LeftUnlocked`] takes a write lock for the duration of the
    /// call. `pin` is applied together with the final lock state. On failure the
    /// caller's lock and pin are left as they were.
    pub fn write(
        &self,
        page: PageRef,
        page_type: PageType,
        lock: LockTransition,
        pin: PinTransition,
        mode: WriteMode,
        buf: &[u8],
    ) -> Result<PageLink, CacheError> {
        let (before, after) = lock.split_for_write().ok_or(CacheError::InvalidParameter(
            "write requires the write lock",
        ))?;
        let fetch = if before == LockTransition::Write {
            Fetch::Overwrite
        } else {
            Fetch::Existing
        };

        let mut st = self.state.lock();
        st.check_initialized()?;
        st.check_buffer(buf.len())?;
        st.write_requests += 1;
        loop {
            let Some(id) = self.acquire(&mut st, page, page_type, fetch)? else {
                return Err(CacheError::LockNotHeld(page));
            };
            if let Err(e) = check_pin(&st.blocks[id], pin) {
                st.leave(id);
                return Err(e);
            }
            match self.apply_transition(&mut st, id, before, PinTransition::LeftUnpinned) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    st.leave(id);
                    return Err(e);
                }
            }

            let buffer = st.blocks[id].buffer.clone();
            MutexGuard::unlocked(&mut st, || buffer.lock().copy_from_slice(buf));
            st.blocks[id].page_type = page_type;

            let written = match mode {
                WriteMode::Delay => {
                    st.mark_dirty(id);
                    Ok(())
                }
                WriteMode::Now => self.write_back(&mut st, id).map(|()| st.mark_clean(id)),
                WriteMode::Done => {
                    st.mark_clean(id);
                    Ok(())
                }
            };
            if let Err(e) = written {
                st.mark_dirty(id);
                if before == LockTransition::Write {
                    st.release_write(id);
                }
                st.leave(id);
                return Err(e);
            }

            let link = PageLink {
                block: id,
                generation: st.blocks[id].generation,
            };
            let result = self.apply_transition(&mut st, id, after, pin).map(|_| link);
            st.leave(id);
            return result;
        }
    }

    /// Applies `lock` and `pin` to a cached page without touching its content.
    ///
    /// `lock` cannot acquire anything ([`LockTransition::Read`] and
    /// [`LockTransition::Write`] are rejected). When `stamp` is given the caller
    /// must hold the write lock: the LSN becomes the page's latest LSN (written into
    /// the header of [`PageType::Lsn`] pages), is recorded as the first redo LSN if
    /// the page has none yet, and the page is marked dirty.
    pub fn unlock(
        &self,
        page: PageRef,
        lock: LockTransition,
        pin: PinTransition,
        stamp: Option<Lsn>,
    ) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        st.check_initialized()?;
        let id = st.hash.find(&page).ok_or(CacheError::PageNotCached(page))?;
        self.unlock_block(&mut st, id, lock, pin, stamp)
    }

    /// Same as [`PageCache::unlock`] for the page `link` was handed out for.
    pub fn unlock_by_link(
        &self,
        link: PageLink,
        lock: LockTransition,
        pin: PinTransition,
        stamp: Option<Lsn>,
    ) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        st.check_initialized()?;
        let id = st.block_by_link(link)?;
        self.unlock_block(&mut st, id, lock, pin, stamp)
    }

    /// Drops one pin of `page`.
    pub fn unpin(&self, page: PageRef) -> Result<(), CacheError> {
        self.unlock(
            page,
            LockTransition::LeftUnlocked,
            PinTransition::Unpin,
            None,
        )
    }

    pub fn unpin_by_link(&self, link: PageLink) -> Result<(), CacheError> {
        self.unlock_by_link(
            link,
            LockTransition::LeftUnlocked,
            PinTransition::Unpin,
            None,
        )
    }

    /// Removes `page` from the cache. Returns `false` if it was not cached.
    ///
    /// `lock` is either [`LockTransition::Write`] or, for a caller already holding
    /// the write lock, [`LockTransition::LeftWriteLocked`]. Fails with
    /// [`CacheError::PagePinned`] while another thread holds a pin on the page. The
    /// lock and the caller's own pins are consumed. With `flush` a dirty page is
    /// written back first, otherwise its changes are discarded.
    pub fn delete_page(
        &self,
        page: PageRef,
        lock: LockTransition,
        flush: bool,
    ) -> Result<bool, CacheError> {
        if !matches!(lock, LockTransition::Write | LockTransition::LeftWriteLocked) {
            return Err(CacheError::InvalidParameter(
                "delete requires the write lock",
            ));
        }

        let mut st = self.state.lock();
        st.check_initialized()?;
        loop {
            let Some(id) = self.acquire(&mut st, page, PageType::Plain, Fetch::Existing)? else {
                return Ok(false);
            };
            match self.apply_transition(&mut st, id, lock, PinTransition::LeftUnpinned) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    st.leave(id);
                    return Err(e);
                }
            }
            let mut result = Ok(true);
            if st.blocks[id].pinned_by_others() {
                result = Err(CacheError::PagePinned(page));
            } else if flush && st.blocks[id].dirty {
                result = self.write_back(&mut st, id).map(|()| true);
            }
            match result {
                Ok(_) => {
                    debug!("Deleting page {page} from cache");
                    st.unbind(id);
                }
                Err(_) if lock == LockTransition::Write => st.release_write(id),
                Err(_) => {}
            }
            st.leave(id);
            return result;
        }
    }

    /// Changes the memory given to the cache and its hot/warm tuning.
    ///
    /// Waits until no block is in use, writes every dirty block back and
    /// reallocates the pool; new requests wait meanwhile. Every cached page is
    /// dropped and every [`PageLink`] becomes stale. If the new pool cannot be
    /// allocated the old one is kept. Returns the new number of blocks.
    pub fn resize(
        &self,
        memory_bytes: usize,
        division_limit: u32,
        age_threshold: u32,
    ) -> Result<usize, CacheError> {
        let mut st = self.state.lock();
        st.check_initialized()?;
        let config = PageCacheConfig {
            memory_bytes,
            division_limit,
            age_threshold,
            ..st.config.clone()
        };
        config.validate()?;

        while st.resizing {
            let waiter = st.resize_queue.enqueue();
            waiter.park(&mut st);
        }
        st.check_initialized()?;
        st.resizing = true;
        info!(
            "Resizing page cache from {} to {} blocks",
            st.blocks.len(),
            config.blocks()
        );

        let result = self.resize_locked(&mut st, config);
        st.resizing = false;
        st.resize_queue.wake_all();
        st.waiting_for_block.wake_all();
        st.waiting_for_hash_link.wake_all();
        result
    }

    fn resize_locked(
        &self,
        st: &mut StateGuard<'_>,
        config: PageCacheConfig,
    ) -> Result<usize, CacheError> {
        loop {
            while st.blocks.iter().any(Block::in_use) {
                let waiter = st.resize_queue.enqueue();
                waiter.park(st);
                st.check_initialized()?;
            }
            if st.dirty.is_empty() {
                break;
            }
            for file in st.dirty.files() {
                self.flush_file(st, file, FlushType::Keep)?;
            }
        }

        let count = config.blocks();
        let mut blocks = allocate_blocks(count, config.block_size)?;
        let hash = HashIndex::new(config.hash_link_count())?;
        let generation = st.next_generation();
        for block in &mut blocks {
            block.generation = generation;
        }
        st.blocks = blocks;
        st.free_blocks = (0..count).rev().collect();
        st.hash = hash;
        st.lru = LruPartition::new(count, config.tuning(count));
        st.dirty = DirtyTables::default();
        st.config = config;
        info!("Page cache resized to {count} blocks");
        Ok(count)
    }

    /// Retunes the hot/warm partition without touching cached pages.
    pub fn change_params(&self, division_limit: u32, age_threshold: u32) -> Result<(), CacheError> {
        let mut st = self.state.lock();
        st.check_initialized()?;
        let config = PageCacheConfig {
            division_limit,
            age_threshold,
            ..st.config.clone()
        };
        config.validate()?;
        let tuning = config.tuning(st.blocks.len());
        st.lru.set_tuning(tuning);
        st.config = config;
        debug!("Page cache tuning changed: {tuning:?}");
        Ok(())
    }

    /// Writes every dirty page back, frees every block nobody uses and disables the
    /// cache. Later calls fail with [`CacheError::NotInitialized`].
    pub fn shutdown(&self) -> Result<FlushReport, CacheError> {
        let mut st = self.state.lock();
        st.check_initialized()?;
        info!("Shutting down page cache");
        let report = self.flush_all_locked(&mut st, FlushType::Release)?;
        if !report.is_complete() {
            warn!(
                "Page cache shut down with {} dirty pages still pinned",
                report.skipped
            );
        }
        st.initialized = false;
        for block in &mut st.blocks {
            block.waiters.wake_all();
        }
        st.resize_queue.wake_all();
        st.waiting_for_block.wake_all();
        st.waiting_for_hash_link.wake_all();
        Ok(report)
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.state.lock();
        CacheStats {
            blocks: st.blocks.len(),
            blocks_used: st.blocks.iter().filter(|block| block.is_bound()).count(),
            blocks_unused: st.free_blocks.len(),
            blocks_changed: st.dirty.len(),
            warm_blocks: st.lru.warm_len(),
            hot_blocks: st.lru.hot_len(),
            hash_links_free: st.hash.free_links(),
            read_requests: st.read_requests,
            reads: st.reads,
            write_requests: st.write_requests,
            writes: st.writes,
            evictions: st.evictions,
        }
    }

    /// Returns every dirty page with its first redo LSN, in page order.
    pub fn dirty_pages(&self) -> Vec<(PageRef, Option<Lsn>)> {
        let st = self.state.lock();
        let mut pages: Vec<_> = st
            .dirty
            .iter()
            .map(|(id, key)| (key, st.blocks[id].rec_lsn))
            .collect();
        pages.sort_unstable_by_key(|(key, _)| *key);
        pages
    }

    /// Returns the smallest first redo LSN of all dirty pages.
    pub fn min_rec_lsn(&self) -> Option<Lsn> {
        let st = self.state.lock();
        st.dirty
            .iter()
            .filter_map(|(id, _)| st.blocks[id].rec_lsn)
            .min()
    }

    pub fn file_has_dirty_pages(&self, file: FileId) -> bool {
        self.state.lock().dirty.has_file(file)
    }

    /// Finds the block holding `key` or binds one to it, and registers the calling
    /// thread on it. The block is [`BlockStatus::Normal`] when this returns.
    ///
    /// Returns `None` only for [`Fetch::Existing`] when the page is not cached.
    fn acquire(
        &self,
        st: &mut StateGuard<'_>,
        key: PageRef,
        page_type: PageType,
        fetch: Fetch,
    ) -> Result<Option<BlockId>, CacheError> {
        st.page_offset(key)?;
        loop {
            st.check_initialized()?;
            let found = st.hash.find(&key);
            // requests on blocks somebody already works with have to go through,
            // otherwise resize would wait for them forever
            if st.resizing && !found.is_some_and(|id| st.blocks[id].in_use()) {
                let waiter = st.resize_queue.enqueue();
                waiter.park(st);
                continue;
            }

            if let Some(id) = found {
                match st.blocks[id].status {
                    BlockStatus::Normal => {
                        st.enter(id);
                        st.lru.touch(id);
                        return Ok(Some(id));
                    }
                    BlockStatus::Reading | BlockStatus::Evicting => {
                        st.enter(id);
                        let waiter = st.blocks[id].waiters.enqueue();
                        waiter.park(st);
                        st.leave(id);
                        continue;
                    }
                    BlockStatus::Free => {
                        return Err(CacheError::Corrupted(format!(
                            "page {key} is bound to free block {id}"
                        )));
                    }
                }
            }

            let read_from_disk = match fetch {
                Fetch::Existing => return Ok(None),
                Fetch::Read => true,
                Fetch::Overwrite => false,
            };
            if !st.hash.has_free_link() {
                if !self.evict_one(st)? {
                    warn!("No free hash link for page {key}, waiting");
                    let waiter = st.waiting_for_hash_link.enqueue();
                    waiter.park(st);
                }
                continue;
            }
            let Some(id) = st.free_blocks.pop() else {
                if !self.evict_one(st)? {
                    warn!("Every block is in use, page {key} waits for a free block");
                    let waiter = st.waiting_for_block.enqueue();
                    waiter.park(st);
                }
                continue;
            };

            if !read_from_disk {
                st.bind(id, key, page_type, BlockStatus::Normal)?;
                return Ok(Some(id));
            }
            st.bind(id, key, page_type, BlockStatus::Reading)?;
            self.load(st, id)?;
            return Ok(Some(id));
        }
    }

    /// Reads the page block `id` was just bound to. On failure the block is unbound
    /// and the calling thread's registration dropped.
    fn load(&self, st: &mut StateGuard<'_>, id: BlockId) -> Result<(), CacheError> {
        let key = st.blocks[id].key;
        let buffer = st.blocks[id].buffer.clone();
        let result = st.page_offset(key).and_then(|offset| {
            let result = MutexGuard::unlocked(st, || {
                let mut buf = buffer.lock();
                self.io.block_read(key.file, offset, &mut buf[..])
            });
            st.reads += 1;
            result.map_err(CacheError::from)
        });
        if let Err(e) = result {
            error!("Failed to read page {key}: {e}");
            st.unbind(id);
            st.leave(id);
            return Err(e);
        }
        let block = &mut st.blocks[id];
        block.status = BlockStatus::Normal;
        block.waiters.wake_all();
        Ok(())
    }

    /// Evicts one idle block. Returns `false` if there is none.
    ///
    /// A dirty victim is written back first, with the cache mutex released, so the
    /// caller has to re-check whatever it was about to do.
    fn evict_one(&self, st: &mut StateGuard<'_>) -> Result<bool, CacheError> {
        let victim = {
            let state = &**st;
            state.lru.select_victim(|id| !state.blocks[id].dirty)
        };
        let Some(id) = victim else {
            return Ok(false);
        };
        st.lru.unlink(id);
        let key = st.blocks[id].key;

        if st.blocks[id].dirty {
            debug!("Writing back page {key} before eviction");
            st.blocks[id].status = BlockStatus::Evicting;
            let result = self.write_back(st, id);
            let block = &mut st.blocks[id];
            block.status = BlockStatus::Normal;
            block.waiters.wake_all();
            if let Err(e) = result {
                st.settle(id);
                return Err(e);
            }
            st.mark_clean(id);
            if st.blocks[id].requests > 0 {
                // somebody asked for the page meanwhile, it stays
                return Ok(true);
            }
        }

        debug!("Evicting page {key}");
        st.unbind(id);
        st.evictions += 1;
        Ok(true)
    }

    /// Writes block `id` to its file. For a stamped [`PageType::Lsn`] page the log
    /// is flushed up to the page's LSN first.
    ///
    /// The caller keeps the block's content stable: it holds the write lock or the
    /// block is being evicted.
    pub(crate) fn write_back(&self, st: &mut StateGuard<'_>, id: BlockId) -> Result<(), CacheError> {
        let block = &st.blocks[id];
        let key = block.key;
        let lsn = match block.page_type {
            PageType::Lsn => block.lsn,
            PageType::Plain => None,
        };
        let buffer = block.buffer.clone();
        let offset = st.page_offset(key)?;
        MutexGuard::unlocked(st, || -> Result<(), CacheError> {
            if let (Some(lsn), Some(log)) = (lsn, &self.log) {
                log.flush_up_to(lsn)?;
            }
            let buf = buffer.lock();
            self.io.block_write(key.file, offset, &buf[..])?;
            Ok(())
        })?;
        st.writes += 1;
        Ok(())
    }

    /// Checks the caller's state, takes the lock `lock` asks for (waiting if needed)
    /// and applies the rest of `lock` and `pin`.
    ///
    /// Returns `false` if the block was unbound while waiting for the lock; the
    /// caller's registration is dropped then.
    fn apply_transition(
        &self,
        st: &mut StateGuard<'_>,
        id: BlockId,
        lock: LockTransition,
        pin: PinTransition,
    ) -> Result<bool, CacheError> {
        check_transition(&st.blocks[id], lock, pin)?;
        if let Some(mode) = lock.acquires()
            && !lock_block(st, id, mode)?
        {
            return Ok(false);
        }
        let block = &mut st.blocks[id];
        let released = match lock {
            LockTransition::ReadUnlock => block.lock.release_read(),
            LockTransition::WriteUnlock => block.lock.release_write(),
            LockTransition::WriteToRead => block.lock.downgrade(),
            _ => false,
        };
        if released {
            block.waiters.wake_all();
        }
        match pin {
            PinTransition::Pin => block.pin(),
            PinTransition::Unpin => {
                block.unpin();
            }
            PinTransition::LeftPinned | PinTransition::LeftUnpinned => {}
        }
        Ok(true)
    }

    fn unlock_block(
        &self,
        st: &mut StateGuard<'_>,
        id: BlockId,
        lock: LockTransition,
        pin: PinTransition,
        stamp: Option<Lsn>,
    ) -> Result<(), CacheError> {
        if lock.acquires().is_some() {
            return Err(CacheError::InvalidParameter("unlock cannot acquire a lock"));
        }
        st.enter(id);
        let result = self.stamp_and_release(st, id, lock, pin, stamp);
        st.leave(id);
        result
    }

    fn stamp_and_release(
        &self,
        st: &mut StateGuard<'_>,
        id: BlockId,
        lock: LockTransition,
        pin: PinTransition,
        stamp: Option<Lsn>,
    ) -> Result<(), CacheError> {
        check_transition(&st.blocks[id], lock, pin)?;
        if let Some(lsn) = stamp {
            let block = &mut st.blocks[id];
            if !lock.holds_write() {
                return Err(CacheError::LockNotHeld(block.key));
            }
            block.rec_lsn.get_or_insert(lsn);
            block.lsn = Some(lsn);
            if block.page_type == PageType::Lsn {
                let buffer = block.buffer.clone();
                MutexGuard::unlocked(st, || set_page_lsn(&mut buffer.lock(), lsn));
            }
            st.mark_dirty(id);
        }
        self.apply_transition(st, id, lock, pin).map(|_| ())
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let mut st = self.state.lock();
        if !st.initialized {
            return;
        }
        match self.flush_all_locked(&mut st, FlushType::Keep) {
            Ok(report) if !report.is_complete() => {
                error!(
                    "Dropping page cache with {} unwritten pinned pages",
                    report.skipped
                );
            }
            Ok(_) => {}
            Err(e) => error!("Failed to flush page cache while dropping it: {e}"),
        }
    }
}
