//! Write-back of dirty blocks.
//!
//! A flush walks one file's dirty pages in page order through the file-keyed
//! dirty table. The cache mutex is released around every write, so the table may
//! change under the walk: the walk resumes after the last visited page and starts
//! over from the first page until only pages it had to skip are left.

use std::collections::HashSet;

use log::{debug, warn};
use parking_lot::MutexGuard;

use crate::block::{BlockId, BlockStatus};
use crate::cache::{PageCache, StateGuard, lock_block};
use crate::error::CacheError;
use crate::lock::LockMode;
use crate::page::{FileId, PageNo};

/// What a flush does with a file's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushType {
    /// Write dirty blocks back, then free every block of the file nobody uses.
    Release,
    /// Write dirty blocks back and make the file durable.
    ForceWrite,
    /// Write dirty blocks back, keep them cached.
    Keep,
    /// Like [`FlushType::Keep`], but never waits: locked blocks are left for later.
    KeepLazy,
    /// Drop unwritten changes and free every block of the file nobody uses.
    IgnoreChanged,
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Blocks written to disk.
    pub written: usize,
    /// Dirty blocks whose changes were dropped.
    pub discarded: usize,
    /// Blocks freed.
    pub released: usize,
    /// Dirty blocks that could not be written because they are pinned or locked by
    /// the flushing thread.
    pub skipped: usize,
    /// Dirty blocks a [`FlushType::KeepLazy`] flush did not wait for.
    pub busy: usize,
}

impl FlushReport {
    /// Returns true if no dirty block had to be skipped.
    pub fn is_complete(&self) -> bool {
        self.skipped == 0
    }

    fn absorb(&mut self, other: FlushReport) {
        self.written += other.written;
        self.discarded += other.discarded;
        self.released += other.released;
        self.skipped += other.skipped;
        self.busy += other.busy;
    }
}

enum BlockFlush {
    Written,
    /// Already clean when its turn came.
    Clean,
    Skipped,
    Busy,
    /// The block changed state while waiting for it, look at the page again.
    Retry,
}

impl PageCache {
    /// Flushes every cached page of `file`.
    ///
    /// Pinned pages are not written; they are counted in
    /// [`FlushReport::skipped`] and make the report incomplete.
    pub fn flush(&self, file: FileId, flush_type: FlushType) -> Result<FlushReport, CacheError> {
        let mut st = self.lock_state();
        st.check_initialized()?;
        self.flush_file(&mut st, file, flush_type)
    }

    /// Flushes every file that has pages in the cache.
    pub fn flush_all(&self, flush_type: FlushType) -> Result<FlushReport, CacheError> {
        let mut st = self.lock_state();
        st.check_initialized()?;
        self.flush_all_locked(&mut st, flush_type)
    }

    pub(crate) fn flush_all_locked(
        &self,
        st: &mut StateGuard<'_>,
        flush_type: FlushType,
    ) -> Result<FlushReport, CacheError> {
        let mut report = FlushReport::default();
        for file in st.cached_files() {
            report.absorb(self.flush_file(st, file, flush_type)?);
        }
        Ok(report)
    }

    pub(crate) fn flush_file(
        &self,
        st: &mut StateGuard<'_>,
        file: FileId,
        flush_type: FlushType,
    ) -> Result<FlushReport, CacheError> {
        let mut report = FlushReport::default();
        match flush_type {
            FlushType::IgnoreChanged => discard_dirty_blocks(st, file, &mut report),
            FlushType::KeepLazy => self.write_dirty_blocks(st, file, true, &mut report)?,
            FlushType::Release | FlushType::ForceWrite | FlushType::Keep => {
                self.write_dirty_blocks(st, file, false, &mut report)?
            }
        }
        match flush_type {
            FlushType::Release | FlushType::IgnoreChanged => {
                report.released = st.release_file_blocks(file);
            }
            FlushType::ForceWrite => {
                MutexGuard::unlocked(st, || self.sync_file(file))?;
            }
            FlushType::Keep | FlushType::KeepLazy => {}
        }
        debug!("Flushed file {file} ({flush_type:?}): {report:?}");
        Ok(report)
    }

    fn write_dirty_blocks(
        &self,
        st: &mut StateGuard<'_>,
        file: FileId,
        lazy: bool,
        report: &mut FlushReport,
    ) -> Result<(), CacheError> {
        let mut left_behind: HashSet<PageNo> = HashSet::new();
        // `None` once the walk went past the last page number
        let mut cursor = Some(0);
        loop {
            let next = cursor.and_then(|from| st.dirty.next_from(file, from));
            let Some((page, id)) = next else {
                let pending = st
                    .dirty
                    .file_pages(file)
                    .iter()
                    .any(|(page, _)| !left_behind.contains(page));
                if !pending {
                    return Ok(());
                }
                cursor = Some(0);
                continue;
            };
            if left_behind.contains(&page) {
                cursor = page.checked_add(1);
                continue;
            }
            match self.flush_block(st, id, lazy)? {
                BlockFlush::Written => report.written += 1,
                BlockFlush::Clean => {}
                BlockFlush::Skipped => {
                    report.skipped += 1;
                    left_behind.insert(page);
                }
                BlockFlush::Busy => {
                    report.busy += 1;
                    left_behind.insert(page);
                }
                BlockFlush::Retry => continue,
            }
            cursor = page.checked_add(1);
        }
    }

    fn flush_block(
        &self,
        st: &mut StateGuard<'_>,
        id: BlockId,
        lazy: bool,
    ) -> Result<BlockFlush, CacheError> {
        let block = &st.blocks[id];
        let key = block.key;
        if block.status == BlockStatus::Evicting {
            if lazy {
                return Ok(BlockFlush::Busy);
            }
            st.enter(id);
            let waiter = st.blocks[id].waiters.enqueue();
            waiter.park(st);
            st.leave(id);
            return Ok(BlockFlush::Retry);
        }
        if block.is_pinned() || block.lock.held_by_current() {
            if lazy {
                return Ok(BlockFlush::Busy);
            }
            warn!("Flush skips page {key}: it is pinned or locked by the flushing thread");
            return Ok(BlockFlush::Skipped);
        }
        if lazy && (block.requests > 0 || !block.lock.is_free()) {
            return Ok(BlockFlush::Busy);
        }

        st.enter(id);
        match lock_block(st, id, LockMode::Write) {
            Ok(true) => {}
            Ok(false) => return Ok(BlockFlush::Retry),
            Err(e) => {
                st.leave(id);
                return Err(e);
            }
        }
        let result = self.write_locked_block(st, id);
        st.release_write(id);
        st.leave(id);
        result
    }

    fn write_locked_block(
        &self,
        st: &mut StateGuard<'_>,
        id: BlockId,
    ) -> Result<BlockFlush, CacheError> {
        let block = &st.blocks[id];
        if block.is_pinned() {
            warn!("Flush skips page {}: it got pinned", block.key);
            return Ok(BlockFlush::Skipped);
        }
        if !block.dirty {
            return Ok(BlockFlush::Clean);
        }
        self.write_back(st, id)?;
        st.mark_clean(id);
        Ok(BlockFlush::Written)
    }
}

/// Drops the changes of every dirty block of `file` nobody uses.
fn discard_dirty_blocks(st: &mut StateGuard<'_>, file: FileId, report: &mut FlushReport) {
    for (page, id) in st.dirty.file_pages(file) {
        if st.blocks[id].in_use() {
            warn!("Cannot discard changes of page {file}:{page}, it is in use");
            report.skipped += 1;
        } else {
            st.mark_clean(id);
            report.discarded += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WriteMode;
    use crate::config::PageCacheConfig;
    use crate::io::{BlockIo, LogHandler};
    use crate::lock::{LockTransition, PinTransition};
    use crate::page::{PageRef, PageType, get_page_lsn};
    use crate::testing::{BS, MemoryIo, RecordingLog, filled, init_logging, memory_cache, page};
    use crossbeam::channel;
    use std::io;
    use std::sync::Arc;
    use std::thread;

    fn write(cache: &PageCache, p: PageRef, byte: u8) {
        cache
            .write(
                p,
                PageType::Plain,
                LockTransition::LeftUnlocked,
                PinTransition::LeftUnpinned,
                WriteMode::Delay,
                &filled(byte),
            )
            .unwrap();
    }

    fn pin(cache: &PageCache, p: PageRef) {
        let mut buf = vec![0; BS];
        cache
            .read(p, PageType::Plain, LockTransition::Read, &mut buf)
            .unwrap();
        cache
            .unlock(p, LockTransition::ReadUnlock, PinTransition::LeftPinned, None)
            .unwrap();
    }

    /// [`BlockIo`] whose writes wait until the test lets them through.
    struct GatedWrites {
        inner: MemoryIo,
        entered: channel::Sender<()>,
        release: channel::Receiver<()>,
    }

    impl BlockIo for GatedWrites {
        fn block_read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> io::Result<()> {
            self.inner.block_read(file, offset, buf)
        }

        fn block_write(&self, file: FileId, offset: u64, buf: &[u8]) -> io::Result<()> {
            self.entered.send(()).map_err(io::Error::other)?;
            self.release.recv().map_err(io::Error::other)?;
            self.inner.block_write(file, offset, buf)
        }
    }

    #[test]
    fn page_dirtied_behind_the_walk_is_written_too() {
        init_logging();
        let (entered_tx, entered_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let io = Arc::new(GatedWrites {
            inner: MemoryIo::default(),
            entered: entered_tx,
            release: release_rx,
        });
        let cache = PageCache::new(PageCacheConfig::with_blocks(4, BS), io.clone(), None).unwrap();
        write(&cache, page(1, 0), 1);
        write(&cache, page(1, 1), 2);

        thread::scope(|s| {
            let flusher = s.spawn(|| cache.flush(FileId(1), FlushType::Keep).unwrap());
            // page 0 goes out first
            entered_rx.recv().unwrap();
            release_tx.send(()).unwrap();

            // page 1 is on its way out, page 0 changes again behind the walk
            entered_rx.recv().unwrap();
            write(&cache, page(1, 0), 9);
            assert!(cache.dirty_pages().iter().any(|(p, _)| *p == page(1, 0)));
            release_tx.send(()).unwrap();

            // the walk starts over and picks page 0 up once more
            entered_rx.recv().unwrap();
            release_tx.send(()).unwrap();
            let report = flusher.join().unwrap();
            assert_eq!(report.written, 3);
            assert!(report.is_complete());
        });
        assert_eq!(io.inner.stored(page(1, 0)), Some(filled(9)));
        assert_eq!(io.inner.stored(page(1, 1)), Some(filled(2)));
        assert!(!cache.file_has_dirty_pages(FileId(1)));
    }

    #[test]
    fn pinned_page_is_skipped_until_unpinned() {
        let (cache, io) = memory_cache(4);
        write(&cache, page(1, 0), 1);
        write(&cache, page(1, 1), 2);
        pin(&cache, page(1, 0));

        let report = cache.flush(FileId(1), FlushType::ForceWrite).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.written, 1);
        assert_eq!(io.stored(page(1, 0)), None);
        assert_eq!(io.stored(page(1, 1)), Some(filled(2)));
        assert!(cache.file_has_dirty_pages(FileId(1)));

        cache.unpin(page(1, 0)).unwrap();
        let report = cache.flush(FileId(1), FlushType::ForceWrite).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.written, 1);
        assert_eq!(io.stored(page(1, 0)), Some(filled(1)));
        assert_eq!(io.synced(), vec![FileId(1), FileId(1)]);
    }

    #[test]
    fn flush_touches_only_the_given_file() {
        let (cache, io) = memory_cache(4);
        write(&cache, page(1, 0), 1);
        write(&cache, page(2, 0), 2);
        cache.flush(FileId(2), FlushType::Keep).unwrap();
        assert_eq!(io.stored(page(1, 0)), None);
        assert_eq!(io.stored(page(2, 0)), Some(filled(2)));
        assert!(cache.file_has_dirty_pages(FileId(1)));
        assert!(!cache.file_has_dirty_pages(FileId(2)));
        assert!(io.synced().is_empty());
    }

    #[test]
    fn release_frees_blocks_of_the_file() {
        let (cache, io) = memory_cache(4);
        write(&cache, page(1, 0), 1);
        write(&cache, page(1, 1), 2);
        write(&cache, page(2, 0), 3);
        pin(&cache, page(1, 1));

        let report = cache.flush(FileId(1), FlushType::Release).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(report.released, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(io.stored(page(1, 0)), Some(filled(1)));

        let stats = cache.stats();
        assert_eq!(stats.blocks_used, 2);
        assert_eq!(stats.blocks_changed, 2);
    }

    #[test]
    fn ignore_changed_discards_without_writing() {
        let (cache, io) = memory_cache(4);
        io.store(page(1, 0), filled(9));
        write(&cache, page(1, 0), 1);
        write(&cache, page(1, 1), 2);

        let report = cache.flush(FileId(1), FlushType::IgnoreChanged).unwrap();
        assert_eq!(report.discarded, 2);
        assert_eq!(report.released, 2);
        assert_eq!(report.written, 0);
        assert_eq!(io.writes(), 0);
        assert_eq!(cache.stats().blocks_used, 0);

        let mut buf = vec![0; BS];
        cache
            .read(page(1, 0), PageType::Plain, LockTransition::LeftUnlocked, &mut buf)
            .unwrap();
        assert_eq!(buf, filled(9));
    }

    #[test]
    fn lazy_flush_does_not_wait_for_locked_pages() {
        let (cache, io) = memory_cache(4);
        write(&cache, page(1, 0), 1);
        write(&cache, page(1, 1), 2);
        cache
            .write(
                page(1, 2),
                PageType::Plain,
                LockTransition::Write,
                PinTransition::Pin,
                WriteMode::Delay,
                &filled(3),
            )
            .unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                let report = cache.flush_all(FlushType::KeepLazy).unwrap();
                assert_eq!(report.written, 2);
                assert_eq!(report.busy, 1);
                assert!(report.is_complete());
            });
        });
        assert_eq!(io.stored(page(1, 2)), None);

        cache
            .unlock(
                page(1, 2),
                LockTransition::WriteUnlock,
                PinTransition::Unpin,
                None,
            )
            .unwrap();
        let report = cache.flush_all(FlushType::KeepLazy).unwrap();
        assert_eq!(report.written, 1);
        assert_eq!(io.stored(page(1, 2)), Some(filled(3)));
    }

    #[test]
    fn flush_waits_for_write_lock_of_other_thread() {
        let (cache, io) = memory_cache(4);
        let p = page(1, 0);
        cache
            .write(
                p,
                PageType::Plain,
                LockTransition::Write,
                PinTransition::LeftUnpinned,
                WriteMode::Delay,
                &filled(1),
            )
            .unwrap();

        thread::scope(|s| {
            let flusher = s.spawn(|| cache.flush(FileId(1), FlushType::Keep).unwrap());
            loop {
                let st = cache.lock_state();
                let id = st.dirty.next_from(FileId(1), 0).unwrap().1;
                if st.blocks[id].waiters.len() == 1 {
                    break;
                }
                drop(st);
                thread::yield_now();
            }
            cache
                .write(
                    p,
                    PageType::Plain,
                    LockTransition::WriteUnlock,
                    PinTransition::LeftUnpinned,
                    WriteMode::Delay,
                    &filled(2),
                )
                .unwrap();
            let report = flusher.join().unwrap();
            assert_eq!(report.written, 1);
        });
        assert_eq!(io.stored(p), Some(filled(2)));
    }

    #[test]
    fn log_is_flushed_before_lsn_page_is_written() {
        let io = Arc::new(MemoryIo::default());
        let log = Arc::new(RecordingLog::new(io.clone()));
        let cache = PageCache::new(
            PageCacheConfig::with_blocks(4, BS),
            io.clone(),
            Some(log.clone() as Arc<dyn LogHandler>),
        )
        .unwrap();
        let p = page(1, 0);
        cache
            .write(
                p,
                PageType::Lsn,
                LockTransition::Write,
                PinTransition::Pin,
                WriteMode::Delay,
                &filled(0),
            )
            .unwrap();
        cache
            .unlock(
                p,
                LockTransition::WriteUnlock,
                PinTransition::Unpin,
                Some(77),
            )
            .unwrap();
        write(&cache, page(1, 1), 5);

        cache.flush(FileId(1), FlushType::Keep).unwrap();
        // plain page never asks the log
        assert_eq!(log.flushes(), vec![(77, 0)]);
        let stored = io.stored(p).unwrap();
        assert_eq!(get_page_lsn(&stored), 77);
        assert_eq!(cache.min_rec_lsn(), None);
    }
}
