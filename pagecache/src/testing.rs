//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::cache::PageCache;
use crate::config::PageCacheConfig;
use crate::io::{BlockIo, LogHandler};
use crate::page::{FileId, Lsn, PageNo, PageRef};

/// Block size used by the tests.
pub(crate) const BS: usize = 512;

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn page(file: u32, page: PageNo) -> PageRef {
    PageRef::new(FileId(file), page)
}

/// Returns a block-sized buffer filled with `byte`.
pub(crate) fn filled(byte: u8) -> Vec<u8> {
    vec![byte; BS]
}

/// Creates a cache of `blocks` blocks over a fresh [`MemoryIo`].
pub(crate) fn memory_cache(blocks: usize) -> (PageCache, Arc<MemoryIo>) {
    init_logging();
    let io = Arc::new(MemoryIo::default());
    let cache = PageCache::new(PageCacheConfig::with_blocks(blocks, BS), io.clone(), None)
        .expect("failed to create cache");
    (cache, io)
}

/// In-memory [`BlockIo`] that counts calls. Missing blocks read as zeros.
#[derive(Default)]
pub(crate) struct MemoryIo {
    blocks: Mutex<HashMap<(FileId, u64), Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    synced: Mutex<Vec<FileId>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryIo {
    /// Returns what was last written for `page`.
    pub(crate) fn stored(&self, page: PageRef) -> Option<Vec<u8>> {
        self.blocks
            .lock()
            .get(&(page.file(), page.offset(BS).unwrap()))
            .cloned()
    }

    pub(crate) fn store(&self, page: PageRef, data: Vec<u8>) {
        self.blocks
            .lock()
            .insert((page.file(), page.offset(BS).unwrap()), data);
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn synced(&self) -> Vec<FileId> {
        self.synced.lock().clone()
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl BlockIo for MemoryIo {
    fn block_read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("read failure"));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.blocks.lock().get(&(file, offset)) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn block_write(&self, file: FileId, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("write failure"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.blocks.lock().insert((file, offset), buf.to_vec());
        Ok(())
    }

    fn sync(&self, file: FileId) -> io::Result<()> {
        self.synced.lock().push(file);
        Ok(())
    }
}

/// [`LogHandler`] remembering every flush request together with the number of
/// block writes `io` had performed at that moment.
pub(crate) struct RecordingLog {
    io: Arc<MemoryIo>,
    flushes: Mutex<Vec<(Lsn, usize)>>,
}

impl RecordingLog {
    pub(crate) fn new(io: Arc<MemoryIo>) -> Self {
        Self {
            io,
            flushes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn flushes(&self) -> Vec<(Lsn, usize)> {
        self.flushes.lock().clone()
    }
}

impl LogHandler for RecordingLog {
    fn flush_up_to(&self, lsn: Lsn) -> io::Result<()> {
        self.flushes.lock().push((lsn, self.io.writes()));
        Ok(())
    }
}
