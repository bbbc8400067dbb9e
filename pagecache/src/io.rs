//! Interfaces of the collaborators the cache talks to.

use std::io;

use crate::page::{FileId, Lsn};

/// Raw block I/O keyed by `(file, byte offset)`.
///
/// The cache never interprets what it reads or writes: every call transfers exactly
/// one block (`buf.len()` is the cache's block size). Errors are returned to the
/// cache's caller unchanged and are never retried by the cache.
pub trait BlockIo: Send + Sync {
    /// Fills `buf` with the block stored at `offset` in `file`.
    fn block_read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` at `offset` in `file`.
    fn block_write(&self, file: FileId, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Makes previous writes to `file` durable.
    fn sync(&self, _file: FileId) -> io::Result<()> {
        Ok(())
    }
}

/// Log handler that owns LSNs stamped on pages.
///
/// Before an LSN page is written back the cache asks the log to be durable up to
/// the page's stamp. The value is forwarded as-is.
pub trait LogHandler: Send + Sync {
    fn flush_up_to(&self, lsn: Lsn) -> io::Result<()>;
}
