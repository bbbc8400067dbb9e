use std::io;

use thiserror::Error;

use crate::page::PageRef;

/// Error for page cache related operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A required argument was missing or malformed, e.g. a buffer whose length
    /// differs from the block size or a lock transition the operation does not accept.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    /// The cache was shut down and cannot be used anymore.
    #[error("page cache is not initialized")]
    NotInitialized,
    /// Internal bookkeeping is inconsistent. Not retried.
    #[error("page cache state is corrupted: {0}")]
    Corrupted(String),
    /// Block pool or hash link pool could not be allocated.
    #[error("cannot allocate {blocks} blocks of {block_size} bytes")]
    OutOfSpace { blocks: usize, block_size: usize },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("page {0} is not in the cache")]
    PageNotCached(PageRef),
    /// The [`crate::PageLink`] refers to a block that was reused since the link was handed out.
    #[error("link to block {block} is stale")]
    StaleLink { block: usize },
    #[error("lock on page {0} is not held by the calling thread")]
    LockNotHeld(PageRef),
    #[error("page {0} is not pinned")]
    NotPinned(PageRef),
    #[error("page {0} is pinned by another holder")]
    PagePinned(PageRef),
    /// The calling thread asked for a lock it would have to wait on itself to get.
    #[error("calling thread already holds page {0} exclusively")]
    WouldDeadlock(PageRef),
    /// Underlying block I/O or log handler returned error.
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
}
