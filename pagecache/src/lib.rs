//! Shared page cache for fixed-size file blocks.
//!
//! Threads read and write pages of files through [`PageCache`], taking read or
//! write locks and pins on them. Dirty pages are written back on eviction, on
//! [`PageCache::flush`] or by a [`BackgroundWorkerHandle`]-controlled flusher.
//! Disk access goes through a [`BlockIo`] implementation such as [`FilesManager`].

pub mod background_worker;
mod block;
pub mod cache;
pub mod config;
mod dirty;
pub mod error;
pub mod files_manager;
pub mod flush;
mod hash_index;
pub mod io;
pub mod lock;
mod lru;
pub mod page;
pub mod stats;
#[cfg(test)]
mod testing;
mod wait_queue;

pub use background_worker::{BackgroundWorkerError, BackgroundWorkerHandle};
pub use cache::{PageCache, PageLink, WriteMode};
pub use config::{
    DEFAULT_AGE_THRESHOLD, DEFAULT_BLOCK_SIZE, DEFAULT_DIVISION_LIMIT, MIN_BLOCK_SIZE,
    PageCacheConfig,
};
pub use error::CacheError;
pub use files_manager::{FilesManager, FilesManagerError};
pub use flush::{FlushReport, FlushType};
pub use io::{BlockIo, LogHandler};
pub use lock::{LockTransition, PinTransition};
pub use page::{FileId, LSN_HEADER_SIZE, Lsn, PageNo, PageRef, PageType, get_page_lsn, set_page_lsn};
pub use stats::CacheStats;
