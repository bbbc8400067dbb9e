//! Block descriptors and the buffers they own.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::CacheError;
use crate::lock::LockState;
use crate::page::{FileId, Lsn, PageRef, PageType};
use crate::wait_queue::WaitQueue;

/// Index of a block in the block arena.
pub(crate) type BlockId = usize;

/// Buffer of a single block.
///
/// The latch is only ever taken with the cache mutex released, for copying page
/// content in or out and for disk I/O. Who may touch the content is decided by the
/// block's [`LockState`], the latch only keeps the accesses memory-safe.
pub(crate) type Buffer = Arc<Mutex<Box<[u8]>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    /// On the free list, not bound to any page.
    Free,
    /// Bound, content being read from disk.
    Reading,
    /// Bound, content valid.
    Normal,
    /// Bound, dirty content being written back before the block is reused.
    Evicting,
}

pub(crate) struct Block {
    /// Page the block is bound to. Meaningless for free blocks.
    pub(crate) key: PageRef,
    pub(crate) status: BlockStatus,
    /// Changes every time the block is bound or unbound, invalidates outstanding page links.
    pub(crate) generation: u64,
    pub(crate) lock: LockState,
    /// One entry per pin, naming the thread that took it.
    pins: Vec<ThreadId>,
    /// Threads currently inside an operation on this block, waiting ones included.
    pub(crate) requests: u32,
    pub(crate) dirty: bool,
    pub(crate) page_type: PageType,
    /// First redo LSN since the block became dirty.
    pub(crate) rec_lsn: Option<Lsn>,
    /// Latest LSN stamped on the block.
    pub(crate) lsn: Option<Lsn>,
    /// Unbound while threads were still inside an operation on it; the last one
    /// to leave puts it on the free list.
    pub(crate) orphaned: bool,
    /// Threads waiting for a lock on this block or for its status to change.
    pub(crate) waiters: WaitQueue,
    pub(crate) buffer: Buffer,
}

impl Block {
    fn new(buffer: Box<[u8]>) -> Self {
        Self {
            key: PageRef::new(FileId(0), 0),
            status: BlockStatus::Free,
            generation: 0,
            lock: LockState::default(),
            pins: Vec::new(),
            requests: 0,
            dirty: false,
            page_type: PageType::Plain,
            rec_lsn: None,
            lsn: None,
            orphaned: false,
            waiters: WaitQueue::default(),
            buffer: Arc::new(Mutex::new(buffer)),
        }
    }

    /// Returns true if the block is bound to a page.
    pub(crate) fn is_bound(&self) -> bool {
        self.status != BlockStatus::Free
    }

    /// Returns true if the block is bound and nobody uses it, i.e. it can be linked
    /// into an eviction chain.
    pub(crate) fn is_idle(&self) -> bool {
        self.status == BlockStatus::Normal
            && self.requests == 0
            && self.pins.is_empty()
            && self.lock.is_free()
    }

    /// Returns true if some thread holds a lock or pin on the block or works on it.
    pub(crate) fn in_use(&self) -> bool {
        self.is_bound() && !self.is_idle()
    }

    pub(crate) fn is_pinned(&self) -> bool {
        !self.pins.is_empty()
    }

    pub(crate) fn pinned_by_current(&self) -> bool {
        self.pins.contains(&thread::current().id())
    }

    /// Returns true if a thread other than the current one holds a pin.
    pub(crate) fn pinned_by_others(&self) -> bool {
        let me = thread::current().id();
        self.pins.iter().any(|holder| *holder != me)
    }

    pub(crate) fn pin(&mut self) {
        self.pins.push(thread::current().id());
    }

    /// Drops one pin of the current thread. Returns `false` if it holds none.
    pub(crate) fn unpin(&mut self) -> bool {
        let me = thread::current().id();
        match self.pins.iter().position(|holder| *holder == me) {
            Some(position) => {
                self.pins.swap_remove(position);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// Clears per-page state when the block gets unbound.
    pub(crate) fn clear_page_state(&mut self) {
        self.lock = LockState::default();
        self.pins.clear();
        self.dirty = false;
        self.page_type = PageType::Plain;
        self.rec_lsn = None;
        self.lsn = None;
    }
}

/// Allocates `count` blocks of `block_size` bytes each.
pub(crate) fn allocate_blocks(count: usize, block_size: usize) -> Result<Vec<Block>, CacheError> {
    let out_of_space = || CacheError::OutOfSpace {
        blocks: count,
        block_size,
    };
    if count == 0 {
        return Err(out_of_space());
    }
    let mut blocks = Vec::new();
    blocks.try_reserve_exact(count).map_err(|_| out_of_space())?;
    for _ in 0..count {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(block_size)
            .map_err(|_| out_of_space())?;
        buffer.resize(block_size, 0);
        blocks.push(Block::new(buffer.into_boxed_slice()));
    }
    Ok(blocks)
}
