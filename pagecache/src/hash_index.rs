//! Hash index mapping pages to the blocks holding them.
//!
//! Buckets hold singly linked chains of [`HashLink`]s. Links come from a pool that
//! is sized once, at allocation; running out of links is a condition the caller
//! waits on, the pool never grows.

use crate::block::BlockId;
use crate::error::CacheError;
use crate::page::{FileId, PageRef};

/// Index of a [`HashLink`] in [`HashIndex::links`].
type LinkId = usize;

/// Association between a page and the block holding it.
struct HashLink {
    key: PageRef,
    block: BlockId,
    /// Next link in the same bucket chain, or next free link when on the free list.
    next: Option<LinkId>,
}

pub(crate) struct HashIndex {
    /// Heads of the bucket chains. The length is a power of two.
    buckets: Vec<Option<LinkId>>,
    links: Vec<HashLink>,
    /// Head of the free link list.
    free: Option<LinkId>,
    free_count: usize,
}

impl HashIndex {
    /// Allocates index with a pool of `links` hash links.
    pub(crate) fn new(links: usize) -> Result<Self, CacheError> {
        let bucket_count = links.max(1).next_power_of_two();
        let out_of_space = |_| CacheError::OutOfSpace {
            blocks: links,
            block_size: size_of::<HashLink>(),
        };

        let mut buckets = Vec::new();
        buckets.try_reserve_exact(bucket_count).map_err(out_of_space)?;
        buckets.resize(bucket_count, None);

        let mut pool = Vec::new();
        pool.try_reserve_exact(links).map_err(out_of_space)?;
        for id in 0..links {
            pool.push(HashLink {
                key: PageRef::new(FileId(0), 0),
                block: 0,
                next: (id + 1 < links).then_some(id + 1),
            });
        }

        Ok(Self {
            buckets,
            links: pool,
            free: (links > 0).then_some(0),
            free_count: links,
        })
    }

    fn bucket(&self, key: &PageRef) -> usize {
        let h = (key.page ^ ((key.file.0 as u64) << 40)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        (h >> 32) as usize & (self.buckets.len() - 1)
    }

    /// Returns the block bound to `key`, if any.
    pub(crate) fn find(&self, key: &PageRef) -> Option<BlockId> {
        let mut cursor = self.buckets[self.bucket(key)];
        while let Some(id) = cursor {
            let link = &self.links[id];
            if link.key == *key {
                return Some(link.block);
            }
            cursor = link.next;
        }
        None
    }

    pub(crate) fn has_free_link(&self) -> bool {
        self.free.is_some()
    }

    pub(crate) fn free_links(&self) -> usize {
        self.free_count
    }

    /// Binds `key` to `block`. Returns `false` (and changes nothing) when the link pool is exhausted.
    ///
    /// `key` must not be present already.
    pub(crate) fn insert(&mut self, key: PageRef, block: BlockId) -> bool {
        debug_assert!(self.find(&key).is_none(), "page {key} inserted twice");
        let Some(id) = self.free else {
            return false;
        };
        let bucket = self.bucket(&key);
        let link = &mut self.links[id];
        self.free = link.next;
        self.free_count -= 1;

        link.key = key;
        link.block = block;
        link.next = self.buckets[bucket];
        self.buckets[bucket] = Some(id);
        true
    }

    /// Unbinds `key` and returns its link to the pool. Returns the block it was bound to.
    pub(crate) fn remove(&mut self, key: &PageRef) -> Option<BlockId> {
        let bucket = self.bucket(key);
        let mut previous: Option<LinkId> = None;
        let mut cursor = self.buckets[bucket];
        while let Some(id) = cursor {
            if self.links[id].key == *key {
                let next = self.links[id].next;
                match previous {
                    Some(previous) => self.links[previous].next = next,
                    None => self.buckets[bucket] = next,
                }
                self.links[id].next = self.free;
                self.free = Some(id);
                self.free_count += 1;
                return Some(self.links[id].block);
            }
            previous = cursor;
            cursor = self.links[id].next;
        }
        None
    }
}
