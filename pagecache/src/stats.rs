/// Point-in-time snapshot of cache occupancy and activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of blocks.
    pub blocks: usize,
    /// Blocks bound to a page.
    pub blocks_used: usize,
    /// Blocks on the free list.
    pub blocks_unused: usize,
    /// Dirty blocks.
    pub blocks_changed: usize,
    /// Idle blocks in the warm chain.
    pub warm_blocks: usize,
    /// Idle blocks in the hot chain.
    pub hot_blocks: usize,
    pub hash_links_free: usize,
    /// Calls to [`crate::PageCache::read`].
    pub read_requests: u64,
    /// Blocks read from disk.
    pub reads: u64,
    /// Calls to [`crate::PageCache::write`].
    pub write_requests: u64,
    /// Blocks written to disk.
    pub writes: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Share of read requests served without disk I/O, `0.0` before the first request.
    pub fn hit_ratio(&self) -> f64 {
        if self.read_requests == 0 {
            return 0.0;
        }
        let hits = self.read_requests.saturating_sub(self.reads);
        hits as f64 / self.read_requests as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_ratio() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_ratio(), 0.0);
        stats.read_requests = 4;
        stats.reads = 1;
        assert_eq!(stats.hit_ratio(), 0.75);
    }
}
