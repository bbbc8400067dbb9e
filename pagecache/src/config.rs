//! Page cache configuration.

use crate::error::CacheError;
use crate::page::LSN_HEADER_SIZE;

/// Default size of a single block.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Smallest block size accepted by [`PageCacheConfig::validate`].
pub const MIN_BLOCK_SIZE: usize = 512;

/// Default share (in percent of all blocks) of the warm chain.
pub const DEFAULT_DIVISION_LIMIT: u32 = 50;

/// Default age (in percent of all blocks, measured in logical time ticks) after which
/// a warm block may become hot and an unused hot block falls back to warm.
pub const DEFAULT_AGE_THRESHOLD: u32 = 300;

/// Configuration for the page cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCacheConfig {
    /// Memory given to block buffers. The number of blocks is `memory_bytes / block_size`.
    pub memory_bytes: usize,
    /// Size of every block, power of two.
    pub block_size: usize,
    /// Maximum size of the warm chain, in percent of all blocks.
    pub division_limit: u32,
    /// Hot/warm aging threshold, in percent of all blocks.
    pub age_threshold: u32,
    /// Size of the hash link pool. Defaults to twice the number of blocks.
    pub hash_links: Option<usize>,
}

impl PageCacheConfig {
    /// Creates a new configuration for `memory_bytes` of buffers with default tuning.
    pub fn new(memory_bytes: usize) -> Self {
        Self {
            memory_bytes,
            block_size: DEFAULT_BLOCK_SIZE,
            division_limit: DEFAULT_DIVISION_LIMIT,
            age_threshold: DEFAULT_AGE_THRESHOLD,
            hash_links: None,
        }
    }

    /// Creates a configuration that holds exactly `blocks` blocks of `block_size` bytes.
    pub fn with_blocks(blocks: usize, block_size: usize) -> Self {
        Self::new(blocks * block_size).with_block_size(block_size)
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_division_limit(mut self, division_limit: u32) -> Self {
        self.division_limit = division_limit;
        self
    }

    pub fn with_age_threshold(mut self, age_threshold: u32) -> Self {
        self.age_threshold = age_threshold;
        self
    }

    pub fn with_hash_links(mut self, hash_links: usize) -> Self {
        self.hash_links = Some(hash_links);
        self
    }

    /// Returns the number of blocks this configuration allocates.
    pub fn blocks(&self) -> usize {
        self.memory_bytes / self.block_size.max(1)
    }

    /// Returns the size of the hash link pool.
    pub fn hash_link_count(&self) -> usize {
        self.hash_links.unwrap_or(self.blocks() * 2)
    }

    /// Checks that the configuration can be used to build a cache.
    ///
    /// A configuration that yields zero blocks passes validation; allocation then
    /// fails with [`CacheError::OutOfSpace`].
    pub fn validate(&self) -> Result<(), CacheError> {
        if !self.block_size.is_power_of_two() || self.block_size < MIN_BLOCK_SIZE {
            return Err(CacheError::InvalidConfig(format!(
                "block size must be a power of two >= {MIN_BLOCK_SIZE}, got {}",
                self.block_size
            )));
        }
        debug_assert!(self.block_size >= LSN_HEADER_SIZE);
        if self.division_limit > 100 {
            return Err(CacheError::InvalidConfig(format!(
                "division limit must be at most 100, got {}",
                self.division_limit
            )));
        }
        if self.age_threshold < 100 {
            return Err(CacheError::InvalidConfig(format!(
                "age threshold must be at least 100, got {}",
                self.age_threshold
            )));
        }
        if self.hash_link_count() == 0 && self.blocks() > 0 {
            return Err(CacheError::InvalidConfig(
                "hash link pool cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Derives hot/warm tuning for `blocks` blocks.
    pub(crate) fn tuning(&self, blocks: usize) -> Tuning {
        Tuning::new(blocks, self.division_limit, self.age_threshold)
    }
}

/// Hot/warm parameters expressed in blocks and logical time ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tuning {
    pub(crate) warm_limit: usize,
    pub(crate) age_threshold: u64,
}

impl Tuning {
    pub(crate) fn new(blocks: usize, division_limit: u32, age_threshold: u32) -> Self {
        Self {
            warm_limit: blocks * division_limit as usize / 100,
            age_threshold: (blocks as u64 * age_threshold as u64 / 100).max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_derived_from_memory() {
        let config = PageCacheConfig::new(10 * 8192 + 100);
        assert_eq!(config.blocks(), 10);
        assert_eq!(config.hash_link_count(), 20);
        assert_eq!(PageCacheConfig::with_blocks(3, 512).blocks(), 3);
    }

    #[test]
    fn validate_rejects_bad_block_size() {
        let config = PageCacheConfig::new(1 << 20).with_block_size(1000);
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
        let config = PageCacheConfig::new(1 << 20).with_block_size(256);
        assert!(matches!(config.validate(), Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn validate_rejects_bad_tuning() {
        let base = PageCacheConfig::new(1 << 20);
        assert!(base.clone().with_division_limit(101).validate().is_err());
        assert!(base.clone().with_age_threshold(99).validate().is_err());
        assert!(base.clone().with_hash_links(0).validate().is_err());
        assert!(base.validate().is_ok());
    }

    #[test]
    fn tuning_scales_with_blocks() {
        let tuning = Tuning::new(200, 25, 300);
        assert_eq!(tuning.warm_limit, 50);
        assert_eq!(tuning.age_threshold, 600);
        assert_eq!(Tuning::new(1, 0, 100).age_threshold, 1);
    }
}
