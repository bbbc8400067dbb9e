//! Eviction order of idle blocks, split into cold, warm and hot chains.
//!
//! Only idle blocks (bound to a page, not pinned, not locked, no thread inside an
//! operation on them) are linked into a chain. Every chain is ordered from least
//! (head) to most (tail) recently released.
//!
//! - cold: blocks referenced once since they were loaded. A sequential scan only
//!   ever fills this chain, and it is drained first.
//! - warm: blocks referenced at least twice. Bounded by the division limit; the
//!   least recent warm block is demoted to cold when the bound is exceeded.
//! - hot: warm blocks that were referenced again after staying warm for at least
//!   the age threshold. A hot block that is not referenced for longer than the age
//!   threshold falls back to warm.
//!
//! Time is logical: it advances by one every time a block is released.

use crate::block::BlockId;
use crate::config::Tuning;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Temperature {
    Cold,
    Warm,
    Hot,
}

/// Per-block bookkeeping, kept while the block is in use too.
#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<BlockId>,
    next: Option<BlockId>,
    linked: bool,
    temperature: Temperature,
    /// References since the page was bound, saturating.
    hits: u32,
    /// Logical time of the last release.
    last_release: u64,
    /// Logical time at which the block became warm.
    warm_since: u64,
}

impl Node {
    fn new() -> Self {
        Self {
            prev: None,
            next: None,
            linked: false,
            temperature: Temperature::Cold,
            hits: 0,
            last_release: 0,
            warm_since: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Chain {
    head: Option<BlockId>,
    tail: Option<BlockId>,
    len: usize,
}

pub(crate) struct LruPartition {
    nodes: Vec<Node>,
    cold: Chain,
    warm: Chain,
    hot: Chain,
    tuning: Tuning,
    time: u64,
}

impl LruPartition {
    pub(crate) fn new(blocks: usize, tuning: Tuning) -> Self {
        Self {
            nodes: vec![Node::new(); blocks],
            cold: Chain::default(),
            warm: Chain::default(),
            hot: Chain::default(),
            tuning,
            time: 0,
        }
    }

    /// Changes hot/warm parameters. An oversized warm chain is trimmed right away.
    pub(crate) fn set_tuning(&mut self, tuning: Tuning) {
        self.tuning = tuning;
        self.enforce_warm_limit();
    }

    /// Forgets the history of `id`; used when the block gets bound to a new page.
    pub(crate) fn reset(&mut self, id: BlockId) {
        if self.nodes[id].linked {
            self.unlink(id);
        }
        self.nodes[id] = Node::new();
    }

    /// Registers one reference to the page held by `id`.
    pub(crate) fn touch(&mut self, id: BlockId) {
        let node = &mut self.nodes[id];
        node.hits = node.hits.saturating_add(1);
    }

    pub(crate) fn contains(&self, id: BlockId) -> bool {
        self.nodes[id].linked
    }

    pub(crate) fn warm_len(&self) -> usize {
        self.warm.len
    }

    pub(crate) fn hot_len(&self) -> usize {
        self.hot.len
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cold.len + self.warm.len + self.hot.len
    }

    #[cfg(test)]
    fn temperature(&self, id: BlockId) -> Temperature {
        self.nodes[id].temperature
    }

    /// Links block that just became idle at the most recent end of the chain its
    /// history puts it in, then ages the hot chain.
    pub(crate) fn link(&mut self, id: BlockId) {
        debug_assert!(!self.nodes[id].linked, "block {id} linked twice");
        self.time += 1;
        let time = self.time;

        let node = &mut self.nodes[id];
        let target = match node.temperature {
            Temperature::Hot => Temperature::Hot,
            Temperature::Warm if time - node.warm_since >= self.tuning.age_threshold => {
                Temperature::Hot
            }
            Temperature::Warm => Temperature::Warm,
            Temperature::Cold if node.hits >= 2 && self.tuning.warm_limit > 0 => {
                node.warm_since = time;
                Temperature::Warm
            }
            Temperature::Cold => Temperature::Cold,
        };
        node.temperature = target;
        node.last_release = time;
        self.push_tail(id, target);

        self.age_hot_head();
        self.enforce_warm_limit();
    }

    /// Removes `id` from its chain. The block keeps its temperature.
    pub(crate) fn unlink(&mut self, id: BlockId) {
        let node = self.nodes[id];
        debug_assert!(node.linked, "block {id} is not linked");
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.chain_mut(node.temperature).head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.chain_mut(node.temperature).tail = node.prev,
        }
        self.chain_mut(node.temperature).len -= 1;
        let node = &mut self.nodes[id];
        node.prev = None;
        node.next = None;
        node.linked = false;
    }

    /// Picks the block to evict: the least recent cold block, then warm, then hot.
    /// Within the first non-empty chain the least recent block for which `is_clean`
    /// holds is preferred, otherwise the chain's head is returned.
    pub(crate) fn select_victim(&self, is_clean: impl Fn(BlockId) -> bool) -> Option<BlockId> {
        for chain in [&self.cold, &self.warm, &self.hot] {
            let Some(head) = chain.head else {
                continue;
            };
            let mut cursor = Some(head);
            while let Some(id) = cursor {
                if is_clean(id) {
                    return Some(id);
                }
                cursor = self.nodes[id].next;
            }
            return Some(head);
        }
        None
    }

    fn chain_mut(&mut self, temperature: Temperature) -> &mut Chain {
        match temperature {
            Temperature::Cold => &mut self.cold,
            Temperature::Warm => &mut self.warm,
            Temperature::Hot => &mut self.hot,
        }
    }

    fn push_tail(&mut self, id: BlockId, temperature: Temperature) {
        let tail = self.chain_mut(temperature).tail;
        {
            let node = &mut self.nodes[id];
            node.temperature = temperature;
            node.prev = tail;
            node.next = None;
            node.linked = true;
        }
        match tail {
            Some(tail) => self.nodes[tail].next = Some(id),
            None => self.chain_mut(temperature).head = Some(id),
        }
        let chain = self.chain_mut(temperature);
        chain.tail = Some(id);
        chain.len += 1;
    }

    /// Moves linked block `id` to the tail of another chain.
    fn move_to(&mut self, id: BlockId, temperature: Temperature) {
        self.unlink(id);
        if temperature == Temperature::Warm {
            self.nodes[id].warm_since = self.time;
        }
        if temperature == Temperature::Cold {
            // needs two fresh references to get warm again
            self.nodes[id].hits = 1;
        }
        self.push_tail(id, temperature);
    }

    fn age_hot_head(&mut self) {
        if let Some(head) = self.hot.head
            && self.time - self.nodes[head].last_release > self.tuning.age_threshold
        {
            self.move_to(head, Temperature::Warm);
        }
    }

    fn enforce_warm_limit(&mut self) {
        while self.warm.len > self.tuning.warm_limit {
            let Some(head) = self.warm.head else {
                break;
            };
            self.move_to(head, Temperature::Cold);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition(blocks: usize, warm_limit: usize, age_threshold: u64) -> LruPartition {
        LruPartition::new(
            blocks,
            Tuning {
                warm_limit,
                age_threshold,
            },
        )
    }

    /// Simulates `references` requests for `id` followed by its release.
    fn use_block(lru: &mut LruPartition, id: BlockId, references: u32) {
        if lru.contains(id) {
            lru.unlink(id);
        }
        for _ in 0..references {
            lru.touch(id);
        }
        lru.link(id);
    }

    #[test]
    fn single_reference_blocks_stay_cold_in_release_order() {
        let mut lru = partition(4, 2, 100);
        for id in 0..4 {
            use_block(&mut lru, id, 1);
        }
        assert_eq!(lru.len(), 4);
        assert_eq!(lru.warm_len(), 0);
        assert_eq!(lru.select_victim(|_| true), Some(0));
    }

    #[test]
    fn scan_does_not_evict_warm_blocks() {
        let mut lru = partition(4, 2, 100);
        use_block(&mut lru, 0, 1);
        use_block(&mut lru, 0, 1);
        assert_eq!(lru.temperature(0), Temperature::Warm);

        // one pass over other pages
        for id in 1..4 {
            use_block(&mut lru, id, 1);
        }
        assert_eq!(lru.select_victim(|_| true), Some(1));

        // cold drained -> warm is next
        for id in 1..4 {
            lru.unlink(id);
        }
        assert_eq!(lru.select_victim(|_| true), Some(0));
    }

    #[test]
    fn warm_limit_demotes_least_recent_warm_block() {
        let mut lru = partition(4, 2, 100);
        for id in 0..3 {
            use_block(&mut lru, id, 2);
        }
        assert_eq!(lru.warm_len(), 2);
        assert_eq!(lru.temperature(0), Temperature::Cold);
        assert_eq!(lru.temperature(1), Temperature::Warm);
        assert_eq!(lru.temperature(2), Temperature::Warm);
        assert_eq!(lru.select_victim(|_| true), Some(0));
    }

    #[test]
    fn warm_block_becomes_hot_after_age_threshold() {
        let mut lru = partition(8, 4, 3);
        use_block(&mut lru, 0, 2);
        assert_eq!(lru.temperature(0), Temperature::Warm);

        // re-referenced too early
        use_block(&mut lru, 0, 1);
        assert_eq!(lru.temperature(0), Temperature::Warm);

        for id in 1..4 {
            use_block(&mut lru, id, 1);
        }
        use_block(&mut lru, 0, 1);
        assert_eq!(lru.temperature(0), Temperature::Hot);
        assert_eq!(lru.hot_len(), 1);
    }

    #[test]
    fn idle_hot_block_cools_down_to_warm() {
        let mut lru = partition(8, 4, 2);
        use_block(&mut lru, 0, 2);
        use_block(&mut lru, 1, 1);
        use_block(&mut lru, 2, 1);
        use_block(&mut lru, 0, 1);
        assert_eq!(lru.temperature(0), Temperature::Hot);

        for _ in 0..3 {
            use_block(&mut lru, 3, 1);
        }
        assert_eq!(lru.temperature(0), Temperature::Warm);
        assert_eq!(lru.hot_len(), 0);
    }

    #[test]
    fn victim_prefers_clean_block_within_chain() {
        let mut lru = partition(4, 2, 100);
        for id in 0..3 {
            use_block(&mut lru, id, 1);
        }
        assert_eq!(lru.select_victim(|id| id == 2), Some(2));
        // nothing clean -> oldest
        assert_eq!(lru.select_victim(|_| false), Some(0));
    }

    #[test]
    fn reset_unlinks_and_forgets_history() {
        let mut lru = partition(2, 1, 100);
        use_block(&mut lru, 0, 2);
        assert_eq!(lru.warm_len(), 1);
        lru.reset(0);
        assert!(!lru.contains(0));
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.temperature(0), Temperature::Cold);
        assert_eq!(lru.select_victim(|_| true), None);
    }

    #[test]
    fn shrinking_division_limit_trims_warm_chain() {
        let mut lru = partition(4, 3, 100);
        for id in 0..3 {
            use_block(&mut lru, id, 2);
        }
        assert_eq!(lru.warm_len(), 3);
        lru.set_tuning(Tuning {
            warm_limit: 1,
            age_threshold: 100,
        });
        assert_eq!(lru.warm_len(), 1);
        assert_eq!(lru.temperature(2), Temperature::Warm);
    }
}
