//! Indexes of dirty blocks.
//!
//! A dirty block is present in both tables: the file-keyed one, used by the flush
//! engine to walk one file's dirty pages in page order, and the global one, used
//! for cache-wide operations (resize, checkpoint collection, statistics).

use std::collections::{BTreeMap, HashMap};

use crate::block::BlockId;
use crate::page::{FileId, PageNo, PageRef};

#[derive(Default)]
pub(crate) struct DirtyTables {
    by_file: HashMap<FileId, BTreeMap<PageNo, BlockId>>,
    global: HashMap<BlockId, PageRef>,
}

impl DirtyTables {
    pub(crate) fn insert(&mut self, key: PageRef, block: BlockId) {
        self.by_file
            .entry(key.file)
            .or_default()
            .insert(key.page, block);
        self.global.insert(block, key);
    }

    pub(crate) fn remove(&mut self, key: &PageRef, block: BlockId) {
        if let Some(pages) = self.by_file.get_mut(&key.file) {
            pages.remove(&key.page);
            if pages.is_empty() {
                self.by_file.remove(&key.file);
            }
        }
        self.global.remove(&block);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, block: BlockId) -> bool {
        self.global.contains_key(&block)
    }

    pub(crate) fn len(&self) -> usize {
        self.global.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    /// Returns the first dirty page of `file` whose number is at least `from`.
    pub(crate) fn next_from(&self, file: FileId, from: PageNo) -> Option<(PageNo, BlockId)> {
        self.by_file
            .get(&file)?
            .range(from..)
            .next()
            .map(|(page, block)| (*page, *block))
    }

    /// Returns dirty pages of `file` in page order.
    pub(crate) fn file_pages(&self, file: FileId) -> Vec<(PageNo, BlockId)> {
        self.by_file
            .get(&file)
            .map(|pages| pages.iter().map(|(page, block)| (*page, *block)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn has_file(&self, file: FileId) -> bool {
        self.by_file.contains_key(&file)
    }

    /// Returns files that have at least one dirty page, sorted.
    pub(crate) fn files(&self) -> Vec<FileId> {
        let mut files: Vec<_> = self.by_file.keys().copied().collect();
        files.sort_unstable();
        files
    }

    /// Iterates over all dirty blocks in no particular order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (BlockId, PageRef)> + '_ {
        self.global.iter().map(|(block, key)| (*block, *key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(file: u32, page: u64) -> PageRef {
        PageRef::new(FileId(file), page)
    }

    #[test]
    fn tables_stay_in_sync() {
        let mut dirty = DirtyTables::default();
        dirty.insert(page(1, 7), 0);
        dirty.insert(page(1, 3), 1);
        dirty.insert(page(2, 1), 2);

        assert_eq!(dirty.len(), 3);
        assert_eq!(dirty.files(), vec![FileId(1), FileId(2)]);
        assert_eq!(dirty.file_pages(FileId(1)), vec![(3, 1), (7, 0)]);

        dirty.remove(&page(2, 1), 2);
        assert!(!dirty.has_file(FileId(2)));
        assert!(!dirty.contains(2));
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty.iter().count(), 2);
    }

    #[test]
    fn next_from_walks_in_page_order() {
        let mut dirty = DirtyTables::default();
        for (block, p) in [(0, 9), (1, 2), (2, 5)] {
            dirty.insert(page(1, p), block);
        }
        assert_eq!(dirty.next_from(FileId(1), 0), Some((2, 1)));
        assert_eq!(dirty.next_from(FileId(1), 3), Some((5, 2)));
        assert_eq!(dirty.next_from(FileId(1), 6), Some((9, 0)));
        assert_eq!(dirty.next_from(FileId(1), 10), None);
        assert_eq!(dirty.next_from(FileId(4), 0), None);

        // page inserted behind the cursor is visible after restarting from 0
        dirty.insert(page(1, 1), 3);
        assert_eq!(dirty.next_from(FileId(1), 0), Some((1, 3)));
        assert!(!dirty.is_empty());
    }
}
