//! Page identity and page layout helpers.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};

/// Type representing page number inside a file, should be used instead of bare `u64`.
pub type PageNo = u64;

/// Logical sequence number handed out by the log handler. Opaque to the cache.
pub type Lsn = u64;

/// Size of the LSN header stored at the beginning of [`PageType::Lsn`] pages.
pub const LSN_HEADER_SIZE: usize = size_of::<Lsn>();

/// Identifier of a file registered with the block I/O collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Structure for referring to single page in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRef {
    pub(crate) file: FileId,
    pub(crate) page: PageNo,
}

impl PageRef {
    pub fn new(file: FileId, page: PageNo) -> Self {
        Self { file, page }
    }

    pub fn file(&self) -> FileId {
        self.file
    }

    pub fn page(&self) -> PageNo {
        self.page
    }

    /// Byte offset of the page in its file for the given block size, `None` if it
    /// does not fit in a `u64`.
    pub(crate) fn offset(&self, block_size: usize) -> Option<u64> {
        self.page.checked_mul(block_size as u64)
    }
}

impl fmt::Display for PageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.page)
    }
}

/// Classification of a page's layout.
///
/// [`PageType::Lsn`] pages carry an [`LSN_HEADER_SIZE`]-byte header with the
/// last LSN stamped on them. The cache only writes that header; it never reads it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageType {
    #[default]
    Plain,
    Lsn,
}

/// Gets the LSN stored in the header of an [`PageType::Lsn`] page.
pub fn get_page_lsn(page: &[u8]) -> Lsn {
    BigEndian::read_u64(&page[..LSN_HEADER_SIZE])
}

/// Stores `lsn` in the header of an [`PageType::Lsn`] page.
pub fn set_page_lsn(page: &mut [u8], lsn: Lsn) {
    BigEndian::write_u64(&mut page[..LSN_HEADER_SIZE], lsn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ref_offset_is_checked() {
        let page = PageRef::new(FileId(1), 1 << 33);
        assert_eq!(page.offset(4096), Some((1u64 << 33) * 4096));
        assert_eq!(PageRef::new(FileId(1), u64::MAX).offset(4096), None);
        assert_eq!(PageRef::new(FileId(1), u64::MAX).offset(1), Some(u64::MAX));
    }

    #[test]
    fn lsn_header_is_big_endian_prefix() {
        let mut page = [0u8; 16];
        set_page_lsn(&mut page, 0x0102_0304_0506_0708);
        assert_eq!(&page[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&page[8..], &[0; 8]);
        assert_eq!(get_page_lsn(&page), 0x0102_0304_0506_0708);
    }

    #[test]
    fn page_ref_display() {
        assert_eq!(PageRef::new(FileId(3), 17).to_string(), "#3:17");
    }
}
