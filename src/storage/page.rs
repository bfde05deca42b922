//! # Pages and the Persistent Header
//!
//! Every page in the file is [`PAGE_SIZE`] bytes and begins with a 32-byte
//! persistent header that survives on disk:
//!
//! ```text
//! Offset  Size  Field         Description
//! ------  ----  ------------  -----------------------------------------
//! 0       8     self_id       File offset of this page (self-check)
//! 8       4     flags         Low byte: page kind
//! 12      4     reserved      Zero
//! 16      8     next_page_id  Freelist link / next leaf in sibling chain
//! 24      8     prev_page_id  Previous leaf in sibling chain
//! ```
//!
//! Pages are identified by their byte offset in the file, so id 0 is the
//! environment header page and all other ids are multiples of `PAGE_SIZE`.
//! All header integers are little-endian on disk; [`PersistedPageHeader`]
//! uses `zerocopy` little-endian wrappers so in-memory access is already
//! host-independent.
//!
//! A [`PageBuf`] is the in-memory materialisation of one page: the engine
//! owns the buffer (the cache decides its lifetime), and a dirty bit tracks
//! whether it must be written back before eviction.

use std::sync::Arc;

use parking_lot::RwLock;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::le_accessors;

/// A page id is the page's byte offset in the backing file.
pub type PageId = u64;

/// What a page's body contains, persisted in the header flags low byte.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Free = 0x00,
    EnvHeader = 0x01,
    BtreeInternal = 0x02,
    BtreeLeaf = 0x03,
    Blob = 0x04,
}

impl PageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(PageKind::Free),
            0x01 => Some(PageKind::EnvHeader),
            0x02 => Some(PageKind::BtreeInternal),
            0x03 => Some(PageKind::BtreeLeaf),
            0x04 => Some(PageKind::Blob),
            _ => None,
        }
    }

    pub fn is_btree(self) -> bool {
        matches!(self, PageKind::BtreeInternal | PageKind::BtreeLeaf)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PersistedPageHeader {
    self_id: U64,
    flags: U32,
    reserved: U32,
    next_page_id: U64,
    prev_page_id: U64,
}

impl PersistedPageHeader {
    le_accessors! {
        self_id: u64,
        flags: u32,
        next_page_id: u64,
        prev_page_id: u64,
    }
}

const _: () = assert!(std::mem::size_of::<PersistedPageHeader>() == PAGE_HEADER_SIZE);

/// An engine-owned page buffer.
#[derive(Debug)]
pub struct PageBuf {
    id: PageId,
    dirty: bool,
    data: Box<[u8]>,
}

impl PageBuf {
    /// Creates a zeroed page of `kind` with its header initialized.
    pub fn new(id: PageId, kind: PageKind) -> Self {
        let mut page = Self {
            id,
            dirty: false,
            data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
        };
        let header = page.header_mut();
        header.set_self_id(id);
        header.set_flags(kind as u32);
        page
    }

    /// Wraps raw bytes read from the file. The header's self id must match
    /// the offset the page was read from, except for freshly grown pages
    /// which are all zeroes.
    pub fn from_disk(id: PageId, data: Box<[u8]>) -> Result<Self> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let page = Self {
            id,
            dirty: false,
            data,
        };
        let self_id = page.header().self_id();
        if self_id != id && self_id != 0 {
            return Err(Error::Internal("page self id does not match file offset"));
        }
        Ok(page)
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn header(&self) -> &PersistedPageHeader {
        PersistedPageHeader::ref_from_bytes(&self.data[..PAGE_HEADER_SIZE])
            .expect("page buffer shorter than its header")
    }

    pub fn header_mut(&mut self) -> &mut PersistedPageHeader {
        PersistedPageHeader::mut_from_bytes(&mut self.data[..PAGE_HEADER_SIZE])
            .expect("page buffer shorter than its header")
    }

    pub fn kind(&self) -> PageKind {
        PageKind::from_byte((self.header().flags() & 0xff) as u8).unwrap_or(PageKind::Free)
    }

    pub fn set_kind(&mut self, kind: PageKind) {
        let flags = (self.header().flags() & !0xff) | kind as u32;
        self.header_mut().set_flags(flags);
    }

    pub fn next_page_id(&self) -> PageId {
        self.header().next_page_id()
    }

    pub fn set_next_page_id(&mut self, id: PageId) {
        self.header_mut().set_next_page_id(id);
    }

    pub fn prev_page_id(&self) -> PageId {
        self.header().prev_page_id()
    }

    pub fn set_prev_page_id(&mut self, id: PageId) {
        self.header_mut().set_prev_page_id(id);
    }

    /// The page body, after the persistent header.
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// The full raw page, header included, as written to disk.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Shared handle to a cached page. The cache holds one reference; any
/// additional strong count pins the page against eviction.
pub type PageHandle = Arc<RwLock<PageBuf>>;

pub fn new_handle(page: PageBuf) -> PageHandle {
    Arc::new(RwLock::new(page))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persisted_header_is_32_bytes() {
        assert_eq!(std::mem::size_of::<PersistedPageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn new_page_initializes_header() {
        let page = PageBuf::new(16384, PageKind::BtreeLeaf);
        assert_eq!(page.header().self_id(), 16384);
        assert_eq!(page.kind(), PageKind::BtreeLeaf);
        assert_eq!(page.next_page_id(), 0);
        assert_eq!(page.prev_page_id(), 0);
        assert!(!page.is_dirty());
    }

    #[test]
    fn kind_survives_flag_round_trip() {
        let mut page = PageBuf::new(0, PageKind::EnvHeader);
        page.set_kind(PageKind::Blob);
        assert_eq!(page.kind(), PageKind::Blob);
        assert_eq!(page.raw()[8], 0x04);
    }

    #[test]
    fn sibling_links_round_trip() {
        let mut page = PageBuf::new(32768, PageKind::BtreeLeaf);
        page.set_next_page_id(49152);
        page.set_prev_page_id(16384);
        assert_eq!(page.next_page_id(), 49152);
        assert_eq!(page.prev_page_id(), 16384);
    }

    #[test]
    fn from_disk_rejects_mismatched_self_id() {
        let page = PageBuf::new(16384, PageKind::Blob);
        let bytes = page.raw().to_vec().into_boxed_slice();
        let err = PageBuf::from_disk(32768, bytes).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn from_disk_accepts_zeroed_page() {
        let bytes = vec![0u8; PAGE_SIZE].into_boxed_slice();
        let page = PageBuf::from_disk(32768, bytes).unwrap();
        assert_eq!(page.kind(), PageKind::Free);
    }

    #[test]
    fn body_covers_rest_of_page() {
        let page = PageBuf::new(0, PageKind::BtreeLeaf);
        assert_eq!(page.body().len(), PAGE_SIZE - PAGE_HEADER_SIZE);
    }
}
