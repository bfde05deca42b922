//! # Blob Storage
//!
//! Records too large for the 8-byte inline slot live in blob pages. A blob
//! is a chain of pages linked through the persistent header's
//! `next_page_id`; the first page starts with the total length:
//!
//! ```text
//! first page body:  [ size: u64 | data... ]
//! later page body:  [ data... ]
//! ```
//!
//! The record slot then stores the first page's id. Overwriting or erasing
//! a record frees the whole chain back to the freelist.

use crate::config::PAGE_USABLE_SIZE;
use crate::error::{Error, Result};
use crate::storage::{PageId, PageKind, Pager};

const BLOB_HEADER_SIZE: usize = 8;
const FIRST_CHUNK: usize = PAGE_USABLE_SIZE - BLOB_HEADER_SIZE;

/// Writes `data` as a new blob chain and returns the record id (the first
/// page's file offset).
pub fn alloc_blob(pager: &Pager, data: &[u8]) -> Result<PageId> {
    debug_assert!(data.len() > 0);

    let first = pager.alloc(PageKind::Blob)?;
    let first_id = first.read().id();
    {
        let mut page = first.write();
        let body = page.body_mut();
        body[..BLOB_HEADER_SIZE].copy_from_slice(&(data.len() as u64).to_le_bytes());
        let chunk = data.len().min(FIRST_CHUNK);
        body[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + chunk].copy_from_slice(&data[..chunk]);
    }

    let mut written = data.len().min(FIRST_CHUNK);
    let mut tail = first;
    while written < data.len() {
        let next = pager.alloc(PageKind::Blob)?;
        let next_id = next.read().id();
        tail.write().set_next_page_id(next_id);
        {
            let mut page = next.write();
            let chunk = (data.len() - written).min(PAGE_USABLE_SIZE);
            page.body_mut()[..chunk].copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }
        tail = next;
    }
    Ok(first_id)
}

/// Reads a whole blob chain.
pub fn read_blob(pager: &Pager, id: PageId) -> Result<Vec<u8>> {
    let first = pager.fetch(id)?;
    let (size, mut next, mut data) = {
        let page = first.read();
        if page.kind() != PageKind::Blob {
            return Err(Error::Internal("record id does not point at a blob page"));
        }
        let body = page.body();
        let size = u64::from_le_bytes(body[..BLOB_HEADER_SIZE].try_into().expect("blob header"))
            as usize;
        let chunk = size.min(FIRST_CHUNK);
        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(&body[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + chunk]);
        (size, page.next_page_id(), data)
    };

    while data.len() < size {
        if next == 0 {
            return Err(Error::Internal("blob chain ends before its recorded size"));
        }
        let handle = pager.fetch(next)?;
        let page = handle.read();
        let chunk = (size - data.len()).min(PAGE_USABLE_SIZE);
        data.extend_from_slice(&page.body()[..chunk]);
        next = page.next_page_id();
    }
    Ok(data)
}

/// Returns every page of a blob chain to the freelist.
pub fn free_blob(pager: &Pager, id: PageId) -> Result<()> {
    let mut next = id;
    while next != 0 {
        let handle = pager.fetch(next)?;
        let following = {
            let page = handle.read();
            if page.kind() != PageKind::Blob {
                return Err(Error::Internal("blob chain crosses a non-blob page"));
            }
            page.next_page_id()
        };
        pager.free(&handle)?;
        next = following;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CACHE_UNLIMITED, PAGE_SIZE};
    use tempfile::tempdir;

    fn test_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), 0o644, CACHE_UNLIMITED).unwrap();
        // reserve page 0 so blob ids are never the header offset
        pager.alloc(PageKind::EnvHeader).unwrap();
        (dir, pager)
    }

    #[test]
    fn small_blob_round_trip() {
        let (_dir, pager) = test_pager();
        let id = alloc_blob(&pager, b"hello blob world").unwrap();
        assert_eq!(read_blob(&pager, id).unwrap(), b"hello blob world");
    }

    #[test]
    fn multi_page_blob_round_trip() {
        let (_dir, pager) = test_pager();
        let data: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let id = alloc_blob(&pager, &data).unwrap();
        assert_eq!(read_blob(&pager, id).unwrap(), data);
    }

    #[test]
    fn exactly_one_body_blob() {
        let (_dir, pager) = test_pager();
        let data = vec![0xa5u8; FIRST_CHUNK];
        let id = alloc_blob(&pager, &data).unwrap();
        assert_eq!(read_blob(&pager, id).unwrap(), data);
        // single page: no chain link
        let page = pager.fetch(id).unwrap();
        assert_eq!(page.read().next_page_id(), 0);
    }

    #[test]
    fn free_blob_returns_chain_to_freelist() {
        let (_dir, pager) = test_pager();
        let data = vec![1u8; PAGE_USABLE_SIZE * 2];
        let id = alloc_blob(&pager, &data).unwrap();
        let pages_before = pager.page_count();

        free_blob(&pager, id).unwrap();
        assert_ne!(pager.free_head(), 0);

        // the next allocations reuse the freed chain instead of growing
        let a = pager.alloc(PageKind::Blob).unwrap();
        let b = pager.alloc(PageKind::Blob).unwrap();
        drop((a, b));
        assert_eq!(pager.page_count(), pages_before);
    }
}
