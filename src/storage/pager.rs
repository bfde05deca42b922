//! # Pager
//!
//! Materialises pages from the backing file through the cache and owns the
//! page lifecycle: fault-in, allocation (freelist first, then end of file),
//! dirty tracking via the active changeset, eviction, and write-back.
//!
//! A page is *pinned* while anything outside the cache holds its handle;
//! the pager never evicts pinned pages, changeset members, or the
//! environment header page. Everything else is fair game once the cache
//! runs over capacity.
//!
//! The cache, the changeset, and the freelist head live under one mutex,
//! the single short-lived lock of the storage layer.

use std::path::Path;

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::PAGE_SIZE;
use crate::error::Result;
use crate::storage::cache::Cache;
use crate::storage::changeset::Changeset;
use crate::storage::file::PagedFile;
use crate::storage::page::{new_handle, PageBuf, PageHandle, PageId, PageKind};

struct PagerState {
    cache: Cache,
    changeset: Changeset,
    /// Head of the free page chain, threaded through page headers.
    /// Zero means empty (page 0 is the header and never free).
    free_head: PageId,
    file: PagedFile,
}

pub struct Pager {
    state: Mutex<PagerState>,
}

impl Pager {
    pub fn create(path: &Path, mode: u32, cache_capacity: u64) -> Result<Self> {
        let file = PagedFile::create(path, mode)?;
        Ok(Self::with_file(file, cache_capacity))
    }

    pub fn open(path: &Path, read_only: bool, cache_capacity: u64) -> Result<Self> {
        let file = PagedFile::open(path, read_only)?;
        Ok(Self::with_file(file, cache_capacity))
    }

    fn with_file(file: PagedFile, cache_capacity: u64) -> Self {
        Self {
            state: Mutex::new(PagerState {
                cache: Cache::new(cache_capacity),
                changeset: Changeset::new(),
                free_head: 0,
                file,
            }),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.state.lock().file.is_read_only()
    }

    pub fn page_count(&self) -> u64 {
        self.state.lock().file.page_count()
    }

    pub fn cache_capacity(&self) -> u64 {
        self.state.lock().cache.capacity_bytes()
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.cache.hits(), state.cache.misses())
    }

    pub fn free_head(&self) -> PageId {
        self.state.lock().free_head
    }

    pub fn set_free_head(&self, head: PageId) {
        self.state.lock().free_head = head;
    }

    /// Faults a page in, consulting the cache first.
    pub fn fetch(&self, id: PageId) -> Result<PageHandle> {
        let mut state = self.state.lock();
        if let Some(handle) = state.cache.get(id) {
            return Ok(handle);
        }
        trace!(page = id, "page cache miss");
        let page = state.file.read_page(id)?;
        let handle = new_handle(page);
        state.cache.insert(handle.clone());
        Self::purge_locked(&mut state)?;
        Ok(handle)
    }

    /// Allocates a page of `kind`, reusing the freelist when possible. The
    /// returned page is zeroed, dirty, and part of the active changeset.
    pub fn alloc(&self, kind: PageKind) -> Result<PageHandle> {
        let mut state = self.state.lock();
        let id = if state.free_head != 0 {
            let id = state.free_head;
            // pop: the free page's next link is the new head
            let page = match state.cache.get(id) {
                Some(handle) => handle,
                None => new_handle(state.file.read_page(id)?),
            };
            state.free_head = page.read().next_page_id();
            state.cache.remove(id);
            id
        } else {
            state.file.extend()?
        };

        let mut page = PageBuf::new(id, kind);
        page.mark_dirty();
        let handle = new_handle(page);
        state.cache.insert(handle.clone());
        state.changeset.add(handle.clone());
        Self::purge_locked(&mut state)?;
        Ok(handle)
    }

    /// Returns a page to the freelist. The caller must not use the handle
    /// afterwards.
    pub fn free(&self, handle: &PageHandle) -> Result<()> {
        let mut state = self.state.lock();
        let id = {
            let mut page = handle.write();
            let id = page.id();
            let next = state.free_head;
            *page = PageBuf::new(id, PageKind::Free);
            page.set_next_page_id(next);
            page.mark_dirty();
            id
        };
        state.free_head = id;
        state.changeset.add(handle.clone());
        Ok(())
    }

    /// Marks a page dirty and pins it to the active changeset.
    pub fn mark_dirty(&self, handle: &PageHandle) {
        handle.write().mark_dirty();
        let mut state = self.state.lock();
        state.changeset.add(handle.clone());
    }

    /// Writes out every page of the active changeset, in first-dirtied
    /// order, and releases it. On error the changeset is kept so the next
    /// flush retries.
    pub fn flush_changeset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.changeset.is_empty() {
            return Ok(());
        }
        debug!(pages = state.changeset.len(), "flushing changeset");
        let pages: Vec<PageHandle> = state.changeset.iter().cloned().collect();
        for handle in &pages {
            let mut page = handle.write();
            if page.is_dirty() {
                state.file.write_page(&page)?;
                page.clear_dirty();
            }
        }
        state.changeset.clear();
        Self::purge_locked(&mut state)?;
        Ok(())
    }

    /// Number of pages in the active changeset.
    pub fn changeset_len(&self) -> usize {
        self.state.lock().changeset.len()
    }

    /// Writes every dirty cached page and syncs the file.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let pages: Vec<PageHandle> = {
            let mut all = Vec::new();
            // drain-and-reinsert keeps the recency order intact
            for handle in state.cache.drain() {
                state.cache.insert(handle.clone());
                all.push(handle);
            }
            all
        };
        for handle in &pages {
            let mut page = handle.write();
            if page.is_dirty() {
                state.file.write_page(&page)?;
                page.clear_dirty();
            }
        }
        state.changeset.clear();
        state.file.sync()?;
        Ok(())
    }

    /// Evicts down to capacity if the cache has outgrown it.
    pub fn purge_if_over_capacity(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::purge_locked(&mut state)
    }

    fn purge_locked(state: &mut PagerState) -> Result<()> {
        if !state.cache.is_over_capacity() {
            return Ok(());
        }
        let changeset = &state.changeset;
        let victims = state.cache.purge_victims(|id, handle| {
            id != 0 && !changeset.contains(id) && Arc::strong_count(handle) == 1
        });
        if victims.is_empty() {
            return Ok(());
        }
        debug!(victims = victims.len(), "cache purge");
        for handle in &victims {
            let mut page = handle.write();
            if page.is_dirty() {
                state.file.write_page(&page)?;
                page.clear_dirty();
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.state.lock().file.sync()
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.state.lock().file.path().to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CACHE_UNLIMITED, PURGE_AT_LEAST};
    use tempfile::tempdir;

    fn test_pager(capacity: u64) -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), 0o644, capacity).unwrap();
        (dir, pager)
    }

    #[test]
    fn alloc_extends_the_file() {
        let (_dir, pager) = test_pager(CACHE_UNLIMITED);
        let a = pager.alloc(PageKind::BtreeLeaf).unwrap();
        let b = pager.alloc(PageKind::BtreeLeaf).unwrap();
        assert_eq!(a.read().id(), 0);
        assert_eq!(b.read().id(), PAGE_SIZE as u64);
        assert_eq!(pager.page_count(), 2);
    }

    #[test]
    fn fetch_round_trips_through_the_file() {
        let (_dir, pager) = test_pager(CACHE_UNLIMITED);
        let id = {
            let handle = pager.alloc(PageKind::Blob).unwrap();
            let mut page = handle.write();
            page.body_mut()[..3].copy_from_slice(b"abc");
            page.id()
        };
        pager.flush_changeset().unwrap();

        let back = pager.fetch(id).unwrap();
        assert_eq!(&back.read().body()[..3], b"abc");
    }

    #[test]
    fn freed_pages_are_reused() {
        let (_dir, pager) = test_pager(CACHE_UNLIMITED);
        let _header = pager.alloc(PageKind::EnvHeader).unwrap();
        let a = pager.alloc(PageKind::Blob).unwrap();
        let id = a.read().id();
        pager.free(&a).unwrap();
        drop(a);
        assert_eq!(pager.free_head(), id);

        let b = pager.alloc(PageKind::BtreeLeaf).unwrap();
        assert_eq!(b.read().id(), id);
        assert_eq!(pager.free_head(), 0);
        assert_eq!(pager.page_count(), 2);
    }

    #[test]
    fn changeset_members_survive_purge() {
        let (_dir, pager) = test_pager(PAGE_SIZE as u64);
        let mut dirtied = Vec::new();
        for _ in 0..PURGE_AT_LEAST + 10 {
            let handle = pager.alloc(PageKind::Blob).unwrap();
            dirtied.push(handle.read().id());
            drop(handle);
        }
        // every allocated page is in the changeset, so nothing was evicted
        pager.purge_if_over_capacity().unwrap();
        assert_eq!(pager.changeset_len(), dirtied.len());

        pager.flush_changeset().unwrap();
        // after the flush the pages are evictable and the purge kicked in
        assert!(pager.changeset_len() == 0);
    }

    #[test]
    fn purge_writes_dirty_pages_before_evicting() {
        let (_dir, pager) = test_pager(PAGE_SIZE as u64);
        let mut ids = Vec::new();
        for i in 0..PURGE_AT_LEAST as u8 + 20 {
            let handle = pager.alloc(PageKind::Blob).unwrap();
            handle.write().body_mut()[0] = i;
            ids.push(handle.read().id());
        }
        pager.flush_changeset().unwrap();

        for (i, id) in ids.iter().enumerate() {
            let page = pager.fetch(*id).unwrap();
            assert_eq!(page.read().body()[0], i as u8, "page {id} lost its data");
        }
    }

    #[test]
    fn cache_hit_and_miss_counters_track_fetches() {
        let (_dir, pager) = test_pager(CACHE_UNLIMITED);
        let id = {
            let handle = pager.alloc(PageKind::Blob).unwrap();
            let id = handle.read().id();
            id
        };
        pager.flush_changeset().unwrap();

        pager.fetch(id).unwrap();
        pager.fetch(id).unwrap();
        let (hits, _misses) = pager.cache_stats();
        assert!(hits >= 2);
    }
}
