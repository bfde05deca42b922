//! # Changeset
//!
//! The ordered set of pages a flush unit (one committed transaction drain,
//! or one autocommitted operation) has dirtied. Membership pins a page in
//! the cache until [`Changeset::clear`] runs, so a half-applied mutation is
//! never partially evicted to disk out of order: the pager writes the whole
//! changeset, then releases it.

use hashbrown::HashSet;

use crate::storage::page::{PageHandle, PageId};

#[derive(Default)]
pub struct Changeset {
    pages: Vec<PageHandle>,
    members: HashSet<PageId>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a page, keeping the insertion order of the first add. A page
    /// id can re-enter with a fresh buffer (freed and re-allocated within
    /// one flush unit); the newer handle replaces the stale one in place.
    pub fn add(&mut self, page: PageHandle) {
        let id = page.read().id();
        if self.members.insert(id) {
            self.pages.push(page);
            return;
        }
        if let Some(existing) = self
            .pages
            .iter_mut()
            .find(|existing| existing.read().id() == id)
        {
            if !std::sync::Arc::ptr_eq(existing, &page) {
                *existing = page;
            }
        }
    }

    pub fn contains(&self, id: PageId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Pages in the order they were first dirtied.
    pub fn iter(&self) -> impl Iterator<Item = &PageHandle> {
        self.pages.iter()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{new_handle, PageBuf, PageKind};

    #[test]
    fn add_is_idempotent_and_ordered() {
        let mut cs = Changeset::new();
        let a = new_handle(PageBuf::new(16384, PageKind::BtreeLeaf));
        let b = new_handle(PageBuf::new(32768, PageKind::BtreeLeaf));
        cs.add(a.clone());
        cs.add(b.clone());
        cs.add(a.clone());

        assert_eq!(cs.len(), 2);
        assert!(cs.contains(16384));
        assert!(cs.contains(32768));
        let order: Vec<u64> = cs.iter().map(|p| p.read().id()).collect();
        assert_eq!(order, vec![16384, 32768]);
    }

    #[test]
    fn readding_an_id_swaps_in_the_newer_handle() {
        let mut cs = Changeset::new();
        cs.add(new_handle(PageBuf::new(16384, PageKind::Blob)));
        // the id re-enters with a fresh buffer after free + realloc
        cs.add(new_handle(PageBuf::new(16384, PageKind::BtreeLeaf)));

        assert_eq!(cs.len(), 1);
        let stored = cs.iter().next().unwrap();
        assert_eq!(stored.read().kind(), PageKind::BtreeLeaf);
    }

    #[test]
    fn clear_releases_membership() {
        let mut cs = Changeset::new();
        cs.add(new_handle(PageBuf::new(0, PageKind::EnvHeader)));
        cs.clear();
        assert!(cs.is_empty());
        assert!(!cs.contains(0));
    }
}
