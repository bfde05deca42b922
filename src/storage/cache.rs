//! # Page Cache
//!
//! Bounded cache of materialised pages with O(1) average lookup and an
//! LRU-ordered eviction scan. Two linkages thread every cached page:
//!
//! - the *totallist*, ordered insertion-then-most-recently-used, scanned
//!   from the cold end when the cache runs over capacity;
//! - a *hash bucket* chain, `id mod CACHE_BUCKET_COUNT`, walked on lookup.
//!
//! The original engine threads both lists intrusively through the page
//! struct. Here every cached page lives in one arena slot and both lists
//! are index links on the slot, which gives the same O(1) unlink without
//! raw pointers:
//!
//! ```text
//! slots:   [ e0 ]   [ e1 ]   [ e2 ]   [ free ]  [ e4 ] ...
//!            │ ▲      │ ▲      │
//! totallist  └─┴──────┴─┴──────┘        (prev_total / next_total)
//! buckets[h] ──> e2 ──> e0               (prev_bucket / next_bucket)
//! ```
//!
//! Eviction policy: once `bytes_used > capacity_bytes`, scan from the cold
//! end and free victims until the cache is back under capacity and at least
//! [`PURGE_AT_LEAST`] pages were freed, or the list is exhausted. The
//! caller supplies the eligibility check (pinned pages, changeset members
//! and the header page are never victims) and writes out dirty victims.
//!
//! The cache is wrapped in a single mutex by the pager; all operations are
//! short and never touch the file.

use crate::config::{CACHE_BUCKET_COUNT, PAGE_SIZE, PURGE_AT_LEAST};
use crate::storage::page::{PageHandle, PageId};

struct Entry {
    id: PageId,
    page: PageHandle,
    next_bucket: Option<usize>,
    prev_bucket: Option<usize>,
    next_total: Option<usize>,
    prev_total: Option<usize>,
}

pub struct Cache {
    slots: Vec<Option<Entry>>,
    free_slots: Vec<usize>,
    buckets: Box<[Option<usize>]>,
    /// Cold end of the totallist.
    total_head: Option<usize>,
    /// Hot end of the totallist.
    total_tail: Option<usize>,
    capacity_bytes: u64,
    alloc_elements: usize,
    hits: u64,
    misses: u64,
}

fn bucket_of(id: PageId) -> usize {
    (id % CACHE_BUCKET_COUNT as u64) as usize
}

impl Cache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![None; CACHE_BUCKET_COUNT].into_boxed_slice(),
            total_head: None,
            total_tail: None,
            capacity_bytes,
            alloc_elements: 0,
            hits: 0,
            misses: 0,
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    pub fn set_capacity_bytes(&mut self, capacity: u64) {
        self.capacity_bytes = capacity;
    }

    pub fn bytes_used(&self) -> u64 {
        self.alloc_elements as u64 * PAGE_SIZE as u64
    }

    pub fn len(&self) -> usize {
        self.alloc_elements
    }

    pub fn is_empty(&self) -> bool {
        self.alloc_elements == 0
    }

    pub fn is_over_capacity(&self) -> bool {
        self.bytes_used() > self.capacity_bytes
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Looks up a page and, on a hit, moves it to the hot end.
    pub fn get(&mut self, id: PageId) -> Option<PageHandle> {
        let mut cursor = self.buckets[bucket_of(id)];
        while let Some(idx) = cursor {
            let entry = self.slots[idx].as_ref().expect("bucket links a free slot");
            if entry.id == id {
                self.hits += 1;
                self.unlink_total(idx);
                self.push_total_tail(idx);
                let entry = self.slots[idx].as_ref().expect("slot vanished");
                return Some(entry.page.clone());
            }
            cursor = entry.next_bucket;
        }
        self.misses += 1;
        None
    }

    /// Peeks without touching recency or counters.
    pub fn peek(&self, id: PageId) -> Option<PageHandle> {
        let mut cursor = self.buckets[bucket_of(id)];
        while let Some(idx) = cursor {
            let entry = self.slots[idx].as_ref().expect("bucket links a free slot");
            if entry.id == id {
                return Some(entry.page.clone());
            }
            cursor = entry.next_bucket;
        }
        None
    }

    /// Inserts a page that is not currently cached.
    pub fn insert(&mut self, page: PageHandle) {
        let id = page.read().id();
        debug_assert!(self.peek(id).is_none(), "page {id} already cached");

        let entry = Entry {
            id,
            page,
            next_bucket: None,
            prev_bucket: None,
            next_total: None,
            prev_total: None,
        };
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(entry);
                idx
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.push_bucket_front(idx);
        self.push_total_tail(idx);
        self.alloc_elements += 1;
    }

    /// Detaches a page from both linkages and returns its handle.
    pub fn remove(&mut self, id: PageId) -> Option<PageHandle> {
        let mut cursor = self.buckets[bucket_of(id)];
        while let Some(idx) = cursor {
            let entry = self.slots[idx].as_ref().expect("bucket links a free slot");
            if entry.id == id {
                return Some(self.remove_slot(idx));
            }
            cursor = entry.next_bucket;
        }
        None
    }

    /// Scans from the cold end and detaches eligible victims until the
    /// cache is back under capacity and at least [`PURGE_AT_LEAST`] pages
    /// were freed, or no candidates remain. Victims are returned coldest
    /// first; the caller writes out the dirty ones.
    pub fn purge_victims(
        &mut self,
        mut eligible: impl FnMut(PageId, &PageHandle) -> bool,
    ) -> Vec<PageHandle> {
        let mut victims = Vec::new();
        let mut cursor = self.total_head;
        while let Some(idx) = cursor {
            if victims.len() >= PURGE_AT_LEAST && !self.is_over_capacity() {
                break;
            }
            let entry = self.slots[idx].as_ref().expect("totallist links a free slot");
            let next = entry.next_total;
            if eligible(entry.id, &entry.page) {
                victims.push(self.remove_slot(idx));
            }
            cursor = next;
        }
        victims
    }

    /// Detaches every cached page, hottest last.
    pub fn drain(&mut self) -> Vec<PageHandle> {
        let mut pages = Vec::with_capacity(self.alloc_elements);
        while let Some(idx) = self.total_head {
            pages.push(self.remove_slot(idx));
        }
        pages
    }

    fn remove_slot(&mut self, idx: usize) -> PageHandle {
        self.unlink_bucket(idx);
        self.unlink_total(idx);
        let entry = self.slots[idx].take().expect("removing a free slot");
        self.free_slots.push(idx);
        self.alloc_elements -= 1;
        entry.page
    }

    fn push_bucket_front(&mut self, idx: usize) {
        let id = self.slots[idx].as_ref().expect("pushing a free slot").id;
        let bucket = bucket_of(id);
        let old_head = self.buckets[bucket];
        if let Some(head) = old_head {
            self.slots[head].as_mut().expect("bucket head is free").prev_bucket = Some(idx);
        }
        let entry = self.slots[idx].as_mut().expect("pushing a free slot");
        entry.next_bucket = old_head;
        entry.prev_bucket = None;
        self.buckets[bucket] = Some(idx);
    }

    fn unlink_bucket(&mut self, idx: usize) {
        let (id, prev, next) = {
            let entry = self.slots[idx].as_ref().expect("unlinking a free slot");
            (entry.id, entry.prev_bucket, entry.next_bucket)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().expect("bucket prev is free").next_bucket = next,
            None => self.buckets[bucket_of(id)] = next,
        }
        if let Some(n) = next {
            self.slots[n].as_mut().expect("bucket next is free").prev_bucket = prev;
        }
        let entry = self.slots[idx].as_mut().expect("unlinking a free slot");
        entry.prev_bucket = None;
        entry.next_bucket = None;
    }

    fn push_total_tail(&mut self, idx: usize) {
        let old_tail = self.total_tail;
        if let Some(tail) = old_tail {
            self.slots[tail].as_mut().expect("total tail is free").next_total = Some(idx);
        }
        let entry = self.slots[idx].as_mut().expect("pushing a free slot");
        entry.prev_total = old_tail;
        entry.next_total = None;
        self.total_tail = Some(idx);
        if self.total_head.is_none() {
            self.total_head = Some(idx);
        }
    }

    fn unlink_total(&mut self, idx: usize) {
        let (prev, next) = {
            let entry = self.slots[idx].as_ref().expect("unlinking a free slot");
            (entry.prev_total, entry.next_total)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().expect("total prev is free").next_total = next,
            None => self.total_head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().expect("total next is free").prev_total = prev,
            None => self.total_tail = prev,
        }
        let entry = self.slots[idx].as_mut().expect("unlinking a free slot");
        entry.prev_total = None;
        entry.next_total = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CACHE_UNLIMITED;
    use crate::storage::page::{new_handle, PageBuf, PageKind};

    fn page(n: u64) -> PageHandle {
        new_handle(PageBuf::new(n * PAGE_SIZE as u64, PageKind::BtreeLeaf))
    }

    #[test]
    fn get_counts_hits_and_misses() {
        let mut cache = Cache::new(CACHE_UNLIMITED);
        cache.insert(page(1));

        assert!(cache.get(PAGE_SIZE as u64).is_some());
        assert!(cache.get(7 * PAGE_SIZE as u64).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn remove_detaches_from_both_lists() {
        let mut cache = Cache::new(CACHE_UNLIMITED);
        for n in 1..=5 {
            cache.insert(page(n));
        }
        assert!(cache.remove(3 * PAGE_SIZE as u64).is_some());
        assert_eq!(cache.len(), 4);
        assert!(cache.peek(3 * PAGE_SIZE as u64).is_none());
        // the survivors are all still reachable
        for n in [1u64, 2, 4, 5] {
            assert!(cache.peek(n * PAGE_SIZE as u64).is_some(), "page {n} lost");
        }
    }

    #[test]
    fn purge_scans_cold_end_first() {
        let mut cache = Cache::new(0);
        for n in 1..=4 {
            cache.insert(page(n));
        }
        // touching page 1 moves it to the hot end
        cache.get(PAGE_SIZE as u64);

        let victims = cache.purge_victims(|_, _| true);
        let ids: Vec<u64> = victims.iter().map(|p| p.read().id()).collect();
        assert_eq!(
            ids,
            vec![
                2 * PAGE_SIZE as u64,
                3 * PAGE_SIZE as u64,
                4 * PAGE_SIZE as u64,
                PAGE_SIZE as u64
            ]
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_skips_ineligible_pages() {
        let mut cache = Cache::new(0);
        for n in 1..=6 {
            cache.insert(page(n));
        }
        let keep = 4 * PAGE_SIZE as u64;
        let victims = cache.purge_victims(|id, _| id != keep);
        assert_eq!(victims.len(), 5);
        assert_eq!(cache.len(), 1);
        assert!(cache.peek(keep).is_some());
    }

    #[test]
    fn purge_frees_at_least_the_lower_bound() {
        // capacity of one page: far over capacity with 30 pages cached
        let mut cache = Cache::new(PAGE_SIZE as u64);
        for n in 1..=30 {
            cache.insert(page(n));
        }
        let victims = cache.purge_victims(|_, _| true);
        assert!(victims.len() >= PURGE_AT_LEAST);
        assert!(!cache.is_over_capacity());
    }

    #[test]
    fn purge_stops_once_satisfied() {
        // 30 pages, capacity 29: one page over, so the lower bound governs
        let mut cache = Cache::new(29 * PAGE_SIZE as u64);
        for n in 1..=30 {
            cache.insert(page(n));
        }
        let victims = cache.purge_victims(|_, _| true);
        assert_eq!(victims.len(), PURGE_AT_LEAST);
        assert_eq!(cache.len(), 30 - PURGE_AT_LEAST);
    }

    #[test]
    fn bucket_collisions_still_resolve() {
        let mut cache = Cache::new(CACHE_UNLIMITED);
        // ids congruent modulo the bucket count land in one chain
        let a = CACHE_BUCKET_COUNT as u64 * PAGE_SIZE as u64;
        let b = 2 * a;
        cache.insert(new_handle(PageBuf::new(a, PageKind::Blob)));
        cache.insert(new_handle(PageBuf::new(b, PageKind::Blob)));
        assert_eq!(bucket_of(a), bucket_of(b));
        assert_eq!(cache.get(a).unwrap().read().id(), a);
        assert_eq!(cache.get(b).unwrap().read().id(), b);
    }

    #[test]
    fn drain_returns_everything() {
        let mut cache = Cache::new(CACHE_UNLIMITED);
        for n in 1..=10 {
            cache.insert(page(n));
        }
        assert_eq!(cache.drain().len(), 10);
        assert!(cache.is_empty());
        assert_eq!(cache.bytes_used(), 0);
    }
}
