//! # PAX Node Layout
//!
//! A btree page body holds a 16-byte node header followed by three
//! contiguous arrays (keys, per-slot flags, record fields) instead of
//! interleaved entries:
//!
//! ```text
//! body:  [ NodeHeader | keys[max] | flags[max] | records[max] ]
//!
//! NodeHeader (16 bytes, little-endian):
//!   count: u32      live slots
//!   flags: u32      bit 0 = leaf
//!   ptr_down: u64   leftmost child (internal nodes only)
//! ```
//!
//! `max` is fixed at node construction:
//! `(body_len - 16) / (key_size + 1 + record_size)`.
//!
//! Slot operations shift all three arrays together; the search runs a
//! binary search that degrades to a linear scan once the remaining window
//! drops under the key list's threshold.

use std::cmp::Ordering;

use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::btree::keys::{CompareFn, KeyList};
use crate::config::NODE_HEADER_SIZE;
use crate::le_accessors;

const LEAF_FLAG: u32 = 0x1;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NodeHeader {
    count: U32,
    flags: U32,
    ptr_down: U64,
}

impl NodeHeader {
    le_accessors! {
        count: u32,
        flags: u32,
        ptr_down: u64,
    }
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE);

/// Result of a node search: `slot` is the greatest index whose key is at
/// most the search key, or -1 when every key is greater (the search then
/// continues at `ptr_down` in internal nodes). `exact` is set when
/// `keys[slot]` equals the search key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSearch {
    pub slot: i32,
    pub exact: bool,
}

/// Read-only view over a node body.
pub struct PaxNode<'a, K: KeyList> {
    body: &'a [u8],
    keys: K,
    record_size: usize,
    max_count: usize,
}

/// Mutable view over a node body.
pub struct PaxNodeMut<'a, K: KeyList> {
    body: &'a mut [u8],
    keys: K,
    record_size: usize,
    max_count: usize,
}

pub fn max_slot_count(body_len: usize, key_size: usize, record_size: usize) -> usize {
    (body_len - NODE_HEADER_SIZE) / (key_size + 1 + record_size)
}

impl<'a, K: KeyList> PaxNode<'a, K> {
    pub fn new(body: &'a [u8], keys: K, record_size: usize) -> Self {
        let max_count = max_slot_count(body.len(), keys.key_size(), record_size);
        Self {
            body,
            keys,
            record_size,
            max_count,
        }
    }

    fn header(&self) -> &NodeHeader {
        NodeHeader::ref_from_bytes(&self.body[..NODE_HEADER_SIZE])
            .expect("node body shorter than its header")
    }

    pub fn count(&self) -> usize {
        self.header().count() as usize
    }

    pub fn is_leaf(&self) -> bool {
        self.header().flags() & LEAF_FLAG != 0
    }

    pub fn ptr_down(&self) -> u64 {
        self.header().ptr_down()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.max_count
    }

    fn keys_start(&self) -> usize {
        NODE_HEADER_SIZE
    }

    fn flags_start(&self) -> usize {
        NODE_HEADER_SIZE + self.max_count * self.keys.key_size()
    }

    fn records_start(&self) -> usize {
        self.flags_start() + self.max_count
    }

    pub fn key_at(&self, slot: usize) -> &'a [u8] {
        debug_assert!(slot < self.count());
        let start = self.keys_start();
        let width = self.keys.key_size();
        &self.body[start + slot * width..start + (slot + 1) * width]
    }

    pub fn slot_flags(&self, slot: usize) -> u8 {
        debug_assert!(slot < self.count());
        self.body[self.flags_start() + slot]
    }

    pub fn record_slot(&self, slot: usize) -> &'a [u8] {
        debug_assert!(slot < self.count());
        let start = self.records_start();
        let size = self.record_size;
        &self.body[start + slot * size..start + (slot + 1) * size]
    }

    /// Binary search with linear fallback for small windows.
    pub fn search(&self, key: &[u8], cmp: CompareFn) -> NodeSearch {
        let count = self.count();
        let threshold = self.keys.linear_threshold();
        let keys_start = self.keys_start();
        let width = self.keys.key_size();
        let key_at = |slot: usize| &self.body[keys_start + slot * width..keys_start + (slot + 1) * width];

        let mut l = 0usize;
        let mut r = count;
        while r - l > threshold {
            let mid = (l + r) / 2;
            if cmp(key, key_at(mid)) == Ordering::Less {
                r = mid;
            } else {
                l = mid + 1;
            }
        }
        let mut upper = r;
        for i in l..r {
            if cmp(key, key_at(i)) == Ordering::Less {
                upper = i;
                break;
            }
        }

        if upper == 0 {
            return NodeSearch {
                slot: -1,
                exact: false,
            };
        }
        let slot = upper - 1;
        NodeSearch {
            slot: slot as i32,
            exact: cmp(key, key_at(slot)) == Ordering::Equal,
        }
    }

    pub fn find_exact(&self, key: &[u8], cmp: CompareFn) -> Option<usize> {
        let found = self.search(key, cmp);
        found.exact.then_some(found.slot as usize)
    }
}

impl<'a, K: KeyList> PaxNodeMut<'a, K> {
    pub fn new(body: &'a mut [u8], keys: K, record_size: usize) -> Self {
        let max_count = max_slot_count(body.len(), keys.key_size(), record_size);
        Self {
            body,
            keys,
            record_size,
            max_count,
        }
    }

    /// Initializes an empty node over a fresh body.
    pub fn init(body: &'a mut [u8], keys: K, record_size: usize, leaf: bool) -> Self {
        body[..NODE_HEADER_SIZE].fill(0);
        let mut node = Self::new(body, keys, record_size);
        node.header_mut()
            .set_flags(if leaf { LEAF_FLAG } else { 0 });
        node
    }

    pub fn as_ref(&self) -> PaxNode<'_, K> {
        PaxNode::new(&self.body[..], self.keys, self.record_size)
    }

    fn header_mut(&mut self) -> &mut NodeHeader {
        NodeHeader::mut_from_bytes(&mut self.body[..NODE_HEADER_SIZE])
            .expect("node body shorter than its header")
    }

    pub fn count(&self) -> usize {
        self.as_ref().count()
    }

    pub fn is_leaf(&self) -> bool {
        self.as_ref().is_leaf()
    }

    pub fn is_full(&self) -> bool {
        self.as_ref().is_full()
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn ptr_down(&self) -> u64 {
        self.as_ref().ptr_down()
    }

    pub fn set_ptr_down(&mut self, id: u64) {
        self.header_mut().set_ptr_down(id);
    }

    fn set_count(&mut self, count: usize) {
        self.header_mut().set_count(count as u32);
    }

    pub fn search(&self, key: &[u8], cmp: CompareFn) -> NodeSearch {
        self.as_ref().search(key, cmp)
    }

    pub fn find_exact(&self, key: &[u8], cmp: CompareFn) -> Option<usize> {
        self.as_ref().find_exact(key, cmp)
    }

    fn keys_start(&self) -> usize {
        NODE_HEADER_SIZE
    }

    fn flags_start(&self) -> usize {
        NODE_HEADER_SIZE + self.max_count * self.keys.key_size()
    }

    fn records_start(&self) -> usize {
        self.flags_start() + self.max_count
    }

    pub fn key_at(&self, slot: usize) -> &[u8] {
        let start = self.keys_start();
        let width = self.keys.key_size();
        &self.body[start + slot * width..start + (slot + 1) * width]
    }

    pub fn slot_flags(&self, slot: usize) -> u8 {
        self.body[self.flags_start() + slot]
    }

    pub fn set_slot_flags(&mut self, slot: usize, flags: u8) {
        let start = self.flags_start();
        self.body[start + slot] = flags;
    }

    pub fn record_slot(&self, slot: usize) -> &[u8] {
        let start = self.records_start();
        let size = self.record_size;
        &self.body[start + slot * size..start + (slot + 1) * size]
    }

    /// Overwrites a key in place. Only valid when the replacement keeps
    /// the node's ordering (separator upkeep after sibling shifts).
    pub fn set_key_at(&mut self, slot: usize, key: &[u8]) {
        let width = self.keys.key_size();
        let start = self.keys_start();
        let keys = &mut self.body[start..start + self.max_count * width];
        self.keys.set_key(keys, slot, key);
    }

    pub fn record_slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = self.records_start();
        let size = self.record_size;
        &mut self.body[start + slot * size..start + (slot + 1) * size]
    }

    /// Opens a slot at `slot` and writes the key. Flags and the record
    /// field are zeroed; the caller fills them in.
    pub fn insert_slot(&mut self, slot: usize, key: &[u8]) {
        let count = self.count();
        debug_assert!(slot <= count);
        debug_assert!(count < self.max_count, "insert into a full node");

        let width = self.keys.key_size();
        let ks = self.keys_start();
        let fs = self.flags_start();
        let rs = self.records_start();
        let size = self.record_size;

        if slot < count {
            self.body
                .copy_within(ks + slot * width..ks + count * width, ks + (slot + 1) * width);
            self.body.copy_within(fs + slot..fs + count, fs + slot + 1);
            self.body
                .copy_within(rs + slot * size..rs + count * size, rs + (slot + 1) * size);
        }

        {
            let keys = &mut self.body[ks..ks + self.max_count * width];
            self.keys.set_key(keys, slot, key);
        }
        self.body[fs + slot] = 0;
        self.body[rs + slot * size..rs + (slot + 1) * size].fill(0);
        self.set_count(count + 1);
    }

    /// Removes a slot with the inverse shift.
    pub fn erase_slot(&mut self, slot: usize) {
        let count = self.count();
        debug_assert!(slot < count);

        let width = self.keys.key_size();
        let ks = self.keys_start();
        let fs = self.flags_start();
        let rs = self.records_start();
        let size = self.record_size;

        if slot + 1 < count {
            self.body
                .copy_within(ks + (slot + 1) * width..ks + count * width, ks + slot * width);
            self.body.copy_within(fs + slot + 1..fs + count, fs + slot);
            self.body
                .copy_within(rs + (slot + 1) * size..rs + count * size, rs + slot * size);
        }
        self.set_count(count - 1);
    }

    /// Moves the upper part of this node into the empty `other`. For a
    /// leaf the pivot slot moves across (its key also becomes the
    /// separator); for an internal node the pivot is consumed: its record
    /// becomes `other`'s `ptr_down` and its key only goes to the parent.
    pub fn split_into(&mut self, other: &mut PaxNodeMut<'_, K>, pivot: usize) {
        debug_assert_eq!(other.count(), 0);
        let count = self.count();
        let start = if self.is_leaf() { pivot } else { pivot + 1 };
        let moved = count - start;

        for i in 0..moved {
            let key = self.key_at(start + i).to_vec();
            other.insert_slot(i, &key);
            other.set_slot_flags(i, self.slot_flags(start + i));
            let record = self.record_slot(start + i).to_vec();
            other.record_slot_mut(i).copy_from_slice(&record);
        }
        if !self.is_leaf() {
            other.set_ptr_down(crate::btree::records::record_id(self.record_slot(pivot)));
        }
        self.set_count(pivot);
    }

    /// Appends all of `other`'s slots to this node.
    pub fn merge_from(&mut self, other: &mut PaxNodeMut<'_, K>) {
        let count = self.count();
        let moved = other.count();
        debug_assert!(count + moved <= self.max_count);

        for i in 0..moved {
            let key = other.key_at(i).to_vec();
            self.insert_slot(count + i, &key);
            self.set_slot_flags(count + i, other.slot_flags(i));
            let record = other.record_slot(i).to_vec();
            self.record_slot_mut(count + i).copy_from_slice(&record);
        }
        other.set_count(0);
    }

    /// Moves the first `n` slots of the right sibling onto this node's
    /// end.
    pub fn shift_from_right(&mut self, other: &mut PaxNodeMut<'_, K>, n: usize) {
        let count = self.count();
        debug_assert!(n <= other.count());
        debug_assert!(count + n <= self.max_count);

        for i in 0..n {
            let key = other.key_at(i).to_vec();
            self.insert_slot(count + i, &key);
            self.set_slot_flags(count + i, other.slot_flags(i));
            let record = other.record_slot(i).to_vec();
            self.record_slot_mut(count + i).copy_from_slice(&record);
        }
        for _ in 0..n {
            other.erase_slot(0);
        }
    }

    /// Moves this node's last `n` slots to the front of the right sibling.
    pub fn shift_to_right(&mut self, other: &mut PaxNodeMut<'_, K>, n: usize) {
        let count = self.count();
        debug_assert!(n <= count);
        debug_assert!(other.count() + n <= other.max_count);

        for i in 0..n {
            let src = count - n + i;
            let key = self.key_at(src).to_vec();
            other.insert_slot(i, &key);
            other.set_slot_flags(i, self.slot_flags(src));
            let record = self.record_slot(src).to_vec();
            other.record_slot_mut(i).copy_from_slice(&record);
        }
        self.set_count(count - n);
    }
}
