//! # B-Tree
//!
//! Disk-resident ordered map over PAX nodes. One `Btree` instance serves
//! one database: it knows the root page, the key layout, the leaf record
//! layout, and the comparator. All keys passing through here are already
//! normalized to the layout width.
//!
//! ## Descent and splits
//!
//! Operations descend from the root collecting the page path, then work on
//! the leaf. A full leaf splits at `count / 2`; the separator propagates
//! up the recorded path, splitting internal nodes as needed, and a root
//! split grows the tree by one level. Leaves stay linked through the
//! persistent header's `next`/`prev` for sibling scans.
//!
//! ## Erase and merges
//!
//! A leaf that drops to [`MERGE_THRESHOLD`] slots is merged into a sibling
//! when the combined count fits, otherwise slots are shifted over from the
//! right sibling to re-balance. Emptied non-root nodes are detached from
//! their parent and freed; an internal root with no separators collapses
//! into its only child.
//!
//! ## Locking discipline
//!
//! Pages are dirtied through [`Pager::mark_dirty`] *before* their write
//! guard is taken (the pager briefly locks the page itself), and guards
//! are dropped before a page is handed to [`Pager::free`].

use std::cmp::Ordering;

use smallvec::SmallVec;
use tracing::trace;

use crate::btree::blob::{alloc_blob, free_blob, read_blob};
use crate::btree::keys::{BinaryKeyList, CompareFn, KeyLayout, KeyList, PodKeyList};
use crate::btree::node::{PaxNode, PaxNodeMut};
use crate::btree::records::{self, RecordLayout};
use crate::config::MERGE_THRESHOLD;
use crate::error::{Error, Result};
use crate::storage::{PageHandle, PageId, PageKind, Pager};

/// Approximate-match bias for [`Btree::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekBias {
    Lt,
    Leq,
    Gt,
    Geq,
}

/// A cursor position inside the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef {
    pub page: PageId,
    pub slot: u32,
}

macro_rules! with_key_list {
    ($layout:expr, $keys:ident => $body:expr) => {
        match $layout {
            KeyLayout::U32 => {
                let $keys = PodKeyList::<u32>::default();
                $body
            }
            KeyLayout::U64 | KeyLayout::Recno => {
                let $keys = PodKeyList::<u64>::default();
                $body
            }
            KeyLayout::Binary(size) => {
                let $keys = BinaryKeyList::new(size as usize);
                $body
            }
        }
    };
}

pub struct Btree {
    root: PageId,
    layout: KeyLayout,
    record_layout: RecordLayout,
    cmp: CompareFn,
}

impl Btree {
    /// Attaches to an existing tree.
    pub fn new(root: PageId, layout: KeyLayout, record_layout: RecordLayout, cmp: CompareFn) -> Self {
        debug_assert!(record_layout != RecordLayout::Internal);
        Self {
            root,
            layout,
            record_layout,
            cmp,
        }
    }

    /// Creates an empty tree and returns it with its fresh root leaf.
    pub fn create(
        pager: &Pager,
        layout: KeyLayout,
        record_layout: RecordLayout,
        cmp: CompareFn,
    ) -> Result<Self> {
        let page = pager.alloc(PageKind::BtreeLeaf)?;
        let root = page.read().id();
        with_key_list!(layout, keys => {
            let mut guard = page.write();
            PaxNodeMut::init(guard.body_mut(), keys, record_layout.record_size(), true);
        });
        Ok(Self {
            root,
            layout,
            record_layout,
            cmp,
        })
    }

    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        (self.cmp)(lhs, rhs)
    }

    fn leaf_record_size(&self) -> usize {
        self.record_layout.record_size()
    }

    /// Exact lookup; returns the record.
    pub fn find(&self, pager: &Pager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        with_key_list!(self.layout, keys => self.find_impl(pager, keys, key))
    }

    fn find_impl<K: KeyList>(&self, pager: &Pager, keys: K, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (leaf_id, _) = self.locate_leaf(pager, keys, key)?;
        let handle = pager.fetch(leaf_id)?;
        let guard = handle.read();
        let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
        match node.find_exact(key, self.cmp) {
            Some(slot) => Ok(Some(self.read_record(pager, &node, slot)?)),
            None => Ok(None),
        }
    }

    /// Descends to the leaf a key belongs to, recording the internal path.
    fn descend<K: KeyList>(
        &self,
        pager: &Pager,
        keys: K,
        key: &[u8],
    ) -> Result<(PageId, SmallVec<[PageId; 8]>)> {
        let mut path = SmallVec::new();
        let mut current = self.root;
        loop {
            let handle = pager.fetch(current)?;
            let guard = handle.read();
            if guard.kind() == PageKind::BtreeLeaf {
                return Ok((current, path));
            }
            if guard.kind() != PageKind::BtreeInternal {
                return Err(Error::Internal("descent hit a non-btree page"));
            }
            let node = PaxNode::new(guard.body(), keys, 8);
            let found = node.search(key, self.cmp);
            let child = if found.slot < 0 {
                node.ptr_down()
            } else {
                records::record_id(node.record_slot(found.slot as usize))
            };
            path.push(current);
            current = child;
        }
    }

    fn locate_leaf<K: KeyList>(
        &self,
        pager: &Pager,
        keys: K,
        key: &[u8],
    ) -> Result<(PageId, SmallVec<[PageId; 8]>)> {
        self.descend(pager, keys, key)
    }

    fn dirty(pager: &Pager, handle: &PageHandle) {
        pager.mark_dirty(handle);
    }

    /// Inserts or overwrites a record.
    pub fn insert(
        &mut self,
        pager: &Pager,
        key: &[u8],
        record: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        if let RecordLayout::Inline(size) = self.record_layout {
            if record.len() != size as usize {
                return Err(Error::InvParameter("record does not match the fixed width"));
            }
        }
        with_key_list!(self.layout, keys => self.insert_impl(pager, keys, key, record, overwrite))
    }

    fn insert_impl<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        key: &[u8],
        record: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        let (leaf_id, mut path) = self.descend(pager, keys, key)?;
        let handle = pager.fetch(leaf_id)?;

        // fast paths: overwrite in place, or plain insert into a leaf with
        // room
        {
            Self::dirty(pager, &handle);
            let mut guard = handle.write();
            let record_size = self.leaf_record_size();
            let mut node = PaxNodeMut::new(guard.body_mut(), keys, record_size);
            let found = node.search(key, self.cmp);
            if found.exact {
                if !overwrite {
                    return Err(Error::DuplicateKey);
                }
                return self.write_record(pager, &mut node, found.slot as usize, record, true);
            }
            if !node.is_full() {
                let slot = (found.slot + 1) as usize;
                node.insert_slot(slot, key);
                return self.write_record(pager, &mut node, slot, record, false);
            }
        }

        // the leaf is full: split it, place the key, then propagate the
        // separator up the recorded path
        let (mut separator, mut new_id) = self.split_leaf(pager, keys, &handle, key, record)?;

        while let Some(parent_id) = path.pop() {
            let parent = pager.fetch(parent_id)?;
            Self::dirty(pager, &parent);
            {
                let mut guard = parent.write();
                let mut node = PaxNodeMut::new(guard.body_mut(), keys, 8);
                if !node.is_full() {
                    let found = node.search(&separator, self.cmp);
                    let slot = (found.slot + 1) as usize;
                    node.insert_slot(slot, &separator);
                    records::set_record_id(node.record_slot_mut(slot), new_id);
                    return Ok(());
                }
            }
            let (sep, id) = self.split_internal(pager, keys, &parent, &separator, new_id)?;
            separator = sep;
            new_id = id;
        }

        // the split reached the root: grow the tree by one level
        let old_root = self.root;
        let new_root = pager.alloc(PageKind::BtreeInternal)?;
        let new_root_id = new_root.read().id();
        {
            let mut guard = new_root.write();
            let mut node = PaxNodeMut::init(guard.body_mut(), keys, 8, false);
            node.set_ptr_down(old_root);
            node.insert_slot(0, &separator);
            records::set_record_id(node.record_slot_mut(0), new_id);
        }
        self.root = new_root_id;
        trace!(root = new_root_id, "btree grew a level");
        Ok(())
    }

    /// Splits a full leaf and inserts the pending key into the proper
    /// half. Returns the separator and the new page id.
    fn split_leaf<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        left: &PageHandle,
        key: &[u8],
        record: &[u8],
    ) -> Result<(Vec<u8>, PageId)> {
        let right = pager.alloc(PageKind::BtreeLeaf)?;
        let right_id = right.read().id();
        let record_size = self.leaf_record_size();

        Self::dirty(pager, left);
        let separator;
        let old_next;
        {
            let mut left_guard = left.write();
            let mut right_guard = right.write();

            let left_id = left_guard.id();
            old_next = left_guard.next_page_id();
            right_guard.set_next_page_id(old_next);
            right_guard.set_prev_page_id(left_id);
            left_guard.set_next_page_id(right_id);

            let mut left_node = PaxNodeMut::new(left_guard.body_mut(), keys, record_size);
            let mut right_node =
                PaxNodeMut::init(right_guard.body_mut(), keys, record_size, true);
            let pivot = left_node.count() / 2;
            separator = left_node.key_at(pivot).to_vec();
            left_node.split_into(&mut right_node, pivot);

            let mut target = if (self.cmp)(key, &separator) == Ordering::Less {
                left_node
            } else {
                right_node
            };
            let found = target.search(key, self.cmp);
            let slot = (found.slot + 1) as usize;
            target.insert_slot(slot, key);
            self.write_record(pager, &mut target, slot, record, false)?;
        }

        if old_next != 0 {
            let next = pager.fetch(old_next)?;
            Self::dirty(pager, &next);
            next.write().set_prev_page_id(right_id);
        }
        Ok((separator, right_id))
    }

    /// Splits a full internal node, inserting the pending separator into
    /// the proper half. Returns the promoted separator and new page id.
    fn split_internal<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        left: &PageHandle,
        pending_sep: &[u8],
        pending_child: PageId,
    ) -> Result<(Vec<u8>, PageId)> {
        let right = pager.alloc(PageKind::BtreeInternal)?;
        let right_id = right.read().id();

        Self::dirty(pager, left);
        let mut left_guard = left.write();
        let mut right_guard = right.write();
        let mut left_node = PaxNodeMut::new(left_guard.body_mut(), keys, 8);
        let mut right_node = PaxNodeMut::init(right_guard.body_mut(), keys, 8, false);

        let pivot = left_node.count() / 2;
        let promoted = left_node.key_at(pivot).to_vec();
        left_node.split_into(&mut right_node, pivot);

        let mut target = if (self.cmp)(pending_sep, &promoted) == Ordering::Less {
            left_node
        } else {
            right_node
        };
        let found = target.search(pending_sep, self.cmp);
        let slot = (found.slot + 1) as usize;
        target.insert_slot(slot, pending_sep);
        records::set_record_id(target.record_slot_mut(slot), pending_child);

        Ok((promoted, right_id))
    }

    fn write_record<K: KeyList>(
        &self,
        pager: &Pager,
        node: &mut PaxNodeMut<'_, K>,
        slot: usize,
        record: &[u8],
        overwriting: bool,
    ) -> Result<()> {
        match self.record_layout {
            RecordLayout::Inline(_) => {
                node.record_slot_mut(slot).copy_from_slice(record);
                Ok(())
            }
            RecordLayout::Default => {
                let flags = node.slot_flags(slot);
                if overwriting && !records::is_record_inline(flags) {
                    let old_id = records::record_id(node.record_slot(slot));
                    if old_id != 0 {
                        free_blob(pager, old_id)?;
                    }
                }
                if record.len() <= 8 {
                    let new_flags =
                        records::set_inline_record(node.record_slot_mut(slot), flags, record)?;
                    node.set_slot_flags(slot, new_flags);
                } else {
                    let blob_id = alloc_blob(pager, record)?;
                    records::set_record_id(node.record_slot_mut(slot), blob_id);
                    node.set_slot_flags(slot, records::clear_inline_flags(flags));
                }
                Ok(())
            }
            RecordLayout::Internal => Err(Error::Internal("leaf write through internal layout")),
        }
    }

    fn read_record<K: KeyList>(
        &self,
        pager: &Pager,
        node: &PaxNode<'_, K>,
        slot: usize,
    ) -> Result<Vec<u8>> {
        match self.record_layout {
            RecordLayout::Inline(_) => Ok(node.record_slot(slot).to_vec()),
            RecordLayout::Default => {
                let flags = node.slot_flags(slot);
                if records::is_record_inline(flags) {
                    Ok(records::inline_record(node.record_slot(slot), flags).to_vec())
                } else {
                    read_blob(pager, records::record_id(node.record_slot(slot)))
                }
            }
            RecordLayout::Internal => Err(Error::Internal("leaf read through internal layout")),
        }
    }

    /// Erases a key; `KeyNotFound` if absent.
    pub fn erase(&mut self, pager: &Pager, key: &[u8]) -> Result<()> {
        with_key_list!(self.layout, keys => self.erase_impl(pager, keys, key))
    }

    fn erase_impl<K: KeyList>(&mut self, pager: &Pager, keys: K, key: &[u8]) -> Result<()> {
        let (leaf_id, path) = self.descend(pager, keys, key)?;
        let handle = pager.fetch(leaf_id)?;

        let needs_rebalance = {
            Self::dirty(pager, &handle);
            let mut guard = handle.write();
            let record_size = self.leaf_record_size();
            let mut node = PaxNodeMut::new(guard.body_mut(), keys, record_size);
            let slot = match node.find_exact(key, self.cmp) {
                Some(slot) => slot,
                None => return Err(Error::KeyNotFound),
            };
            if self.record_layout == RecordLayout::Default {
                let flags = node.slot_flags(slot);
                if !records::is_record_inline(flags) {
                    let blob_id = records::record_id(node.record_slot(slot));
                    if blob_id != 0 {
                        free_blob(pager, blob_id)?;
                    }
                }
            }
            node.erase_slot(slot);
            node.count() <= MERGE_THRESHOLD
        };

        if needs_rebalance {
            self.rebalance(pager, keys, leaf_id, path)?;
        }
        Ok(())
    }

    /// Re-establishes the shape invariants after an erase: merge or
    /// re-balance an underfull leaf, detach emptied nodes, collapse a
    /// childless internal root.
    fn rebalance<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        leaf_id: PageId,
        mut path: SmallVec<[PageId; 8]>,
    ) -> Result<()> {
        let parent_id = match path.pop() {
            // an underfull root leaf is fine, even empty
            None => return Ok(()),
            Some(id) => id,
        };

        self.merge_or_shift_leaf(pager, keys, leaf_id, parent_id)?;

        // walk the remaining path pruning pass-through internals
        let mut child_id = parent_id;
        while let Some(grand_id) = path.pop() {
            let child = pager.fetch(child_id)?;
            let (count, down) = {
                let guard = child.read();
                let node = PaxNode::new(guard.body(), keys, 8);
                (node.count(), node.ptr_down())
            };
            if count > 0 {
                return Ok(());
            }
            // the internal node routes everything to ptr_down: point the
            // grandparent directly at that child and drop the node
            let grand = pager.fetch(grand_id)?;
            Self::dirty(pager, &grand);
            {
                let mut guard = grand.write();
                let mut node = PaxNodeMut::new(guard.body_mut(), keys, 8);
                if node.ptr_down() == child_id {
                    node.set_ptr_down(down);
                } else {
                    let count = node.count();
                    let mut replaced = false;
                    for slot in 0..count {
                        if records::record_id(node.record_slot(slot)) == child_id {
                            records::set_record_id(node.record_slot_mut(slot), down);
                            replaced = true;
                            break;
                        }
                    }
                    if !replaced {
                        return Err(Error::Internal("child missing from its parent"));
                    }
                }
            }
            pager.free(&child)?;
            child_id = grand_id;
        }

        // child_id is now the root
        if child_id == self.root {
            let root = pager.fetch(self.root)?;
            let collapse = {
                let guard = root.read();
                if guard.kind() == PageKind::BtreeInternal {
                    let node = PaxNode::new(guard.body(), keys, 8);
                    (node.count() == 0).then(|| node.ptr_down())
                } else {
                    None
                }
            };
            if let Some(down) = collapse {
                pager.free(&root)?;
                self.root = down;
                trace!(root = down, "btree shrank a level");
            }
        }
        Ok(())
    }

    /// Merges an underfull leaf with a sibling, or shifts slots over from
    /// the right sibling when a merge does not fit.
    fn merge_or_shift_leaf<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        leaf_id: PageId,
        parent_id: PageId,
    ) -> Result<()> {
        let record_size = self.leaf_record_size();
        let leaf = pager.fetch(leaf_id)?;
        let (count, next_id, prev_id) = {
            let guard = leaf.read();
            let node = PaxNode::new(guard.body(), keys, record_size);
            (node.count(), guard.next_page_id(), guard.prev_page_id())
        };

        // prefer merging into the left sibling so cursors scanning forward
        // keep their direction; fall back to pulling from the right
        if prev_id != 0 && self.leaf_parent_is(pager, keys, parent_id, prev_id)? {
            let prev = pager.fetch(prev_id)?;
            let prev_count = {
                let guard = prev.read();
                PaxNode::new(guard.body(), keys, record_size).count()
            };
            let max = {
                let guard = leaf.read();
                PaxNode::new(guard.body(), keys, record_size).max_count()
            };
            if prev_count + count <= max {
                return self.merge_leaf_right_into_left(pager, keys, parent_id, prev_id, leaf_id);
            }
        }
        if next_id != 0 && self.leaf_parent_is(pager, keys, parent_id, next_id)? {
            let next = pager.fetch(next_id)?;
            let next_count = {
                let guard = next.read();
                PaxNode::new(guard.body(), keys, record_size).count()
            };
            let max = {
                let guard = leaf.read();
                PaxNode::new(guard.body(), keys, record_size).max_count()
            };
            if count + next_count <= max {
                return self.merge_leaf_right_into_left(pager, keys, parent_id, leaf_id, next_id);
            }
            // the right sibling is too full to merge: pull slots across
            let moved = (next_count - count) / 2;
            if moved > 0 {
                Self::dirty(pager, &leaf);
                Self::dirty(pager, &next);
                let mut leaf_guard = leaf.write();
                let mut next_guard = next.write();
                let mut left = PaxNodeMut::new(leaf_guard.body_mut(), keys, record_size);
                let mut right = PaxNodeMut::new(next_guard.body_mut(), keys, record_size);
                left.shift_from_right(&mut right, moved);
                let new_first = right.key_at(0).to_vec();
                drop(left);
                drop(right);
                drop(leaf_guard);
                drop(next_guard);
                self.replace_separator(pager, keys, parent_id, next_id, &new_first)?;
            }
        }
        Ok(())
    }

    /// True when `parent_id` is the direct parent of `child_id`; merges
    /// only happen between siblings under one parent so separator upkeep
    /// stays local.
    fn leaf_parent_is<K: KeyList>(
        &self,
        pager: &Pager,
        keys: K,
        parent_id: PageId,
        child_id: PageId,
    ) -> Result<bool> {
        let parent = pager.fetch(parent_id)?;
        let guard = parent.read();
        let node = PaxNode::new(guard.body(), keys, 8);
        if node.ptr_down() == child_id {
            return Ok(true);
        }
        for slot in 0..node.count() {
            if records::record_id(node.record_slot(slot)) == child_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn merge_leaf_right_into_left<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        parent_id: PageId,
        left_id: PageId,
        right_id: PageId,
    ) -> Result<()> {
        let record_size = self.leaf_record_size();
        let left = pager.fetch(left_id)?;
        let right = pager.fetch(right_id)?;

        Self::dirty(pager, &left);
        let right_next = {
            let mut left_guard = left.write();
            let mut right_guard = right.write();
            let right_next = right_guard.next_page_id();
            let mut left_node = PaxNodeMut::new(left_guard.body_mut(), keys, record_size);
            let mut right_node = PaxNodeMut::new(right_guard.body_mut(), keys, record_size);
            left_node.merge_from(&mut right_node);
            left_guard.set_next_page_id(right_next);
            right_next
        };
        if right_next != 0 {
            let next = pager.fetch(right_next)?;
            Self::dirty(pager, &next);
            next.write().set_prev_page_id(left_id);
        }

        // drop the separator that routed to the right leaf
        let parent = pager.fetch(parent_id)?;
        Self::dirty(pager, &parent);
        {
            let mut guard = parent.write();
            let mut node = PaxNodeMut::new(guard.body_mut(), keys, 8);
            let count = node.count();
            let mut removed = false;
            for slot in 0..count {
                if records::record_id(node.record_slot(slot)) == right_id {
                    node.erase_slot(slot);
                    removed = true;
                    break;
                }
            }
            if !removed {
                return Err(Error::Internal("merged leaf missing from its parent"));
            }
        }
        pager.free(&right)?;
        trace!(left = left_id, right = right_id, "merged btree leaves");
        Ok(())
    }

    fn replace_separator<K: KeyList>(
        &mut self,
        pager: &Pager,
        keys: K,
        parent_id: PageId,
        child_id: PageId,
        new_key: &[u8],
    ) -> Result<()> {
        let parent = pager.fetch(parent_id)?;
        Self::dirty(pager, &parent);
        let mut guard = parent.write();
        let mut node = PaxNodeMut::new(guard.body_mut(), keys, 8);
        for slot in 0..node.count() {
            if records::record_id(node.record_slot(slot)) == child_id {
                node.set_key_at(slot, new_key);
                return Ok(());
            }
        }
        Err(Error::Internal("separator to replace not found"))
    }

    /// Locates the slot holding the key, for cursor coupling.
    pub fn locate(&self, pager: &Pager, key: &[u8]) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => {
            let (leaf_id, _) = self.locate_leaf(pager, keys, key)?;
            let handle = pager.fetch(leaf_id)?;
            let guard = handle.read();
            let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
            Ok(node.find_exact(key, self.cmp).map(|slot| SlotRef {
                page: leaf_id,
                slot: slot as u32,
            }))
        })
    }

    /// Approximate seek: the nearest slot strictly/inclusively below or
    /// above `key` per `bias`.
    pub fn seek(&self, pager: &Pager, key: &[u8], bias: SeekBias) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => self.seek_impl(pager, keys, key, bias))
    }

    fn seek_impl<K: KeyList>(
        &self,
        pager: &Pager,
        keys: K,
        key: &[u8],
        bias: SeekBias,
    ) -> Result<Option<SlotRef>> {
        let (leaf_id, _) = self.locate_leaf(pager, keys, key)?;
        let handle = pager.fetch(leaf_id)?;
        let guard = handle.read();
        let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
        let found = node.search(key, self.cmp);

        let slot: i64 = match bias {
            SeekBias::Lt => {
                if found.exact {
                    found.slot as i64 - 1
                } else {
                    found.slot as i64
                }
            }
            SeekBias::Leq => found.slot as i64,
            SeekBias::Gt => found.slot as i64 + 1,
            SeekBias::Geq => {
                if found.exact {
                    found.slot as i64
                } else {
                    found.slot as i64 + 1
                }
            }
        };

        if slot < 0 {
            drop(guard);
            return self.step_leaf_back(pager, leaf_id);
        }
        if slot as usize >= node.count() {
            let next = guard.next_page_id();
            drop(guard);
            return self.first_in_chain(pager, next);
        }
        Ok(Some(SlotRef {
            page: leaf_id,
            slot: slot as u32,
        }))
    }

    fn step_leaf_back(&self, pager: &Pager, leaf_id: PageId) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => {
            let handle = pager.fetch(leaf_id)?;
            let prev = handle.read().prev_page_id();
            if prev == 0 {
                return Ok(None);
            }
            let prev_handle = pager.fetch(prev)?;
            let guard = prev_handle.read();
            let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
            match node.count() {
                0 => Ok(None),
                count => Ok(Some(SlotRef {
                    page: prev,
                    slot: (count - 1) as u32,
                })),
            }
        })
    }

    fn first_in_chain(&self, pager: &Pager, mut leaf_id: PageId) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => {
            while leaf_id != 0 {
                let handle = pager.fetch(leaf_id)?;
                let guard = handle.read();
                let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
                if node.count() > 0 {
                    return Ok(Some(SlotRef {
                        page: leaf_id,
                        slot: 0,
                    }));
                }
                leaf_id = guard.next_page_id();
            }
            Ok(None)
        })
    }

    /// The first slot in key order.
    pub fn first(&self, pager: &Pager) -> Result<Option<SlotRef>> {
        let leaf = self.leftmost_leaf(pager)?;
        self.first_in_chain(pager, leaf)
    }

    /// The last slot in key order.
    pub fn last(&self, pager: &Pager) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => {
            let mut current = self.root;
            loop {
                let handle = pager.fetch(current)?;
                let guard = handle.read();
                if guard.kind() == PageKind::BtreeLeaf {
                    let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
                    return match node.count() {
                        0 => {
                            let prev = guard.prev_page_id();
                            drop(guard);
                            if prev == 0 {
                                Ok(None)
                            } else {
                                self.last_in_chain_back(pager, prev)
                            }
                        }
                        count => Ok(Some(SlotRef {
                            page: current,
                            slot: (count - 1) as u32,
                        })),
                    };
                }
                let node = PaxNode::new(guard.body(), keys, 8);
                current = match node.count() {
                    0 => node.ptr_down(),
                    count => records::record_id(node.record_slot(count - 1)),
                };
            }
        })
    }

    fn last_in_chain_back(&self, pager: &Pager, mut leaf_id: PageId) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => {
            while leaf_id != 0 {
                let handle = pager.fetch(leaf_id)?;
                let guard = handle.read();
                let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
                if node.count() > 0 {
                    return Ok(Some(SlotRef {
                        page: leaf_id,
                        slot: (node.count() - 1) as u32,
                    }));
                }
                leaf_id = guard.prev_page_id();
            }
            Ok(None)
        })
    }

    fn leftmost_leaf(&self, pager: &Pager) -> Result<PageId> {
        with_key_list!(self.layout, keys => {
            let mut current = self.root;
            loop {
                let handle = pager.fetch(current)?;
                let guard = handle.read();
                if guard.kind() == PageKind::BtreeLeaf {
                    return Ok(current);
                }
                let node = PaxNode::new(guard.body(), keys, 8);
                current = node.ptr_down();
            }
        })
    }

    /// Steps a position forward along the leaf chain.
    pub fn next_pos(&self, pager: &Pager, pos: SlotRef) -> Result<Option<SlotRef>> {
        with_key_list!(self.layout, keys => {
            let handle = pager.fetch(pos.page)?;
            let guard = handle.read();
            let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
            if (pos.slot as usize + 1) < node.count() {
                return Ok(Some(SlotRef {
                    page: pos.page,
                    slot: pos.slot + 1,
                }));
            }
            let next = guard.next_page_id();
            drop(guard);
            self.first_in_chain(pager, next)
        })
    }

    /// Steps a position backward along the leaf chain.
    pub fn prev_pos(&self, pager: &Pager, pos: SlotRef) -> Result<Option<SlotRef>> {
        if pos.slot > 0 {
            return Ok(Some(SlotRef {
                page: pos.page,
                slot: pos.slot - 1,
            }));
        }
        self.step_leaf_back(pager, pos.page)
    }

    /// Reads the key and record at a position. Returns `None` if the
    /// position went stale (page shrank or left the tree).
    pub fn read_pos(&self, pager: &Pager, pos: SlotRef) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        with_key_list!(self.layout, keys => {
            let handle = pager.fetch(pos.page)?;
            let guard = handle.read();
            if guard.kind() != PageKind::BtreeLeaf {
                return Ok(None);
            }
            let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
            if pos.slot as usize >= node.count() {
                return Ok(None);
            }
            let key = node.key_at(pos.slot as usize).to_vec();
            let record = self.read_record(pager, &node, pos.slot as usize)?;
            Ok(Some((key, record)))
        })
    }

    /// Number of keys in the tree.
    pub fn key_count(&self, pager: &Pager) -> Result<u64> {
        with_key_list!(self.layout, keys => {
            let mut total = 0u64;
            let mut leaf_id = self.leftmost_leaf(pager)?;
            while leaf_id != 0 {
                let handle = pager.fetch(leaf_id)?;
                let guard = handle.read();
                let node = PaxNode::new(guard.body(), keys, self.leaf_record_size());
                total += node.count() as u64;
                leaf_id = guard.next_page_id();
            }
            Ok(total)
        })
    }

    /// Frees every page of the tree (and every blob it references) back
    /// to the freelist. The tree is unusable afterwards.
    pub fn free_all(&self, pager: &Pager) -> Result<()> {
        with_key_list!(self.layout, keys => {
            let mut stack = vec![self.root];
            while let Some(page_id) = stack.pop() {
                let handle = pager.fetch(page_id)?;
                let mut blobs = Vec::new();
                {
                    let guard = handle.read();
                    match guard.kind() {
                        PageKind::BtreeInternal => {
                            let node = PaxNode::new(guard.body(), keys, 8);
                            stack.push(node.ptr_down());
                            for slot in 0..node.count() {
                                stack.push(records::record_id(node.record_slot(slot)));
                            }
                        }
                        PageKind::BtreeLeaf => {
                            if self.record_layout == RecordLayout::Default {
                                let node =
                                    PaxNode::new(guard.body(), keys, self.leaf_record_size());
                                for slot in 0..node.count() {
                                    let flags = node.slot_flags(slot);
                                    if !records::is_record_inline(flags) {
                                        let blob = records::record_id(node.record_slot(slot));
                                        if blob != 0 {
                                            blobs.push(blob);
                                        }
                                    }
                                }
                            }
                        }
                        _ => return Err(Error::Internal("non-btree page inside the tree")),
                    }
                }
                for blob in blobs {
                    free_blob(pager, blob)?;
                }
                pager.free(&handle)?;
            }
            Ok(())
        })
    }

    /// Verifies the structural invariants: strictly ascending keys, key
    /// ranges nested by the separators, uniform leaf depth, and a sibling
    /// chain that matches the in-order leaf sequence.
    pub fn check_integrity(&self, pager: &Pager) -> Result<()> {
        with_key_list!(self.layout, keys => {
            let mut leaf_depth = None;
            let mut prev_leaf: PageId = 0;
            self.check_node(pager, keys, self.root, 0, None, None, &mut leaf_depth, &mut prev_leaf)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn check_node<K: KeyList>(
        &self,
        pager: &Pager,
        keys: K,
        page_id: PageId,
        depth: usize,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaf_depth: &mut Option<usize>,
        prev_leaf: &mut PageId,
    ) -> Result<()> {
        let handle = pager.fetch(page_id)?;
        let guard = handle.read();
        let is_leaf = match guard.kind() {
            PageKind::BtreeLeaf => true,
            PageKind::BtreeInternal => false,
            _ => return Err(Error::Internal("non-btree page inside the tree")),
        };
        let record_size = if is_leaf { self.leaf_record_size() } else { 8 };
        let node = PaxNode::new(guard.body(), keys, record_size);

        if node.is_leaf() != is_leaf {
            return Err(Error::Internal("node header disagrees with page kind"));
        }
        if node.count() > node.max_count() {
            return Err(Error::Internal("node count exceeds its capacity"));
        }
        for slot in 0..node.count() {
            let key = node.key_at(slot);
            if slot > 0 && (self.cmp)(node.key_at(slot - 1), key) != Ordering::Less {
                return Err(Error::Internal("keys not strictly ascending"));
            }
            if let Some(lower) = lower {
                if (self.cmp)(key, lower) == Ordering::Less {
                    return Err(Error::Internal("key below its subtree bound"));
                }
            }
            if let Some(upper) = upper {
                if (self.cmp)(key, upper) != Ordering::Less {
                    return Err(Error::Internal("key above its subtree bound"));
                }
            }
        }

        if is_leaf {
            match leaf_depth {
                Some(expected) if *expected != depth => {
                    return Err(Error::Internal("leaves at uneven depth"))
                }
                None => *leaf_depth = Some(depth),
                _ => {}
            }
            if guard.prev_page_id() != *prev_leaf {
                return Err(Error::Internal("leaf prev link out of order"));
            }
            if *prev_leaf != 0 {
                let prev = pager.fetch(*prev_leaf)?;
                if prev.read().next_page_id() != page_id {
                    return Err(Error::Internal("leaf next link out of order"));
                }
            }
            *prev_leaf = page_id;
            return Ok(());
        }

        // internal: recurse with nested bounds
        let children: Vec<(PageId, Option<Vec<u8>>, Option<Vec<u8>>)> = {
            let mut children = Vec::with_capacity(node.count() + 1);
            let first_upper = if node.count() > 0 {
                Some(node.key_at(0).to_vec())
            } else {
                None
            };
            children.push((node.ptr_down(), lower.map(|k| k.to_vec()), first_upper));
            for slot in 0..node.count() {
                let child = records::record_id(node.record_slot(slot));
                let low = Some(node.key_at(slot).to_vec());
                let up = if slot + 1 < node.count() {
                    Some(node.key_at(slot + 1).to_vec())
                } else {
                    upper.map(|k| k.to_vec())
                };
                children.push((child, low, up));
            }
            children
        };
        drop(guard);

        for (child, low, up) in children {
            if child == 0 {
                return Err(Error::Internal("internal node with a null child"));
            }
            self.check_node(
                pager,
                keys,
                child,
                depth + 1,
                low.as_deref(),
                up.as_deref(),
                leaf_depth,
                prev_leaf,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CACHE_UNLIMITED;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn test_pager() -> (tempfile::TempDir, Pager) {
        let dir = tempdir().unwrap();
        let pager = Pager::create(&dir.path().join("t.db"), 0o644, CACHE_UNLIMITED).unwrap();
        pager.alloc(PageKind::EnvHeader).unwrap();
        (dir, pager)
    }

    fn u64_tree(pager: &Pager) -> Btree {
        Btree::create(
            pager,
            KeyLayout::U64,
            RecordLayout::Default,
            KeyLayout::U64.default_compare(),
        )
        .unwrap()
    }

    #[test]
    fn insert_and_find_single_key() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        tree.insert(&pager, &7u64.to_le_bytes(), b"seven", false).unwrap();

        assert_eq!(
            tree.find(&pager, &7u64.to_le_bytes()).unwrap(),
            Some(b"seven".to_vec())
        );
        assert_eq!(tree.find(&pager, &8u64.to_le_bytes()).unwrap(), None);
    }

    #[test]
    fn duplicate_insert_needs_overwrite() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        let key = 1u64.to_le_bytes();
        tree.insert(&pager, &key, b"a", false).unwrap();

        let err = tree.insert(&pager, &key, b"b", false).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey));

        tree.insert(&pager, &key, b"b", true).unwrap();
        assert_eq!(tree.find(&pager, &key).unwrap(), Some(b"b".to_vec()));
        assert_eq!(tree.key_count(&pager).unwrap(), 1);
    }

    #[test]
    fn split_preserves_all_keys() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        // enough keys to force several leaf splits and a root split
        for i in 0..4000u64 {
            tree.insert(&pager, &i.to_le_bytes(), format!("v{i}").as_bytes(), false)
                .unwrap();
        }
        tree.check_integrity(&pager).unwrap();
        assert_eq!(tree.key_count(&pager).unwrap(), 4000);
        for i in (0..4000u64).step_by(97) {
            assert_eq!(
                tree.find(&pager, &i.to_le_bytes()).unwrap(),
                Some(format!("v{i}").into_bytes()),
                "key {i}"
            );
        }
    }

    #[test]
    fn reverse_insert_order_still_sorted() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        for i in (0..2000u64).rev() {
            tree.insert(&pager, &i.to_le_bytes(), b"x", false).unwrap();
        }
        tree.check_integrity(&pager).unwrap();

        // walk the leaf chain and confirm global ordering
        let mut pos = tree.first(&pager).unwrap();
        let mut expected = 0u64;
        while let Some(p) = pos {
            let (key, _) = tree.read_pos(&pager, p).unwrap().unwrap();
            assert_eq!(u64::from_le_bytes(key.try_into().unwrap()), expected);
            expected += 1;
            pos = tree.next_pos(&pager, p).unwrap();
        }
        assert_eq!(expected, 2000);
    }

    #[test]
    fn erase_and_merge_keeps_tree_valid() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        for i in 0..3000u64 {
            tree.insert(&pager, &i.to_le_bytes(), b"v", false).unwrap();
        }
        for i in 0..3000u64 {
            if i % 3 != 0 {
                tree.erase(&pager, &i.to_le_bytes()).unwrap();
            }
        }
        tree.check_integrity(&pager).unwrap();
        assert_eq!(tree.key_count(&pager).unwrap(), 1000);
        for i in 0..3000u64 {
            let found = tree.find(&pager, &i.to_le_bytes()).unwrap();
            assert_eq!(found.is_some(), i % 3 == 0, "key {i}");
        }
    }

    #[test]
    fn erase_everything_leaves_an_empty_tree() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        for i in 0..1500u64 {
            tree.insert(&pager, &i.to_le_bytes(), b"v", false).unwrap();
        }
        for i in 0..1500u64 {
            tree.erase(&pager, &i.to_le_bytes()).unwrap();
        }
        tree.check_integrity(&pager).unwrap();
        assert_eq!(tree.key_count(&pager).unwrap(), 0);
        assert!(tree.first(&pager).unwrap().is_none());

        // and the tree still accepts inserts
        tree.insert(&pager, &42u64.to_le_bytes(), b"back", false).unwrap();
        assert_eq!(
            tree.find(&pager, &42u64.to_le_bytes()).unwrap(),
            Some(b"back".to_vec())
        );
    }

    #[test]
    fn erase_missing_key_reports_not_found() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        tree.insert(&pager, &1u64.to_le_bytes(), b"v", false).unwrap();
        let err = tree.erase(&pager, &2u64.to_le_bytes()).unwrap_err();
        assert!(matches!(err, Error::KeyNotFound));
    }

    #[test]
    fn large_records_round_trip_through_blobs() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        let big = vec![0xabu8; 40_000];
        tree.insert(&pager, &5u64.to_le_bytes(), &big, false).unwrap();
        assert_eq!(tree.find(&pager, &5u64.to_le_bytes()).unwrap(), Some(big));

        // overwriting with a small record frees the blob chain
        tree.insert(&pager, &5u64.to_le_bytes(), b"small", true).unwrap();
        assert_eq!(
            tree.find(&pager, &5u64.to_le_bytes()).unwrap(),
            Some(b"small".to_vec())
        );
        assert_ne!(pager.free_head(), 0);
    }

    #[test]
    fn seek_biases_find_neighbors() {
        let (_dir, pager) = test_pager();
        let mut tree = u64_tree(&pager);
        for i in [10u64, 20, 30] {
            tree.insert(&pager, &i.to_le_bytes(), b"v", false).unwrap();
        }
        let key_of = |pos: SlotRef| {
            let (key, _) = tree.read_pos(&pager, pos).unwrap().unwrap();
            u64::from_le_bytes(key.try_into().unwrap())
        };

        let pos = tree.seek(&pager, &20u64.to_le_bytes(), SeekBias::Lt).unwrap().unwrap();
        assert_eq!(key_of(pos), 10);
        let pos = tree.seek(&pager, &20u64.to_le_bytes(), SeekBias::Leq).unwrap().unwrap();
        assert_eq!(key_of(pos), 20);
        let pos = tree.seek(&pager, &20u64.to_le_bytes(), SeekBias::Gt).unwrap().unwrap();
        assert_eq!(key_of(pos), 30);
        let pos = tree.seek(&pager, &25u64.to_le_bytes(), SeekBias::Geq).unwrap().unwrap();
        assert_eq!(key_of(pos), 30);

        assert!(tree.seek(&pager, &10u64.to_le_bytes(), SeekBias::Lt).unwrap().is_none());
        assert!(tree.seek(&pager, &30u64.to_le_bytes(), SeekBias::Gt).unwrap().is_none());
    }

    #[test]
    fn randomized_against_model() {
        let (_dir, pager) = test_pager();
        let mut tree = Btree::create(
            &pager,
            KeyLayout::Binary(12),
            RecordLayout::Default,
            KeyLayout::Binary(12).default_compare(),
        )
        .unwrap();
        let layout = KeyLayout::Binary(12);
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..5000 {
            let n: u32 = rng.gen_range(0..800);
            let key = layout.normalize(format!("k{n:04}").as_bytes()).unwrap();
            match rng.gen_range(0..10) {
                0..=5 => {
                    let val = format!("value-{n}-{}", rng.gen::<u16>()).into_bytes();
                    tree.insert(&pager, &key, &val, true).unwrap();
                    model.insert(key.to_vec(), val);
                }
                6..=8 => match tree.erase(&pager, &key) {
                    Ok(()) => {
                        assert!(model.remove(key.as_slice()).is_some());
                    }
                    Err(Error::KeyNotFound) => {
                        assert!(!model.contains_key(key.as_slice()));
                    }
                    Err(other) => panic!("unexpected error: {other}"),
                },
                _ => {
                    let found = tree.find(&pager, &key).unwrap();
                    assert_eq!(found.as_ref(), model.get(key.as_slice()), "key {n}");
                }
            }
        }
        tree.check_integrity(&pager).unwrap();
        assert_eq!(tree.key_count(&pager).unwrap(), model.len() as u64);

        // full scan agrees with the model
        let mut pos = tree.first(&pager).unwrap();
        let mut scanned = Vec::new();
        while let Some(p) = pos {
            let (key, record) = tree.read_pos(&pager, p).unwrap().unwrap();
            scanned.push((key, record));
            pos = tree.next_pos(&pager, p).unwrap();
        }
        let expected: Vec<(Vec<u8>, Vec<u8>)> =
            model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(scanned, expected);
    }
}
