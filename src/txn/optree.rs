//! # Transaction Op-Tree
//!
//! The in-memory overlay of pending mutations for one database: a
//! red-black tree keyed by user key (through the database comparator),
//! where every node owns a time-ordered chain of ops. Readers resolve a
//! chain newest-first under their visibility rule; the commit-flush drains
//! chains oldest-first into the btree.
//!
//! ```text
//!            ┌────────── OpNode("k2") ──────────┐
//!            │ oldest ─> [insert t1] ─> [erase t3] <─ newest
//!  OpNode("k1")                             OpNode("k5")
//! ```
//!
//! Nodes and ops live in two arenas; every link is an index, and op ids
//! carry a generation so a cursor holding a stale id detects that its op
//! has been flushed away instead of dereferencing a recycled slot.
//!
//! Ops never coalesce: two inserts from one transaction on one key stay
//! two chain entries, the newest wins on read.

use std::cmp::Ordering;

use smallvec::SmallVec;

use crate::btree::keys::CompareFn;
use crate::btree::SeekBias;
use crate::txn::TxnId;

pub type NodeId = u32;

/// Stable id of a cursor registered on an op.
pub type CursorToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    InsertOw,
    Erase,
    Nop,
}

#[derive(Debug)]
pub struct Op {
    pub txn: TxnId,
    pub kind: OpKind,
    pub record: Option<Vec<u8>>,
    node: NodeId,
    /// Toward `newest`.
    next: Option<u32>,
    /// Toward `oldest`.
    prev: Option<u32>,
    cursors: SmallVec<[CursorToken; 2]>,
}

/// Generation-tagged op reference. Stale ids (the op was flushed and the
/// slot reused) fail validation instead of resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    idx: u32,
    gen: u32,
}

struct OpSlot {
    gen: u32,
    op: Option<Op>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

struct OpNode {
    key: Vec<u8>,
    color: Color,
    parent: Option<NodeId>,
    left: Option<NodeId>,
    right: Option<NodeId>,
    oldest: Option<u32>,
    newest: Option<u32>,
}

#[derive(Default)]
pub struct OpTree {
    nodes: Vec<Option<OpNode>>,
    free_nodes: Vec<NodeId>,
    root: Option<NodeId>,
    node_count: usize,
    ops: Vec<OpSlot>,
    free_ops: Vec<u32>,
}

impl OpTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    fn node(&self, id: NodeId) -> &OpNode {
        self.nodes[id as usize].as_ref().expect("dangling node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut OpNode {
        self.nodes[id as usize].as_mut().expect("dangling node id")
    }

    pub fn node_key(&self, id: NodeId) -> &[u8] {
        &self.node(id).key
    }

    /// Locates the node for an exact key.
    pub fn get(&self, key: &[u8], cmp: CompareFn) -> Option<NodeId> {
        let mut current = self.root;
        while let Some(id) = current {
            let node = self.node(id);
            current = match cmp(key, &node.key) {
                Ordering::Equal => return Some(id),
                Ordering::Less => node.left,
                Ordering::Greater => node.right,
            };
        }
        None
    }

    /// Locates or creates the node for a key.
    pub fn get_or_insert(&mut self, key: &[u8], cmp: CompareFn) -> NodeId {
        let mut parent = None;
        let mut current = self.root;
        let mut went_left = false;
        while let Some(id) = current {
            let node = self.node(id);
            match cmp(key, &node.key) {
                Ordering::Equal => return id,
                Ordering::Less => {
                    parent = Some(id);
                    went_left = true;
                    current = node.left;
                }
                Ordering::Greater => {
                    parent = Some(id);
                    went_left = false;
                    current = node.right;
                }
            }
        }

        let id = self.alloc_node(OpNode {
            key: key.to_vec(),
            color: Color::Red,
            parent,
            left: None,
            right: None,
            oldest: None,
            newest: None,
        });
        match parent {
            None => self.root = Some(id),
            Some(p) => {
                if went_left {
                    self.node_mut(p).left = Some(id);
                } else {
                    self.node_mut(p).right = Some(id);
                }
            }
        }
        self.insert_fixup(id);
        id
    }

    fn alloc_node(&mut self, node: OpNode) -> NodeId {
        self.node_count += 1;
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id as usize] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as NodeId
            }
        }
    }

    /// Tree-order iteration endpoints and neighbors.
    pub fn first(&self) -> Option<NodeId> {
        self.root.map(|id| self.minimum(id))
    }

    pub fn last(&self) -> Option<NodeId> {
        let mut current = self.root?;
        while let Some(right) = self.node(current).right {
            current = right;
        }
        Some(current)
    }

    pub fn next_node(&self, id: NodeId) -> Option<NodeId> {
        if let Some(right) = self.node(id).right {
            return Some(self.minimum(right));
        }
        let mut child = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    pub fn prev_node(&self, id: NodeId) -> Option<NodeId> {
        if let Some(left) = self.node(id).left {
            let mut current = left;
            while let Some(right) = self.node(current).right {
                current = right;
            }
            return Some(current);
        }
        let mut child = id;
        let mut parent = self.node(id).parent;
        while let Some(p) = parent {
            if self.node(p).right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.node(p).parent;
        }
        None
    }

    /// Nearest-neighbor node under the given bias.
    pub fn seek(&self, key: &[u8], cmp: CompareFn, bias: SeekBias) -> Option<NodeId> {
        let mut candidate = None;
        let mut current = self.root;
        while let Some(id) = current {
            let node = self.node(id);
            let order = cmp(&node.key, key);
            let (is_candidate, go_left) = match bias {
                SeekBias::Lt => (order == Ordering::Less, order != Ordering::Less),
                SeekBias::Leq => (order != Ordering::Greater, order == Ordering::Greater),
                SeekBias::Gt => (order == Ordering::Greater, order == Ordering::Greater),
                SeekBias::Geq => (order != Ordering::Less, order != Ordering::Less),
            };
            if is_candidate {
                candidate = Some(id);
            }
            current = if go_left { node.left } else { node.right };
        }
        candidate
    }

    // ---- op chains ----

    pub fn op(&self, id: OpId) -> Option<&Op> {
        let slot = self.ops.get(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.op.as_ref()
    }

    pub fn op_mut(&mut self, id: OpId) -> Option<&mut Op> {
        let slot = self.ops.get_mut(id.idx as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.op.as_mut()
    }

    pub fn op_node(&self, id: OpId) -> Option<NodeId> {
        self.op(id).map(|op| op.node)
    }

    pub fn op_key(&self, id: OpId) -> Option<&[u8]> {
        self.op(id).map(|op| self.node_key(op.node))
    }

    /// Appends an op at the newest end of a node's chain.
    pub fn append_op(
        &mut self,
        node_id: NodeId,
        txn: TxnId,
        kind: OpKind,
        record: Option<Vec<u8>>,
    ) -> OpId {
        let old_newest = self.node(node_id).newest;
        let op = Op {
            txn,
            kind,
            record,
            node: node_id,
            next: None,
            prev: old_newest,
            cursors: SmallVec::new(),
        };
        let idx = match self.free_ops.pop() {
            Some(idx) => {
                let slot = &mut self.ops[idx as usize];
                debug_assert!(slot.op.is_none());
                slot.op = Some(op);
                idx
            }
            None => {
                self.ops.push(OpSlot { gen: 0, op: Some(op) });
                (self.ops.len() - 1) as u32
            }
        };
        if let Some(prev) = old_newest {
            self.op_at_mut(prev).next = Some(idx);
        }
        let node = self.node_mut(node_id);
        node.newest = Some(idx);
        if node.oldest.is_none() {
            node.oldest = Some(idx);
        }
        OpId {
            idx,
            gen: self.ops[idx as usize].gen,
        }
    }

    fn op_at_mut(&mut self, idx: u32) -> &mut Op {
        self.ops[idx as usize].op.as_mut().expect("dangling op index")
    }

    fn op_id_at(&self, idx: u32) -> OpId {
        OpId {
            idx,
            gen: self.ops[idx as usize].gen,
        }
    }

    pub fn newest_op(&self, node_id: NodeId) -> Option<OpId> {
        self.node(node_id).newest.map(|idx| self.op_id_at(idx))
    }

    pub fn oldest_op(&self, node_id: NodeId) -> Option<OpId> {
        self.node(node_id).oldest.map(|idx| self.op_id_at(idx))
    }

    /// The next-older op in the chain.
    pub fn older_op(&self, id: OpId) -> Option<OpId> {
        self.op(id)?.prev.map(|idx| self.op_id_at(idx))
    }

    /// The next-newer op in the chain.
    pub fn newer_op(&self, id: OpId) -> Option<OpId> {
        self.op(id)?.next.map(|idx| self.op_id_at(idx))
    }

    pub fn register_cursor(&mut self, id: OpId, cursor: CursorToken) {
        if let Some(op) = self.op_mut(id) {
            if !op.cursors.contains(&cursor) {
                op.cursors.push(cursor);
            }
        }
    }

    pub fn unregister_cursor(&mut self, id: OpId, cursor: CursorToken) {
        if let Some(op) = self.op_mut(id) {
            op.cursors.retain(|c| *c != cursor);
        }
    }

    /// Cursors currently coupled to an op.
    pub fn op_cursors(&self, id: OpId) -> SmallVec<[CursorToken; 2]> {
        self.op(id).map(|op| op.cursors.clone()).unwrap_or_default()
    }

    /// Detaches an op; when the chain drains the node leaves the tree.
    /// Any coupled cursors must have been uncoupled first.
    pub fn remove_op(&mut self, id: OpId) {
        let (node_id, prev, next) = match self.op(id) {
            Some(op) => {
                debug_assert!(op.cursors.is_empty(), "removing an op with coupled cursors");
                (op.node, op.prev, op.next)
            }
            None => return,
        };

        match prev {
            Some(p) => self.op_at_mut(p).next = next,
            None => self.node_mut(node_id).oldest = next,
        }
        match next {
            Some(n) => self.op_at_mut(n).prev = prev,
            None => self.node_mut(node_id).newest = prev,
        }

        let slot = &mut self.ops[id.idx as usize];
        slot.op = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.free_ops.push(id.idx);

        if self.node(node_id).oldest.is_none() {
            self.remove_node(node_id);
        }
    }

    // ---- red-black maintenance ----

    fn minimum(&self, mut id: NodeId) -> NodeId {
        while let Some(left) = self.node(id).left {
            id = left;
        }
        id
    }

    fn is_red(&self, id: Option<NodeId>) -> bool {
        matches!(id, Some(id) if self.node(id).color == Color::Red)
    }

    fn rotate_left(&mut self, x: NodeId) {
        let y = self.node(x).right.expect("rotate_left without right child");
        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if let Some(child) = y_left {
            self.node_mut(child).parent = Some(x);
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.node(p).left == Some(x) {
                    self.node_mut(p).left = Some(y);
                } else {
                    self.node_mut(p).right = Some(y);
                }
            }
        }
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let y = self.node(x).left.expect("rotate_right without left child");
        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if let Some(child) = y_right {
            self.node_mut(child).parent = Some(x);
        }
        let x_parent = self.node(x).parent;
        self.node_mut(y).parent = x_parent;
        match x_parent {
            None => self.root = Some(y),
            Some(p) => {
                if self.node(p).left == Some(x) {
                    self.node_mut(p).left = Some(y);
                } else {
                    self.node_mut(p).right = Some(y);
                }
            }
        }
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while self.is_red(self.node(z).parent) {
            let p = self.node(z).parent.expect("red node without parent");
            let g = self.node(p).parent.expect("red parent without grandparent");
            if self.node(g).left == Some(p) {
                let uncle = self.node(g).right;
                if self.is_red(uncle) {
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(uncle.expect("red uncle")).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    z = g;
                } else {
                    if self.node(p).right == Some(z) {
                        z = p;
                        self.rotate_left(z);
                    }
                    let p = self.node(z).parent.expect("fixup lost its parent");
                    let g = self.node(p).parent.expect("fixup lost its grandparent");
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.rotate_right(g);
                }
            } else {
                let uncle = self.node(g).left;
                if self.is_red(uncle) {
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(uncle.expect("red uncle")).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    z = g;
                } else {
                    if self.node(p).left == Some(z) {
                        z = p;
                        self.rotate_right(z);
                    }
                    let p = self.node(z).parent.expect("fixup lost its parent");
                    let g = self.node(p).parent.expect("fixup lost its grandparent");
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.rotate_left(g);
                }
            }
        }
        let root = self.root.expect("fixup on an empty tree");
        self.node_mut(root).color = Color::Black;
    }

    fn transplant(&mut self, u: NodeId, v: Option<NodeId>) {
        let u_parent = self.node(u).parent;
        match u_parent {
            None => self.root = v,
            Some(p) => {
                if self.node(p).left == Some(u) {
                    self.node_mut(p).left = v;
                } else {
                    self.node_mut(p).right = v;
                }
            }
        }
        if let Some(v) = v {
            self.node_mut(v).parent = u_parent;
        }
    }

    fn remove_node(&mut self, z: NodeId) {
        let (z_left, z_right) = {
            let node = self.node(z);
            (node.left, node.right)
        };
        let mut fix_color = self.node(z).color;
        let fix_node;
        let fix_parent;

        match (z_left, z_right) {
            (None, _) => {
                fix_node = z_right;
                fix_parent = self.node(z).parent;
                self.transplant(z, z_right);
            }
            (_, None) => {
                fix_node = z_left;
                fix_parent = self.node(z).parent;
                self.transplant(z, z_left);
            }
            (Some(_), Some(right)) => {
                let y = self.minimum(right);
                fix_color = self.node(y).color;
                let y_right = self.node(y).right;
                fix_node = y_right;
                if self.node(y).parent == Some(z) {
                    fix_parent = Some(y);
                } else {
                    fix_parent = self.node(y).parent;
                    self.transplant(y, y_right);
                    let z_right_now = self.node(z).right;
                    self.node_mut(y).right = z_right_now;
                    if let Some(r) = z_right_now {
                        self.node_mut(r).parent = Some(y);
                    }
                }
                self.transplant(z, Some(y));
                let z_left_now = self.node(z).left;
                self.node_mut(y).left = z_left_now;
                if let Some(l) = z_left_now {
                    self.node_mut(l).parent = Some(y);
                }
                let z_color = self.node(z).color;
                self.node_mut(y).color = z_color;
            }
        }

        self.nodes[z as usize] = None;
        self.free_nodes.push(z);
        self.node_count -= 1;

        if fix_color == Color::Black {
            self.remove_fixup(fix_node, fix_parent);
        }
    }

    fn remove_fixup(&mut self, mut x: Option<NodeId>, mut parent: Option<NodeId>) {
        while x != self.root && !self.is_red(x) {
            let p = match parent {
                Some(p) => p,
                None => break,
            };
            if self.node(p).left == x {
                let mut w = match self.node(p).right {
                    Some(w) => w,
                    None => break,
                };
                if self.is_red(Some(w)) {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(p).color = Color::Red;
                    self.rotate_left(p);
                    w = match self.node(p).right {
                        Some(w) => w,
                        None => break,
                    };
                }
                let w_left = self.node(w).left;
                let w_right = self.node(w).right;
                if !self.is_red(w_left) && !self.is_red(w_right) {
                    self.node_mut(w).color = Color::Red;
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if !self.is_red(w_right) {
                        if let Some(wl) = w_left {
                            self.node_mut(wl).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.rotate_right(w);
                        w = self.node(p).right.expect("sibling vanished in fixup");
                    }
                    let p_color = self.node(p).color;
                    self.node_mut(w).color = p_color;
                    self.node_mut(p).color = Color::Black;
                    if let Some(wr) = self.node(w).right {
                        self.node_mut(wr).color = Color::Black;
                    }
                    self.rotate_left(p);
                    x = self.root;
                    parent = None;
                }
            } else {
                let mut w = match self.node(p).left {
                    Some(w) => w,
                    None => break,
                };
                if self.is_red(Some(w)) {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(p).color = Color::Red;
                    self.rotate_right(p);
                    w = match self.node(p).left {
                        Some(w) => w,
                        None => break,
                    };
                }
                let w_left = self.node(w).left;
                let w_right = self.node(w).right;
                if !self.is_red(w_left) && !self.is_red(w_right) {
                    self.node_mut(w).color = Color::Red;
                    x = Some(p);
                    parent = self.node(p).parent;
                } else {
                    if !self.is_red(w_left) {
                        if let Some(wr) = w_right {
                            self.node_mut(wr).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.rotate_left(w);
                        w = self.node(p).left.expect("sibling vanished in fixup");
                    }
                    let p_color = self.node(p).color;
                    self.node_mut(w).color = p_color;
                    self.node_mut(p).color = Color::Black;
                    if let Some(wl) = self.node(w).left {
                        self.node_mut(wl).color = Color::Black;
                    }
                    self.rotate_right(p);
                    x = self.root;
                    parent = None;
                }
            }
        }
        if let Some(x) = x {
            self.node_mut(x).color = Color::Black;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::keys::KeyLayout;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeSet;

    fn cmp() -> CompareFn {
        KeyLayout::Binary(8).default_compare()
    }

    fn key(n: u32) -> Vec<u8> {
        format!("{n:08}").into_bytes()
    }

    impl OpTree {
        /// Red-black invariants: root black, no red-red edge, equal black
        /// height on every path, BST ordering, consistent parent links.
        fn check_invariants(&self, cmp: CompareFn) {
            if let Some(root) = self.root {
                assert_eq!(self.node(root).color, Color::Black, "root must be black");
                assert_eq!(self.node(root).parent, None);
                self.check_subtree(root, cmp);
            }
        }

        fn check_subtree(&self, id: NodeId, cmp: CompareFn) -> usize {
            let node = self.node(id);
            let mut black_height = None;
            for child in [node.left, node.right] {
                let child_height = match child {
                    None => 1,
                    Some(c) => {
                        assert_eq!(self.node(c).parent, Some(id), "broken parent link");
                        if node.color == Color::Red {
                            assert_eq!(self.node(c).color, Color::Black, "red-red edge");
                        }
                        self.check_subtree(c, cmp)
                    }
                };
                if let Some(h) = black_height {
                    assert_eq!(h, child_height, "unequal black heights");
                }
                black_height = Some(child_height);
            }
            if let Some(l) = node.left {
                assert_eq!(cmp(&self.node(l).key, &node.key), Ordering::Less);
            }
            if let Some(r) = node.right {
                assert_eq!(cmp(&self.node(r).key, &node.key), Ordering::Greater);
            }
            black_height.unwrap_or(1) + usize::from(node.color == Color::Black)
        }

        fn keys_in_order(&self) -> Vec<Vec<u8>> {
            let mut keys = Vec::new();
            let mut current = self.first();
            while let Some(id) = current {
                keys.push(self.node_key(id).to_vec());
                current = self.next_node(id);
            }
            keys
        }
    }

    #[test]
    fn ordered_iteration_after_random_inserts() {
        let mut tree = OpTree::new();
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = BTreeSet::new();
        for _ in 0..500 {
            let n: u32 = rng.gen_range(0..1000);
            let k = key(n);
            tree.get_or_insert(&k, cmp());
            model.insert(k);
        }
        tree.check_invariants(cmp());
        assert_eq!(tree.keys_in_order(), model.iter().cloned().collect::<Vec<_>>());
        assert_eq!(tree.node_count(), model.len());
    }

    #[test]
    fn reverse_iteration_matches_forward() {
        let mut tree = OpTree::new();
        for n in [5u32, 1, 9, 3, 7, 2, 8] {
            let id = tree.get_or_insert(&key(n), cmp());
            tree.append_op(id, 1, OpKind::Insert, None);
        }
        let forward = tree.keys_in_order();
        let mut backward = Vec::new();
        let mut current = tree.last();
        while let Some(id) = current {
            backward.push(tree.node_key(id).to_vec());
            current = tree.prev_node(id);
        }
        backward.reverse();
        assert_eq!(forward, backward);
    }

    #[test]
    fn op_chain_is_time_ordered() {
        let mut tree = OpTree::new();
        let node = tree.get_or_insert(&key(1), cmp());
        let a = tree.append_op(node, 1, OpKind::Insert, Some(b"a".to_vec()));
        let b = tree.append_op(node, 1, OpKind::InsertOw, Some(b"b".to_vec()));
        let c = tree.append_op(node, 2, OpKind::Erase, None);

        assert_eq!(tree.oldest_op(node), Some(a));
        assert_eq!(tree.newest_op(node), Some(c));
        assert_eq!(tree.older_op(c), Some(b));
        assert_eq!(tree.older_op(b), Some(a));
        assert_eq!(tree.newer_op(a), Some(b));
        assert_eq!(tree.op(b).unwrap().record.as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn removing_last_op_removes_the_node() {
        let mut tree = OpTree::new();
        let node = tree.get_or_insert(&key(7), cmp());
        let a = tree.append_op(node, 1, OpKind::Insert, None);
        let b = tree.append_op(node, 1, OpKind::Erase, None);

        tree.remove_op(a);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.oldest_op(node), Some(b));

        tree.remove_op(b);
        assert_eq!(tree.node_count(), 0);
        assert!(tree.get(&key(7), cmp()).is_none());
    }

    #[test]
    fn stale_op_ids_do_not_resolve() {
        let mut tree = OpTree::new();
        let node = tree.get_or_insert(&key(1), cmp());
        let a = tree.append_op(node, 1, OpKind::Insert, None);
        tree.remove_op(a);

        // the slot is recycled by a new op, the old id must stay dead
        let node2 = tree.get_or_insert(&key(2), cmp());
        let b = tree.append_op(node2, 1, OpKind::Insert, None);
        assert!(tree.op(a).is_none());
        assert!(tree.op(b).is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn cursor_registration_round_trip() {
        let mut tree = OpTree::new();
        let node = tree.get_or_insert(&key(1), cmp());
        let op = tree.append_op(node, 1, OpKind::Insert, None);
        tree.register_cursor(op, 11);
        tree.register_cursor(op, 12);
        tree.register_cursor(op, 11);
        assert_eq!(tree.op_cursors(op).as_slice(), &[11, 12]);

        tree.unregister_cursor(op, 11);
        assert_eq!(tree.op_cursors(op).as_slice(), &[12]);
        tree.unregister_cursor(op, 12);
        tree.remove_op(op);
    }

    #[test]
    fn seek_finds_neighbors() {
        let mut tree = OpTree::new();
        for n in [10u32, 20, 30] {
            let id = tree.get_or_insert(&key(n), cmp());
            tree.append_op(id, 1, OpKind::Insert, None);
        }
        let k = |id: Option<NodeId>| id.map(|id| tree.node_key(id).to_vec());

        assert_eq!(k(tree.seek(&key(20), cmp(), SeekBias::Lt)), Some(key(10)));
        assert_eq!(k(tree.seek(&key(20), cmp(), SeekBias::Leq)), Some(key(20)));
        assert_eq!(k(tree.seek(&key(20), cmp(), SeekBias::Gt)), Some(key(30)));
        assert_eq!(k(tree.seek(&key(25), cmp(), SeekBias::Geq)), Some(key(30)));
        assert_eq!(k(tree.seek(&key(10), cmp(), SeekBias::Lt)), None);
        assert_eq!(k(tree.seek(&key(30), cmp(), SeekBias::Gt)), None);
    }

    #[test]
    fn randomized_insert_remove_keeps_invariants() {
        let mut tree = OpTree::new();
        let mut rng = StdRng::seed_from_u64(0xfeed);
        let mut live: Vec<(Vec<u8>, OpId)> = Vec::new();
        let mut model = BTreeSet::new();

        for round in 0..2000 {
            if rng.gen_bool(0.6) || live.is_empty() {
                let n: u32 = rng.gen_range(0..500);
                let k = key(n);
                let node = tree.get_or_insert(&k, cmp());
                let op = tree.append_op(node, 1, OpKind::Insert, None);
                live.push((k.clone(), op));
                model.insert(k);
            } else {
                let idx = rng.gen_range(0..live.len());
                let (k, op) = live.swap_remove(idx);
                tree.remove_op(op);
                if !live.iter().any(|(other, _)| *other == k) {
                    model.remove(&k);
                }
            }
            if round % 100 == 0 {
                tree.check_invariants(cmp());
            }
        }
        tree.check_invariants(cmp());
        assert_eq!(tree.keys_in_order(), model.iter().cloned().collect::<Vec<_>>());
    }
}
