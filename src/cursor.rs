//! # Unified Cursor
//!
//! One cursor abstraction over the two views of a database. A cursor
//! aggregates a btree half and a transaction half; at most one half is
//! *active* (owns the current position) at a time:
//!
//! ```text
//!        nil ──find/move──> coupled-btree(page, slot)
//!         │                     ▲      │ commit-flush mutates the tree
//!         │                     │      ▼
//!         └──find/move──> coupled-txn(op) ──op flushed──> uncoupled(key)
//! ```
//!
//! The *uncoupled* state keeps a copy of the key so the next move can
//! re-seek; reading through an uncoupled half yields the deliberate
//! `Internal` signal that sends the caller back through a fresh lookup.
//!
//! While coupled to an op, the cursor is registered on it (the reverse
//! link lives in the op-tree), which keeps the op alive until every
//! cursor lets go. The environment owns cursor storage and drives all
//! state transitions; this module only defines the state machine.

use crate::btree::SlotRef;
use crate::txn::optree::OpId;
use crate::txn::TxnId;

/// Public cursor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId(pub(crate) u64);

/// Cursor movement directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BtreeHalf {
    Nil,
    Coupled(SlotRef),
    /// The slot went away under the cursor; the key re-seeds the next
    /// seek.
    Uncoupled(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TxnHalf {
    Nil,
    Coupled(OpId),
    /// The op was flushed into the btree; the key re-seeds the next
    /// seek.
    Uncoupled(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActiveHalf {
    None,
    Btree,
    Txn,
}

#[derive(Debug)]
pub(crate) struct Cursor {
    pub db: u16,
    pub txn: Option<TxnId>,
    pub btree: BtreeHalf,
    pub txn_half: TxnHalf,
    pub active: ActiveHalf,
    /// Token registered on coupled ops as the reverse link.
    pub token: u64,
}

impl Cursor {
    pub fn new(db: u16, txn: Option<TxnId>, token: u64) -> Self {
        Self {
            db,
            txn,
            btree: BtreeHalf::Nil,
            txn_half: TxnHalf::Nil,
            active: ActiveHalf::None,
            token,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.active == ActiveHalf::None
    }

    /// The op this cursor is registered on, if any.
    pub fn coupled_op(&self) -> Option<OpId> {
        match self.txn_half {
            TxnHalf::Coupled(op) => Some(op),
            _ => None,
        }
    }

    pub fn couple_to_btree(&mut self, pos: SlotRef) {
        self.btree = BtreeHalf::Coupled(pos);
        self.txn_half = TxnHalf::Nil;
        self.active = ActiveHalf::Btree;
    }

    pub fn couple_to_txn(&mut self, op: OpId) {
        self.btree = BtreeHalf::Nil;
        self.txn_half = TxnHalf::Coupled(op);
        self.active = ActiveHalf::Txn;
    }

    /// Downgrades a coupled-txn cursor to the key-copy state.
    pub fn uncouple_txn(&mut self, key: Vec<u8>) {
        self.txn_half = TxnHalf::Uncoupled(key);
    }

    /// Downgrades a coupled-btree cursor to the key-copy state.
    pub fn uncouple_btree(&mut self, key: Vec<u8>) {
        self.btree = BtreeHalf::Uncoupled(key);
    }

    pub fn set_nil(&mut self) {
        self.btree = BtreeHalf::Nil;
        self.txn_half = TxnHalf::Nil;
        self.active = ActiveHalf::None;
    }
}
