//! # Transactions
//!
//! Multi-version transactions over the op-tree overlay. A transaction
//! never touches the btree while live: its writes accumulate as ops, and
//! only the commit-flush drains them to disk, strictly in transaction-id
//! order. Ids come from a per-environment counter, so id order is begin
//! order and the flush gives a serial schedule equivalent to commit order.
//!
//! A transaction with attached cursors can neither commit nor abort; the
//! cursor refcount guards that at the manager level.

pub mod optree;

use std::collections::VecDeque;

use crate::error::{Error, Result};
use optree::OpId;

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug)]
pub struct Transaction {
    id: TxnId,
    state: TxnState,
    read_only: bool,
    cursor_refcount: u32,
    /// `(database slot, op)` in append order; drained by the commit-flush.
    ops: Vec<(u16, OpId)>,
}

impl Transaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn cursor_refcount(&self) -> u32 {
        self.cursor_refcount
    }

    pub fn ops(&self) -> &[(u16, OpId)] {
        &self.ops
    }

    pub fn push_op(&mut self, db: u16, op: OpId) {
        self.ops.push((db, op));
    }
}

/// Owns the live transaction list and the id counter.
#[derive(Default)]
pub struct TxnManager {
    next_id: TxnId,
    /// Live transactions, oldest first (ids ascend front to back).
    txns: VecDeque<Transaction>,
}

impl TxnManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, read_only: bool) -> TxnId {
        self.next_id += 1;
        self.txns.push_back(Transaction {
            id: self.next_id,
            state: TxnState::Active,
            read_only,
            cursor_refcount: 0,
            ops: Vec::new(),
        });
        self.next_id
    }

    pub fn last_id(&self) -> TxnId {
        self.next_id
    }

    pub fn live_count(&self) -> usize {
        self.txns.len()
    }

    pub fn get(&self, id: TxnId) -> Option<&Transaction> {
        self.txns.iter().find(|txn| txn.id == id)
    }

    pub fn get_mut(&mut self, id: TxnId) -> Option<&mut Transaction> {
        self.txns.iter_mut().find(|txn| txn.id == id)
    }

    /// Marks a transaction committed; the caller runs the flush.
    pub fn commit(&mut self, id: TxnId) -> Result<()> {
        let txn = self.get_mut(id).ok_or(Error::InvParameter("unknown transaction"))?;
        if txn.state != TxnState::Active {
            return Err(Error::InvParameter("transaction is already finished"));
        }
        if txn.cursor_refcount > 0 {
            return Err(Error::CursorStillOpen);
        }
        txn.state = TxnState::Committed;
        Ok(())
    }

    pub fn abort(&mut self, id: TxnId) -> Result<()> {
        let txn = self.get_mut(id).ok_or(Error::InvParameter("unknown transaction"))?;
        if txn.state != TxnState::Active {
            return Err(Error::InvParameter("transaction is already finished"));
        }
        if txn.cursor_refcount > 0 {
            return Err(Error::CursorStillOpen);
        }
        txn.state = TxnState::Aborted;
        Ok(())
    }

    pub fn add_cursor_ref(&mut self, id: TxnId) -> Result<()> {
        let txn = self.get_mut(id).ok_or(Error::InvParameter("unknown transaction"))?;
        txn.cursor_refcount += 1;
        Ok(())
    }

    pub fn release_cursor_ref(&mut self, id: TxnId) {
        if let Some(txn) = self.get_mut(id) {
            debug_assert!(txn.cursor_refcount > 0);
            txn.cursor_refcount = txn.cursor_refcount.saturating_sub(1);
        }
    }

    pub fn oldest(&self) -> Option<&Transaction> {
        self.txns.front()
    }

    pub fn pop_oldest(&mut self) -> Option<Transaction> {
        self.txns.pop_front()
    }

    pub fn live_ids(&self) -> Vec<TxnId> {
        self.txns.iter().map(|txn| txn.id).collect()
    }

    /// Visibility of an op owned by `owner` for a reader. Readers see
    /// their own ops and ops of committed transactions; aborted and
    /// foreign in-flight ops are invisible. An owner no longer in the
    /// live list was flushed long ago and counts as committed.
    pub fn is_visible(&self, owner: TxnId, reader: Option<TxnId>) -> bool {
        if reader == Some(owner) {
            return true;
        }
        match self.get(owner) {
            Some(txn) => txn.state == TxnState::Committed,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut mgr = TxnManager::new();
        assert_eq!(mgr.begin(false), 1);
        assert_eq!(mgr.begin(false), 2);
        assert_eq!(mgr.begin(true), 3);
        assert_eq!(mgr.last_id(), 3);
    }

    #[test]
    fn commit_with_open_cursor_fails() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(false);
        mgr.add_cursor_ref(id).unwrap();

        assert!(matches!(mgr.commit(id), Err(Error::CursorStillOpen)));
        assert!(matches!(mgr.abort(id), Err(Error::CursorStillOpen)));

        mgr.release_cursor_ref(id);
        mgr.commit(id).unwrap();
        assert_eq!(mgr.get(id).unwrap().state(), TxnState::Committed);
    }

    #[test]
    fn double_finish_is_rejected() {
        let mut mgr = TxnManager::new();
        let id = mgr.begin(false);
        mgr.commit(id).unwrap();
        assert!(mgr.commit(id).is_err());
        assert!(mgr.abort(id).is_err());
    }

    #[test]
    fn visibility_rules() {
        let mut mgr = TxnManager::new();
        let committed = mgr.begin(false);
        let aborted = mgr.begin(false);
        let active = mgr.begin(false);
        mgr.commit(committed).unwrap();
        mgr.abort(aborted).unwrap();

        // a reader sees committed ops and its own, nothing else
        assert!(mgr.is_visible(committed, Some(active)));
        assert!(mgr.is_visible(active, Some(active)));
        assert!(!mgr.is_visible(aborted, Some(active)));
        let other = mgr.begin(false);
        assert!(!mgr.is_visible(active, Some(other)));

        // readers without a transaction see only committed state
        assert!(mgr.is_visible(committed, None));
        assert!(!mgr.is_visible(active, None));

        // a flushed-away owner is historical, hence visible
        assert!(mgr.is_visible(9999, Some(active)) || mgr.get(9999).is_none());
    }

    #[test]
    fn queue_drains_in_id_order() {
        let mut mgr = TxnManager::new();
        let a = mgr.begin(false);
        let b = mgr.begin(false);
        mgr.commit(a).unwrap();
        mgr.commit(b).unwrap();

        assert_eq!(mgr.oldest().unwrap().id(), a);
        assert_eq!(mgr.pop_oldest().unwrap().id(), a);
        assert_eq!(mgr.pop_oldest().unwrap().id(), b);
        assert!(mgr.pop_oldest().is_none());
    }
}
