//! # Database and the Merge Coordinator
//!
//! One [`Database`] couples the two views of its key space: the
//! disk-resident btree and the in-memory op-tree overlay. Every read
//! reconciles them: the op-tree answers first under the reader's
//! visibility, and the btree fills in whatever the overlay does not
//! shadow. Every write goes to the op-tree only, reaching the btree at
//! commit-flush time.
//!
//! [`Database::merged_step`] is the heart of the coupling: given an anchor
//! key it produces the nearest visible key beyond it, merging both sides,
//! letting the transaction side shadow equal btree keys, and letting a
//! visible erase mask its key in both views. Point lookups, approximate
//! matches, cursor traversal and key counting are all built on it.

use std::cmp::Ordering;

use crate::btree::tree::{Btree, SeekBias, SlotRef};
use crate::btree::{CompareFn, KeyLayout, RecordLayout};
use crate::error::{Error, Result};
use crate::storage::Pager;
use crate::txn::optree::{NodeId, OpId, OpKind, OpTree};
use crate::txn::{TxnId, TxnManager};

/// What an op chain resolves to for a particular reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnResolution {
    /// A visible insert: the op and its record.
    Insert(OpId, Vec<u8>),
    /// A visible erase; the key is absent and shadows the btree.
    Erased,
    /// No visible op; the node behaves as if absent.
    None,
}

/// Where a merged hit came from, for cursor coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Btree(SlotRef),
    Txn(OpId),
}

#[derive(Debug, Clone)]
pub struct MergedHit {
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    pub source: HitSource,
}

pub struct Database {
    pub(crate) name: u16,
    pub(crate) slot: u16,
    pub(crate) layout: KeyLayout,
    pub(crate) record_layout: RecordLayout,
    pub(crate) cmp: CompareFn,
    pub(crate) btree: Btree,
    pub(crate) optree: OpTree,
    pub(crate) recno_seq: u64,
}

impl Database {
    pub fn name(&self) -> u16 {
        self.name
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    /// Resolves a node's op chain newest-first for `reader`.
    pub(crate) fn resolve_node(
        &self,
        txns: &TxnManager,
        reader: Option<TxnId>,
        node: NodeId,
    ) -> TxnResolution {
        let mut current = self.optree.newest_op(node);
        while let Some(id) = current {
            let op = match self.optree.op(id) {
                Some(op) => op,
                None => break,
            };
            if txns.is_visible(op.txn, reader) {
                match op.kind {
                    OpKind::Insert | OpKind::InsertOw => {
                        return TxnResolution::Insert(id, op.record.clone().unwrap_or_default());
                    }
                    OpKind::Erase => return TxnResolution::Erased,
                    OpKind::Nop => {}
                }
            }
            current = self.optree.older_op(id);
        }
        TxnResolution::None
    }

    /// Exact merged lookup.
    pub(crate) fn lookup(
        &self,
        pager: &Pager,
        txns: &TxnManager,
        reader: Option<TxnId>,
        key: &[u8],
    ) -> Result<Vec<u8>> {
        if let Some(node) = self.optree.get(key, self.cmp) {
            match self.resolve_node(txns, reader, node) {
                TxnResolution::Insert(_, record) => return Ok(record),
                TxnResolution::Erased => return Err(Error::KeyNotFound),
                TxnResolution::None => {}
            }
        }
        self.btree.find(pager, key)?.ok_or(Error::KeyNotFound)
    }

    /// True when `key` exists for `reader` across both layers.
    pub(crate) fn is_present(
        &self,
        pager: &Pager,
        txns: &TxnManager,
        reader: Option<TxnId>,
        key: &[u8],
    ) -> Result<bool> {
        match self.lookup(pager, txns, reader, key) {
            Ok(_) => Ok(true),
            Err(Error::KeyNotFound) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// The nearest transaction-layer candidate beyond the anchor, walking
    /// over nodes that resolve to nothing.
    fn txn_candidate(
        &self,
        txns: &TxnManager,
        reader: Option<TxnId>,
        anchor: Option<&[u8]>,
        forward: bool,
    ) -> Option<(Vec<u8>, TxnResolution)> {
        let mut node = match anchor {
            None => {
                if forward {
                    self.optree.first()
                } else {
                    self.optree.last()
                }
            }
            Some(key) => {
                let bias = if forward { SeekBias::Gt } else { SeekBias::Lt };
                self.optree.seek(key, self.cmp, bias)
            }
        };
        while let Some(n) = node {
            match self.resolve_node(txns, reader, n) {
                TxnResolution::None => {
                    node = if forward {
                        self.optree.next_node(n)
                    } else {
                        self.optree.prev_node(n)
                    };
                }
                resolution => return Some((self.optree.node_key(n).to_vec(), resolution)),
            }
        }
        None
    }

    /// The nearest visible key strictly beyond `anchor` (or the extreme
    /// when `anchor` is `None`), merged across both layers. Equal keys:
    /// the transaction side shadows; a visible erase suppresses the key
    /// in both views and the walk continues.
    pub(crate) fn merged_step(
        &self,
        pager: &Pager,
        txns: &TxnManager,
        reader: Option<TxnId>,
        anchor: Option<&[u8]>,
        forward: bool,
    ) -> Result<Option<MergedHit>> {
        let mut anchor: Option<Vec<u8>> = anchor.map(|k| k.to_vec());
        loop {
            let bpos = match &anchor {
                None => {
                    if forward {
                        self.btree.first(pager)?
                    } else {
                        self.btree.last(pager)?
                    }
                }
                Some(key) => {
                    let bias = if forward { SeekBias::Gt } else { SeekBias::Lt };
                    self.btree.seek(pager, key, bias)?
                }
            };
            let bentry = match bpos {
                Some(pos) => self
                    .btree
                    .read_pos(pager, pos)?
                    .map(|(key, record)| (pos, key, record)),
                None => None,
            };
            let tcand = self.txn_candidate(txns, reader, anchor.as_deref(), forward);

            match (bentry, tcand) {
                (None, None) => return Ok(None),
                (Some((pos, key, record)), None) => {
                    return Ok(Some(MergedHit {
                        key,
                        record,
                        source: HitSource::Btree(pos),
                    }));
                }
                (None, Some((key, resolution))) => match resolution {
                    TxnResolution::Insert(op, record) => {
                        return Ok(Some(MergedHit {
                            key,
                            record,
                            source: HitSource::Txn(op),
                        }));
                    }
                    _ => {
                        anchor = Some(key);
                    }
                },
                (Some((pos, bkey, brecord)), Some((tkey, resolution))) => {
                    let order = (self.cmp)(&bkey, &tkey);
                    let btree_nearer = if forward {
                        order == Ordering::Less
                    } else {
                        order == Ordering::Greater
                    };
                    if order == Ordering::Equal {
                        match resolution {
                            TxnResolution::Insert(op, record) => {
                                // same key on both sides: the txn op is
                                // newer and shadows the btree slot
                                return Ok(Some(MergedHit {
                                    key: tkey,
                                    record,
                                    source: HitSource::Txn(op),
                                }));
                            }
                            _ => {
                                anchor = Some(tkey);
                            }
                        }
                    } else if btree_nearer {
                        return Ok(Some(MergedHit {
                            key: bkey,
                            record: brecord,
                            source: HitSource::Btree(pos),
                        }));
                    } else {
                        match resolution {
                            TxnResolution::Insert(op, record) => {
                                return Ok(Some(MergedHit {
                                    key: tkey,
                                    record,
                                    source: HitSource::Txn(op),
                                }));
                            }
                            _ => {
                                anchor = Some(tkey);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Point or approximate find across both layers.
    pub(crate) fn find(
        &self,
        pager: &Pager,
        txns: &TxnManager,
        reader: Option<TxnId>,
        key: &[u8],
        mode: FindMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        match mode {
            FindMode::Exact => {
                let record = self.lookup(pager, txns, reader, key)?;
                Ok((key.to_vec(), record))
            }
            FindMode::Leq | FindMode::Geq => match self.lookup(pager, txns, reader, key) {
                Ok(record) => Ok((key.to_vec(), record)),
                Err(Error::KeyNotFound) => self.neighbor(pager, txns, reader, key, mode.is_forward()),
                Err(err) => Err(err),
            },
            FindMode::Lt | FindMode::Gt => self.neighbor(pager, txns, reader, key, mode.is_forward()),
        }
    }

    fn neighbor(
        &self,
        pager: &Pager,
        txns: &TxnManager,
        reader: Option<TxnId>,
        key: &[u8],
        forward: bool,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        match self.merged_step(pager, txns, reader, Some(key), forward)? {
            Some(hit) => Ok((hit.key, hit.record)),
            None => Err(Error::KeyNotFound),
        }
    }

    /// Number of keys visible to `reader` across both layers.
    pub(crate) fn key_count(
        &self,
        pager: &Pager,
        txns: &TxnManager,
        reader: Option<TxnId>,
    ) -> Result<u64> {
        let mut count = 0;
        let mut anchor: Option<Vec<u8>> = None;
        while let Some(hit) = self.merged_step(pager, txns, reader, anchor.as_deref(), true)? {
            count += 1;
            anchor = Some(hit.key);
        }
        Ok(count)
    }

    /// Appends an insert op for `txn`; duplicate handling against the
    /// merged view happens here, before the op exists.
    pub(crate) fn insert_op(
        &mut self,
        pager: &Pager,
        txns: &TxnManager,
        txn: TxnId,
        key: &[u8],
        record: &[u8],
        overwrite: bool,
    ) -> Result<OpId> {
        if self.is_present(pager, txns, Some(txn), key)? && !overwrite {
            return Err(Error::DuplicateKey);
        }
        let kind = if overwrite {
            OpKind::InsertOw
        } else {
            OpKind::Insert
        };
        let node = self.optree.get_or_insert(key, self.cmp);
        Ok(self.optree.append_op(node, txn, kind, Some(record.to_vec())))
    }

    /// Appends an erase op for `txn`.
    pub(crate) fn erase_op(
        &mut self,
        pager: &Pager,
        txns: &TxnManager,
        txn: TxnId,
        key: &[u8],
    ) -> Result<OpId> {
        if !self.is_present(pager, txns, Some(txn), key)? {
            return Err(Error::KeyNotFound);
        }
        let node = self.optree.get_or_insert(key, self.cmp);
        Ok(self.optree.append_op(node, txn, OpKind::Erase, None))
    }
}

/// Find flavor; the four approximate-match flags plus exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    Exact,
    Lt,
    Leq,
    Gt,
    Geq,
}

impl FindMode {
    fn is_forward(&self) -> bool {
        matches!(self, FindMode::Gt | FindMode::Geq)
    }
}
