//! # Environment
//!
//! The owning handle for one database file: header page with the database
//! table, pager, transaction manager, cursor registry, and journal. All
//! public operations serialise on the environment lock (single writer;
//! the page cache below keeps its own short-lived mutex).
//!
//! ## Header page
//!
//! Page 0 persists the environment:
//!
//! ```text
//! [ magic "BRW1" | version | page_size | flags | file_mode |
//!   free_head | databases[MAX_ENV_DATABASES] ]
//! ```
//!
//! Each database descriptor carries the name, key configuration, root
//! page and record-number sequence. The in-memory copy is synced back to
//! the page before every changeset flush, so root moves and sequence
//! bumps land atomically with the data they describe.
//!
//! ## Commit-flush
//!
//! Committed transactions drain into the btree strictly in id order:
//! the queue head is flushed while it is finished (committed or aborted),
//! and an active head blocks everything younger, which is what makes the
//! flush a serial schedule. A failed flush leaves the transaction
//! committed and queued; the next flush retries. Applying ops is
//! idempotent (inserts overwrite, erases tolerate absence), so a partial
//! retry converges.

use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::btree::tree::Btree;
use crate::btree::{CompareFn, KeyLayout, RecordLayout};
use crate::config::{
    db_flags, env_flags, insert_flags, txn_flags, CACHE_UNLIMITED, DEFAULT_BINARY_KEY_SIZE,
    DEFAULT_CACHE_CAPACITY, ENV_MAGIC, ENV_VERSION, MAX_ENV_DATABASES, MAX_KEY_SIZE, PAGE_SIZE,
};
use crate::cursor::{ActiveHalf, BtreeHalf, Cursor, CursorId, CursorMove, TxnHalf};
use crate::db::{Database, FindMode, HitSource};
use crate::error::{Error, Result};
use crate::le_accessors;
use crate::log::{Journal, JournalEntry};
use crate::storage::{PageKind, Pager};
use crate::txn::optree::{OpId, OpKind, OpTree};
use crate::txn::{TxnId, TxnManager, TxnState};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawDbDescriptor {
    name: U16,
    key_type: u8,
    flags: u8,
    key_size: U16,
    record_size: U16,
    root_page: U64,
    recno_seq: U64,
}

impl RawDbDescriptor {
    le_accessors! {
        name: u16,
        key_size: u16,
        record_size: u16,
        root_page: u64,
        recno_seq: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct RawEnvHeader {
    magic: [u8; 4],
    version: U32,
    page_size: U32,
    flags: U32,
    file_mode: U32,
    free_head: U64,
    databases: [RawDbDescriptor; MAX_ENV_DATABASES],
}

impl RawEnvHeader {
    le_accessors! {
        version: u32,
        page_size: u32,
        flags: u32,
        file_mode: u32,
        free_head: u64,
    }
}

const _: () = assert!(std::mem::size_of::<RawEnvHeader>() <= PAGE_SIZE - 32);

/// In-memory copy of one database table slot. `name == 0` means free.
#[derive(Debug, Clone, Copy, Default)]
struct DbDescriptor {
    name: u16,
    key_type: u8,
    flags: u8,
    key_size: u16,
    /// Zero for variable-size records, otherwise the fixed width.
    record_size: u16,
    root_page: u64,
    recno_seq: u64,
}

/// Handle to an open database inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbId(pub(crate) u16);

/// Configuration for `create_db`.
#[derive(Clone, Copy)]
pub struct DbConfig {
    pub key_layout: KeyLayout,
    /// `Some(n)` packs fixed-width records straight into the leaf slots.
    pub record_size: Option<u16>,
    pub flags: u32,
    /// Overrides the layout's default comparator.
    pub compare: Option<CompareFn>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            key_layout: KeyLayout::Binary(DEFAULT_BINARY_KEY_SIZE),
            record_size: None,
            flags: 0,
            compare: None,
        }
    }
}

/// Optional environment tuning at create/open time.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvParams {
    pub cache_size: Option<u64>,
    pub page_size: Option<u32>,
}

/// Parameters readable through [`Environment::parameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvParam {
    CacheSize,
    PageSize,
    MaxEnvDatabases,
    Flags,
    FileMode,
    Filename,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Number(u64),
    Text(String),
}

struct EnvInner {
    pager: Pager,
    path: PathBuf,
    flags: u32,
    file_mode: u32,
    descriptors: [DbDescriptor; MAX_ENV_DATABASES],
    dbs: Vec<Option<Database>>,
    txns: TxnManager,
    cursors: HashMap<u64, Cursor>,
    next_cursor_token: u64,
    journal: Option<Journal>,
    closed: bool,
}

pub struct Environment {
    inner: Mutex<EnvInner>,
}

impl Environment {
    /// Creates a new environment file, truncating any existing one.
    pub fn create(path: &Path, flags: u32, mode: u32, params: EnvParams) -> Result<Environment> {
        if flags & !env_flags::ALL != 0 {
            return Err(Error::InvParameter("unknown environment flag"));
        }
        if flags & env_flags::READ_ONLY != 0 {
            return Err(Error::InvParameter("cannot create a read-only environment"));
        }
        if let Some(size) = params.page_size {
            if size as usize != PAGE_SIZE {
                return Err(Error::InvParameter("unsupported page size"));
            }
        }
        let cache = cache_capacity(flags, params);
        let pager = Pager::create(path, mode, cache)?;
        let header = pager.alloc(PageKind::EnvHeader)?;
        debug_assert_eq!(header.read().id(), 0);
        drop(header);

        let journal = open_journal(path, flags)?;
        let mut inner = EnvInner {
            pager,
            path: path.to_path_buf(),
            flags,
            file_mode: mode,
            descriptors: [DbDescriptor::default(); MAX_ENV_DATABASES],
            dbs: (0..MAX_ENV_DATABASES).map(|_| None).collect(),
            txns: TxnManager::new(),
            cursors: HashMap::new(),
            next_cursor_token: 1,
            journal,
            closed: false,
        };
        write_header(&mut inner)?;
        inner.pager.flush_changeset()?;
        inner.pager.sync()?;
        info!(path = %path.display(), "environment created");
        Ok(Environment {
            inner: Mutex::new(inner),
        })
    }

    /// Opens an existing environment file.
    pub fn open(path: &Path, flags: u32, params: EnvParams) -> Result<Environment> {
        if flags & !env_flags::ALL != 0 {
            return Err(Error::InvParameter("unknown environment flag"));
        }
        let read_only = flags & env_flags::READ_ONLY != 0;
        let cache = cache_capacity(flags, params);
        let pager = Pager::open(path, read_only, cache)?;

        let (descriptors, file_mode) = {
            let page = pager.fetch(0)?;
            let guard = page.read();
            let raw = RawEnvHeader::ref_from_bytes(
                &guard.body()[..std::mem::size_of::<RawEnvHeader>()],
            )
            .map_err(|_| Error::Internal("environment header unreadable"))?;
            if raw.magic != ENV_MAGIC {
                return Err(Error::InvParameter("not an environment file"));
            }
            if raw.version() != ENV_VERSION {
                return Err(Error::InvParameter("unsupported file version"));
            }
            if raw.page_size() as usize != PAGE_SIZE {
                return Err(Error::InvParameter("file uses a different page size"));
            }
            pager.set_free_head(raw.free_head());
            let mut descriptors = [DbDescriptor::default(); MAX_ENV_DATABASES];
            for (slot, raw_desc) in raw.databases.iter().enumerate() {
                descriptors[slot] = DbDescriptor {
                    name: raw_desc.name(),
                    key_type: raw_desc.key_type,
                    flags: raw_desc.flags,
                    key_size: raw_desc.key_size(),
                    record_size: raw_desc.record_size(),
                    root_page: raw_desc.root_page(),
                    recno_seq: raw_desc.recno_seq(),
                };
            }
            (descriptors, raw.file_mode())
        };

        let journal = if read_only {
            None
        } else {
            open_journal(path, flags)?
        };
        info!(path = %path.display(), "environment opened");
        Ok(Environment {
            inner: Mutex::new(EnvInner {
                pager,
                path: path.to_path_buf(),
                flags,
                file_mode,
                descriptors,
                dbs: (0..MAX_ENV_DATABASES).map(|_| None).collect(),
                txns: TxnManager::new(),
                cursors: HashMap::new(),
                next_cursor_token: 1,
                journal,
                closed: false,
            }),
        })
    }

    /// Creates a named database and opens it.
    pub fn create_db(&self, name: u16, cfg: DbConfig) -> Result<DbId> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        ensure_writable(&inner)?;
        if name == 0 {
            return Err(Error::InvParameter("database name zero is reserved"));
        }
        if cfg.flags & !db_flags::ALL != 0 {
            return Err(Error::InvParameter("unknown database flag"));
        }
        if inner.descriptors.iter().any(|d| d.name == name) {
            return Err(Error::DatabaseAlreadyExists(name));
        }
        let slot = inner
            .descriptors
            .iter()
            .position(|d| d.name == 0)
            .ok_or(Error::InvParameter("database table is full"))?;

        let layout = if cfg.flags & db_flags::RECORD_NUMBER != 0 {
            KeyLayout::Recno
        } else {
            cfg.key_layout
        };
        if let KeyLayout::Binary(size) = layout {
            if size == 0 || size as usize > MAX_KEY_SIZE {
                return Err(Error::InvParameter("key size out of range"));
            }
        }
        let record_layout = match cfg.record_size {
            Some(0) => return Err(Error::InvParameter("record size zero")),
            Some(size) => RecordLayout::Inline(size),
            None => RecordLayout::Default,
        };
        let cmp = cfg.compare.unwrap_or_else(|| layout.default_compare());

        let btree = Btree::create(&inner.pager, layout, record_layout, cmp)?;
        inner.descriptors[slot] = DbDescriptor {
            name,
            key_type: layout.persisted_type(),
            flags: cfg.flags as u8,
            key_size: layout.key_size() as u16,
            record_size: cfg.record_size.unwrap_or(0),
            root_page: btree.root(),
            recno_seq: 0,
        };
        inner.dbs[slot] = Some(Database {
            name,
            slot: slot as u16,
            layout,
            record_layout,
            cmp,
            btree,
            optree: OpTree::new(),
            recno_seq: 0,
        });
        write_header(&mut inner)?;
        inner.pager.flush_changeset()?;
        debug!(name, slot, "database created");
        Ok(DbId(slot as u16))
    }

    /// Opens a database by name with its persisted configuration.
    pub fn open_db(&self, name: u16) -> Result<DbId> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        let slot = inner
            .descriptors
            .iter()
            .position(|d| d.name == name)
            .ok_or(Error::DatabaseNotFound(name))?;
        if inner.dbs[slot].is_some() {
            return Ok(DbId(slot as u16));
        }
        let desc = inner.descriptors[slot];
        let layout = KeyLayout::from_persisted(desc.key_type, desc.key_size)?;
        let record_layout = if desc.record_size == 0 {
            RecordLayout::Default
        } else {
            RecordLayout::Inline(desc.record_size)
        };
        let cmp = layout.default_compare();
        inner.dbs[slot] = Some(Database {
            name,
            slot: slot as u16,
            layout,
            record_layout,
            cmp,
            btree: Btree::new(desc.root_page, layout, record_layout, cmp),
            optree: OpTree::new(),
            recno_seq: desc.recno_seq,
        });
        Ok(DbId(slot as u16))
    }

    /// Removes a database and frees its pages. The database must not be
    /// open.
    pub fn erase_db(&self, name: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        ensure_writable(&inner)?;
        let slot = inner
            .descriptors
            .iter()
            .position(|d| d.name == name)
            .ok_or(Error::DatabaseNotFound(name))?;
        if inner.dbs[slot].is_some() {
            return Err(Error::InvParameter("database is open"));
        }
        let desc = inner.descriptors[slot];
        let layout = KeyLayout::from_persisted(desc.key_type, desc.key_size)?;
        let record_layout = if desc.record_size == 0 {
            RecordLayout::Default
        } else {
            RecordLayout::Inline(desc.record_size)
        };
        let tree = Btree::new(desc.root_page, layout, record_layout, layout.default_compare());
        tree.free_all(&inner.pager)?;
        inner.descriptors[slot] = DbDescriptor::default();
        write_header(&mut inner)?;
        inner.pager.flush_changeset()?;
        debug!(name, "database erased");
        Ok(())
    }

    /// Renames a database, open or not.
    pub fn rename_db(&self, old: u16, new: u16) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        ensure_writable(&inner)?;
        if new == 0 {
            return Err(Error::InvParameter("database name zero is reserved"));
        }
        if inner.descriptors.iter().any(|d| d.name == new) {
            return Err(Error::DatabaseAlreadyExists(new));
        }
        let slot = inner
            .descriptors
            .iter()
            .position(|d| d.name == old)
            .ok_or(Error::DatabaseNotFound(old))?;
        inner.descriptors[slot].name = new;
        if let Some(db) = inner.dbs[slot].as_mut() {
            db.name = new;
        }
        write_header(&mut inner)?;
        inner.pager.flush_changeset()?;
        Ok(())
    }

    /// Begins a transaction and returns its id.
    pub fn begin(&self, flags: u32) -> Result<TxnId> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        if flags & !txn_flags::ALL != 0 {
            return Err(Error::InvParameter("unknown transaction flag"));
        }
        let read_only = flags & txn_flags::READ_ONLY != 0;
        let id = inner.txns.begin(read_only);
        if !read_only {
            journal_append(&mut inner, JournalEntry::TxnBegin(id))?;
        }
        Ok(id)
    }

    /// Commits a transaction and flushes the committed tail into the
    /// btree.
    pub fn commit(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        inner.txns.commit(txn)?;
        journal_append(&mut inner, JournalEntry::TxnCommit(txn))?;
        flush_committed(&mut inner)
    }

    /// Aborts a transaction; its ops never reach the btree.
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        inner.txns.abort(txn)?;
        journal_append(&mut inner, JournalEntry::TxnAbort(txn))?;
        flush_committed(&mut inner)
    }

    /// Inserts a record; returns the stored key (relevant for
    /// record-number databases, where an empty key is assigned).
    pub fn insert(
        &self,
        db: DbId,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        insert_inner(&mut inner, db, txn, key, record, flags)
    }

    /// Point or approximate lookup; returns the matched key and record.
    pub fn find(
        &self,
        db: DbId,
        txn: Option<TxnId>,
        key: &[u8],
        mode: FindMode,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.lock();
        ensure_open(&inner)?;
        validate_reader(&inner, txn)?;
        let database = db_ref(&inner, db)?;
        let key = database.layout.normalize(key)?;
        database.find(&inner.pager, &inner.txns, txn, &key, mode)
    }

    /// Erases a key.
    pub fn erase(&self, db: DbId, txn: Option<TxnId>, key: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        erase_inner(&mut inner, db, txn, key)
    }

    /// Creates a cursor over a database, optionally bound to a
    /// transaction.
    pub fn cursor_create(&self, db: DbId, txn: Option<TxnId>) -> Result<CursorId> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        db_ref(&inner, db)?;
        if let Some(tid) = txn {
            validate_reader(&inner, Some(tid))?;
            inner.txns.add_cursor_ref(tid)?;
        }
        let token = inner.next_cursor_token;
        inner.next_cursor_token += 1;
        inner.cursors.insert(token, Cursor::new(db.0, txn, token));
        Ok(CursorId(token))
    }

    /// Closes a cursor, releasing its transaction reference and any op
    /// coupling.
    pub fn cursor_close(&self, cursor: CursorId) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        let removed = inner
            .cursors
            .remove(&cursor.0)
            .ok_or(Error::InvParameter("unknown cursor"))?;
        if let Some(op) = removed.coupled_op() {
            if let Some(db) = inner.dbs.get_mut(removed.db as usize).and_then(|d| d.as_mut()) {
                db.optree.unregister_cursor(op, removed.token);
            }
        }
        if let Some(tid) = removed.txn {
            inner.txns.release_cursor_ref(tid);
        }
        Ok(())
    }

    /// Moves the cursor and returns the key/record it lands on.
    pub fn cursor_move(&self, cursor: CursorId, mv: CursorMove) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;

        let (db_slot, txn, anchor, forward) = {
            let cur = inner
                .cursors
                .get(&cursor.0)
                .ok_or(Error::InvParameter("unknown cursor"))?;
            let (anchor, forward) = match mv {
                CursorMove::First => (None, true),
                CursorMove::Last => (None, false),
                CursorMove::Next => (
                    Some(cursor_current_key(&inner.dbs, &inner.pager, cur)?),
                    true,
                ),
                CursorMove::Previous => (
                    Some(cursor_current_key(&inner.dbs, &inner.pager, cur)?),
                    false,
                ),
            };
            (cur.db, cur.txn, anchor, forward)
        };

        let hit = {
            let database = inner
                .dbs
                .get(db_slot as usize)
                .and_then(|d| d.as_ref())
                .ok_or(Error::DatabaseNotFound(db_slot))?;
            database
                .merged_step(&inner.pager, &inner.txns, txn, anchor.as_deref(), forward)?
                .ok_or(Error::KeyNotFound)?
        };

        recouple(&mut inner, cursor.0, db_slot, &hit.source);
        Ok((hit.key, hit.record))
    }

    /// Positions the cursor on an exact key: transaction layer first,
    /// btree as the fallthrough.
    pub fn cursor_find(&self, cursor: CursorId, key: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;

        let (db_slot, txn) = {
            let cur = inner
                .cursors
                .get(&cursor.0)
                .ok_or(Error::InvParameter("unknown cursor"))?;
            (cur.db, cur.txn)
        };
        let (key, outcome) = {
            let database = inner
                .dbs
                .get(db_slot as usize)
                .and_then(|d| d.as_ref())
                .ok_or(Error::DatabaseNotFound(db_slot))?;
            let key = database.layout.normalize(key)?;
            let outcome = cursor_find_resolve(database, &inner.pager, &inner.txns, txn, &key)?;
            (key, outcome)
        };

        match outcome {
            Some((source, record)) => {
                recouple(&mut inner, cursor.0, db_slot, &source);
                Ok((key.to_vec(), record))
            }
            None => Err(Error::KeyNotFound),
        }
    }

    /// Inserts through a cursor; the cursor ends up coupled to the new
    /// entry.
    pub fn cursor_insert(
        &self,
        cursor: CursorId,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        let (db_slot, txn) = {
            let cur = inner
                .cursors
                .get(&cursor.0)
                .ok_or(Error::InvParameter("unknown cursor"))?;
            (cur.db, cur.txn)
        };
        let stored = insert_inner(&mut inner, DbId(db_slot), txn, key, record, flags)?;

        // couple to whichever layer now holds the key
        let source = {
            let database = inner
                .dbs
                .get(db_slot as usize)
                .and_then(|d| d.as_ref())
                .ok_or(Error::DatabaseNotFound(db_slot))?;
            cursor_find_resolve(database, &inner.pager, &inner.txns, txn, &stored)?
                .map(|(source, _)| source)
        };
        if let Some(source) = source {
            recouple(&mut inner, cursor.0, db_slot, &source);
        }
        Ok(stored)
    }

    /// Erases the key under the cursor; the cursor keeps the key as its
    /// anchor so the next move continues from there.
    pub fn cursor_erase(&self, cursor: CursorId) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        let (db_slot, txn, key) = {
            let cur = inner
                .cursors
                .get(&cursor.0)
                .ok_or(Error::InvParameter("unknown cursor"))?;
            if cur.is_nil() {
                return Err(Error::CursorIsNil);
            }
            (
                cur.db,
                cur.txn,
                cursor_current_key(&inner.dbs, &inner.pager, cur)?,
            )
        };
        erase_inner(&mut inner, DbId(db_slot), txn, &key)?;

        uncouple_op(&mut inner, cursor.0, db_slot);
        let cur = inner.cursors.get_mut(&cursor.0).expect("cursor vanished");
        cur.btree = BtreeHalf::Uncoupled(key);
        cur.txn_half = TxnHalf::Nil;
        cur.active = ActiveHalf::Btree;
        Ok(())
    }

    /// The key under the cursor. An uncoupled cursor answers with the
    /// `Internal` retry signal; callers fall back to a fresh find.
    pub fn cursor_key(&self, cursor: CursorId) -> Result<Vec<u8>> {
        self.cursor_entry(cursor).map(|(key, _)| key)
    }

    /// The record under the cursor, same contract as [`cursor_key`].
    ///
    /// [`cursor_key`]: Environment::cursor_key
    pub fn cursor_record(&self, cursor: CursorId) -> Result<Vec<u8>> {
        self.cursor_entry(cursor).map(|(_, record)| record)
    }

    fn cursor_entry(&self, cursor: CursorId) -> Result<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.lock();
        ensure_open(&inner)?;
        let cur = inner
            .cursors
            .get(&cursor.0)
            .ok_or(Error::InvParameter("unknown cursor"))?;
        let database = inner
            .dbs
            .get(cur.db as usize)
            .and_then(|d| d.as_ref())
            .ok_or(Error::DatabaseNotFound(cur.db))?;
        match cur.active {
            ActiveHalf::None => Err(Error::CursorIsNil),
            ActiveHalf::Btree => match &cur.btree {
                BtreeHalf::Coupled(pos) => database
                    .btree
                    .read_pos(&inner.pager, *pos)?
                    .ok_or(Error::Internal("btree coupling went stale")),
                BtreeHalf::Uncoupled(_) => Err(Error::Internal("cursor is uncoupled")),
                BtreeHalf::Nil => Err(Error::CursorIsNil),
            },
            ActiveHalf::Txn => match &cur.txn_half {
                TxnHalf::Coupled(op) => {
                    let key = database
                        .optree
                        .op_key(*op)
                        .ok_or(Error::Internal("op coupling went stale"))?
                        .to_vec();
                    let record = database
                        .optree
                        .op(*op)
                        .and_then(|o| o.record.clone())
                        .unwrap_or_default();
                    Ok((key, record))
                }
                TxnHalf::Uncoupled(_) => Err(Error::Internal("cursor is uncoupled")),
                TxnHalf::Nil => Err(Error::CursorIsNil),
            },
        }
    }

    /// Number of keys visible to the transaction.
    pub fn key_count(&self, db: DbId, txn: Option<TxnId>) -> Result<u64> {
        let inner = self.inner.lock();
        ensure_open(&inner)?;
        validate_reader(&inner, txn)?;
        let database = db_ref(&inner, db)?;
        database.key_count(&inner.pager, &inner.txns, txn)
    }

    /// Verifies the btree's structural invariants.
    pub fn check_integrity(&self, db: DbId) -> Result<()> {
        let inner = self.inner.lock();
        ensure_open(&inner)?;
        let database = db_ref(&inner, db)?;
        database.btree.check_integrity(&inner.pager)
    }

    /// Writes all dirty state to disk and syncs.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        ensure_open(&inner)?;
        write_header(&mut inner)?;
        inner.pager.flush_all()?;
        if let Some(journal) = inner.journal.as_ref() {
            journal.sync()?;
        }
        Ok(())
    }

    /// Reads an environment parameter.
    pub fn parameter(&self, param: EnvParam) -> Result<ParamValue> {
        let inner = self.inner.lock();
        ensure_open(&inner)?;
        Ok(match param {
            EnvParam::CacheSize => ParamValue::Number(inner.pager.cache_capacity()),
            EnvParam::PageSize => ParamValue::Number(PAGE_SIZE as u64),
            EnvParam::MaxEnvDatabases => ParamValue::Number(MAX_ENV_DATABASES as u64),
            EnvParam::Flags => ParamValue::Number(inner.flags as u64),
            EnvParam::FileMode => ParamValue::Number(inner.file_mode as u64),
            EnvParam::Filename => ParamValue::Text(inner.path.display().to_string()),
        })
    }

    /// Flushes and closes the environment. Open cursors block the close;
    /// still-active transactions are aborted. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        if !inner.cursors.is_empty() {
            return Err(Error::CursorStillOpen);
        }
        for id in inner.txns.live_ids() {
            if inner.txns.get(id).map(|t| t.state()) == Some(TxnState::Active) {
                inner.txns.abort(id)?;
                journal_append(&mut inner, JournalEntry::TxnAbort(id))?;
            }
        }
        flush_committed(&mut inner)?;
        write_header(&mut inner)?;
        inner.pager.flush_all()?;
        if let Some(journal) = inner.journal.as_ref() {
            journal.sync()?;
        }
        inner.closed = true;
        info!(path = %inner.path.display(), "environment closed");
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        // best effort: drop cursor registrations, abort, flush
        inner.cursors.clear();
        for id in inner.txns.live_ids() {
            if inner.txns.get(id).map(|t| t.state()) == Some(TxnState::Active) {
                let _ = inner.txns.abort(id);
            }
        }
        let _ = flush_committed(&mut inner);
        let _ = write_header(&mut inner);
        let _ = inner.pager.flush_all();
        inner.closed = true;
    }
}

fn cache_capacity(flags: u32, params: EnvParams) -> u64 {
    if flags & env_flags::CACHE_UNLIMITED != 0 {
        CACHE_UNLIMITED
    } else {
        params.cache_size.unwrap_or(DEFAULT_CACHE_CAPACITY)
    }
}

fn open_journal(path: &Path, flags: u32) -> Result<Option<Journal>> {
    if flags & env_flags::DISABLE_JOURNAL != 0 {
        return Ok(None);
    }
    let mut journal_path = path.as_os_str().to_os_string();
    journal_path.push(".jrn");
    Ok(Some(Journal::open(Path::new(&journal_path))?))
}

fn ensure_open(inner: &EnvInner) -> Result<()> {
    if inner.closed {
        return Err(Error::InvParameter("environment is closed"));
    }
    Ok(())
}

fn ensure_writable(inner: &EnvInner) -> Result<()> {
    if inner.flags & env_flags::READ_ONLY != 0 {
        return Err(Error::InvParameter("environment is read-only"));
    }
    Ok(())
}

fn db_ref<'a>(inner: &'a EnvInner, db: DbId) -> Result<&'a Database> {
    inner
        .dbs
        .get(db.0 as usize)
        .and_then(|d| d.as_ref())
        .ok_or(Error::DatabaseNotFound(db.0))
}

fn validate_reader(inner: &EnvInner, txn: Option<TxnId>) -> Result<()> {
    if let Some(id) = txn {
        let txn = inner
            .txns
            .get(id)
            .ok_or(Error::InvParameter("unknown transaction"))?;
        if txn.state() != TxnState::Active {
            return Err(Error::InvParameter("transaction is already finished"));
        }
    }
    Ok(())
}

fn validate_writer(inner: &EnvInner, txn: Option<TxnId>) -> Result<()> {
    validate_reader(inner, txn)?;
    if let Some(id) = txn {
        if inner.txns.get(id).map(|t| t.is_read_only()) == Some(true) {
            return Err(Error::InvParameter("transaction is read-only"));
        }
    }
    Ok(())
}

fn journal_append(inner: &mut EnvInner, entry: JournalEntry) -> Result<()> {
    if let Some(journal) = inner.journal.as_mut() {
        journal.append(entry)?;
    }
    Ok(())
}

/// Validates and normalizes an insert key, assigning record numbers.
fn normalize_insert_key(db: &mut Database, key: &[u8]) -> Result<Vec<u8>> {
    if db.layout == KeyLayout::Recno {
        if key.is_empty() {
            db.recno_seq += 1;
            return Ok(db.recno_seq.to_le_bytes().to_vec());
        }
        let key = db.layout.normalize(key)?;
        let value = u64::from_le_bytes(key[..8].try_into().expect("recno key width"));
        if value > db.recno_seq {
            db.recno_seq = value;
        }
        return Ok(key.to_vec());
    }
    if key.is_empty() {
        return Err(Error::InvParameter("empty key"));
    }
    Ok(db.layout.normalize(key)?.to_vec())
}

fn insert_inner(
    inner: &mut EnvInner,
    db: DbId,
    txn: Option<TxnId>,
    key: &[u8],
    record: &[u8],
    flags: u32,
) -> Result<Vec<u8>> {
    ensure_writable(inner)?;
    if flags & !insert_flags::ALL != 0 {
        return Err(Error::InvParameter("unknown insert flag"));
    }
    if flags & insert_flags::DUPLICATE != 0 {
        return Err(Error::NotImplemented);
    }
    validate_writer(inner, txn)?;
    let overwrite = flags & insert_flags::OVERWRITE != 0;
    let slot = db.0 as usize;

    let key = {
        let database = inner
            .dbs
            .get_mut(slot)
            .and_then(|d| d.as_mut())
            .ok_or(Error::DatabaseNotFound(db.0))?;
        normalize_insert_key(database, key)?
    };

    match txn {
        Some(tid) => {
            let op = {
                let database = inner
                    .dbs
                    .get_mut(slot)
                    .and_then(|d| d.as_mut())
                    .ok_or(Error::DatabaseNotFound(db.0))?;
                database.insert_op(&inner.pager, &inner.txns, tid, &key, record, overwrite)?
            };
            inner
                .txns
                .get_mut(tid)
                .expect("validated transaction vanished")
                .push_op(db.0, op);
            Ok(key)
        }
        None => {
            let tid = inner.txns.begin(false);
            journal_append(inner, JournalEntry::TxnBegin(tid))?;
            let result = {
                let database = inner
                    .dbs
                    .get_mut(slot)
                    .and_then(|d| d.as_mut())
                    .ok_or(Error::DatabaseNotFound(db.0))?;
                database.insert_op(&inner.pager, &inner.txns, tid, &key, record, overwrite)
            };
            match result {
                Ok(op) => {
                    inner
                        .txns
                        .get_mut(tid)
                        .expect("autocommit transaction vanished")
                        .push_op(db.0, op);
                    inner.txns.commit(tid)?;
                    journal_append(inner, JournalEntry::TxnCommit(tid))?;
                    flush_committed(inner)?;
                    Ok(key)
                }
                Err(err) => {
                    inner.txns.abort(tid)?;
                    journal_append(inner, JournalEntry::TxnAbort(tid))?;
                    flush_committed(inner)?;
                    Err(err)
                }
            }
        }
    }
}

fn erase_inner(inner: &mut EnvInner, db: DbId, txn: Option<TxnId>, key: &[u8]) -> Result<()> {
    ensure_writable(inner)?;
    validate_writer(inner, txn)?;
    let slot = db.0 as usize;
    let key = {
        let database = inner
            .dbs
            .get(slot)
            .and_then(|d| d.as_ref())
            .ok_or(Error::DatabaseNotFound(db.0))?;
        database.layout.normalize(key)?.to_vec()
    };

    match txn {
        Some(tid) => {
            let op = {
                let database = inner
                    .dbs
                    .get_mut(slot)
                    .and_then(|d| d.as_mut())
                    .ok_or(Error::DatabaseNotFound(db.0))?;
                database.erase_op(&inner.pager, &inner.txns, tid, &key)?
            };
            inner
                .txns
                .get_mut(tid)
                .expect("validated transaction vanished")
                .push_op(db.0, op);
            Ok(())
        }
        None => {
            let tid = inner.txns.begin(false);
            journal_append(inner, JournalEntry::TxnBegin(tid))?;
            let result = {
                let database = inner
                    .dbs
                    .get_mut(slot)
                    .and_then(|d| d.as_mut())
                    .ok_or(Error::DatabaseNotFound(db.0))?;
                database.erase_op(&inner.pager, &inner.txns, tid, &key)
            };
            match result {
                Ok(op) => {
                    inner
                        .txns
                        .get_mut(tid)
                        .expect("autocommit transaction vanished")
                        .push_op(db.0, op);
                    inner.txns.commit(tid)?;
                    journal_append(inner, JournalEntry::TxnCommit(tid))?;
                    flush_committed(inner)
                }
                Err(err) => {
                    inner.txns.abort(tid)?;
                    journal_append(inner, JournalEntry::TxnAbort(tid))?;
                    flush_committed(inner)?;
                    Err(err)
                }
            }
        }
    }
}

/// Resolves an exact key for cursor coupling: transaction layer first,
/// btree fallthrough. `None` means not found.
fn cursor_find_resolve(
    database: &Database,
    pager: &Pager,
    txns: &TxnManager,
    reader: Option<TxnId>,
    key: &[u8],
) -> Result<Option<(HitSource, Vec<u8>)>> {
    use crate::db::TxnResolution;

    if let Some(node) = database.optree.get(key, database.cmp) {
        match database.resolve_node(txns, reader, node) {
            TxnResolution::Insert(op, record) => {
                return Ok(Some((HitSource::Txn(op), record)));
            }
            TxnResolution::Erased => return Ok(None),
            TxnResolution::None => {}
        }
    }
    match database.btree.locate(pager, key)? {
        Some(pos) => {
            let (_, record) = database
                .btree
                .read_pos(pager, pos)?
                .ok_or(Error::Internal("located slot went stale"))?;
            Ok(Some((HitSource::Btree(pos), record)))
        }
        None => Ok(None),
    }
}

/// The key a cursor currently stands on, from whichever half is active.
fn cursor_current_key(
    dbs: &[Option<Database>],
    pager: &Pager,
    cursor: &Cursor,
) -> Result<Vec<u8>> {
    let database = dbs
        .get(cursor.db as usize)
        .and_then(|d| d.as_ref())
        .ok_or(Error::DatabaseNotFound(cursor.db))?;
    match cursor.active {
        ActiveHalf::None => Err(Error::CursorIsNil),
        ActiveHalf::Btree => match &cursor.btree {
            BtreeHalf::Coupled(pos) => database
                .btree
                .read_pos(pager, *pos)?
                .map(|(key, _)| key)
                .ok_or(Error::Internal("btree coupling went stale")),
            BtreeHalf::Uncoupled(key) => Ok(key.clone()),
            BtreeHalf::Nil => Err(Error::CursorIsNil),
        },
        ActiveHalf::Txn => match &cursor.txn_half {
            TxnHalf::Coupled(op) => database
                .optree
                .op_key(*op)
                .map(|key| key.to_vec())
                .ok_or(Error::Internal("op coupling went stale")),
            TxnHalf::Uncoupled(key) => Ok(key.clone()),
            TxnHalf::Nil => Err(Error::CursorIsNil),
        },
    }
}

/// Releases the cursor's old op registration (if any) and couples it to
/// a merged hit.
fn recouple(inner: &mut EnvInner, token: u64, db_slot: u16, source: &HitSource) {
    uncouple_op(inner, token, db_slot);
    match source {
        HitSource::Btree(pos) => {
            if let Some(cursor) = inner.cursors.get_mut(&token) {
                cursor.couple_to_btree(*pos);
            }
        }
        HitSource::Txn(op) => {
            if let Some(db) = inner.dbs.get_mut(db_slot as usize).and_then(|d| d.as_mut()) {
                db.optree.register_cursor(*op, token);
            }
            if let Some(cursor) = inner.cursors.get_mut(&token) {
                cursor.couple_to_txn(*op);
            }
        }
    }
}

fn uncouple_op(inner: &mut EnvInner, token: u64, db_slot: u16) {
    let old_op = inner.cursors.get(&token).and_then(|c| c.coupled_op());
    if let Some(op) = old_op {
        if let Some(db) = inner.dbs.get_mut(db_slot as usize).and_then(|d| d.as_mut()) {
            db.optree.unregister_cursor(op, token);
        }
    }
}

/// Uncouples every btree-coupled cursor into the key-copy state; called
/// before the commit-flush mutates the tree underneath them.
fn uncouple_btree_cursors(inner: &mut EnvInner) -> Result<()> {
    let mut updates: Vec<(u64, Option<Vec<u8>>)> = Vec::new();
    for (token, cursor) in inner.cursors.iter() {
        if let BtreeHalf::Coupled(pos) = cursor.btree {
            let key = match inner.dbs.get(cursor.db as usize).and_then(|d| d.as_ref()) {
                Some(db) => db.btree.read_pos(&inner.pager, pos)?.map(|(key, _)| key),
                None => None,
            };
            updates.push((*token, key));
        }
    }
    for (token, key) in updates {
        let cursor = inner.cursors.get_mut(&token).expect("cursor vanished");
        match key {
            Some(key) => cursor.uncouple_btree(key),
            None => cursor.set_nil(),
        }
    }
    Ok(())
}

/// Syncs the in-memory header (descriptors, freelist head) into page 0.
fn write_header(inner: &mut EnvInner) -> Result<()> {
    for db in inner.dbs.iter().flatten() {
        let desc = &mut inner.descriptors[db.slot as usize];
        desc.root_page = db.btree.root();
        desc.recno_seq = db.recno_seq;
    }

    let page = inner.pager.fetch(0)?;
    inner.pager.mark_dirty(&page);
    let mut guard = page.write();
    let body = guard.body_mut();
    let raw =
        RawEnvHeader::mut_from_bytes(&mut body[..std::mem::size_of::<RawEnvHeader>()])
            .map_err(|_| Error::Internal("environment header unreadable"))?;
    raw.magic = ENV_MAGIC;
    raw.set_version(ENV_VERSION);
    raw.set_page_size(PAGE_SIZE as u32);
    raw.set_flags(inner.flags);
    raw.set_file_mode(inner.file_mode);
    raw.set_free_head(inner.pager.free_head());
    for (slot, desc) in inner.descriptors.iter().enumerate() {
        let raw_desc = &mut raw.databases[slot];
        raw_desc.set_name(desc.name);
        raw_desc.key_type = desc.key_type;
        raw_desc.flags = desc.flags;
        raw_desc.set_key_size(desc.key_size);
        raw_desc.set_record_size(desc.record_size);
        raw_desc.set_root_page(desc.root_page);
        raw_desc.set_recno_seq(desc.recno_seq);
    }
    Ok(())
}

/// Drains the finished head of the transaction queue into the btree, in
/// id order. Stops at the first still-active transaction.
fn flush_committed(inner: &mut EnvInner) -> Result<()> {
    loop {
        let (txn_id, state) = match inner.txns.oldest() {
            None => return Ok(()),
            Some(txn) => (txn.id(), txn.state()),
        };
        match state {
            TxnState::Active => return Ok(()),
            TxnState::Aborted => {
                let txn = inner.txns.pop_oldest().expect("queue head vanished");
                detach_ops(inner, txn.ops());
                debug!(txn = txn_id, "dropped aborted transaction");
            }
            TxnState::Committed => {
                uncouple_btree_cursors(inner)?;
                let ops: Vec<(u16, OpId)> = inner
                    .txns
                    .oldest()
                    .map(|txn| txn.ops().to_vec())
                    .unwrap_or_default();
                debug!(txn = txn_id, ops = ops.len(), "flushing committed transaction");

                for (slot, op) in &ops {
                    let database = match inner.dbs.get_mut(*slot as usize).and_then(|d| d.as_mut())
                    {
                        Some(db) => db,
                        None => continue,
                    };
                    let (kind, record) = match database.optree.op(*op) {
                        Some(op) => (op.kind, op.record.clone()),
                        None => continue,
                    };
                    let key = match database.optree.op_key(*op) {
                        Some(key) => key.to_vec(),
                        None => continue,
                    };
                    match kind {
                        OpKind::Insert | OpKind::InsertOw => {
                            database.btree.insert(
                                &inner.pager,
                                &key,
                                record.as_deref().unwrap_or_default(),
                                true,
                            )?;
                        }
                        OpKind::Erase => match database.btree.erase(&inner.pager, &key) {
                            Ok(()) | Err(Error::KeyNotFound) => {}
                            Err(err) => return Err(err),
                        },
                        OpKind::Nop => {}
                    }
                }

                write_header(inner)?;
                inner.pager.flush_changeset()?;

                let txn = inner.txns.pop_oldest().expect("queue head vanished");
                detach_ops(inner, txn.ops());
            }
        }
    }
}

/// Removes a transaction's ops from the op-trees, uncoupling any cursors
/// that were riding on them.
fn detach_ops(inner: &mut EnvInner, ops: &[(u16, OpId)]) {
    for (slot, op) in ops {
        let database = match inner.dbs.get_mut(*slot as usize).and_then(|d| d.as_mut()) {
            Some(db) => db,
            None => continue,
        };
        let key = database.optree.op_key(*op).map(|key| key.to_vec());
        for token in database.optree.op_cursors(*op) {
            database.optree.unregister_cursor(*op, token);
            if let Some(cursor) = inner.cursors.get_mut(&token) {
                if cursor.txn_half == TxnHalf::Coupled(*op) {
                    cursor.uncouple_txn(key.clone().unwrap_or_default());
                }
            }
        }
        database.optree.remove_op(*op);
    }
}
