//! # burrowdb: Embedded Ordered Key/Value Storage
//!
//! burrowdb is an embedded, single-file storage engine: a disk-resident
//! B-tree with PAX-layout nodes, multi-version transactions layered on an
//! in-memory op-tree, a unified cursor that merges both views, and a page
//! cache with hash-bucket lookup and LRU eviction underneath.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::{DbConfig, Environment, EnvParams, FindMode};
//!
//! let env = Environment::create(path, 0, 0o644, EnvParams::default())?;
//! let db = env.create_db(1, DbConfig::default())?;
//!
//! env.insert(db, None, b"hello", b"world", 0)?;
//! let (_, record) = env.find(db, None, b"hello", FindMode::Exact)?;
//!
//! let txn = env.begin(0)?;
//! env.insert(db, Some(txn), b"pending", b"not on disk yet", 0)?;
//! env.commit(txn)?;   // now it is
//! env.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Environment (handles, txn queue)      │
//! ├──────────────────────────────────────────────┤
//! │   Coordinator: merged find / insert / erase  │
//! ├───────────────────────┬──────────────────────┤
//! │  Txn Op-Tree overlay  │    Unified Cursor    │
//! ├───────────────────────┴──────────────────────┤
//! │        B-Tree (PAX nodes, blobs)             │
//! ├──────────────────────────────────────────────┤
//! │     Pager + Page Cache + Changeset           │
//! ├──────────────────────────────────────────────┤
//! │        Single file, 16 KiB pages             │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Reads consult the transaction overlay first and fall through to the
//! btree; writes only ever append ops, which the commit-flush drains to
//! disk in transaction-id order. The journal next to the database file
//! records transaction boundaries.
//!
//! ## Module Overview
//!
//! - [`storage`]: paged file, page cache, changeset, pager
//! - [`btree`]: PAX node layout, key/record packing, tree operations
//! - [`txn`]: transaction manager and the op-tree overlay
//! - [`cursor`]: the unified cursor state machine
//! - [`env`]: environment, database table, commit-flush
//! - [`log`]: transaction journal

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod cursor;
pub mod db;
pub mod env;
pub mod error;
pub mod log;
pub mod storage;
pub mod txn;

pub use btree::{KeyLayout, RecordLayout};
pub use config::{db_flags, env_flags, insert_flags, txn_flags};
pub use cursor::{CursorId, CursorMove};
pub use db::FindMode;
pub use env::{DbConfig, DbId, EnvParam, EnvParams, Environment, ParamValue};
pub use error::{Error, Result};
pub use txn::TxnId;
