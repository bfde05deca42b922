//! # B-Tree Module
//!
//! The disk-resident half of the engine: PAX-layout nodes over pages, the
//! tree operations that keep them balanced, and blob storage for records
//! that do not fit a slot.
//!
//! - [`keys`]: key-packing capability (`PodKeyList`, `BinaryKeyList`) and
//!   the per-database [`keys::KeyLayout`] with its comparator;
//! - [`records`]: record-packing capability (inline size classes, blob and
//!   child ids) and the persisted slot flag bits;
//! - [`node`]: the PAX node layout and slot operations;
//! - [`blob`]: chained blob pages for oversized records;
//! - [`tree`]: descent, split, merge, approximate seeks, integrity.

pub mod blob;
pub mod keys;
pub mod node;
pub mod records;
pub mod tree;

pub use keys::{CompareFn, KeyLayout};
pub use records::RecordLayout;
pub use tree::{Btree, SeekBias, SlotRef};
