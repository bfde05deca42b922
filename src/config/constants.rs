//! # Engine Constants
//!
//! All sizing and layout constants in one place. The page layout values are
//! load-bearing for the on-disk format: changing any of them invalidates
//! existing files, so they are tied together with compile-time assertions.
//!
//! ```text
//! PAGE_SIZE (16384)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32, persistent header on every page)
//!       ├─> PAGE_USABLE_SIZE (derived)
//!       └─> NODE_HEADER_SIZE (16, btree node header after the
//!           persistent header)
//!
//! DEFAULT_CACHE_CAPACITY (2 MiB)
//!       │
//!       └─> must hold at least PURGE_AT_LEAST + a working set of pinned
//!           pages, i.e. >> PURGE_AT_LEAST * PAGE_SIZE / 8
//! ```

/// Fixed page size. The file header records it; opening a file written
/// with a different size fails.
pub const PAGE_SIZE: usize = 16384;

/// Size of the persistent header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Bytes available to the page body.
pub const PAGE_USABLE_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Size of the btree node header stored at the start of a btree page body.
pub const NODE_HEADER_SIZE: usize = 16;

/// Magic bytes at offset 0 of the environment header page.
pub const ENV_MAGIC: [u8; 4] = *b"BRW1";

/// On-disk format version.
pub const ENV_VERSION: u32 = 1;

/// Number of database descriptor slots in the environment header page.
pub const MAX_ENV_DATABASES: usize = 16;

/// Default page cache capacity in bytes.
pub const DEFAULT_CACHE_CAPACITY: u64 = 2 * 1024 * 1024;

/// Sentinel capacity that disables eviction entirely.
pub const CACHE_UNLIMITED: u64 = u64::MAX;

/// Number of hash buckets in the page cache. Chosen prime-ish because ids
/// are reduced with a plain modulo.
pub const CACHE_BUCKET_COUNT: usize = 10317;

/// Lower bound of victims a purge run tries to free once it is triggered.
pub const PURGE_AT_LEAST: usize = 20;

/// A btree node with `count` at or below this threshold is merged into a
/// sibling.
pub const MERGE_THRESHOLD: usize = 3;

/// Records at or below this size are stored inline in the 8-byte record
/// slot instead of a blob.
pub const MAX_INLINE_RECORD_SIZE: usize = 8;

/// Binary search switches to linear scan below this window for POD key
/// layouts. Zero disables the fallback (fixed binary keys).
pub const POD_LINEAR_THRESHOLD: usize = 8;

/// Hard upper bound on configurable key widths. Keeps node fan-out sane:
/// even at the limit a node still holds a handful of slots.
pub const MAX_KEY_SIZE: usize = 1024;

/// Default key width for fixed-binary databases when the caller does not
/// configure one.
pub const DEFAULT_BINARY_KEY_SIZE: u16 = 16;

const _: () = assert!(
    PAGE_USABLE_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE,
    "PAGE_USABLE_SIZE must be derived from PAGE_SIZE"
);

const _: () = assert!(
    (PAGE_USABLE_SIZE - NODE_HEADER_SIZE) / (MAX_KEY_SIZE + 1 + 8) >= 4,
    "a btree node must hold at least four slots at the maximum key width"
);

const _: () = assert!(
    DEFAULT_CACHE_CAPACITY as usize >= 8 * PURGE_AT_LEAST * PAGE_SIZE / 2,
    "default cache capacity too small for the purge lower bound"
);

/// Environment open/create flags.
pub mod env_flags {
    /// Open the file read-only; writes and transactions are rejected.
    pub const READ_ONLY: u32 = 0x0001;

    /// Disable cache eviction (capacity becomes the all-ones sentinel).
    pub const CACHE_UNLIMITED: u32 = 0x0002;

    /// Do not keep a journal file next to the database.
    pub const DISABLE_JOURNAL: u32 = 0x0004;

    pub const ALL: u32 = READ_ONLY | CACHE_UNLIMITED | DISABLE_JOURNAL;
}

/// Database create flags.
pub mod db_flags {
    /// Keys are engine-assigned 64-bit record numbers.
    pub const RECORD_NUMBER: u32 = 0x0001;

    pub const ALL: u32 = RECORD_NUMBER;
}

/// Insert flags.
pub mod insert_flags {
    /// Replace the record if the key exists.
    pub const OVERWRITE: u32 = 0x0001;

    /// Keep multiple records per key. Reserved; rejected in this build.
    pub const DUPLICATE: u32 = 0x0002;

    pub const ALL: u32 = OVERWRITE | DUPLICATE;
}

/// Transaction begin flags.
pub mod txn_flags {
    /// The transaction will not write; inserts and erases under it fail.
    pub const READ_ONLY: u32 = 0x0001;

    pub const ALL: u32 = READ_ONLY;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_layout_leaves_room_for_pax_block() {
        assert!(PAGE_USABLE_SIZE > NODE_HEADER_SIZE + MAX_KEY_SIZE + 1 + 8);
    }

    #[test]
    fn bucket_count_not_a_power_of_two() {
        assert_ne!(CACHE_BUCKET_COUNT & (CACHE_BUCKET_COUNT - 1), 0);
    }
}
