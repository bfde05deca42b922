//! # Record Packing
//!
//! Every slot in a btree node carries an 8-byte record field plus one flags
//! byte. How the pair is interpreted is the *record list* capability:
//!
//! - **Default** (leaves): the field holds the record inline when it fits,
//!   otherwise a blob id. The flags byte discriminates:
//!   - `BLOB_SIZE_EMPTY`: zero-length record;
//!   - `BLOB_SIZE_TINY`: up to 7 bytes inline, length in the highest byte
//!     of the field;
//!   - `BLOB_SIZE_SMALL`: exactly 8 bytes inline;
//!   - none of the above: the field is a blob id (a file offset).
//! - **Internal**: the field is always a child page id.
//! - **Inline**: fixed-width records packed directly in the slot area; the
//!   flags byte is unused. Width comes from the database configuration.
//!
//! The flag bits are persisted in node pages; their values are part of the
//! file format and must not be renumbered. `DUPLICATES` is reserved: the
//! bit is kept stable on disk but duplicate records are not implemented in
//! this build.

use crate::error::{Error, Result};

pub const BLOB_SIZE_EMPTY: u8 = 0x01;
pub const BLOB_SIZE_TINY: u8 = 0x02;
pub const BLOB_SIZE_SMALL: u8 = 0x04;
pub const DUPLICATES: u8 = 0x08;

const INLINE_MASK: u8 = BLOB_SIZE_EMPTY | BLOB_SIZE_TINY | BLOB_SIZE_SMALL;

/// How a node interprets its record slots. The set is closed; dispatch is
/// a match on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Leaf slots: inline record or blob id, discriminated by flags.
    Default,
    /// Internal slots: child page id.
    Internal,
    /// Leaf slots holding fixed-width records verbatim.
    Inline(u16),
}

impl RecordLayout {
    pub fn record_size(&self) -> usize {
        match self {
            RecordLayout::Default | RecordLayout::Internal => 8,
            RecordLayout::Inline(size) => *size as usize,
        }
    }
}

pub fn is_record_inline(flags: u8) -> bool {
    flags & INLINE_MASK != 0
}

/// Size of an inline record. Caller must have checked [`is_record_inline`].
pub fn inline_record_size(slot: &[u8], flags: u8) -> usize {
    if flags & BLOB_SIZE_TINY != 0 {
        slot[7] as usize
    } else if flags & BLOB_SIZE_SMALL != 0 {
        8
    } else {
        debug_assert!(flags & BLOB_SIZE_EMPTY != 0);
        0
    }
}

pub fn inline_record<'a>(slot: &'a [u8], flags: u8) -> &'a [u8] {
    &slot[..inline_record_size(slot, flags)]
}

/// Stores a record of at most 8 bytes inline and returns the new flags.
pub fn set_inline_record(slot: &mut [u8], flags: u8, data: &[u8]) -> Result<u8> {
    let flags = flags & !INLINE_MASK;
    match data.len() {
        0 => {
            slot.fill(0);
            Ok(flags | BLOB_SIZE_EMPTY)
        }
        len @ 1..=7 => {
            slot.fill(0);
            slot[..len].copy_from_slice(data);
            // the highest byte of the record field doubles as the length
            slot[7] = len as u8;
            Ok(flags | BLOB_SIZE_TINY)
        }
        8 => {
            slot.copy_from_slice(data);
            Ok(flags | BLOB_SIZE_SMALL)
        }
        _ => Err(Error::Internal("inline record larger than a record slot")),
    }
}

/// Clears the inline bits and zeroes the field.
pub fn remove_inline_record(slot: &mut [u8], flags: u8) -> u8 {
    slot.fill(0);
    flags & !INLINE_MASK
}

/// Clears the inline size-class bits only; the field is about to hold an
/// id.
pub fn clear_inline_flags(flags: u8) -> u8 {
    flags & !INLINE_MASK
}

/// Reads the record field as an id (blob offset or child page id).
pub fn record_id(slot: &[u8]) -> u64 {
    u64::from_le_bytes(slot[..8].try_into().expect("record slot shorter than 8"))
}

/// Stores an id, clearing any inline bits the caller held.
pub fn set_record_id(slot: &mut [u8], id: u64) {
    slot[..8].copy_from_slice(&id.to_le_bytes());
}
