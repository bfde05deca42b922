//! # Key Packing
//!
//! Keys in a btree node are a flat array of fixed-width slots. How those
//! slots are filled and compared is the *key list* capability: POD numerics
//! are stored little-endian and compared as numbers, fixed binary keys are
//! stored zero-padded and compared bytewise. The set is closed, so the
//! variants are dispatched statically (see `with_key_list!` in the parent
//! module).
//!
//! All keys entering the btree or the transaction op-tree are first
//! *normalized* by [`KeyLayout::normalize`]: POD keys must be exactly their
//! width, binary keys are zero-padded to the configured width. This keeps
//! one comparator consistent across both layers, which the merged cursor
//! depends on.

use std::cmp::Ordering;
use std::marker::PhantomData;

use smallvec::SmallVec;

use crate::config::{DEFAULT_BINARY_KEY_SIZE, MAX_KEY_SIZE, POD_LINEAR_THRESHOLD};
use crate::error::{Error, Result};

/// A comparator over two normalized keys. Must define a strict total
/// order; ties resolve to the lowest matching slot inside a node.
pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// A normalized key, inline up to 32 bytes.
pub type KeyBuf = SmallVec<[u8; 32]>;

/// How a database packs and orders its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLayout {
    /// 32-bit little-endian unsigned integers.
    U32,
    /// 64-bit little-endian unsigned integers.
    U64,
    /// Fixed-width binary, zero-padded.
    Binary(u16),
    /// Engine-assigned 64-bit record numbers (stored as `U64`).
    Recno,
}

impl KeyLayout {
    pub fn from_persisted(key_type: u8, key_size: u16) -> Result<Self> {
        match key_type {
            0x01 => Ok(KeyLayout::U32),
            0x02 => Ok(KeyLayout::U64),
            0x03 => Ok(KeyLayout::Binary(key_size)),
            0x04 => Ok(KeyLayout::Recno),
            _ => Err(Error::Internal("unknown key type in database descriptor")),
        }
    }

    pub fn persisted_type(&self) -> u8 {
        match self {
            KeyLayout::U32 => 0x01,
            KeyLayout::U64 => 0x02,
            KeyLayout::Binary(_) => 0x03,
            KeyLayout::Recno => 0x04,
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            KeyLayout::U32 => 4,
            KeyLayout::U64 | KeyLayout::Recno => 8,
            KeyLayout::Binary(size) => *size as usize,
        }
    }

    /// Validates a user key and pads it to the slot width.
    pub fn normalize(&self, key: &[u8]) -> Result<KeyBuf> {
        let width = self.key_size();
        match self {
            KeyLayout::U32 | KeyLayout::U64 | KeyLayout::Recno => {
                if key.len() != width {
                    return Err(Error::InvParameter("numeric key has the wrong width"));
                }
                Ok(KeyBuf::from_slice(key))
            }
            KeyLayout::Binary(_) => {
                if key.len() > width {
                    return Err(Error::KeyTooLarge {
                        size: key.len(),
                        limit: width,
                    });
                }
                let mut buf = KeyBuf::from_slice(key);
                buf.resize(width, 0);
                Ok(buf)
            }
        }
    }

    /// The default comparator for this layout.
    pub fn default_compare(&self) -> CompareFn {
        match self {
            KeyLayout::U32 => compare_u32,
            KeyLayout::U64 | KeyLayout::Recno => compare_u64,
            KeyLayout::Binary(_) => compare_binary,
        }
    }
}

fn compare_u32(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let l = u32::from_le_bytes(lhs.try_into().unwrap_or([0; 4]));
    let r = u32::from_le_bytes(rhs.try_into().unwrap_or([0; 4]));
    l.cmp(&r)
}

fn compare_u64(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let l = u64::from_le_bytes(lhs.try_into().unwrap_or([0; 8]));
    let r = u64::from_le_bytes(rhs.try_into().unwrap_or([0; 8]));
    l.cmp(&r)
}

fn compare_binary(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

/// The key-packing capability a node layout is generic over.
pub trait KeyList: Copy {
    fn key_size(&self) -> usize;

    /// Window below which the node search degrades to a linear scan.
    /// Zero disables the fallback.
    fn linear_threshold(&self) -> usize;

    fn key_at<'a>(&self, keys: &'a [u8], slot: usize) -> &'a [u8] {
        let width = self.key_size();
        &keys[slot * width..(slot + 1) * width]
    }

    fn set_key(&self, keys: &mut [u8], slot: usize, key: &[u8]) {
        let width = self.key_size();
        debug_assert_eq!(key.len(), width, "keys must be normalized before packing");
        keys[slot * width..(slot + 1) * width].copy_from_slice(key);
    }
}

/// Marker for the integer widths `PodKeyList` supports.
pub trait PodKey: Copy {
    const WIDTH: usize;
}

impl PodKey for u32 {
    const WIDTH: usize = 4;
}

impl PodKey for u64 {
    const WIDTH: usize = 8;
}

/// Array of fixed POD integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct PodKeyList<T: PodKey>(PhantomData<T>);

impl<T: PodKey> KeyList for PodKeyList<T> {
    fn key_size(&self) -> usize {
        T::WIDTH
    }

    fn linear_threshold(&self) -> usize {
        POD_LINEAR_THRESHOLD
    }
}

/// Array of fixed-width byte blobs.
#[derive(Debug, Clone, Copy)]
pub struct BinaryKeyList {
    key_size: usize,
}

impl BinaryKeyList {
    pub fn new(key_size: usize) -> Self {
        debug_assert!(key_size > 0 && key_size <= MAX_KEY_SIZE);
        Self { key_size }
    }
}

impl Default for BinaryKeyList {
    fn default() -> Self {
        Self::new(DEFAULT_BINARY_KEY_SIZE as usize)
    }
}

impl KeyList for BinaryKeyList {
    fn key_size(&self) -> usize {
        self.key_size
    }

    fn linear_threshold(&self) -> usize {
        0
    }
}
