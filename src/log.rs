//! # Journal
//!
//! Append-only transaction journal kept next to the database file. The
//! engine treats it purely as a sink: begin/commit/abort marks are
//! appended (unless the environment is read-only or journaling is
//! disabled) and synced with the environment flush. Replay belongs to an
//! outer recovery layer; here the reader exists for verification.
//!
//! Frame layout, little-endian, 16 bytes:
//!
//! ```text
//! [ kind: u8 | pad: [u8;3] | txn_id: u64 | crc32: u32 ]
//! ```
//!
//! The checksum covers kind and txn id, so a torn tail frame is detected
//! and ignored by the reader.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::{Error, Result};
use crate::txn::TxnId;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const FRAME_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    TxnBegin(TxnId),
    TxnCommit(TxnId),
    TxnAbort(TxnId),
}

impl JournalEntry {
    fn kind(&self) -> u8 {
        match self {
            JournalEntry::TxnBegin(_) => 0x01,
            JournalEntry::TxnCommit(_) => 0x02,
            JournalEntry::TxnAbort(_) => 0x03,
        }
    }

    fn txn(&self) -> TxnId {
        match self {
            JournalEntry::TxnBegin(id) | JournalEntry::TxnCommit(id) | JournalEntry::TxnAbort(id) => {
                *id
            }
        }
    }

    fn from_parts(kind: u8, txn: TxnId) -> Result<Self> {
        match kind {
            0x01 => Ok(JournalEntry::TxnBegin(txn)),
            0x02 => Ok(JournalEntry::TxnCommit(txn)),
            0x03 => Ok(JournalEntry::TxnAbort(txn)),
            _ => Err(Error::Internal("unknown journal entry kind")),
        }
    }
}

pub struct Journal {
    file: File,
    path: PathBuf,
}

impl Journal {
    /// Opens (or creates) the journal, appending at the end.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: JournalEntry) -> Result<()> {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = entry.kind();
        frame[4..12].copy_from_slice(&entry.txn().to_le_bytes());
        let crc = CRC32.checksum(&frame[..12]);
        frame[12..16].copy_from_slice(&crc.to_le_bytes());
        self.file.write_all(&frame)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads every intact frame; a trailing torn frame ends the scan.
    pub fn entries(&mut self) -> Result<Vec<JournalEntry>> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut entries = Vec::new();
        let mut frame = [0u8; FRAME_SIZE];
        loop {
            match self.file.read_exact(&mut frame) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            let crc = u32::from_le_bytes(frame[12..16].try_into().expect("frame slice"));
            if crc != CRC32.checksum(&frame[..12]) {
                break;
            }
            let txn = TxnId::from_le_bytes(frame[4..12].try_into().expect("frame slice"));
            entries.push(JournalEntry::from_parts(frame[0], txn)?);
        }
        Ok(entries)
    }
}
