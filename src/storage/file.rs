//! # Paged File Backend
//!
//! Positioned read/write access to the single backing file, page at a time.
//! The cache above owns all page buffers; this layer only moves whole pages
//! between those buffers and the file, so the kernel page cache is the only
//! other copy in play.
//!
//! The file grows in page increments. A page's id doubles as its byte
//! offset, which keeps allocation trivial: the next fresh page always
//! starts at the current end of file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::{FileExt, OpenOptionsExt};

use crate::config::PAGE_SIZE;
use crate::error::{Error, Result};
use crate::storage::page::{PageBuf, PageId};

pub struct PagedFile {
    file: File,
    path: PathBuf,
    read_only: bool,
    /// File length in bytes; kept in memory so end-of-file allocation does
    /// not issue a metadata syscall per page.
    len: u64,
}

impl PagedFile {
    /// Creates a new file, truncating any previous content. `mode` is the
    /// unix permission word applied at creation.
    pub fn create(path: &Path, mode: u32) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(mode);
        #[cfg(not(unix))]
        let _ = mode;
        let file = opts.open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            read_only: false,
            len: 0,
        })
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % PAGE_SIZE as u64 != 0 {
            return Err(Error::Internal("file length is not a page multiple"));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            read_only,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn page_count(&self) -> u64 {
        self.len / PAGE_SIZE as u64
    }

    pub fn contains(&self, id: PageId) -> bool {
        id % PAGE_SIZE as u64 == 0 && id < self.len
    }

    pub fn read_page(&self, id: PageId) -> Result<PageBuf> {
        if !self.contains(id) {
            return Err(Error::Internal("page id beyond end of file"));
        }
        let mut data = vec![0u8; PAGE_SIZE].into_boxed_slice();
        #[cfg(unix)]
        self.file.read_exact_at(&mut data, id)?;
        #[cfg(not(unix))]
        {
            use std::io::{Read, Seek, SeekFrom};
            let mut f = &self.file;
            f.seek(SeekFrom::Start(id))?;
            f.read_exact(&mut data)?;
        }
        PageBuf::from_disk(id, data)
    }

    pub fn write_page(&self, page: &PageBuf) -> Result<()> {
        if self.read_only {
            return Err(Error::InvParameter("environment is read-only"));
        }
        debug_assert!(page.id() % PAGE_SIZE as u64 == 0);
        #[cfg(unix)]
        self.file.write_all_at(page.raw(), page.id())?;
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            let mut f = &self.file;
            f.seek(SeekFrom::Start(page.id()))?;
            f.write_all(page.raw())?;
        }
        Ok(())
    }

    /// Reserves the next page at end of file and returns its id. The page
    /// contents are whatever `write_page` later stores; the length is
    /// extended immediately so ids never collide.
    pub fn extend(&mut self) -> Result<PageId> {
        if self.read_only {
            return Err(Error::InvParameter("environment is read-only"));
        }
        let id = self.len;
        self.len += PAGE_SIZE as u64;
        self.file.set_len(self.len)?;
        Ok(id)
    }

    pub fn sync(&self) -> Result<()> {
        if !self.read_only {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
