//! Page cache management
//!
//! The Pager sits between the B-tree and the file. It hands out page
//! images by number, tracks which pages a write transaction dirtied, keeps
//! the original image of every page touched so a transaction (or a nested
//! savepoint) can be undone, and writes dirty pages back on commit.
//! Durability beyond "dirty pages reach the file on commit" is not provided
//! here; a journal or WAL would wrap this type.

use std::collections::HashMap;

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::os::{MemoryFile, SyncFlags, VfsFile};
use crate::types::{DbOffset, Pgno};

// ============================================================================
// Constants
// ============================================================================

/// Default number of clean pages kept in the cache
pub const DEFAULT_CACHE_SIZE: usize = 2000;

// ============================================================================
// Pager Flags
// ============================================================================

bitflags! {
    /// Page state flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PgFlags: u8 {
        /// Page is clean (unmodified)
        const CLEAN = 0x00;
        /// Page has been modified
        const DIRTY = 0x01;
        /// Page is writeable
        const WRITEABLE = 0x08;
    }
}

// ============================================================================
// Enums
// ============================================================================

/// Pager state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PagerState {
    /// No transaction open
    Open,
    /// Read transaction open
    Reader,
    /// Write transaction open, original images being collected
    Writer,
}

// ============================================================================
// Page Header
// ============================================================================

/// A page image handed out by the pager (DbPage in SQLite)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgHdr {
    /// Page number (1-indexed, 0 means "not a page")
    pub pgno: Pgno,
    /// Page content data
    pub data: Vec<u8>,
    /// Page state flags
    pub flags: PgFlags,
}

impl PgHdr {
    /// Create a new zeroed page
    pub fn new(pgno: Pgno, page_size: u32) -> Self {
        PgHdr {
            pgno,
            data: vec![0u8; page_size as usize],
            flags: PgFlags::CLEAN,
        }
    }

    /// Check if page is dirty
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PgFlags::DIRTY)
    }
}

// ============================================================================
// Savepoint
// ============================================================================

/// Original images captured since a savepoint was opened
#[derive(Debug, Default)]
struct Savepoint {
    originals: HashMap<Pgno, Vec<u8>>,
    db_size: Pgno,
}

// ============================================================================
// Pager
// ============================================================================

pub struct Pager {
    fd: Box<dyn VfsFile>,
    mem_db: bool,
    page_size: u32,
    state: PagerState,
    /// Database size in pages
    db_size: Pgno,
    /// Database size at the start of the write transaction
    db_orig_size: Pgno,
    max_page_count: Pgno,
    cache_size: usize,
    cache: HashMap<Pgno, PgHdr>,
    /// Original image of every page dirtied by the open transaction
    journal: HashMap<Pgno, Vec<u8>>,
    savepoints: Vec<Savepoint>,
    /// Pages read from the file
    pub n_read: u32,
    /// Pages written to the file
    pub n_write: u32,
}

impl Pager {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open a pager over an existing file handle (sqlite3PagerOpen)
    pub fn open(fd: Box<dyn VfsFile>, page_size: u32) -> Result<Self> {
        let mut pager = Pager {
            fd,
            mem_db: false,
            page_size,
            state: PagerState::Open,
            db_size: 0,
            db_orig_size: 0,
            max_page_count: Pgno::MAX - 1,
            cache_size: DEFAULT_CACHE_SIZE,
            cache: HashMap::new(),
            journal: HashMap::new(),
            savepoints: Vec::new(),
            n_read: 0,
            n_write: 0,
        };
        pager.refresh_db_size()?;
        Ok(pager)
    }

    /// Open a pager on a private in-memory file
    pub fn memory(page_size: u32) -> Result<Self> {
        let mut pager = Self::open(Box::new(MemoryFile::new()), page_size)?;
        pager.mem_db = true;
        Ok(pager)
    }

    fn refresh_db_size(&mut self) -> Result<()> {
        let bytes = self.fd.file_size()?;
        self.db_size = (bytes / self.page_size as DbOffset) as Pgno;
        self.db_orig_size = self.db_size;
        Ok(())
    }

    /// Read the first bytes of the file, before the page size is known
    pub fn read_file_header(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.fd.read(buf, 0)
    }

    /// Change the page size; only legal while the cache is empty
    pub fn set_page_size(&mut self, page_size: u32) -> Result<()> {
        if page_size == self.page_size {
            return Ok(());
        }
        if !self.cache.is_empty() || self.state == PagerState::Writer {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "page size cannot change with pages cached",
            ));
        }
        self.page_size = page_size;
        self.refresh_db_size()
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn set_max_page_count(&mut self, max: Pgno) -> Pgno {
        if max > 0 {
            self.max_page_count = max.max(self.db_size);
        }
        self.max_page_count
    }

    pub fn set_cache_size(&mut self, size: usize) {
        self.cache_size = size.max(10);
    }

    pub fn is_memdb(&self) -> bool {
        self.mem_db
    }

    pub fn state(&self) -> PagerState {
        self.state
    }

    /// Number of pages in the database image
    pub fn page_count(&self) -> Pgno {
        self.db_size
    }

    // ========================================================================
    // Page Acquisition
    // ========================================================================

    /// Get a page image, reading from the file if needed (sqlite3PagerGet).
    /// Pages past the end of the image read as zeroes.
    pub fn get(&mut self, pgno: Pgno) -> Result<PgHdr> {
        if pgno == 0 || pgno > self.max_page_count {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("page number {} out of range", pgno),
            ));
        }
        if self.state == PagerState::Open {
            self.state = PagerState::Reader;
        }
        if pgno > self.db_size {
            return Ok(PgHdr::new(pgno, self.page_size));
        }
        self.load(pgno)
    }

    /// Cached image of a page, or its file image, regardless of db_size
    fn load(&mut self, pgno: Pgno) -> Result<PgHdr> {
        if let Some(page) = self.cache.get(&pgno) {
            return Ok(page.clone());
        }

        let mut page = PgHdr::new(pgno, self.page_size);
        let offset = (pgno as DbOffset - 1) * self.page_size as DbOffset;
        if self.fd.read(&mut page.data, offset)? > 0 {
            self.n_read += 1;
        }
        self.evict_clean_pages();
        self.cache.insert(pgno, page.clone());
        Ok(page)
    }

    fn evict_clean_pages(&mut self) {
        if self.cache.len() < self.cache_size || self.mem_db {
            return;
        }
        let clean: Vec<Pgno> = self
            .cache
            .iter()
            .filter(|(_, p)| !p.is_dirty())
            .map(|(&pgno, _)| pgno)
            .take(self.cache.len() / 4 + 1)
            .collect();
        for pgno in clean {
            self.cache.remove(&pgno);
        }
    }

    /// Store a modified page image (sqlite3PagerWrite).
    ///
    /// The first write of a page inside a transaction or savepoint records
    /// the page's previous image so it can be restored.
    pub fn write(&mut self, page: &mut PgHdr) -> Result<()> {
        if page.pgno == 0 || page.pgno > self.max_page_count {
            return Err(Error::new(ErrorCode::Full));
        }
        if page.data.len() != self.page_size as usize {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} has {} bytes", page.pgno, page.data.len()),
            ));
        }
        if self.state < PagerState::Writer {
            self.begin()?;
        }

        let pgno = page.pgno;
        let needs_original = (pgno <= self.db_orig_size && !self.journal.contains_key(&pgno))
            || self
                .savepoints
                .last()
                .map(|sp| pgno <= sp.db_size && !sp.originals.contains_key(&pgno))
                .unwrap_or(false);
        if needs_original {
            let original = self.load(pgno)?.data;
            if pgno <= self.db_orig_size {
                self.journal.entry(pgno).or_insert_with(|| original.clone());
            }
            if let Some(sp) = self.savepoints.last_mut() {
                if pgno <= sp.db_size {
                    sp.originals.entry(pgno).or_insert(original);
                }
            }
        }

        page.flags.insert(PgFlags::WRITEABLE | PgFlags::DIRTY);
        if pgno > self.db_size {
            self.db_size = pgno;
        }
        self.cache.insert(pgno, page.clone());
        Ok(())
    }

    /// Grow the image by one zeroed page and return its number
    pub fn extend(&mut self) -> Result<Pgno> {
        let pgno = self.db_size + 1;
        if pgno > self.max_page_count {
            return Err(Error::with_message(
                ErrorCode::Full,
                format!("page limit {} reached", self.max_page_count),
            ));
        }
        let mut page = PgHdr::new(pgno, self.page_size);
        self.write(&mut page)?;
        Ok(pgno)
    }

    /// Shrink the image to `n_page` pages (sqlite3PagerTruncateImage).
    /// Cached images past the new end stay until commit so that a savepoint
    /// rollback can bring them back.
    pub fn truncate_image(&mut self, n_page: Pgno) {
        if n_page < self.db_size {
            self.db_size = n_page;
        }
    }

    // ========================================================================
    // Transaction Control
    // ========================================================================

    /// Open a write transaction (sqlite3PagerBegin)
    pub fn begin(&mut self) -> Result<()> {
        if self.state == PagerState::Writer {
            return Ok(());
        }
        self.state = PagerState::Writer;
        self.db_orig_size = self.db_size;
        self.journal.clear();
        Ok(())
    }

    /// Write every dirty page to the file and end the transaction
    pub fn commit(&mut self) -> Result<()> {
        if self.state < PagerState::Writer {
            return Ok(());
        }

        let db_size = self.db_size;
        let mut dirty: Vec<Pgno> = self
            .cache
            .iter()
            .filter(|(&pgno, p)| p.is_dirty() && pgno <= db_size)
            .map(|(&pgno, _)| pgno)
            .collect();
        dirty.sort_unstable();
        for pgno in dirty {
            if let Some(page) = self.cache.get_mut(&pgno) {
                let offset = (pgno as DbOffset - 1) * self.page_size as DbOffset;
                self.fd.write(&page.data, offset)?;
                page.flags = PgFlags::CLEAN;
                self.n_write += 1;
            }
        }
        let size = self.db_size as DbOffset * self.page_size as DbOffset;
        if self.fd.file_size()? != size {
            self.fd.truncate(size)?;
        }
        if !self.mem_db {
            self.fd.sync(SyncFlags::NORMAL)?;
        }

        self.cache.retain(|&pgno, _| pgno <= db_size);
        self.journal.clear();
        self.savepoints.clear();
        self.db_orig_size = self.db_size;
        self.state = PagerState::Reader;
        tracing::debug!(pages = self.db_size, "pager commit");
        Ok(())
    }

    /// Discard every change made since `begin` (sqlite3PagerRollback)
    pub fn rollback(&mut self) -> Result<()> {
        if self.state < PagerState::Writer {
            return Ok(());
        }
        for (pgno, data) in self.journal.drain() {
            self.cache.insert(
                pgno,
                PgHdr {
                    pgno,
                    data,
                    flags: PgFlags::CLEAN,
                },
            );
        }
        // Pages dirtied but never journaled were beyond the original size.
        self.cache.retain(|_, p| !p.is_dirty());
        let orig_size = self.db_orig_size;
        self.db_size = orig_size;
        self.cache.retain(|&pgno, _| pgno <= orig_size);
        self.savepoints.clear();
        self.state = PagerState::Reader;
        tracing::debug!(pages = self.db_size, "pager rollback");
        Ok(())
    }

    // ========================================================================
    // Savepoints
    // ========================================================================

    /// Open a nested savepoint; starts a write transaction if needed
    pub fn open_savepoint(&mut self) -> Result<usize> {
        if self.state < PagerState::Writer {
            self.begin()?;
        }
        self.savepoints.push(Savepoint {
            originals: HashMap::new(),
            db_size: self.db_size,
        });
        Ok(self.savepoints.len())
    }

    /// Fold the innermost savepoint into its parent
    pub fn release_savepoint(&mut self) -> Result<()> {
        let sp = self
            .savepoints
            .pop()
            .ok_or(Error::with_message(ErrorCode::Misuse, "no open savepoint"))?;
        if let Some(parent) = self.savepoints.last_mut() {
            for (pgno, data) in sp.originals {
                if pgno <= parent.db_size {
                    parent.originals.entry(pgno).or_insert(data);
                }
            }
        }
        Ok(())
    }

    /// Restore every page changed since the innermost savepoint and close it
    pub fn rollback_savepoint(&mut self) -> Result<()> {
        let sp = self
            .savepoints
            .pop()
            .ok_or(Error::with_message(ErrorCode::Misuse, "no open savepoint"))?;
        for (pgno, data) in sp.originals {
            // Still differs from the file image until the outer transaction ends.
            let flags = PgFlags::DIRTY | PgFlags::WRITEABLE;
            self.cache.insert(pgno, PgHdr { pgno, data, flags });
        }
        self.db_size = sp.db_size;
        tracing::debug!(pages = self.db_size, "pager savepoint rollback");
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(pager: &mut Pager, pgno: Pgno, byte: u8) -> PgHdr {
        let mut page = pager.get(pgno).unwrap();
        page.data.fill(byte);
        pager.write(&mut page).unwrap();
        page
    }

    #[test]
    fn test_pghdr_new() {
        let page = PgHdr::new(1, 4096);
        assert_eq!(page.pgno, 1);
        assert_eq!(page.data.len(), 4096);
        assert!(!page.is_dirty());
    }

    #[test]
    fn test_get_page_zero_is_corrupt() {
        let mut pager = Pager::memory(512).unwrap();
        assert_eq!(pager.get(0).unwrap_err().code(), ErrorCode::Corrupt);
    }

    #[test]
    fn test_extend_and_commit() {
        let mut pager = Pager::memory(512).unwrap();
        assert_eq!(pager.extend().unwrap(), 1);
        assert_eq!(pager.extend().unwrap(), 2);
        page_with(&mut pager, 2, 7);
        pager.commit().unwrap();
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.get(2).unwrap().data[0], 7);
        assert!(!pager.get(2).unwrap().is_dirty());
    }

    #[test]
    fn test_rollback_restores_images_and_size() {
        let mut pager = Pager::memory(512).unwrap();
        pager.extend().unwrap();
        page_with(&mut pager, 1, 1);
        pager.commit().unwrap();

        page_with(&mut pager, 1, 2);
        pager.extend().unwrap();
        assert_eq!(pager.page_count(), 2);
        pager.rollback().unwrap();
        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.get(1).unwrap().data[0], 1);
    }

    #[test]
    fn test_savepoint_rollback_keeps_outer_changes() {
        let mut pager = Pager::memory(512).unwrap();
        pager.extend().unwrap();
        page_with(&mut pager, 1, 1);

        pager.open_savepoint().unwrap();
        page_with(&mut pager, 1, 9);
        pager.extend().unwrap();
        pager.rollback_savepoint().unwrap();

        assert_eq!(pager.page_count(), 1);
        assert_eq!(pager.get(1).unwrap().data[0], 1);
        pager.commit().unwrap();
        assert_eq!(pager.get(1).unwrap().data[0], 1);
    }

    #[test]
    fn test_max_page_count_reports_full() {
        let mut pager = Pager::memory(512).unwrap();
        pager.set_max_page_count(2);
        pager.extend().unwrap();
        pager.extend().unwrap();
        assert_eq!(pager.extend().unwrap_err().code(), ErrorCode::Full);
    }

    #[test]
    fn test_file_backed_pages_survive_reopen() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        {
            let file = crate::os::OsFile::open(tmp.path()).unwrap();
            let mut pager = Pager::open(Box::new(file), 1024).unwrap();
            pager.extend().unwrap();
            pager.extend().unwrap();
            page_with(&mut pager, 2, 0x5a);
            pager.commit().unwrap();
        }
        let file = crate::os::OsFile::open(tmp.path()).unwrap();
        let mut pager = Pager::open(Box::new(file), 1024).unwrap();
        assert_eq!(pager.page_count(), 2);
        assert_eq!(pager.get(2).unwrap().data[1023], 0x5a);
    }
}
