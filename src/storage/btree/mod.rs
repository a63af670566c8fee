//! B-tree storage engine
//!
//! A database file holds any number of B-trees, each named by its root
//! page. Table trees are keyed by a 64-bit rowid and keep their data in the
//! leaves; index trees are keyed by opaque byte strings and keep each key
//! exactly once, on a leaf or an interior page.
//!
//! [`Btree`] is the handle a caller owns. The state it shares with its
//! cursors lives in [`BtShared`] behind an `Arc<RwLock<_>>`; cursors keep a
//! `Weak` reference and take the lock for the duration of each call.

pub mod balance;
pub mod cell;
pub mod cursor;
pub mod encoding;
pub mod freelist;
pub mod integrity;
pub mod overflow;
pub mod page;
pub mod ptrmap;
pub mod types;

use std::path::Path;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::config::{AutoVacuum, BtreeConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::os::{OsFile, VfsFile};
use crate::storage::pager::{Pager, PagerState, PgFlags, PgHdr};
use crate::types::{Pgno, RowId};

use self::cell::PayloadParams;
use self::encoding::{get_u32, write_u32};
use self::page::MemPage;
use self::types::{
    pending_byte_page, DbHeader, PageKind, PageLimits, PtrmapType, TreeKind, BTREE_FREE_PAGE_COUNT,
    BTREE_INCR_VACUUM, BTREE_LARGEST_ROOT_PAGE, FILE_HEADER_SIZE, HDR_CHANGE_COUNTER,
    HDR_DATABASE_SIZE, HDR_FREE_COUNT, HDR_INCR_VACUUM, HDR_LARGEST_ROOT, HDR_LIBRARY_VERSION,
    HDR_VERSION_VALID_FOR, LIBRARY_VERSION_NUMBER, SQLITE_N_BTREE_META,
};

pub use self::cursor::{BinaryComparator, BtCursor, BtCursorIter, KeyComparator, SeekKey};
pub use self::freelist::FreelistWalk;
pub use self::integrity::IntegrityCheckResult;
pub use self::types::{CursorState, SeekBias};

// ============================================================================
// Shared state
// ============================================================================

/// State shared by a `Btree` handle and all of its cursors
pub struct BtShared {
    pub(crate) pager: Pager,
    config: BtreeConfig,
    page_size: u32,
    usable_size: u32,
    params: PayloadParams,
    auto_vacuum: AutoVacuum,
    /// Bumped by every structural change; cursors compare it to decide
    /// whether their saved path is still good
    generation: u64,
}

impl BtShared {
    fn new(pager: Pager, config: BtreeConfig) -> Self {
        let usable_size = config.usable_size();
        let params = PayloadParams::new(
            usable_size,
            config.max_embedded_fraction,
            config.min_embedded_fraction,
            config.leaf_embedded_fraction,
        );
        Self {
            pager,
            page_size: config.page_size,
            usable_size,
            params,
            auto_vacuum: config.auto_vacuum,
            generation: 0,
            config,
        }
    }

    /// Write page 1 of an empty file: the header plus an empty table root
    fn new_db(&mut self) -> Result<()> {
        let header = DbHeader::new(&self.config);
        let mut page1 = MemPage::new_empty(1, PageKind::TableLeaf, self.limits(1), self.params)?;
        header.write(&mut page1.data)?;
        self.pager.begin()?;
        self.put_page(1, page1.data)?;
        self.pager.commit()?;
        tracing::debug!(page_size = self.page_size, auto_vacuum = ?self.auto_vacuum, "created database");
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn usable_size(&self) -> u32 {
        self.usable_size
    }

    pub fn params(&self) -> &PayloadParams {
        &self.params
    }

    pub fn auto_vacuum(&self) -> AutoVacuum {
        self.auto_vacuum
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    pub(crate) fn limits(&self, pgno: Pgno) -> PageLimits {
        PageLimits::for_page(pgno, self.page_size, self.usable_size)
    }

    pub(crate) fn page_count(&self) -> Pgno {
        self.pager.page_count()
    }

    /// Raw image of an existing page
    pub(crate) fn get_page(&mut self, pgno: Pgno) -> Result<PgHdr> {
        if pgno == 0 || pgno > self.page_count() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("page {} outside file of {} pages", pgno, self.page_count()),
            ));
        }
        self.pager.get(pgno)
    }

    /// Replace a page image
    pub(crate) fn put_page(&mut self, pgno: Pgno, data: Vec<u8>) -> Result<()> {
        let mut page = PgHdr {
            pgno,
            data,
            flags: PgFlags::CLEAN,
        };
        self.pager.write(&mut page)
    }

    /// Parse a B-tree page
    pub(crate) fn load_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        let data = self.get_page(pgno)?.data;
        MemPage::parse(pgno, data, self.limits(pgno), self.params)
    }

    pub(crate) fn write_page(&mut self, page: &MemPage) -> Result<()> {
        if page.has_overflow() {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} written with {} unplaced cells", page.pgno, page.overflow.len()),
            ));
        }
        let mut data = page.data.clone();
        if page.pgno == 1 {
            // Freelist and size fields may have moved on since the page was read
            let current = self.get_page(1)?.data;
            data[..FILE_HEADER_SIZE].copy_from_slice(&current[..FILE_HEADER_SIZE]);
        }
        self.put_page(page.pgno, data)
    }

    pub(crate) fn header_u32(&mut self, offset: usize) -> Result<u32> {
        get_u32(&self.get_page(1)?.data, offset)
    }

    pub(crate) fn set_header_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        let mut data = self.get_page(1)?.data;
        if get_u32(&data, offset)? == value {
            return Ok(());
        }
        write_u32(&mut data, offset, value)?;
        self.put_page(1, data)
    }

    /// Run `f` inside a pager savepoint, undoing its page changes on error
    pub(crate) fn with_savepoint<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.pager.open_savepoint()?;
        match f(self) {
            Ok(value) => {
                self.pager.release_savepoint()?;
                Ok(value)
            }
            Err(err) => {
                self.pager.rollback_savepoint()?;
                self.bump_generation();
                tracing::debug!(error = %err, "statement rolled back");
                Err(err)
            }
        }
    }

    /// Next page number a new root may take in an auto-vacuum file
    fn next_root_slot(&mut self) -> Result<Pgno> {
        let pending = pending_byte_page(self.page_size);
        let mut root = self.header_u32(HDR_LARGEST_ROOT)?.max(1) + 1;
        while self.is_ptrmap_page(root) || root == pending {
            root += 1;
        }
        Ok(root)
    }

    /// Allocate and format a new root page (btreeCreateTable).
    ///
    /// With auto-vacuum on, roots are packed at the front of the file: the
    /// page after the current largest root is cleared for the new tree,
    /// moving whatever lived there.
    pub(crate) fn create_tree(&mut self, tree: TreeKind) -> Result<Pgno> {
        let root = if self.auto_vacuum.is_enabled() {
            let root = self.next_root_slot()?;
            if root > self.page_count() {
                loop {
                    let pgno = self.extend_file()?;
                    if pgno >= root {
                        break;
                    }
                    self.free_page(pgno)?;
                }
            } else if !self.remove_free_page(root)? {
                let (ty, parent) = self.ptrmap_get(root)?;
                if matches!(ty, PtrmapType::RootPage | PtrmapType::FreePage) {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        format!("page {} cannot make room for a new root", root),
                    ));
                }
                let target = self.allocate_page()?;
                self.relocate_page(root, ty, parent, target)?;
            }
            self.ptrmap_put(root, PtrmapType::RootPage, 0)?;
            self.set_header_u32(HDR_LARGEST_ROOT, root)?;
            root
        } else {
            self.allocate_page()?
        };
        let page = MemPage::new_empty(root, PageKind::leaf(tree), self.limits(root), self.params)?;
        self.write_page(&page)?;
        self.bump_generation();
        tracing::debug!(root, ?tree, "created tree");
        Ok(root)
    }

    /// Free every page of a tree below `root`, plus `root` itself when
    /// `free_root` is set. Returns the number of entries removed.
    pub(crate) fn clear_tree(&mut self, root: Pgno, free_root: bool) -> Result<i64> {
        let mut removed = 0i64;
        let mut stack = vec![root];
        let mut visited = 0;
        let kind = self.load_page(root)?.kind();
        while let Some(pgno) = stack.pop() {
            visited += 1;
            if visited > self.page_count() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("tree {} has more pages than the file", root),
                ));
            }
            let page = self.load_page(pgno)?;
            if page.kind().tree() != kind.tree() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("page {} does not belong to tree {}", pgno, root),
                ));
            }
            for i in 0..page.n_cell() {
                let info = page.cell_info(i)?;
                self.clear_cell(&info)?;
                if !page.is_leaf() {
                    stack.push(page.child_pgno(i)?);
                }
            }
            if !page.is_leaf() {
                stack.push(page.child_pgno(page.n_cell())?);
            }
            if page.is_leaf() || page.kind() == PageKind::IndexInterior {
                removed += page.n_cell() as i64;
            }
            if pgno != root || free_root {
                self.free_page(pgno)?;
            }
        }
        if !free_root {
            let mut page = self.load_page(root)?;
            page.reset(PageKind::leaf(kind.tree()))?;
            self.write_page(&page)?;
        }
        self.bump_generation();
        Ok(removed)
    }

    /// Drop the tree rooted at `root` (btreeDropTable). In an auto-vacuum
    /// file the last root moves into the hole; its old page number is
    /// returned so the caller can update whatever records it.
    pub(crate) fn drop_tree(&mut self, root: Pgno) -> Result<Option<Pgno>> {
        self.clear_tree(root, false)?;
        if !self.auto_vacuum.is_enabled() {
            self.free_page(root)?;
            return Ok(None);
        }

        let largest = self.header_u32(HDR_LARGEST_ROOT)?;
        let moved = if root == largest {
            self.free_page(root)?;
            None
        } else {
            // The emptied page is a leaf with no references; the last root
            // takes its place.
            self.relocate_page(largest, PtrmapType::RootPage, 0, root)?;
            self.free_page(largest)?;
            Some(largest)
        };

        let pending = pending_byte_page(self.page_size);
        let mut new_largest = largest - 1;
        while new_largest > 1 && (self.is_ptrmap_page(new_largest) || new_largest == pending) {
            new_largest -= 1;
        }
        self.set_header_u32(HDR_LARGEST_ROOT, new_largest)?;
        self.bump_generation();
        Ok(moved)
    }
}

// ============================================================================
// Insert payload
// ============================================================================

/// An entry to insert through a cursor.
///
/// Table trees use `n_key` as the rowid and `data` as the row; index trees
/// use `key` and ignore the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BtreePayload {
    pub key: Option<Vec<u8>>,
    pub n_key: i64,
    pub data: Option<Vec<u8>>,
}

impl BtreePayload {
    pub fn row(rowid: RowId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            n_key: rowid,
            data: Some(data.into()),
        }
    }

    pub fn index_key(key: impl Into<Vec<u8>>) -> Self {
        let key = key.into();
        Self {
            n_key: key.len() as i64,
            key: Some(key),
            data: None,
        }
    }
}

// ============================================================================
// Btree handle
// ============================================================================

/// An open database file
pub struct Btree {
    shared: Arc<RwLock<BtShared>>,
}

impl Btree {
    /// Open a database on `file`. An empty file is initialised with
    /// `config`; for an existing file the header's page size, reserve,
    /// payload fractions and vacuum mode win.
    pub fn open(file: Box<dyn VfsFile>, config: BtreeConfig) -> Result<Self> {
        config.validate()?;
        let mut pager = Pager::open(file, config.page_size)?;
        let mut buf = [0u8; FILE_HEADER_SIZE];
        let n = pager.read_file_header(&mut buf)?;

        let (config, fresh) = if n == 0 {
            (config, true)
        } else if n < FILE_HEADER_SIZE {
            return Err(Error::with_message(ErrorCode::NotADb, "file shorter than its header"));
        } else {
            let header = DbHeader::parse(&buf)?;
            let config = BtreeConfig {
                page_size: header.page_size,
                reserved_bytes: header.reserved_bytes,
                auto_vacuum: header.auto_vacuum(),
                max_embedded_fraction: header.max_embedded_fraction,
                min_embedded_fraction: header.min_embedded_fraction,
                leaf_embedded_fraction: header.leaf_embedded_fraction,
                ..config
            };
            config
                .validate()
                .map_err(|err| Error::with_message(ErrorCode::NotADb, err.to_string()))?;
            pager.set_page_size(header.page_size)?;
            (config, false)
        };
        pager.set_max_page_count(config.max_page_count);

        let mut shared = BtShared::new(pager, config);
        if fresh {
            shared.new_db()?;
        } else {
            shared.load_page(1)?;
            tracing::debug!(
                pages = shared.page_count(),
                page_size = shared.page_size,
                "opened database"
            );
        }
        Ok(Self {
            shared: Arc::new(RwLock::new(shared)),
        })
    }

    /// A private database that lives only in memory
    pub fn open_memory(config: BtreeConfig) -> Result<Self> {
        config.validate()?;
        let mut pager = Pager::memory(config.page_size)?;
        pager.set_max_page_count(config.max_page_count);
        let mut shared = BtShared::new(pager, config);
        shared.new_db()?;
        Ok(Self {
            shared: Arc::new(RwLock::new(shared)),
        })
    }

    pub fn open_file(path: impl AsRef<Path>, config: BtreeConfig) -> Result<Self> {
        let file = OsFile::open(path)?;
        Self::open(Box::new(file), config)
    }

    /// Close the handle, discarding uncommitted changes. Cursors still
    /// alive report `Misuse` from then on.
    pub fn close(self) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.pager.rollback()?;
        shared.bump_generation();
        Ok(())
    }

    pub(crate) fn lock_shared(&self) -> Result<RwLockWriteGuard<'_, BtShared>> {
        self.shared
            .write()
            .map_err(|_| Error::with_message(ErrorCode::Internal, "btree lock poisoned"))
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Open a write transaction. Writes outside one open it implicitly.
    pub fn begin(&self) -> Result<()> {
        self.lock_shared()?.pager.begin()
    }

    pub fn is_in_write_trans(&self) -> Result<bool> {
        Ok(self.lock_shared()?.pager.state() == PagerState::Writer)
    }

    /// Make every change since `begin` durable in the file
    pub fn commit(&self) -> Result<()> {
        let mut shared = self.lock_shared()?;
        if shared.pager.state() != PagerState::Writer {
            return Ok(());
        }
        if shared.auto_vacuum == AutoVacuum::Full {
            while shared.incr_vacuum_step()? {}
        }
        let counter = shared.header_u32(HDR_CHANGE_COUNTER)?.wrapping_add(1);
        shared.set_header_u32(HDR_CHANGE_COUNTER, counter)?;
        let n_pages = shared.page_count();
        shared.set_header_u32(HDR_DATABASE_SIZE, n_pages)?;
        shared.set_header_u32(HDR_VERSION_VALID_FOR, counter)?;
        shared.set_header_u32(HDR_LIBRARY_VERSION, LIBRARY_VERSION_NUMBER)?;
        shared.pager.commit()?;
        tracing::debug!(pages = n_pages, change_counter = counter, "commit");
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        let mut shared = self.lock_shared()?;
        shared.pager.rollback()?;
        shared.bump_generation();
        tracing::debug!("rollback");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Trees
    // ------------------------------------------------------------------------

    /// Create an empty tree and return its root page
    pub fn create_table(&self, tree: TreeKind) -> Result<Pgno> {
        self.lock_shared()?.with_savepoint(|shared| shared.create_tree(tree))
    }

    /// Remove a tree and free all of its pages. When auto-vacuum moved
    /// another root into the freed slot, returns that root's old number.
    pub fn drop_table(&self, root: Pgno) -> Result<Option<Pgno>> {
        let mut shared = self.lock_shared()?;
        check_root(&shared, root)?;
        if root == 1 {
            return Err(Error::with_message(ErrorCode::Misuse, "page 1 cannot be dropped"));
        }
        shared.with_savepoint(|shared| shared.drop_tree(root))
    }

    /// Delete every entry of a tree, keeping its root. Returns the number
    /// of entries removed.
    pub fn clear_table(&self, root: Pgno) -> Result<i64> {
        let mut shared = self.lock_shared()?;
        check_root(&shared, root)?;
        shared.with_savepoint(|shared| shared.clear_tree(root, false))
    }

    /// Open a cursor on the tree rooted at `root`, ordering index keys
    /// bytewise
    pub fn cursor(&self, root: Pgno, writable: bool) -> Result<BtCursor> {
        self.cursor_with_comparator(root, writable, Arc::new(BinaryComparator))
    }

    pub fn cursor_with_comparator(
        &self,
        root: Pgno,
        writable: bool,
        comparator: Arc<dyn KeyComparator>,
    ) -> Result<BtCursor> {
        let mut shared = self.lock_shared()?;
        check_root(&shared, root)?;
        let tree = shared.load_page(root)?.kind().tree();
        Ok(BtCursor::new(
            Arc::downgrade(&self.shared),
            root,
            writable,
            tree,
            comparator,
        ))
    }

    // ------------------------------------------------------------------------
    // Meta values
    // ------------------------------------------------------------------------

    /// Read meta value `idx` (header offset 36 + 4 * idx)
    pub fn get_meta(&self, idx: usize) -> Result<u32> {
        if idx >= SQLITE_N_BTREE_META {
            return Err(Error::with_message(ErrorCode::Range, format!("meta index {}", idx)));
        }
        self.lock_shared()?.header_u32(HDR_FREE_COUNT + 4 * idx)
    }

    pub fn update_meta(&self, idx: usize, value: u32) -> Result<()> {
        if idx >= SQLITE_N_BTREE_META {
            return Err(Error::with_message(ErrorCode::Range, format!("meta index {}", idx)));
        }
        if idx == BTREE_FREE_PAGE_COUNT || idx == BTREE_LARGEST_ROOT_PAGE {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("meta value {} is maintained by the engine", idx),
            ));
        }
        let mut shared = self.lock_shared()?;
        if idx == BTREE_INCR_VACUUM {
            if !shared.auto_vacuum.is_enabled() {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "vacuum mode can only change in an auto-vacuum database",
                ));
            }
            shared.auto_vacuum = if value != 0 {
                AutoVacuum::Incremental
            } else {
                AutoVacuum::Full
            };
            return shared.set_header_u32(HDR_INCR_VACUUM, value);
        }
        shared.set_header_u32(HDR_FREE_COUNT + 4 * idx, value)
    }

    pub fn header(&self) -> Result<DbHeader> {
        let mut shared = self.lock_shared()?;
        let data = shared.get_page(1)?.data;
        DbHeader::parse(&data)
    }

    // ------------------------------------------------------------------------
    // Pages
    // ------------------------------------------------------------------------

    pub fn page_size(&self) -> Result<u32> {
        Ok(self.lock_shared()?.page_size)
    }

    pub fn usable_size(&self) -> Result<u32> {
        Ok(self.lock_shared()?.usable_size)
    }

    pub fn auto_vacuum(&self) -> Result<AutoVacuum> {
        Ok(self.lock_shared()?.auto_vacuum)
    }

    pub fn page_count(&self) -> Result<Pgno> {
        Ok(self.lock_shared()?.page_count())
    }

    pub fn freelist_count(&self) -> Result<u32> {
        self.lock_shared()?.freelist_count()
    }

    /// Take a zeroed page for the caller's own use
    pub fn allocate_page(&self) -> Result<Pgno> {
        self.lock_shared()?.with_savepoint(|shared| shared.allocate_page())
    }

    pub fn free_page(&self, pgno: Pgno) -> Result<()> {
        if pgno <= 1 {
            return Err(Error::with_message(ErrorCode::Misuse, format!("page {} cannot be freed", pgno)));
        }
        let mut shared = self.lock_shared()?;
        shared.with_savepoint(|shared| shared.free_page(pgno))?;
        shared.bump_generation();
        Ok(())
    }

    /// Copy of a page image
    pub fn page_data(&self, pgno: Pgno) -> Result<Vec<u8>> {
        Ok(self.lock_shared()?.get_page(pgno)?.data)
    }

    pub fn ptrmap_get(&self, pgno: Pgno) -> Result<(PtrmapType, Pgno)> {
        self.lock_shared()?.ptrmap_get(pgno)
    }

    /// Run one incremental-vacuum step. Returns false once there is
    /// nothing left to reclaim.
    pub fn incr_vacuum(&self) -> Result<bool> {
        let mut shared = self.lock_shared()?;
        if !shared.auto_vacuum.is_enabled() {
            return Ok(false);
        }
        let stepped = shared.with_savepoint(|shared| shared.incr_vacuum_step())?;
        if stepped {
            tracing::debug!(pages = shared.page_count(), "incremental vacuum step");
        }
        Ok(stepped)
    }

    /// Walk the trees rooted at `roots` plus the freelist and report every
    /// inconsistency found, up to `max_errors` (0 means no limit)
    pub fn integrity_check(&self, roots: &[Pgno], max_errors: usize) -> Result<IntegrityCheckResult> {
        self.lock_shared()?.integrity_check(roots, max_errors)
    }
}

fn check_root(shared: &BtShared, root: Pgno) -> Result<()> {
    if root == 0 || root > shared.page_count() {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            format!("root page {} outside file of {} pages", root, shared.page_count()),
        ));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::MemoryFile;
    use crate::storage::btree::types::{BTREE_SCHEMA_VERSION, BTREE_USER_VERSION};

    fn create_memory_btree() -> Btree {
        Btree::open_memory(BtreeConfig::default()).unwrap()
    }

    #[test]
    fn test_btree_open_memory_database() {
        let bt = create_memory_btree();
        assert_eq!(bt.page_count().unwrap(), 1);
        assert_eq!(bt.page_size().unwrap(), 4096);
        assert_eq!(bt.freelist_count().unwrap(), 0);
        let header = bt.header().unwrap();
        assert_eq!(header.page_size, 4096);
        assert_eq!(header.database_size, 1);
        assert_eq!(header.schema_format, 4);
    }

    #[test]
    fn test_btree_rejects_bad_config() {
        let err = Btree::open_memory(BtreeConfig::default().with_page_size(1000)).err().unwrap();
        assert_eq!(err.code(), ErrorCode::Misuse);
    }

    #[test]
    fn test_btree_open_rejects_foreign_file() {
        let file = MemoryFile::from_bytes(vec![0x42; 4096]);
        let err = Btree::open(Box::new(file), BtreeConfig::default()).err().unwrap();
        assert_eq!(err.code(), ErrorCode::NotADb);
    }

    #[test]
    fn test_btree_create_table() {
        let bt = create_memory_btree();
        let root = bt.create_table(TreeKind::Table).unwrap();
        assert_eq!(root, 2);
        let data = bt.page_data(root).unwrap();
        assert_eq!(data[0], PageKind::TableLeaf.flags());
        let index = bt.create_table(TreeKind::Index).unwrap();
        assert_eq!(bt.page_data(index).unwrap()[0], PageKind::IndexLeaf.flags());
    }

    #[test]
    fn test_btree_drop_table() {
        let bt = create_memory_btree();
        let root = bt.create_table(TreeKind::Table).unwrap();
        bt.create_table(TreeKind::Table).unwrap();
        assert_eq!(bt.drop_table(root).unwrap(), None);
        assert_eq!(bt.freelist_count().unwrap(), 1);
        assert_eq!(bt.drop_table(1).unwrap_err().code(), ErrorCode::Misuse);
        assert_eq!(bt.drop_table(99).unwrap_err().code(), ErrorCode::Misuse);
    }

    #[test]
    fn test_btree_clear_table() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        for rowid in 0..100 {
            cursor.insert(&BtreePayload::row(rowid, vec![1u8; 40])).unwrap();
        }
        assert!(bt.page_count().unwrap() > 3);
        assert_eq!(bt.clear_table(root).unwrap(), 100);
        assert!(!cursor.first().unwrap());
        let report = bt.integrity_check(&[root], 10).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
    }

    #[test]
    fn test_btree_commit_and_rollback() {
        let bt = create_memory_btree();
        bt.begin().unwrap();
        assert!(bt.is_in_write_trans().unwrap());
        let root = bt.create_table(TreeKind::Table).unwrap();
        bt.commit().unwrap();
        assert!(!bt.is_in_write_trans().unwrap());
        assert_eq!(bt.header().unwrap().change_counter, 2);
        assert_eq!(bt.header().unwrap().database_size, 2);

        bt.begin().unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        cursor.insert(&BtreePayload::row(1, b"gone".to_vec())).unwrap();
        bt.create_table(TreeKind::Index).unwrap();
        assert_eq!(bt.page_count().unwrap(), 3);
        bt.rollback().unwrap();
        assert_eq!(bt.page_count().unwrap(), 2);
        assert!(!cursor.first().unwrap());
    }

    #[test]
    fn test_btree_get_and_update_meta() {
        let bt = create_memory_btree();
        assert_eq!(bt.get_meta(BTREE_SCHEMA_VERSION).unwrap(), 0);
        bt.update_meta(BTREE_USER_VERSION, 42).unwrap();
        assert_eq!(bt.get_meta(BTREE_USER_VERSION).unwrap(), 42);
        assert_eq!(bt.header().unwrap().user_version, 42);
        assert_eq!(bt.get_meta(15).unwrap_err().code(), ErrorCode::Range);
        assert_eq!(bt.update_meta(0, 1).unwrap_err().code(), ErrorCode::Misuse);
        assert_eq!(bt.update_meta(BTREE_INCR_VACUUM, 1).unwrap_err().code(), ErrorCode::Misuse);
    }

    #[test]
    fn test_btree_auto_vacuum_roots_stay_packed() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let bt = Btree::open_memory(config).unwrap();
        let first = bt.create_table(TreeKind::Table).unwrap();
        assert_eq!(first, 3);
        assert_eq!(bt.ptrmap_get(first).unwrap(), (PtrmapType::RootPage, 0));

        let mut cursor = bt.cursor(first, true).unwrap();
        for rowid in 0..40 {
            cursor.insert(&BtreePayload::row(rowid, vec![9u8; 50])).unwrap();
        }
        // Page 4 is now part of the first tree; the next root displaces it.
        let second = bt.create_table(TreeKind::Index).unwrap();
        assert_eq!(second, 4);
        assert_eq!(bt.get_meta(BTREE_LARGEST_ROOT_PAGE).unwrap(), 4);

        let report = bt.integrity_check(&[first, second], 10).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
        let rows: Vec<_> = cursor.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(rows, (0..40).collect::<Vec<_>>());

        // Dropping the first root moves the second into its slot.
        assert_eq!(bt.drop_table(first).unwrap(), Some(second));
        assert_eq!(bt.get_meta(BTREE_LARGEST_ROOT_PAGE).unwrap(), 3);
        assert_eq!(bt.page_data(first).unwrap()[0], PageKind::IndexLeaf.flags());
        let report = bt.integrity_check(&[first], 10).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
    }

    #[test]
    fn test_btree_full_vacuum_at_commit() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Full);
        let bt = Btree::open_memory(config).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        for rowid in 0..50 {
            cursor.insert(&BtreePayload::row(rowid, vec![3u8; 700])).unwrap();
        }
        bt.commit().unwrap();
        let grown = bt.page_count().unwrap();
        for rowid in 0..50 {
            assert!(cursor.seek_rowid(rowid).unwrap());
            cursor.delete().unwrap();
        }
        bt.commit().unwrap();
        assert_eq!(bt.freelist_count().unwrap(), 0);
        assert!(bt.page_count().unwrap() < grown);
        assert_eq!(bt.page_count().unwrap(), 3);
        let report = bt.integrity_check(&[root], 10).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
    }

    #[test]
    fn test_btree_free_page_one_is_misuse() {
        let bt = create_memory_btree();
        assert_eq!(bt.free_page(1).unwrap_err().code(), ErrorCode::Misuse);
        let p = bt.allocate_page().unwrap();
        bt.free_page(p).unwrap();
        assert_eq!(bt.freelist_count().unwrap(), 1);
    }

    #[test]
    fn test_btree_memory_respects_max_page_count() {
        let config = BtreeConfig::default().with_page_size(512).with_max_page_count(10);
        let bt = Btree::open_memory(config).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();

        let mut inserted = 0;
        let err = loop {
            match cursor.insert(&BtreePayload::row(inserted, vec![7u8; 200])) {
                Ok(()) => inserted += 1,
                Err(err) => break err,
            }
            assert!(inserted < 200, "page limit never reached");
        };
        assert_eq!(err.code(), ErrorCode::Full);
        assert!(bt.page_count().unwrap() <= 10);
        assert_eq!(cursor.count().unwrap(), inserted);
        let report = bt.integrity_check(&[root], 0).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
    }
}
