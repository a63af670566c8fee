//! B-tree type definitions, constants, and the database file header

use crate::config::{AutoVacuum, BtreeConfig, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u16, read_u32, write_u16, write_u32};

// Page flags
pub const PTF_INTKEY: u8 = 0x01;
pub const PTF_ZERODATA: u8 = 0x02;
pub const PTF_LEAFDATA: u8 = 0x04;
pub const PTF_LEAF: u8 = 0x08;
pub const PTF_TABLE_LEAF: u8 = PTF_INTKEY | PTF_LEAFDATA | PTF_LEAF;
pub const PTF_TABLE_INTERIOR: u8 = PTF_INTKEY | PTF_LEAFDATA;
pub const PTF_INDEX_LEAF: u8 = PTF_LEAF | PTF_ZERODATA;
pub const PTF_INDEX_INTERIOR: u8 = PTF_ZERODATA;

// Page sizes
pub const PAGE_HEADER_SIZE_LEAF: usize = 8;
pub const PAGE_HEADER_SIZE_INTERIOR: usize = 12;
pub const CELL_PTR_SIZE: usize = 2;
/// Smallest cell SQLite ever stores; shorter cells are padded
pub const MIN_CELL_SIZE: usize = 4;
/// Fragmented bytes allowed before a page must be defragmented
pub const MAX_FRAGMENTED_BYTES: usize = 60;
pub const FILE_HEADER_SIZE: usize = 100;
pub const BTCURSOR_MAX_DEPTH: usize = 20;

/// The page containing this byte offset is never used for data
pub const PENDING_BYTE: u64 = 0x4000_0000;

pub const SQLITE_FILE_HEADER: &[u8; 16] = b"SQLite format 3\0";

// File header offsets
pub const HDR_PAGE_SIZE: usize = 16;
pub const HDR_WRITE_VERSION: usize = 18;
pub const HDR_READ_VERSION: usize = 19;
pub const HDR_RESERVED: usize = 20;
pub const HDR_MAX_FRACTION: usize = 21;
pub const HDR_MIN_FRACTION: usize = 22;
pub const HDR_LEAF_FRACTION: usize = 23;
pub const HDR_CHANGE_COUNTER: usize = 24;
pub const HDR_DATABASE_SIZE: usize = 28;
pub const HDR_FIRST_TRUNK: usize = 32;
pub const HDR_FREE_COUNT: usize = 36;
pub const HDR_SCHEMA_COOKIE: usize = 40;
pub const HDR_SCHEMA_FORMAT: usize = 44;
pub const HDR_DEFAULT_CACHE_SIZE: usize = 48;
pub const HDR_LARGEST_ROOT: usize = 52;
pub const HDR_TEXT_ENCODING: usize = 56;
pub const HDR_USER_VERSION: usize = 60;
pub const HDR_INCR_VACUUM: usize = 64;
pub const HDR_APPLICATION_ID: usize = 68;
pub const HDR_VERSION_VALID_FOR: usize = 92;
pub const HDR_LIBRARY_VERSION: usize = 96;

/// Library version number written into new files
pub const LIBRARY_VERSION_NUMBER: u32 = 3_045_000;

// B-tree metadata indices (get_meta / update_meta)
pub const BTREE_FREE_PAGE_COUNT: usize = 0;
pub const BTREE_SCHEMA_VERSION: usize = 1;
pub const BTREE_FILE_FORMAT: usize = 2;
pub const BTREE_DEFAULT_CACHE_SIZE: usize = 3;
pub const BTREE_LARGEST_ROOT_PAGE: usize = 4;
pub const BTREE_TEXT_ENCODING: usize = 5;
pub const BTREE_USER_VERSION: usize = 6;
pub const BTREE_INCR_VACUUM: usize = 7;
pub const BTREE_APPLICATION_ID: usize = 8;
/// Meta slots readable through get_meta (offsets 36..96)
pub const SQLITE_N_BTREE_META: usize = 15;

/// Page number of the page holding the pending byte
pub fn pending_byte_page(page_size: u32) -> Pgno {
    (PENDING_BYTE / page_size as u64) as Pgno + 1
}

/// Whether a tree is keyed by rowid or by its own key bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    /// Rowid keys, data carried on leaves
    Table,
    /// Opaque byte-string keys, no separate data
    Index,
}

/// The four B-tree page types of the file format
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageKind {
    TableLeaf,
    TableInterior,
    IndexLeaf,
    IndexInterior,
}

impl PageKind {
    /// Decode a page-header flag byte; anything else is corruption
    pub fn from_flags(flags: u8) -> Option<Self> {
        match flags {
            PTF_TABLE_LEAF => Some(PageKind::TableLeaf),
            PTF_TABLE_INTERIOR => Some(PageKind::TableInterior),
            PTF_INDEX_LEAF => Some(PageKind::IndexLeaf),
            PTF_INDEX_INTERIOR => Some(PageKind::IndexInterior),
            _ => None,
        }
    }

    pub fn flags(self) -> u8 {
        match self {
            PageKind::TableLeaf => PTF_TABLE_LEAF,
            PageKind::TableInterior => PTF_TABLE_INTERIOR,
            PageKind::IndexLeaf => PTF_INDEX_LEAF,
            PageKind::IndexInterior => PTF_INDEX_INTERIOR,
        }
    }

    pub fn leaf(tree: TreeKind) -> Self {
        match tree {
            TreeKind::Table => PageKind::TableLeaf,
            TreeKind::Index => PageKind::IndexLeaf,
        }
    }

    pub fn interior(tree: TreeKind) -> Self {
        match tree {
            TreeKind::Table => PageKind::TableInterior,
            TreeKind::Index => PageKind::IndexInterior,
        }
    }

    pub fn tree(self) -> TreeKind {
        match self {
            PageKind::TableLeaf | PageKind::TableInterior => TreeKind::Table,
            PageKind::IndexLeaf | PageKind::IndexInterior => TreeKind::Index,
        }
    }

    pub fn is_leaf(self) -> bool {
        matches!(self, PageKind::TableLeaf | PageKind::IndexLeaf)
    }

    pub fn is_intkey(self) -> bool {
        self.tree() == TreeKind::Table
    }

    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            PAGE_HEADER_SIZE_LEAF
        } else {
            PAGE_HEADER_SIZE_INTERIOR
        }
    }
}

/// Pointer-map entry types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PtrmapType {
    /// Root page of a tree; parent is 0
    RootPage = 1,
    /// Page is on the freelist; parent is 0
    FreePage = 2,
    /// First page of an overflow chain; parent is the B-tree page of the cell
    Overflow1 = 3,
    /// Later overflow page; parent is the previous page of the chain
    Overflow2 = 4,
    /// Non-root B-tree page; parent is the parent B-tree page
    Btree = 5,
}

impl PtrmapType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(PtrmapType::RootPage),
            2 => Some(PtrmapType::FreePage),
            3 => Some(PtrmapType::Overflow1),
            4 => Some(PtrmapType::Overflow2),
            5 => Some(PtrmapType::Btree),
            _ => None,
        }
    }
}

/// How a seek resolves when the exact key is absent
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekBias {
    /// Only an exact match counts
    Exact,
    /// Largest entry less than or equal to the key
    Le,
    /// Smallest entry greater than or equal to the key
    Ge,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorState {
    /// Not pointing at an entry
    Invalid,
    /// Pointing at an entry
    Valid,
    /// The tree changed; reposition from the saved key before use
    RequireSeek,
    /// Repositioned next to a vanished entry; one step is already taken
    SkipNext,
}

/// Page limits and offset calculations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageLimits {
    pub page_size: u32,
    pub usable_size: u32,
    pub header_offset: usize,
}

impl PageLimits {
    pub fn new(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: 0,
        }
    }

    pub fn for_page1(page_size: u32, usable_size: u32) -> Self {
        Self {
            page_size,
            usable_size,
            header_offset: FILE_HEADER_SIZE,
        }
    }

    /// Limits for a given page number (page 1 carries the file header)
    pub fn for_page(pgno: Pgno, page_size: u32, usable_size: u32) -> Self {
        if pgno == 1 {
            Self::for_page1(page_size, usable_size)
        } else {
            Self::new(page_size, usable_size)
        }
    }

    pub fn header_start(&self) -> usize {
        self.header_offset
    }

    pub fn usable_end(&self) -> usize {
        self.usable_size as usize
    }

    /// Largest cell count a page of this size can hold (MX_CELL)
    pub fn max_cells(&self) -> usize {
        (self.page_size as usize - 8) / 6
    }
}

/// Database header structure (first 100 bytes of page 1)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbHeader {
    pub page_size: u32,
    pub write_version: u8,
    pub read_version: u8,
    pub reserved_bytes: u8,
    pub max_embedded_fraction: u8,
    pub min_embedded_fraction: u8,
    pub leaf_embedded_fraction: u8,
    pub change_counter: u32,
    pub database_size: u32,
    pub first_trunk_page: Pgno,
    pub free_page_count: u32,
    pub schema_cookie: u32,
    pub schema_format: u32,
    pub default_cache_size: u32,
    pub largest_root_page: Pgno,
    pub text_encoding: u32,
    pub user_version: u32,
    pub incremental_vacuum: u32,
    pub application_id: u32,
    pub version_valid_for: u32,
    pub library_version: u32,
}

impl DbHeader {
    /// Header of a freshly created one-page database
    pub fn new(config: &BtreeConfig) -> Self {
        let auto_vacuum = config.auto_vacuum.is_enabled();
        Self {
            page_size: config.page_size,
            write_version: 1,
            read_version: 1,
            reserved_bytes: config.reserved_bytes,
            max_embedded_fraction: config.max_embedded_fraction,
            min_embedded_fraction: config.min_embedded_fraction,
            leaf_embedded_fraction: config.leaf_embedded_fraction,
            change_counter: 1,
            database_size: 1,
            first_trunk_page: 0,
            free_page_count: 0,
            schema_cookie: 0,
            schema_format: 4,
            default_cache_size: 0,
            largest_root_page: auto_vacuum as Pgno,
            text_encoding: 1,
            user_version: 0,
            incremental_vacuum: (config.auto_vacuum == AutoVacuum::Incremental) as u32,
            application_id: 0,
            version_valid_for: 1,
            library_version: LIBRARY_VERSION_NUMBER,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::with_message(ErrorCode::NotADb, "file header truncated"));
        }
        if &data[..16] != SQLITE_FILE_HEADER {
            return Err(Error::with_message(ErrorCode::NotADb, "bad magic string"));
        }
        let u32_at = |offset| read_u32(data, offset).ok_or(Error::new(ErrorCode::Corrupt));

        let mut page_size = read_u16(data, HDR_PAGE_SIZE).ok_or(Error::new(ErrorCode::Corrupt))? as u32;
        if page_size == 1 {
            page_size = MAX_PAGE_SIZE;
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
            return Err(Error::with_message(
                ErrorCode::NotADb,
                format!("invalid page size {}", page_size),
            ));
        }
        let reserved_bytes = data[HDR_RESERVED];
        if page_size - (reserved_bytes as u32) < crate::config::MIN_USABLE_SIZE {
            return Err(Error::with_message(
                ErrorCode::NotADb,
                format!("reserved bytes {} leave too little room", reserved_bytes),
            ));
        }

        Ok(Self {
            page_size,
            write_version: data[HDR_WRITE_VERSION],
            read_version: data[HDR_READ_VERSION],
            reserved_bytes,
            max_embedded_fraction: data[HDR_MAX_FRACTION],
            min_embedded_fraction: data[HDR_MIN_FRACTION],
            leaf_embedded_fraction: data[HDR_LEAF_FRACTION],
            change_counter: u32_at(HDR_CHANGE_COUNTER)?,
            database_size: u32_at(HDR_DATABASE_SIZE)?,
            first_trunk_page: u32_at(HDR_FIRST_TRUNK)?,
            free_page_count: u32_at(HDR_FREE_COUNT)?,
            schema_cookie: u32_at(HDR_SCHEMA_COOKIE)?,
            schema_format: u32_at(HDR_SCHEMA_FORMAT)?,
            default_cache_size: u32_at(HDR_DEFAULT_CACHE_SIZE)?,
            largest_root_page: u32_at(HDR_LARGEST_ROOT)?,
            text_encoding: u32_at(HDR_TEXT_ENCODING)?,
            user_version: u32_at(HDR_USER_VERSION)?,
            incremental_vacuum: u32_at(HDR_INCR_VACUUM)?,
            application_id: u32_at(HDR_APPLICATION_ID)?,
            version_valid_for: u32_at(HDR_VERSION_VALID_FOR)?,
            library_version: u32_at(HDR_LIBRARY_VERSION)?,
        })
    }

    /// Serialize into the first 100 bytes of `data`
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(Error::new(ErrorCode::Internal));
        }
        data[..16].copy_from_slice(SQLITE_FILE_HEADER);
        let encoded_size = if self.page_size == MAX_PAGE_SIZE {
            1
        } else {
            self.page_size as u16
        };
        write_u16(data, HDR_PAGE_SIZE, encoded_size)?;
        data[HDR_WRITE_VERSION] = self.write_version;
        data[HDR_READ_VERSION] = self.read_version;
        data[HDR_RESERVED] = self.reserved_bytes;
        data[HDR_MAX_FRACTION] = self.max_embedded_fraction;
        data[HDR_MIN_FRACTION] = self.min_embedded_fraction;
        data[HDR_LEAF_FRACTION] = self.leaf_embedded_fraction;
        write_u32(data, HDR_CHANGE_COUNTER, self.change_counter)?;
        write_u32(data, HDR_DATABASE_SIZE, self.database_size)?;
        write_u32(data, HDR_FIRST_TRUNK, self.first_trunk_page)?;
        write_u32(data, HDR_FREE_COUNT, self.free_page_count)?;
        write_u32(data, HDR_SCHEMA_COOKIE, self.schema_cookie)?;
        write_u32(data, HDR_SCHEMA_FORMAT, self.schema_format)?;
        write_u32(data, HDR_DEFAULT_CACHE_SIZE, self.default_cache_size)?;
        write_u32(data, HDR_LARGEST_ROOT, self.largest_root_page)?;
        write_u32(data, HDR_TEXT_ENCODING, self.text_encoding)?;
        write_u32(data, HDR_USER_VERSION, self.user_version)?;
        write_u32(data, HDR_INCR_VACUUM, self.incremental_vacuum)?;
        write_u32(data, HDR_APPLICATION_ID, self.application_id)?;
        data[72..92].fill(0);
        write_u32(data, HDR_VERSION_VALID_FOR, self.version_valid_for)?;
        write_u32(data, HDR_LIBRARY_VERSION, self.library_version)?;
        Ok(())
    }

    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_bytes as u32
    }

    /// Vacuum mode recorded in the header (offsets 52 and 64)
    pub fn auto_vacuum(&self) -> AutoVacuum {
        match (self.largest_root_page != 0, self.incremental_vacuum != 0) {
            (false, _) => AutoVacuum::None,
            (true, false) => AutoVacuum::Full,
            (true, true) => AutoVacuum::Incremental,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_kind_flags() {
        for kind in [
            PageKind::TableLeaf,
            PageKind::TableInterior,
            PageKind::IndexLeaf,
            PageKind::IndexInterior,
        ] {
            assert_eq!(PageKind::from_flags(kind.flags()), Some(kind));
        }
        assert_eq!(PageKind::from_flags(0x0d), Some(PageKind::TableLeaf));
        assert_eq!(PageKind::from_flags(0x02), Some(PageKind::IndexInterior));
        assert_eq!(PageKind::from_flags(0x00), None);
        assert_eq!(PageKind::from_flags(0x09), None);
        assert_eq!(PageKind::leaf(TreeKind::Index).header_size(), 8);
        assert_eq!(PageKind::interior(TreeKind::Table).header_size(), 12);
    }

    #[test]
    fn test_ptrmap_type_decode() {
        assert_eq!(PtrmapType::from_u8(5), Some(PtrmapType::Btree));
        assert_eq!(PtrmapType::from_u8(0), None);
        assert_eq!(PtrmapType::from_u8(6), None);
    }

    #[test]
    fn test_pending_byte_page() {
        assert_eq!(pending_byte_page(4096), 262145);
        assert_eq!(pending_byte_page(512), 2097153);
    }

    #[test]
    fn test_header_write_parse() {
        let config = BtreeConfig::default()
            .with_page_size(65536)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let mut header = DbHeader::new(&config);
        header.user_version = 42;
        header.application_id = 0x1234;
        let mut page = vec![0u8; 512];
        header.write(&mut page).unwrap();
        assert_eq!(&page[16..18], &[0, 1]);

        let parsed = DbHeader::parse(&page).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.page_size, 65536);
        assert_eq!(parsed.auto_vacuum(), AutoVacuum::Incremental);
    }

    #[test]
    fn test_header_rejects_bad_magic_and_page_size() {
        let mut page = vec![0u8; 512];
        DbHeader::new(&BtreeConfig::default()).write(&mut page).unwrap();
        let mut bad = page.clone();
        bad[0] = b'X';
        assert_eq!(DbHeader::parse(&bad).unwrap_err().code(), ErrorCode::NotADb);

        let mut bad = page.clone();
        bad[16..18].copy_from_slice(&1000u16.to_be_bytes());
        assert_eq!(DbHeader::parse(&bad).unwrap_err().code(), ErrorCode::NotADb);

        assert!(DbHeader::parse(&page[..50]).is_err());
    }
}
