//! Tree-open configuration
//!
//! All tunables that SQLite keeps as compile-time defaults or PRAGMA state
//! are collected in [`BtreeConfig`]. A config is immutable once a tree is
//! open; two trees in the same process may use different values.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

/// Default page size
pub const DEFAULT_PAGE_SIZE: u32 = 4096;

/// Minimum page size
pub const MIN_PAGE_SIZE: u32 = 512;

/// Maximum page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Smallest usable area SQLite accepts (page size minus reserved bytes)
pub const MIN_USABLE_SIZE: u32 = 480;

/// Largest page number a file may reach
pub const DEFAULT_MAX_PAGE_COUNT: Pgno = 0xFFFF_FFFE;

/// Auto-vacuum mode, stored in header offsets 52 and 64
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoVacuum {
    #[default]
    None,
    /// Compact the file at every commit
    Full,
    /// Compact only on explicit request
    Incremental,
}

impl AutoVacuum {
    pub fn is_enabled(self) -> bool {
        self != AutoVacuum::None
    }
}

/// Immutable engine configuration passed to `Btree::open`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeConfig {
    pub page_size: u32,
    /// Bytes reserved at the end of every page for extensions
    pub reserved_bytes: u8,
    pub auto_vacuum: AutoVacuum,
    /// Maximum embedded payload fraction (header byte 21, out of 255)
    pub max_embedded_fraction: u8,
    /// Minimum embedded payload fraction (header byte 22)
    pub min_embedded_fraction: u8,
    /// Leaf payload fraction (header byte 23)
    pub leaf_embedded_fraction: u8,
    /// Allocation beyond this page number fails with `ErrorCode::Full`
    pub max_page_count: Pgno,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            reserved_bytes: 0,
            auto_vacuum: AutoVacuum::None,
            max_embedded_fraction: 64,
            min_embedded_fraction: 32,
            leaf_embedded_fraction: 32,
            max_page_count: DEFAULT_MAX_PAGE_COUNT,
        }
    }
}

impl BtreeConfig {
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_reserved_bytes(mut self, reserved: u8) -> Self {
        self.reserved_bytes = reserved;
        self
    }

    pub fn with_auto_vacuum(mut self, mode: AutoVacuum) -> Self {
        self.auto_vacuum = mode;
        self
    }

    pub fn with_max_page_count(mut self, max: Pgno) -> Self {
        self.max_page_count = max;
        self
    }

    pub fn with_embedded_fractions(mut self, max: u8, min: u8, leaf: u8) -> Self {
        self.max_embedded_fraction = max;
        self.min_embedded_fraction = min;
        self.leaf_embedded_fraction = leaf;
        self
    }

    pub fn usable_size(&self) -> u32 {
        self.page_size - self.reserved_bytes as u32
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
            || !self.page_size.is_power_of_two()
        {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!("invalid page size {}", self.page_size),
            ));
        }
        if self.usable_size() < MIN_USABLE_SIZE {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!(
                    "usable size {} below minimum {}",
                    self.usable_size(),
                    MIN_USABLE_SIZE
                ),
            ));
        }
        if self.min_embedded_fraction == 0
            || self.min_embedded_fraction > self.max_embedded_fraction
            || self.leaf_embedded_fraction == 0
        {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                format!(
                    "embedded fractions {}/{}/{} out of order",
                    self.max_embedded_fraction,
                    self.min_embedded_fraction,
                    self.leaf_embedded_fraction
                ),
            ));
        }
        if self.max_page_count < 1 {
            return Err(Error::with_message(ErrorCode::Misuse, "max page count is zero"));
        }
        Ok(())
    }
}
