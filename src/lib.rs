//! RustQL B-tree: the SQLite single-file B-tree storage engine
//!
//! Tables are keyed by 64-bit rowid, indexes by opaque byte keys ordered by
//! a [`KeyComparator`]. Files are byte-compatible with the SQLite format.

pub mod config;
pub mod error;
pub mod os;
pub mod storage;
pub mod types;
pub mod util;

pub use config::{AutoVacuum, BtreeConfig};
pub use error::{Error, ErrorCode, Result};
pub use storage::btree::types::{DbHeader, PtrmapType, TreeKind};
pub use storage::btree::{
    BinaryComparator, BtCursor, BtCursorIter, Btree, BtreePayload, CursorState, IntegrityCheckResult,
    KeyComparator, SeekBias, SeekKey,
};
pub use types::{Pgno, RowId};
