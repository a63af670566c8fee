//! Core type aliases shared across the storage layers

// ============================================================================
// Numeric Type Aliases
// ============================================================================

/// Page number type (u32 in SQLite); 0 means "no page"
pub type Pgno = u32;

/// Row ID type (i64 in SQLite)
pub type RowId = i64;

/// Database file offset
pub type DbOffset = i64;
