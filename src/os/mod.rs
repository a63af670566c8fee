//! OS abstraction layer: the file interface the pager reads pages through
//!
//! `MemoryFile` backs in-memory databases and tests; `OsFile` is the
//! platform file (positional I/O through libc on unix).

use bitflags::bitflags;

use crate::error::{Error, ErrorCode, Result};
use crate::types::DbOffset;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::UnixFile as OsFile;

#[cfg(not(unix))]
mod portable;

#[cfg(not(unix))]
pub use portable::PortableFile as OsFile;

bitflags! {
    /// Flags for VfsFile::sync
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const NORMAL = 0x02;
        const FULL = 0x03;
        /// Sync data only, not metadata (fdatasync)
        const DATAONLY = 0x10;
    }
}

/// A random-access byte file (sqlite3_io_methods, reduced to what the
/// pager needs)
pub trait VfsFile: Send {
    /// Read into `buf` at `offset`; bytes past end of file read as zero.
    /// Returns the number of bytes actually present in the file.
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize>;

    /// Write all of `buf` at `offset`, growing the file as needed
    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()>;

    /// Truncate file to size
    fn truncate(&mut self, size: DbOffset) -> Result<()>;

    /// Sync file to durable storage
    fn sync(&mut self, flags: SyncFlags) -> Result<()>;

    /// Current file size in bytes
    fn file_size(&self) -> Result<DbOffset>;
}

// ============================================================================
// In-memory file
// ============================================================================

/// Growable in-memory file
#[derive(Debug, Default, Clone)]
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing image, e.g. one produced by another engine
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

fn checked_offset(offset: DbOffset) -> Result<usize> {
    usize::try_from(offset)
        .map_err(|_| Error::with_message(ErrorCode::IoErr, format!("bad file offset {}", offset)))
}

impl VfsFile for MemoryFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        let start = checked_offset(offset)?;
        if start >= self.data.len() {
            buf.fill(0);
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        let start = checked_offset(offset)?;
        let end = start
            .checked_add(buf.len())
            .ok_or(Error::new(ErrorCode::Full))?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        let size = checked_offset(size)?;
        self.data.truncate(size);
        Ok(())
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        Ok(self.data.len() as DbOffset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_file_short_read_zero_fills() {
        let mut file = MemoryFile::new();
        file.write(&[1, 2, 3], 0).unwrap();
        let mut buf = [0xffu8; 6];
        let n = file.read(&mut buf, 1).unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf, [2, 3, 0, 0, 0, 0]);
    }

    #[test]
    fn test_memory_file_write_grows_and_truncates() {
        let mut file = MemoryFile::new();
        file.write(&[9; 4], 10).unwrap();
        assert_eq!(file.file_size().unwrap(), 14);
        file.truncate(5).unwrap();
        assert_eq!(file.file_size().unwrap(), 5);
    }

    #[test]
    fn test_os_file_roundtrip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut file = OsFile::open(tmp.path()).unwrap();
        file.write(b"page-data", 512).unwrap();
        file.sync(SyncFlags::NORMAL).unwrap();
        assert_eq!(file.file_size().unwrap(), 521);
        let mut buf = [0u8; 9];
        assert_eq!(file.read(&mut buf, 512).unwrap(), 9);
        assert_eq!(&buf, b"page-data");
        file.truncate(0).unwrap();
        assert_eq!(file.file_size().unwrap(), 0);
    }
}
