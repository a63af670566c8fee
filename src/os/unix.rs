//! Unix file implementation
//!
//! Positional reads and writes go through pread/pwrite so the file offset
//! is never shared state.

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::error::{Error, ErrorCode, Result};
use crate::os::{SyncFlags, VfsFile};
use crate::types::DbOffset;

/// fdatasync - use fsync on platforms without fdatasync (macOS)
#[cfg(target_os = "linux")]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fdatasync(fd)
}

#[cfg(not(target_os = "linux"))]
unsafe fn platform_fdatasync(fd: RawFd) -> i32 {
    libc::fsync(fd)
}

/// Create an error from the current errno
fn error_from_errno() -> Error {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOSPC) => Error::with_message(ErrorCode::Full, err.to_string()),
        Some(libc::EBUSY) | Some(libc::EAGAIN) => {
            Error::with_message(ErrorCode::Busy, err.to_string())
        }
        Some(libc::EROFS) => Error::with_message(ErrorCode::ReadOnly, err.to_string()),
        _ => err.into(),
    }
}

/// Database file opened read-write on a unix filesystem
pub struct UnixFile {
    file: File,
}

impl UnixFile {
    /// Open (creating if missing) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self { file })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl VfsFile for UnixFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let rest = &mut buf[done..];
            let n = unsafe {
                libc::pread(
                    self.fd(),
                    rest.as_mut_ptr() as *mut libc::c_void,
                    rest.len(),
                    (offset + done as DbOffset) as libc::off_t,
                )
            };
            if n < 0 {
                return Err(error_from_errno());
            }
            if n == 0 {
                break;
            }
            done += n as usize;
        }

        // Zero-fill short reads (SQLite convention)
        buf[done..].fill(0);
        Ok(done)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let rest = &buf[done..];
            let n = unsafe {
                libc::pwrite(
                    self.fd(),
                    rest.as_ptr() as *const libc::c_void,
                    rest.len(),
                    (offset + done as DbOffset) as libc::off_t,
                )
            };
            if n < 0 {
                return Err(error_from_errno());
            }
            if n == 0 {
                return Err(Error::new(ErrorCode::Full));
            }
            done += n as usize;
        }
        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        let rc = unsafe { libc::ftruncate(self.fd(), size as libc::off_t) };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let rc = if flags.contains(SyncFlags::DATAONLY) {
            unsafe { platform_fdatasync(self.fd()) }
        } else {
            unsafe { libc::fsync(self.fd()) }
        };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstat(self.fd(), &mut stat) };
        if rc != 0 {
            return Err(error_from_errno());
        }
        Ok(stat.st_size as DbOffset)
    }
}
