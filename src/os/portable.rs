//! Fallback file implementation for targets without pread/pwrite

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::Result;
use crate::os::{SyncFlags, VfsFile};
use crate::types::DbOffset;

pub struct PortableFile {
    file: File,
}

impl PortableFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self { file })
    }
}

impl VfsFile for PortableFile {
    fn read(&mut self, buf: &mut [u8], offset: DbOffset) -> Result<usize> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        let mut done = 0usize;
        while done < buf.len() {
            let n = self.file.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        buf[done..].fill(0);
        Ok(done)
    }

    fn write(&mut self, buf: &[u8], offset: DbOffset) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn truncate(&mut self, size: DbOffset) -> Result<()> {
        self.file.set_len(size as u64)?;
        Ok(())
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        if flags.contains(SyncFlags::DATAONLY) {
            self.file.sync_data()?;
        } else {
            self.file.sync_all()?;
        }
        Ok(())
    }

    fn file_size(&self) -> Result<DbOffset> {
        Ok(self.file.metadata()?.len() as DbOffset)
    }
}
