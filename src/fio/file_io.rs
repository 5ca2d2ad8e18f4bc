//! Buffered file IO backend.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::error::Result;
use crate::fio::IoManager;

/// Standard file IO over an append-mode file handle.
pub struct FileIo {
    fd: File,
}

impl FileIo {
    /// Opens `file_name` create-if-missing, read-write, append.
    pub fn new<P: AsRef<Path>>(file_name: P) -> Result<Self> {
        let fd = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(file_name)?;

        Ok(Self { fd })
    }
}

impl IoManager for FileIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.fd.read_exact_at(buf, offset)?;
        Ok(buf.len())
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        // O_APPEND puts every write at the end of the file
        let mut fd = &self.fd;
        fd.write_all(buf)?;
        Ok(buf.len())
    }

    fn sync(&self) -> Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.fd.metadata()?.len())
    }
}
