//! Read-only memory-mapped IO backend.
//!
//! Only used while the engine replays data files at startup; the engine
//! reopens every file with [`FileIo`](crate::fio::FileIo) before serving
//! user operations. Calling `write` or `sync` on this backend is a
//! programming error.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use memmap2::Mmap;

use crate::error::Result;
use crate::fio::IoManager;

/// Memory map over a data file. Empty files carry no mapping.
pub struct MmapIo {
    map: Option<Mmap>,
}

impl MmapIo {
    /// Maps `file_name` read-only, creating the file if it is missing.
    pub fn new<P: AsRef<Path>>(file_name: P) -> Result<Self> {
        let fd = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(file_name)?;

        // mapping a zero-length file is rejected by the OS
        let map = if fd.metadata()?.len() == 0 {
            None
        } else {
            Some(unsafe { Mmap::map(&fd)? })
        };

        Ok(Self { map })
    }
}

impl IoManager for MmapIo {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let map = self.map.as_ref().ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of mapped file")
        })?;

        let start = offset as usize;
        let end = start + buf.len();
        if end > map.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of mapped file",
            )
            .into());
        }

        buf.copy_from_slice(&map[start..end]);
        Ok(buf.len())
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        panic!("write on a read-only mmap io manager");
    }

    fn sync(&self) -> Result<()> {
        panic!("sync on a read-only mmap io manager");
    }

    fn size(&self) -> Result<u64> {
        Ok(self.map.as_ref().map_or(0, |m| m.len() as u64))
    }
}
