//! Byte-oriented file IO abstraction.
//!
//! Every data file owns one [`IoManager`]. Two backends exist:
//!
//! - **Buffered file IO** ([`FileIo`]): the only backend that supports
//!   writes. Opened create-if-missing, read-write, append.
//! - **Read-only memory map** ([`MmapIo`]): used only during startup
//!   replay to speed up bulk sequential reads. The engine swaps every
//!   file back to buffered IO before accepting user operations.

pub mod file_io;
pub mod mmap;

pub use file_io::FileIo;
pub use mmap::MmapIo;

use std::path::Path;

use crate::error::Result;

/// Which IO backend a data file is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoType {
    /// Buffered read-write file IO.
    StandardFile,

    /// Read-only memory map, startup replay only.
    MemoryMap,
}

/// Unified read/write/sync/size interface over a single file.
///
/// Errors surface the underlying OS condition; nothing is recovered at
/// this layer. Closing is handled by dropping the manager.
pub trait IoManager: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Appends `buf` at the end of the file, returning the bytes written.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Flushes written data to the device.
    fn sync(&self) -> Result<()>;

    /// Returns the current file size in bytes.
    fn size(&self) -> Result<u64>;
}

/// Opens an IO manager of the requested type for `file_name`.
pub fn new_io_manager(file_name: &Path, io_type: IoType) -> Result<Box<dyn IoManager>> {
    match io_type {
        IoType::StandardFile => Ok(Box::new(FileIo::new(file_name)?)),
        IoType::MemoryMap => Ok(Box::new(MmapIo::new(file_name)?)),
    }
}
