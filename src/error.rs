//! Error types for the caskdb storage engine.

use std::fmt;
use std::io;

/// The result type used throughout caskdb.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for caskdb operations.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(io::Error),

    /// The user supplied a zero-length key.
    KeyIsEmpty,

    /// The key is absent or logically deleted.
    KeyNotFound,

    /// An internal invariant was violated while updating the index.
    IndexUpdateFailed,

    /// A position referenced a segment file id the engine does not know.
    DataFileNotFound,

    /// A file in the data directory does not look like a valid segment
    /// or control file.
    DataDirectoryCorrupted,

    /// The batch holds more records than the configured cap.
    ExceedMaxBatchNum,

    /// Another merge is already running on this engine.
    MergeInProgress,

    /// The reclaimable ratio has not reached the configured threshold.
    MergeRatioUnreached,

    /// The data volume lacks the free space a merge would need.
    NoEnoughSpaceForMerge,

    /// Another process holds the directory lock.
    DatabaseIsUsing,

    /// A record checksum mismatch was detected.
    InvalidCrc {
        /// The checksum stored in the record header.
        expected: u32,
        /// The checksum recomputed over the record body.
        actual: u32,
    },

    /// An invalid configuration option was supplied.
    InvalidOptions(String),

    /// The on-disk index backend has no persisted sequence number to
    /// resume transactions from.
    SeqNoFileNotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::KeyIsEmpty => write!(f, "the key is empty"),
            Error::KeyNotFound => write!(f, "key not found in database"),
            Error::IndexUpdateFailed => write!(f, "failed to update the index"),
            Error::DataFileNotFound => write!(f, "data file not found"),
            Error::DataDirectoryCorrupted => {
                write!(f, "the database directory may be corrupted")
            }
            Error::ExceedMaxBatchNum => {
                write!(f, "exceed the max batch num in one write batch")
            }
            Error::MergeInProgress => write!(f, "merge is in progress, try again later"),
            Error::MergeRatioUnreached => {
                write!(f, "the merge ratio does not reach the option")
            }
            Error::NoEnoughSpaceForMerge => {
                write!(f, "no enough disk space for merge")
            }
            Error::DatabaseIsUsing => {
                write!(f, "the database directory is used by another process")
            }
            Error::InvalidCrc { expected, actual } => {
                write!(f, "invalid crc: expected {:#x}, got {:#x}", expected, actual)
            }
            Error::InvalidOptions(msg) => write!(f, "invalid options: {}", msg),
            Error::SeqNoFileNotFound => {
                write!(f, "sequence number file not found, write batch is unavailable")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
