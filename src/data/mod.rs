//! On-disk data format: the log record codec and the segment file.

pub mod data_file;
pub mod log_record;

pub use data_file::DataFile;
pub use log_record::{LogRecord, LogRecordPos, LogRecordType};
