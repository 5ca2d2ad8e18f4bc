//! Segment files.
//!
//! A [`DataFile`] owns one numbered segment plus its IO manager and
//! tracks the write offset. Segments are named by zero-padded file id
//! with a `.data` suffix; the same record layout is reused for the hint
//! file, the merge-finished marker and the sequence-number file.

use std::path::{Path, PathBuf};

use crate::data::log_record::{
    decode_log_record_header, encode_log_record_pos, LogRecord, LogRecordPos, LogRecordType,
    MAX_LOG_RECORD_HEADER_SIZE,
};
use crate::error::{Error, Result};
use crate::fio::{new_io_manager, IoManager, IoType};

/// Suffix of every data segment file.
pub const DATA_FILE_NAME_SUFFIX: &str = ".data";

/// Name of the hint file produced by merge.
pub const HINT_FILE_NAME: &str = "hint-index";

/// Name of the merge commit marker file.
pub const MERGE_FINISHED_FILE_NAME: &str = "merge-finished";

/// Name of the persisted transaction sequence number file.
pub const SEQ_NO_FILE_NAME: &str = "seq-no";

/// Builds the path of the segment with the given id inside `dir_path`.
pub fn data_file_name(dir_path: &Path, file_id: u32) -> PathBuf {
    dir_path.join(format!("{:09}{}", file_id, DATA_FILE_NAME_SUFFIX))
}

/// One open segment file.
pub struct DataFile {
    file_id: u32,
    write_off: u64,
    io_manager: Box<dyn IoManager>,
}

impl DataFile {
    /// Opens the segment `file_id` inside `dir_path`, creating it if it
    /// does not exist yet.
    pub fn new(dir_path: &Path, file_id: u32, io_type: IoType) -> Result<Self> {
        Self::open(&data_file_name(dir_path, file_id), file_id, io_type)
    }

    /// Opens the hint file inside `dir_path`.
    pub fn hint_file(dir_path: &Path) -> Result<Self> {
        Self::open(&dir_path.join(HINT_FILE_NAME), 0, IoType::StandardFile)
    }

    /// Opens the merge-finished marker file inside `dir_path`.
    pub fn merge_finished_file(dir_path: &Path) -> Result<Self> {
        Self::open(&dir_path.join(MERGE_FINISHED_FILE_NAME), 0, IoType::StandardFile)
    }

    /// Opens the sequence number file inside `dir_path`.
    pub fn seq_no_file(dir_path: &Path) -> Result<Self> {
        Self::open(&dir_path.join(SEQ_NO_FILE_NAME), 0, IoType::StandardFile)
    }

    fn open(file_name: &Path, file_id: u32, io_type: IoType) -> Result<Self> {
        let io_manager = new_io_manager(file_name, io_type)?;
        Ok(Self { file_id, write_off: 0, io_manager })
    }

    /// Segment identifier of this file.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Offset the next append will land at.
    pub fn write_off(&self) -> u64 {
        self.write_off
    }

    /// Overrides the write offset, used after startup replay.
    pub fn set_write_off(&mut self, offset: u64) {
        self.write_off = offset;
    }

    /// Current size of the file on disk.
    pub fn file_size(&self) -> Result<u64> {
        self.io_manager.size()
    }

    /// Reads the record starting at `offset`.
    ///
    /// Returns the record and its total encoded size, or `None` at the
    /// end of meaningful data: past the file size, inside an all-zero
    /// region, or where a torn tail claims more payload than the file
    /// holds. A checksum mismatch is [`Error::InvalidCrc`].
    pub fn read_log_record(&self, offset: u64) -> Result<Option<(LogRecord, u64)>> {
        let file_size = self.io_manager.size()?;
        if offset >= file_size {
            return Ok(None);
        }

        // the header is variable-length, so bound the read window at EOF
        let header_len = std::cmp::min(MAX_LOG_RECORD_HEADER_SIZE as u64, file_size - offset);
        let mut header_buf = vec![0u8; header_len as usize];
        self.io_manager.read(&mut header_buf, offset)?;

        let Some((header, header_size)) = decode_log_record_header(&header_buf) else {
            return Ok(None);
        };
        if header.crc == 0 && header.key_size == 0 && header.value_size == 0 {
            return Ok(None);
        }

        let key_size = header.key_size as u64;
        let value_size = header.value_size as u64;
        if offset + header_size as u64 + key_size + value_size > file_size {
            return Ok(None);
        }

        let mut kv_buf = vec![0u8; (key_size + value_size) as usize];
        if !kv_buf.is_empty() {
            self.io_manager.read(&mut kv_buf, offset + header_size as u64)?;
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_buf[4..header_size]);
        hasher.update(&kv_buf);
        let actual = hasher.finalize();
        if actual != header.crc {
            return Err(Error::InvalidCrc { expected: header.crc, actual });
        }

        let value = kv_buf.split_off(header.key_size as usize);
        let record =
            LogRecord { key: kv_buf, value, rec_type: LogRecordType::from_u8(header.rec_type) };
        let record_size = header_size as u64 + key_size + value_size;

        Ok(Some((record, record_size)))
    }

    /// Appends raw bytes and advances the write offset.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let written = self.io_manager.write(buf)?;
        self.write_off += written as u64;
        Ok(written)
    }

    /// Appends a hint record mapping `key` to an encoded position.
    pub fn write_hint_record(&mut self, key: Vec<u8>, pos: &LogRecordPos) -> Result<()> {
        let record = LogRecord {
            key,
            value: encode_log_record_pos(pos),
            rec_type: LogRecordType::Normal,
        };
        self.write(&record.encode())?;
        Ok(())
    }

    /// Flushes the file to the device.
    pub fn sync(&self) -> Result<()> {
        self.io_manager.sync()
    }

    /// Replaces the IO backend, used to swap from mmap back to buffered
    /// file IO once startup replay is done.
    pub fn set_io_manager(&mut self, dir_path: &Path, io_type: IoType) -> Result<()> {
        self.io_manager = new_io_manager(&data_file_name(dir_path, self.file_id), io_type)?;
        Ok(())
    }
}
