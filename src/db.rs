//! The storage engine.
//!
//! A [`DB`] owns one data directory: an active segment receiving
//! appends, a map of sealed read-only segments, and an in-memory index
//! mapping each user key to the position of its latest record. Reads are
//! one index lookup plus one random file read; startup rebuilds the
//! index from the hint file and the data files.
//!
//! ## Locking
//!
//! A single reader-writer lock guards the mutable engine state (active
//! file, sealed file map, unsynced-byte counter, merge flag). Reads take
//! the shared lock for the duration of the file read; writes and file
//! rotation take the exclusive lock. The index carries its own interior
//! locking, and the transaction sequence is an atomic counter.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fs2::FileExt;
use log::{debug, warn};
use parking_lot::RwLock;

use crate::batch::{log_record_key_with_seq, parse_log_record_key, NON_TRANSACTION_SEQ_NO};
use crate::config::{IndexType, Options};
use crate::data::data_file::{
    DataFile, DATA_FILE_NAME_SUFFIX, MERGE_FINISHED_FILE_NAME, SEQ_NO_FILE_NAME,
};
use crate::data::log_record::{LogRecord, LogRecordPos, LogRecordType};
use crate::error::{Error, Result};
use crate::fio::IoType;
use crate::index::{self, Indexer};
use crate::merge::{load_index_from_hint_file, load_merge_files, non_merge_file_id};
use crate::util;

/// Key of the single record inside the sequence-number file.
const SEQ_NO_KEY: &str = "seq.no";

/// Name of the directory lock file.
pub(crate) const FILE_LOCK_NAME: &str = "flock";

/// A Bitcask-style key-value store over one data directory.
///
/// `DB` is safe to share across threads behind an `Arc`.
pub struct DB {
    pub(crate) options: Options,
    pub(crate) state: RwLock<DbState>,
    pub(crate) index: Box<dyn Indexer>,

    /// Latest transaction sequence number handed out.
    pub(crate) seq_no: AtomicU64,

    /// Bytes in the directory superseded by overwrites and deletes.
    pub(crate) reclaim_size: AtomicU64,

    /// Whether the data directory was created by this open call.
    pub(crate) is_initial: bool,

    /// Whether a persisted sequence number was found at open
    /// (relevant for the on-disk index backend only).
    pub(crate) seq_no_file_exists: bool,

    lock_file: File,
    closed: AtomicBool,
}

/// Mutable engine state guarded by the reader-writer lock.
pub(crate) struct DbState {
    /// Segment currently receiving appends; `None` until the first write.
    pub(crate) active_file: Option<DataFile>,

    /// Sealed read-only segments keyed by file id.
    pub(crate) older_files: HashMap<u32, Arc<DataFile>>,

    /// Bytes written since the last sync, for `bytes_per_sync`.
    pub(crate) bytes_write: u64,

    /// Whether a merge is currently running.
    pub(crate) is_merging: bool,
}

/// Point-in-time statistics about the engine.
#[derive(Debug, Clone)]
pub struct Stat {
    /// Number of keys in the index.
    pub key_num: usize,
    /// Number of open data files, active included.
    pub data_file_num: usize,
    /// Estimate of bytes a merge could reclaim.
    pub reclaimable_size: u64,
    /// Total bytes the data directory occupies on disk.
    pub disk_size: u64,
}

impl DB {
    /// Opens the database described by `options`, creating the directory
    /// if needed and recovering the index from previous runs.
    pub fn open(options: Options) -> Result<DB> {
        options.validate()?;

        let dir_path = options.dir_path.clone();
        let mut is_initial = false;
        if !dir_path.is_dir() {
            is_initial = true;
            fs::create_dir_all(&dir_path)?;
        } else if fs::read_dir(&dir_path)?.next().is_none() {
            is_initial = true;
        }

        // one engine per directory across processes
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir_path.join(FILE_LOCK_NAME))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(Error::DatabaseIsUsing);
        }

        // finish (or discard) a previous merge before looking at segments
        load_merge_files(&dir_path)?;

        let index = index::new_indexer(options.index_type, &dir_path)?;

        let file_ids = load_data_file_ids(&dir_path)?;
        let io_type = if options.mmap_at_startup {
            IoType::MemoryMap
        } else {
            IoType::StandardFile
        };
        let mut data_files = Vec::with_capacity(file_ids.len());
        for &file_id in &file_ids {
            data_files.push(DataFile::new(&dir_path, file_id, io_type)?);
        }

        let mut seq_no = NON_TRANSACTION_SEQ_NO;
        let mut reclaim_size = 0;
        let mut seq_no_file_exists = false;

        if options.index_type != IndexType::BPlusTree {
            // the hint file covers everything below the merge boundary
            load_index_from_hint_file(&dir_path, index.as_ref())?;
            let (replayed_seq_no, replayed_reclaim) =
                load_index_from_data_files(&dir_path, index.as_ref(), &mut data_files)?;
            seq_no = replayed_seq_no;
            reclaim_size = replayed_reclaim;
        }

        if options.mmap_at_startup {
            for data_file in &mut data_files {
                data_file.set_io_manager(&dir_path, IoType::StandardFile)?;
            }
        }

        let mut active_file = data_files.pop();
        let mut older_files = HashMap::new();
        for data_file in data_files {
            older_files.insert(data_file.file_id(), Arc::new(data_file));
        }

        if options.index_type == IndexType::BPlusTree {
            // no replay for the persisted index: restore the sequence
            // number and the append position directly
            let (loaded_seq_no, file_exists) = load_seq_no(&dir_path)?;
            seq_no = loaded_seq_no;
            seq_no_file_exists = file_exists;

            if let Some(active) = active_file.as_mut() {
                let size = active.file_size()?;
                active.set_write_off(size);
            }
        }

        debug!(
            "opened caskdb at {:?}: {} data file(s), {} key(s)",
            dir_path,
            file_ids.len(),
            index.size()
        );

        Ok(DB {
            options,
            state: RwLock::new(DbState {
                active_file,
                older_files,
                bytes_write: 0,
                is_merging: false,
            }),
            index,
            seq_no: AtomicU64::new(seq_no),
            reclaim_size: AtomicU64::new(reclaim_size),
            is_initial,
            seq_no_file_exists,
            lock_file,
            closed: AtomicBool::new(false),
        })
    }

    /// Stores `value` under `key`, overwriting any previous value.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }

        let record = LogRecord {
            key: log_record_key_with_seq(key, NON_TRANSACTION_SEQ_NO),
            value: value.to_vec(),
            rec_type: LogRecordType::Normal,
        };
        let pos = self.append_log_record_with_lock(&record)?;

        if let Some(old_pos) = self.index.put(key.to_vec(), pos) {
            self.reclaim_size.fetch_add(old_pos.size as u64, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Returns the value stored under `key`.
    ///
    /// Fails with [`Error::KeyNotFound`] when the key is absent or
    /// deleted.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.read();

        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        let pos = self.index.get(key).ok_or(Error::KeyNotFound)?;

        self.get_value_by_position(&state, &pos)
    }

    /// Deletes `key`. Deleting an absent key is a successful no-op.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }
        if self.index.get(key).is_none() {
            return Ok(());
        }

        let record = LogRecord {
            key: log_record_key_with_seq(key, NON_TRANSACTION_SEQ_NO),
            value: Vec::new(),
            rec_type: LogRecordType::Deleted,
        };
        let pos = self.append_log_record_with_lock(&record)?;

        // both the tombstone and the record it kills are reclaimable
        self.reclaim_size.fetch_add(pos.size as u64, Ordering::SeqCst);
        match self.index.delete(key) {
            Some(old_pos) => {
                self.reclaim_size.fetch_add(old_pos.size as u64, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::IndexUpdateFailed),
        }
    }

    /// Returns every key in ascending order.
    pub fn list_keys(&self) -> Vec<Vec<u8>> {
        let mut iter = self.index.iterator(false);
        let mut keys = Vec::with_capacity(self.index.size());
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        keys
    }

    /// Calls `f` for every key-value pair in ascending key order,
    /// stopping early when `f` returns `false`.
    pub fn fold<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> bool,
    {
        let state = self.state.read();
        let mut iter = self.index.iterator(false);
        while iter.valid() {
            let value = self.get_value_by_position(&state, &iter.value())?;
            if !f(iter.key(), &value) {
                break;
            }
            iter.next();
        }
        Ok(())
    }

    /// Flushes the active data file to the device.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.read();
        if let Some(active) = state.active_file.as_ref() {
            active.sync()?;
        }
        Ok(())
    }

    /// Returns statistics about the engine.
    pub fn stat(&self) -> Result<Stat> {
        let state = self.state.read();

        let mut data_file_num = state.older_files.len();
        if state.active_file.is_some() {
            data_file_num += 1;
        }

        Ok(Stat {
            key_num: self.index.size(),
            data_file_num,
            reclaimable_size: self.reclaim_size.load(Ordering::SeqCst),
            disk_size: util::dir_size(&self.options.dir_path)?,
        })
    }

    /// Copies the data directory to `dir`, excluding the lock file.
    pub fn backup<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        // the shared lock keeps segment files from changing underneath us
        let _state = self.state.read();
        util::copy_dir(&self.options.dir_path, dir.as_ref(), &[FILE_LOCK_NAME])
    }

    /// Closes the database: persists the transaction sequence for the
    /// on-disk index backend, syncs the active file and releases the
    /// directory lock. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let state = self.state.write();

        // the on-disk index never replays the log, so it cannot recover
        // the sequence number without this file
        if self.options.index_type == IndexType::BPlusTree {
            let mut seq_no_file = DataFile::seq_no_file(&self.options.dir_path)?;
            let record = LogRecord {
                key: SEQ_NO_KEY.as_bytes().to_vec(),
                value: self.seq_no.load(Ordering::SeqCst).to_string().into_bytes(),
                rec_type: LogRecordType::Normal,
            };
            seq_no_file.write(&record.encode())?;
            seq_no_file.sync()?;
        }

        self.index.close()?;
        if let Some(active) = state.active_file.as_ref() {
            active.sync()?;
        }
        drop(state);

        self.lock_file.unlock()?;
        Ok(())
    }

    /// Appends a record while holding the engine write lock.
    pub(crate) fn append_log_record_with_lock(&self, record: &LogRecord) -> Result<LogRecordPos> {
        let mut state = self.state.write();
        self.append_log_record(&mut state, record)
    }

    /// Appends a record to the active file. The caller must hold the
    /// engine write lock.
    pub(crate) fn append_log_record(
        &self,
        state: &mut DbState,
        record: &LogRecord,
    ) -> Result<LogRecordPos> {
        // the first write of a fresh database creates segment zero
        if state.active_file.is_none() {
            state.active_file =
                Some(DataFile::new(&self.options.dir_path, 0, IoType::StandardFile)?);
        }

        let enc_record = record.encode();
        let record_size = enc_record.len() as u64;

        // seal the active file when this record would cross the threshold
        if let Some(active) = state.active_file.as_ref() {
            if active.write_off() + record_size > self.options.data_file_size {
                active.sync()?;
                let new_file = DataFile::new(
                    &self.options.dir_path,
                    active.file_id() + 1,
                    IoType::StandardFile,
                )?;
                if let Some(old) = state.active_file.replace(new_file) {
                    state.older_files.insert(old.file_id(), Arc::new(old));
                }
            }
        }

        let active = state
            .active_file
            .as_mut()
            .expect("active data file was created above");

        // the returned position is the record's first byte, so capture
        // the offset before the append
        let offset = active.write_off();
        active.write(&enc_record)?;
        state.bytes_write += record_size;

        let need_sync = self.options.sync_writes
            || (self.options.bytes_per_sync > 0
                && state.bytes_write >= self.options.bytes_per_sync);
        if need_sync {
            active.sync()?;
            state.bytes_write = 0;
        }

        Ok(LogRecordPos { file_id: active.file_id(), offset, size: record_size as u32 })
    }

    /// Reads the record at `pos` and returns its value. The caller must
    /// hold at least the shared lock.
    pub(crate) fn get_value_by_position(
        &self,
        state: &DbState,
        pos: &LogRecordPos,
    ) -> Result<Vec<u8>> {
        let read = match state.active_file.as_ref() {
            Some(active) if active.file_id() == pos.file_id => {
                active.read_log_record(pos.offset)?
            }
            _ => match state.older_files.get(&pos.file_id) {
                Some(data_file) => data_file.read_log_record(pos.offset)?,
                None => return Err(Error::DataFileNotFound),
            },
        };

        let (record, _) = read.ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "log record truncated"))
        })?;

        // a tombstone here means the index raced a compaction
        if record.rec_type == LogRecordType::Deleted {
            return Err(Error::KeyNotFound);
        }

        Ok(record.value)
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error while closing caskdb: {}", e);
        }
    }
}

/// Collects and sorts the segment file ids present in `dir_path`.
fn load_data_file_ids(dir_path: &Path) -> Result<Vec<u32>> {
    let mut file_ids = Vec::new();
    for entry in fs::read_dir(dir_path)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(stem) = name.strip_suffix(DATA_FILE_NAME_SUFFIX) {
            let file_id = stem.parse::<u32>().map_err(|_| Error::DataDirectoryCorrupted)?;
            file_ids.push(file_id);
        }
    }
    file_ids.sort_unstable();
    Ok(file_ids)
}

/// A transactional record parked until its commit marker shows up.
struct TransactionRecord {
    record: LogRecord,
    pos: LogRecordPos,
}

/// Replays the data files into the index, returning the highest
/// transaction sequence seen and the reclaimable byte count.
///
/// Files below the merge boundary are already covered by the hint file
/// and are skipped. Records written under a transaction sequence are
/// parked until the matching commit marker; a batch whose marker never
/// made it to disk is dropped entirely.
fn load_index_from_data_files(
    dir_path: &Path,
    index: &dyn Indexer,
    data_files: &mut [DataFile],
) -> Result<(u64, u64)> {
    let mut current_seq_no = NON_TRANSACTION_SEQ_NO;
    let mut reclaim_size = 0u64;

    if data_files.is_empty() {
        return Ok((current_seq_no, reclaim_size));
    }

    // everything below the boundary was loaded from the hint file
    let mut merge_boundary = None;
    if dir_path.join(MERGE_FINISHED_FILE_NAME).is_file() {
        merge_boundary = Some(non_merge_file_id(dir_path)?);
    }

    let mut update_index = |key: Vec<u8>, rec_type: LogRecordType, pos: LogRecordPos| {
        if rec_type == LogRecordType::Deleted {
            if let Some(old_pos) = index.delete(&key) {
                reclaim_size += old_pos.size as u64;
            }
            reclaim_size += pos.size as u64;
        } else if let Some(old_pos) = index.put(key, pos) {
            reclaim_size += old_pos.size as u64;
        }
    };

    let mut transaction_records: HashMap<u64, Vec<TransactionRecord>> = HashMap::new();
    let num_files = data_files.len();

    for (i, data_file) in data_files.iter_mut().enumerate() {
        let file_id = data_file.file_id();
        if matches!(merge_boundary, Some(boundary) if file_id < boundary) {
            continue;
        }

        let mut offset = 0u64;
        while let Some((record, size)) = data_file.read_log_record(offset)? {
            let pos = LogRecordPos { file_id, offset, size: size as u32 };
            let (real_key, seq_no) = parse_log_record_key(&record.key);

            if seq_no == NON_TRANSACTION_SEQ_NO {
                update_index(real_key, record.rec_type, pos);
            } else if record.rec_type == LogRecordType::TxnFinished {
                // the marker makes the whole batch visible
                if let Some(records) = transaction_records.remove(&seq_no) {
                    for txn_record in records {
                        update_index(
                            txn_record.record.key,
                            txn_record.record.rec_type,
                            txn_record.pos,
                        );
                    }
                }
            } else {
                transaction_records.entry(seq_no).or_default().push(TransactionRecord {
                    record: LogRecord { key: real_key, ..record },
                    pos,
                });
            }

            if seq_no > current_seq_no {
                current_seq_no = seq_no;
            }

            offset += size;
        }

        // the active file keeps appending where the replay stopped
        if i == num_files - 1 {
            data_file.set_write_off(offset);
        }
    }

    Ok((current_seq_no, reclaim_size))
}

/// Reads (and consumes) the persisted sequence number, if present.
fn load_seq_no(dir_path: &Path) -> Result<(u64, bool)> {
    let file_name = dir_path.join(SEQ_NO_FILE_NAME);
    if !file_name.is_file() {
        return Ok((NON_TRANSACTION_SEQ_NO, false));
    }

    let seq_no_file = DataFile::seq_no_file(dir_path)?;
    let (record, _) = seq_no_file
        .read_log_record(0)?
        .ok_or(Error::DataDirectoryCorrupted)?;
    let seq_no = String::from_utf8(record.value)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or(Error::DataDirectoryCorrupted)?;

    // the file is stale the moment the engine is running; close() writes
    // a fresh one
    fs::remove_file(&file_name)?;

    Ok((seq_no, true))
}
