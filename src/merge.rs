//! Merge (compaction) and its recovery.
//!
//! Merge rewrites every live record from the sealed segments into a
//! scratch engine rooted at a sibling `<base>-merge` directory, emits a
//! hint record per live key, and finally writes a `merge-finished`
//! marker carrying the first file id that did not participate. The
//! marker is the atomic commit point: at the next open the merge
//! directory either replaces the superseded segments wholesale or is
//! discarded untouched.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use crate::batch::{log_record_key_with_seq, parse_log_record_key, NON_TRANSACTION_SEQ_NO};
use crate::config::IndexType;
use crate::data::data_file::{
    data_file_name, DataFile, HINT_FILE_NAME, MERGE_FINISHED_FILE_NAME, SEQ_NO_FILE_NAME,
};
use crate::data::log_record::{decode_log_record_pos, LogRecord, LogRecordType};
use crate::db::{DB, FILE_LOCK_NAME};
use crate::error::{Error, Result};
use crate::index::bptree::BPTREE_INDEX_FILE_NAME;
use crate::index::Indexer;
use crate::util;

const MERGE_DIR_NAME_SUFFIX: &str = "-merge";
const MERGE_FINISHED_KEY: &[u8] = b"merge.finished";

impl DB {
    /// Compacts the database: rewrites live records, drops superseded
    /// ones and produces a hint file for the next startup.
    ///
    /// Only the preparation phase (sealing the active file, snapshotting
    /// the sealed segments) holds the write lock; the rewriting runs
    /// concurrently with user writes. A database that has never been
    /// written to merges trivially.
    pub fn merge(&self) -> Result<()> {
        let (merge_files, non_merge_file_id) = {
            let mut state = self.state.write();

            if state.active_file.is_none() {
                return Ok(());
            }
            if state.is_merging {
                return Err(Error::MergeInProgress);
            }

            let total_size = util::dir_size(&self.options.dir_path)?;
            let reclaimable = self.reclaim_size.load(Ordering::SeqCst);
            if (reclaimable as f32) / (total_size as f32) < self.options.data_file_merge_ratio {
                return Err(Error::MergeRatioUnreached);
            }

            let available = util::available_disk_size(&self.options.dir_path)?;
            if total_size.saturating_sub(reclaimable) >= available {
                return Err(Error::NoEnoughSpaceForMerge);
            }

            // seal the active file; everything below the new one is merged
            let active_id = match state.active_file.as_ref() {
                Some(active) => {
                    active.sync()?;
                    active.file_id()
                }
                None => return Ok(()),
            };
            let new_active = DataFile::new(
                &self.options.dir_path,
                active_id + 1,
                crate::fio::IoType::StandardFile,
            )?;
            let non_merge_file_id = new_active.file_id();
            if let Some(old) = state.active_file.replace(new_active) {
                state.older_files.insert(old.file_id(), Arc::new(old));
            }

            state.is_merging = true;

            let mut merge_files: Vec<Arc<DataFile>> =
                state.older_files.values().cloned().collect();
            merge_files.sort_by_key(|file| file.file_id());

            (merge_files, non_merge_file_id)
        };

        debug!(
            "merging {} sealed file(s), boundary id {}",
            merge_files.len(),
            non_merge_file_id
        );
        let result = self.do_merge(&merge_files, non_merge_file_id);
        self.state.write().is_merging = false;
        result
    }

    fn do_merge(&self, merge_files: &[Arc<DataFile>], non_merge_file_id: u32) -> Result<()> {
        let merge_path = merge_path(&self.options.dir_path);
        if merge_path.is_dir() {
            fs::remove_dir_all(&merge_path)?;
        }
        fs::create_dir_all(&merge_path)?;

        // a scratch engine receives the live records; its index is only
        // written, never read, so the in-memory backend always does
        let mut merge_options = self.options.clone();
        merge_options.dir_path = merge_path.clone();
        merge_options.sync_writes = false;
        merge_options.mmap_at_startup = false;
        merge_options.index_type = IndexType::BTree;
        let merge_db = DB::open(merge_options)?;

        let mut hint_file = DataFile::hint_file(&merge_path)?;

        for data_file in merge_files {
            let mut offset = 0u64;
            while let Some((record, size)) = data_file.read_log_record(offset)? {
                let (real_key, _) = parse_log_record_key(&record.key);

                // a record is live iff the index still points at it
                let live = self
                    .index
                    .get(&real_key)
                    .is_some_and(|pos| {
                        pos.file_id == data_file.file_id() && pos.offset == offset
                    });
                if live {
                    // merged records are post-transactional: rewrite with
                    // sequence zero, no commit marker needed
                    let rewritten = LogRecord {
                        key: log_record_key_with_seq(&real_key, NON_TRANSACTION_SEQ_NO),
                        value: record.value,
                        rec_type: record.rec_type,
                    };
                    let merge_pos = merge_db.append_log_record_with_lock(&rewritten)?;
                    hint_file.write_hint_record(real_key, &merge_pos)?;
                }

                offset += size;
            }
        }

        hint_file.sync()?;
        merge_db.sync()?;

        // the marker commits the merge; its value names the boundary
        let mut merge_finished_file = DataFile::merge_finished_file(&merge_path)?;
        let record = LogRecord {
            key: MERGE_FINISHED_KEY.to_vec(),
            value: non_merge_file_id.to_string().into_bytes(),
            rec_type: LogRecordType::Normal,
        };
        merge_finished_file.write(&record.encode())?;
        merge_finished_file.sync()?;

        Ok(())
    }
}

/// Sibling directory a merge works in: `/tmp/kv` -> `/tmp/kv-merge`.
pub(crate) fn merge_path(dir_path: &Path) -> PathBuf {
    let mut name = dir_path.file_name().map(OsString::from).unwrap_or_default();
    name.push(MERGE_DIR_NAME_SUFFIX);
    match dir_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Finishes (or discards) a previous merge. Runs at open, before the
/// engine enumerates its segments.
///
/// Without the `merge-finished` marker the merge never committed and the
/// whole directory is dropped. With it, every segment below the recorded
/// boundary is deleted from the primary directory and the merge output
/// moved into place. The scratch engine's lock file, sequence file and
/// index file never move.
pub(crate) fn load_merge_files(dir_path: &Path) -> Result<()> {
    let merge_path = merge_path(dir_path);
    if !merge_path.is_dir() {
        return Ok(());
    }

    let mut merge_finished = false;
    let mut merge_file_names: Vec<OsString> = Vec::new();
    for entry in fs::read_dir(&merge_path)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == MERGE_FINISHED_FILE_NAME {
            merge_finished = true;
        }
        if name == SEQ_NO_FILE_NAME || name == FILE_LOCK_NAME || name == BPTREE_INDEX_FILE_NAME {
            continue;
        }
        merge_file_names.push(name);
    }

    if !merge_finished {
        warn!("discarding unfinished merge directory {:?}", merge_path);
        fs::remove_dir_all(&merge_path)?;
        return Ok(());
    }

    let boundary = non_merge_file_id(&merge_path)?;

    // drop every segment the merge superseded
    for file_id in 0..boundary {
        let file_name = data_file_name(dir_path, file_id);
        if file_name.is_file() {
            fs::remove_file(file_name)?;
        }
    }

    for name in merge_file_names {
        fs::rename(merge_path.join(&name), dir_path.join(&name))?;
    }
    fs::remove_dir_all(&merge_path)?;

    debug!("installed merge output below boundary id {}", boundary);
    Ok(())
}

/// Reads the merge boundary out of the `merge-finished` marker inside
/// `dir_path`.
pub(crate) fn non_merge_file_id(dir_path: &Path) -> Result<u32> {
    let merge_finished_file = DataFile::merge_finished_file(dir_path)?;
    let (record, _) = merge_finished_file
        .read_log_record(0)?
        .ok_or(Error::DataDirectoryCorrupted)?;

    String::from_utf8(record.value)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .ok_or(Error::DataDirectoryCorrupted)
}

/// Loads every record of the hint file straight into the index.
pub(crate) fn load_index_from_hint_file(dir_path: &Path, index: &dyn Indexer) -> Result<()> {
    if !dir_path.join(HINT_FILE_NAME).is_file() {
        return Ok(());
    }

    let hint_file = DataFile::hint_file(dir_path)?;
    let mut offset = 0u64;
    while let Some((record, size)) = hint_file.read_log_record(offset)? {
        let pos = decode_log_record_pos(&record.value).ok_or(Error::DataDirectoryCorrupted)?;
        index.put(record.key, pos);
        offset += size;
    }

    Ok(())
}
