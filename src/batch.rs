//! Atomic batched writes.
//!
//! A [`WriteBatch`] buffers mutations and commits them under a single
//! transaction sequence number. Every record of the batch is written
//! with the sequence folded into its key, followed by one commit marker
//! record; replay only applies records whose marker made it to disk, so
//! a torn batch disappears entirely after a crash.

use std::collections::HashMap;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::config::{IndexType, WriteBatchOptions};
use crate::data::log_record::{
    decode_uvarint, encode_uvarint, LogRecord, LogRecordPos, LogRecordType,
};
use crate::db::DB;
use crate::error::{Error, Result};

/// Sequence number marking a record as non-transactional.
pub(crate) const NON_TRANSACTION_SEQ_NO: u64 = 0;

/// Key of the commit marker record.
const TXN_FIN_KEY: &[u8] = b"txn-fin";

/// A buffer of pending mutations committed atomically.
///
/// Within a batch the last write to a key wins. Nothing is visible to
/// readers until [`commit`](WriteBatch::commit) returns.
pub struct WriteBatch<'a> {
    db: &'a DB,
    options: WriteBatchOptions,
    pending_writes: Mutex<HashMap<Vec<u8>, LogRecord>>,
}

impl DB {
    /// Creates a new write batch over this engine.
    ///
    /// With the on-disk index backend the engine cannot recover the
    /// transaction sequence from a log replay, so opening a batch on a
    /// pre-existing directory without a persisted sequence file is a
    /// configuration error.
    pub fn new_write_batch(&self, options: WriteBatchOptions) -> Result<WriteBatch<'_>> {
        if self.options.index_type == IndexType::BPlusTree
            && !self.seq_no_file_exists
            && !self.is_initial
        {
            return Err(Error::SeqNoFileNotFound);
        }

        Ok(WriteBatch { db: self, options, pending_writes: Mutex::new(HashMap::new()) })
    }
}

impl WriteBatch<'_> {
    /// Stages a put of `value` under `key`.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }

        let record = LogRecord {
            key: key.to_vec(),
            value: value.to_vec(),
            rec_type: LogRecordType::Normal,
        };
        self.pending_writes.lock().insert(key.to_vec(), record);
        Ok(())
    }

    /// Stages a delete of `key`.
    ///
    /// Deleting a key that exists neither in the index nor in the batch
    /// is a no-op that also drops any previously staged write for it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyIsEmpty);
        }

        let mut pending = self.pending_writes.lock();
        if self.db.index.get(key).is_none() {
            pending.remove(key);
            return Ok(());
        }

        let record =
            LogRecord { key: key.to_vec(), value: Vec::new(), rec_type: LogRecordType::Deleted };
        pending.insert(key.to_vec(), record);
        Ok(())
    }

    /// Commits the batch: writes every staged record plus the commit
    /// marker, optionally syncs, then applies the mutations to the
    /// index. Committing an empty batch is a successful no-op.
    pub fn commit(&self) -> Result<()> {
        let mut pending = self.pending_writes.lock();
        if pending.is_empty() {
            return Ok(());
        }
        if pending.len() > self.options.max_batch_num as usize {
            return Err(Error::ExceedMaxBatchNum);
        }

        // the engine write lock serializes this commit against every
        // other writer
        let mut state = self.db.state.write();

        let seq_no = self.db.seq_no.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;

        let mut positions: HashMap<Vec<u8>, LogRecordPos> = HashMap::with_capacity(pending.len());
        for (key, record) in pending.iter() {
            let pos = self.db.append_log_record(
                &mut state,
                &LogRecord {
                    key: log_record_key_with_seq(key, seq_no),
                    value: record.value.clone(),
                    rec_type: record.rec_type,
                },
            )?;
            positions.insert(key.clone(), pos);
        }

        // the marker is what makes this batch visible to replay
        let fin_record = LogRecord {
            key: log_record_key_with_seq(TXN_FIN_KEY, seq_no),
            value: Vec::new(),
            rec_type: LogRecordType::TxnFinished,
        };
        self.db.append_log_record(&mut state, &fin_record)?;

        if self.options.sync_writes {
            if let Some(active) = state.active_file.as_ref() {
                active.sync()?;
            }
        }

        // apply to the index only once the marker is durable
        for (key, record) in pending.iter() {
            let pos = positions[key];
            let old_pos = match record.rec_type {
                LogRecordType::Normal => self.db.index.put(key.clone(), pos),
                LogRecordType::Deleted => self.db.index.delete(key),
                LogRecordType::TxnFinished => None,
            };
            if let Some(old_pos) = old_pos {
                self.db
                    .reclaim_size
                    .fetch_add(old_pos.size as u64, std::sync::atomic::Ordering::SeqCst);
            }
        }

        pending.clear();
        Ok(())
    }
}

/// Prefixes `key` with the transaction sequence number as an unsigned
/// varint, forming the composite key stored in the log.
pub(crate) fn log_record_key_with_seq(key: &[u8], seq_no: u64) -> Vec<u8> {
    let mut enc_key = BytesMut::with_capacity(key.len() + 10);
    encode_uvarint(&mut enc_key, seq_no);
    enc_key.extend_from_slice(key);
    enc_key.to_vec()
}

/// Splits a composite key back into the user key and its sequence
/// number.
pub(crate) fn parse_log_record_key(key: &[u8]) -> (Vec<u8>, u64) {
    let (seq_no, n) = decode_uvarint(key).unwrap_or((NON_TRANSACTION_SEQ_NO, 0));
    (key[n..].to_vec(), seq_no)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::data::data_file::data_file_name;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    #[test]
    fn test_key_with_seq_round_trip() {
        for seq_no in [0u64, 1, 127, 128, 1 << 20, u64::MAX] {
            let enc_key = log_record_key_with_seq(b"user-key", seq_no);
            let (key, parsed) = parse_log_record_key(&enc_key);
            assert_eq!(key, b"user-key");
            assert_eq!(parsed, seq_no);
        }
    }

    #[test]
    fn test_non_transactional_prefix_is_one_byte() {
        let enc_key = log_record_key_with_seq(b"k", NON_TRANSACTION_SEQ_NO);
        assert_eq!(enc_key, vec![0, b'k']);
    }

    /// A batch whose commit marker never reached the disk must vanish on
    /// reopen.
    #[test]
    fn test_torn_batch_is_dropped_at_replay() {
        let dir = TempDir::new().unwrap();
        let options = Options::new(dir.path());

        {
            let db = DB::open(options.clone()).unwrap();

            let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
            batch.put(b"x", b"1").unwrap();
            batch.put(b"y", b"2").unwrap();
            batch.commit().unwrap();

            let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
            batch.put(b"x", b"9").unwrap();
            batch.commit().unwrap();
            assert_eq!(db.get(b"x").unwrap(), b"9".to_vec());

            db.close().unwrap();
        }

        // chop the second batch's commit marker off the log tail,
        // simulating a crash between the data record and the marker
        let fin_record = LogRecord {
            key: log_record_key_with_seq(TXN_FIN_KEY, 2),
            value: Vec::new(),
            rec_type: LogRecordType::TxnFinished,
        };
        let marker_len = fin_record.encode().len() as u64;

        let file_path = data_file_name(dir.path(), 0);
        let file = OpenOptions::new().write(true).open(&file_path).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - marker_len).unwrap();
        drop(file);

        let db = DB::open(options).unwrap();
        assert_eq!(db.get(b"x").unwrap(), b"1".to_vec());
        assert_eq!(db.get(b"y").unwrap(), b"2".to_vec());
    }

    /// Truncating even further, into the middle of the batch's records,
    /// must not surface any intermediate state either.
    #[test]
    fn test_partially_written_batch_is_invisible() {
        let dir = TempDir::new().unwrap();
        let options = Options::new(dir.path());

        let boundary;
        {
            let db = DB::open(options.clone()).unwrap();
            db.put(b"stable", b"value").unwrap();

            let state = db.state.read();
            boundary = state.active_file.as_ref().unwrap().write_off();
            drop(state);

            let batch = db.new_write_batch(WriteBatchOptions::default()).unwrap();
            batch.put(b"a", b"1").unwrap();
            batch.put(b"b", b"2").unwrap();
            batch.commit().unwrap();
            db.close().unwrap();
        }

        // cut the log somewhere inside the batch
        let file_path = data_file_name(dir.path(), 0);
        let file = OpenOptions::new().write(true).open(&file_path).unwrap();
        file.set_len(boundary + 7).unwrap();
        drop(file);

        let db = DB::open(options).unwrap();
        assert_eq!(db.get(b"stable").unwrap(), b"value".to_vec());
        assert!(matches!(db.get(b"a"), Err(Error::KeyNotFound)));
        assert!(matches!(db.get(b"b"), Err(Error::KeyNotFound)));
    }
}
