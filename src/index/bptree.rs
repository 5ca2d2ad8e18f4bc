//! On-disk B+tree index backend.
//!
//! Persists the key -> position mapping in a `jammdb` file inside the
//! data directory, so the engine can skip log replay at startup. Backend
//! failures here are invariant violations rather than recoverable
//! conditions, mirroring how the other backends treat their internal
//! state.

use std::io;
use std::path::Path;

use jammdb::DB as JammDB;

use crate::data::log_record::{decode_log_record_pos, encode_log_record_pos, LogRecordPos};
use crate::error::{Error, Result};
use crate::index::{IndexIterator, Indexer, SnapshotIterator};

/// File name of the persisted index inside the data directory.
pub(crate) const BPTREE_INDEX_FILE_NAME: &str = "bptree-index";

const BPTREE_BUCKET_NAME: &str = "caskdb-index";

/// B+tree index persisted on disk.
pub struct BPlusTree {
    tree: JammDB,
}

impl BPlusTree {
    /// Opens (or creates) the index file inside `dir_path` and makes sure
    /// the bucket exists.
    pub fn new(dir_path: &Path) -> Result<Self> {
        let tree = JammDB::open(dir_path.join(BPTREE_INDEX_FILE_NAME))
            .map_err(to_io_error)?;

        let tx = tree.tx(true).map_err(to_io_error)?;
        tx.get_or_create_bucket(BPTREE_BUCKET_NAME).map_err(to_io_error)?;
        tx.commit().map_err(to_io_error)?;

        Ok(Self { tree })
    }
}

fn to_io_error(err: jammdb::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, err))
}

impl Indexer for BPlusTree {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
        let tx = self.tree.tx(true).expect("failed to begin a bptree transaction");
        let bucket = tx
            .get_bucket(BPTREE_BUCKET_NAME)
            .expect("failed to open the bptree bucket");

        let old = bucket.get_kv(&key).map(|kv| {
            decode_log_record_pos(kv.value()).expect("corrupted position in bptree index")
        });

        bucket
            .put(key, encode_log_record_pos(&pos))
            .expect("failed to write to the bptree bucket");
        tx.commit().expect("failed to commit a bptree transaction");

        old
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        let tx = self.tree.tx(false).expect("failed to begin a bptree transaction");
        let bucket = tx
            .get_bucket(BPTREE_BUCKET_NAME)
            .expect("failed to open the bptree bucket");

        bucket.get_kv(key).map(|kv| {
            decode_log_record_pos(kv.value()).expect("corrupted position in bptree index")
        })
    }

    fn delete(&self, key: &[u8]) -> Option<LogRecordPos> {
        let tx = self.tree.tx(true).expect("failed to begin a bptree transaction");
        let bucket = tx
            .get_bucket(BPTREE_BUCKET_NAME)
            .expect("failed to open the bptree bucket");

        let old = bucket.delete(key).ok().map(|kv| {
            decode_log_record_pos(kv.value()).expect("corrupted position in bptree index")
        });
        tx.commit().expect("failed to commit a bptree transaction");

        old
    }

    fn size(&self) -> usize {
        let tx = self.tree.tx(false).expect("failed to begin a bptree transaction");
        let bucket = tx
            .get_bucket(BPTREE_BUCKET_NAME)
            .expect("failed to open the bptree bucket");

        bucket.cursor().count()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let tx = self.tree.tx(false).expect("failed to begin a bptree transaction");
        let bucket = tx
            .get_bucket(BPTREE_BUCKET_NAME)
            .expect("failed to open the bptree bucket");

        let mut items = Vec::new();
        for data in bucket.cursor() {
            let pos = decode_log_record_pos(data.kv().value())
                .expect("corrupted position in bptree index");
            items.push((data.key().to_vec(), pos));
        }
        Box::new(SnapshotIterator::new(items, reverse))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn pos(offset: u64) -> LogRecordPos {
        LogRecordPos { file_id: 1, offset, size: 16 }
    }

    #[test]
    fn test_bptree_put_and_get() {
        let dir = TempDir::new().unwrap();
        let index = BPlusTree::new(dir.path()).unwrap();

        assert!(index.put(b"key".to_vec(), pos(0)).is_none());
        assert_eq!(index.put(b"key".to_vec(), pos(64)), Some(pos(0)));
        assert_eq!(index.get(b"key"), Some(pos(64)));
        assert!(index.get(b"missing").is_none());
    }

    #[test]
    fn test_bptree_delete() {
        let dir = TempDir::new().unwrap();
        let index = BPlusTree::new(dir.path()).unwrap();

        index.put(b"key".to_vec(), pos(0));
        assert_eq!(index.delete(b"key"), Some(pos(0)));
        assert!(index.get(b"key").is_none());
        assert!(index.delete(b"key").is_none());
    }

    #[test]
    fn test_bptree_survives_reopen() {
        let dir = TempDir::new().unwrap();

        {
            let index = BPlusTree::new(dir.path()).unwrap();
            index.put(b"persisted".to_vec(), pos(128));
        }

        let index = BPlusTree::new(dir.path()).unwrap();
        assert_eq!(index.get(b"persisted"), Some(pos(128)));
        assert_eq!(index.size(), 1);
    }

    #[test]
    fn test_bptree_iterator_ordering() {
        let dir = TempDir::new().unwrap();
        let index = BPlusTree::new(dir.path()).unwrap();

        index.put(b"bb".to_vec(), pos(1));
        index.put(b"aa".to_vec(), pos(0));
        index.put(b"cc".to_vec(), pos(2));

        let mut iter = index.iterator(false);
        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(iter.key().to_vec());
            iter.next();
        }
        assert_eq!(keys, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);
    }
}
