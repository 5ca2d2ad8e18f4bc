//! Ordered-tree index backend, the default.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::data::log_record::LogRecordPos;
use crate::error::Result;
use crate::index::{IndexIterator, Indexer, SnapshotIterator};

/// Balanced ordered tree guarded by a reader-writer lock. Writes take
/// the exclusive lock; reads share.
pub struct BTree {
    tree: RwLock<BTreeMap<Vec<u8>, LogRecordPos>>,
}

impl BTree {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self { tree: RwLock::new(BTreeMap::new()) }
    }
}

impl Default for BTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for BTree {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
        self.tree.write().insert(key, pos)
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.tree.read().get(key).copied()
    }

    fn delete(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.tree.write().remove(key)
    }

    fn size(&self) -> usize {
        self.tree.read().len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let items = self
            .tree
            .read()
            .iter()
            .map(|(key, pos)| (key.clone(), *pos))
            .collect();
        Box::new(SnapshotIterator::new(items, reverse))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
