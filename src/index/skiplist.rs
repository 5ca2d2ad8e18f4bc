//! Lock-free skiplist index backend.
//!
//! Same contract as the btree backend, backed by
//! `crossbeam_skiplist::SkipMap` so readers never block writers. The
//! engine still serializes writers through its own lock.

use crossbeam_skiplist::SkipMap;

use crate::data::log_record::LogRecordPos;
use crate::error::Result;
use crate::index::{IndexIterator, Indexer, SnapshotIterator};

/// Ordered skiplist index.
pub struct SkipList {
    map: SkipMap<Vec<u8>, LogRecordPos>,
}

impl SkipList {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self { map: SkipMap::new() }
    }
}

impl Default for SkipList {
    fn default() -> Self {
        Self::new()
    }
}

impl Indexer for SkipList {
    fn put(&self, key: Vec<u8>, pos: LogRecordPos) -> Option<LogRecordPos> {
        // writers are serialized by the engine, so read-then-insert is
        // not racy for the returned old position
        let old = self.map.get(&key).map(|entry| *entry.value());
        self.map.insert(key, pos);
        old
    }

    fn get(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.map.get(key).map(|entry| *entry.value())
    }

    fn delete(&self, key: &[u8]) -> Option<LogRecordPos> {
        self.map.remove(key).map(|entry| *entry.value())
    }

    fn size(&self) -> usize {
        self.map.len()
    }

    fn iterator(&self, reverse: bool) -> Box<dyn IndexIterator> {
        let items = self
            .map
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        Box::new(SnapshotIterator::new(items, reverse))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
