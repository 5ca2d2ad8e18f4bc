//! User-facing database iterator.
//!
//! Wraps an index iterator with a byte-prefix filter and a direction
//! flag. Keys come from an ordered snapshot taken when the iterator is
//! created; values are resolved lazily through the engine's read path.

use crate::config::IteratorOptions;
use crate::db::DB;
use crate::error::Result;
use crate::index::IndexIterator;

/// Prefix-filtered cursor over the database.
///
/// # Example
///
/// ```rust,no_run
/// use caskdb::{IteratorOptions, Options, DB};
///
/// # fn main() -> Result<(), caskdb::Error> {
/// let db = DB::open(Options::new("./data"))?;
/// db.put(b"user:1", b"alice")?;
/// db.put(b"user:2", b"bob")?;
///
/// let mut iter = db.iter(IteratorOptions { prefix: b"user:".to_vec(), ..Default::default() });
/// while iter.valid() {
///     println!("{:?} => {:?}", iter.key(), iter.value()?);
///     iter.next();
/// }
/// # Ok(())
/// # }
/// ```
pub struct DBIterator<'a> {
    index_iter: Box<dyn IndexIterator>,
    db: &'a DB,
    options: IteratorOptions,
}

impl DB {
    /// Creates an iterator positioned at the first matching key.
    pub fn iter(&self, options: IteratorOptions) -> DBIterator<'_> {
        let mut iter = DBIterator {
            index_iter: self.index.iterator(options.reverse),
            db: self,
            options,
        };
        iter.skip_to_next();
        iter
    }
}

impl DBIterator<'_> {
    /// Goes back to the first matching key.
    pub fn rewind(&mut self) {
        self.index_iter.rewind();
        self.skip_to_next();
    }

    /// Positions at the first matching key >= `key` (forward) or
    /// <= `key` (reverse).
    pub fn seek(&mut self, key: &[u8]) {
        self.index_iter.seek(key);
        self.skip_to_next();
    }

    /// Advances to the next matching key.
    pub fn next(&mut self) {
        self.index_iter.next();
        self.skip_to_next();
    }

    /// Whether the cursor points at an entry.
    pub fn valid(&self) -> bool {
        self.index_iter.valid()
    }

    /// Key of the current entry.
    pub fn key(&self) -> &[u8] {
        self.index_iter.key()
    }

    /// Value of the current entry, read from the data file it lives in.
    pub fn value(&self) -> Result<Vec<u8>> {
        let pos = self.index_iter.value();
        let state = self.db.state.read();
        self.db.get_value_by_position(&state, &pos)
    }

    /// Skips entries whose key does not carry the configured prefix.
    fn skip_to_next(&mut self) {
        if self.options.prefix.is_empty() {
            return;
        }
        while self.index_iter.valid() {
            if self.index_iter.key().starts_with(&self.options.prefix) {
                break;
            }
            self.index_iter.next();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use tempfile::TempDir;

    #[test]
    fn test_iterator_prefix_skips_between_matches() {
        let dir = TempDir::new().unwrap();
        let db = DB::open(Options::new(dir.path())).unwrap();

        // prefix matches are interleaved with other keys
        for key in ["apple", "user:1", "banana", "user:2", "zebra", "user:3"] {
            db.put(key.as_bytes(), b"v").unwrap();
        }

        let mut iter =
            db.iter(IteratorOptions { prefix: b"user:".to_vec(), reverse: false });

        let mut keys = Vec::new();
        while iter.valid() {
            keys.push(String::from_utf8(iter.key().to_vec()).unwrap());
            iter.next();
        }
        assert_eq!(keys, vec!["user:1", "user:2", "user:3"]);
    }

    #[test]
    fn test_iterator_empty_database() {
        let dir = TempDir::new().unwrap();
        let db = DB::open(Options::new(dir.path())).unwrap();

        let iter = db.iter(IteratorOptions::default());
        assert!(!iter.valid());
    }
}
