//! # caskdb - a Bitcask-style log-structured key-value store
//!
//! caskdb is an embedded, single-writer storage engine. Every write is
//! appended to an immutable data file and an in-memory index maps each
//! key to the position of its most recent record, so a read costs one
//! index lookup plus one random file read.
//!
//! ## Architecture
//!
//! - **Data files**: numbered append-only segments; exactly one is
//!   active, the rest are sealed and read-only
//! - **Index**: ordered key -> position map with pluggable backends
//!   (btree, skiplist, on-disk B+tree)
//! - **Write batch**: atomic multi-key commits under a transaction
//!   sequence number and a commit marker record
//! - **Merge**: operator-triggered compaction that rewrites live records
//!   and emits a hint file to accelerate the next startup
//! - **Recovery**: on open, finish or discard a previous merge, load the
//!   hint file, then replay the remaining segments
//!
//! ## Example
//!
//! ```rust,no_run
//! use caskdb::{Options, DB};
//!
//! # fn main() -> Result<(), caskdb::Error> {
//! let db = DB::open(Options::new("./data"))?;
//!
//! db.put(b"key", b"value")?;
//! let value = db.get(b"key")?;
//! assert_eq!(value, b"value");
//!
//! db.delete(b"key")?;
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod batch;
pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod fio;
pub mod index;
pub mod iterator;
mod merge;
pub mod util;

pub use batch::WriteBatch;
pub use config::{IndexType, IteratorOptions, Options, WriteBatchOptions};
pub use db::{Stat, DB};
pub use error::{Error, Result};
pub use iterator::DBIterator;
