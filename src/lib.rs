//! An embedded time-series key-value store for topic-addressed messages.
//!
//! Entries are put under dotted topics (`sensor.room1.temp`), become
//! queryable immediately through an in-memory staging store, durable
//! through a write-ahead log, and move into topic-keyed time-window blocks
//! plus index and data files on sync. Queries address topics directly or
//! through wildcards: `*` matches one level, `...` matches any trailing
//! levels, and options such as `?last=1h` bound the time window.

pub mod bufpool;
pub mod cipher;
pub mod clock;
pub mod data;
pub mod db;
mod dbsync;
pub mod entry;
pub mod error;
pub mod filter;
pub mod fio;
pub mod flock;
pub mod hash;
pub mod index;
pub mod memdb;
pub mod meter;
pub mod options;
pub mod scheduler;
mod tasks;
pub mod timewindow;
pub mod tmpfs;
pub mod topic;
pub mod trie;
pub mod wal;

pub use cipher::Cipher;
pub use db::{Batch, Db, Item, ItemIterator, Query};
pub use entry::Entry;
pub use error::{Error, Result};
pub use meter::Varz;
pub use options::{Options, WorkerOptions};
