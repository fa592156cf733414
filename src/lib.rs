//! # nestdb: Embedded Transactional Key/Value Store
//!
//! nestdb keeps ordered maps of byte keys to byte values ("buckets",
//! which nest) in a single file of fixed-size pages, organized as a
//! copy-on-write B+tree over a memory-mapped file.
//!
//! - **ACID transactions**: one writer, many concurrent readers, full
//!   serializability through snapshot meta pages.
//! - **Crash safe**: commits alternate between two checksummed meta
//!   pages; a torn commit is simply never observed.
//! - **Zero-copy reads**: read-only transactions hand out slices backed
//!   directly by the memory map.
//!
//! ## Quick Start
//!
//! ```ignore
//! use nestdb::{DB, Options};
//!
//! let db = DB::open("app.db", Options::default())?;
//!
//! db.execute_in_write_tx(|tx| {
//!     let bucket = tx.create_bucket_if_not_exists(b"widgets")?;
//!     bucket.put(b"foo", b"bar")
//! })?;
//!
//! db.execute_in_read_tx(|tx| {
//!     let bucket = tx.bucket(b"widgets")?.expect("created above");
//!     assert_eq!(bucket.get(b"foo")?.as_deref(), Some(&b"bar"[..]));
//!     Ok(())
//! })?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────┐
//! │       DB (file, mmap, admission)      │
//! ├───────────────────────────────────────┤
//! │  Tx (snapshot meta, dirty pages)      │
//! ├───────────────────────────────────────┤
//! │  Bucket (nested ordered maps)         │
//! ├───────────────────────────────────────┤
//! │  Cursor  ⇄  Node (COW B+tree)         │
//! ├───────────────────────────────────────┤
//! │  Pages: framing, meta, freelist       │
//! ├───────────────────────────────────────┤
//! │  Mmap (reads) + pwrite/fsync (writes) │
//! └───────────────────────────────────────┘
//! ```
//!
//! On commit, modified nodes are rebalanced, split and written to freshly
//! allocated pages (never in place), the freelist is persisted, data is
//! fsync'd, and finally the meta page for `txid % 2` is written. Freed
//! pages return to circulation only once no live reader can still
//! reference them.
//!
//! ## Caveats
//!
//! - Keys and values are limited to 32 KiB and 2 GiB respectively.
//! - The file never shrinks; freed pages are reused, not returned.
//! - A long-running read transaction pins every page of its snapshot.

mod bucket;
mod cursor;
mod db;
mod error;
mod node;
mod options;
mod pool;
mod storage;
mod tx;

pub use bucket::{Bucket, BucketStats, DEFAULT_FILL_PERCENT, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use cursor::{Cursor, Entry};
pub use db::{DbStats, DB};
pub use error::Error;
pub use options::Options;
pub use storage::PAGE_SIZE;
pub use tx::{Tx, TxStats};

/// Crate-wide result type; failure kinds are [`Error`], context rides on
/// the report.
pub type Result<T> = eyre::Result<T>;
