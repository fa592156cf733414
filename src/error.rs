//! Error kinds surfaced by the engine.
//!
//! Every public operation returns [`eyre::Result`] so call sites can attach
//! context freely; the variants below are the stable, matchable failure
//! kinds. Use `Report::downcast_ref::<Error>()` to branch on them:
//!
//! ```ignore
//! match tx.create_bucket(b"widgets") {
//!     Err(e) if matches!(e.downcast_ref(), Some(Error::BucketExists)) => { /* ... */ }
//!     other => other?,
//! };
//! ```

use thiserror::Error;

/// Stable failure kinds. Anything not covered here (I/O failures, corrupt
/// page parses) surfaces as a plain `eyre` report with context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("database is not open")]
    DatabaseNotOpen,

    #[error("database is opened in read-only mode")]
    DatabaseReadOnly,

    #[error("transaction has already been committed or rolled back")]
    TransactionClosed,

    #[error("transaction is not writable")]
    TransactionNotWritable,

    #[error("commit and rollback are not allowed inside a managed transaction")]
    ManagedTxOperationDisallowed,

    #[error("bucket not found")]
    BucketNotFound,

    #[error("bucket already exists")]
    BucketExists,

    #[error("bucket name required")]
    BucketNameRequired,

    #[error("key required")]
    KeyRequired,

    #[error("key too large")]
    KeyTooLarge,

    #[error("value too large")]
    ValueTooLarge,

    #[error("incompatible value")]
    IncompatibleValue,

    #[error("cursor is not positioned on an entry")]
    CursorNotPositioned,

    #[error("invalid magic in meta page")]
    InvalidMagic,

    #[error("unsupported data file version")]
    InvalidVersion,

    #[error("meta page checksum mismatch")]
    InvalidChecksum,

    #[error("pgid {pgid} above high water mark {high_water}")]
    PageIdAboveHighWaterMark { pgid: u64, high_water: u64 },

    #[error("page {pgid} already freed")]
    DoubleFree { pgid: u64 },

    #[error("branch element on page {pgid} references its own page")]
    CircularBranchReference { pgid: u64 },

    #[error("invalid page flags {flags:#06x}")]
    InvalidPageFlags { flags: u16 },

    #[error("commit failed")]
    CommitFailed,
}

impl Error {
    /// Whether an `eyre` report carries this kind anywhere in its chain.
    pub fn is(report: &eyre::Report, kind: &Error) -> bool {
        report
            .downcast_ref::<Error>()
            .map(|e| std::mem::discriminant(e) == std::mem::discriminant(kind))
            .unwrap_or(false)
    }
}
