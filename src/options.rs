//! Open-time configuration.

use std::time::Duration;

/// Options accepted by [`crate::DB::open`].
///
/// The defaults give a writable, fully durable database.
#[derive(Debug, Clone)]
pub struct Options {
    /// Open the file without write access and without taking the file lock.
    /// All write transactions fail with `DatabaseReadOnly`.
    pub read_only: bool,

    /// Skip fsync after commits. Bulk-load optimization only: a crash can
    /// lose or corrupt recent commits. THIS IS UNSAFE for normal use.
    pub no_sync: bool,

    /// Lower bound for the initial memory map, in bytes. The map never
    /// shrinks below the file size and is rounded by the doubling schedule.
    pub initial_mmap_size: usize,

    /// Reserved for a bounded wait on the file lock. Currently unused; a
    /// held lock fails the open immediately.
    pub timeout: Option<Duration>,

    /// Run a full consistency check after every commit and fail the commit
    /// if it does not hold. Large performance impact; debugging only.
    pub strict_mode: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            no_sync: false,
            initial_mmap_size: 0,
            timeout: None,
            strict_mode: false,
        }
    }
}
