//! # Memory Mapping
//!
//! Read-only mapping of the data file. All mutation goes through positioned
//! file writes; the kernel keeps the shared mapping coherent with them, so
//! pages never need to be copied back.
//!
//! ## Growth
//!
//! Mappings are sized by a doubling schedule (32 KiB doubling up to 1 GiB,
//! then whole GiB steps), always a multiple of the page size. The file is
//! extended to the mapping size before mapping, so the map never extends
//! past EOF.
//!
//! ## Remap Discipline
//!
//! A grown file gets a brand-new [`Mapping`], and the database swaps it in
//! behind an `Arc`. Transactions clone the `Arc` when they begin and keep
//! resolving pages through their own clone, which pins a superseded mapping
//! until the last transaction referencing it ends. Pages a live snapshot
//! can still reach are never rewritten in place (the freelist holds them
//! pending until all older readers finish), so a transaction's view stays
//! stable without any copying or remap locks.

use std::fs::File;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;

use super::PAGE_SIZE;

/// One immutable mapping of the file. Superseded generations stay alive
/// while any transaction still holds the `Arc`.
#[derive(Debug)]
pub struct Mapping {
    mmap: Mmap,
}

impl Mapping {
    /// Maps the first `len` bytes of `file`. The file must be at least that
    /// large.
    pub fn new(file: &File, len: usize) -> Result<Self> {
        ensure!(len > 0, "cannot map an empty file");
        ensure!(
            len % PAGE_SIZE == 0,
            "mapping length {} is not a multiple of page size {}",
            len,
            PAGE_SIZE
        );

        let actual = file
            .metadata()
            .wrap_err("failed to stat database file before mapping")?
            .len();
        ensure!(
            actual >= len as u64,
            "file is {} bytes, cannot map {}",
            actual,
            len
        );

        // SAFETY: Mmap::map is unsafe because the underlying file could be
        // truncated or modified externally. This is safe because:
        // 1. Writable opens hold an exclusive advisory lock on the file, so
        //    no other process mutates it.
        // 2. The engine itself only appends (set_len growth) and rewrites
        //    pages the freelist has proven unreachable from live snapshots.
        // 3. The length was checked against file size above, so no access
        //    can fault past EOF.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .len(len)
                .map(file)
                .wrap_err("failed to memory-map database file")?
        };

        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Bounds-checked view of one page and its overflow run.
    pub fn page(&self, pgid: u64, count: usize) -> Result<&[u8]> {
        let start = pgid as usize * PAGE_SIZE;
        let end = start + count * PAGE_SIZE;
        ensure!(
            end <= self.mmap.len(),
            "page {} (+{} pages) out of mapped bounds ({} bytes)",
            pgid,
            count - 1,
            self.mmap.len()
        );

        Ok(&self.mmap[start..end])
    }
}

/// Mapping size for a file of `size` bytes: doubles from 32 KiB to 1 GiB,
/// then rounds up to the next whole GiB, always a multiple of the page
/// size.
pub fn mmap_size(size: u64) -> u64 {
    for i in 15..=30u32 {
        if size <= 1 << i {
            return 1 << i;
        }
    }

    const GIB: u64 = 1 << 30;
    let mut sz = size;
    let remainder = sz % GIB;
    if remainder > 0 {
        sz += GIB - remainder;
    }

    if sz % PAGE_SIZE as u64 != 0 {
        sz = (sz / PAGE_SIZE as u64 + 1) * PAGE_SIZE as u64;
    }

    sz
}
