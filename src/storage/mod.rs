//! # Storage Module
//!
//! Byte-level concerns of the data file: page framing, the meta pages, the
//! freelist codec, the memory map and the advisory file lock.
//!
//! ## File Format
//!
//! The database is a single file of fixed-size pages:
//!
//! ```text
//! Offset 0:       Page 0  (meta copy A)
//! Offset 4096:    Page 1  (meta copy B)
//! Offset 8192:    Page 2  (freelist at creation time)
//! Offset 12288:   Page 3  (root bucket leaf at creation time)
//! ...
//! ```
//!
//! Every page starts with a 14-byte header (`id`, `overflow`, `flags`);
//! what follows depends on the flags. All multi-byte fields are
//! little-endian, handled by the zerocopy `U16`/`U32`/`U64` wrappers so
//! views work on unaligned mmap'd bytes.
//!
//! ## Safety Model
//!
//! The mapping is read-only; all mutation goes through dirty page buffers
//! and positioned file writes. Views over page bytes never own storage.

mod flock;
mod freelist;
mod meta;
mod mmap;
mod page;

pub(crate) use flock::FileLock;
pub(crate) use freelist::Freelist;
pub(crate) use meta::Meta;
pub(crate) use mmap::{mmap_size, Mapping};
pub(crate) use page::{
    branch_elem, branch_elem_mut, btree_page_count, leaf_elem, leaf_elem_mut, page_header,
    page_header_mut, page_kind, set_btree_page_count, BRANCH_ELEM_SIZE, BRANCH_PAGE_FLAG,
    BTREE_PAGE_HEADER_SIZE, BUCKET_LEAF_FLAG, FREELIST_PAGE_FLAG, LEAF_ELEM_SIZE,
    LEAF_PAGE_FLAG, META_PAGE_FLAG,
};

/// Fixed page size of the data file.
pub const PAGE_SIZE: usize = 4096;
