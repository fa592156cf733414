//! # Page Framing
//!
//! Typed zerocopy views over fixed-size page bytes. Views borrow the page
//! slice and never own storage; callers decide whether the bytes come from
//! the memory map, a dirty buffer, or an inline bucket value.
//!
//! ## Page Header Layout (14 bytes)
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  ----------------------------------------
//! 0       8     id        Page id (position / PAGE_SIZE)
//! 8       4     overflow  Number of additional contiguous pages
//! 12      2     flags     BRANCH | LEAF | META | FREELIST bitset
//! ```
//!
//! ## B+tree Pages
//!
//! Branch and leaf pages add a `count: u16` at offset 14; the element array
//! starts at offset 16. Both element kinds are 16 bytes, and their `pos`
//! field is relative to the element's own offset, so a key lives at
//! `element_offset + pos` and a leaf value directly after its key.
//!
//! ```text
//! BranchElem: pgid u64 | ksize u32 | pos u32
//! LeafElem:   flags u32 | pos u32 | ksize u32 | vsize u32
//! ```
//!
//! ## Freelist Pages
//!
//! A `count: u32` at offset 16 followed by `count` page ids (u64) from
//! offset 24. See `freelist.rs` for the codec.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::Error;

pub const BRANCH_PAGE_FLAG: u16 = 0x01;
pub const LEAF_PAGE_FLAG: u16 = 0x02;
pub const META_PAGE_FLAG: u16 = 0x04;
pub const FREELIST_PAGE_FLAG: u16 = 0x08;

/// Leaf element flag bit marking the value as a bucket header.
pub const BUCKET_LEAF_FLAG: u32 = 0x01;

pub const PAGE_HEADER_SIZE: usize = 14;
/// Header plus the element count of branch/leaf pages.
pub const BTREE_PAGE_HEADER_SIZE: usize = 16;
pub const BRANCH_ELEM_SIZE: usize = 16;
pub const LEAF_ELEM_SIZE: usize = 16;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    id: U64,
    overflow: U32,
    flags: U16,
}

const _: () = assert!(size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn id(&self) -> u64 {
        self.id.get()
    }

    pub fn set_id(&mut self, id: u64) {
        self.id = U64::new(id);
    }

    pub fn overflow(&self) -> u32 {
        self.overflow.get()
    }

    pub fn set_overflow(&mut self, overflow: u32) {
        self.overflow = U32::new(overflow);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }
}

/// Page kinds recognized by the flag dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Branch,
    Leaf,
    Meta,
    Freelist,
}

/// Classifies a page by its flag bits, rejecting unknown combinations.
///
/// Branch/leaf bits win the dispatch: the freelist codec reuses the LEAF
/// bit on freelist pages, so FREELIST|LEAF still reads as a leaf-shaped
/// page, matching the on-disk format.
pub fn page_kind(flags: u16) -> Result<PageKind> {
    if flags & BRANCH_PAGE_FLAG != 0 {
        Ok(PageKind::Branch)
    } else if flags & LEAF_PAGE_FLAG != 0 {
        Ok(PageKind::Leaf)
    } else if flags & META_PAGE_FLAG != 0 {
        Ok(PageKind::Meta)
    } else if flags & FREELIST_PAGE_FLAG != 0 {
        Ok(PageKind::Freelist)
    } else {
        Err(Error::InvalidPageFlags { flags }.into())
    }
}

pub fn page_header(data: &[u8]) -> Result<&PageHeader> {
    ensure!(
        data.len() >= PAGE_HEADER_SIZE,
        "buffer too small for PageHeader: {} < {}",
        data.len(),
        PAGE_HEADER_SIZE
    );

    PageHeader::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
}

pub fn page_header_mut(data: &mut [u8]) -> Result<&mut PageHeader> {
    ensure!(
        data.len() >= PAGE_HEADER_SIZE,
        "buffer too small for PageHeader: {} < {}",
        data.len(),
        PAGE_HEADER_SIZE
    );

    PageHeader::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
}

/// Element count of a branch or leaf page.
pub fn btree_page_count(data: &[u8]) -> Result<usize> {
    ensure!(
        data.len() >= BTREE_PAGE_HEADER_SIZE,
        "buffer too small for btree page header: {}",
        data.len()
    );

    let count = U16::ref_from_bytes(&data[PAGE_HEADER_SIZE..BTREE_PAGE_HEADER_SIZE])
        .map_err(|e| eyre::eyre!("failed to read element count: {:?}", e))?;
    Ok(count.get() as usize)
}

pub fn set_btree_page_count(data: &mut [u8], count: u16) {
    data[PAGE_HEADER_SIZE..BTREE_PAGE_HEADER_SIZE].copy_from_slice(&count.to_le_bytes());
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BranchElem {
    pgid: U64,
    ksize: U32,
    pos: U32,
}

const _: () = assert!(size_of::<BranchElem>() == BRANCH_ELEM_SIZE);

impl BranchElem {
    pub fn pgid(&self) -> u64 {
        self.pgid.get()
    }

    pub fn set_pgid(&mut self, pgid: u64) {
        self.pgid = U64::new(pgid);
    }

    pub fn ksize(&self) -> u32 {
        self.ksize.get()
    }

    pub fn set_ksize(&mut self, ksize: u32) {
        self.ksize = U32::new(ksize);
    }

    pub fn pos(&self) -> u32 {
        self.pos.get()
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = U32::new(pos);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafElem {
    flags: U32,
    pos: U32,
    ksize: U32,
    vsize: U32,
}

const _: () = assert!(size_of::<LeafElem>() == LEAF_ELEM_SIZE);

impl LeafElem {
    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = U32::new(flags);
    }

    pub fn pos(&self) -> u32 {
        self.pos.get()
    }

    pub fn set_pos(&mut self, pos: u32) {
        self.pos = U32::new(pos);
    }

    pub fn ksize(&self) -> u32 {
        self.ksize.get()
    }

    pub fn set_ksize(&mut self, ksize: u32) {
        self.ksize = U32::new(ksize);
    }

    pub fn vsize(&self) -> u32 {
        self.vsize.get()
    }

    pub fn set_vsize(&mut self, vsize: u32) {
        self.vsize = U32::new(vsize);
    }
}

#[inline]
pub fn branch_elem_offset(index: usize) -> usize {
    BTREE_PAGE_HEADER_SIZE + index * BRANCH_ELEM_SIZE
}

#[inline]
pub fn leaf_elem_offset(index: usize) -> usize {
    BTREE_PAGE_HEADER_SIZE + index * LEAF_ELEM_SIZE
}

/// Branch element view at `index` together with its key bytes.
pub fn branch_elem(data: &[u8], index: usize) -> Result<(&BranchElem, &[u8])> {
    let off = branch_elem_offset(index);
    ensure!(
        data.len() >= off + BRANCH_ELEM_SIZE,
        "branch element {} out of page bounds",
        index
    );

    let elem = BranchElem::ref_from_bytes(&data[off..off + BRANCH_ELEM_SIZE])
        .map_err(|e| eyre::eyre!("failed to read BranchElem: {:?}", e))?;

    let kstart = off + elem.pos() as usize;
    let kend = kstart + elem.ksize() as usize;
    ensure!(
        kend <= data.len(),
        "branch element {} key [{}, {}) out of page bounds ({})",
        index,
        kstart,
        kend,
        data.len()
    );

    Ok((elem, &data[kstart..kend]))
}

pub fn branch_elem_mut(data: &mut [u8], index: usize) -> Result<&mut BranchElem> {
    let off = branch_elem_offset(index);
    ensure!(
        data.len() >= off + BRANCH_ELEM_SIZE,
        "branch element {} out of page bounds",
        index
    );

    BranchElem::mut_from_bytes(&mut data[off..off + BRANCH_ELEM_SIZE])
        .map_err(|e| eyre::eyre!("failed to read BranchElem: {:?}", e))
}

/// Leaf element view at `index` together with its key and value bytes.
pub fn leaf_elem(data: &[u8], index: usize) -> Result<(&LeafElem, &[u8], &[u8])> {
    let off = leaf_elem_offset(index);
    ensure!(
        data.len() >= off + LEAF_ELEM_SIZE,
        "leaf element {} out of page bounds",
        index
    );

    let elem = LeafElem::ref_from_bytes(&data[off..off + LEAF_ELEM_SIZE])
        .map_err(|e| eyre::eyre!("failed to read LeafElem: {:?}", e))?;

    let kstart = off + elem.pos() as usize;
    let kend = kstart + elem.ksize() as usize;
    let vend = kend + elem.vsize() as usize;
    ensure!(
        vend <= data.len(),
        "leaf element {} data [{}, {}) out of page bounds ({})",
        index,
        kstart,
        vend,
        data.len()
    );

    Ok((elem, &data[kstart..kend], &data[kend..vend]))
}

pub fn leaf_elem_mut(data: &mut [u8], index: usize) -> Result<&mut LeafElem> {
    let off = leaf_elem_offset(index);
    ensure!(
        data.len() >= off + LEAF_ELEM_SIZE,
        "leaf element {} out of page bounds",
        index
    );

    LeafElem::mut_from_bytes(&mut data[off..off + LEAF_ELEM_SIZE])
        .map_err(|e| eyre::eyre!("failed to read LeafElem: {:?}", e))
}
