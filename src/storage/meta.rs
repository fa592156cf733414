//! # Meta Page
//!
//! Root metadata of the database, kept in two copies at page ids 0 and 1.
//! Successive commits alternate between the copies (`written page id =
//! txid % 2`), so a torn meta write leaves the previous copy intact and the
//! database recoverable.
//!
//! ## Layout
//!
//! The meta body sits at offset 16 of the page, after the page header and
//! two pad bytes:
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  ----------------------------------------
//! 16      4     magic      0xED0CDAED
//! 20      4     version    2
//! 24      4     page_size  Page size the file was created with
//! 28      4     (pad)
//! 32      8     root       Root bucket tree page id
//! 40      8     freelist   Freelist page id
//! 48      8     max_pgid   Exclusive page-id high-water mark
//! 56      8     txid       Transaction id of the commit
//! 64      8     checksum   xxHash64 (seed 0x420ADEF) of bytes 16..64
//! ```
//!
//! `validate()` distinguishes the three corruption kinds (magic, version,
//! checksum) so either copy can fail individually; opening aborts only when
//! both do.

use eyre::Result;
use twox_hash::XxHash64;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::Error;

pub const MAGIC: u32 = 0xED0C_DAED;
pub const VERSION: u32 = 2;
pub const CHECKSUM_SEED: u64 = 0x420A_DEF;

/// Offset of the meta body within its page.
pub const META_BODY_OFFSET: usize = 16;
const META_BODY_SIZE: usize = 56;
const CHECKSUM_OFFSET: usize = 48;

/// Snapshot of the meta body. Plain value type: transactions copy it at
/// begin and serialize it back at commit.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct Meta {
    magic: U32,
    version: U32,
    page_size: U32,
    _pad: [u8; 4],
    root: U64,
    freelist: U64,
    max_pgid: U64,
    txid: U64,
    checksum: U64,
}

const _: () = assert!(size_of::<Meta>() == META_BODY_SIZE);

impl Meta {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: U32::new(MAGIC),
            version: U32::new(VERSION),
            page_size: U32::new(page_size),
            _pad: [0; 4],
            root: U64::new(0),
            freelist: U64::new(0),
            max_pgid: U64::new(0),
            txid: U64::new(0),
            checksum: U64::new(0),
        }
    }

    /// Reads the meta body out of a full page.
    pub fn read_from_page(page: &[u8]) -> Result<Self> {
        eyre::ensure!(
            page.len() >= META_BODY_OFFSET + META_BODY_SIZE,
            "page too small for meta body: {}",
            page.len()
        );

        let body = &page[META_BODY_OFFSET..META_BODY_OFFSET + META_BODY_SIZE];
        Meta::read_from_bytes(body).map_err(|e| eyre::eyre!("failed to parse meta body: {:?}", e))
    }

    /// Serializes the body into a full page at the fixed offset, stamping a
    /// fresh checksum.
    pub fn write_to_page(&self, page: &mut [u8]) -> Result<()> {
        eyre::ensure!(
            page.len() >= META_BODY_OFFSET + META_BODY_SIZE,
            "page too small for meta body: {}",
            page.len()
        );

        let mut body = *self;
        body.checksum = U64::new(body.compute_checksum());
        page[META_BODY_OFFSET..META_BODY_OFFSET + META_BODY_SIZE].copy_from_slice(body.as_bytes());
        Ok(())
    }

    fn compute_checksum(&self) -> u64 {
        XxHash64::oneshot(CHECKSUM_SEED, &self.as_bytes()[..CHECKSUM_OFFSET])
    }

    /// Checks magic, version and checksum, in that order.
    pub fn validate(&self) -> Result<()> {
        if self.magic.get() != MAGIC {
            return Err(Error::InvalidMagic.into());
        }
        if self.version.get() != VERSION {
            return Err(Error::InvalidVersion.into());
        }
        if self.checksum.get() != self.compute_checksum() {
            return Err(Error::InvalidChecksum.into());
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn root(&self) -> u64 {
        self.root.get()
    }

    pub fn set_root(&mut self, pgid: u64) {
        self.root = U64::new(pgid);
    }

    pub fn freelist(&self) -> u64 {
        self.freelist.get()
    }

    pub fn set_freelist(&mut self, pgid: u64) {
        self.freelist = U64::new(pgid);
    }

    pub fn max_pgid(&self) -> u64 {
        self.max_pgid.get()
    }

    pub fn set_max_pgid(&mut self, pgid: u64) {
        self.max_pgid = U64::new(pgid);
    }

    pub fn txid(&self) -> u64 {
        self.txid.get()
    }

    pub fn set_txid(&mut self, txid: u64) {
        self.txid = U64::new(txid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PAGE_SIZE;

    fn sample_meta() -> Meta {
        let mut meta = Meta::new(PAGE_SIZE as u32);
        meta.set_root(3);
        meta.set_freelist(2);
        meta.set_max_pgid(4);
        meta.set_txid(7);
        meta
    }

    #[test]
    fn body_is_56_bytes() {
        assert_eq!(size_of::<Meta>(), 56);
    }

    #[test]
    fn page_roundtrip_validates() {
        let mut page = vec![0u8; PAGE_SIZE];
        sample_meta().write_to_page(&mut page).unwrap();

        let parsed = Meta::read_from_page(&page).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.root(), 3);
        assert_eq!(parsed.freelist(), 2);
        assert_eq!(parsed.max_pgid(), 4);
        assert_eq!(parsed.txid(), 7);
        assert_eq!(parsed.page_size(), PAGE_SIZE as u32);
    }

    #[test]
    fn bad_magic_is_detected_first() {
        let mut page = vec![0u8; PAGE_SIZE];
        sample_meta().write_to_page(&mut page).unwrap();
        page[META_BODY_OFFSET] ^= 0xFF;

        let err = Meta::read_from_page(&page).unwrap().validate().unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(Error::InvalidMagic)));
    }

    #[test]
    fn bad_version_is_detected() {
        let mut page = vec![0u8; PAGE_SIZE];
        sample_meta().write_to_page(&mut page).unwrap();
        page[META_BODY_OFFSET + 4] = 9;

        let err = Meta::read_from_page(&page).unwrap().validate().unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(Error::InvalidVersion)));
    }

    #[test]
    fn flipped_body_byte_fails_checksum() {
        let mut page = vec![0u8; PAGE_SIZE];
        sample_meta().write_to_page(&mut page).unwrap();
        // Corrupt the txid, leaving magic/version intact.
        page[META_BODY_OFFSET + 40] ^= 0x01;

        let err = Meta::read_from_page(&page).unwrap().validate().unwrap_err();
        assert!(matches!(err.downcast_ref(), Some(Error::InvalidChecksum)));
    }

    #[test]
    fn checksum_is_seeded_xxhash_of_leading_fields() {
        let mut page = vec![0u8; PAGE_SIZE];
        let meta = sample_meta();
        meta.write_to_page(&mut page).unwrap();

        let body = &page[META_BODY_OFFSET..META_BODY_OFFSET + 56];
        let expect = XxHash64::oneshot(CHECKSUM_SEED, &body[..48]);
        assert_eq!(&body[48..56], &expect.to_le_bytes());
    }
}
