//! # Freelist
//!
//! Tracks every page id available for reallocation. Ids live in two pools:
//!
//! - `ids`: free now, sorted ascending, ready for `allocate`.
//! - `pending[txid]`: freed by that transaction but possibly still visible
//!   to older readers; promoted into `ids` by `release` once no reader can
//!   depend on them.
//!
//! A `cache` set mirrors the union of both pools for O(1) membership, which
//! is what catches double frees.
//!
//! ## Persistence
//!
//! The freelist serializes into a dedicated page at every commit. All ids,
//! free and pending alike, are written, because after a crash nothing can
//! still reference a pending page: the recovery read simply treats
//! everything as free.
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  ------  ------------------------------
//! 0       14    header  Page header (flags FREELIST|LEAF)
//! 16      4     count   Number of page ids
//! 24      8*N   ids     Free ids first, then pending
//! ```

use eyre::{bail, ensure, Result};
use hashbrown::{HashMap, HashSet};

use crate::error::Error;

const COUNT_OFFSET: usize = 16;
const IDS_OFFSET: usize = 24;

#[derive(Debug, Default)]
pub struct Freelist {
    /// Page ids free for allocation, sorted ascending.
    ids: Vec<u64>,
    /// Page ids freed per transaction, awaiting release.
    pending: HashMap<u64, Vec<u64>>,
    /// Union of `ids` and all pending ids.
    cache: HashSet<u64>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn free_count(&self) -> usize {
        self.ids.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn count(&self) -> usize {
        self.free_count() + self.pending_count()
    }

    /// Whether a page id is free or pending-free.
    pub fn freed(&self, pgid: u64) -> bool {
        self.cache.contains(&pgid)
    }

    /// Every free and pending id, in serialization order.
    pub fn copy_all(&self) -> Vec<u64> {
        let mut all = Vec::with_capacity(self.count());
        for ids in self.pending.values() {
            all.extend_from_slice(ids);
        }
        all.extend_from_slice(&self.ids);
        all
    }

    /// Releases a page and its overflow pages, charged to `txid`.
    pub fn free(&mut self, txid: u64, pgid: u64, overflow: u32) -> Result<()> {
        ensure!(pgid > 1, "cannot free meta page {}", pgid);

        let ids = self.pending.entry(txid).or_default();
        for id in pgid..=pgid + overflow as u64 {
            if !self.cache.insert(id) {
                return Err(Error::DoubleFree { pgid: id }.into());
            }
            ids.push(id);
        }

        Ok(())
    }

    /// Promotes every pending list with `txid <= upto_txid` into the free
    /// pool.
    pub fn release(&mut self, upto_txid: u64) {
        let released: Vec<u64> = self
            .pending
            .keys()
            .copied()
            .filter(|&txid| txid <= upto_txid)
            .collect();

        for txid in released {
            if let Some(ids) = self.pending.remove(&txid) {
                self.ids.extend(ids);
            }
        }

        self.ids.sort_unstable();
    }

    /// Forgets everything freed by `txid`.
    pub fn rollback(&mut self, txid: u64) {
        if let Some(ids) = self.pending.remove(&txid) {
            for id in ids {
                self.cache.remove(&id);
            }
        }
    }

    /// Returns the starting id of the lowest contiguous run of `n` free
    /// pages, removing the run, or 0 when no such run exists.
    pub fn allocate(&mut self, n: u64) -> Result<u64> {
        if self.ids.is_empty() || n == 0 {
            return Ok(0);
        }

        let mut prev_id = 0u64;
        let mut initial_id = 0u64;

        for i in 0..self.ids.len() {
            let id = self.ids[i];
            if id <= 1 {
                bail!("invalid free page id {}", id);
            }

            // Run restarts at any gap.
            if prev_id == 0 || id - prev_id != 1 {
                initial_id = id;
            }

            if id - initial_id + 1 == n {
                self.ids.drain(i + 1 - n as usize..=i);

                for k in initial_id..initial_id + n {
                    ensure!(self.cache.remove(&k), "freelist cache is missing page {}", k);
                }

                return Ok(initial_id);
            }

            prev_id = id;
        }

        Ok(0)
    }

    /// Serialized size in bytes, header included.
    pub fn size(&self) -> usize {
        IDS_OFFSET + self.count() * 8
    }

    /// Serializes every id (free first, then pending) into a freelist page
    /// buffer whose header is already stamped. The LEAF bit is set in
    /// addition so the on-disk shape matches the historical format.
    pub fn write_page(&self, page: &mut [u8]) -> Result<()> {
        ensure!(
            page.len() >= self.size(),
            "freelist needs {} bytes, page run has {}",
            self.size(),
            page.len()
        );

        let header = super::page_header_mut(page)?;
        header.set_flags(header.flags() | super::LEAF_PAGE_FLAG);

        let count = self.count() as u32;
        page[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&count.to_le_bytes());

        let mut off = IDS_OFFSET;
        for &id in self.ids.iter() {
            page[off..off + 8].copy_from_slice(&id.to_le_bytes());
            off += 8;
        }
        for ids in self.pending.values() {
            for &id in ids {
                page[off..off + 8].copy_from_slice(&id.to_le_bytes());
                off += 8;
            }
        }

        Ok(())
    }

    /// Rebuilds the free pool from a freelist page. Everything persisted is
    /// treated as free; current pending lists stay as they are.
    pub fn read_page(&mut self, page: &[u8]) -> Result<()> {
        ensure!(
            page.len() >= IDS_OFFSET,
            "freelist page too small: {}",
            page.len()
        );

        let count =
            u32::from_le_bytes(page[COUNT_OFFSET..COUNT_OFFSET + 4].try_into().unwrap()) as usize;
        ensure!(
            page.len() >= IDS_OFFSET + count * 8,
            "freelist page truncated: {} ids in {} bytes",
            count,
            page.len()
        );

        self.ids.clear();
        self.ids.reserve(count);
        for i in 0..count {
            let off = IDS_OFFSET + i * 8;
            self.ids
                .push(u64::from_le_bytes(page[off..off + 8].try_into().unwrap()));
        }
        self.ids.sort_unstable();

        self.reindex();
        Ok(())
    }

    /// Like [`read_page`](Self::read_page), but drops any id that is still
    /// pending in memory. Rollback path: the page being read predates the
    /// aborted transaction, so its pending ids must not become allocatable.
    pub fn reload(&mut self, page: &[u8]) -> Result<()> {
        self.read_page(page)?;

        let pcache: HashSet<u64> = self.pending.values().flatten().copied().collect();
        self.ids.retain(|id| !pcache.contains(id));

        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.cache.clear();
        self.cache.extend(self.ids.iter().copied());
        for ids in self.pending.values() {
            self.cache.extend(ids.iter().copied());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{page_header, page_header_mut, FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG, PAGE_SIZE};

    fn freelist_with(ids: &[u64]) -> Freelist {
        let mut fl = Freelist::new();
        for &id in ids {
            fl.free(1, id, 0).unwrap();
        }
        fl.release(1);
        fl
    }

    #[test]
    fn free_tracks_overflow_run() {
        let mut fl = Freelist::new();
        fl.free(5, 12, 3).unwrap();

        assert_eq!(fl.pending_count(), 4);
        assert!(fl.freed(12));
        assert!(fl.freed(15));
        assert!(!fl.freed(16));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut fl = Freelist::new();
        fl.free(5, 12, 0).unwrap();

        let err = fl.free(6, 12, 0).unwrap_err();
        assert!(matches!(
            err.downcast_ref(),
            Some(Error::DoubleFree { pgid: 12 })
        ));
    }

    #[test]
    fn meta_pages_cannot_be_freed() {
        let mut fl = Freelist::new();
        assert!(fl.free(5, 0, 0).is_err());
        assert!(fl.free(5, 1, 0).is_err());
    }

    #[test]
    fn release_promotes_only_old_transactions() {
        let mut fl = Freelist::new();
        fl.free(10, 7, 0).unwrap();
        fl.free(11, 3, 0).unwrap();
        fl.free(12, 5, 0).unwrap();

        fl.release(11);

        assert_eq!(fl.ids, vec![3, 7]);
        assert_eq!(fl.pending_count(), 1);
        assert!(fl.freed(5));
    }

    #[test]
    fn rollback_drops_pending_ids() {
        let mut fl = Freelist::new();
        fl.free(10, 7, 1).unwrap();
        fl.rollback(10);

        assert_eq!(fl.count(), 0);
        assert!(!fl.freed(7));
        assert!(!fl.freed(8));
    }

    #[test]
    fn allocate_finds_lowest_run() {
        let mut fl = freelist_with(&[3, 4, 5, 9, 10, 11, 12]);

        assert_eq!(fl.allocate(3).unwrap(), 3);
        assert_eq!(fl.ids, vec![9, 10, 11, 12]);
        assert!(!fl.freed(4));
    }

    #[test]
    fn allocate_skips_short_runs() {
        let mut fl = freelist_with(&[3, 5, 6, 9, 10, 11]);

        assert_eq!(fl.allocate(3).unwrap(), 9);
        assert_eq!(fl.ids, vec![3, 5, 6]);
    }

    #[test]
    fn allocate_returns_zero_when_no_run_fits() {
        let mut fl = freelist_with(&[3, 5, 7]);

        assert_eq!(fl.allocate(2).unwrap(), 0);
        assert_eq!(fl.ids, vec![3, 5, 7]);
    }

    #[test]
    fn allocate_single_pages_in_order() {
        let mut fl = freelist_with(&[4, 2, 9]);

        assert_eq!(fl.allocate(1).unwrap(), 2);
        assert_eq!(fl.allocate(1).unwrap(), 4);
        assert_eq!(fl.allocate(1).unwrap(), 9);
        assert_eq!(fl.allocate(1).unwrap(), 0);
    }

    #[test]
    fn page_roundtrip_preserves_free_and_pending() {
        let mut fl = Freelist::new();
        fl.free(1, 3, 0).unwrap();
        fl.free(1, 9, 0).unwrap();
        fl.release(1);
        fl.free(2, 5, 1).unwrap();
        assert_eq!(fl.count(), 4);

        let mut page = vec![0u8; PAGE_SIZE];
        {
            let header = page_header_mut(&mut page).unwrap();
            header.set_id(7);
            header.set_flags(FREELIST_PAGE_FLAG);
        }
        fl.write_page(&mut page).unwrap();

        assert_eq!(
            page_header(&page).unwrap().flags(),
            FREELIST_PAGE_FLAG | LEAF_PAGE_FLAG
        );

        let mut restored = Freelist::new();
        restored.read_page(&page).unwrap();

        // Pending ids come back as plain free ids.
        assert_eq!(restored.ids, vec![3, 5, 6, 9]);
        assert_eq!(restored.pending_count(), 0);
        assert!(restored.freed(6));
    }

    #[test]
    fn reload_excludes_ids_still_pending() {
        let mut fl = Freelist::new();
        fl.free(1, 3, 0).unwrap();
        fl.free(1, 4, 0).unwrap();
        fl.release(1);

        let mut page = vec![0u8; PAGE_SIZE];
        page_header_mut(&mut page).unwrap().set_flags(FREELIST_PAGE_FLAG);
        fl.write_page(&mut page).unwrap();

        // Page 4 is freed again by a newer, still-pending transaction.
        let mut current = Freelist::new();
        current.free(9, 4, 0).unwrap();
        current.reload(&page).unwrap();

        assert_eq!(current.ids, vec![3]);
        assert!(current.freed(4), "pending id stays in the cache");
        assert_eq!(current.pending_count(), 1);
    }

    #[test]
    fn size_accounts_for_header_and_ids() {
        let fl = freelist_with(&[3, 4, 5]);
        assert_eq!(fl.size(), 24 + 3 * 8);
    }
}
