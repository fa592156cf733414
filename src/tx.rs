//! # Transactions
//!
//! A [`Tx`] is a consistent snapshot of the database. It copies the valid
//! meta page at begin and resolves every page through its own clone of the
//! memory map, so concurrent commits can never shift the ground under it.
//!
//! Read-only transactions are passive: snapshot, read, drop. A writable
//! transaction additionally owns the writer mutex, an incremented txid, the
//! node/bucket arenas and the dirty-page map; nothing it does is visible
//! until `commit` writes the dirty pages, fsyncs, and flips the meta page.
//!
//! ## Commit Protocol
//!
//! 1. rebalance and spill the bucket trees onto fresh dirty pages;
//! 2. free the old freelist page and write the new one;
//! 3. write dirty pages in ascending page order, coalescing adjacent runs;
//! 4. fsync the data (full metadata sync exactly when the file grew);
//! 5. write the alternating meta page and fsync again.
//!
//! A crash before step 5 leaves the previous meta intact and the commit
//! simply never happened. Any error inside commit rolls the transaction
//! back and surfaces as `CommitFailed`.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use hashbrown::{HashMap, HashSet};
use parking_lot::MutexGuard;

use crate::bucket::{Bucket, BucketId, BucketState};
use crate::cursor::Cursor;
use crate::db::DbShared;
use crate::error::Error;
use crate::node::Node;
use crate::pool::PooledPageBuffer;
use crate::storage::{
    branch_elem, btree_page_count, page_header, page_header_mut, page_kind, Mapping, Meta,
    BRANCH_PAGE_FLAG, FREELIST_PAGE_FLAG, META_PAGE_FLAG, PAGE_SIZE,
};

pub(crate) const ROOT_BUCKET: BucketId = BucketId(0);

/// Node and bucket arenas of one transaction. Handles (`NodeId`,
/// `BucketId`) index into these vectors; nothing is ever removed, entries
/// just go unreferenced.
#[derive(Default)]
pub(crate) struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) buckets: Vec<BucketState>,
}

/// A dirty page buffer: pooled for single pages, boxed for overflow runs.
pub(crate) enum PageBuf {
    Pooled(PooledPageBuffer),
    Heap(Box<[u8]>),
}

impl PageBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            PageBuf::Pooled(buf) => &buf[..],
            PageBuf::Heap(buf) => buf,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            PageBuf::Pooled(buf) => &mut buf[..],
            PageBuf::Heap(buf) => buf,
        }
    }
}

#[derive(Default)]
pub(crate) struct DirtyPages {
    pages: HashMap<u64, PageBuf>,
}

impl DirtyPages {
    pub fn insert(&mut self, pgid: u64, buf: PageBuf) {
        self.pages.insert(pgid, buf);
    }

    pub fn get(&self, pgid: u64) -> Option<&[u8]> {
        self.pages.get(&pgid).map(PageBuf::as_slice)
    }

    pub fn page_mut(&mut self, pgid: u64) -> Option<&mut [u8]> {
        self.pages.get_mut(&pgid).map(PageBuf::as_mut_slice)
    }

    pub fn pgids(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Counters of the work one transaction performed.
#[derive(Debug, Default, Clone)]
pub struct TxStats {
    /// Page allocations.
    pub page_count: u64,
    /// Bytes allocated for pages.
    pub page_alloc: u64,
    /// Cursors created.
    pub cursor_count: u64,
    /// Nodes materialized.
    pub node_count: u64,
    /// Nodes rebalanced.
    pub rebalance: u64,
    pub rebalance_time: Duration,
    /// Nodes split.
    pub split: u64,
    /// Nodes written to dirty pages.
    pub spill: u64,
    pub spill_time: Duration,
    /// Meta writes.
    pub write: u64,
    pub write_time: Duration,
}

impl TxStats {
    pub fn add(&mut self, other: &TxStats) {
        self.page_count += other.page_count;
        self.page_alloc += other.page_alloc;
        self.cursor_count += other.cursor_count;
        self.node_count += other.node_count;
        self.rebalance += other.rebalance;
        self.rebalance_time += other.rebalance_time;
        self.split += other.split;
        self.spill += other.spill;
        self.spill_time += other.spill_time;
        self.write += other.write;
        self.write_time += other.write_time;
    }
}

/// A read-only or read/write transaction.
///
/// Transactions must not outlive their usefulness: pages freed by later
/// commits cannot be reused while an old read transaction is alive, so a
/// long-lived reader makes the file grow.
pub struct Tx<'db> {
    pub(crate) db: &'db DbShared,
    writable: bool,
    pub(crate) managed: bool,
    closed: bool,
    /// This transaction's generation of the memory map.
    pub(crate) mmap: Arc<Mapping>,
    pub(crate) meta: RefCell<Meta>,
    pub(crate) graph: RefCell<Graph>,
    pub(crate) dirty: RefCell<DirtyPages>,
    pub(crate) stats: RefCell<TxStats>,
    commit_handlers: RefCell<Vec<Box<dyn FnOnce() + 'static>>>,
    writer_guard: Option<MutexGuard<'db, ()>>,
}

impl<'db> Tx<'db> {
    pub(crate) fn new(
        db: &'db DbShared,
        writable: bool,
        mmap: Arc<Mapping>,
        meta: Meta,
        writer_guard: Option<MutexGuard<'db, ()>>,
    ) -> Self {
        let mut graph = Graph::default();
        graph.alloc_bucket(BucketState::new(meta.root()));

        Self {
            db,
            writable,
            managed: false,
            closed: false,
            mmap,
            meta: RefCell::new(meta),
            graph: RefCell::new(graph),
            dirty: RefCell::new(DirtyPages::default()),
            stats: RefCell::new(TxStats::default()),
            commit_handlers: RefCell::new(Vec::new()),
            writer_guard,
        }
    }

    /// Transaction id of this snapshot.
    pub fn id(&self) -> u64 {
        self.meta.borrow().txid()
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Database size in bytes as seen by this snapshot.
    pub fn size(&self) -> u64 {
        self.meta.borrow().max_pgid() * PAGE_SIZE as u64
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::TransactionClosed.into());
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::TransactionNotWritable.into());
        }
        Ok(())
    }

    fn root_bucket(&self) -> Bucket<'_> {
        Bucket {
            tx: self,
            id: ROOT_BUCKET,
        }
    }

    /// Opens a top-level bucket.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'_>>> {
        self.root_bucket().bucket(name)
    }

    /// Creates a top-level bucket.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root_bucket().create_bucket(name)
    }

    /// Creates a top-level bucket unless it exists.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'_>> {
        self.root_bucket().create_bucket_if_not_exists(name)
    }

    /// Deletes a top-level bucket and everything in it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.root_bucket().delete_bucket(name)
    }

    /// Calls `f` with every top-level bucket.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], Bucket<'_>) -> Result<()>) -> Result<()> {
        let root = self.root_bucket();

        let mut names = Vec::new();
        root.for_each(|key, value| {
            if value.is_none() {
                names.push(key.to_vec());
            }
            Ok(())
        })?;

        for name in names {
            let bucket = root
                .bucket(&name)?
                .ok_or_else(|| eyre::eyre!("root entry {:?} is not a bucket", name))?;
            f(&name, bucket)?;
        }
        Ok(())
    }

    /// Cursor over the top-level bucket names. Every entry is a bucket, so
    /// values are always `None`.
    pub fn cursor(&self) -> Cursor<'_> {
        self.root_bucket().cursor()
    }

    /// Snapshot of this transaction's counters.
    pub fn stats(&self) -> TxStats {
        self.stats.borrow().clone()
    }

    /// Registers a function to run after a successful commit.
    pub fn add_on_commit_handler(&self, handler: impl FnOnce() + 'static) {
        self.commit_handlers.borrow_mut().push(Box::new(handler));
    }

    // ------------------------------------------------------------------
    // page access
    // ------------------------------------------------------------------

    /// Runs `f` over the page run for `pgid`: the dirty buffer when this
    /// transaction rewrote the page, the mapped bytes otherwise.
    pub(crate) fn with_page<R>(&self, pgid: u64, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        if self.writable {
            let dirty = self.dirty.borrow();
            if let Some(page) = dirty.get(pgid) {
                return Ok(f(page));
            }
        }

        Ok(f(self.mapped_page(pgid)?))
    }

    /// The mapped page run for `pgid`; never consults dirty buffers.
    pub(crate) fn mapped_page(&self, pgid: u64) -> Result<&[u8]> {
        let head = self.mmap.page(pgid, 1)?;
        let overflow = page_header(head)?.overflow() as usize;
        self.mmap.page(pgid, 1 + overflow)
    }

    /// Allocates a run of `count` pages as a dirty buffer, preferring the
    /// freelist and extending the file at the high-water mark otherwise.
    pub(crate) fn allocate_page(&self, count: usize, flags: u16) -> Result<u64> {
        self.ensure_writable()?;

        let mut pgid = self.db.freelist.lock().allocate(count as u64)?;
        if pgid == 0 {
            let mut meta = self.meta.borrow_mut();
            pgid = meta.max_pgid();

            let minsz = (pgid as usize + count + 1) * PAGE_SIZE;
            if minsz > self.db.mapping_len() {
                self.db.grow_mapping(minsz as u64)?;
            }

            meta.set_max_pgid(pgid + count as u64);
        }

        let mut buf = if count == 1 {
            PageBuf::Pooled(self.db.pool.acquire())
        } else {
            PageBuf::Heap(vec![0u8; count * PAGE_SIZE].into_boxed_slice())
        };

        {
            let page = buf.as_mut_slice();
            // Pooled buffers are recycled; rewrite the whole header region
            // including the per-kind count fields.
            page[..24].fill(0);
            let header = page_header_mut(page)?;
            header.set_id(pgid);
            header.set_overflow(count as u32 - 1);
            header.set_flags(flags);
        }

        self.dirty.borrow_mut().insert(pgid, buf);

        let mut stats = self.stats.borrow_mut();
        stats.page_count += 1;
        stats.page_alloc += (count * PAGE_SIZE) as u64;
        Ok(pgid)
    }

    /// Hands a page run back to the freelist, charged to this
    /// transaction.
    pub(crate) fn free_page(&self, pgid: u64) -> Result<()> {
        let overflow = self.with_page(pgid, |page| page_header(page).map(|h| h.overflow()))??;
        let txid = self.meta.borrow().txid();
        self.db.freelist.lock().free(txid, pgid, overflow)
    }

    /// Depth-first walk over a tree of pages.
    pub(crate) fn for_each_page(
        &self,
        pgid: u64,
        depth: usize,
        f: &mut dyn FnMut(&[u8], usize) -> Result<()>,
    ) -> Result<()> {
        let children = self.with_page(pgid, |page| -> Result<Vec<u64>> {
            f(page, depth)?;

            let header = page_header(page)?;
            let mut pgids = Vec::new();
            if header.flags() & BRANCH_PAGE_FLAG != 0 {
                let count = btree_page_count(page)?;
                for i in 0..count {
                    let (elem, _) = branch_elem(page, i)?;
                    pgids.push(elem.pgid());
                }
            }
            Ok(pgids)
        })??;

        for child in children {
            self.for_each_page(child, depth + 1, f)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // commit / rollback
    // ------------------------------------------------------------------

    /// Flushes every change to disk and publishes the new meta page.
    pub fn commit(&mut self) -> Result<()> {
        if self.managed {
            return Err(Error::ManagedTxOperationDisallowed.into());
        }
        self.ensure_open()?;
        self.ensure_writable()?;

        match self.commit_inner() {
            Ok(()) => {
                let handlers = std::mem::take(&mut *self.commit_handlers.borrow_mut());
                for handler in handlers {
                    handler();
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.rollback_inner();
                Err(e.wrap_err(Error::CommitFailed))
            }
        }
    }

    fn commit_inner(&mut self) -> Result<()> {
        let start = Instant::now();
        self.bucket_rebalance(ROOT_BUCKET)?;
        if self.stats.borrow().rebalance > 0 {
            self.stats.borrow_mut().rebalance_time += start.elapsed();
        }

        let old_max_pgid = self.meta.borrow().max_pgid();

        let start = Instant::now();
        self.bucket_spill(ROOT_BUCKET)?;
        self.stats.borrow_mut().spill_time += start.elapsed();

        let new_root = self.graph.borrow().bucket(ROOT_BUCKET).root;
        self.meta.borrow_mut().set_root(new_root);

        // Retire the old freelist page and write the new one. The size is
        // taken before the allocation below mutates the freelist, which
        // can only shrink what ends up being written.
        let old_freelist = self.meta.borrow().freelist();
        self.free_page(old_freelist)?;
        let freelist_size = self.db.freelist.lock().size();
        let freelist_pgid =
            self.allocate_page(freelist_size / PAGE_SIZE + 1, FREELIST_PAGE_FLAG)?;
        {
            let freelist = self.db.freelist.lock();
            let mut dirty = self.dirty.borrow_mut();
            let page = dirty
                .page_mut(freelist_pgid)
                .ok_or_else(|| eyre::eyre!("freelist page {} is not dirty", freelist_pgid))?;
            freelist.write_page(page)?;
        }
        self.meta.borrow_mut().set_freelist(freelist_pgid);

        let start = Instant::now();
        self.write_dirty_pages()?;

        if !self.db.no_sync {
            let grew = old_max_pgid < self.meta.borrow().max_pgid();
            if grew {
                self.db.file.sync_all().wrap_err("fsync after commit")?;
            } else {
                self.db.file.sync_data().wrap_err("fsync after commit")?;
            }
        }

        if self.db.strict_mode {
            self.check()?;
        }

        self.write_meta()?;
        self.stats.borrow_mut().write_time += start.elapsed();

        tracing::debug!(
            txid = self.meta.borrow().txid(),
            root = new_root,
            "transaction committed"
        );

        self.close_inner();
        Ok(())
    }

    /// Dirty pages, ascending by page id, adjacent runs coalesced into
    /// single positioned writes.
    fn write_dirty_pages(&self) -> Result<()> {
        let dirty = self.dirty.borrow();
        let mut pgids = dirty.pgids();
        pgids.sort_unstable();

        let mut run: Vec<u8> = Vec::new();
        let mut run_start = 0u64;
        let mut expected_next = 0u64;

        for pgid in pgids {
            let buf = dirty.get(pgid).expect("dirty page listed");

            if run.is_empty() {
                run_start = pgid;
            } else if pgid != expected_next {
                self.db
                    .write_at(&run, run_start * PAGE_SIZE as u64)
                    .wrap_err("failed to write dirty pages")?;
                run.clear();
                run_start = pgid;
            }

            run.extend_from_slice(buf);
            expected_next = pgid + (buf.len() / PAGE_SIZE) as u64;
        }

        if !run.is_empty() {
            self.db
                .write_at(&run, run_start * PAGE_SIZE as u64)
                .wrap_err("failed to write dirty pages")?;
        }
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let meta = *self.meta.borrow();

        if meta.root() >= meta.max_pgid() {
            return Err(Error::PageIdAboveHighWaterMark {
                pgid: meta.root(),
                high_water: meta.max_pgid(),
            })
            .wrap_err("root bucket page out of bounds");
        }
        if meta.freelist() >= meta.max_pgid() {
            return Err(Error::PageIdAboveHighWaterMark {
                pgid: meta.freelist(),
                high_water: meta.max_pgid(),
            })
            .wrap_err("freelist page out of bounds");
        }

        let pgid = meta.txid() % 2;
        let mut page = vec![0u8; PAGE_SIZE];
        {
            let header = page_header_mut(&mut page)?;
            header.set_id(pgid);
            header.set_flags(META_PAGE_FLAG);
        }
        meta.write_to_page(&mut page)?;

        {
            let _meta_lock = self.db.meta_lock.write();
            self.db
                .write_at(&page, pgid * PAGE_SIZE as u64)
                .wrap_err("failed to write meta page")?;
            if !self.db.no_sync {
                self.db.file.sync_data().wrap_err("fsync of meta page")?;
            }
        }

        self.stats.borrow_mut().write += 1;
        Ok(())
    }

    /// Discards every change of this transaction.
    pub fn rollback(&mut self) -> Result<()> {
        if self.managed {
            return Err(Error::ManagedTxOperationDisallowed.into());
        }
        self.ensure_open()?;
        self.rollback_inner()
    }

    fn rollback_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if self.writable {
            let txid = self.meta.borrow().txid();
            self.db.freelist.lock().rollback(txid);

            // Reload the committed freelist so ids freed by this
            // transaction become allocatable again, while ids still
            // pending for older transactions stay out.
            let _meta_lock = self.db.meta_lock.read();
            let committed = self.db.load_meta(&self.mmap)?;
            let page = {
                let head = self.mmap.page(committed.freelist(), 1)?;
                let overflow = page_header(head)?.overflow() as usize;
                self.mmap.page(committed.freelist(), 1 + overflow)?
            };
            self.db.freelist.lock().reload(page)?;

            tracing::debug!(txid, "transaction rolled back");
        }

        self.close_inner();
        Ok(())
    }

    fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.writable {
            {
                let freelist = self.db.freelist.lock();
                self.db.stats.record_freelist(
                    freelist.free_count() as u64,
                    freelist.pending_count() as u64,
                    freelist.size() as u64,
                );
            }
            // Dropping the buffers returns pooled pages to the pool.
            self.dirty.borrow_mut().clear();
            self.db.stats.merge_tx_stats(&self.stats.borrow());
            self.writer_guard = None;
        } else {
            let txid = self.meta.borrow().txid();
            self.db.deregister_reader(txid);
            self.db.stats.merge_tx_stats(&self.stats.borrow());
        }
    }

    // ------------------------------------------------------------------
    // consistency check
    // ------------------------------------------------------------------

    /// Verifies the page graph of this snapshot: no double frees, no page
    /// referenced twice, no reachable freed page, and every page below the
    /// high-water mark accounted for.
    pub fn check(&self) -> Result<()> {
        self.ensure_open()?;

        let mut freed: HashSet<u64> = HashSet::new();
        for pgid in self.db.freelist.lock().copy_all() {
            if !freed.insert(pgid) {
                return Err(Error::DoubleFree { pgid }.into());
            }
        }

        let mut reachable: HashSet<u64> = HashSet::new();
        reachable.insert(0);
        reachable.insert(1);

        let freelist_pgid = self.meta.borrow().freelist();
        let freelist_overflow =
            self.with_page(freelist_pgid, |page| page_header(page).map(|h| h.overflow()))??;
        for i in 0..=freelist_overflow as u64 {
            reachable.insert(freelist_pgid + i);
        }

        self.check_bucket(ROOT_BUCKET, &mut reachable, &freed)?;

        let max_pgid = self.meta.borrow().max_pgid();
        for pgid in 0..max_pgid {
            ensure!(
                reachable.contains(&pgid) || freed.contains(&pgid),
                "page {}: unreachable and unfreed",
                pgid
            );
        }
        Ok(())
    }

    fn check_bucket(
        &self,
        id: BucketId,
        reachable: &mut HashSet<u64>,
        freed: &HashSet<u64>,
    ) -> Result<()> {
        let root = self.graph.borrow().bucket(id).root;
        if root == 0 {
            return Ok(());
        }

        let max_pgid = self.meta.borrow().max_pgid();
        self.for_each_page(root, 0, &mut |page, _depth| {
            let header = page_header(page)?;
            page_kind(header.flags())?;
            if header.id() >= max_pgid {
                return Err(Error::PageIdAboveHighWaterMark {
                    pgid: header.id(),
                    high_water: max_pgid,
                }
                .into());
            }

            for i in 0..=header.overflow() as u64 {
                let pgid = header.id() + i;
                ensure!(reachable.insert(pgid), "page {}: multiple references", pgid);
                ensure!(!freed.contains(&pgid), "page {}: reachable freed", pgid);
            }
            Ok(())
        })?;

        let bucket = Bucket { tx: self, id };
        let mut names = Vec::new();
        bucket.for_each(|key, value| {
            if value.is_none() {
                names.push(key.to_vec());
            }
            Ok(())
        })?;
        for name in names {
            let child = bucket
                .bucket(&name)?
                .ok_or_else(|| eyre::eyre!("bucket entry {:?} did not open", name))?;
            self.check_bucket(child.id, reachable, freed)?;
        }
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.rollback_inner();
        }
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx")
            .field("id", &self.id())
            .field("writable", &self.writable)
            .field("closed", &self.closed)
            .finish()
    }
}
