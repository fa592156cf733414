//! # Database Handle
//!
//! Owns the file, the advisory lock, the current memory map generation,
//! the freelist, the page buffer pool and transaction admission.
//!
//! ## Locking
//!
//! - *writer mutex*: held by the one writable transaction from begin to
//!   close.
//! - *meta lock*: shared while a transaction snapshots the meta page,
//!   exclusive while a commit writes one and while the database closes.
//! - *mapping lock*: guards the `Arc<Mapping>` swap. Transactions clone
//!   the Arc at begin and never lock again; growth installs a new
//!   generation, and old generations live as long as the transactions
//!   holding them.
//!
//! Acquisition order is writer → meta → mapping; transactions never hold
//! the mapping lock, so a grower only contends with begins.
//!
//! ## File Layout on Creation
//!
//! An empty file is initialized with four pages (meta at 0 and 1, an
//! empty freelist at 2, the empty root-bucket leaf at 3), then fsync'd.
//! The two meta copies carry `txid` 0 and 1, so the higher-txid rule picks
//! page 1 until the first commit flips back to page 0.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

use crate::error::Error;
use crate::options::Options;
use crate::pool::PagePool;
use crate::storage::{
    mmap_size, page_header, page_header_mut, FileLock, Freelist, Mapping, Meta,
    FREELIST_PAGE_FLAG, LEAF_PAGE_FLAG, META_PAGE_FLAG, PAGE_SIZE,
};
use crate::tx::{Tx, TxStats};

/// An open database file.
///
/// One writer at a time, any number of concurrent readers. Share a `DB`
/// across threads by reference (or `Arc`); transactions borrow it.
pub struct DB {
    pub(crate) shared: DbShared,
}

pub(crate) struct DbShared {
    path: PathBuf,
    pub(crate) file: File,
    flock: Mutex<Option<FileLock>>,
    pub(crate) read_only: bool,
    pub(crate) no_sync: bool,
    pub(crate) strict_mode: bool,
    opened: AtomicBool,
    mapping: RwLock<Arc<Mapping>>,
    pub(crate) meta_lock: RwLock<()>,
    writer: Mutex<()>,
    pub(crate) freelist: Mutex<Freelist>,
    pub(crate) pool: PagePool,
    /// Active read transaction ids, with multiplicity: several readers can
    /// share a snapshot txid.
    readers: Mutex<BTreeMap<u64, usize>>,
    pub(crate) stats: Stats,
}

impl DB {
    /// Opens or creates the database file at `path`.
    pub fn open(path: impl AsRef<Path>, options: Options) -> Result<Self> {
        let path = path.as_ref();

        let (file, flock) = if options.read_only {
            let file = File::open(path)
                .wrap_err_with(|| format!("failed to open database '{}'", path.display()))?;
            (file, None)
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open database '{}'", path.display()))?;

            // The lock rides on its own descriptor so two handles in one
            // process conflict just like two processes do.
            let lock_file = File::open(path)
                .wrap_err_with(|| format!("failed to reopen '{}' for locking", path.display()))?;
            let flock = FileLock::acquire(lock_file).map_err(|e| {
                eyre::eyre!("database '{}' is locked by another process: {}", path.display(), e)
            })?;
            (file, Some(flock))
        };

        let mut file_len = file
            .metadata()
            .wrap_err("failed to stat database file")?
            .len();

        if file_len == 0 {
            ensure!(
                !options.read_only,
                "cannot initialize '{}': database opened read-only",
                path.display()
            );
            init_file(&file)?;
            file_len = file.metadata()?.len();
            tracing::info!(path = %path.display(), "database initialized");
        }

        ensure!(
            file_len % PAGE_SIZE as u64 == 0,
            "database size {} is not a multiple of page size {}",
            file_len,
            PAGE_SIZE
        );

        let map_len = if options.read_only {
            file_len
        } else {
            let wanted = file_len
                .max(options.initial_mmap_size as u64)
                .max((4 * PAGE_SIZE) as u64);
            let target = mmap_size(wanted);
            if file_len < target {
                file.set_len(target)
                    .wrap_err("failed to extend database file to mapping size")?;
            }
            target
        };

        let mapping = Arc::new(Mapping::new(&file, map_len as usize)?);

        let shared = DbShared {
            path: path.to_path_buf(),
            file,
            flock: Mutex::new(flock),
            read_only: options.read_only,
            no_sync: options.no_sync,
            strict_mode: options.strict_mode,
            opened: AtomicBool::new(true),
            mapping: RwLock::new(Arc::clone(&mapping)),
            meta_lock: RwLock::new(()),
            writer: Mutex::new(()),
            freelist: Mutex::new(Freelist::new()),
            pool: PagePool::new(),
            readers: Mutex::new(BTreeMap::new()),
            stats: Stats::default(),
        };

        let meta = shared
            .load_meta(&mapping)
            .wrap_err_with(|| format!("'{}' is not a valid database", path.display()))?;
        ensure!(
            meta.page_size() as usize == PAGE_SIZE,
            "database was created with page size {}, this build uses {}",
            meta.page_size(),
            PAGE_SIZE
        );

        {
            let head = mapping.page(meta.freelist(), 1)?;
            let overflow = page_header(head)?.overflow() as usize;
            let page = mapping.page(meta.freelist(), 1 + overflow)?;
            shared.freelist.lock().read_page(page)?;
        }

        tracing::info!(
            path = %shared.path.display(),
            txid = meta.txid(),
            "database opened"
        );
        Ok(DB { shared })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    /// Starts a transaction. At most one writable transaction runs at a
    /// time; a second request blocks until the first closes.
    ///
    /// Never open a write transaction while the same thread holds a read
    /// transaction: commits that need to grow the file would wait on that
    /// reader forever.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>> {
        if writable {
            self.begin_write()
        } else {
            self.begin_read()
        }
    }

    fn begin_read(&self) -> Result<Tx<'_>> {
        let shared = &self.shared;

        let (mmap, meta) = {
            let _meta_lock = shared.meta_lock.read();
            if !shared.opened.load(Ordering::Acquire) {
                return Err(Error::DatabaseNotOpen.into());
            }
            let mmap = Arc::clone(&shared.mapping.read());
            let meta = shared.load_meta(&mmap)?;
            shared.register_reader(meta.txid());
            (mmap, meta)
        };

        shared.stats.tx_n.fetch_add(1, Ordering::Relaxed);
        Ok(Tx::new(shared, false, mmap, meta, None))
    }

    fn begin_write(&self) -> Result<Tx<'_>> {
        let shared = &self.shared;
        if shared.read_only {
            return Err(Error::DatabaseReadOnly.into());
        }

        let guard = shared.writer.lock();

        let (mmap, meta) = {
            let _meta_lock = shared.meta_lock.read();
            if !shared.opened.load(Ordering::Acquire) {
                return Err(Error::DatabaseNotOpen.into());
            }
            let mmap = Arc::clone(&shared.mapping.read());
            let mut meta = shared.load_meta(&mmap)?;
            meta.set_txid(meta.txid() + 1);
            (mmap, meta)
        };

        // Pages freed by transactions no live reader can still see become
        // allocatable now.
        let min_reader = shared
            .readers
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(u64::MAX);
        shared.freelist.lock().release(min_reader.saturating_sub(1));

        shared.stats.tx_n.fetch_add(1, Ordering::Relaxed);
        Ok(Tx::new(shared, true, mmap, meta, Some(guard)))
    }

    /// Runs `f` inside a managed read transaction; the transaction is
    /// rolled back afterwards. Manual commit/rollback inside `f` fails
    /// with `ManagedTxOperationDisallowed`.
    pub fn execute_in_read_tx<T>(&self, f: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(false)?;
        tx.managed = true;
        let result = f(&mut tx);
        tx.managed = false;
        let _ = tx.rollback();
        result
    }

    /// Runs `f` inside a managed write transaction: committed when `f`
    /// succeeds, rolled back when it fails. Manual commit/rollback inside
    /// `f` fails with `ManagedTxOperationDisallowed`.
    pub fn execute_in_write_tx<T>(&self, f: impl FnOnce(&mut Tx) -> Result<T>) -> Result<T> {
        let mut tx = self.begin(true)?;
        tx.managed = true;
        let result = f(&mut tx);
        tx.managed = false;

        match result {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = tx.rollback();
                Err(e)
            }
        }
    }

    /// Point-in-time copy of the database counters.
    pub fn stats(&self) -> DbStats {
        self.shared.stats.snapshot()
    }

    /// Flushes and closes the database. Blocks until the running write
    /// transaction (if any) finishes; idempotent.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        let _writer = shared.writer.lock();
        let _meta_lock = shared.meta_lock.write();

        if !shared.opened.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if !shared.read_only {
            shared
                .file
                .sync_all()
                .wrap_err("failed to sync database file on close")?;
        }
        *shared.flock.lock() = None;

        tracing::info!(path = %shared.path.display(), "database closed");
        Ok(())
    }
}

impl Drop for DB {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl std::fmt::Debug for DB {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DB")
            .field("path", &self.shared.path)
            .field("read_only", &self.shared.read_only)
            .finish()
    }
}

impl DbShared {
    /// Reads and validates both meta copies, returning the valid one with
    /// the higher txid. Either copy may be corrupt on its own; both
    /// corrupt is fatal.
    pub(crate) fn load_meta(&self, mapping: &Mapping) -> Result<Meta> {
        let read = |pgid: u64| -> Result<Meta> {
            let meta = Meta::read_from_page(mapping.page(pgid, 1)?)?;
            meta.validate()?;
            Ok(meta)
        };

        match (read(0), read(1)) {
            (Ok(meta0), Ok(meta1)) => Ok(if meta0.txid() >= meta1.txid() {
                meta0
            } else {
                meta1
            }),
            (Ok(meta0), Err(_)) => Ok(meta0),
            (Err(_), Ok(meta1)) => Ok(meta1),
            (Err(e0), Err(e1)) => {
                Err(e0.wrap_err(format!("both meta pages failed validation (page 1: {e1})")))
            }
        }
    }

    pub(crate) fn mapping_len(&self) -> usize {
        self.mapping.read().len()
    }

    /// Grows the file and installs a new mapping generation covering at
    /// least `minsz` bytes. Transactions keep their own generation.
    pub(crate) fn grow_mapping(&self, minsz: u64) -> Result<()> {
        ensure!(!self.read_only, "cannot grow a read-only database");

        let mut mapping = self.mapping.write();
        if mapping.len() as u64 >= minsz {
            return Ok(());
        }

        let target = mmap_size(minsz);
        let file_len = self.file.metadata()?.len();
        if file_len < target {
            self.file
                .set_len(target)
                .wrap_err("failed to extend database file")?;
        }

        let grown = Mapping::new(&self.file, target as usize)?;
        tracing::debug!(from = mapping.len(), to = target, "memory map grown");
        *mapping = Arc::new(grown);
        Ok(())
    }

    #[cfg(unix)]
    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }

    pub(crate) fn register_reader(&self, txid: u64) {
        *self.readers.lock().entry(txid).or_insert(0) += 1;
        self.stats.open_read_tx_n.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn deregister_reader(&self, txid: u64) {
        let mut readers = self.readers.lock();
        if let Some(count) = readers.get_mut(&txid) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&txid);
            }
        }
        self.stats.open_read_tx_n.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Database-wide counters. Readers bump the transaction counts through
/// atomics; the freelist gauges are refreshed by each closing write
/// transaction.
#[derive(Default)]
pub(crate) struct Stats {
    pub(crate) tx_n: AtomicU64,
    pub(crate) open_read_tx_n: AtomicU64,
    free_page_n: AtomicU64,
    pending_page_n: AtomicU64,
    free_alloc: AtomicU64,
    freelist_in_use: AtomicU64,
    tx_stats: Mutex<TxStats>,
}

impl Stats {
    pub(crate) fn record_freelist(&self, free_n: u64, pending_n: u64, in_use: u64) {
        self.free_page_n.store(free_n, Ordering::Relaxed);
        self.pending_page_n.store(pending_n, Ordering::Relaxed);
        self.free_alloc
            .store((free_n + pending_n) * PAGE_SIZE as u64, Ordering::Relaxed);
        self.freelist_in_use.store(in_use, Ordering::Relaxed);
    }

    pub(crate) fn merge_tx_stats(&self, stats: &TxStats) {
        self.tx_stats.lock().add(stats);
    }

    fn snapshot(&self) -> DbStats {
        DbStats {
            tx_n: self.tx_n.load(Ordering::Relaxed),
            open_read_tx_n: self.open_read_tx_n.load(Ordering::Relaxed),
            free_page_n: self.free_page_n.load(Ordering::Relaxed),
            pending_page_n: self.pending_page_n.load(Ordering::Relaxed),
            free_alloc: self.free_alloc.load(Ordering::Relaxed),
            freelist_in_use: self.freelist_in_use.load(Ordering::Relaxed),
            tx_stats: self.tx_stats.lock().clone(),
        }
    }
}

/// Snapshot returned by [`DB::stats`].
#[derive(Debug, Clone)]
pub struct DbStats {
    /// Total transactions started.
    pub tx_n: u64,
    /// Currently open read transactions.
    pub open_read_tx_n: u64,
    /// Free pages on the freelist.
    pub free_page_n: u64,
    /// Pages pending release.
    pub pending_page_n: u64,
    /// Bytes allocated in free pages.
    pub free_alloc: u64,
    /// Bytes used by the serialized freelist.
    pub freelist_in_use: u64,
    /// Aggregated per-transaction counters.
    pub tx_stats: TxStats,
}

/// Lays out the four initial pages of a fresh database.
fn init_file(file: &File) -> Result<()> {
    let mut data = vec![0u8; 4 * PAGE_SIZE];

    for i in 0..2u64 {
        let page = &mut data[i as usize * PAGE_SIZE..(i as usize + 1) * PAGE_SIZE];
        {
            let header = page_header_mut(page)?;
            header.set_id(i);
            header.set_flags(META_PAGE_FLAG);
        }
        let mut meta = Meta::new(PAGE_SIZE as u32);
        meta.set_freelist(2);
        meta.set_root(3);
        meta.set_max_pgid(4);
        meta.set_txid(i);
        meta.write_to_page(page)?;
    }

    {
        let page = &mut data[2 * PAGE_SIZE..3 * PAGE_SIZE];
        let header = page_header_mut(page)?;
        header.set_id(2);
        header.set_flags(FREELIST_PAGE_FLAG);
    }
    {
        let page = &mut data[3 * PAGE_SIZE..4 * PAGE_SIZE];
        let header = page_header_mut(page)?;
        header.set_id(3);
        header.set_flags(LEAF_PAGE_FLAG);
    }

    {
        use std::io::Write;
        let mut f = file;
        f.write_all(&data)
            .wrap_err("failed to write initial pages")?;
        f.flush()?;
    }
    file.sync_all().wrap_err("failed to sync initial pages")?;
    Ok(())
}
