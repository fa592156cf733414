//! # Buckets
//!
//! A bucket is an ordered map of byte keys to byte values backed by its own
//! B+tree, identified by the tree's root page id. Buckets nest: a child
//! bucket is a leaf entry whose value carries the child's root page id and,
//! for small children, the entire serialized tree inline.
//!
//! [`Bucket`] itself is a cheap copyable handle: a transaction reference
//! plus an id into the transaction's bucket arena. The mutable per-bucket
//! state (root page, node cache, child cache, inline page bytes) lives in
//! the arena so nested buckets can reference each other without ownership
//! cycles.
//!
//! ## Inline buckets
//!
//! A child bucket whose tree is a single leaf, contains no buckets of its
//! own and serializes under a quarter page is not given pages at all: its
//! value in the parent is the 8-byte root id 0 followed by a fake leaf
//! page. Spilling decides per child, so buckets move freely between inline
//! and paged as they shrink and grow.

use std::borrow::Cow;
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;

use crate::cursor::Cursor;
use crate::error::Error;
use crate::node::{write_node, NodeId};
use crate::storage::{
    self, btree_page_count, page_header, BRANCH_PAGE_FLAG, BTREE_PAGE_HEADER_SIZE,
    BUCKET_LEAF_FLAG, LEAF_PAGE_FLAG, PAGE_SIZE,
};
use crate::tx::{Graph, Tx};

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 32768;
/// Maximum value length in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

pub(crate) const MIN_FILL_PERCENT: f64 = 0.1;
pub(crate) const MAX_FILL_PERCENT: f64 = 1.0;
/// Split threshold fraction for freshly opened buckets.
pub const DEFAULT_FILL_PERCENT: f64 = 0.5;

/// Size of the bucket header stored in front of an inline page: the root
/// page id.
const BUCKET_HEADER_SIZE: usize = 8;

/// Handle of a bucket in the transaction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BucketId(pub(crate) u32);

/// Per-transaction state of one bucket.
#[derive(Debug)]
pub(crate) struct BucketState {
    /// Root page of the tree; 0 means the bucket is inline.
    pub root: u64,
    /// Split threshold as a fraction of the page size, clamped to
    /// [0.1, 1.0] when used. Not persisted.
    pub fill_percent: f64,
    /// Materialized root node, if any.
    pub root_node: Option<NodeId>,
    /// Serialized inline page (without the bucket header), for inline
    /// buckets that have not materialized yet.
    pub inline: Option<Arc<[u8]>>,
    /// Materialized nodes by page id.
    pub nodes: HashMap<u64, NodeId>,
    /// Opened child buckets by name.
    pub children: HashMap<Vec<u8>, BucketId>,
}

impl BucketState {
    pub fn new(root: u64) -> Self {
        Self {
            root,
            fill_percent: DEFAULT_FILL_PERCENT,
            root_node: None,
            inline: None,
            nodes: HashMap::new(),
            children: HashMap::new(),
        }
    }
}

impl Graph {
    pub(crate) fn alloc_bucket(&mut self, state: BucketState) -> BucketId {
        let id = BucketId(self.buckets.len() as u32);
        self.buckets.push(state);
        id
    }

    pub(crate) fn bucket(&self, id: BucketId) -> &BucketState {
        &self.buckets[id.0 as usize]
    }

    pub(crate) fn bucket_mut(&mut self, id: BucketId) -> &mut BucketState {
        &mut self.buckets[id.0 as usize]
    }
}

/// An ordered key/value map inside a transaction. Valid only for the
/// transaction's lifetime.
#[derive(Clone, Copy)]
pub struct Bucket<'tx> {
    pub(crate) tx: &'tx Tx<'tx>,
    pub(crate) id: BucketId,
}

impl<'tx> Bucket<'tx> {
    /// The transaction this bucket belongs to.
    pub fn tx(&self) -> &'tx Tx<'tx> {
        self.tx
    }

    /// Root page id of the bucket's tree; 0 for inline buckets.
    pub fn root(&self) -> u64 {
        self.tx.graph.borrow().bucket(self.id).root
    }

    pub fn writable(&self) -> bool {
        self.tx.writable()
    }

    /// Sets the split threshold for this bucket. Append-mostly workloads
    /// benefit from values close to 1.0. Not persisted across
    /// transactions.
    pub fn set_fill_percent(&self, fill_percent: f64) {
        self.tx.graph.borrow_mut().bucket_mut(self.id).fill_percent = fill_percent;
    }

    /// A cursor over this bucket, valid while the transaction is open.
    pub fn cursor(&self) -> Cursor<'tx> {
        self.tx.stats.borrow_mut().cursor_count += 1;
        Cursor::new(*self)
    }

    /// Looks up a value. `None` when the key is absent or names a nested
    /// bucket.
    pub fn get(&self, key: &[u8]) -> Result<Option<Cow<'tx, [u8]>>> {
        self.tx.ensure_open()?;

        let mut cursor = self.cursor();
        let Some(kv) = cursor.seek_raw(key)? else {
            return Ok(None);
        };

        if kv.flags & BUCKET_LEAF_FLAG != 0 || kv.key.as_ref() != key {
            return Ok(None);
        }

        Ok(Some(kv.value))
    }

    /// Inserts or overwrites a key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::KeyRequired.into());
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(Error::KeyTooLarge.into());
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge.into());
        }
        self.tx.ensure_open()?;
        self.tx.ensure_writable()?;

        let mut cursor = self.cursor();
        let kv = cursor.seek_raw(key)?;

        if let Some(kv) = &kv {
            if kv.flags & BUCKET_LEAF_FLAG != 0 && kv.key.as_ref() == key {
                return Err(Error::IncompatibleValue.into());
            }
        }

        let leaf = cursor.leaf_node()?;
        let max_pgid = self.tx.meta.borrow().max_pgid();
        self.tx.graph.borrow_mut().node_put(
            leaf,
            key,
            Arc::from(key),
            Arc::from(value),
            0,
            0,
            max_pgid,
        )
    }

    /// Removes a key. Absent keys are a no-op; bucket keys are rejected.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.tx.ensure_open()?;
        self.tx.ensure_writable()?;

        let mut cursor = self.cursor();
        let Some(kv) = cursor.seek_raw(key)? else {
            return Ok(());
        };
        if kv.key.as_ref() != key {
            return Ok(());
        }
        if kv.flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue.into());
        }

        let leaf = cursor.leaf_node()?;
        self.tx.graph.borrow_mut().node_del(leaf, key);
        Ok(())
    }

    /// Opens a nested bucket by name.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'tx>>> {
        self.tx.ensure_open()?;

        if let Some(&child) = self.tx.graph.borrow().bucket(self.id).children.get(name) {
            return Ok(Some(Bucket { tx: self.tx, id: child }));
        }

        let mut cursor = self.cursor();
        let Some(kv) = cursor.seek_raw(name)? else {
            return Ok(None);
        };
        if kv.key.as_ref() != name || kv.flags & BUCKET_LEAF_FLAG == 0 {
            return Ok(None);
        }

        let child = self.tx.open_bucket_from_value(&kv.value)?;
        self.tx
            .graph
            .borrow_mut()
            .bucket_mut(self.id)
            .children
            .insert(name.to_vec(), child);

        Ok(Some(Bucket { tx: self.tx, id: child }))
    }

    /// Creates a nested bucket, failing if the name is taken.
    pub fn create_bucket(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        self.tx.ensure_open()?;
        self.tx.ensure_writable()?;
        if name.is_empty() {
            return Err(Error::BucketNameRequired.into());
        }

        let mut cursor = self.cursor();
        if let Some(kv) = cursor.seek_raw(name)? {
            if kv.key.as_ref() == name {
                if kv.flags & BUCKET_LEAF_FLAG != 0 {
                    return Err(Error::BucketExists.into());
                }
                return Err(Error::IncompatibleValue.into());
            }
        }

        // The child starts life as an empty inline bucket: root id 0 plus
        // an empty leaf page.
        let mut value = vec![0u8; BUCKET_HEADER_SIZE + BTREE_PAGE_HEADER_SIZE];
        storage::page_header_mut(&mut value[BUCKET_HEADER_SIZE..])?.set_flags(LEAF_PAGE_FLAG);

        let leaf = cursor.leaf_node()?;
        let max_pgid = self.tx.meta.borrow().max_pgid();
        self.tx.graph.borrow_mut().node_put(
            leaf,
            name,
            Arc::from(name),
            Arc::from(value.as_slice()),
            0,
            BUCKET_LEAF_FLAG,
            max_pgid,
        )?;

        // Sub-buckets are not allowed on an inline parent; from here on
        // this bucket goes through materialized nodes only.
        self.tx.graph.borrow_mut().bucket_mut(self.id).inline = None;

        self.bucket(name)?
            .ok_or_else(|| eyre::eyre!("bucket vanished right after creation"))
    }

    /// Creates the bucket unless it already exists, returning it either
    /// way.
    pub fn create_bucket_if_not_exists(&self, name: &[u8]) -> Result<Bucket<'tx>> {
        match self.create_bucket(name) {
            Ok(bucket) => Ok(bucket),
            Err(e) if Error::is(&e, &Error::BucketExists) => self
                .bucket(name)?
                .ok_or_else(|| eyre::eyre!("existing bucket could not be reopened")),
            Err(e) => Err(e),
        }
    }

    /// Deletes a nested bucket and everything under it.
    pub fn delete_bucket(&self, name: &[u8]) -> Result<()> {
        self.tx.ensure_open()?;
        self.tx.ensure_writable()?;

        let mut cursor = self.cursor();
        let Some(kv) = cursor.seek_raw(name)? else {
            return Err(Error::BucketNotFound.into());
        };
        if kv.key.as_ref() != name {
            return Err(Error::BucketNotFound.into());
        }
        if kv.flags & BUCKET_LEAF_FLAG == 0 {
            return Err(Error::IncompatibleValue.into());
        }

        let child = self
            .bucket(name)?
            .ok_or_else(|| eyre::eyre!("bucket entry did not open"))?;

        // Children go first, bottom-up.
        let mut grandchildren = Vec::new();
        child.for_each(|k, v| {
            if v.is_none() {
                grandchildren.push(k.to_vec());
            }
            Ok(())
        })?;
        for grandchild in grandchildren {
            child.delete_bucket(&grandchild)?;
        }

        {
            let mut graph = self.tx.graph.borrow_mut();
            graph.bucket_mut(self.id).children.remove(name);
            let state = graph.bucket_mut(child.id);
            state.nodes.clear();
            state.root_node = None;
        }

        self.tx.free_bucket_pages(child.id)?;

        let leaf = cursor.leaf_node()?;
        self.tx.graph.borrow_mut().node_del(leaf, name);
        Ok(())
    }

    /// Calls `f` for every entry in order. Nested buckets appear with a
    /// `None` value. `f` must not modify the bucket.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], Option<&[u8]>) -> Result<()>) -> Result<()> {
        self.tx.ensure_open()?;

        let mut cursor = self.cursor();
        let mut entry = cursor.first()?;
        while let Some((key, value)) = entry {
            f(&key, value.as_deref())?;
            entry = cursor.next()?;
        }
        Ok(())
    }

    /// Resource statistics for this bucket and everything nested in it.
    pub fn stats(&self) -> Result<BucketStats> {
        self.tx.ensure_open()?;
        self.tx.bucket_stats(self.id)
    }
}

impl std::fmt::Debug for Bucket<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket").field("root", &self.root()).finish()
    }
}

/// Resource usage of a bucket, recursively.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BucketStats {
    /// Logical branch pages.
    pub branch_page_n: u64,
    /// Physical branch overflow pages.
    pub branch_overflow_n: u64,
    /// Logical leaf pages.
    pub leaf_page_n: u64,
    /// Physical leaf overflow pages.
    pub leaf_overflow_n: u64,
    /// Number of key/value pairs.
    pub key_n: u64,
    /// B+tree depth, nested buckets included.
    pub depth: u64,
    /// Bytes allocated for branch pages.
    pub branch_alloc: u64,
    /// Bytes actually used for branch data.
    pub branch_in_use: u64,
    /// Bytes allocated for leaf pages.
    pub leaf_alloc: u64,
    /// Bytes actually used for leaf data.
    pub leaf_in_use: u64,
    /// Total buckets, this one included.
    pub bucket_n: u64,
    /// Buckets stored inline in their parent.
    pub inline_bucket_n: u64,
    /// Bytes used by inline buckets (also counted in `leaf_in_use` of the
    /// parent).
    pub inline_bucket_in_use: u64,
}

impl BucketStats {
    pub fn add(&mut self, other: &BucketStats) {
        self.branch_page_n += other.branch_page_n;
        self.branch_overflow_n += other.branch_overflow_n;
        self.leaf_page_n += other.leaf_page_n;
        self.leaf_overflow_n += other.leaf_overflow_n;
        self.key_n += other.key_n;
        if self.depth < other.depth {
            self.depth = other.depth;
        }
        self.branch_alloc += other.branch_alloc;
        self.branch_in_use += other.branch_in_use;
        self.leaf_alloc += other.leaf_alloc;
        self.leaf_in_use += other.leaf_in_use;
        self.bucket_n += other.bucket_n;
        self.inline_bucket_n += other.inline_bucket_n;
        self.inline_bucket_in_use += other.inline_bucket_in_use;
    }
}

impl<'db> Tx<'db> {
    /// Deserializes a bucket header value into fresh arena state.
    pub(crate) fn open_bucket_from_value(&self, value: &[u8]) -> Result<BucketId> {
        ensure!(
            value.len() >= BUCKET_HEADER_SIZE,
            "bucket value too short: {} bytes",
            value.len()
        );

        let root = u64::from_le_bytes(value[..BUCKET_HEADER_SIZE].try_into().unwrap());
        let mut state = BucketState::new(root);
        if root == 0 {
            state.inline = Some(Arc::from(&value[BUCKET_HEADER_SIZE..]));
        }

        Ok(self.graph.borrow_mut().alloc_bucket(state))
    }

    /// Rebalances every node marked unbalanced in this bucket and its
    /// children.
    pub(crate) fn bucket_rebalance(&self, id: BucketId) -> Result<()> {
        let unbalanced: Vec<NodeId> = {
            let graph = self.graph.borrow();
            graph
                .bucket(id)
                .nodes
                .values()
                .copied()
                .filter(|&n| graph[n].unbalanced)
                .collect()
        };
        for node in unbalanced {
            self.node_rebalance(node)?;
        }

        let children: Vec<BucketId> = {
            let graph = self.graph.borrow();
            graph.bucket(id).children.values().copied().collect()
        };
        for child in children {
            self.bucket_rebalance(child)?;
        }
        Ok(())
    }

    /// Writes all modified nodes of a bucket to dirty pages, children
    /// first, and refreshes the bucket header values in the parent.
    pub(crate) fn bucket_spill(&self, id: BucketId) -> Result<()> {
        let names: Vec<Vec<u8>> = {
            let graph = self.graph.borrow();
            graph.bucket(id).children.keys().cloned().collect()
        };

        for name in names {
            let child = *self
                .graph
                .borrow()
                .bucket(id)
                .children
                .get(&name)
                .expect("cached child bucket");

            // Small leaf-only children pack into the parent value; the
            // rest spill normally and leave just their root id behind.
            let value: Vec<u8> = if self.bucket_inlinable(child) {
                self.free_bucket_pages(child)?;
                self.serialize_inline_bucket(child)?
            } else {
                self.bucket_spill(child)?;
                let root = self.graph.borrow().bucket(child).root;
                root.to_le_bytes().to_vec()
            };

            // Untouched buckets have nothing materialized and keep their
            // current header value.
            if self.graph.borrow().bucket(child).root_node.is_none() {
                continue;
            }

            let parent = Bucket { tx: self, id };
            let mut cursor = parent.cursor();
            let kv = cursor.seek_raw(&name)?;
            match &kv {
                Some(kv) if kv.key.as_ref() == name.as_slice() => {
                    if kv.flags & BUCKET_LEAF_FLAG == 0 {
                        bail!("unexpected bucket header flag: {:#x}", kv.flags);
                    }
                }
                _ => bail!("misplaced bucket header for {:?}", name),
            }

            let leaf = cursor.leaf_node()?;
            let max_pgid = self.meta.borrow().max_pgid();
            self.graph.borrow_mut().node_put(
                leaf,
                &name,
                Arc::from(name.as_slice()),
                Arc::from(value.as_slice()),
                0,
                BUCKET_LEAF_FLAG,
                max_pgid,
            )?;
        }

        let Some(root_node) = self.graph.borrow().bucket(id).root_node else {
            return Ok(());
        };

        self.node_spill(root_node)?;

        let mut graph = self.graph.borrow_mut();
        let root_node = graph.root_of(
            graph
                .bucket(id)
                .root_node
                .expect("root node survives spill"),
        );
        let pgid = graph[root_node].pgid;
        let max_pgid = self.meta.borrow().max_pgid();
        if pgid >= max_pgid {
            return Err(Error::PageIdAboveHighWaterMark {
                pgid,
                high_water: max_pgid,
            }
            .into());
        }

        graph.bucket_mut(id).root_node = Some(root_node);
        graph.bucket_mut(id).root = pgid;
        Ok(())
    }

    /// Whether a bucket can be packed into its parent's leaf value: a
    /// single leaf node, no nested buckets, under a quarter page
    /// serialized.
    pub(crate) fn bucket_inlinable(&self, id: BucketId) -> bool {
        let graph = self.graph.borrow();
        let Some(root) = graph.bucket(id).root_node else {
            return false;
        };
        let node = &graph[root];
        if !node.is_leaf {
            return false;
        }
        if node
            .inodes
            .iter()
            .any(|inode| inode.flags & BUCKET_LEAF_FLAG != 0)
        {
            return false;
        }

        BUCKET_HEADER_SIZE + node.size() <= PAGE_SIZE / 4
    }

    /// Serializes an inlinable bucket into a parent leaf value.
    pub(crate) fn serialize_inline_bucket(&self, id: BucketId) -> Result<Vec<u8>> {
        let graph = self.graph.borrow();
        let state = graph.bucket(id);
        let root_node = state
            .root_node
            .ok_or_else(|| eyre::eyre!("inline serialization without a root node"))?;
        let node = &graph[root_node];

        let mut value = vec![0u8; BUCKET_HEADER_SIZE + node.size()];
        value[..BUCKET_HEADER_SIZE].copy_from_slice(&state.root.to_le_bytes());
        write_node(node, &mut value[BUCKET_HEADER_SIZE..])?;
        Ok(value)
    }

    /// Returns every page of a bucket's tree to the freelist.
    pub(crate) fn free_bucket_pages(&self, id: BucketId) -> Result<()> {
        let root = self.graph.borrow().bucket(id).root;
        if root == 0 {
            return Ok(());
        }

        self.free_tree(id, root)?;
        self.graph.borrow_mut().bucket_mut(id).root = 0;
        Ok(())
    }

    fn free_tree(&self, bucket: BucketId, pgid: u64) -> Result<()> {
        let cached = self.graph.borrow().bucket(bucket).nodes.get(&pgid).copied();

        let children: Vec<u64> = match cached {
            Some(node) => {
                let children = {
                    let graph = self.graph.borrow();
                    if graph[node].is_leaf {
                        Vec::new()
                    } else {
                        graph[node].inodes.iter().map(|inode| inode.pgid).collect()
                    }
                };
                self.node_free(node)?;
                children
            }
            None => {
                let children = self.with_page(pgid, |page| -> Result<Vec<u64>> {
                    let header = page_header(page)?;
                    if header.flags() & BRANCH_PAGE_FLAG == 0 {
                        return Ok(Vec::new());
                    }
                    let count = btree_page_count(page)?;
                    let mut pgids = Vec::with_capacity(count);
                    for i in 0..count {
                        let (elem, _) = storage::branch_elem(page, i)?;
                        pgids.push(elem.pgid());
                    }
                    Ok(pgids)
                })??;
                self.free_page(pgid)?;
                children
            }
        };

        for child in children {
            self.free_tree(bucket, child)?;
        }
        Ok(())
    }

    /// Collects [`BucketStats`] for a bucket and its children.
    pub(crate) fn bucket_stats(&self, id: BucketId) -> Result<BucketStats> {
        let mut stats = BucketStats::default();
        let mut sub = BucketStats::default();
        stats.bucket_n = 1;

        let (root, inline) = {
            let graph = self.graph.borrow();
            let state = graph.bucket(id);
            (state.root, state.inline.clone())
        };
        if root == 0 {
            stats.inline_bucket_n = 1;
        }

        let mut sub_values: Vec<Vec<u8>> = Vec::new();
        let mut tally = |page: &[u8], depth: usize| -> Result<()> {
            let header = page_header(page)?;
            let count = btree_page_count(page)?;

            if header.flags() & LEAF_PAGE_FLAG != 0 {
                stats.key_n += count as u64;

                let mut used = BTREE_PAGE_HEADER_SIZE as u64;
                if count > 0 {
                    // The last element's pos equals the combined size of
                    // every earlier key and value, so one lookup covers
                    // the whole page.
                    used += (storage::LEAF_ELEM_SIZE * (count - 1)) as u64;
                    let (last, _, _) = storage::leaf_elem(page, count - 1)?;
                    used += (last.pos() + last.ksize() + last.vsize()) as u64;
                }

                if root == 0 {
                    stats.inline_bucket_in_use += used;
                } else {
                    stats.leaf_page_n += 1;
                    stats.leaf_in_use += used;
                    stats.leaf_overflow_n += header.overflow() as u64;
                }

                for i in 0..count {
                    let (elem, _, value) = storage::leaf_elem(page, i)?;
                    if elem.flags() & BUCKET_LEAF_FLAG != 0 {
                        sub_values.push(value.to_vec());
                    }
                }
            } else if header.flags() & BRANCH_PAGE_FLAG != 0 {
                stats.branch_page_n += 1;

                let mut used =
                    (BTREE_PAGE_HEADER_SIZE + storage::BRANCH_ELEM_SIZE * (count - 1)) as u64;
                let (last, _) = storage::branch_elem(page, count - 1)?;
                used += (last.pos() + last.ksize()) as u64;

                stats.branch_in_use += used;
                stats.branch_overflow_n += header.overflow() as u64;
            }

            if depth as u64 + 1 > stats.depth {
                stats.depth = depth as u64 + 1;
            }
            Ok(())
        };

        match inline {
            Some(bytes) if root == 0 => tally(&bytes, 0)?,
            _ if root == 0 => {
                // Materialized inline bucket without a serialized page:
                // nothing on disk to measure yet.
                stats.depth = stats.depth.max(1);
            }
            _ => self.for_each_page(root, 0, &mut tally)?,
        }

        for value in sub_values {
            let child = self.open_bucket_from_value(&value)?;
            sub.add(&self.bucket_stats(child)?);
        }

        stats.branch_alloc = (stats.branch_page_n + stats.branch_overflow_n) * PAGE_SIZE as u64;
        stats.leaf_alloc = (stats.leaf_page_n + stats.leaf_overflow_n) * PAGE_SIZE as u64;

        stats.depth += sub.depth;
        stats.add(&sub);
        Ok(stats)
    }
}
