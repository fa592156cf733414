//! # Cursors
//!
//! Sorted traversal over one bucket. A cursor keeps a stack of
//! `(location, index)` frames from the bucket root down to the current
//! element; locations are committed pages, the bucket's inline page, or
//! nodes materialized by this write transaction.
//!
//! Returned keys and values are [`Cow`]s: read-only transactions hand out
//! slices borrowed straight from the transaction's memory map, while
//! writable transactions copy, since their data may live in nodes or dirty
//! buffers that move underneath a long-lived borrow.
//!
//! Mutating the bucket invalidates the cursor's position; reposition with
//! `seek`/`first`/`last` after writes. `delete` is the exception: it keeps
//! the stack and arranges for the following `next()` to return the entry
//! that slid into the freed slot.

use std::borrow::Cow;

use eyre::{ensure, Result};
use smallvec::SmallVec;

use crate::bucket::Bucket;
use crate::error::Error;
use crate::node::NodeId;
use crate::storage::{
    self, btree_page_count, page_header, BUCKET_LEAF_FLAG, LEAF_PAGE_FLAG,
};

/// A key with its value; nested buckets surface as `None` values.
pub type Entry<'tx> = (Cow<'tx, [u8]>, Option<Cow<'tx, [u8]>>);

/// Raw leaf element as seen by internal callers: bucket headers keep their
/// value and flags.
pub(crate) struct RawKv<'tx> {
    pub key: Cow<'tx, [u8]>,
    pub value: Cow<'tx, [u8]>,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
enum Loc {
    /// A committed page (possibly shadowed by a dirty buffer).
    Page(u64),
    /// The bucket's inline page.
    Inline,
    /// A node materialized in this write transaction.
    Node(NodeId),
}

#[derive(Debug, Clone, Copy)]
struct ElemRef {
    loc: Loc,
    index: usize,
}

/// Iterator over the keys of one bucket in byte order.
pub struct Cursor<'tx> {
    bucket: Bucket<'tx>,
    stack: SmallVec<[ElemRef; 8]>,
    /// Set by `delete`: the element under the cursor was removed, so the
    /// next `next()` must not advance.
    skip_next: bool,
    /// The positioned element no longer exists.
    current_deleted: bool,
}

impl<'tx> Cursor<'tx> {
    pub(crate) fn new(bucket: Bucket<'tx>) -> Self {
        Self {
            bucket,
            stack: SmallVec::new(),
            skip_next: false,
            current_deleted: false,
        }
    }

    /// The bucket this cursor iterates.
    pub fn bucket(&self) -> Bucket<'tx> {
        self.bucket
    }

    /// Moves to the smallest key.
    pub fn first(&mut self) -> Result<Option<Entry<'tx>>> {
        self.bucket.tx.ensure_open()?;
        self.skip_next = false;
        self.current_deleted = false;

        self.stack.clear();
        let root = self.root_loc()?;
        self.stack.push(ElemRef { loc: root, index: 0 });
        self.descend_first()?;

        // An empty root leaf has nothing at index 0.
        if self.top_count()? == 0 {
            self.move_next()?;
        }

        Ok(self.key_value()?.map(into_entry))
    }

    /// Moves to the largest key.
    pub fn last(&mut self) -> Result<Option<Entry<'tx>>> {
        self.bucket.tx.ensure_open()?;
        self.skip_next = false;
        self.current_deleted = false;

        self.stack.clear();
        let root = self.root_loc()?;
        let count = self.count_of(&root)?;
        self.stack.push(ElemRef {
            loc: root,
            index: count.saturating_sub(1),
        });
        self.descend_last()?;

        Ok(self.key_value()?.map(into_entry))
    }

    /// Moves to the next key.
    pub fn next(&mut self) -> Result<Option<Entry<'tx>>> {
        self.bucket.tx.ensure_open()?;

        let kv = if self.skip_next {
            // A delete shifted the successor into the current slot.
            self.key_value()?
        } else {
            self.move_next()?
        };
        self.skip_next = false;
        self.current_deleted = false;

        Ok(kv.map(into_entry))
    }

    /// Moves to the previous key.
    pub fn prev(&mut self) -> Result<Option<Entry<'tx>>> {
        self.bucket.tx.ensure_open()?;
        self.skip_next = false;
        self.current_deleted = false;

        while let Some(top) = self.stack.last_mut() {
            if top.index > 0 {
                top.index -= 1;
                break;
            }
            self.stack.pop();
        }

        if self.stack.is_empty() {
            return Ok(None);
        }

        self.descend_last()?;
        Ok(self.key_value()?.map(into_entry))
    }

    /// Moves to `key`, or to the smallest key after it. `None` when every
    /// key is smaller.
    pub fn seek(&mut self, key: &[u8]) -> Result<Option<Entry<'tx>>> {
        self.bucket.tx.ensure_open()?;
        self.skip_next = false;
        self.current_deleted = false;

        Ok(self.seek_raw(key)?.map(into_entry))
    }

    /// Removes the entry under the cursor.
    pub fn delete(&mut self) -> Result<()> {
        self.bucket.tx.ensure_open()?;
        self.bucket.tx.ensure_writable()?;

        let Some(kv) = self.key_value()? else {
            return Err(Error::CursorNotPositioned.into());
        };
        if kv.flags & BUCKET_LEAF_FLAG != 0 {
            return Err(Error::IncompatibleValue.into());
        }
        if self.current_deleted {
            return Err(Error::CursorNotPositioned.into());
        }

        let node = self.leaf_node()?;
        let mut graph = self.bucket.tx.graph.borrow_mut();
        graph.node_del(node, &kv.key);

        self.skip_next = !graph[node].inodes.is_empty();
        self.current_deleted = true;
        Ok(())
    }

    /// Positions at `key` or its successor and returns the raw element.
    pub(crate) fn seek_raw(&mut self, key: &[u8]) -> Result<Option<RawKv<'tx>>> {
        self.stack.clear();
        let root = self.bucket.tx.graph.borrow().bucket(self.bucket.id).root;
        self.search(key, root)?;

        // Landed past the last element of the leaf: the successor lives in
        // the next leaf over.
        let top = *self.stack.last().expect("search leaves a frame");
        if top.index >= self.count_of(&top.loc)? {
            return self.move_next();
        }

        self.key_value()
    }

    /// Materializes nodes down the current stack and returns the leaf
    /// node under the cursor.
    pub(crate) fn leaf_node(&mut self) -> Result<NodeId> {
        ensure!(!self.stack.is_empty(), "cursor has no position");

        if let ElemRef {
            loc: Loc::Node(node),
            ..
        } = self.stack[self.stack.len() - 1]
        {
            if self.bucket.tx.graph.borrow()[node].is_leaf {
                return Ok(node);
            }
        }

        let tx = self.bucket.tx;
        let mut node = match self.stack[0].loc {
            Loc::Node(node) => node,
            Loc::Page(pgid) => tx.materialize_node(self.bucket.id, pgid, None)?,
            Loc::Inline => tx.materialize_node(self.bucket.id, 0, None)?,
        };
        self.stack[0].loc = Loc::Node(node);

        for i in 1..self.stack.len() {
            let index = self.stack[i - 1].index;
            node = tx.node_child_at(node, index)?;
            self.stack[i].loc = Loc::Node(node);
        }

        ensure!(
            tx.graph.borrow()[node].is_leaf,
            "cursor stack does not end on a leaf"
        );
        Ok(node)
    }

    fn root_loc(&self) -> Result<Loc> {
        let root = self.bucket.tx.graph.borrow().bucket(self.bucket.id).root;
        self.loc_for(root)
    }

    /// Resolves a page id to the freshest representation: a cached node,
    /// the inline page, or the page itself.
    fn loc_for(&self, pgid: u64) -> Result<Loc> {
        let graph = self.bucket.tx.graph.borrow();
        let state = graph.bucket(self.bucket.id);

        if state.root == 0 {
            ensure!(pgid == 0, "inline bucket page access: {} != 0", pgid);
            return Ok(match state.root_node {
                Some(node) => Loc::Node(node),
                None => Loc::Inline,
            });
        }

        Ok(match state.nodes.get(&pgid) {
            Some(&node) => Loc::Node(node),
            None => Loc::Page(pgid),
        })
    }

    fn count_of(&self, loc: &Loc) -> Result<usize> {
        let tx = self.bucket.tx;
        match *loc {
            Loc::Node(node) => Ok(tx.graph.borrow()[node].inodes.len()),
            Loc::Inline => {
                let bytes = self.inline_bytes()?;
                btree_page_count(&bytes)
            }
            Loc::Page(pgid) => tx.with_page(pgid, btree_page_count)?,
        }
    }

    fn is_leaf(&self, loc: &Loc) -> Result<bool> {
        let tx = self.bucket.tx;
        match *loc {
            Loc::Node(node) => Ok(tx.graph.borrow()[node].is_leaf),
            Loc::Inline => Ok(true),
            Loc::Page(pgid) => {
                tx.with_page(pgid, |page| Ok(page_header(page)?.flags() & LEAF_PAGE_FLAG != 0))?
            }
        }
    }

    fn top_count(&self) -> Result<usize> {
        let top = self.stack.last().expect("cursor stack is not empty");
        self.count_of(&top.loc)
    }

    fn inline_bytes(&self) -> Result<std::sync::Arc<[u8]>> {
        self.bucket
            .tx
            .graph
            .borrow()
            .bucket(self.bucket.id)
            .inline
            .clone()
            .ok_or_else(|| eyre::eyre!("inline bucket has no page"))
    }

    /// Child page id referenced by a branch frame.
    fn child_pgid(&self, elem: &ElemRef) -> Result<u64> {
        let tx = self.bucket.tx;
        match elem.loc {
            Loc::Node(node) => Ok(tx.graph.borrow()[node].inodes[elem.index].pgid),
            Loc::Page(pgid) => tx.with_page(pgid, |page| {
                let (e, _) = storage::branch_elem(page, elem.index)?;
                Ok(e.pgid())
            })?,
            Loc::Inline => eyre::bail!("inline pages have no children"),
        }
    }

    /// Walks to the leftmost leaf under the top frame.
    fn descend_first(&mut self) -> Result<()> {
        loop {
            let top = *self.stack.last().expect("cursor stack is not empty");
            if self.is_leaf(&top.loc)? {
                return Ok(());
            }
            let pgid = self.child_pgid(&top)?;
            let loc = self.loc_for(pgid)?;
            self.stack.push(ElemRef { loc, index: 0 });
        }
    }

    /// Walks to the rightmost leaf under the top frame.
    fn descend_last(&mut self) -> Result<()> {
        loop {
            let top = *self.stack.last().expect("cursor stack is not empty");
            if self.is_leaf(&top.loc)? {
                return Ok(());
            }
            let pgid = self.child_pgid(&top)?;
            let loc = self.loc_for(pgid)?;
            let count = self.count_of(&loc)?;
            self.stack.push(ElemRef {
                loc,
                index: count.saturating_sub(1),
            });
        }
    }

    /// Advances to the next leaf element, skipping empty leaves. Leaves
    /// the cursor on the last element when already at the end.
    fn move_next(&mut self) -> Result<Option<RawKv<'tx>>> {
        loop {
            let mut level = self.stack.len() as isize - 1;
            while level >= 0 {
                let elem = self.stack[level as usize];
                if elem.index + 1 < self.count_of(&elem.loc)? {
                    self.stack[level as usize].index += 1;
                    break;
                }
                level -= 1;
            }

            if level < 0 {
                return Ok(None);
            }

            self.stack.truncate(level as usize + 1);
            self.descend_first()?;

            if self.top_count()? == 0 {
                continue;
            }

            return self.key_value();
        }
    }

    /// Recursive descent binary search for `key`.
    fn search(&mut self, key: &[u8], pgid: u64) -> Result<()> {
        let loc = self.loc_for(pgid)?;
        self.stack.push(ElemRef { loc, index: 0 });

        if self.is_leaf(&loc)? {
            return self.search_leaf(key);
        }

        let (index, child) = self.search_branch(key, &loc)?;
        self.stack.last_mut().expect("frame just pushed").index = index;
        self.search(key, child)
    }

    /// Index of the last branch key ≤ `key` (0 when all keys are larger),
    /// plus the child page id there.
    fn search_branch(&self, key: &[u8], loc: &Loc) -> Result<(usize, u64)> {
        let tx = self.bucket.tx;
        match *loc {
            Loc::Node(node) => {
                let graph = tx.graph.borrow();
                let inodes = &graph[node].inodes;
                let le_count = inodes.partition_point(|inode| inode.key.as_ref() <= key);
                let index = le_count.saturating_sub(1);
                Ok((index, inodes[index].pgid))
            }
            Loc::Page(pgid) => tx.with_page(pgid, |page| {
                let count = btree_page_count(page)?;
                let le_count = partition_point_fallible(count, |i| {
                    let (_, k) = storage::branch_elem(page, i)?;
                    Ok(k <= key)
                })?;
                let index = le_count.saturating_sub(1);
                let (elem, _) = storage::branch_elem(page, index)?;
                Ok((index, elem.pgid()))
            })?,
            Loc::Inline => eyre::bail!("inline pages have no children"),
        }
    }

    /// Leaf search: index of the first key ≥ `key` (the insertion point).
    fn search_leaf(&mut self, key: &[u8]) -> Result<()> {
        let top = *self.stack.last().expect("cursor stack is not empty");
        let tx = self.bucket.tx;

        let index = match top.loc {
            Loc::Node(node) => {
                let graph = tx.graph.borrow();
                graph[node]
                    .inodes
                    .partition_point(|inode| inode.key.as_ref() < key)
            }
            Loc::Inline => {
                let bytes = self.inline_bytes()?;
                let count = btree_page_count(&bytes)?;
                partition_point_fallible(count, |i| {
                    let (_, k, _) = storage::leaf_elem(&bytes, i)?;
                    Ok(k < key)
                })?
            }
            Loc::Page(pgid) => tx.with_page(pgid, |page| {
                let count = btree_page_count(page)?;
                partition_point_fallible(count, |i| {
                    let (_, k, _) = storage::leaf_elem(page, i)?;
                    Ok(k < key)
                })
            })??,
        };

        self.stack.last_mut().expect("frame exists").index = index;
        Ok(())
    }

    /// The element under the cursor, or `None` when positioned past the
    /// end or on an empty page.
    pub(crate) fn key_value(&self) -> Result<Option<RawKv<'tx>>> {
        let Some(top) = self.stack.last() else {
            return Ok(None);
        };

        let count = self.count_of(&top.loc)?;
        if count == 0 || top.index >= count {
            return Ok(None);
        }

        let tx = self.bucket.tx;
        match top.loc {
            Loc::Node(node) => {
                let graph = tx.graph.borrow();
                let inode = &graph[node].inodes[top.index];
                Ok(Some(RawKv {
                    key: Cow::Owned(inode.key.to_vec()),
                    value: Cow::Owned(inode.value.to_vec()),
                    flags: inode.flags,
                }))
            }
            Loc::Inline => {
                let bytes = self.inline_bytes()?;
                let (elem, key, value) = storage::leaf_elem(&bytes, top.index)?;
                Ok(Some(RawKv {
                    key: Cow::Owned(key.to_vec()),
                    value: Cow::Owned(value.to_vec()),
                    flags: elem.flags(),
                }))
            }
            Loc::Page(pgid) => {
                if tx.writable() {
                    // Dirty buffers and future remaps make borrows from a
                    // write transaction unstable; hand out copies.
                    tx.with_page(pgid, |page| {
                        let (elem, key, value) = storage::leaf_elem(page, top.index)?;
                        Ok(Some(RawKv {
                            key: Cow::Owned(key.to_vec()),
                            value: Cow::Owned(value.to_vec()),
                            flags: elem.flags(),
                        }))
                    })?
                } else {
                    let page = tx.mapped_page(pgid)?;
                    let (elem, key, value) = storage::leaf_elem(page, top.index)?;
                    Ok(Some(RawKv {
                        key: Cow::Borrowed(key),
                        value: Cow::Borrowed(value),
                        flags: elem.flags(),
                    }))
                }
            }
        }
    }
}

fn into_entry(kv: RawKv<'_>) -> Entry<'_> {
    if kv.flags & BUCKET_LEAF_FLAG != 0 {
        (kv.key, None)
    } else {
        (kv.key, Some(kv.value))
    }
}

/// `partition_point` over an indexed sequence with a fallible predicate:
/// first index where the predicate turns false.
fn partition_point_fallible(
    count: usize,
    mut pred: impl FnMut(usize) -> Result<bool>,
) -> Result<usize> {
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid)? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}
