//! # Page Buffer Pool
//!
//! Reusable page-sized buffers for the single-page dirty allocations of
//! write transactions. Multi-page (overflow) allocations are rare and use
//! plain boxed slices scoped to their transaction; single-page buffers
//! dominate commits, so they are recycled for the lifetime of the database.
//!
//! The pool is only ever touched while the writer mutex is held (one write
//! transaction at a time allocates and returns buffers), so a single
//! mutex-guarded stack suffices.
//!
//! `PooledPageBuffer` returns itself to the pool on drop; `ManuallyDrop`
//! keeps the buffer valid until then without an `Option` state.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::PAGE_SIZE;

pub(crate) struct PagePool {
    inner: Arc<Mutex<Vec<Box<[u8; PAGE_SIZE]>>>>,
}

impl PagePool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Pops a recycled buffer or allocates a fresh zeroed one. Recycled
    /// buffers keep their previous contents; callers overwrite the full
    /// header and every byte they later read back.
    pub fn acquire(&self) -> PooledPageBuffer {
        let buffer = self
            .inner
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new([0u8; PAGE_SIZE]));

        PooledPageBuffer {
            buffer: ManuallyDrop::new(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.inner.lock().len()
    }
}

impl std::fmt::Debug for PagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePool")
            .field("available", &self.inner.lock().len())
            .finish()
    }
}

pub(crate) struct PooledPageBuffer {
    buffer: ManuallyDrop<Box<[u8; PAGE_SIZE]>>,
    pool: Arc<Mutex<Vec<Box<[u8; PAGE_SIZE]>>>>,
}

impl std::fmt::Debug for PooledPageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledPageBuffer").finish()
    }
}

impl Deref for PooledPageBuffer {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl DerefMut for PooledPageBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

impl Drop for PooledPageBuffer {
    fn drop(&mut self) {
        // SAFETY: drop runs exactly once and the buffer is valid until this
        // point; after the take, self.buffer is never touched again.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        self.pool.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_to_pool_on_drop() {
        let pool = PagePool::new();
        assert_eq!(pool.available(), 0);

        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn recycled_buffer_keeps_capacity() {
        let pool = PagePool::new();
        {
            let mut buf = pool.acquire();
            buf[0] = 0xAB;
        }

        let buf = pool.acquire();
        assert_eq!(buf.len(), PAGE_SIZE);
        assert_eq!(pool.available(), 0);
    }
}
