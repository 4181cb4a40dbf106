//! Fixed-size block pool.
//!
//! Every byte the protocol or the log touches lives in a [`Block`] leased from
//! a [`BufferPool`]. A block is owned by exactly one holder at a time (a
//! chain, a segment copy, a socket pump, the free list) and goes back to the
//! free list when it is dropped. There is no reference counting: moving a
//! block moves ownership.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Block size of the global pool.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Smallest block size a pool will use.
///
/// A correlated message header (opcode + u32 length + u16 request id) must
/// fit in the first block of a chain.
pub const MIN_BLOCK_SIZE: usize = 8;

static GLOBAL: OnceLock<BufferPool> = OnceLock::new();

/// A pool of fixed-size byte blocks recycled through a free list.
///
/// Cloning a pool is cheap and yields a handle to the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    block_size: usize,
    free_list: Mutex<Vec<Box<[u8]>>>,
    allocated: AtomicUsize,
    leased: AtomicUsize,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Block size in bytes.
    pub block_size: usize,
    /// Blocks ever allocated from the heap (minus those dropped by `shrink`).
    pub allocated: usize,
    /// Blocks currently sitting in the free list.
    pub free: usize,
    /// Blocks currently leased out.
    pub leased: usize,
}

impl BufferPool {
    /// Creates a private pool with the given block size.
    ///
    /// Sizes below [`MIN_BLOCK_SIZE`] are raised to it.
    pub fn new(block_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                block_size: block_size.max(MIN_BLOCK_SIZE),
                free_list: Mutex::new(Vec::new()),
                allocated: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the process-wide pool.
    pub fn global() -> &'static BufferPool {
        GLOBAL.get_or_init(|| BufferPool::new(DEFAULT_BLOCK_SIZE))
    }

    /// Returns the size of every block in this pool.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Leases an empty block, reusing a free one when available.
    pub fn get(&self) -> Block {
        let reused = self.inner.free_list.lock().pop();
        let data = reused.unwrap_or_else(|| {
            self.inner.allocated.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.inner.block_size].into_boxed_slice()
        });
        self.inner.leased.fetch_add(1, Ordering::Relaxed);
        Block {
            data,
            len: 0,
            pool: self.clone(),
        }
    }

    /// Drops every block in the free list, returning how many were freed.
    pub fn shrink(&self) -> usize {
        let mut list = self.inner.free_list.lock();
        let freed = list.len();
        list.clear();
        self.inner.allocated.fetch_sub(freed, Ordering::Relaxed);
        freed
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            block_size: self.inner.block_size,
            allocated: self.inner.allocated.load(Ordering::Relaxed),
            free: self.inner.free_list.lock().len(),
            leased: self.inner.leased.load(Ordering::Relaxed),
        }
    }

    /// Returns true if both handles share one free list.
    #[must_use]
    pub fn same_pool(&self, other: &BufferPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn release(&self, data: Box<[u8]>) {
        self.inner.leased.fetch_sub(1, Ordering::Relaxed);
        self.inner.free_list.lock().push(data);
    }

    /// Returns a batch of storage under a single lock acquisition.
    pub(crate) fn release_many(&self, batch: Vec<Box<[u8]>>) {
        if batch.is_empty() {
            return;
        }
        self.inner.leased.fetch_sub(batch.len(), Ordering::Relaxed);
        self.inner.free_list.lock().extend(batch);
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        BufferPool::global().clone()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.inner.block_size)
            .finish_non_exhaustive()
    }
}

/// A leased block: fixed capacity, a filled prefix of `len` bytes.
pub struct Block {
    data: Box<[u8]>,
    len: usize,
    pool: BufferPool,
}

impl Block {
    /// Returns the filled bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Returns the filled bytes mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Returns the unfilled tail, e.g. as a socket read target.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Marks `n` more bytes of the spare tail as filled.
    ///
    /// Values beyond the spare capacity are clamped.
    pub fn advance(&mut self, n: usize) {
        self.len = (self.len + n).min(self.data.len());
    }

    /// Copies as much of `bytes` as fits, returning the count copied.
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// Removes the first `n` filled bytes, shifting the rest to the front.
    pub fn discard_front(&mut self, n: usize) {
        let n = n.min(self.len);
        self.data.copy_within(n..self.len, 0);
        self.len -= n;
    }

    /// Keeps only the first `len` filled bytes.
    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Resets the block to empty.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Returns the number of filled bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are filled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the block capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Returns the unfilled capacity.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Returns true if the block has no spare capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len == self.data.len()
    }

    /// Returns the pool this block goes back to.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Detaches the storage so the caller can batch its release.
    pub(crate) fn take_storage(&mut self) -> Box<[u8]> {
        self.len = 0;
        std::mem::take(&mut self.data)
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data);
        self.pool.release(data);
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_release_recycles() {
        let pool = BufferPool::new(64);
        let block = pool.get();
        assert_eq!(block.capacity(), 64);
        assert_eq!(pool.stats().leased, 1);
        drop(block);

        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.free, 1);

        let _again = pool.get();
        assert_eq!(pool.stats().allocated, 1);
        assert_eq!(pool.stats().free, 0);
    }

    #[test]
    fn block_size_is_clamped() {
        let pool = BufferPool::new(1);
        assert_eq!(pool.block_size(), MIN_BLOCK_SIZE);
    }

    #[test]
    fn reused_block_starts_empty() {
        let pool = BufferPool::new(16);
        let mut block = pool.get();
        block.fill_from(b"abc");
        drop(block);

        let block = pool.get();
        assert!(block.is_empty());
    }

    #[test]
    fn fill_stops_at_capacity() {
        let pool = BufferPool::new(8);
        let mut block = pool.get();
        assert_eq!(block.fill_from(b"0123456789"), 8);
        assert!(block.is_full());
        assert_eq!(block.as_slice(), b"01234567");
    }

    #[test]
    fn discard_front_shifts() {
        let pool = BufferPool::new(16);
        let mut block = pool.get();
        block.fill_from(b"hello world");
        block.discard_front(6);
        assert_eq!(block.as_slice(), b"world");
    }

    #[test]
    fn spare_then_advance() {
        let pool = BufferPool::new(16);
        let mut block = pool.get();
        block.spare_mut()[..3].copy_from_slice(b"xyz");
        block.advance(3);
        assert_eq!(block.as_slice(), b"xyz");
        assert_eq!(block.remaining(), 13);
    }

    #[test]
    fn shrink_drops_free_blocks() {
        let pool = BufferPool::new(16);
        drop(pool.get());
        drop(pool.get());
        assert_eq!(pool.shrink(), 1);
        assert_eq!(pool.stats().allocated, 0);
    }

    #[test]
    fn concurrent_leases_balance() {
        let pool = BufferPool::new(32);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let mut block = pool.get();
                        block.fill_from(b"x");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.free, stats.allocated);
    }
}
