//! Ordered chains of pooled blocks.

use crate::error::{CodecError, CodecResult};
use crate::pool::{Block, BufferPool};
use crate::segment::Segment;
use std::collections::VecDeque;
use std::fmt;

/// An ordered run of pooled blocks holding one logical byte sequence.
///
/// The first `head` bytes of the front block have already been consumed;
/// they stay in place until the block is popped, so consuming never copies.
pub struct Chain {
    blocks: VecDeque<Block>,
    head: usize,
    pool: BufferPool,
}

impl Chain {
    /// Creates an empty chain that grows from `pool`.
    pub fn new(pool: BufferPool) -> Self {
        Self {
            blocks: VecDeque::new(),
            head: 0,
            pool,
        }
    }

    /// Creates a chain holding a copy of `bytes`.
    pub fn from_slice(pool: BufferPool, bytes: &[u8]) -> Self {
        let mut chain = Self::new(pool);
        chain.extend_from_slice(bytes);
        chain
    }

    /// Returns the pool new blocks are taken from.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Returns the number of unconsumed bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Block::len).sum::<usize>() - self.head
    }

    /// Returns true if no unconsumed bytes remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the number of blocks held.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Returns the consumed prefix of the front block.
    #[must_use]
    pub fn head(&self) -> usize {
        self.head
    }

    pub(crate) fn block_slice(&self, index: usize) -> &[u8] {
        self.blocks.get(index).map_or(&[], Block::as_slice)
    }

    /// Appends a filled block.
    pub fn push(&mut self, block: Block) {
        if self.blocks.is_empty() {
            self.head = 0;
        }
        self.blocks.push_back(block);
    }

    /// Prepends a block, e.g. to return unread bytes to a receive window.
    pub fn push_front(&mut self, block: Block) {
        if let Some(front) = self.blocks.front_mut() {
            front.discard_front(self.head);
        }
        self.head = 0;
        self.blocks.push_front(block);
    }

    /// Removes the front block, trimmed of its consumed prefix.
    pub fn pop_front(&mut self) -> Option<Block> {
        let mut block = self.blocks.pop_front()?;
        block.discard_front(self.head);
        self.head = 0;
        Some(block)
    }

    /// Moves every block of `other` to the end of this chain.
    pub fn append(&mut self, mut other: Chain) {
        while let Some(block) = other.pop_front() {
            self.push(block);
        }
    }

    /// Consumes `n` bytes from the front, releasing blocks that become empty.
    ///
    /// Consuming more than [`len`](Self::len) empties the chain.
    pub fn consume(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.blocks.front() else {
                break;
            };
            let available = front.len() - self.head;
            if n < available {
                self.head += n;
                return;
            }
            n -= available;
            self.head = 0;
            self.blocks.pop_front();
        }
    }

    /// Drops `n` bytes from the back, releasing blocks that become empty.
    ///
    /// Trimming more than [`len`](Self::len) empties the chain.
    pub fn trim_back(&mut self, mut n: usize) {
        while n > 0 {
            let single = self.blocks.len() == 1;
            let Some(back) = self.blocks.back_mut() else {
                break;
            };
            let floor = if single { self.head } else { 0 };
            let available = back.len() - floor;
            if n < available {
                let keep = back.len() - n;
                back.truncate(keep);
                return;
            }
            n -= available;
            self.blocks.pop_back();
            if self.blocks.is_empty() {
                self.head = 0;
            }
        }
    }

    /// Copies `bytes` onto the end, taking new blocks as the last one fills.
    pub fn extend_from_slice(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let block = self.tail_block();
            let n = block.fill_from(bytes);
            bytes = &bytes[n..];
        }
    }

    /// Returns the last block if it has room, otherwise a freshly pushed one.
    pub fn tail_block(&mut self) -> &mut Block {
        let needs_block = self.blocks.back().map_or(true, Block::is_full);
        if needs_block {
            let block = self.pool.get();
            self.blocks.push_back(block);
        }
        let last = self.blocks.len() - 1;
        &mut self.blocks[last]
    }

    /// Overwrites bytes at a logical offset, across block boundaries.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::PatchOutOfRange`] if the range is not filled.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> CodecResult<()> {
        let chain_len = self.len();
        if offset.checked_add(bytes.len()).map_or(true, |end| end > chain_len) {
            return Err(CodecError::PatchOutOfRange {
                offset,
                len: bytes.len(),
                chain_len,
            });
        }

        let mut skip = offset + self.head;
        let mut rest = bytes;
        for block in &mut self.blocks {
            if rest.is_empty() {
                break;
            }
            let filled = block.as_mut_slice();
            if skip >= filled.len() {
                skip -= filled.len();
                continue;
            }
            let n = rest.len().min(filled.len() - skip);
            filled[skip..skip + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            skip = 0;
        }
        Ok(())
    }

    /// Returns a cursor over the unconsumed bytes.
    pub fn segment(&self) -> Segment<'_> {
        Segment::new(self)
    }

    /// Iterates the unconsumed bytes block by block.
    pub fn slices(&self) -> impl Iterator<Item = &[u8]> {
        let head = self.head;
        self.blocks
            .iter()
            .enumerate()
            .map(move |(i, b)| if i == 0 { &b.as_slice()[head..] } else { b.as_slice() })
            .filter(|s| !s.is_empty())
    }

    /// Copies the unconsumed bytes into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for slice in self.slices() {
            out.extend_from_slice(slice);
        }
        out
    }

    /// Releases every block and resets the chain.
    pub fn clear(&mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        self.head = 0;
        if self.blocks.is_empty() {
            return;
        }
        let mut batch = Vec::with_capacity(self.blocks.len());
        for mut block in self.blocks.drain(..) {
            // Blocks pushed from another pool go home on their own drop.
            if block.pool().same_pool(&self.pool) {
                batch.push(block.take_storage());
            }
        }
        self.pool.release_many(batch);
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self::new(BufferPool::default())
    }
}

impl Drop for Chain {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("len", &self.len())
            .field("blocks", &self.blocks.len())
            .field("head", &self.head)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(8)
    }

    #[test]
    fn extend_spans_blocks() {
        let chain = Chain::from_slice(pool(), b"0123456789abcdefXYZ");
        assert_eq!(chain.len(), 19);
        assert_eq!(chain.block_count(), 3);
        assert_eq!(chain.to_vec(), b"0123456789abcdefXYZ");
    }

    #[test]
    fn consume_drops_leading_blocks() {
        let pool = pool();
        let mut chain = Chain::from_slice(pool.clone(), b"0123456789abcdef");
        chain.consume(3);
        assert_eq!(chain.head(), 3);
        assert_eq!(chain.to_vec(), b"3456789abcdef");

        chain.consume(6);
        assert_eq!(chain.block_count(), 1);
        assert_eq!(chain.to_vec(), b"9abcdef");
        assert_eq!(pool.stats().leased, 1);
    }

    #[test]
    fn consume_everything() {
        let mut chain = Chain::from_slice(pool(), b"01234567");
        chain.consume(100);
        assert!(chain.is_empty());
        assert_eq!(chain.block_count(), 0);
    }

    #[test]
    fn trim_back_releases_tail_blocks() {
        let pool = pool();
        let mut chain = Chain::from_slice(pool.clone(), b"0123456789abcdef");
        chain.trim_back(3);
        assert_eq!(chain.to_vec(), b"0123456789abc");
        chain.trim_back(6);
        assert_eq!(chain.block_count(), 1);
        assert_eq!(chain.to_vec(), b"0123456");
        assert_eq!(pool.stats().leased, 1);
    }

    #[test]
    fn trim_back_respects_consumed_head() {
        let mut chain = Chain::from_slice(pool(), b"01234567");
        chain.consume(2);
        chain.trim_back(5);
        assert_eq!(chain.to_vec(), b"2");
        chain.trim_back(1);
        assert!(chain.is_empty());
        assert_eq!(chain.block_count(), 0);
    }

    #[test]
    fn patch_across_boundary() {
        let mut chain = Chain::from_slice(pool(), b"0123456789abcdef");
        chain.patch(6, b"XYZ").unwrap();
        assert_eq!(chain.to_vec(), b"012345XYZ9abcdef");
    }

    #[test]
    fn patch_respects_head() {
        let mut chain = Chain::from_slice(pool(), b"0123456789");
        chain.consume(2);
        chain.patch(0, b"__").unwrap();
        assert_eq!(chain.to_vec(), b"__456789");
    }

    #[test]
    fn patch_out_of_range() {
        let mut chain = Chain::from_slice(pool(), b"0123");
        assert_eq!(
            chain.patch(3, b"ab"),
            Err(CodecError::PatchOutOfRange {
                offset: 3,
                len: 2,
                chain_len: 4
            })
        );
    }

    #[test]
    fn pop_front_trims_consumed_prefix() {
        let mut chain = Chain::from_slice(pool(), b"0123456789");
        chain.consume(5);
        let block = chain.pop_front().unwrap();
        assert_eq!(block.as_slice(), b"567");
        assert_eq!(chain.to_vec(), b"89");
    }

    #[test]
    fn append_moves_blocks() {
        let pool = pool();
        let mut a = Chain::from_slice(pool.clone(), b"abc");
        let mut b = Chain::from_slice(pool.clone(), b"defghijk");
        b.consume(1);
        a.append(b);
        assert_eq!(a.to_vec(), b"abcefghijk");
    }

    #[test]
    fn drop_returns_all_blocks() {
        let pool = pool();
        let chain = Chain::from_slice(pool.clone(), &[7u8; 40]);
        assert_eq!(pool.stats().leased, 5);
        drop(chain);
        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.free, 5);
    }

    #[test]
    fn foreign_block_goes_home() {
        let home = pool();
        let other = BufferPool::new(16);
        let mut chain = Chain::new(home.clone());
        let mut block = other.get();
        block.fill_from(b"x");
        chain.push(block);
        drop(chain);
        assert_eq!(other.stats().free, 1);
        assert_eq!(home.stats().free, 0);
    }
}
