//! Fixed-block pool allocator over one large GPU buffer.
//!
//! Every block has the same size, so there is no external fragmentation and no
//! compaction. A request smaller than a block still takes a whole block.
//!
//! Free blocks are tracked in a bit vector (1 = free). Allocation scans for the
//! lowest free indices, which keeps live data packed toward the front of the
//! buffer.

use bitvec::prelude::{bitvec, BitVec};

use crate::error::{Result, StreamingError};

/// Hands out and reclaims block indices of a fixed-size pool.
#[derive(Debug)]
pub struct BlockAllocator {
    free: BitVec,
    free_count: usize,
    block_size: u64,
}

impl BlockAllocator {
    /// Creates an allocator with every block free.
    ///
    /// # Arguments
    /// * `block_count` - Number of blocks in the pool
    /// * `block_size` - Size of each block in bytes
    pub fn new(block_count: usize, block_size: u64) -> Self {
        assert!(block_size > 0, "block size must be non-zero");
        Self {
            free: bitvec![1; block_count],
            free_count: block_count,
            block_size,
        }
    }

    /// Allocates the fewest blocks whose combined size covers `length_bytes`.
    ///
    /// Blocks are returned in ascending index order. Nothing is allocated on
    /// failure.
    ///
    /// # Returns
    /// - `Ok(blocks)` on success; empty for a zero-length request
    /// - `Err(AllocationExhausted)` if too few blocks are free
    pub fn allocate(&mut self, length_bytes: u64) -> Result<Vec<usize>> {
        let requested_blocks = self.blocks_for(length_bytes);
        if requested_blocks > self.free_count {
            return Err(StreamingError::AllocationExhausted {
                requested_blocks,
                free_blocks: self.free_count,
            });
        }

        let blocks: Vec<usize> = self.free.iter_ones().take(requested_blocks).collect();
        for &block in &blocks {
            self.free.set(block, false);
        }
        self.free_count -= blocks.len();
        Ok(blocks)
    }

    /// Returns blocks to the free set.
    ///
    /// Every index must currently be allocated; freeing a free block is a
    /// caller bug and is only checked in debug builds.
    pub fn free(&mut self, blocks: &[usize]) {
        for &block in blocks {
            debug_assert!(!self.free[block], "double free of block {block}");
            self.free.set(block, true);
        }
        self.free_count += blocks.len();
    }

    /// Number of blocks needed to hold `length_bytes`.
    pub fn blocks_for(&self, length_bytes: u64) -> usize {
        length_bytes.div_ceil(self.block_size) as usize
    }

    /// Size of one block in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Byte offset of `block` inside the backing buffer.
    pub fn block_offset(&self, block: usize) -> u64 {
        block as u64 * self.block_size
    }

    /// Total number of blocks.
    pub fn block_count(&self) -> usize {
        self.free.len()
    }

    /// Number of blocks currently free.
    pub fn free_block_count(&self) -> usize {
        self.free_count
    }

    /// Whether `block` is in the free set.
    pub fn is_free(&self, block: usize) -> bool {
        self.free[block]
    }

    /// Size in bytes of the buffer this allocator carves up.
    pub fn capacity_bytes(&self) -> u64 {
        self.block_count() as u64 * self.block_size
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn free_set(allocator: &BlockAllocator) -> BTreeSet<usize> {
        (0..allocator.block_count())
            .filter(|&b| allocator.is_free(b))
            .collect()
    }

    #[test]
    fn test_allocate_rounds_up_to_whole_blocks() {
        let mut allocator = BlockAllocator::new(8, 16);
        assert_eq!(allocator.allocate(1).unwrap(), vec![0]);
        assert_eq!(allocator.allocate(16).unwrap(), vec![1]);
        assert_eq!(allocator.allocate(17).unwrap(), vec![2, 3]);
        assert_eq!(allocator.free_block_count(), 4);
        assert!(allocator.allocate(0).unwrap().is_empty());
    }

    #[test]
    fn test_block_offsets() {
        let allocator = BlockAllocator::new(4, 12288);
        assert_eq!(allocator.block_offset(0), 0);
        assert_eq!(allocator.block_offset(3), 3 * 12288);
        assert_eq!(allocator.capacity_bytes(), 4 * 12288);
    }

    #[test]
    fn test_exhaustion_allocates_nothing() {
        let mut allocator = BlockAllocator::new(4, 16);
        allocator.allocate(32).unwrap();
        let before = free_set(&allocator);

        let err = allocator.allocate(48).unwrap_err();
        assert!(matches!(
            err,
            StreamingError::AllocationExhausted {
                requested_blocks: 3,
                free_blocks: 2
            }
        ));
        assert_eq!(free_set(&allocator), before);
    }

    #[test]
    fn test_freed_blocks_are_reused_lowest_first() {
        let mut allocator = BlockAllocator::new(6, 4);
        let a = allocator.allocate(8).unwrap();
        let b = allocator.allocate(8).unwrap();
        allocator.free(&a);
        assert_eq!(allocator.allocate(4).unwrap(), vec![0]);
        assert_eq!(b, vec![2, 3]);
    }

    #[test]
    fn test_allocate_then_free_restores_free_set() {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut allocator = BlockAllocator::new(64, 32);
        allocator.allocate(100).unwrap();
        allocator.allocate(500).unwrap();

        for _ in 0..200 {
            let before = free_set(&allocator);
            let length = rng.u64(0..=32 * 40);
            if let Ok(blocks) = allocator.allocate(length) {
                allocator.free(&blocks);
            }
            assert_eq!(free_set(&allocator), before);
        }
    }

    #[test]
    fn test_random_sequences_keep_partition() {
        let mut rng = fastrand::Rng::with_seed(0x5eed);
        let block_count = 128;
        let mut allocator = BlockAllocator::new(block_count, 64);
        let mut live: Vec<Vec<usize>> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || rng.bool() {
                let length = rng.u64(1..=64 * 12);
                match allocator.allocate(length) {
                    Ok(blocks) => {
                        assert_eq!(blocks.len(), allocator.blocks_for(length));
                        live.push(blocks);
                    }
                    Err(StreamingError::AllocationExhausted {
                        requested_blocks,
                        free_blocks,
                    }) => assert!(requested_blocks > free_blocks),
                    Err(other) => panic!("unexpected error {other}"),
                }
            } else {
                let victim = live.swap_remove(rng.usize(..live.len()));
                allocator.free(&victim);
            }

            let allocated: Vec<usize> = live.iter().flatten().copied().collect();
            let allocated_set: BTreeSet<usize> = allocated.iter().copied().collect();
            let free = free_set(&allocator);

            assert_eq!(allocated.len(), allocated_set.len(), "block handed out twice");
            assert!(allocated_set.is_disjoint(&free));
            assert_eq!(allocated_set.len() + free.len(), block_count);
            assert_eq!(free.len(), allocator.free_block_count());
        }
    }
}
