//! A binary buddy allocator over power-of-two blocks.

use super::tree::{Tree, TreeRep};
use crate::bits;

/// Free blocks of sizes `2^min_bits..2^max_bits`, one tree per size.
///
/// A block returned whole merges with its buddy, the block at its address
/// XOR its size, whenever that buddy is free too; a merge reaching
/// `2^max_bits` hands the block back to the caller instead.
#[derive(Debug)]
pub struct Buddy {
    trees: [Tree; bits::BITS],
    min_bits: usize,
    max_bits: usize,
}

impl Buddy {
    pub const fn new(min_bits: usize, max_bits: usize) -> Self {
        assert!(min_bits < max_bits && max_bits <= bits::BITS);
        Buddy { trees: [Tree::new(); bits::BITS], min_bits, max_bits }
    }

    pub fn max_size(&self) -> usize {
        bits::one_at_bit(self.max_bits)
    }

    pub fn min_size(&self) -> usize {
        bits::one_at_bit(self.min_bits)
    }

    fn tree(&mut self, size_bits: usize) -> &mut Tree {
        &mut self.trees[size_bits - self.min_bits]
    }

    /// Returns a free block, consolidating it with its buddies.
    ///
    /// Returns the merged block when it reaches the maximum size; it does not
    /// belong to this level any more.
    pub fn add_block<R: TreeRep>(&mut self, rep: &R, mut addr: usize, size: usize) -> Option<usize> {
        debug_assert!(bits::is_pow2(size) && bits::is_aligned(addr, size));
        let mut size_bits = bits::ctz(size);
        debug_assert!(size_bits >= self.min_bits);
        loop {
            if size_bits >= self.max_bits {
                return Some(addr);
            }
            let buddy = addr ^ bits::one_at_bit(size_bits);
            let higher = addr.max(buddy);
            if rep.can_consolidate(higher) && self.tree(size_bits).remove(rep, buddy) {
                addr = addr.min(buddy);
                size_bits += 1;
                continue;
            }
            self.tree(size_bits).insert(rep, addr);
            return None;
        }
    }

    /// Takes a block of `size` bytes, splitting a larger one if needed.
    pub fn remove_block<R: TreeRep>(&mut self, rep: &R, size: usize) -> Option<usize> {
        debug_assert!(bits::is_pow2(size));
        let size_bits = bits::ctz(size).max(self.min_bits);
        if size_bits >= self.max_bits {
            return None;
        }
        let size = bits::one_at_bit(size_bits);
        if let Some(addr) = self.tree(size_bits).remove_min(rep) {
            return Some(addr);
        }
        let addr = self.remove_block(rep, size * 2)?;
        self.tree(size_bits).insert(rep, addr + size);
        Some(addr)
    }

    pub fn is_empty(&self) -> bool {
        self.trees.iter().all(Tree::is_empty)
    }
}
