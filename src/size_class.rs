//! Segregated free lists of holes, one per logarithmic size class.
//!
//! Holes are filed by rounding their size *down* to a class, and searches
//! start at the request rounded *up*. A hole filed in class `c` is at least
//! `1 << (c + MIN_SIZE_CLASS)` bytes long and a request rounded up to class
//! `c` is at most that long, so any hole found at or above the starting class
//! fits. The one exception is the last class, which is clamped: it collects
//! arbitrarily large holes and arbitrarily large requests, so sizes there
//! have to be compared. Sizes are compared everywhere regardless.

use crate::block::{BlockId, BlockPool, BlockState};
use crate::config::{MIN_SIZE_CLASS, NUM_SIZE_CLASSES};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rounding {
    /// Used to file holes.
    Down,
    /// Used to start searches.
    Up,
}

fn floor_log2(value: usize) -> u32 {
    debug_assert!(value > 0);
    usize::BITS - 1 - value.leading_zeros()
}

fn ceil_log2(value: usize) -> u32 {
    if value <= 1 {
        0
    } else {
        floor_log2(value - 1) + 1
    }
}

/// Index of the free list that `size` belongs to.
pub fn size_class(size: usize, rounding: Rounding) -> usize {
    let log2 = match rounding {
        Rounding::Down => floor_log2(size.max(1)),
        Rounding::Up => ceil_log2(size),
    };
    let class = log2.max(MIN_SIZE_CLASS) - MIN_SIZE_CLASS;
    (class as usize).min(NUM_SIZE_CLASSES - 1)
}

/// Heads of the per-class free lists, and a bit per non-empty list.
pub struct FreeLists {
    heads: [Option<BlockId>; NUM_SIZE_CLASSES],
    mask: u32,
}

impl Default for FreeLists {
    fn default() -> Self {
        FreeLists::new()
    }
}

impl FreeLists {
    pub fn new() -> Self {
        FreeLists {
            heads: [None; NUM_SIZE_CLASSES],
            mask: 0,
        }
    }

    /// Bit `c` is set iff free list `c` is non-empty.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn head(&self, class: usize) -> Option<BlockId> {
        self.heads[class]
    }

    /// File `id` as a hole at the head of the list for its current size.
    ///
    /// Whatever state the block was in is overwritten; it must not already
    /// be linked into a free list.
    pub fn add<T>(&mut self, blocks: &mut BlockPool<T>, id: BlockId) {
        let class = size_class(blocks[id].size, Rounding::Down);
        let old_head = self.heads[class];

        blocks[id].state = BlockState::Hole {
            prev_free: None,
            next_free: old_head,
        };
        if let Some(head) = old_head {
            if let BlockState::Hole { prev_free, .. } = &mut blocks[head].state {
                *prev_free = Some(id);
            }
        }

        self.heads[class] = Some(id);
        self.mask |= 1 << class;
    }

    /// Unlink the hole `id` from its free list.
    ///
    /// The block stays a `Hole` with no links, so it must be retagged or
    /// recycled by the caller. Its size must not have changed since it was
    /// filed.
    pub fn remove<T>(&mut self, blocks: &mut BlockPool<T>, id: BlockId) {
        let block = &mut blocks[id];
        let class = size_class(block.size, Rounding::Down);
        let (prev, next) = match &mut block.state {
            BlockState::Hole {
                prev_free,
                next_free,
            } => (prev_free.take(), next_free.take()),
            BlockState::Allocated { .. } => {
                debug_assert!(false, "removing an allocated block from a free list");
                return;
            }
        };

        match prev {
            Some(prev) => {
                if let BlockState::Hole { next_free, .. } = &mut blocks[prev].state {
                    *next_free = next;
                }
            }
            None => {
                debug_assert_eq!(self.heads[class], Some(id));
                self.heads[class] = next;
            }
        }
        if let Some(next) = next {
            if let BlockState::Hole { prev_free, .. } = &mut blocks[next].state {
                *prev_free = prev;
            }
        }

        if self.heads[class].is_none() {
            self.mask &= !(1 << class);
        }
    }

    /// Find a hole of at least `size` bytes.
    ///
    /// Scans non-empty lists from the smallest class that could hold such a
    /// hole upward, and returns the first hole that fits in list order. This
    /// is a good fit, not a best fit.
    pub fn find<T>(&self, blocks: &BlockPool<T>, size: usize) -> Option<BlockId> {
        let start = size_class(size, Rounding::Up);
        let mut mask = self.mask & (u32::MAX << start);

        while mask != 0 {
            let class = mask.trailing_zeros() as usize;
            mask &= mask - 1;

            let mut cursor = self.heads[class];
            while let Some(id) = cursor {
                let hole = &blocks[id];
                if hole.size >= size {
                    return Some(id);
                }
                cursor = hole.next_free();
            }
        }

        None
    }

    /// Iterate over the holes filed in `class`, in list order.
    pub fn iter_class<'a, T>(
        &self,
        blocks: &'a BlockPool<T>,
        class: usize,
    ) -> impl Iterator<Item = BlockId> + 'a
    where
        T: 'a,
    {
        let mut cursor = self.heads[class];
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = blocks.get(id).and_then(|b| b.next_free());
            Some(id)
        })
    }
}
