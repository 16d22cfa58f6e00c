//! Arenas: backing regions tiled by an ordered sequence of blocks.

use core::fmt;
use core::ptr::NonNull;

use crate::block::{Block, BlockId, BlockPool};
use crate::pool::{Key, Pool};

/// Brand for keys of the arena pool.
pub enum ArenaTag {}

pub type ArenaId = Key<ArenaTag>;

pub(crate) type ArenaPool<R> = Pool<Arena<R>, ArenaTag>;

/// One backing region, mapped for CPU access.
///
/// The blocks reachable from `first` through `next` links cover
/// `[0, size)` exactly, in offset order.
pub(crate) struct Arena<R> {
    pub region: R,
    pub size: usize,
    pub cpu_base: NonNull<u8>,
    pub va: u64,
    pub first: BlockId,
}

// The mapping is only dereferenced through block handles, which have their
// own exclusivity; the arena itself just carries the address around.
unsafe impl<R: Send> Send for Arena<R> {}

impl<R> Arena<R> {
    pub fn contains_va(&self, va: u64) -> bool {
        va >= self.va && va - self.va < self.size as u64
    }

    /// CPU address of the byte at `offset`.
    pub fn cpu_at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.size);
        // An offset inside a mapped region can't wrap to null.
        unsafe { NonNull::new_unchecked(self.cpu_base.as_ptr().add(offset)) }
    }

    /// GPU address of the byte at `offset`.
    pub fn va_at(&self, offset: usize) -> u64 {
        self.va + offset as u64
    }

    /// Iterate over the arena's blocks in offset order.
    pub fn blocks<'a, T>(
        &self,
        blocks: &'a BlockPool<T>,
    ) -> impl Iterator<Item = (BlockId, &'a Block<T>)> + 'a
    where
        T: 'a,
    {
        let mut cursor = Some(self.first);
        core::iter::from_fn(move || {
            let id = cursor?;
            let block = blocks.get(id)?;
            cursor = block.next;
            Some((id, block))
        })
    }

    pub fn is_single_block<T>(&self, blocks: &BlockPool<T>) -> bool {
        blocks[self.first].next.is_none()
    }

    /// Link the unlinked block `new` immediately before `at`.
    pub fn insert_before<T>(&mut self, blocks: &mut BlockPool<T>, at: BlockId, new: BlockId) {
        let prev = blocks[at].prev;
        {
            let block = &mut blocks[new];
            block.prev = prev;
            block.next = Some(at);
        }
        blocks[at].prev = Some(new);
        match prev {
            Some(prev) => blocks[prev].next = Some(new),
            None => self.first = new,
        }
    }

    /// Link the unlinked block `new` immediately after `at`.
    pub fn insert_after<T>(&mut self, blocks: &mut BlockPool<T>, at: BlockId, new: BlockId) {
        let next = blocks[at].next;
        {
            let block = &mut blocks[new];
            block.prev = Some(at);
            block.next = next;
        }
        blocks[at].next = Some(new);
        if let Some(next) = next {
            blocks[next].prev = Some(new);
        }
    }

    /// Take `id` out of the sequence, joining its neighbors.
    ///
    /// This does not fix up offsets or sizes; the caller is merging the
    /// block's range into a neighbor.
    pub fn unlink<T>(&mut self, blocks: &mut BlockPool<T>, id: BlockId) {
        let (prev, next) = {
            let block = &mut blocks[id];
            (block.prev.take(), block.next.take())
        };
        match prev {
            Some(prev) => blocks[prev].next = next,
            None => {
                debug_assert_eq!(self.first, id);
                if let Some(next) = next {
                    self.first = next;
                }
            }
        }
        if let Some(next) = next {
            blocks[next].prev = prev;
        }
    }
}

/// Formats the arena's block layout, given access to the block pool.
pub(crate) struct ArenaLayout<'a, R, T> {
    pub arena: &'a Arena<R>,
    pub blocks: &'a BlockPool<T>,
}

impl<'a, R, T> fmt::Display for ArenaLayout<'a, R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arena({:#x}, {} bytes: ",
            self.arena.va, self.arena.size
        )?;
        let mut start = true;
        for (_, block) in self.arena.blocks(self.blocks) {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{}", block)?;
        }
        write!(f, ")")
    }
}
