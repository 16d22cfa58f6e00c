//! Block descriptors and the handle given out to callers.
//!
//! A block is a sub-range of one arena. Blocks of an arena form a doubly
//! linked sequence ordered by offset; holes are additionally linked into one
//! size-class free list. Both kinds of link are pool keys, never pointers.

use core::fmt;
use core::ptr::NonNull;

use crate::arena::ArenaId;
use crate::pool::{Key, Pool};

/// Brand for keys of the block descriptor pool.
pub enum BlockTag {}

pub type BlockId = Key<BlockTag>;

pub(crate) type BlockPool<T> = Pool<Block<T>, BlockTag>;

pub(crate) enum BlockState<T> {
    /// Handed out to a caller, tagged with its owner.
    Allocated { owner: T },
    /// Free, and linked into the free list of its size class.
    Hole {
        prev_free: Option<BlockId>,
        next_free: Option<BlockId>,
    },
}

pub(crate) struct Block<T> {
    pub arena: ArenaId,
    pub offset: usize,
    pub size: usize,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
    pub state: BlockState<T>,
}

impl<T> Block<T> {
    pub fn allocated(arena: ArenaId, offset: usize, size: usize, owner: T) -> Self {
        Block {
            arena,
            offset,
            size,
            prev: None,
            next: None,
            state: BlockState::Allocated { owner },
        }
    }

    /// A hole that is not yet filed in any free list.
    pub fn hole(arena: ArenaId, offset: usize, size: usize) -> Self {
        Block {
            arena,
            offset,
            size,
            prev: None,
            next: None,
            state: BlockState::Hole {
                prev_free: None,
                next_free: None,
            },
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn is_hole(&self) -> bool {
        match self.state {
            BlockState::Hole { .. } => true,
            BlockState::Allocated { .. } => false,
        }
    }

    pub fn owner(&self) -> Option<&T> {
        match &self.state {
            BlockState::Allocated { owner } => Some(owner),
            BlockState::Hole { .. } => None,
        }
    }

    pub fn prev_free(&self) -> Option<BlockId> {
        match self.state {
            BlockState::Hole { prev_free, .. } => prev_free,
            BlockState::Allocated { .. } => None,
        }
    }

    pub fn next_free(&self) -> Option<BlockId> {
        match self.state {
            BlockState::Hole { next_free, .. } => next_free,
            BlockState::Allocated { .. } => None,
        }
    }
}

impl<T> fmt::Display for Block<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_hole() { "Hole" } else { "Used" };
        write!(f, "{}({:#x}..{:#x})", kind, self.offset, self.end())
    }
}

/// A reserved range of shader memory.
///
/// The range stays reserved until the handle is passed back to `free`. It is
/// deliberately not `Clone`, so a block cannot be freed twice through safe
/// copies of its handle.
#[derive(Debug)]
pub struct ShaderBlock {
    pub(crate) id: BlockId,
    pub(crate) arena: ArenaId,
    offset: usize,
    size: usize,
    va: u64,
    cpu: NonNull<u8>,
}

// The handle is an exclusive claim on its byte range; nobody else reads or
// writes it until the handle is freed.
unsafe impl Send for ShaderBlock {}
unsafe impl Sync for ShaderBlock {}

impl ShaderBlock {
    pub(crate) fn new(
        id: BlockId,
        arena: ArenaId,
        offset: usize,
        size: usize,
        va: u64,
        cpu: NonNull<u8>,
    ) -> Self {
        ShaderBlock {
            id,
            arena,
            offset,
            size,
            va,
            cpu,
        }
    }

    /// GPU virtual address of the first byte.
    pub fn va(&self) -> u64 {
        self.va
    }

    /// CPU-visible address of the first byte, for uploading code.
    pub fn cpu_ptr(&self) -> NonNull<u8> {
        self.cpu
    }

    /// Number of bytes reserved, which is the request rounded up to the
    /// allocation granularity.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Offset of the block inside its arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether `va` falls inside this block.
    pub fn contains(&self, va: u64) -> bool {
        va >= self.va && va - self.va < self.size as u64
    }

    /// Copy `bytes` into the block, starting `offset` bytes in.
    ///
    /// # Panics
    ///
    /// Panics if the bytes do not fit inside the block.
    ///
    /// # Safety
    ///
    /// The allocator that returned this block must not have been torn down,
    /// as that releases the backing memory regardless of live blocks.
    pub unsafe fn write(&mut self, offset: usize, bytes: &[u8]) {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.size);
        if end.is_none() {
            panic!(
                "Can't write {} bytes at offset {} into a block of size {}",
                bytes.len(),
                offset,
                self.size
            );
        }
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.cpu.as_ptr().add(offset), bytes.len());
    }

    /// View the whole block as bytes.
    ///
    /// # Safety
    ///
    /// Same as [`write`](#method.write): the allocator must still be alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        core::slice::from_raw_parts(self.cpu.as_ptr(), self.size)
    }
}
