//! Shader arena allocator types.
//!
//! ## Basic Types
//!
//! ### [`RawShaderAlloc`](struct.RawShaderAlloc.html)
//!
//! A `RawShaderAlloc` is a single-threaded arena manager: it finds room for
//! shader code in existing arenas, creates new arenas through its
//! [`RegionProvider`](../provider/trait.RegionProvider.html) when none has
//! room, and merges and reclaims space when blocks are freed.
//!
//! ### [`ShaderAllocator`](struct.ShaderAllocator.html)
//!
//! A `ShaderAllocator` wraps `RawShaderAlloc` with a spin lock to make it
//! thread-safe, so compiler threads can share one allocator per device. The
//! lock is held for the whole of every operation, including arena creation.

use core::fmt;

use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::arena::{Arena, ArenaId, ArenaLayout, ArenaPool};
use crate::block::{Block, BlockId, BlockPool, BlockState, ShaderBlock};
use crate::config::{self, ALLOC_ALIGNMENT, NUM_SIZE_CLASSES};
use crate::error::AllocError;
use crate::pool::Pool;
use crate::provider::{MemoryDomain, RegionDesc, RegionProvider};
use crate::size_class::{size_class, FreeLists, Rounding};

/// Validity contains a count of every broken invariant found by
/// [`RawShaderAlloc::validate`](struct.RawShaderAlloc.html#method.validate).
#[derive(Default, Debug, PartialEq, Eq)]
pub struct Validity {
    /// Blocks that do not start where the previous block ended, plus arenas
    /// whose blocks do not end exactly at the arena size.
    pub misplaced: usize,
    /// Pairs of neighboring holes that should have been merged.
    pub adjacent_holes: usize,
    /// Holes missing from the free list for their size class, free list
    /// entries that are not such holes, and mask bits that disagree with the
    /// lists.
    pub misfiled: usize,
    /// Blocks whose arena or predecessor link disagrees with the sequence
    /// they were reached through.
    pub bad_links: usize,
    /// Live descriptors not reachable from any arena.
    pub leaked_blocks: usize,
    /// Arenas holding nothing but one hole, which should have been released.
    pub empty_arenas: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        *self == Validity::default()
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    pub arenas: usize,
    pub arena_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
    pub holes: usize,
    pub free_bytes: usize,
}

/// A raw allocator of shader code space, owning its arenas.
///
/// Blocks are handed out as [`ShaderBlock`](../block/struct.ShaderBlock.html)
/// handles tagged with an owner of type `T`, which
/// [`find_owner`](#method.find_owner) maps addresses back to.
pub struct RawShaderAlloc<P: RegionProvider, T> {
    provider: P,
    arenas: ArenaPool<P::Region>,
    blocks: BlockPool<T>,
    free_lists: FreeLists,
    // Number of arenas created so far, which sets the size of the next one.
    growth: u32,
}

impl<P: RegionProvider, T> Drop for RawShaderAlloc<P, T> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<P: RegionProvider + Default, T> Default for RawShaderAlloc<P, T> {
    fn default() -> Self {
        RawShaderAlloc::new(P::default())
    }
}

impl<P: RegionProvider, T> RawShaderAlloc<P, T> {
    /// Create an allocator without any arenas.
    pub fn new(provider: P) -> Self {
        RawShaderAlloc {
            provider,
            arenas: Pool::new(),
            blocks: Pool::new(),
            free_lists: FreeLists::new(),
            growth: 0,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Number of live arenas.
    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    /// Sizes of the live arenas, in no particular order.
    pub fn arena_sizes(&self) -> Vec<usize> {
        self.arenas.iter().map(|(_, arena)| arena.size).collect()
    }

    /// Reserve at least `size` bytes for code owned by `owner`.
    ///
    /// The size is rounded up to `ALLOC_ALIGNMENT`; a size of zero reserves
    /// one granule. On error nothing has changed.
    pub fn allocate(&mut self, size: usize, owner: T) -> Result<ShaderBlock, AllocError> {
        let size = match config::align_up(size) {
            Some(size) => size,
            None => {
                log::warn!("Refusing shader allocation of {} bytes", size);
                return Err(AllocError::BackingAllocationFailed);
            }
        };

        // A split needs one new descriptor and a new arena two, so reserving
        // them here leaves nothing to roll back later on.
        self.blocks.reserve(2)?;

        if let Some(hole) = self.free_lists.find(&self.blocks, size) {
            return Ok(self.take_hole(hole, size, owner));
        }

        self.grow(size, owner)
    }

    // Turn all or the front of a hole into an allocated block.
    fn take_hole(&mut self, hole: BlockId, size: usize, owner: T) -> ShaderBlock {
        self.free_lists.remove(&mut self.blocks, hole);

        let (arena, offset, hole_size) = {
            let block = &self.blocks[hole];
            (block.arena, block.offset, block.size)
        };
        debug_assert!(hole_size >= size);

        if hole_size == size {
            log::trace!("Exact fit of {} bytes at {:?}+{:#x}", size, arena, offset);
            self.blocks[hole].state = BlockState::Allocated { owner };
            return self.handle(arena, hole);
        }

        log::trace!(
            "Splitting {} bytes off the {} byte hole at {:?}+{:#x}",
            size,
            hole_size,
            arena,
            offset
        );
        let id = self
            .blocks
            .insert(Block::allocated(arena, offset, size, owner));
        {
            let rest = &mut self.blocks[hole];
            rest.offset += size;
            rest.size -= size;
        }
        self.free_lists.add(&mut self.blocks, hole);
        self.arenas[arena].insert_before(&mut self.blocks, hole, id);

        self.handle(arena, id)
    }

    // Create an arena big enough for `size`, and allocate at its start.
    fn grow(&mut self, size: usize, owner: T) -> Result<ShaderBlock, AllocError> {
        self.arenas.reserve(1)?;

        let arena_size = config::arena_size(self.growth, size);
        let desc = RegionDesc {
            size: arena_size,
            alignment: ALLOC_ALIGNMENT,
            domain: MemoryDomain::Vram,
            read_only: true,
            addr_32bit: true,
        };

        let region = match self.provider.create_region(&desc) {
            Ok(region) => region,
            Err(err) => {
                log::warn!("Could not create a {} byte shader arena: {:?}", arena_size, err);
                return Err(AllocError::BackingAllocationFailed);
            }
        };
        let cpu_base = match self.provider.map(&region) {
            Ok(ptr) => ptr,
            Err(err) => {
                log::warn!("Could not map a {} byte shader arena: {:?}", arena_size, err);
                if let Err(err) = self.provider.destroy_region(region) {
                    log::warn!("Could not release an unmapped shader arena: {:?}", err);
                }
                return Err(AllocError::BackingAllocationFailed);
            }
        };
        let va = self.provider.gpu_address(&region);
        self.growth = self.growth.saturating_add(1);

        // Nothing below can fail.
        let arena = self.arenas.next_key();
        let id = self.blocks.insert(Block::allocated(arena, 0, size, owner));
        let inserted = self.arenas.insert(Arena {
            region,
            size: arena_size,
            cpu_base,
            va,
            first: id,
        });
        debug_assert_eq!(inserted, arena);

        if arena_size > size {
            let rest = self
                .blocks
                .insert(Block::hole(arena, size, arena_size - size));
            self.arenas[arena].insert_after(&mut self.blocks, id, rest);
            self.free_lists.add(&mut self.blocks, rest);
        }

        log::debug!(
            "Created shader arena {:?}: {} bytes at {:#x} (growth step {})",
            arena,
            arena_size,
            va,
            self.growth
        );

        Ok(self.handle(arena, id))
    }

    fn handle(&self, arena: ArenaId, id: BlockId) -> ShaderBlock {
        let region = &self.arenas[arena];
        let block = &self.blocks[id];
        ShaderBlock::new(
            id,
            arena,
            block.offset,
            block.size,
            region.va_at(block.offset),
            region.cpu_at(block.offset),
        )
    }

    /// Whether `block` is a live allocation of this allocator.
    pub fn owns(&self, block: &ShaderBlock) -> bool {
        match self.blocks.get(block.id) {
            Some(b) => !b.is_hole() && b.arena == block.arena && b.offset == block.offset(),
            None => false,
        }
    }

    /// Give a block back, merging it with free neighbors.
    ///
    /// An arena left with nothing but free space is destroyed. A block that
    /// is not a live allocation of this allocator is ignored.
    pub fn free(&mut self, block: ShaderBlock) {
        if !self.owns(&block) {
            log::error!("Ignoring free of a block not owned by this allocator: {:?}", block);
            debug_assert!(false, "freeing a stale or foreign shader block");
            return;
        }

        let arena = block.arena;
        let mut current = block.id;
        log::trace!(
            "Freeing {} bytes at {:?}+{:#x}",
            block.size(),
            arena,
            block.offset()
        );

        if let Some(prev) = self.blocks[current].prev {
            if self.blocks[prev].is_hole() {
                self.free_lists.remove(&mut self.blocks, prev);
                let size = self.blocks[current].size;
                self.blocks[prev].size += size;
                self.arenas[arena].unlink(&mut self.blocks, current);
                self.blocks.remove(current);
                current = prev;
            }
        }

        if let Some(next) = self.blocks[current].next {
            if self.blocks[next].is_hole() {
                self.free_lists.remove(&mut self.blocks, next);
                let size = self.blocks[next].size;
                self.blocks[current].size += size;
                self.arenas[arena].unlink(&mut self.blocks, next);
                self.blocks.remove(next);
            }
        }

        if self.arenas[arena].is_single_block(&self.blocks) {
            self.blocks.remove(current);
            self.destroy_arena(arena);
            return;
        }

        self.free_lists.add(&mut self.blocks, current);
    }

    fn destroy_arena(&mut self, id: ArenaId) {
        let arena = match self.arenas.remove(id) {
            Some(arena) => arena,
            None => return,
        };
        log::debug!(
            "Destroying shader arena {:?}: {} bytes at {:#x}",
            id,
            arena.size,
            arena.va
        );
        if let Err(err) = self.provider.destroy_region(arena.region) {
            log::warn!("Could not release shader arena {:?}: {:?}", id, err);
        }
    }

    /// Copy `code` into `block`, starting `offset` bytes in.
    ///
    /// # Panics
    ///
    /// Panics if `block` is not a live allocation of this allocator, or if
    /// the code does not fit.
    pub fn upload(&self, block: &mut ShaderBlock, offset: usize, code: &[u8]) {
        assert!(
            self.owns(block),
            "uploading into a block not owned by this allocator"
        );
        // The block is live, so its arena is mapped.
        unsafe { block.write(offset, code) };
    }

    /// The owner of the allocated block containing GPU address `va`.
    ///
    /// This walks every arena, so it is meant for diagnostics such as
    /// attributing a GPU fault to a shader, not for hot paths.
    pub fn find_owner(&self, va: u64) -> Option<&T> {
        let (_, arena) = self.arenas.iter().find(|(_, arena)| arena.contains_va(va))?;
        let offset = (va - arena.va) as usize;

        arena
            .blocks(&self.blocks)
            .map(|(_, block)| block)
            .take_while(|block| block.offset <= offset)
            .filter(|block| !block.is_hole())
            .find(|block| offset < block.end())
            .and_then(|block| block.owner())
    }

    /// Get statistics on this allocator.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats::default();
        for (_, arena) in self.arenas.iter() {
            stats.arenas += 1;
            stats.arena_bytes += arena.size;
            for (_, block) in arena.blocks(&self.blocks) {
                if block.is_hole() {
                    stats.holes += 1;
                    stats.free_bytes += block.size;
                } else {
                    stats.allocated_blocks += 1;
                    stats.allocated_bytes += block.size;
                }
            }
        }
        stats
    }

    /// Check every arena, block and free list against the allocator's
    /// invariants.
    pub fn validate(&self) -> Validity {
        let mut validity = Validity::default();
        let mut reachable = 0;
        let mut holes = 0;

        for (arena_id, arena) in self.arenas.iter() {
            let mut expected_offset = 0;
            let mut prev: Option<BlockId> = None;
            let mut prev_is_hole = false;
            let mut count = 0;

            for (id, block) in arena.blocks(&self.blocks) {
                reachable += 1;
                count += 1;
                if reachable > self.blocks.len() {
                    // A cycle in the sequence.
                    validity.bad_links += 1;
                    break;
                }

                if block.offset != expected_offset || block.size == 0 {
                    validity.misplaced += 1;
                }
                if block.arena != arena_id || block.prev != prev {
                    validity.bad_links += 1;
                }
                if block.is_hole() {
                    holes += 1;
                    if prev_is_hole {
                        validity.adjacent_holes += 1;
                    }
                }

                prev_is_hole = block.is_hole();
                expected_offset = block.end();
                prev = Some(id);
            }

            if expected_offset != arena.size {
                validity.misplaced += 1;
            }
            if count == 1 && prev_is_hole {
                validity.empty_arenas += 1;
            }
        }
        validity.leaked_blocks = self.blocks.len().saturating_sub(reachable);

        let mut filed = 0;
        for class in 0..NUM_SIZE_CLASSES {
            let mut count = 0;
            let mut prev = None;
            for id in self.free_lists.iter_class(&self.blocks, class) {
                count += 1;
                filed += 1;
                if filed > self.blocks.len() {
                    validity.misfiled += 1;
                    break;
                }
                match self.blocks.get(id) {
                    Some(block)
                        if block.is_hole()
                            && block.prev_free() == prev
                            && size_class(block.size, Rounding::Down) == class => {}
                    _ => validity.misfiled += 1,
                }
                prev = Some(id);
            }

            let bit_set = self.free_lists.mask() & (1 << class) != 0;
            if bit_set != (count > 0) {
                validity.misfiled += 1;
            }
        }
        if filed != holes {
            validity.misfiled += if filed > holes {
                filed - holes
            } else {
                holes - filed
            };
        }

        validity
    }

    /// Release every arena, including ones still holding allocations, and
    /// drop all descriptors.
    fn release_all(&mut self) {
        let outstanding = self
            .blocks
            .iter()
            .filter(|(_, block)| !block.is_hole())
            .count();
        if outstanding > 0 {
            log::warn!(
                "Tearing down shader arenas with {} blocks still allocated",
                outstanding
            );
        }

        for arena in self.arenas.drain() {
            if let Err(err) = self.provider.destroy_region(arena.region) {
                log::warn!("Could not release a shader arena at teardown: {:?}", err);
            }
        }
        self.blocks = Pool::new();
        self.free_lists = FreeLists::new();
    }

    /// Release every arena and consume the allocator.
    ///
    /// Blocks still allocated at this point lose their backing memory.
    pub fn teardown(mut self) {
        self.release_all();
    }
}

impl<P: RegionProvider, T> fmt::Display for RawShaderAlloc<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShaderArenas(")?;
        let mut start = true;
        for (_, arena) in self.arenas.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let layout = ArenaLayout {
                arena,
                blocks: &self.blocks,
            };
            write!(f, "{}", layout)?;
        }
        write!(f, ")")
    }
}

/// A thread-safe shader allocator, using a spin lock around a
/// `RawShaderAlloc`.
///
/// One of these is created per device and torn down with it.
pub struct ShaderAllocator<P: RegionProvider, T = u64> {
    raw: Mutex<RawShaderAlloc<P, T>>,
}

impl<P: RegionProvider + Default, T> Default for ShaderAllocator<P, T> {
    fn default() -> Self {
        ShaderAllocator::new(P::default())
    }
}

impl<P: RegionProvider, T> ShaderAllocator<P, T> {
    pub fn new(provider: P) -> Self {
        ShaderAllocator {
            raw: Mutex::new(RawShaderAlloc::new(provider)),
        }
    }

    /// Lock and get a reference to the underlying `RawShaderAlloc`.
    ///
    /// Every other caller blocks until the guard is dropped.
    pub fn lock(&self) -> MutexGuard<'_, RawShaderAlloc<P, T>> {
        self.raw.lock()
    }

    pub fn allocate(&self, size: usize, owner: T) -> Result<ShaderBlock, AllocError> {
        self.lock().allocate(size, owner)
    }

    pub fn free(&self, block: ShaderBlock) {
        self.lock().free(block)
    }

    pub fn upload(&self, block: &mut ShaderBlock, offset: usize, code: &[u8]) {
        self.lock().upload(block, offset, code)
    }

    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    pub fn validate(&self) -> Validity {
        self.lock().validate()
    }

    /// Release all arenas. Same as dropping the allocator.
    pub fn teardown(self) {
        self.raw.into_inner().teardown()
    }
}

impl<P: RegionProvider, T: Clone> ShaderAllocator<P, T> {
    /// The owner of the allocated block containing GPU address `va`.
    pub fn find_owner(&self, va: u64) -> Option<T> {
        self.lock().find_owner(va).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    use crate::config::BASE_ARENA_SIZE;
    use crate::provider::HostMemory;

    fn assert_valid<P: RegionProvider, T>(allocator: &RawShaderAlloc<P, T>) {
        let validity = allocator.validate();
        assert!(validity.is_valid(), "{:?} in {}", validity, allocator);
    }

    #[test]
    fn test_basic() {
        let mut allocator: RawShaderAlloc<HostMemory, u32> = RawShaderAlloc::new(HostMemory::new());

        const BLOCKS: usize = 3;
        let sizes: [usize; BLOCKS] = [64, 300, 1024];

        let mut handles = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            handles.push(allocator.allocate(size, i as u32).unwrap());
            assert_valid(&allocator);
        }
        log::info!("allocated: {}", allocator);

        // Blocks are carved from the front of the same arena, back to back
        assert_eq!(allocator.arena_count(), 1);
        assert_eq!(handles[0].offset(), 0);
        assert_eq!(handles[0].size(), 256);
        assert_eq!(handles[1].offset(), 256);
        assert_eq!(handles[1].size(), 512);
        assert_eq!(handles[2].offset(), 768);
        assert_eq!(handles[2].size(), 1024);
        for pair in handles.windows(2) {
            assert_eq!(pair[0].va() + pair[0].size() as u64, pair[1].va());
        }

        let stats = allocator.stats();
        assert_eq!(stats.arena_bytes, BASE_ARENA_SIZE);
        assert_eq!(stats.allocated_blocks, 3);
        assert_eq!(stats.allocated_bytes, 1792);
        assert_eq!(stats.holes, 1);
        assert_eq!(stats.free_bytes, BASE_ARENA_SIZE - 1792);

        ////////////////////////////////////////////////////////////
        // Deallocation

        // Free the middle block, which leaves a hole between two used blocks
        let middle = handles.remove(1);
        let middle_va = middle.va();
        allocator.free(middle);
        assert_valid(&allocator);
        assert_eq!(allocator.stats().holes, 2);
        log::info!("freed middle: {}", allocator);

        // An exact fit reuses the hole without splitting
        let again = allocator.allocate(512, 7).unwrap();
        assert_eq!(again.va(), middle_va);
        assert_eq!(allocator.stats().holes, 1);
        assert_valid(&allocator);

        // A smaller request splits the hole, taking its front
        allocator.free(again);
        let small = allocator.allocate(200, 8).unwrap();
        assert_eq!(small.va(), middle_va);
        assert_eq!(small.size(), 256);
        assert_eq!(allocator.stats().holes, 2);
        assert_valid(&allocator);

        // Freeing the first block merges it into nothing: its successor is used
        let first = handles.remove(0);
        allocator.free(first);
        assert_valid(&allocator);
        assert_eq!(allocator.stats().holes, 3);

        // Freeing `small` merges with both neighbors
        allocator.free(small);
        assert_valid(&allocator);
        assert_eq!(allocator.stats().holes, 2);
        log::info!("merged: {}", allocator);

        // Freeing the last block leaves a single hole, which destroys the arena
        let last = handles.remove(0);
        allocator.free(last);
        assert_valid(&allocator);
        assert_eq!(allocator.arena_count(), 0);
        assert_eq!(allocator.provider().live_regions(), 0);
        assert_eq!(allocator.stats(), Stats::default());
    }

    #[test]
    fn test_owner_lookup() {
        let mut allocator: RawShaderAlloc<HostMemory, &'static str> =
            RawShaderAlloc::new(HostMemory::new());
        let vs = allocator.allocate(1000, "vertex").unwrap();
        let fs = allocator.allocate(3000, "fragment").unwrap();

        assert_eq!(allocator.find_owner(vs.va()), Some(&"vertex"));
        assert_eq!(allocator.find_owner(vs.va() + 999), Some(&"vertex"));
        assert_eq!(allocator.find_owner(fs.va()), Some(&"fragment"));
        assert_eq!(
            allocator.find_owner(fs.va() + fs.size() as u64 - 1),
            Some(&"fragment")
        );
        // Trailing free space belongs to nobody, and neither does memory
        // outside every arena
        assert_eq!(allocator.find_owner(fs.va() + fs.size() as u64), None);
        assert_eq!(allocator.find_owner(vs.va().wrapping_sub(1)), None);

        allocator.free(vs);
        assert_eq!(allocator.find_owner(fs.va() - 1), None);
        allocator.free(fs);
    }

    #[test]
    fn test_upload() {
        let allocator: ShaderAllocator<HostMemory, u32> = ShaderAllocator::new(HostMemory::new());
        let mut block = allocator.allocate(16, 1).unwrap();
        let code = [0xBFu8, 0x81, 0x00, 0x00];
        allocator.upload(&mut block, 4, &code);

        let bytes = unsafe { block.as_slice() };
        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &code);
        allocator.free(block);
    }

    #[test]
    #[should_panic(expected = "Can't write")]
    fn test_upload_overflow_panics() {
        let allocator: ShaderAllocator<HostMemory, u32> = ShaderAllocator::new(HostMemory::new());
        let mut block = allocator.allocate(256, 1).unwrap();
        allocator.upload(&mut block, 200, &[0u8; 100]);
    }

    #[test]
    fn test_teardown_releases_live_arenas() {
        let allocator: ShaderAllocator<HostMemory, u32> = ShaderAllocator::new(HostMemory::new());
        let _a = allocator.allocate(BASE_ARENA_SIZE, 1).unwrap();
        let _b = allocator.allocate(BASE_ARENA_SIZE, 2).unwrap();
        assert_eq!(allocator.lock().provider().live_regions(), 2);

        let mut raw = allocator.raw.into_inner();
        raw.release_all();
        assert_eq!(raw.provider().live_regions(), 0);
        assert_eq!(raw.arena_count(), 0);
        assert!(raw.validate().is_valid());
    }
}
