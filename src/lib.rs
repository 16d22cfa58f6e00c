#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! An allocator for compiled GPU shader code.
//!
//! Shader binaries must live in device memory at GPU virtual addresses the
//! command processor can jump to. Creating a device memory object per shader
//! would be slow and wasteful, so this crate carves shader code out of a few
//! large *arenas* instead.
//!
//! Each arena is a region of backing memory obtained from a
//! [`RegionProvider`](provider/trait.RegionProvider.html), tiled exactly by
//! an ordered sequence of blocks. A block is either allocated, and tagged
//! with its owner, or a *hole*. Holes are filed into segregated free lists by
//! power-of-two size class, so finding room is a bitmask scan followed by a
//! short list walk. Freed blocks merge with neighboring holes, and an arena
//! left entirely free is given back to the provider.
//!
//! Arenas grow geometrically: the first is `BASE_ARENA_SIZE` bytes, each
//! following one twice the last, up to a fixed cap.
//!
//! ```
//! use shader_arena::{HostMemory, ShaderAllocator};
//!
//! let allocator: ShaderAllocator<HostMemory, &str> = ShaderAllocator::new(HostMemory::new());
//!
//! let mut block = allocator.allocate(1000, "blit.frag").unwrap();
//! allocator.upload(&mut block, 0, &[0xBF, 0x81, 0x00, 0x00]);
//! assert_eq!(allocator.find_owner(block.va() + 4), Some("blit.frag"));
//!
//! allocator.free(block);
//! ```
//!
//! With the `use_libc` feature, `MmapMemory` backs arenas with anonymous
//! host pages. With the `std` feature, error types implement
//! `std::error::Error`.

extern crate alloc;

pub mod allocators;
mod arena;
mod block;
pub mod config;
mod error;
mod pool;
pub mod provider;
mod size_class;
#[cfg(feature = "use_libc")]
mod unix;

pub use allocators::{RawShaderAlloc, ShaderAllocator, Stats, Validity};
pub use arena::ArenaId;
pub use block::{BlockId, ShaderBlock};
pub use error::AllocError;
pub use pool::Key;
pub use provider::{
    HostMemory, HostMemoryError, HostRegion, MemoryDomain, RegionDesc, RegionProvider,
};
#[cfg(feature = "use_libc")]
pub use unix::{MmapMemory, MmapRegion};
