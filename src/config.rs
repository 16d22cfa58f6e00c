//! Compile-time tuning of the shader arena allocator.
//!
//! All sizes are in bytes. The size classes are logarithmic: a hole of size
//! `s` is filed under `floor(log2(s)) - MIN_SIZE_CLASS`, clamped to the range
//! of classes, so class 0 collects everything below `1 << (MIN_SIZE_CLASS + 1)`
//! and the last class collects everything at or above `1 << MAX_SIZE_CLASS`.

use static_assertions::const_assert;

/// Every allocation is rounded up to a multiple of this, and every block
/// offset is a multiple of it. It is also the alignment requested for
/// backing regions, so block addresses are aligned to it as well.
pub const ALLOC_ALIGNMENT: usize = 256;

/// Size of the first arena. Later arenas double, see `MAX_GROWTH_SHIFT`.
pub const BASE_ARENA_SIZE: usize = 256 * 1024;

/// Arenas created by the growth policy stop doubling at
/// `BASE_ARENA_SIZE << MAX_GROWTH_SHIFT` (8 MiB). A single request larger
/// than that still gets an arena of its own size.
pub const MAX_GROWTH_SHIFT: u32 = 5;

/// log2 of the smallest size class.
pub const MIN_SIZE_CLASS: u32 = 8;

/// log2 of the largest size class.
pub const MAX_SIZE_CLASS: u32 = 15;

pub const NUM_SIZE_CLASSES: usize = (MAX_SIZE_CLASS - MIN_SIZE_CLASS + 1) as usize;

// The non-empty bucket mask is a u32.
const_assert!(NUM_SIZE_CLASSES <= 32);
const_assert!(MIN_SIZE_CLASS <= MAX_SIZE_CLASS);
const_assert!(ALLOC_ALIGNMENT.is_power_of_two());
// Class 0 may only hold holes that satisfy any request rounded into it, which
// holds as long as no hole is smaller than the smallest class.
const_assert!(ALLOC_ALIGNMENT >= 1 << MIN_SIZE_CLASS);
const_assert!(BASE_ARENA_SIZE % ALLOC_ALIGNMENT == 0);

/// Round `value` up to a multiple of `ALLOC_ALIGNMENT`.
///
/// Returns `None` on overflow. Zero rounds up to a single granule so that
/// every block covers at least one byte.
pub fn align_up(value: usize) -> Option<usize> {
    let value = value.max(1);
    value
        .checked_add(ALLOC_ALIGNMENT - 1)
        .map(|v| v & !(ALLOC_ALIGNMENT - 1))
}

/// Size of the next arena, given how many arenas were created before it and
/// the aligned size of the request that triggered it.
pub fn arena_size(growth: u32, request: usize) -> usize {
    let shift = growth.min(MAX_GROWTH_SHIFT);
    (BASE_ARENA_SIZE << shift).max(request)
}
