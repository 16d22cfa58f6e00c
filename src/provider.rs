//! Backing memory for arenas.
//!
//! The allocator does not know how device memory is created. It asks a
//! [`RegionProvider`](trait.RegionProvider.html) for regions, maps them once,
//! and hands them back when an arena is no longer needed.
//!
//! ### [`HostMemory`](struct.HostMemory.html)
//!
//! `HostMemory` backs regions with the global heap and reports their CPU
//! address as their GPU address. It can be given a byte budget, past which
//! it refuses to create regions, which makes it useful for testing the
//! allocator's out-of-memory paths.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::fmt;
use core::ptr::NonNull;

/// Where a region should live.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryDomain {
    /// Device-local memory.
    Vram,
    /// Host memory visible to the device.
    Gtt,
}

/// Everything a provider needs to know to create a region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RegionDesc {
    pub size: usize,
    pub alignment: usize,
    pub domain: MemoryDomain,
    /// The device only ever reads from the region.
    pub read_only: bool,
    /// The region must be addressable with 32-bit GPU addresses.
    pub addr_32bit: bool,
}

/// Creates, maps and destroys backing regions.
///
/// # Safety
///
/// For the allocator to stay sound, implementations must guarantee that:
///
/// - A pointer returned by `map` is valid for reads and writes of the whole
///   `desc.size` bytes the region was created with, points at initialized
///   memory, is aligned to `desc.alignment`, and is used by nothing else
///   until the region is passed to `destroy_region`.
/// - The ranges `[gpu_address, gpu_address + size)` of live regions do not
///   overlap.
pub unsafe trait RegionProvider {
    type Region;
    type Err: fmt::Debug;

    /// Create a region of at least `desc.size` bytes.
    fn create_region(&mut self, desc: &RegionDesc) -> Result<Self::Region, Self::Err>;

    /// Map `region` for CPU access. Called once per region.
    fn map(&mut self, region: &Self::Region) -> Result<NonNull<u8>, Self::Err>;

    /// GPU virtual address of the start of `region`.
    fn gpu_address(&self, region: &Self::Region) -> u64;

    /// Unmap and release `region`.
    fn destroy_region(&mut self, region: Self::Region) -> Result<(), Self::Err>;
}

/// A region allocated from the host heap.
#[derive(Debug)]
pub struct HostRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The region is just an owned heap allocation.
unsafe impl Send for HostRegion {}

impl HostRegion {
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HostMemoryError {
    /// Creating the region would exceed the configured budget.
    BudgetExceeded { requested: usize, available: usize },
    /// The descriptor does not form a valid layout.
    InvalidLayout,
    /// The global allocator returned null.
    OutOfMemory,
}

impl fmt::Display for HostMemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMemoryError::BudgetExceeded {
                requested,
                available,
            } => write!(
                f,
                "region of {} bytes exceeds the remaining budget of {} bytes",
                requested, available
            ),
            HostMemoryError::InvalidLayout => write!(f, "invalid region size or alignment"),
            HostMemoryError::OutOfMemory => write!(f, "host allocation failed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HostMemoryError {}

/// Regions backed by the global heap, with an optional byte budget.
#[derive(Debug, Default)]
pub struct HostMemory {
    budget: Option<usize>,
    // Just for tracking
    live_regions: usize,
    live_bytes: usize,
    creations: usize,
}

impl HostMemory {
    /// A provider without a budget.
    pub fn new() -> Self {
        HostMemory::default()
    }

    /// A provider that refuses to hold more than `budget` bytes at once.
    pub fn with_budget(budget: usize) -> Self {
        HostMemory {
            budget: Some(budget),
            ..HostMemory::default()
        }
    }

    /// Change the budget. Live regions are not affected.
    pub fn set_budget(&mut self, budget: Option<usize>) {
        self.budget = budget;
    }

    /// Number of regions created and not yet destroyed.
    pub fn live_regions(&self) -> usize {
        self.live_regions
    }

    /// Total size of the live regions.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Number of regions ever created.
    pub fn creations(&self) -> usize {
        self.creations
    }
}

unsafe impl RegionProvider for HostMemory {
    type Region = HostRegion;
    type Err = HostMemoryError;

    fn create_region(&mut self, desc: &RegionDesc) -> Result<HostRegion, HostMemoryError> {
        if let Some(budget) = self.budget {
            let available = budget.saturating_sub(self.live_bytes);
            if desc.size > available {
                return Err(HostMemoryError::BudgetExceeded {
                    requested: desc.size,
                    available,
                });
            }
        }

        let layout = Layout::from_size_align(desc.size, desc.alignment)
            .map_err(|_| HostMemoryError::InvalidLayout)?;
        if layout.size() == 0 {
            return Err(HostMemoryError::InvalidLayout);
        }

        // Zeroed, so the mapping is initialized memory.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(HostMemoryError::OutOfMemory)?;

        self.live_regions += 1;
        self.live_bytes += layout.size();
        self.creations += 1;

        Ok(HostRegion { ptr, layout })
    }

    fn map(&mut self, region: &HostRegion) -> Result<NonNull<u8>, HostMemoryError> {
        Ok(region.ptr)
    }

    fn gpu_address(&self, region: &HostRegion) -> u64 {
        region.ptr.as_ptr() as usize as u64
    }

    fn destroy_region(&mut self, region: HostRegion) -> Result<(), HostMemoryError> {
        unsafe { dealloc(region.ptr.as_ptr(), region.layout) };
        self.live_regions -= 1;
        self.live_bytes -= region.layout.size();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    fn desc(size: usize) -> RegionDesc {
        RegionDesc {
            size,
            alignment: 256,
            domain: MemoryDomain::Vram,
            read_only: true,
            addr_32bit: true,
        }
    }

    #[test]
    fn test_host_memory_round_trip() {
        let mut memory = HostMemory::new();
        let region = memory.create_region(&desc(4096)).unwrap();
        assert_eq!(region.size(), 4096);
        assert_eq!(memory.live_regions(), 1);
        assert_eq!(memory.live_bytes(), 4096);

        let ptr = memory.map(&region).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 256, 0);
        assert_eq!(memory.gpu_address(&region), ptr.as_ptr() as usize as u64);
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));

        memory.destroy_region(region).unwrap();
        assert_eq!(memory.live_regions(), 0);
        assert_eq!(memory.live_bytes(), 0);
        assert_eq!(memory.creations(), 1);
    }

    #[test]
    fn test_host_memory_budget() {
        let mut memory = HostMemory::with_budget(8192);
        let first = memory.create_region(&desc(4096)).unwrap();
        let err = memory.create_region(&desc(8192)).unwrap_err();
        assert_eq!(
            err,
            HostMemoryError::BudgetExceeded {
                requested: 8192,
                available: 4096
            }
        );
        log::info!("refused: {}", err);

        memory.destroy_region(first).unwrap();
        let second = memory.create_region(&desc(8192)).unwrap();
        memory.destroy_region(second).unwrap();
    }

    #[test]
    fn test_host_memory_rejects_bad_layouts() {
        let mut memory = HostMemory::new();
        let mut bad = desc(4096);
        bad.alignment = 3;
        assert_eq!(
            memory.create_region(&bad).unwrap_err(),
            HostMemoryError::InvalidLayout
        );
        assert_eq!(
            memory.create_region(&desc(0)).unwrap_err(),
            HostMemoryError::InvalidLayout
        );
        assert_eq!(memory.live_regions(), 0);
    }
}
