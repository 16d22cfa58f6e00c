//! Regions made of anonymous virtual memory pages.
//!
//! Requires the `use_libc` feature.

use core::ptr::{null_mut, NonNull};

use errno::Errno;

use crate::provider::{RegionDesc, RegionProvider};

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

/// A page-aligned anonymous mapping.
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// An anonymous private mapping is owned by whoever holds it.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// `MmapMemory` maps fresh pages for every region, and unmaps them when the
/// region is destroyed. Sizes are rounded up to whole pages.
///
/// Page alignment covers any region alignment up to the page size; larger
/// alignments are refused.
#[derive(Default)]
pub struct MmapMemory {
    // Just for tracking, not really needed
    pages: usize,
    mappings: usize,
}

impl MmapMemory {
    pub fn new() -> Self {
        MmapMemory::default()
    }

    /// Pages currently mapped.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Regions currently mapped.
    pub fn mappings(&self) -> usize {
        self.mappings
    }
}

unsafe impl RegionProvider for MmapMemory {
    type Region = MmapRegion;
    type Err = Errno;

    fn create_region(&mut self, desc: &RegionDesc) -> Result<MmapRegion, Errno> {
        let pagesize = sysconf::page::pagesize();
        if desc.size == 0 || desc.alignment > pagesize {
            return Err(Errno(libc::EINVAL));
        }
        let len = round_up(desc.size, pagesize);

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                len,
                // The CPU uploads code, so read/write access regardless of
                // what the device gets
                libc::PROT_WRITE | libc::PROT_READ,
                // MAP_ANON: We don't want a file descriptor, we're just going to
                //   use the memory.
                //
                // MAP_PRIVATE: We're not sharing this with any other process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }
        let ptr = match NonNull::new(ptr as *mut u8) {
            Some(ptr) => ptr,
            None => return Err(Errno(libc::ENOMEM)),
        };

        self.pages += len / pagesize;
        self.mappings += 1;

        Ok(MmapRegion { ptr, len })
    }

    fn map(&mut self, region: &MmapRegion) -> Result<NonNull<u8>, Errno> {
        // Anonymous mappings are zero-filled and already CPU visible.
        Ok(region.ptr)
    }

    fn gpu_address(&self, region: &MmapRegion) -> u64 {
        region.ptr.as_ptr() as usize as u64
    }

    fn destroy_region(&mut self, region: MmapRegion) -> Result<(), Errno> {
        let result = unsafe { libc::munmap(region.ptr.as_ptr() as *mut libc::c_void, region.len) };
        if result != 0 {
            return Err(errno::errno());
        }
        self.pages -= region.len / sysconf::page::pagesize();
        self.mappings -= 1;
        Ok(())
    }
}
