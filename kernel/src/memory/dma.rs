//! Physically-backed DMA regions.
//!
//! A [`DmaRegion`] is the triple a device descriptor needs: a virtual
//! pointer the kernel writes through, the physical address the device
//! is given, and the byte size. Backing frames are taken from the page
//! heap and mapped uncached into a reserved kernel range; everything is
//! released on drop.

use crate::error::{KernelError, Result};

use super::page_table::{MemoryType, PageFlags, PageTable, KERNEL_OFFSET};
use super::{frame_allocator, range_page_count, PAGE_SIZE};

/// Top of the kernel-half search range for dynamic mappings.
const KERNEL_VSPACE_END: u64 = 0xFFFF_FFFF_FFFF_F000;

pub struct DmaRegion {
    vaddr: u64,
    paddr: u64,
    size: usize,
    #[cfg(test)]
    test_backing: Option<*mut u8>,
}

impl DmaRegion {
    /// Allocate a physically contiguous region of at least `size`
    /// bytes.
    #[cfg(not(test))]
    pub fn create(size: usize) -> Result<DmaRegion> {
        let page_count = range_page_count(0, size);

        // Contiguity comes from a run of sequential frames; the
        // allocator's sequential cursor makes early allocations
        // contiguous, which is when DMA regions are created.
        let first = frame_allocator::allocate_frame().ok_or(KernelError::OutOfMemory)?;
        let mut last = first;
        for _ in 1..page_count {
            let frame = frame_allocator::allocate_frame().ok_or(KernelError::OutOfMemory)?;
            if frame != last + PAGE_SIZE as u64 {
                // Walked off the contiguous run; give everything back.
                let mut f = first;
                while f <= last {
                    frame_allocator::deallocate_frame(f);
                    f += PAGE_SIZE as u64;
                }
                frame_allocator::deallocate_frame(frame);
                return Err(KernelError::OutOfMemory);
            }
            last = frame;
        }

        let kernel = PageTable::kernel();
        let vaddr = kernel
            .reserve_free_contiguous_pages(page_count, KERNEL_OFFSET, KERNEL_VSPACE_END)
            .ok_or(KernelError::OutOfMemory)?;

        kernel.map_range_at(
            first,
            vaddr,
            page_count * PAGE_SIZE,
            PageFlags::READ_WRITE | PageFlags::PRESENT,
            MemoryType::Uncached,
        );

        unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, page_count * PAGE_SIZE) };

        Ok(DmaRegion {
            vaddr,
            paddr: first,
            size: page_count * PAGE_SIZE,
        })
    }

    /// Host tests: plain zeroed allocation, physical address equal to
    /// the pointer.
    #[cfg(test)]
    pub fn create(size: usize) -> Result<DmaRegion> {
        let size = range_page_count(0, size) * PAGE_SIZE;
        let layout = core::alloc::Layout::from_size_align(size, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(KernelError::OutOfMemory);
        }
        Ok(DmaRegion {
            vaddr: ptr as u64,
            paddr: ptr as u64,
            size,
            test_backing: Some(ptr),
        })
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr<T>(&self) -> *mut T {
        self.vaddr as *mut T
    }

    /// Zero the whole region.
    pub fn zero(&self) {
        unsafe { core::ptr::write_bytes(self.vaddr as *mut u8, 0, self.size) };
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        #[cfg(not(test))]
        {
            let kernel = PageTable::kernel();
            kernel.unmap_range(self.vaddr, self.size);
            let mut paddr = self.paddr;
            while paddr < self.paddr + self.size as u64 {
                frame_allocator::deallocate_frame(paddr);
                paddr += PAGE_SIZE as u64;
            }
        }
        #[cfg(test)]
        if let Some(ptr) = self.test_backing {
            let layout = core::alloc::Layout::from_size_align(self.size, PAGE_SIZE).unwrap();
            unsafe { std::alloc::dealloc(ptr, layout) };
        }
    }
}

// The raw pointer in the test backing is owned.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_shape() {
        let region = DmaRegion::create(100).unwrap();
        assert_eq!(region.size(), PAGE_SIZE, "Size rounds up to whole pages");
        assert_eq!(region.vaddr() % PAGE_SIZE as u64, 0);
        unsafe {
            region.as_ptr::<u8>().write(0xAB);
            assert_eq!(region.as_ptr::<u8>().read(), 0xAB);
        }
        region.zero();
        unsafe { assert_eq!(region.as_ptr::<u8>().read(), 0) };
    }
}
