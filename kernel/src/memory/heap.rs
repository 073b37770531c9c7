//! Fixed-size kernel allocator (kmalloc).
//!
//! A static arena inside the kernel image backs the global allocator.
//! Because the arena is part of the loaded image it is mapped before
//! any paging work happens, which makes it the source of page-aligned
//! scratch pages during early page-table construction — before the
//! physical page heap is online.
//!
//! Physical↔virtual translation for arena memory assumes the kernel
//! image is physically contiguous (the boot contract guarantees this);
//! the arena's physical base is resolved once at boot by walking the
//! loader-built page tables.

use core::alloc::Layout;
use core::sync::atomic::{AtomicU64, Ordering};

use super::PAGE_SIZE;

const ARENA_SIZE: usize = 4 * 1024 * 1024;

#[repr(align(4096))]
struct Arena([u8; ARENA_SIZE]);

static mut ARENA: Arena = Arena([0; ARENA_SIZE]);

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

/// Physical address of the arena base, resolved at boot. Zero until
/// [`set_arena_paddr`] runs.
static ARENA_PADDR: AtomicU64 = AtomicU64::new(0);

pub fn arena_vaddr() -> u64 {
    core::ptr::addr_of!(ARENA) as u64
}

pub fn arena_size() -> usize {
    ARENA_SIZE
}

/// Hand the arena to the global allocator. Called exactly once, first
/// thing at boot.
#[cfg(not(test))]
pub fn init() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(ARENA) as *mut u8, ARENA_SIZE);
    }
    log::info!("heap: {} KiB arena at {:#x}", ARENA_SIZE / 1024, arena_vaddr());
}

#[cfg(test)]
pub fn init() {}

/// Record the arena's physical base (from a walk of the loader's
/// tables).
pub fn set_arena_paddr(paddr: u64) {
    ARENA_PADDR.store(paddr, Ordering::Release);
}

/// kmalloc-relative virtual→physical translation. Only valid for
/// arena addresses.
pub fn paddr_of(vaddr: u64) -> Option<u64> {
    let base = arena_vaddr();
    if vaddr < base || vaddr >= base + ARENA_SIZE as u64 {
        return None;
    }
    let paddr_base = ARENA_PADDR.load(Ordering::Acquire);
    if paddr_base == 0 {
        return None;
    }
    Some(vaddr - base + paddr_base)
}

/// kmalloc-relative physical→virtual translation. Only valid for
/// arena-backed frames.
pub fn vaddr_of(paddr: u64) -> Option<u64> {
    let paddr_base = ARENA_PADDR.load(Ordering::Acquire);
    if paddr_base == 0 {
        return None;
    }
    if paddr < paddr_base || paddr >= paddr_base + ARENA_SIZE as u64 {
        return None;
    }
    Some(paddr - paddr_base + arena_vaddr())
}

/// Allocate one zeroed, page-aligned page from the arena.
pub fn alloc_page() -> *mut u8 {
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    // SAFETY: layout is non-zero sized.
    unsafe { alloc::alloc::alloc_zeroed(layout) }
}

/// Free a page obtained from [`alloc_page`].
///
/// # Safety
/// `ptr` must come from `alloc_page` and not be freed twice.
pub unsafe fn free_page(ptr: *mut u8) {
    let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(ptr, layout) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_translation_window() {
        set_arena_paddr(0x20_0000);
        let base = arena_vaddr();

        assert_eq!(paddr_of(base), Some(0x20_0000));
        assert_eq!(paddr_of(base + 0x1000), Some(0x20_1000));
        assert_eq!(paddr_of(base.wrapping_sub(1)), None, "Below the arena");

        assert_eq!(vaddr_of(0x20_0000), Some(base));
        assert_eq!(vaddr_of(0x1000), None, "Outside the arena's physical window");
    }

    #[test]
    fn test_alloc_page_aligned() {
        let page = alloc_page();
        assert!(!page.is_null());
        assert_eq!(page as usize % PAGE_SIZE, 0, "Page must be 4 KiB aligned");
        unsafe { free_page(page) };
    }
}
