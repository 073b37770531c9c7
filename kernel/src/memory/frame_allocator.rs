//! Physical page heap.
//!
//! Owns the set of free physical page frames. Usable regions come from
//! the bootloader's memory map; frames are handed out sequentially and
//! returned to a free list for reuse. Region bookkeeping uses fixed
//! arrays so the allocator works before the kernel heap does.

use alloc::vec::Vec;
use bootloader_api::info::{MemoryRegionKind, MemoryRegions};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::PAGE_SIZE;

/// Maximum number of usable memory regions we track. UEFI memory maps
/// are heavily fragmented, so this is generous.
const MAX_REGIONS: usize = 128;

/// We never hand out frames below 1 MiB: frame 0 invites null-pointer
/// confusion and the low megabyte holds firmware and legacy device
/// memory.
const LOW_MEMORY_FLOOR: u64 = 0x100000;

#[derive(Debug, Clone, Copy)]
struct UsableRegion {
    start: u64,
    end: u64,
}

struct MemoryInfo {
    regions: [Option<UsableRegion>; MAX_REGIONS],
    region_count: usize,
}

static MEMORY_INFO: Mutex<Option<MemoryInfo>> = Mutex::new(None);
static NEXT_FREE_FRAME: AtomicUsize = AtomicUsize::new(0);

/// Frames returned by [`deallocate_frame`], reused before the
/// sequential cursor advances.
static FREE_FRAMES: Mutex<Vec<u64>> = Mutex::new(Vec::new());

/// Extract usable regions from the bootloader's memory map.
pub fn init(memory_regions: &MemoryRegions) {
    let mut regions = [None; MAX_REGIONS];
    let mut region_count = 0;
    let mut total_memory = 0u64;

    for region in memory_regions.iter() {
        if region.kind != MemoryRegionKind::Usable {
            continue;
        }
        if region.end <= LOW_MEMORY_FLOOR {
            continue;
        }
        if region_count == MAX_REGIONS {
            log::warn!("frame allocator: dropping region {:#x}..{:#x} (MAX_REGIONS)", region.start, region.end);
            continue;
        }

        let start = region.start.max(LOW_MEMORY_FLOOR);
        regions[region_count] = Some(UsableRegion {
            start: super::addr::page_align_up(start),
            end: super::addr::page_align_down(region.end),
        });
        region_count += 1;
        total_memory += region.end - start;
    }

    *MEMORY_INFO.lock() = Some(MemoryInfo {
        regions,
        region_count,
    });

    log::info!(
        "frame allocator: {} MiB usable in {} regions (floor {:#x})",
        total_memory / (1024 * 1024),
        region_count,
        LOW_MEMORY_FLOOR
    );
}

fn nth_usable_frame(n: usize) -> Option<u64> {
    let info = MEMORY_INFO.lock();
    let info = info.as_ref()?;

    let mut count = 0usize;
    for i in 0..info.region_count {
        let Some(region) = info.regions[i] else { continue };
        let region_frames = ((region.end - region.start) / PAGE_SIZE as u64) as usize;
        if count + region_frames > n {
            let frame_addr = region.start + ((n - count) as u64) * PAGE_SIZE as u64;
            debug_assert!(frame_addr >= LOW_MEMORY_FLOOR);
            return Some(frame_addr);
        }
        count += region_frames;
    }
    None
}

/// Produce one free physical page frame, or `None` when exhausted.
///
/// Checks the free list first, then falls back to the sequential
/// cursor. `try_lock` on the free list keeps this callable from
/// interrupt context without deadlocking.
pub fn allocate_frame() -> Option<u64> {
    if let Some(mut free_list) = FREE_FRAMES.try_lock() {
        if let Some(frame) = free_list.pop() {
            return Some(frame);
        }
    }

    loop {
        let current = NEXT_FREE_FRAME.load(Ordering::SeqCst);
        let frame = nth_usable_frame(current)?;
        if NEXT_FREE_FRAME
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Some(frame);
        }
    }
}

/// Return a frame to the free pool.
pub fn deallocate_frame(frame: u64) {
    debug_assert!(frame % PAGE_SIZE as u64 == 0);
    if frame < LOW_MEMORY_FLOOR {
        log::warn!("frame allocator: refusing to free frame {:#x} below floor", frame);
        return;
    }

    if let Some(mut free_list) = FREE_FRAMES.try_lock() {
        free_list.push(frame);
    } else {
        // Called with the list contended (interrupt context); leaking
        // one frame beats deadlocking.
        log::warn!("frame allocator: lost frame {:#x} to lock contention", frame);
    }
}

/// Statistics for diagnostics.
pub struct MemoryStats {
    pub total_bytes: u64,
    pub allocated_frames: usize,
    pub free_list_frames: usize,
}

pub fn memory_stats() -> MemoryStats {
    let total_bytes = MEMORY_INFO
        .try_lock()
        .and_then(|guard| {
            guard.as_ref().map(|info| {
                (0..info.region_count)
                    .filter_map(|i| info.regions[i])
                    .map(|r| r.end - r.start)
                    .sum()
            })
        })
        .unwrap_or(0);

    MemoryStats {
        total_bytes,
        allocated_frames: NEXT_FREE_FRAME.load(Ordering::Relaxed),
        free_list_frames: FREE_FRAMES.try_lock().map(|l| l.len()).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The allocator state is global; serialize the tests touching it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    // MemoryRegions cannot be constructed portably in tests; exercise
    // the region table through the internal state instead.
    fn install_regions(regions: &[(u64, u64)]) {
        let mut table = [None; MAX_REGIONS];
        for (i, &(start, end)) in regions.iter().enumerate() {
            table[i] = Some(UsableRegion { start, end });
        }
        *MEMORY_INFO.lock() = Some(MemoryInfo {
            regions: table,
            region_count: regions.len(),
        });
        NEXT_FREE_FRAME.store(0, Ordering::SeqCst);
        FREE_FRAMES.lock().clear();
    }

    #[test]
    fn test_sequential_allocation_spans_regions() {
        let _guard = TEST_LOCK.lock();
        install_regions(&[(0x100000, 0x102000), (0x200000, 0x201000)]);

        assert_eq!(allocate_frame(), Some(0x100000));
        assert_eq!(allocate_frame(), Some(0x101000));
        assert_eq!(allocate_frame(), Some(0x200000));
        assert_eq!(allocate_frame(), None, "All frames exhausted");
    }

    #[test]
    fn test_free_list_reuse() {
        let _guard = TEST_LOCK.lock();
        install_regions(&[(0x300000, 0x302000)]);

        let a = allocate_frame().unwrap();
        deallocate_frame(a);
        assert_eq!(allocate_frame(), Some(a), "Freed frame should be reused first");
    }
}
