//! Boot orchestration.
//!
//! The boot binary hands over a `bootloader_api::BootInfo`;
//! [`kernel_init`] brings the subsystems up in dependency order:
//! serial and logging, the kmalloc arena, the physical page heap, the
//! kernel page table (bootstrap phase, then the HHDM handover),
//! interrupts, ACPI, PCI and the xHCI stack, and finally the root
//! filesystem. It ends in the kernel task loop.

use bootloader_api::BootInfo;

use crate::memory::page_table::{self, MemoryType, PageFlags, PageTable};
use crate::memory::{addr, frame_allocator, heap, PAGE_SIZE};

/// How much of the boot stack to carry over the page-table switch.
const BOOT_STACK_SPAN: u64 = 512 * 1024;

/// Walk the loader-built page tables (via its physical-memory window)
/// to translate a virtual address.
///
/// # Safety
/// The loader's tables must still be loaded in CR3 and `phys_offset`
/// must be its complete-physical-memory mapping.
unsafe fn loader_virt_to_phys(phys_offset: u64, vaddr: u64) -> Option<u64> {
    use x86_64::registers::control::Cr3;

    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    const PRESENT: u64 = 1;
    const HUGE: u64 = 1 << 7;

    let uc = addr::uncanonicalize(vaddr);
    let indices = [
        (uc >> 39) & 0x1FF,
        (uc >> 30) & 0x1FF,
        (uc >> 21) & 0x1FF,
        (uc >> 12) & 0x1FF,
    ];

    let (frame, _) = Cr3::read();
    let mut table_paddr = frame.start_address().as_u64();

    for (level, &index) in indices.iter().enumerate() {
        let entry = unsafe {
            ((phys_offset + table_paddr) as *const u64)
                .add(index as usize)
                .read_volatile()
        };
        if entry & PRESENT == 0 {
            return None;
        }
        if entry & HUGE != 0 {
            // 1 GiB or 2 MiB leaf.
            let shift = match level {
                1 => 30,
                2 => 21,
                _ => return None,
            };
            let base = entry & ADDR_MASK & !((1u64 << shift) - 1);
            return Some(base + (uc & ((1u64 << shift) - 1)));
        }
        table_paddr = entry & ADDR_MASK;
    }

    Some(table_paddr + (uc & 0xFFF))
}

/// Copy a loader-provided virtual range into the kernel page table at
/// the same addresses, translating page by page.
unsafe fn carry_over_mapping(phys_offset: u64, start: u64, size: u64, flags: PageFlags) {
    let kernel = PageTable::kernel();
    let first = addr::page_align_down(start);
    let last = addr::page_align_up(start + size);

    let mut vaddr = first;
    while vaddr < last {
        if let Some(paddr) = unsafe { loader_virt_to_phys(phys_offset, vaddr) } {
            if kernel.is_page_free(vaddr) {
                kernel.map_page_at(addr::page_align_down(paddr), vaddr, flags, MemoryType::Normal, false);
            }
        }
        vaddr += PAGE_SIZE as u64;
    }
}

/// Bring the kernel up. Never returns; ends in the task loop.
pub fn kernel_init(boot_info: &'static mut BootInfo) -> ! {
    crate::serial::init();
    crate::logger::init();
    log::info!("ferrox: booting");

    let phys_offset = boot_info
        .physical_memory_offset
        .into_option()
        .expect("boot contract requires a physical memory window");

    // The kmalloc arena backs everything until the page heap is up.
    heap::init();
    let arena_paddr = unsafe { loader_virt_to_phys(phys_offset, heap::arena_vaddr()) }
        .expect("kmalloc arena must be mapped by the loader");
    heap::set_arena_paddr(arena_paddr);

    frame_allocator::init(&boot_info.memory_regions);
    crate::smp::init();

    // Fresh kernel page table from the arena, covering the image.
    let kernel_image_base = boot_info.kernel_image_offset;
    PageTable::initialize_pre_heap(
        boot_info.kernel_addr,
        kernel_image_base,
        boot_info.kernel_len as usize,
    );

    // The loader's stack and the boot info live outside the image;
    // carry their mappings over before switching CR3.
    let rsp: u64;
    unsafe { core::arch::asm!("mov {}, rsp", out(reg) rsp) };
    unsafe {
        carry_over_mapping(
            phys_offset,
            rsp.saturating_sub(BOOT_STACK_SPAN),
            2 * BOOT_STACK_SPAN,
            PageFlags::READ_WRITE | PageFlags::PRESENT,
        );
        carry_over_mapping(
            phys_offset,
            boot_info as *const BootInfo as u64,
            core::mem::size_of::<BootInfo>() as u64,
            PageFlags::READ_WRITE | PageFlags::PRESENT,
        );
        let regions = &boot_info.memory_regions;
        carry_over_mapping(
            phys_offset,
            regions.as_ptr() as u64,
            (regions.len() * core::mem::size_of::<bootloader_api::info::MemoryRegion>()) as u64,
            PageFlags::READ_WRITE | PageFlags::PRESENT,
        );
        if let (Some(ramdisk_addr), len) = (
            boot_info.ramdisk_addr.into_option(),
            boot_info.ramdisk_len,
        ) {
            carry_over_mapping(
                phys_offset,
                ramdisk_addr,
                len,
                PageFlags::PRESENT,
            );
        }
    }

    page_table::initial_load();
    log::info!("ferrox: kernel page table loaded");

    page_table::initialize_post_heap(&boot_info.memory_regions);

    crate::interrupts::init();

    // Platform discovery.
    match crate::acpi::Acpi::initialize(boot_info.rsdp_addr.into_option()) {
        Ok(()) => {
            if let Err(err) = crate::acpi::Acpi::get().enter_acpi_mode(1) {
                log::warn!("ferrox: could not enter ACPI mode: {}", err);
            }
        }
        Err(err) => log::warn!("ferrox: ACPI unavailable: {}", err),
    }

    crate::pci::scan();

    // xHCI controllers: class 0x0C (serial bus), subclass 0x03 (USB),
    // prog-if 0x30 (xHCI).
    for device in crate::pci::find_by_class(0x0C, 0x03, 0x30) {
        if let Err(err) = crate::drivers::usb::xhci::probe(device) {
            log::warn!("ferrox: xHCI probe failed: {}", err);
        }
    }

    mount_root(boot_info);

    log::info!("ferrox: entering the kernel task loop");
    loop {
        crate::task::poll_all();
        crate::smp::poll();
        x86_64::instructions::hlt();
    }
}

/// Mount the boot ramdisk as the ext2 root when one was provided.
fn mount_root(boot_info: &BootInfo) {
    let Some(ramdisk_addr) = boot_info.ramdisk_addr.into_option() else {
        log::info!("ferrox: no boot ramdisk, running diskless");
        return;
    };
    let len = boot_info.ramdisk_len as usize;

    let mut image = unsafe {
        core::slice::from_raw_parts(ramdisk_addr as *const u8, len)
    }
    .to_vec();
    image.truncate(image.len() - image.len() % 512);

    let disk = alloc::sync::Arc::new(crate::block::RamDisk::from_image(512, image));
    let partition = crate::block::Partition::whole(disk);
    match crate::fs::ext2::Ext2Fs::mount(partition) {
        Ok(fs) => {
            crate::fs::ext2::set_root(fs);
            log::info!("ferrox: root filesystem mounted");
        }
        Err(err) => log::warn!("ferrox: could not mount root filesystem: {}", err),
    }
}
