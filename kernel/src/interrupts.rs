//! Interrupt plumbing: IDT, legacy PIC remap, the 1 kHz timer tick,
//! and dynamic registration of line and MSI handlers.

use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

use crate::error::{KernelError, Result};

/// Legacy PIC vectors start here after remap.
pub const PIC_OFFSET: u8 = 0x20;

/// MSI vectors are handed out from this window.
const MSI_VECTOR_BASE: u8 = 0x50;
const MSI_VECTOR_COUNT: usize = 16;

#[cfg(not(test))]
static PICS: Mutex<pic8259::ChainedPics> =
    Mutex::new(unsafe { pic8259::ChainedPics::new(PIC_OFFSET, PIC_OFFSET + 8) });

#[cfg(test)]
static PICS: Mutex<()> = Mutex::new(());

/// Registered handlers for the 16 legacy IRQ lines. Stored as raw fn
/// pointers so the dispatch path stays lock-free.
static IRQ_HANDLERS: [AtomicUsize; 16] = [const { AtomicUsize::new(0) }; 16];

/// Handlers for allocated MSI vectors.
static MSI_HANDLERS: [AtomicUsize; MSI_VECTOR_COUNT] = [const { AtomicUsize::new(0) }; MSI_VECTOR_COUNT];
static NEXT_MSI: AtomicUsize = AtomicUsize::new(0);

static IDT: OnceCell<InterruptDescriptorTable> = OnceCell::uninit();

fn dispatch(slot: &AtomicUsize) {
    let raw = slot.load(Ordering::Acquire);
    if raw != 0 {
        // SAFETY: only fn() pointers are ever stored.
        let handler: fn() = unsafe { core::mem::transmute(raw) };
        handler();
    }
}

fn end_of_interrupt(vector: u8) {
    #[cfg(not(test))]
    if (PIC_OFFSET..PIC_OFFSET + 16).contains(&vector) {
        unsafe { PICS.lock().notify_end_of_interrupt(vector) };
    }
    #[cfg(test)]
    let _ = vector;
}

macro_rules! irq_stub {
    ($name:ident, $irq:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            if $irq == 0 {
                crate::time::tick();
            }
            dispatch(&IRQ_HANDLERS[$irq]);
            end_of_interrupt(PIC_OFFSET + $irq as u8);
        }
    };
}

irq_stub!(irq0_handler, 0);
irq_stub!(irq1_handler, 1);
irq_stub!(irq2_handler, 2);
irq_stub!(irq3_handler, 3);
irq_stub!(irq4_handler, 4);
irq_stub!(irq5_handler, 5);
irq_stub!(irq6_handler, 6);
irq_stub!(irq7_handler, 7);
irq_stub!(irq8_handler, 8);
irq_stub!(irq9_handler, 9);
irq_stub!(irq10_handler, 10);
irq_stub!(irq11_handler, 11);
irq_stub!(irq12_handler, 12);
irq_stub!(irq13_handler, 13);
irq_stub!(irq14_handler, 14);
irq_stub!(irq15_handler, 15);

/// Local APIC EOI register, mapped at init when MSIs are in use.
static LAPIC_EOI_VADDR: AtomicUsize = AtomicUsize::new(0);

fn lapic_eoi() {
    let vaddr = LAPIC_EOI_VADDR.load(Ordering::Acquire);
    if vaddr != 0 {
        unsafe { (vaddr as *mut u32).write_volatile(0) };
    }
}

macro_rules! msi_stub {
    ($name:ident, $slot:expr) => {
        extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
            dispatch(&MSI_HANDLERS[$slot]);
            lapic_eoi();
        }
    };
}

msi_stub!(msi0_handler, 0);
msi_stub!(msi1_handler, 1);
msi_stub!(msi2_handler, 2);
msi_stub!(msi3_handler, 3);
msi_stub!(msi4_handler, 4);
msi_stub!(msi5_handler, 5);
msi_stub!(msi6_handler, 6);
msi_stub!(msi7_handler, 7);
msi_stub!(msi8_handler, 8);
msi_stub!(msi9_handler, 9);
msi_stub!(msi10_handler, 10);
msi_stub!(msi11_handler, 11);
msi_stub!(msi12_handler, 12);
msi_stub!(msi13_handler, 13);
msi_stub!(msi14_handler, 14);
msi_stub!(msi15_handler, 15);

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint exception: {:?}", frame);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
    panic!("double fault (code {}): {:?}", code, frame);
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: x86_64::structures::idt::PageFaultErrorCode,
) {
    let address = x86_64::registers::control::Cr2::read_raw();
    panic!(
        "page fault at {:#x} (code {:?}): {:?}",
        address, code, frame
    );
}

fn build_idt() -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();
    idt.breakpoint.set_handler_fn(breakpoint_handler);
    idt.double_fault.set_handler_fn(double_fault_handler);
    idt.page_fault.set_handler_fn(page_fault_handler);

    let irq_handlers = [
        irq0_handler,
        irq1_handler,
        irq2_handler,
        irq3_handler,
        irq4_handler,
        irq5_handler,
        irq6_handler,
        irq7_handler,
        irq8_handler,
        irq9_handler,
        irq10_handler,
        irq11_handler,
        irq12_handler,
        irq13_handler,
        irq14_handler,
        irq15_handler,
    ];
    for (i, handler) in irq_handlers.into_iter().enumerate() {
        idt[PIC_OFFSET + i as u8].set_handler_fn(handler);
    }

    let msi_handlers = [
        msi0_handler,
        msi1_handler,
        msi2_handler,
        msi3_handler,
        msi4_handler,
        msi5_handler,
        msi6_handler,
        msi7_handler,
        msi8_handler,
        msi9_handler,
        msi10_handler,
        msi11_handler,
        msi12_handler,
        msi13_handler,
        msi14_handler,
        msi15_handler,
    ];
    for (i, handler) in msi_handlers.into_iter().enumerate() {
        idt[MSI_VECTOR_BASE + i as u8].set_handler_fn(handler);
    }

    idt
}

/// Load the IDT, remap the PICs, and program the PIT for a 1 kHz tick.
#[cfg(not(test))]
pub fn init() {
    IDT.get_or_init(build_idt).load();

    unsafe {
        PICS.lock().initialize();
        // Unmask the cascade and timer; other lines unmask on
        // registration.
        PICS.lock().write_masks(0b1111_1010, 0b1111_1111);
    }

    // PIT channel 0, rate generator, 1000 Hz.
    const PIT_FREQUENCY: u32 = 1_193_182;
    let divisor = (PIT_FREQUENCY / 1000) as u16;
    unsafe {
        use x86_64::instructions::port::Port;
        Port::<u8>::new(0x43).write(0x36u8);
        Port::<u8>::new(0x40).write((divisor & 0xFF) as u8);
        Port::<u8>::new(0x40).write((divisor >> 8) as u8);
    }

    x86_64::instructions::interrupts::enable();
    log::info!("interrupts: IDT loaded, PIT at 1 kHz");
}

#[cfg(test)]
pub fn init() {
    let _ = build_idt;
}

/// Register a handler for a legacy IRQ line and unmask it.
pub fn register_irq_handler(irq: u8, handler: fn()) -> Result<()> {
    if irq >= 16 {
        return Err(KernelError::InvalidInput);
    }
    let slot = &IRQ_HANDLERS[irq as usize];
    if slot
        .compare_exchange(0, handler as usize, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(KernelError::AlreadyExists);
    }

    #[cfg(not(test))]
    unsafe {
        let mut pics = PICS.lock();
        let [mask1, mask2] = pics.read_masks();
        if irq < 8 {
            pics.write_masks(mask1 & !(1 << irq), mask2);
        } else {
            pics.write_masks(mask1, mask2 & !(1 << (irq - 8)));
        }
    }

    log::info!("interrupts: irq {} registered", irq);
    Ok(())
}

/// Allocate an MSI vector bound to `handler`. Returns the vector
/// number to program into the device. The local APIC EOI register is
/// mapped on first use.
pub fn allocate_msi_vector(handler: fn()) -> Result<u8> {
    let slot = NEXT_MSI.fetch_add(1, Ordering::AcqRel);
    if slot >= MSI_VECTOR_COUNT {
        return Err(KernelError::NoSpace);
    }
    MSI_HANDLERS[slot].store(handler as usize, Ordering::Release);

    #[cfg(not(test))]
    if LAPIC_EOI_VADDR.load(Ordering::Acquire) == 0 {
        use crate::memory::page_table::{MemoryType, PageFlags, PageTable, KERNEL_OFFSET};
        const LAPIC_BASE: u64 = 0xFEE0_0000;
        let kernel = PageTable::kernel();
        if let Some(vaddr) =
            kernel.reserve_free_contiguous_pages(1, KERNEL_OFFSET, 0xFFFF_FFFF_FFFF_F000)
        {
            kernel.map_range_at(
                LAPIC_BASE,
                vaddr,
                crate::memory::PAGE_SIZE,
                PageFlags::READ_WRITE | PageFlags::PRESENT,
                MemoryType::Uncached,
            );
            LAPIC_EOI_VADDR.store(vaddr as usize + 0xB0, Ordering::Release);
        }
    }

    Ok(MSI_VECTOR_BASE + slot as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_registration_rejects_duplicates() {
        fn handler() {}
        register_irq_handler(11, handler).unwrap();
        assert!(matches!(
            register_irq_handler(11, handler),
            Err(KernelError::AlreadyExists)
        ));
        assert!(matches!(
            register_irq_handler(16, handler),
            Err(KernelError::InvalidInput)
        ));
    }

    #[test]
    fn test_msi_vectors_are_distinct() {
        fn handler() {}
        let a = allocate_msi_vector(handler).unwrap();
        let b = allocate_msi_vector(handler).unwrap();
        assert_ne!(a, b);
        assert!((MSI_VECTOR_BASE..MSI_VECTOR_BASE + MSI_VECTOR_COUNT as u8).contains(&a));
    }
}
