//! xHCI host controller driver.
//!
//! Owns the command ring, event ring, DCBAA and scratchpad, the port
//! state machine, and device slots. Commands are serialized by a
//! controller mutex and complete through per-slot completion TRBs
//! published by the interrupt handler (status dword last); ports are
//! driven by a kernel task woken from PortStatusChange events.

pub mod context;
pub mod device;
pub mod regs;
pub mod ring;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::memory::dma::DmaRegion;
use crate::pci::PciDevice;
use crate::task::ThreadBlocker;
use crate::time::Deadline;

use super::SpeedClass;
use context::Dcbaa;
use device::{CompletionSlot, XhciDevice};
use regs::*;
use ring::{completion_code, trb_type, EventRing, ProducerRing, Trb};

const COMMAND_RING_TRBS: usize = 64;
const EVENT_RING_TRBS: usize = 64;

/// Root-hub port state tracked by the updater.
struct PortState {
    revision_major: u8,
    #[allow(dead_code)]
    revision_minor: u8,
    slot_id: u8,
}

pub struct XhciController {
    #[allow(dead_code)]
    cap: MmioRegion,
    op: MmioRegion,
    rt: MmioRegion,
    db: MmioRegion,
    max_slots: u8,
    context_size: usize,
    dcbaa: Dcbaa,
    command_ring: Mutex<ProducerRing>,
    command_ring_paddr: u64,
    command_completions: Vec<CompletionSlot>,
    event_ring: Mutex<EventRing>,
    #[allow(dead_code)]
    erst: DmaRegion,
    #[allow(dead_code)]
    scratchpad_array: Option<DmaRegion>,
    scratchpad_pages: Vec<u64>,
    ports: Mutex<Vec<PortState>>,
    devices: Mutex<Vec<Option<Arc<XhciDevice>>>>,
    port_changed: AtomicBool,
    port_blocker: ThreadBlocker,
    ports_initialized: AtomicBool,
    last_port_activity_ms: AtomicU64,
}

static CONTROLLERS: Mutex<Vec<Arc<XhciController>>> = Mutex::new(Vec::new());

/// MSI handler shared by all controllers; each checks its own event
/// interrupt flag.
fn xhci_irq_dispatch() {
    for controller in CONTROLLERS.lock().iter() {
        controller.handle_irq();
    }
}

/// Probe one xHCI PCI function and bring the controller up.
pub fn probe(pci: PciDevice) -> Result<Arc<XhciController>> {
    log::info!(
        "xhci: controller at {:02x}:{:02x}.{}",
        pci.bus,
        pci.device,
        pci.function
    );

    pci.enable_bus_mastering();
    let base = pci.map_bar(0)?;

    // SAFETY: map_bar returned a mapped uncached MMIO range.
    let cap = unsafe { MmioRegion::new(base) };

    take_ownership(&cap)?;

    let cap_length = cap.read8(CAP_CAPLENGTH) as usize;
    let op = cap.at(cap_length);
    let rt = cap.at((cap.read32(CAP_RTSOFF) & !0x1F) as usize);
    let db = cap.at((cap.read32(CAP_DBOFF) & !0x3) as usize);

    reset_controller(&op)?;

    let hcsparams1 = cap.read32(CAP_HCSPARAMS1);
    let max_slots = (hcsparams1 & 0xFF) as u8;
    let max_ports = ((hcsparams1 >> 24) & 0xFF) as u8;
    let hccparams1 = cap.read32(CAP_HCCPARAMS1);
    let context_size = if hccparams1 & (1 << 2) != 0 { 64 } else { 32 };

    log::info!(
        "xhci: max_slots={} max_intrs={} max_ports={} context_size={}",
        max_slots,
        (hcsparams1 >> 8) & 0x7FF,
        max_ports,
        context_size
    );

    // Port protocol revisions from the supported-protocol capabilities.
    let mut ports = Vec::new();
    for _ in 0..max_ports {
        ports.push(PortState {
            revision_major: 0,
            revision_minor: 0,
            slot_id: 0,
        });
    }
    parse_supported_protocols(&cap, &mut ports)?;

    // Enable every slot the controller has.
    op.write32(OP_CONFIG, (op.read32(OP_CONFIG) & !0xFF) | max_slots as u32);

    let dcbaa = Dcbaa::new(max_slots as usize)?;
    op.write64(OP_DCBAAP, dcbaa.paddr());

    let command_ring = ProducerRing::new(COMMAND_RING_TRBS)?;
    let command_ring_paddr = command_ring.base_paddr();
    let mut command_completions = Vec::with_capacity(COMMAND_RING_TRBS);
    for _ in 0..COMMAND_RING_TRBS {
        command_completions.push(CompletionSlot::new());
    }
    op.write64(
        OP_CRCR,
        command_ring.base_paddr() | u64::from(command_ring.cycle_state()),
    );

    // Event ring with a one-entry segment table.
    let event_ring = EventRing::new(EVENT_RING_TRBS)?;
    let erst = DmaRegion::create(16)?;
    unsafe {
        let entry = erst.as_ptr::<u64>();
        entry.write_volatile(event_ring.base_paddr());
        (entry.add(1) as *mut u32).write_volatile(EVENT_RING_TRBS as u32);
    }

    rt.write32(IR_ERSTSZ, (rt.read32(IR_ERSTSZ) & 0xFFFF_0000) | 1);
    rt.write64(IR_ERDP, event_ring.dequeue_paddr() | ERDP_EVENT_HANDLER_BUSY);
    rt.write64(IR_ERSTBA, erst.paddr());

    // Scratchpad buffers per HCSPARAMS2.
    let hcsparams2 = cap.read32(CAP_HCSPARAMS2);
    let scratchpad_count =
        ((((hcsparams2 >> 21) & 0x1F) << 5) | ((hcsparams2 >> 27) & 0x1F)) as usize;
    let mut scratchpad_pages = Vec::new();
    let scratchpad_array = if scratchpad_count > 0 {
        let array = DmaRegion::create(scratchpad_count * 8)?;
        for i in 0..scratchpad_count {
            let page = crate::memory::frame_allocator::allocate_frame()
                .ok_or(KernelError::OutOfMemory)?;
            scratchpad_pages.push(page);
            unsafe { array.as_ptr::<u64>().add(i).write_volatile(page) };
        }
        dcbaa.set(0, array.paddr());
        Some(array)
    } else {
        None
    };

    // Interrupts: MSI when available, wired through the shared
    // dispatch entry.
    match crate::interrupts::allocate_msi_vector(xhci_irq_dispatch) {
        Ok(vector) => {
            if let Err(err) = pci.enable_msi(vector) {
                log::warn!("xhci: MSI unavailable ({}), running polled", err);
            }
        }
        Err(err) => log::warn!("xhci: no interrupt vector ({}), running polled", err),
    }
    op.write32(OP_USBCMD, op.read32(OP_USBCMD) | USBCMD_INTE);
    rt.write32(
        IR_IMAN,
        rt.read32(IR_IMAN) | IMAN_INTERRUPT_PENDING | IMAN_INTERRUPT_ENABLE,
    );

    // Run.
    op.write32(OP_USBCMD, op.read32(OP_USBCMD) | USBCMD_RUN_STOP);
    let deadline = Deadline::after_ms(500);
    while op.read32(OP_USBSTS) & USBSTS_HCHALTED != 0 {
        if deadline.is_expired() {
            return Err(KernelError::DeviceTimeout);
        }
        core::hint::spin_loop();
    }

    let mut devices = Vec::new();
    for _ in 0..max_slots {
        devices.push(None);
    }

    let controller = Arc::new(XhciController {
        cap,
        op,
        rt,
        db,
        max_slots,
        context_size,
        dcbaa,
        command_ring: Mutex::new(command_ring),
        command_ring_paddr,
        command_completions,
        event_ring: Mutex::new(event_ring),
        erst,
        scratchpad_array,
        scratchpad_pages,
        ports: Mutex::new(ports),
        devices: Mutex::new(devices),
        // Controllers do not send change events for ports that were
        // already attached; force one initial pass.
        port_changed: AtomicBool::new(true),
        port_blocker: ThreadBlocker::new(),
        ports_initialized: AtomicBool::new(false),
        last_port_activity_ms: AtomicU64::new(crate::time::ms_since_boot()),
    });

    CONTROLLERS.lock().push(controller.clone());

    let task_controller = controller.clone();
    crate::task::spawn(
        "xhci-ports",
        alloc::boxed::Box::new(move || task_controller.poll_ports()),
    );

    Ok(controller)
}

/// BIOS→OS handoff through the USB legacy support capability.
fn take_ownership(cap: &MmioRegion) -> Result<()> {
    let hccparams1 = cap.read32(CAP_HCCPARAMS1);
    let mut ext_offset = ((hccparams1 >> 16) & 0xFFFF) as usize * 4;
    if ext_offset == 0 {
        return Ok(());
    }

    loop {
        let header = cap.read32(ext_offset);
        let cap_id = (header & 0xFF) as u8;

        if cap_id == EXTCAP_USB_LEGACY {
            if header & LEGACY_BIOS_OWNED == 0 {
                return Ok(());
            }
            cap.write32(ext_offset, header | LEGACY_OS_OWNED);

            let deadline = Deadline::after_ms(1000);
            while cap.read32(ext_offset) & LEGACY_BIOS_OWNED != 0 {
                if deadline.is_expired() {
                    return Err(KernelError::DeviceTimeout);
                }
                core::hint::spin_loop();
            }
            return Ok(());
        }

        let next = ((header >> 8) & 0xFF) as usize;
        if next == 0 {
            return Ok(());
        }
        ext_offset += next * 4;
    }
}

/// Halt-and-reset: wait for controller-not-ready to clear, issue
/// HCRST, wait for it to clear. 500 ms budget for each.
fn reset_controller(op: &MmioRegion) -> Result<()> {
    let deadline = Deadline::after_ms(500);
    while op.read32(OP_USBSTS) & USBSTS_CNR != 0 {
        if deadline.is_expired() {
            return Err(KernelError::DeviceTimeout);
        }
        core::hint::spin_loop();
    }

    op.write32(OP_USBCMD, op.read32(OP_USBCMD) | USBCMD_HCRST);
    while op.read32(OP_USBCMD) & USBCMD_HCRST != 0 {
        if deadline.is_expired() {
            return Err(KernelError::DeviceTimeout);
        }
        core::hint::spin_loop();
    }

    Ok(())
}

/// Record each port's protocol revision from the supported-protocol
/// extended capabilities.
fn parse_supported_protocols(cap: &MmioRegion, ports: &mut [PortState]) -> Result<()> {
    let hccparams1 = cap.read32(CAP_HCCPARAMS1);
    let mut ext_offset = ((hccparams1 >> 16) & 0xFFFF) as usize * 4;
    if ext_offset == 0 {
        return Err(KernelError::InvalidFormat);
    }

    loop {
        let header = cap.read32(ext_offset);
        let cap_id = (header & 0xFF) as u8;

        if cap_id == EXTCAP_SUPPORTED_PROTOCOL {
            let name = cap.read32(ext_offset + 4);
            if name != u32::from_le_bytes(*b"USB ") {
                return Err(KernelError::InvalidFormat);
            }

            let ports_word = cap.read32(ext_offset + 8);
            let port_offset = (ports_word & 0xFF) as usize;
            let port_count = ((ports_word >> 8) & 0xFF) as usize;
            let major = ((header >> 24) & 0xFF) as u8;
            let minor = ((header >> 16) & 0xFF) as u8;

            if port_offset == 0 || port_offset + port_count - 1 > ports.len() {
                return Err(KernelError::InvalidFormat);
            }
            for i in 0..port_count {
                ports[port_offset + i - 1].revision_major = major;
                ports[port_offset + i - 1].revision_minor = minor;
            }
        }

        let next = ((header >> 8) & 0xFF) as usize;
        if next == 0 {
            break;
        }
        ext_offset += next * 4;
    }

    Ok(())
}

impl XhciController {
    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub(super) fn dcbaa_set(&self, slot_id: u8, paddr: u64) {
        self.dcbaa.set(slot_id, paddr);
    }

    pub(super) fn ring_doorbell(&self, slot_id: u8, value: u32) {
        self.db.write32(slot_id as usize * 4, value);
    }

    /// Submit a command TRB and wait for its completion event.
    /// Serialized by the command-ring mutex, which stays held across
    /// the wait so completions map one-to-one onto ring slots.
    pub(super) fn send_command(&self, trb: Trb) -> Result<Trb> {
        let ring = self.command_ring.lock();

        if self.op.read32(OP_USBSTS) & USBSTS_HCHALTED != 0 {
            log::warn!("xhci: command on a halted controller");
            return Err(KernelError::DeviceTimeout);
        }

        let mut ring = ring;
        let index = ring.enqueue_index();
        self.command_completions[index].clear();
        ring.push(trb, false);

        self.ring_doorbell(0, 0);

        let event = self.command_completions[index].wait(Deadline::after_ms(1000))?;
        if event.completion_code() != completion_code::SUCCESS {
            log::warn!("xhci: command completion code {}", event.completion_code());
            return Err(KernelError::DeviceTimeout);
        }
        Ok(event)
    }

    /// The interrupt handler: acknowledge, drain the event ring, and
    /// publish the new dequeue pointer.
    pub fn handle_irq(&self) {
        let usbsts = self.op.read32(OP_USBSTS);
        if usbsts & USBSTS_EINT == 0 {
            return;
        }
        self.op.write32(OP_USBSTS, USBSTS_EINT);

        self.rt.write32(
            IR_IMAN,
            self.rt.read32(IR_IMAN) | IMAN_INTERRUPT_PENDING | IMAN_INTERRUPT_ENABLE,
        );

        let mut event_ring = self.event_ring.lock();
        while let Some(trb) = event_ring.pop() {
            match trb.trb_type() {
                trb_type::TRANSFER_EVENT => {
                    let slot_id = trb.slot_id();
                    let device = {
                        let devices = self.devices.lock();
                        devices
                            .get(slot_id as usize - 1)
                            .and_then(|slot| slot.clone())
                    };
                    match device {
                        Some(device) => device.on_transfer_event(&trb),
                        None => log::warn!(
                            "xhci: transfer event for empty slot {} (code {})",
                            slot_id,
                            trb.completion_code()
                        ),
                    }
                }
                trb_type::COMMAND_COMPLETION => {
                    let index =
                        ((trb.parameter - self.command_ring_paddr) / ring::TRB_SIZE as u64) as usize;
                    if index < self.command_completions.len() {
                        self.command_completions[index].publish(&trb);
                    }
                }
                trb_type::PORT_STATUS_CHANGE => {
                    self.port_changed.store(true, Ordering::Release);
                    self.port_blocker.unblock();
                }
                other => log::debug!("xhci: unhandled event TRB type {}", other),
            }
        }

        self.rt
            .write64(IR_ERDP, event_ring.dequeue_paddr() | ERDP_EVENT_HANDLER_BUSY);
    }

    fn portsc(&self, port_index: usize) -> u32 {
        self.op
            .read32(OP_PORTSC_BASE + port_index * OP_PORTSC_STRIDE)
    }

    fn set_portsc(&self, port_index: usize, value: u32) {
        self.op
            .write32(OP_PORTSC_BASE + port_index * OP_PORTSC_STRIDE, value)
    }

    /// One pass of the port updater task. Runs on PortStatusChange
    /// wakeups; after 100 ms without port activity the root hub is
    /// considered enumerated.
    pub fn poll_ports(self: &Arc<Self>) {
        let woken = self.port_blocker.take_pending();
        let changed = self.port_changed.swap(false, Ordering::AcqRel);
        if !woken && !changed {
            if !self.ports_initialized.load(Ordering::Relaxed)
                && crate::time::ms_since_boot()
                    .saturating_sub(self.last_port_activity_ms.load(Ordering::Relaxed))
                    >= 100
            {
                self.ports_initialized.store(true, Ordering::Relaxed);
                log::info!("xhci: root hub enumeration settled");
            }
            return;
        }

        self.last_port_activity_ms
            .store(crate::time::ms_since_boot(), Ordering::Relaxed);

        let port_count = self.ports.lock().len();
        for port_index in 0..port_count {
            let revision_major = self.ports.lock()[port_index].revision_major;
            if revision_major == 0 {
                continue;
            }

            let portsc = self.portsc(port_index);
            if portsc & PORTSC_PP == 0 {
                continue;
            }

            let reset_change = portsc & PORTSC_PRC != 0;
            let connect_change = portsc & PORTSC_CSC != 0;
            let enabled = portsc & PORTSC_PED != 0;
            // Clear the change bits (write-one-to-clear) while keeping
            // power on.
            self.set_portsc(port_index, PORTSC_CSC | PORTSC_PRC | PORTSC_PP);

            if portsc & PORTSC_CCS == 0 {
                let slot_id = self.ports.lock()[port_index].slot_id;
                if slot_id != 0 {
                    self.deinitialize_slot(slot_id);
                    self.ports.lock()[port_index].slot_id = 0;
                }
                continue;
            }

            match revision_major {
                2 => {
                    // USB2 ports need an explicit reset; they come back
                    // enabled with PRC set.
                    if !(enabled && reset_change) {
                        if connect_change {
                            self.set_portsc(port_index, PORTSC_PR | PORTSC_PP);
                        }
                        continue;
                    }
                }
                3 => {
                    // USB3 ports enable themselves.
                    if !(connect_change && enabled) {
                        continue;
                    }
                }
                _ => continue,
            }

            let speed_id = ((portsc >> PORTSC_SPEED_SHIFT) & PORTSC_SPEED_MASK) as u8;
            let Some(speed) = SpeedClass::from_speed_id(speed_id) else {
                log::warn!("xhci: port {} has unknown speed id {}", port_index + 1, speed_id);
                continue;
            };

            match self.initialize_device(port_index as u8 + 1, speed) {
                Ok(slot_id) => self.ports.lock()[port_index].slot_id = slot_id,
                Err(err) => log::warn!(
                    "xhci: could not initialize USB{} device on port {}: {}",
                    revision_major,
                    port_index + 1,
                    err
                ),
            }
        }
    }

    /// Enumerate one device: EnableSlot, addressing, descriptors, and
    /// HID driver attach when the device is a HID interface.
    fn initialize_device(self: &Arc<Self>, port_id: u8, speed: SpeedClass) -> Result<u8> {
        let enable = Trb::with_type(trb_type::ENABLE_SLOT);
        let event = self.send_command(enable)?;
        let slot_id = event.slot_id();
        if slot_id == 0 || slot_id > self.max_slots {
            log::warn!("xhci: EnableSlot returned invalid slot {}", slot_id);
            return Err(KernelError::InvalidFormat);
        }

        let device = XhciDevice::create(self.clone(), port_id, slot_id, speed)?;
        self.devices.lock()[slot_id as usize - 1] = Some(device.clone());

        let result = (|| -> Result<()> {
            let descriptor = device.initialize()?;
            log::info!(
                "xhci: slot {}: device {:04x}:{:04x}",
                slot_id,
                { descriptor.id_vendor },
                { descriptor.id_product }
            );

            let configuration = device.read_configuration()?;
            device.set_configuration(configuration.descriptor.b_configuration_value)?;

            for interface in &configuration.interfaces {
                if interface.descriptor.b_interface_class
                    == super::descriptors::class_code::HID
                {
                    if let Err(err) = super::hid::attach(device.clone(), interface) {
                        log::warn!("xhci: HID attach failed on slot {}: {}", slot_id, err);
                    }
                }
            }
            Ok(())
        })();

        if let Err(err) = result {
            log::warn!("xhci: device on slot {} failed: {}", slot_id, err);
            self.deinitialize_slot(slot_id);
            return Err(err);
        }

        Ok(slot_id)
    }

    fn deinitialize_slot(&self, slot_id: u8) {
        let device = self.devices.lock()[slot_id as usize - 1].take();
        if let Some(device) = device {
            device.shutdown();
        }
        self.dcbaa.set(slot_id, 0);
    }
}

impl Drop for XhciController {
    fn drop(&mut self) {
        for page in &self.scratchpad_pages {
            crate::memory::frame_allocator::deallocate_frame(*page);
        }
    }
}
