//! ACPI machine layer.
//!
//! Table discovery (RSDP → RSDT/XSDT → FADT/DSDT/SSDT), entry into
//! ACPI mode, the SCI event task with GPE dispatch, embedded
//! controllers, power-off / reset flows, and interrupt-link routing.

pub mod aml;
pub mod ec;
pub mod global_lock;
pub mod tables;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::memory::page_table::{MemoryType, PageFlags, PageTable, KERNEL_OFFSET};
use crate::memory::{range_page_count, PAGE_SIZE};
use crate::task::ThreadBlocker;

use aml::{
    convert_node, evaluate_node, make_ref, method_call, AbsPath, NameSeg, NameString, Namespace,
    Node, NodeRef, PackageElement, CONV_BUFFER, CONV_INTEGER,
};
use tables::{Fadt, Gas, Rsdp, SdtHeader, FACS_GLOBAL_LOCK_OFFSET, RSDP_V2_SIZE};

const KERNEL_VSPACE_END: u64 = 0xFFFF_FFFF_FFFF_F000;

// PM1 event bits.
const PM1_EVN_PWRBTN: u16 = 1 << 8;
const PM1_EVN_SLPBTN: u16 = 1 << 8;

// PM1 control bits.
const PM1_CNT_SCI_EN: u16 = 1 << 0;
const PM1_CNT_SLP_EN: u16 = 1 << 13;
const PM1_CNT_SLP_TYP_MASK: u16 = 0b111;
const PM1_CNT_SLP_TYP_SHIFT: u16 = 10;

#[cfg(not(test))]
fn io_inw(port: u16) -> u16 {
    unsafe { x86_64::instructions::port::Port::<u16>::new(port).read() }
}

#[cfg(not(test))]
fn io_outw(port: u16, value: u16) {
    unsafe { x86_64::instructions::port::Port::<u16>::new(port).write(value) }
}

#[cfg(not(test))]
fn io_outb(port: u16, value: u8) {
    unsafe { x86_64::instructions::port::Port::<u8>::new(port).write(value) }
}

#[cfg(test)]
fn io_inw(_port: u16) -> u16 {
    PM1_CNT_SCI_EN
}

#[cfg(test)]
fn io_outw(_port: u16, _value: u16) {}

#[cfg(test)]
fn io_outb(_port: u16, _value: u8) {}

/// A mapped ACPI table.
struct MappedTable {
    signature: [u8; 4],
    vaddr: u64,
    length: usize,
}

impl MappedTable {
    fn bytes(&self) -> &'static [u8] {
        // SAFETY: mapped at init and never unmapped.
        unsafe { core::slice::from_raw_parts(self.vaddr as *const u8, self.length) }
    }
}

enum GpeHandler {
    Method { path: AbsPath, node: NodeRef },
    Callback { callback: fn(usize), argument: usize },
}

pub struct Acpi {
    fadt: Fadt,
    hardware_reduced: bool,
    tables: Vec<MappedTable>,
    namespace: Mutex<Namespace>,
    gpe_handlers: Mutex<BTreeMap<u8, GpeHandler>>,
    has_any_gpes: AtomicBool,
    event_blocker: ThreadBlocker,
    last_event_scan_ms: AtomicU64,
}

static INSTANCE: OnceCell<Acpi> = OnceCell::uninit();

impl Acpi {
    pub fn get() -> &'static Acpi {
        INSTANCE.try_get().expect("ACPI not initialized")
    }

    pub fn is_initialized() -> bool {
        INSTANCE.try_get().is_ok()
    }

    /// Discover and map the table chain. `rsdp_paddr` comes from the
    /// bootloader when it has one; otherwise the BIOS area is scanned.
    pub fn initialize(rsdp_paddr: Option<u64>) -> Result<()> {
        assert!(INSTANCE.try_get().is_err());

        let rsdp = match rsdp_paddr {
            Some(paddr) => read_rsdp_at(paddr).ok_or(KernelError::InvalidFormat)?,
            None => scan_bios_for_rsdp().ok_or(KernelError::NotFound)?,
        };

        let (entries_paddr, entry_size, entry_count) = map_root_table(&rsdp)?;

        let mut mapped = Vec::new();
        for i in 0..entry_count {
            let entry_paddr = read_root_entry(entries_paddr, entry_size, i);
            if entry_paddr == 0 {
                continue;
            }
            match map_table(entry_paddr) {
                Some(table) => mapped.push(table),
                None => log::warn!("acpi: table at {:#x} failed validation", entry_paddr),
            }
        }

        // Find the FADT and chase the DSDT out of it.
        let mut fadt = None;
        for table in &mapped {
            if &table.signature == b"FACP" {
                fadt = Fadt::from_bytes(table.bytes());
                break;
            }
        }
        let fadt = fadt.ok_or_else(|| {
            log::error!("acpi: no FADT found");
            KernelError::NotFound
        })?;

        let dsdt_paddr = fadt.dsdt_address();
        if dsdt_paddr != 0 {
            match map_table(dsdt_paddr) {
                Some(table) => mapped.push(table),
                None => log::warn!("acpi: DSDT at {:#x} failed validation", dsdt_paddr),
            }
        }

        // Map the FACS and hand its global-lock dword to the lock
        // protocol. The FACS has no checksum.
        let facs_paddr = {
            let x = fadt.x_firmware_ctrl;
            if x != 0 {
                x
            } else {
                fadt.firmware_ctrl as u64
            }
        };
        if facs_paddr != 0 {
            if let Some(vaddr) = map_physical(facs_paddr, 64) {
                global_lock::set_lock_address(vaddr + FACS_GLOBAL_LOCK_OFFSET as u64);
            }
        }

        let hardware_reduced = fadt.hardware_reduced();
        log::info!(
            "acpi: {} tables mapped, sci_int={}, hardware_reduced={}",
            mapped.len(),
            { fadt.sci_int },
            hardware_reduced
        );

        INSTANCE.init_once(|| Acpi {
            fadt,
            hardware_reduced,
            tables: mapped,
            namespace: Mutex::new(Namespace::new()),
            gpe_handlers: Mutex::new(BTreeMap::new()),
            has_any_gpes: AtomicBool::new(false),
            event_blocker: ThreadBlocker::new(),
            last_event_scan_ms: AtomicU64::new(0),
        });

        Ok(())
    }

    pub fn fadt(&self) -> &Fadt {
        &self.fadt
    }

    pub fn hardware_reduced(&self) -> bool {
        self.hardware_reduced
    }

    /// The `index`-th mapped table with the given signature.
    pub fn get_table(&self, signature: &[u8; 4], index: usize) -> Option<&'static [u8]> {
        self.tables
            .iter()
            .filter(|table| &table.signature == signature)
            .nth(index)
            .map(|table| table.bytes())
    }

    fn load_aml_tables(&self, ns: &mut Namespace, signature: &[u8; 4], all: bool) {
        for index in 0.. {
            let Some(bytes) = self.get_table(signature, index) else {
                break;
            };
            let sig = core::str::from_utf8(signature).unwrap_or("????");
            log::info!("acpi: parsing {} ({} bytes)", sig, bytes.len());

            let body = &bytes[core::mem::size_of::<SdtHeader>()..];
            if let Err(err) = aml::parse_table(ns, body) {
                log::warn!("acpi: could not load {}: {}", sig, err);
            }

            if !all {
                break;
            }
        }
    }

    /// Enter ACPI mode: the SCI_EN handshake, namespace construction,
    /// embedded controllers, `\_PIC`, GPE enablement, the SCI event
    /// task, and interrupt-link routing.
    pub fn enter_acpi_mode(&'static self, pic_mode: u8) -> Result<()> {
        // If not hardware-reduced and SCI_EN is clear, poke the SMI
        // command port and poll for the switchover.
        let pm1a_cnt = self.fadt.pm1a_cnt_blk as u16;
        if !self.hardware_reduced && io_inw(pm1a_cnt) & PM1_CNT_SCI_EN == 0 {
            io_outb(self.fadt.smi_cmd as u16, self.fadt.acpi_enable);

            for _ in 0..100 {
                if io_inw(pm1a_cnt) & PM1_CNT_SCI_EN != 0 {
                    break;
                }
                crate::time::sleep_ms(10);
            }

            if io_inw(pm1a_cnt) & PM1_CNT_SCI_EN == 0 {
                log::warn!("acpi: failed to enable ACPI mode");
                return Err(KernelError::DeviceTimeout);
            }

            // Enable the power and sleep button events.
            let evt_half = (self.fadt.pm1_evt_len / 2) as u16;
            io_outw(
                self.fadt.pm1a_evt_blk as u16 + evt_half,
                PM1_EVN_PWRBTN | PM1_EVN_SLPBTN,
            );
            if self.fadt.pm1b_evt_blk != 0 {
                io_outw(
                    self.fadt.pm1b_evt_blk as u16 + evt_half,
                    PM1_EVN_PWRBTN | PM1_EVN_SLPBTN,
                );
            }
        }

        log::info!("acpi: entered ACPI mode");

        {
            let mut ns = self.namespace.lock();
            self.load_aml_tables(&mut ns, b"DSDT", false);
            self.load_aml_tables(&mut ns, b"SSDT", true);
            self.load_aml_tables(&mut ns, b"PSDT", true);

            // Quiesce both GPE blocks before selectively enabling.
            for block_index in 0..2 {
                if let Some(gpe) = self.find_gpe_block(&mut ns, block_index) {
                    let blk_len = self.gpe_block_len(block_index);
                    for i in 0..blk_len / 2 {
                        let _ = gpe.offset_bytes((blk_len / 2 + i) as u64).write(&mut ns, 0);
                    }
                }
            }

            self.initialize_embedded_controllers(&mut ns);

            ns.post_load_initialize();

            // \_PIC(mode).
            if let Some((path, node_ref)) = ns.find(
                &AbsPath::root(),
                &NameString::from_str("\\_PIC")?,
                false,
            ) {
                let node = node_ref.lock().clone();
                if let Node::Method(method) = node {
                    let mut args: [Option<NodeRef>; 7] = Default::default();
                    args[0] = Some(make_ref(Node::Integer(pic_mode as u64)));
                    if let Err(err) = method_call(&mut ns, &path, &method, args) {
                        log::warn!("acpi: \\_PIC({}) failed: {}", pic_mode, err);
                    }
                }
            }

            // Walk \_GPE for _Lxx / _Exx methods and enable each one.
            let gpe_path = AbsPath::root().child(NameSeg::new("_GPE"));
            let mut gpe_methods: Vec<(u8, AbsPath, NodeRef)> = Vec::new();
            ns.for_each_child(&gpe_path, |path, node| {
                let Some(seg) = path.last() else { return };
                let name = seg.0;
                if name[0] != b'_' || (name[1] != b'L' && name[1] != b'E') {
                    return;
                }
                if !matches!(&*node.lock(), Node::Method(_)) {
                    return;
                }
                let Some(index) = hex_pair(name[2], name[3]) else {
                    log::warn!("acpi: invalid GPE number in {}", path);
                    return;
                };
                gpe_methods.push((index, path.clone(), node.clone()));
            });

            for (index, path, node) in gpe_methods {
                if self.enable_gpe(&mut ns, index) {
                    self.gpe_handlers
                        .lock()
                        .insert(index, GpeHandler::Method { path, node });
                    log::info!("acpi: enabled GPE {:#x}", index);
                }
            }
        }

        // Hook the SCI and start the event task.
        let sci_irq = self.fadt.sci_int as u8;
        crate::interrupts::register_irq_handler(sci_irq, || {
            Acpi::get().handle_irq();
        })?;

        crate::task::spawn("acpi-events", alloc::boxed::Box::new(move || {
            self.poll_events();
        }));

        // Route PNP0C0F interrupt link devices.
        {
            let mut ns = self.namespace.lock();
            let links = ns.find_devices_with_eisa_id("PNP0C0F");
            let mut routed_irq_mask = 0u64;
            for device in links {
                if let Err(err) = self.route_interrupt_link_device(&mut ns, &device, &mut routed_irq_mask)
                {
                    log::warn!("acpi: failed to route {}: {}", device, err);
                }
            }
        }

        log::info!("acpi: interrupts initialized");
        Ok(())
    }

    // -- embedded controllers ---------------------------------------

    fn initialize_embedded_controllers(&self, ns: &mut Namespace) {
        let devices = ns.find_devices_with_eisa_id("PNP0C09");
        let total = devices.len();
        let mut initialized = 0;

        for device in devices {
            match self.initialize_embedded_controller(ns, &device) {
                Ok(()) => initialized += 1,
                Err(err) => log::warn!("acpi: EC {} failed to initialize: {}", device, err),
            }
        }

        log::info!("acpi: initialized {}/{} embedded controllers", initialized, total);
    }

    fn initialize_embedded_controller(&self, ns: &mut Namespace, device: &AbsPath) -> Result<()> {
        let gpe = match ns.find(device, &NameString::from_str("_GPE")?, false) {
            Some((path, node_ref)) => {
                let node = evaluate_node(ns, &path, &node_ref)?;
                match node {
                    Node::Package(_) => {
                        log::warn!("acpi: EC {} has a package _GPE", device);
                        None
                    }
                    node => convert_node(ns, node, CONV_INTEGER, 8)?
                        .as_integer()
                        .map(|value| value as u8),
                }
            }
            None => None,
        };

        let (crs_path, crs_ref) = ns
            .find(device, &NameString::from_str("_CRS")?, false)
            .ok_or(KernelError::NotFound)?;
        let crs = evaluate_node(ns, &crs_path, &crs_ref)?;
        let crs = convert_node(ns, crs, CONV_BUFFER, 8)?;
        let bytes = match &crs {
            Node::Buffer(buffer) => buffer.lock().clone(),
            _ => return Err(KernelError::InvalidInput),
        };

        let (data_port, command_port) = ec::parse_crs_io_ports(&bytes)?;
        let controller = Arc::new(ec::EmbeddedController::new(
            device.clone(),
            command_port,
            data_port,
            gpe,
        ));

        if let Some(gpe_index) = gpe {
            // The EC's GPE is enabled without a method; its events are
            // acked by the status write in the dispatch loop.
            self.enable_gpe(ns, gpe_index);
        }

        ec::register(controller);
        Ok(())
    }

    // -- GPE handling -----------------------------------------------

    fn gpe_block_len(&self, block_index: usize) -> usize {
        match block_index {
            0 => self.fadt.gpe0_blk_len as usize,
            _ => self.fadt.gpe1_blk_len as usize,
        }
    }

    fn gpe_block_base(&self, block_index: usize) -> usize {
        match block_index {
            0 => 0,
            _ => self.fadt.gpe1_base as usize,
        }
    }

    /// The GAS for GPE block 0 or 1, preferring the extended form.
    fn find_gpe_block(&self, ns: &mut Namespace, block_index: usize) -> Option<Gas> {
        let (x_blk, legacy_blk) = match block_index {
            0 => (self.fadt.x_gpe0_blk, self.fadt.gpe0_blk),
            _ => (self.fadt.x_gpe1_blk, self.fadt.gpe1_blk),
        };

        if !x_blk.is_empty() {
            let mut gas = x_blk;
            gas.register_bit_width = 8;
            gas.access_size = 1;
            if gas.read(ns).is_ok() {
                return Some(gas);
            }
        }

        if legacy_blk != 0 {
            return Some(Gas {
                address_space_id: 1, // SystemIO
                register_bit_width: 8,
                register_bit_offset: 0,
                access_size: 1,
                address: legacy_blk as u64,
            });
        }

        None
    }

    /// Set the enable bit for one GPE in whichever block covers it.
    fn enable_gpe(&self, ns: &mut Namespace, gpe: u8) -> bool {
        for block_index in 0..2usize {
            let Some(block) = self.find_gpe_block(ns, block_index) else {
                continue;
            };
            let base = self.gpe_block_base(block_index);
            let blk_len = self.gpe_block_len(block_index);
            let gpe = gpe as usize;

            if gpe < base || gpe >= base + blk_len / 2 * 8 {
                continue;
            }
            let byte = (gpe - base) / 8;
            let bit = (gpe - base) % 8;

            let enable_reg = block.offset_bytes((blk_len / 2 + byte) as u64);
            let Ok(current) = enable_reg.read(ns) else {
                continue;
            };
            if enable_reg.write(ns, current | (1 << bit)).is_err() {
                continue;
            }

            self.has_any_gpes.store(true, Ordering::Release);
            return true;
        }
        false
    }

    /// Register a callback-backed GPE (used by drivers such as the EC).
    pub fn register_gpe_handler(
        &self,
        gpe: u8,
        callback: fn(usize),
        argument: usize,
    ) -> Result<()> {
        let mut handlers = self.gpe_handlers.lock();
        if handlers.contains_key(&gpe) {
            return Err(KernelError::AlreadyExists);
        }

        let mut ns = self.namespace.lock();
        if !self.enable_gpe(&mut ns, gpe) {
            return Err(KernelError::NotFound);
        }
        handlers.insert(gpe, GpeHandler::Callback { callback, argument });
        Ok(())
    }

    /// Called from the SCI interrupt.
    pub fn handle_irq(&self) {
        self.event_blocker.unblock();
    }

    /// One pass of the SCI event loop: fixed PM1 events (power button
    /// included), then both GPE blocks. Runs from the kernel task
    /// loop; a pass happens on SCI wakeup or every 100 ms.
    pub fn poll_events(&self) {
        let now = crate::time::ms_since_boot();
        let woken = self.event_blocker.take_pending();
        if !woken && now.saturating_sub(self.last_event_scan_ms.load(Ordering::Relaxed)) < 100 {
            return;
        }
        self.last_event_scan_ms.store(now, Ordering::Relaxed);

        // Fixed events.
        for sts_port in [self.fadt.pm1a_evt_blk as u16, self.fadt.pm1b_evt_blk as u16] {
            if sts_port == 0 {
                continue;
            }
            let status = io_inw(sts_port);
            let enable = io_inw(sts_port + (self.fadt.pm1_evt_len / 2) as u16);
            let pending = status & enable;
            if pending == 0 {
                continue;
            }

            if pending & PM1_EVN_PWRBTN != 0 {
                log::info!("acpi: power button pressed");
                if let Err(err) = self.poweroff() {
                    log::warn!("acpi: failed to power off: {}", err);
                }
            } else {
                log::warn!("acpi: unhandled fixed event {:#x}", pending);
            }

            io_outw(sts_port, pending);
        }

        // GPEs.
        if !self.has_any_gpes.load(Ordering::Acquire) {
            return;
        }
        let mut ns = self.namespace.lock();
        for block_index in 0..2usize {
            let Some(block) = self.find_gpe_block(&mut ns, block_index) else {
                continue;
            };
            let base = self.gpe_block_base(block_index);
            let blk_len = self.gpe_block_len(block_index);

            for i in 0..blk_len / 2 {
                let status_reg = block.offset_bytes(i as u64);
                let enable_reg = block.offset_bytes((blk_len / 2 + i) as u64);

                let (Ok(status), Ok(enable)) = (status_reg.read(&mut ns), enable_reg.read(&mut ns))
                else {
                    continue;
                };
                let pending = (status & enable) as u8;
                if pending == 0 {
                    continue;
                }

                for bit in 0..8 {
                    if pending & (1 << bit) == 0 {
                        continue;
                    }
                    let gpe = (base + i * 8 + bit) as u8;
                    let handlers = self.gpe_handlers.lock();
                    match handlers.get(&gpe) {
                        Some(GpeHandler::Callback { callback, argument }) => {
                            let (callback, argument) = (*callback, *argument);
                            drop(handlers);
                            callback(argument);
                        }
                        Some(GpeHandler::Method { path, node }) => {
                            let (path, node) = (path.clone(), node.clone());
                            drop(handlers);
                            let method = match &*node.lock() {
                                Node::Method(method) => method.clone(),
                                _ => continue,
                            };
                            match method_call(&mut ns, &path, &method, Default::default()) {
                                Ok(_) => log::debug!("acpi: handled GPE {:#x}", gpe),
                                Err(err) => {
                                    log::warn!("acpi: GPE {:#x} method failed: {}", gpe, err)
                                }
                            }
                        }
                        None => {
                            drop(handlers);
                            log::warn!("acpi: no handler for GPE {:#x}", gpe);
                        }
                    }
                }

                let _ = status_reg.write(&mut ns, pending as u64);
            }
        }
    }

    // -- sleep / reset ----------------------------------------------

    /// Evaluate `\_PTS(state)` when present.
    pub fn prepare_sleep(&self, sleep_state: u8) -> Result<()> {
        let mut ns = self.namespace.lock();
        self.prepare_sleep_locked(&mut ns, sleep_state)
    }

    fn prepare_sleep_locked(&self, ns: &mut Namespace, sleep_state: u8) -> Result<()> {
        let Some((path, node_ref)) =
            ns.find(&AbsPath::root(), &NameString::from_str("\\_PTS")?, false)
        else {
            return Ok(());
        };

        let node = node_ref.lock().clone();
        let Node::Method(method) = node else {
            log::warn!("acpi: \\_PTS is not a method");
            return Err(KernelError::InvalidInput);
        };
        if method.arg_count != 1 {
            log::warn!("acpi: \\_PTS takes {} arguments, expected 1", method.arg_count);
            return Err(KernelError::InvalidInput);
        }

        let mut args: [Option<NodeRef>; 7] = Default::default();
        args[0] = Some(make_ref(Node::Integer(sleep_state as u64)));
        method_call(ns, &path, &method, args)?;

        log::info!("acpi: executed \\_PTS({})", sleep_state);
        Ok(())
    }

    /// Enter S5. Does not return on success.
    pub fn poweroff(&self) -> Result<()> {
        let mut ns = self.namespace.lock();

        let (_, s5_ref) = ns
            .find(&AbsPath::root(), &NameString::from_str("\\_S5_")?, false)
            .ok_or_else(|| {
                log::warn!("acpi: \\_S5_ not found");
                KernelError::NotFound
            })?;

        let s5 = s5_ref.lock().clone();
        let Node::Package(elements) = s5 else {
            log::warn!("acpi: \\_S5_ is not a package");
            return Err(KernelError::InvalidInput);
        };

        let elements = elements.lock().clone();
        if elements.len() < 2 {
            log::warn!("acpi: \\_S5_ has {} elements, expected at least 2", elements.len());
            return Err(KernelError::InvalidInput);
        }

        let mut typ = [0u64; 2];
        for (slot, element) in typ.iter_mut().zip(elements.iter()) {
            match element {
                PackageElement::Resolved(node_ref) => {
                    let node = node_ref.lock().clone();
                    *slot = convert_node(&mut ns, node, CONV_INTEGER, 8)?
                        .as_integer()
                        .ok_or(KernelError::InvalidInput)?;
                }
                PackageElement::Unresolved(_) => {
                    // Lazy package evaluation is future work; match the
                    // original bailout.
                    return Err(KernelError::NotSupported);
                }
            }
        }

        self.prepare_sleep_locked(&mut ns, 5)?;

        log::info!("acpi: entering sleep state S5");

        let write_sleep = |port: u16, slp_typ: u64| {
            if port == 0 {
                return;
            }
            let mut value = io_inw(port);
            value &= !(PM1_CNT_SLP_TYP_MASK << PM1_CNT_SLP_TYP_SHIFT);
            value |= ((slp_typ as u16) & PM1_CNT_SLP_TYP_MASK) << PM1_CNT_SLP_TYP_SHIFT;
            value |= PM1_CNT_SLP_EN;
            io_outw(port, value);
        };

        write_sleep(self.fadt.pm1a_cnt_blk as u16, typ[0]);
        write_sleep(self.fadt.pm1b_cnt_blk as u16, typ[1]);

        // The machine must not execute past the sleep register write.
        panic!("ACPI shutdown failed. You can now safely power off your computer.");
    }

    /// Write the FADT reset register. Does not return on success.
    pub fn reset(&self) -> Result<()> {
        let reset_reg = self.fadt.reset_reg;

        match reset_reg.address_space_id {
            // SystemMemory, SystemIO, PCIConfig.
            0 | 1 | 2 => {}
            other => {
                log::warn!("acpi: reset register in invalid address space {}", other);
                return Err(KernelError::InvalidFormat);
            }
        }
        if reset_reg.register_bit_offset != 0 || reset_reg.register_bit_width != 8 {
            log::warn!("acpi: reset register has invalid location");
            return Err(KernelError::InvalidFormat);
        }

        let mut ns = self.namespace.lock();
        if let Err(err) = self.prepare_sleep_locked(&mut ns, 5) {
            log::warn!("acpi: \\_PTS before reset failed: {}", err);
        }

        log::info!("acpi: resetting system");
        reset_reg.write(&mut ns, self.fadt.reset_value as u64)?;

        unreachable!("system reset did not take effect");
    }

    // -- interrupt links --------------------------------------------

    /// Route one PNP0C0F device: pick an IRQ out of `_PRS` that is not
    /// already routed, and program it with `_SRS`.
    fn route_interrupt_link_device(
        &self,
        ns: &mut Namespace,
        device: &AbsPath,
        routed_irq_mask: &mut u64,
    ) -> Result<()> {
        let (prs_path, prs_ref) = ns
            .find(device, &NameString::from_str("_PRS")?, false)
            .ok_or(KernelError::NotFound)?;
        let prs = evaluate_node(ns, &prs_path, &prs_ref)?;
        let prs = convert_node(ns, prs, CONV_BUFFER, 8)?;
        let prs_bytes = match &prs {
            Node::Buffer(buffer) => buffer.lock().clone(),
            _ => return Err(KernelError::InvalidInput),
        };

        let (srs_path, srs_ref) = ns
            .find(device, &NameString::from_str("_SRS")?, false)
            .ok_or_else(|| {
                log::warn!("acpi: interrupt link {} has no _SRS", device);
                KernelError::NotFound
            })?;
        let srs_method = match &*srs_ref.lock() {
            Node::Method(method) => method.clone(),
            _ => return Err(KernelError::InvalidInput),
        };

        let mut call_srs = |ns: &mut Namespace, setting: &[u8]| -> Result<()> {
            let mut args: [Option<NodeRef>; 7] = Default::default();
            args[0] = Some(make_ref(Node::buffer(setting.to_vec())));
            method_call(ns, &srs_path, &srs_method, args)?;
            Ok(())
        };

        let mut span: &[u8] = &prs_bytes;
        while !span.is_empty() {
            if span[0] & 0x80 == 0 {
                // Small resource descriptor.
                let name = (span[0] >> 3) & 0x0F;
                let length = (span[0] & 0x07) as usize;
                if span.len() < 1 + length {
                    return Err(KernelError::InvalidFormat);
                }

                // IRQ descriptor: a 16-bit mask of routable IRQs.
                if name == 0x04 {
                    if length < 2 {
                        return Err(KernelError::InvalidFormat);
                    }
                    let irq_mask = span[1] as u16 | ((span[2] as u16) << 8);

                    for pass in 0..2 {
                        for irq in 0..16u8 {
                            if irq_mask & (1 << irq) == 0 {
                                continue;
                            }
                            if pass == 0 && *routed_irq_mask & (1u64 << irq) != 0 {
                                continue;
                            }

                            let mut setting = [0u8; 4];
                            setting[0] = 0x22 | u8::from(length > 2);
                            setting[1] = ((1u16 << irq) & 0xFF) as u8;
                            setting[2] = ((1u16 << irq) >> 8) as u8;
                            if length > 2 {
                                setting[3] = span[3];
                            }
                            let setting_len = if length > 2 { 4 } else { 3 };
                            call_srs(ns, &setting[..setting_len])?;

                            log::info!("acpi: routed {} -> irq {}", device, irq);
                            *routed_irq_mask |= 1u64 << irq;
                            return Ok(());
                        }
                    }
                }

                span = &span[1 + length..];
            } else {
                // Large resource descriptor.
                if span.len() < 3 {
                    return Err(KernelError::InvalidFormat);
                }
                let name = span[0] & 0x7F;
                let length = (span[1] as usize) | ((span[2] as usize) << 8);
                if span.len() < 3 + length {
                    return Err(KernelError::InvalidFormat);
                }

                // Extended interrupt descriptor.
                if name == 0x09 {
                    let irq_count = span[4] as usize;
                    if irq_count == 0 || length < 2 + 4 * irq_count {
                        return Err(KernelError::InvalidFormat);
                    }

                    for pass in 0..2 {
                        for i in 0..irq_count {
                            // Only IRQs under 64 are routable here.
                            if span[6 + 4 * i] != 0 || span[7 + 4 * i] != 0 || span[8 + 4 * i] != 0
                            {
                                continue;
                            }
                            let irq = span[5 + 4 * i];
                            if irq >= 64 {
                                continue;
                            }
                            if pass == 0 && *routed_irq_mask & (1u64 << irq) != 0 {
                                continue;
                            }

                            let setting = [
                                0x89, // large, extended interrupt
                                0x06, 0x00, // data length
                                span[3], // flags
                                0x01, // table size
                                irq, 0x00, 0x00, 0x00,
                            ];
                            call_srs(ns, &setting)?;

                            log::info!("acpi: routed {} -> irq {}", device, irq);
                            *routed_irq_mask |= 1u64 << irq;
                            return Ok(());
                        }
                    }
                }

                span = &span[3 + length..];
            }
        }

        log::warn!("acpi: no routable interrupt in _PRS of {}", device);
        Ok(())
    }

    /// Run `f` with the namespace locked. The AML test and diagnostic
    /// surface.
    pub fn with_namespace<T>(&self, f: impl FnOnce(&mut Namespace) -> T) -> T {
        f(&mut self.namespace.lock())
    }
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let digit = |c: u8| -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'A'..=b'F' => Some(c - b'A' + 10),
            b'a'..=b'f' => Some(c - b'a' + 10),
            _ => None,
        }
    };
    Some(digit(high)? * 16 + digit(low)?)
}

// ---------------------------------------------------------------------
// Table discovery and mapping
// ---------------------------------------------------------------------

/// Map `size` bytes of physical memory read-write into kernel space.
/// Returns the virtual address corresponding to `paddr`.
#[cfg(not(test))]
fn map_physical(paddr: u64, size: usize) -> Option<u64> {
    let page_count = range_page_count(paddr, size);
    let kernel = PageTable::kernel();
    let vaddr = kernel.reserve_free_contiguous_pages(page_count, KERNEL_OFFSET, KERNEL_VSPACE_END)?;
    kernel.map_range_at(
        paddr & !(PAGE_SIZE as u64 - 1),
        vaddr,
        page_count * PAGE_SIZE,
        PageFlags::READ_WRITE | PageFlags::PRESENT,
        MemoryType::Normal,
    );
    Some(vaddr + paddr % PAGE_SIZE as u64)
}

#[cfg(test)]
fn map_physical(_paddr: u64, _size: usize) -> Option<u64> {
    None
}

/// Read a candidate RSDP through the fast page.
#[cfg(not(test))]
fn read_rsdp_at(paddr: u64) -> Option<Rsdp> {
    let mut buf = [0u8; RSDP_V2_SIZE];
    let page = paddr & !(PAGE_SIZE as u64 - 1);
    let offset = (paddr % PAGE_SIZE as u64) as usize;
    // Candidates are 16-byte aligned, so a 36-byte read stays within
    // one page.
    if offset + RSDP_V2_SIZE > PAGE_SIZE {
        return None;
    }
    PageTable::with_fast_page(page, || {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = unsafe { PageTable::fast_page_read::<u8>(offset + i) };
        }
    });
    Rsdp::validate(&buf)
}

#[cfg(test)]
fn read_rsdp_at(_paddr: u64) -> Option<Rsdp> {
    None
}

/// Scan the BIOS area `[0xE0000, 0x100000)` at 16-byte strides.
fn scan_bios_for_rsdp() -> Option<Rsdp> {
    let mut paddr = 0xE0000u64;
    while paddr < 0x100000 {
        for offset in (0..PAGE_SIZE as u64 - RSDP_V2_SIZE as u64).step_by(16) {
            if let Some(rsdp) = read_rsdp_at(paddr + offset) {
                return Some(rsdp);
            }
        }
        paddr += PAGE_SIZE as u64;
    }
    None
}

/// Map and validate the RSDT or XSDT; returns the physical address of
/// its entry array, the entry size, and the entry count.
fn map_root_table(rsdp: &Rsdp) -> Result<(u64, usize, usize)> {
    let (root_paddr, entry_size, expected_sig): (u64, usize, &[u8; 4]) = if rsdp.revision >= 2 {
        (rsdp.xsdt_address, 8, b"XSDT")
    } else {
        (rsdp.rsdt_address as u64, 4, b"RSDT")
    };

    let table = map_table_unchecked(root_paddr).ok_or(KernelError::InvalidFormat)?;
    if &table.signature != expected_sig || !SdtHeader::validate(table.bytes()) {
        log::error!("acpi: root table is invalid");
        return Err(KernelError::InvalidFormat);
    }

    let header_size = core::mem::size_of::<SdtHeader>();
    let entry_count = (table.length - header_size) / entry_size;
    Ok((root_paddr + header_size as u64, entry_size, entry_count))
}

/// The root table's entries are mapped along with it; read entry `i`.
fn read_root_entry(entries_paddr: u64, entry_size: usize, index: usize) -> u64 {
    let paddr = entries_paddr + (index * entry_size) as u64;
    #[cfg(not(test))]
    {
        let page = paddr & !(PAGE_SIZE as u64 - 1);
        let offset = (paddr % PAGE_SIZE as u64) as usize;
        return PageTable::with_fast_page(page, || unsafe {
            if entry_size == 8 && offset + 8 <= PAGE_SIZE {
                PageTable::fast_page_read::<u64>(offset)
            } else if entry_size == 4 && offset + 4 <= PAGE_SIZE {
                PageTable::fast_page_read::<u32>(offset) as u64
            } else {
                // Entry straddles a page boundary; byte-assemble it.
                let mut value = 0u64;
                for i in 0..entry_size {
                    let byte_paddr = paddr + i as u64;
                    let b = if byte_paddr & !(PAGE_SIZE as u64 - 1) == page {
                        PageTable::fast_page_read::<u8>((byte_paddr % PAGE_SIZE as u64) as usize)
                    } else {
                        0
                    };
                    value |= (b as u64) << (i * 8);
                }
                value
            }
        });
    }
    #[cfg(test)]
    {
        let _ = paddr;
        0
    }
}

/// Map a table: read its header length through the fast page, reserve
/// and map the full range, and validate the checksum. Unmaps on
/// validation failure.
fn map_table(paddr: u64) -> Option<MappedTable> {
    let table = map_table_unchecked(paddr)?;
    if !SdtHeader::validate(table.bytes()) {
        log::warn!("acpi: checksum failure for table at {:#x}", paddr);
        return None;
    }
    Some(table)
}

#[cfg(not(test))]
fn map_table_unchecked(paddr: u64) -> Option<MappedTable> {
    if paddr == 0 {
        return None;
    }

    // Header first, to learn the length.
    let page = paddr & !(PAGE_SIZE as u64 - 1);
    let offset = (paddr % PAGE_SIZE as u64) as usize;
    let mut header_bytes = [0u8; core::mem::size_of::<SdtHeader>()];
    PageTable::with_fast_page(page, || {
        for (i, slot) in header_bytes.iter_mut().enumerate() {
            let byte_offset = offset + i;
            if byte_offset < PAGE_SIZE {
                *slot = unsafe { PageTable::fast_page_read::<u8>(byte_offset) };
            }
        }
    });
    // Headers crossing a page boundary take the second page too.
    if offset + header_bytes.len() > PAGE_SIZE {
        PageTable::with_fast_page(page + PAGE_SIZE as u64, || {
            for i in (PAGE_SIZE - offset)..header_bytes.len() {
                header_bytes[i] =
                    unsafe { PageTable::fast_page_read::<u8>(offset + i - PAGE_SIZE) };
            }
        });
    }

    let header = SdtHeader::from_bytes(&header_bytes)?;
    let length = header.length as usize;
    if length < core::mem::size_of::<SdtHeader>() {
        return None;
    }

    let vaddr = map_physical(paddr, length)?;
    Some(MappedTable {
        signature: header.signature,
        vaddr,
        length,
    })
}

#[cfg(test)]
fn map_table_unchecked(_paddr: u64) -> Option<MappedTable> {
    None
}
