//! PCI configuration space access and device discovery.
//!
//! Legacy port-IO configuration mechanism (0xCF8/0xCFC), enough BAR
//! handling to map memory BARs, and MSI programming for the drivers
//! that want interrupts without the IO-APIC detour.

use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::memory::page_table::{MemoryType, PageFlags, PageTable, KERNEL_OFFSET};
use crate::memory::{range_page_count, PAGE_SIZE};

const CONFIG_ADDRESS: u16 = 0xCF8;
const CONFIG_DATA: u16 = 0xCFC;

const KERNEL_VSPACE_END: u64 = 0xFFFF_FFFF_FFFF_F000;

fn config_address(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    0x8000_0000
        | ((bus as u32) << 16)
        | ((device as u32) << 11)
        | ((function as u32) << 8)
        | (offset as u32 & 0xFC)
}

#[cfg(not(test))]
fn config_read(address: u32) -> u32 {
    use x86_64::instructions::port::Port;
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(address);
        Port::<u32>::new(CONFIG_DATA).read()
    }
}

#[cfg(not(test))]
fn config_write(address: u32, value: u32) {
    use x86_64::instructions::port::Port;
    unsafe {
        Port::<u32>::new(CONFIG_ADDRESS).write(address);
        Port::<u32>::new(CONFIG_DATA).write(value);
    }
}

#[cfg(test)]
fn config_read(_address: u32) -> u32 {
    0xFFFF_FFFF
}

#[cfg(test)]
fn config_write(_address: u32, _value: u32) {}

pub fn read_config_u32(bus: u8, device: u8, function: u8, offset: u8) -> u32 {
    config_read(config_address(bus, device, function, offset))
}

pub fn read_config_u16(bus: u8, device: u8, function: u8, offset: u8) -> u16 {
    let dword = read_config_u32(bus, device, function, offset & 0xFC);
    (dword >> ((offset & 2) * 8)) as u16
}

pub fn read_config_u8(bus: u8, device: u8, function: u8, offset: u8) -> u8 {
    let dword = read_config_u32(bus, device, function, offset & 0xFC);
    (dword >> ((offset & 3) * 8)) as u8
}

pub fn write_config_u32(bus: u8, device: u8, function: u8, offset: u8, value: u32) {
    config_write(config_address(bus, device, function, offset), value);
}

pub fn write_config_u16(bus: u8, device: u8, function: u8, offset: u8, value: u16) {
    let aligned = offset & 0xFC;
    let shift = (offset & 2) * 8;
    let dword = read_config_u32(bus, device, function, aligned);
    let dword = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
    write_config_u32(bus, device, function, aligned, dword);
}

pub fn write_config_u8(bus: u8, device: u8, function: u8, offset: u8, value: u8) {
    let aligned = offset & 0xFC;
    let shift = (offset & 3) * 8;
    let dword = read_config_u32(bus, device, function, aligned);
    let dword = (dword & !(0xFF << shift)) | ((value as u32) << shift);
    write_config_u32(bus, device, function, aligned, dword);
}

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class_code: u8,
    pub subclass: u8,
    pub prog_if: u8,
}

impl PciDevice {
    pub fn read_u32(&self, offset: u8) -> u32 {
        read_config_u32(self.bus, self.device, self.function, offset)
    }

    pub fn write_u32(&self, offset: u8, value: u32) {
        write_config_u32(self.bus, self.device, self.function, offset, value);
    }

    pub fn read_u16(&self, offset: u8) -> u16 {
        read_config_u16(self.bus, self.device, self.function, offset)
    }

    pub fn write_u16(&self, offset: u8, value: u16) {
        write_config_u16(self.bus, self.device, self.function, offset, value);
    }

    /// Set bus-master and memory-space enable.
    pub fn enable_bus_mastering(&self) {
        let command = self.read_u16(0x04);
        self.write_u16(0x04, command | 0x0006);
    }

    /// Map a memory BAR into kernel space uncached. Returns the
    /// virtual base.
    pub fn map_bar(&self, bar_index: u8) -> Result<u64> {
        let offset = 0x10 + bar_index * 4;
        let bar = self.read_u32(offset);

        if bar & 1 != 0 {
            log::warn!("pci: BAR{} of {:02x}:{:02x}.{} is IO space", bar_index, self.bus, self.device, self.function);
            return Err(KernelError::InvalidInput);
        }

        let is_64bit = (bar >> 1) & 0x3 == 0x2;
        let mut base = (bar & 0xFFFF_FFF0) as u64;
        if is_64bit {
            base |= (self.read_u32(offset + 4) as u64) << 32;
        }

        // Size probe: write all-ones, read back, restore.
        self.write_u32(offset, 0xFFFF_FFFF);
        let mask = self.read_u32(offset);
        self.write_u32(offset, bar);
        let size = (!(mask & 0xFFFF_FFF0)).wrapping_add(1) as usize;
        if size == 0 || base == 0 {
            return Err(KernelError::InvalidFormat);
        }

        let page_count = range_page_count(base, size);
        let kernel = PageTable::kernel();
        let vaddr = kernel
            .reserve_free_contiguous_pages(page_count, KERNEL_OFFSET, KERNEL_VSPACE_END)
            .ok_or(KernelError::OutOfMemory)?;

        kernel.map_range_at(
            base & !(PAGE_SIZE as u64 - 1),
            vaddr,
            page_count * PAGE_SIZE,
            PageFlags::READ_WRITE | PageFlags::PRESENT,
            MemoryType::Uncached,
        );

        Ok(vaddr + (base % PAGE_SIZE as u64))
    }

    /// Program the MSI capability to deliver `vector` to the boot CPU.
    pub fn enable_msi(&self, vector: u8) -> Result<()> {
        let status = self.read_u16(0x06);
        if status & (1 << 4) == 0 {
            return Err(KernelError::NotSupported);
        }

        // Walk the capability list looking for MSI (id 0x05).
        let mut cap_offset = (self.read_u32(0x34) & 0xFC) as u8;
        while cap_offset != 0 {
            let header = self.read_u32(cap_offset);
            let cap_id = (header & 0xFF) as u8;
            if cap_id == 0x05 {
                let message_control = (header >> 16) as u16;
                let is_64bit = message_control & (1 << 7) != 0;

                // Fixed destination: BSP, edge-triggered.
                self.write_u32(cap_offset + 4, 0xFEE0_0000);
                if is_64bit {
                    self.write_u32(cap_offset + 8, 0);
                    self.write_u16(cap_offset + 12, vector as u16);
                } else {
                    self.write_u16(cap_offset + 8, vector as u16);
                }

                // Enable MSI, single message.
                let control = (message_control & !(0x7 << 4)) | 1;
                self.write_u16(cap_offset + 2, control);
                return Ok(());
            }
            cap_offset = ((header >> 8) & 0xFC) as u8;
        }

        Err(KernelError::NotSupported)
    }
}

static DEVICES: Mutex<Vec<PciDevice>> = Mutex::new(Vec::new());

/// Brute-force scan of bus/device/function space.
pub fn scan() {
    let mut devices = DEVICES.lock();
    devices.clear();

    for bus in 0..=255u16 {
        for device in 0..32u8 {
            for function in 0..8u8 {
                let id = read_config_u32(bus as u8, device, function, 0x00);
                if id == 0xFFFF_FFFF {
                    if function == 0 {
                        break;
                    }
                    continue;
                }

                let class = read_config_u32(bus as u8, device, function, 0x08);
                devices.push(PciDevice {
                    bus: bus as u8,
                    device,
                    function,
                    vendor_id: (id & 0xFFFF) as u16,
                    device_id: (id >> 16) as u16,
                    class_code: (class >> 24) as u8,
                    subclass: (class >> 16) as u8,
                    prog_if: (class >> 8) as u8,
                });

                // Single-function devices only answer on function 0.
                if function == 0 {
                    let header_type = read_config_u8(bus as u8, device, 0, 0x0E);
                    if header_type & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }

    log::info!("pci: {} functions discovered", devices.len());
}

/// Every function matching (class, subclass, prog_if).
pub fn find_by_class(class_code: u8, subclass: u8, prog_if: u8) -> Vec<PciDevice> {
    DEVICES
        .lock()
        .iter()
        .filter(|d| d.class_code == class_code && d.subclass == subclass && d.prog_if == prog_if)
        .copied()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_address_encoding() {
        let address = config_address(0, 3, 0, 0x10);
        assert_eq!(address, 0x8000_0000 | (3 << 11) | 0x10);

        let address = config_address(1, 31, 7, 0xFD);
        assert_eq!(address & 3, 0, "Offset is dword aligned in the address");
        assert_eq!((address >> 16) & 0xFF, 1);
        assert_eq!((address >> 11) & 0x1F, 31);
        assert_eq!((address >> 8) & 0x7, 7);
    }
}
