//! Operation regions and field-unit access.
//!
//! A field unit is a bit slice of an OpRegion. Reads and writes
//! decompose into aligned accesses of the field's declared access
//! width; the update rule decides what the untouched bits of each
//! container word become (preserved via read-modify-write, forced to
//! ones, or forced to zeros). IndexFields write the index field and
//! then access the data field; BankFields select their bank first.

use alloc::vec;

use crate::error::{KernelError, Result};

use super::convert::{convert_node, CONV_BUFFER, CONV_INTEGER, CONV_STRING};
use super::name::{AbsPath, NameString};
use super::namespace::Namespace;
use super::node::{AddressSpace, FieldUnit, FieldUnitKind, Node, OpRegion};

// ---------------------------------------------------------------------
// Access rules
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRule {
    Preserve,
    WriteOnes,
    WriteZeros,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessRule {
    /// Aligned access width in bits: 8, 16, 32 or 64.
    pub access_bits: u32,
    /// Acquire the ACPI global lock around the access.
    pub lock: bool,
    pub update_rule: UpdateRule,
}

/// Decode the 8-bit field flags byte.
pub fn parse_access_rule(flags: u8) -> Result<AccessRule> {
    let access_bits = match flags & 0x0F {
        0 | 1 => 8,
        2 => 16,
        3 => 32,
        4 => 64,
        5 => 8, // buffer access degrades to bytes
        other => {
            log::warn!("aml: unknown field access type {}", other);
            return Err(KernelError::InvalidFormat);
        }
    };

    let update_rule = match (flags >> 5) & 0x03 {
        0 => UpdateRule::Preserve,
        1 => UpdateRule::WriteOnes,
        2 => UpdateRule::WriteZeros,
        _ => {
            log::warn!("aml: reserved field update rule");
            return Err(KernelError::InvalidFormat);
        }
    };

    Ok(AccessRule {
        access_bits,
        lock: flags & 0x10 != 0,
        update_rule,
    })
}

// ---------------------------------------------------------------------
// Bit-buffer helpers
// ---------------------------------------------------------------------

fn mask64(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// OR up to 64 bits of `value` into `buffer` at `bit_offset`, one byte
/// slice at a time.
pub fn write_bits_to_buffer(buffer: &mut [u8], bit_offset: usize, value: u64, bit_count: usize) {
    let mut bits_done = 0;
    while bits_done < bit_count {
        let acc_bit_offset = (bit_offset + bits_done) % 8;
        let acc_size = (bit_count - bits_done).min(8 - acc_bit_offset);
        let mask = (1u64 << acc_size) - 1;

        buffer[(bit_offset + bits_done) / 8] |=
            (((value >> bits_done) & mask) as u8) << acc_bit_offset;

        bits_done += acc_size;
    }
}

/// Mirror of [`write_bits_to_buffer`]: shift byte slices into an
/// accumulator.
pub fn read_bits_from_buffer(buffer: &[u8], bit_offset: usize, bit_count: usize) -> u64 {
    let mut result = 0u64;
    let mut bits_done = 0;
    while bits_done < bit_count {
        let acc_bit_offset = (bit_offset + bits_done) % 8;
        let acc_size = (bit_count - bits_done).min(8 - acc_bit_offset);
        let mask = (1u64 << acc_size) - 1;

        result |= (((buffer[(bit_offset + bits_done) / 8] >> acc_bit_offset) as u64) & mask)
            << bits_done;

        bits_done += acc_size;
    }
    result
}

// ---------------------------------------------------------------------
// Raw region access
// ---------------------------------------------------------------------

/// Physical-memory access for SystemMemory regions. Real hardware goes
/// through the fast page; host tests read and write registered windows.
mod phys_access {
    #[cfg(not(test))]
    pub fn read(paddr: u64, access_bytes: usize) -> u64 {
        use crate::memory::page_table::PageTable;
        use crate::memory::PAGE_SIZE;

        let offset = (paddr % PAGE_SIZE as u64) as usize;
        PageTable::with_fast_page(paddr & !(PAGE_SIZE as u64 - 1), || unsafe {
            match access_bytes {
                1 => PageTable::fast_page_read::<u8>(offset) as u64,
                2 => PageTable::fast_page_read::<u16>(offset) as u64,
                4 => PageTable::fast_page_read::<u32>(offset) as u64,
                8 => PageTable::fast_page_read::<u64>(offset),
                _ => unreachable!(),
            }
        })
    }

    #[cfg(not(test))]
    pub fn write(paddr: u64, access_bytes: usize, value: u64) {
        use crate::memory::page_table::PageTable;
        use crate::memory::PAGE_SIZE;

        let offset = (paddr % PAGE_SIZE as u64) as usize;
        PageTable::with_fast_page(paddr & !(PAGE_SIZE as u64 - 1), || unsafe {
            match access_bytes {
                1 => PageTable::fast_page_write::<u8>(offset, value as u8),
                2 => PageTable::fast_page_write::<u16>(offset, value as u16),
                4 => PageTable::fast_page_write::<u32>(offset, value as u32),
                8 => PageTable::fast_page_write::<u64>(offset, value),
                _ => unreachable!(),
            }
        })
    }

    #[cfg(test)]
    pub use test_windows::{read, write};

    #[cfg(test)]
    pub mod test_windows {
        use spin::Mutex;
        use std::vec::Vec;

        struct Window {
            base: u64,
            bytes: Vec<u8>,
        }

        static WINDOWS: Mutex<Vec<Window>> = Mutex::new(Vec::new());

        /// Register a zeroed window of fake physical memory.
        pub fn install(base: u64, size: usize) {
            WINDOWS.lock().push(Window {
                base,
                bytes: vec![0u8; size],
            });
        }

        pub fn read(paddr: u64, access_bytes: usize) -> u64 {
            let windows = WINDOWS.lock();
            let window = windows
                .iter()
                .find(|w| paddr >= w.base && paddr + access_bytes as u64 <= w.base + w.bytes.len() as u64)
                .expect("test access outside installed windows");
            let offset = (paddr - window.base) as usize;
            let mut value = 0u64;
            for i in 0..access_bytes {
                value |= (window.bytes[offset + i] as u64) << (i * 8);
            }
            value
        }

        pub fn write(paddr: u64, access_bytes: usize, value: u64) {
            let mut windows = WINDOWS.lock();
            let window = windows
                .iter_mut()
                .find(|w| paddr >= w.base && paddr + access_bytes as u64 <= w.base + w.bytes.len() as u64)
                .expect("test access outside installed windows");
            let offset = (paddr - window.base) as usize;
            for i in 0..access_bytes {
                window.bytes[offset + i] = (value >> (i * 8)) as u8;
            }
        }
    }
}

#[cfg(test)]
pub use phys_access::test_windows;

fn io_read(port: u64, access_bytes: usize) -> Result<u64> {
    if port + access_bytes as u64 > 0x10000 {
        return Err(KernelError::InvalidInput);
    }
    #[cfg(not(test))]
    {
        use x86_64::instructions::port::Port;
        let value = unsafe {
            match access_bytes {
                1 => Port::<u8>::new(port as u16).read() as u64,
                2 => Port::<u16>::new(port as u16).read() as u64,
                4 => Port::<u32>::new(port as u16).read() as u64,
                _ => return Err(KernelError::InvalidInput),
            }
        };
        Ok(value)
    }
    #[cfg(test)]
    {
        let _ = port;
        Err(KernelError::NotSupported)
    }
}

fn io_write(port: u64, access_bytes: usize, value: u64) -> Result<()> {
    if port + access_bytes as u64 > 0x10000 {
        return Err(KernelError::InvalidInput);
    }
    #[cfg(not(test))]
    {
        use x86_64::instructions::port::Port;
        unsafe {
            match access_bytes {
                1 => Port::<u8>::new(port as u16).write(value as u8),
                2 => Port::<u16>::new(port as u16).write(value as u16),
                4 => Port::<u32>::new(port as u16).write(value as u32),
                _ => return Err(KernelError::InvalidInput),
            }
        }
        Ok(())
    }
    #[cfg(test)]
    {
        let _ = (value,);
        Err(KernelError::NotSupported)
    }
}

/// Resolve the PCI address of a PCIConfig region from `_SEG`, `_BBN`
/// and `_ADR` in its scope.
fn pci_config_address(ns: &mut Namespace, region: &OpRegion) -> Result<(u8, u8, u8)> {
    let eval_integer = |ns: &mut Namespace, name: &str| -> Result<Option<u64>> {
        let name = NameString::from_str(name)?;
        match ns.find(&region.scope, &name, true) {
            Some((path, node_ref)) => {
                let node = super::parser::evaluate_node(ns, &path, &node_ref)?;
                Ok(Some(
                    convert_node(ns, node, CONV_INTEGER, 8)?
                        .as_integer()
                        .ok_or(KernelError::InvalidInput)?,
                ))
            }
            None => Ok(None),
        }
    };

    let seg = eval_integer(ns, "_SEG")?.unwrap_or(0);
    if seg != 0 {
        log::warn!("aml: PCIConfig OpRegion with non-zero segment");
        return Err(KernelError::NotSupported);
    }
    let bus = eval_integer(ns, "_BBN")?.unwrap_or(0);
    let adr = eval_integer(ns, "_ADR")?.ok_or_else(|| {
        log::warn!("aml: no _ADR for PCIConfig OpRegion");
        KernelError::NotFound
    })?;

    Ok(((bus & 0xFF) as u8, (adr >> 16) as u8, (adr & 0xFF) as u8))
}

fn perform_opregion_read(
    ns: &mut Namespace,
    region: &OpRegion,
    access_bytes: usize,
    offset: u64,
) -> Result<u64> {
    debug_assert!(offset % access_bytes as u64 == 0);
    let byte_offset = region.offset + offset;

    match region.address_space {
        AddressSpace::SystemMemory => Ok(phys_access::read(byte_offset, access_bytes)),
        AddressSpace::SystemIo => io_read(byte_offset, access_bytes),
        AddressSpace::PciConfig => {
            let (bus, dev, func) = pci_config_address(ns, region)?;
            let value = match access_bytes {
                1 => crate::pci::read_config_u8(bus, dev, func, byte_offset as u8) as u64,
                2 => crate::pci::read_config_u16(bus, dev, func, byte_offset as u8) as u64,
                4 => crate::pci::read_config_u32(bus, dev, func, byte_offset as u8) as u64,
                _ => return Err(KernelError::InvalidInput),
            };
            Ok(value)
        }
        AddressSpace::EmbeddedController => {
            if access_bytes != 1 {
                return Err(KernelError::InvalidInput);
            }
            let controller = crate::acpi::ec::find_by_scope(&region.scope)
                .ok_or(KernelError::NotFound)?;
            Ok(controller.read_byte(offset as u8)? as u64)
        }
        other => {
            log::warn!("aml: read from unsupported address space {:?}", other);
            Err(KernelError::NotSupported)
        }
    }
}

fn perform_opregion_write(
    ns: &mut Namespace,
    region: &OpRegion,
    access_bytes: usize,
    offset: u64,
    value: u64,
) -> Result<()> {
    debug_assert!(offset % access_bytes as u64 == 0);
    let byte_offset = region.offset + offset;

    match region.address_space {
        AddressSpace::SystemMemory => {
            phys_access::write(byte_offset, access_bytes, value);
            Ok(())
        }
        AddressSpace::SystemIo => io_write(byte_offset, access_bytes, value),
        AddressSpace::PciConfig => {
            let (bus, dev, func) = pci_config_address(ns, region)?;
            match access_bytes {
                1 => crate::pci::write_config_u8(bus, dev, func, byte_offset as u8, value as u8),
                2 => crate::pci::write_config_u16(bus, dev, func, byte_offset as u8, value as u16),
                4 => crate::pci::write_config_u32(bus, dev, func, byte_offset as u8, value as u32),
                _ => return Err(KernelError::InvalidInput),
            }
            Ok(())
        }
        AddressSpace::EmbeddedController => {
            if access_bytes != 1 {
                return Err(KernelError::InvalidInput);
            }
            let controller = crate::acpi::ec::find_by_scope(&region.scope)
                .ok_or(KernelError::NotFound)?;
            controller.write_byte(offset as u8, value as u8)
        }
        other => {
            log::warn!("aml: write to unsupported address space {:?}", other);
            Err(KernelError::NotSupported)
        }
    }
}

// ---------------------------------------------------------------------
// Field-unit reads and writes
// ---------------------------------------------------------------------

fn field_slice_read(
    ns: &mut Namespace,
    field: &FieldUnit,
    access_bytes: usize,
    acc_byte_offset: u64,
) -> Result<u64> {
    match &field.kind {
        FieldUnitKind::Field { region } => {
            perform_opregion_read(ns, region, access_bytes, acc_byte_offset)
        }
        FieldUnitKind::IndexField { index, data } => {
            let index_field = clone_field_unit(index)?;
            let data_field = clone_field_unit(data)?;
            store_to_field_unit(ns, &Node::Integer(acc_byte_offset), &index_field)?;
            let value = convert_from_field_unit(ns, &data_field, CONV_INTEGER, 8)?;
            value.as_integer().ok_or(KernelError::InvalidInput)
        }
        FieldUnitKind::BankField { region, .. } => {
            perform_opregion_read(ns, region, access_bytes, acc_byte_offset)
        }
    }
}

fn field_slice_write(
    ns: &mut Namespace,
    field: &FieldUnit,
    access_bytes: usize,
    acc_byte_offset: u64,
    value: u64,
) -> Result<()> {
    match &field.kind {
        FieldUnitKind::Field { region } => {
            perform_opregion_write(ns, region, access_bytes, acc_byte_offset, value)
        }
        FieldUnitKind::IndexField { index, data } => {
            let index_field = clone_field_unit(index)?;
            let data_field = clone_field_unit(data)?;
            store_to_field_unit(ns, &Node::Integer(acc_byte_offset), &index_field)?;
            store_to_field_unit(ns, &Node::Integer(value), &data_field)
        }
        FieldUnitKind::BankField { region, .. } => {
            perform_opregion_write(ns, region, access_bytes, acc_byte_offset, value)
        }
    }
}

fn clone_field_unit(node_ref: &super::node::NodeRef) -> Result<FieldUnit> {
    match &*node_ref.lock() {
        Node::FieldUnit(field) => Ok(field.clone()),
        other => {
            log::warn!("aml: expected field unit, found {}", other.type_name());
            Err(KernelError::InvalidInput)
        }
    }
}

/// Select the bank before touching a BankField.
fn select_bank(ns: &mut Namespace, field: &FieldUnit) -> Result<()> {
    if let FieldUnitKind::BankField {
        bank_selector,
        bank_value,
        ..
    } = &field.kind
    {
        let selector = clone_field_unit(bank_selector)?;
        store_to_field_unit(ns, &Node::Integer(*bank_value), &selector)?;
    }
    Ok(())
}

/// Hold the ACPI global lock for the access when the field asks for it.
struct FieldLockGuard {
    locked: bool,
}

impl FieldLockGuard {
    fn acquire(rule: &AccessRule) -> Self {
        if rule.lock {
            crate::acpi::global_lock::acquire();
        }
        Self { locked: rule.lock }
    }
}

impl Drop for FieldLockGuard {
    fn drop(&mut self) {
        if self.locked {
            crate::acpi::global_lock::release();
        }
    }
}

/// Read a field unit into an integer (when it fits in 64 bits) or a
/// buffer.
pub fn convert_from_field_unit(
    ns: &mut Namespace,
    field: &FieldUnit,
    conversion: u8,
    max_bytes: usize,
) -> Result<Node> {
    let can_be_integer = field.bit_count <= 64;

    let as_integer = if can_be_integer && conversion & CONV_INTEGER != 0 {
        true
    } else if conversion & CONV_BUFFER != 0 {
        false
    } else if conversion & CONV_INTEGER != 0 {
        log::warn!("aml: field unit of {} bits cannot convert to integer", field.bit_count);
        return Err(KernelError::InvalidInput);
    } else {
        return Err(KernelError::InvalidInput);
    };

    select_bank(ns, field)?;

    let rule = parse_access_rule(field.flags)?;
    let _lock = FieldLockGuard::acquire(&rule);
    let max_acc_bits = rule.access_bits as u64;

    let dst_bytes = if as_integer {
        8.min(max_bytes.max(1))
    } else {
        ((field.bit_count as usize) + 7) / 8
    };
    let mut dst = vec![0u8; dst_bytes.max(1)];

    let transfer_bits = field.bit_count.min(dst.len() as u64 * 8);

    let mut bits_done = 0u64;
    while bits_done < transfer_bits {
        let acc_bit_offset = (field.bit_offset + bits_done) & (max_acc_bits - 1);
        let acc_bit_count = (max_acc_bits - acc_bit_offset).min(transfer_bits - bits_done);
        let acc_byte_offset = ((field.bit_offset + bits_done) & !(max_acc_bits - 1)) / 8;

        let value = field_slice_read(ns, field, (max_acc_bits / 8) as usize, acc_byte_offset)?;
        write_bits_to_buffer(
            &mut dst,
            bits_done as usize,
            value >> acc_bit_offset,
            acc_bit_count as usize,
        );

        bits_done += acc_bit_count;
    }

    if as_integer {
        let mut value = 0u64;
        for (i, &b) in dst.iter().take(8).enumerate() {
            value |= (b as u64) << (i * 8);
        }
        Ok(Node::Integer(value))
    } else {
        Ok(Node::buffer(dst))
    }
}

/// Write `source` into a field unit, honoring the update rule for the
/// bits of each container word outside the field.
pub fn store_to_field_unit(ns: &mut Namespace, source: &Node, target: &FieldUnit) -> Result<()> {
    let src_bytes: vec::Vec<u8> = match source {
        Node::Integer(value) => value.to_le_bytes().to_vec(),
        Node::Buffer(buffer) | Node::String(buffer) => buffer.lock().clone(),
        other => {
            let converted = convert_node(
                ns,
                other.clone(),
                CONV_INTEGER | CONV_BUFFER | CONV_STRING,
                8,
            )?;
            return store_to_field_unit(ns, &converted, target);
        }
    };

    select_bank(ns, target)?;

    let rule = parse_access_rule(target.flags)?;
    let _lock = FieldLockGuard::acquire(&rule);
    let max_acc_bits = rule.access_bits as u64;

    let transfer_bits = target.bit_count.min(src_bytes.len() as u64 * 8);

    let mut bits_done = 0u64;
    while bits_done < transfer_bits {
        let acc_bit_offset = (target.bit_offset + bits_done) & (max_acc_bits - 1);
        let acc_bit_count = (max_acc_bits - acc_bit_offset).min(transfer_bits - bits_done);
        let acc_byte_offset = ((target.bit_offset + bits_done) & !(max_acc_bits - 1)) / 8;

        let mut value = match rule.update_rule {
            UpdateRule::Preserve => {
                field_slice_read(ns, target, (max_acc_bits / 8) as usize, acc_byte_offset)?
            }
            UpdateRule::WriteZeros => 0,
            UpdateRule::WriteOnes => u64::MAX,
        };

        value &= !(mask64(acc_bit_count as usize) << acc_bit_offset);
        value |= read_bits_from_buffer(&src_bytes, bits_done as usize, acc_bit_count as usize)
            << acc_bit_offset;

        field_slice_write(
            ns,
            target,
            (max_acc_bits / 8) as usize,
            acc_byte_offset,
            value,
        )?;

        bits_done += acc_bit_count;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_buffer_round_trip() {
        // For all (value, count <= 64, offset): read(write(zero)) == masked value.
        let cases = [
            (0xDEAD_BEEF_u64, 0usize, 32usize),
            (0x1, 7, 1),
            (0xFFFF_FFFF_FFFF_FFFF, 3, 61),
            (0xA5A5, 12, 16),
            (0x123456789ABCDEF0, 0, 64),
        ];
        for (value, offset, count) in cases {
            let mut buffer = [0u8; 16];
            write_bits_to_buffer(&mut buffer, offset, value, count);
            let back = read_bits_from_buffer(&buffer, offset, count);
            assert_eq!(back, value & mask64(count), "value {:#x} off {} count {}", value, offset, count);
        }
    }

    #[test]
    fn test_access_rule_decoding() {
        let rule = parse_access_rule(0x03).unwrap();
        assert_eq!(rule.access_bits, 32);
        assert!(!rule.lock);
        assert_eq!(rule.update_rule, UpdateRule::Preserve);

        let rule = parse_access_rule(0x10 | 0x02 | (1 << 5)).unwrap();
        assert_eq!(rule.access_bits, 16);
        assert!(rule.lock);
        assert_eq!(rule.update_rule, UpdateRule::WriteOnes);

        let rule = parse_access_rule(2 << 5).unwrap();
        assert_eq!(rule.update_rule, UpdateRule::WriteZeros);

        assert!(parse_access_rule(0x0F).is_err(), "Reserved access type");
    }

    fn memory_field(base: u64, bit_offset: u64, bit_count: u64, flags: u8) -> FieldUnit {
        FieldUnit {
            kind: FieldUnitKind::Field {
                region: OpRegion {
                    address_space: AddressSpace::SystemMemory,
                    offset: base,
                    length: 0x1000,
                    scope: AbsPath::root(),
                },
            },
            bit_offset,
            bit_count,
            flags,
        }
    }

    #[test]
    fn test_field_write_read_all_access_sizes() {
        // A write then read of a w-bit field yields v & mask(w)
        // regardless of the access size.
        let mut ns = Namespace::new();
        for (i, &access_type) in [0u8, 2, 3, 4].iter().enumerate() {
            let base = 0x9000_0000 + (i as u64) * 0x1000;
            test_windows::install(base, 64);

            let field = memory_field(base, 5, 27, access_type);
            let value = 0x5A5A_5A5A_u64;
            store_to_field_unit(&mut ns, &Node::Integer(value), &field).unwrap();

            let back = convert_from_field_unit(&mut ns, &field, CONV_INTEGER, 8).unwrap();
            assert_eq!(
                back.as_integer(),
                Some(value & mask64(27)),
                "access type {}",
                access_type
            );
        }
    }

    #[test]
    fn test_preserve_keeps_neighbor_bits() {
        let base = 0x9100_0000;
        test_windows::install(base, 16);
        let mut ns = Namespace::new();

        // Fill the container byte, then write a 2-bit field inside it.
        let whole = memory_field(base, 0, 8, 0);
        store_to_field_unit(&mut ns, &Node::Integer(0xFF), &whole).unwrap();

        let field = memory_field(base, 2, 2, 0); // Preserve
        store_to_field_unit(&mut ns, &Node::Integer(0), &field).unwrap();

        let back = convert_from_field_unit(&mut ns, &whole, CONV_INTEGER, 8).unwrap();
        assert_eq!(back.as_integer(), Some(0xF3), "Only bits 2-3 cleared");
    }

    #[test]
    fn test_write_zeros_clears_neighbor_bits() {
        let base = 0x9200_0000;
        test_windows::install(base, 16);
        let mut ns = Namespace::new();

        let whole = memory_field(base, 0, 8, 0);
        store_to_field_unit(&mut ns, &Node::Integer(0xFF), &whole).unwrap();

        let field = memory_field(base, 2, 2, 2 << 5); // WriteZeros
        store_to_field_unit(&mut ns, &Node::Integer(0b11), &field).unwrap();

        let back = convert_from_field_unit(&mut ns, &whole, CONV_INTEGER, 8).unwrap();
        assert_eq!(back.as_integer(), Some(0b0000_1100));
    }

    #[test]
    fn test_wide_field_becomes_buffer() {
        let base = 0x9300_0000;
        test_windows::install(base, 32);
        let mut ns = Namespace::new();

        let field = memory_field(base, 0, 128, 0);
        let node = convert_from_field_unit(&mut ns, &field, CONV_INTEGER | CONV_BUFFER, 8).unwrap();
        assert!(matches!(node, Node::Buffer(_)), "128-bit field cannot be an integer");

        let node = convert_from_field_unit(&mut ns, &field, CONV_INTEGER, 8);
        assert!(node.is_err(), "Integer-only conversion of a wide field fails");
    }
}
