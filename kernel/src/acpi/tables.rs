//! ACPI table structures: RSDP, system description headers, the FADT
//! family, and the generic address structure.

use core::mem;

use crate::error::{KernelError, Result};

use super::aml::node::{AddressSpace, FieldUnit, FieldUnitKind, Node, OpRegion};
use super::aml::{Namespace, CONV_INTEGER};

/// Root System Description Pointer.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    // Revision 2 extension.
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

pub const RSDP_V1_SIZE: usize = 20;
pub const RSDP_V2_SIZE: usize = 36;

impl Rsdp {
    /// Validate signature and checksum(s) over a candidate byte range.
    pub fn validate(bytes: &[u8]) -> Option<Rsdp> {
        if bytes.len() < RSDP_V1_SIZE {
            return None;
        }
        if &bytes[..8] != b"RSD PTR " {
            return None;
        }
        if checksum(&bytes[..RSDP_V1_SIZE]) != 0 {
            return None;
        }

        let revision = bytes[15];
        if revision >= 2 {
            if bytes.len() < RSDP_V2_SIZE || checksum(&bytes[..RSDP_V2_SIZE]) != 0 {
                return None;
            }
        }

        let mut raw = [0u8; mem::size_of::<Rsdp>()];
        let take = bytes.len().min(raw.len());
        raw[..take].copy_from_slice(&bytes[..take]);
        // SAFETY: plain-data packed struct.
        Some(unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Rsdp) })
    }
}

/// Sum of all bytes modulo 256; valid tables sum to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Common system description table header.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

const _: () = assert!(mem::size_of::<SdtHeader>() == 36);

impl SdtHeader {
    pub fn from_bytes(bytes: &[u8]) -> Option<SdtHeader> {
        if bytes.len() < mem::size_of::<SdtHeader>() {
            return None;
        }
        // SAFETY: length checked; packed plain-data struct.
        Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const SdtHeader) })
    }

    /// Whole-table checksum over `length` bytes.
    pub fn validate(bytes: &[u8]) -> bool {
        let Some(header) = Self::from_bytes(bytes) else {
            return false;
        };
        let length = header.length as usize;
        if length < mem::size_of::<SdtHeader>() || bytes.len() < length {
            return false;
        }
        checksum(&bytes[..length]) == 0
    }
}

/// Generic Address Structure.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Gas {
    pub address_space_id: u8,
    pub register_bit_width: u8,
    pub register_bit_offset: u8,
    pub access_size: u8,
    pub address: u64,
}

const _: () = assert!(mem::size_of::<Gas>() == 12);

impl Gas {
    pub fn is_empty(&self) -> bool {
        let address = self.address;
        address == 0
    }

    fn as_field_unit(&self) -> Result<FieldUnit> {
        let access_bits_flags = match self.access_size {
            0 | 1 => 1u8,
            2 => 2,
            3 => 3,
            4 => 4,
            other => {
                log::warn!("acpi: GAS with unknown access size {}", other);
                return Err(KernelError::InvalidFormat);
            }
        };

        Ok(FieldUnit {
            kind: FieldUnitKind::Field {
                region: OpRegion {
                    address_space: AddressSpace::from_u8(self.address_space_id),
                    offset: self.address,
                    length: u32::MAX as u64,
                    scope: super::aml::AbsPath::root(),
                },
            },
            bit_offset: self.register_bit_offset as u64,
            bit_count: self.register_bit_width as u64,
            flags: access_bits_flags,
        })
    }

    /// Read the register through the field-unit access path.
    pub fn read(&self, ns: &mut Namespace) -> Result<u64> {
        let field = self.as_field_unit()?;
        let node = super::aml::opregion::convert_from_field_unit(ns, &field, CONV_INTEGER, 8)?;
        node.as_integer().ok_or(KernelError::InvalidFormat)
    }

    /// Write the register through the field-unit access path.
    pub fn write(&self, ns: &mut Namespace, value: u64) -> Result<()> {
        let field = self.as_field_unit()?;
        super::aml::opregion::store_to_field_unit(ns, &Node::Integer(value), &field)
    }

    /// The same register shifted by `bytes` (used to step through GPE
    /// status/enable blocks).
    pub fn offset_bytes(&self, bytes: u64) -> Gas {
        let mut gas = *self;
        gas.address = self.address + bytes;
        gas
    }
}

/// Fixed ACPI Description Table. Only the fields the machine layer
/// consumes are named; trailing fields beyond `x_dsdt` are read
/// defensively because short FADTs exist in the wild.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Fadt {
    pub header: SdtHeader,
    pub firmware_ctrl: u32,
    pub dsdt: u32,
    pub reserved0: u8,
    pub preferred_pm_profile: u8,
    pub sci_int: u16,
    pub smi_cmd: u32,
    pub acpi_enable: u8,
    pub acpi_disable: u8,
    pub s4bios_req: u8,
    pub pstate_cnt: u8,
    pub pm1a_evt_blk: u32,
    pub pm1b_evt_blk: u32,
    pub pm1a_cnt_blk: u32,
    pub pm1b_cnt_blk: u32,
    pub pm2_cnt_blk: u32,
    pub pm_tmr_blk: u32,
    pub gpe0_blk: u32,
    pub gpe1_blk: u32,
    pub pm1_evt_len: u8,
    pub pm1_cnt_len: u8,
    pub pm2_cnt_len: u8,
    pub pm_tmr_len: u8,
    pub gpe0_blk_len: u8,
    pub gpe1_blk_len: u8,
    pub gpe1_base: u8,
    pub cst_cnt: u8,
    pub p_lvl2_lat: u16,
    pub p_lvl3_lat: u16,
    pub flush_size: u16,
    pub flush_stride: u16,
    pub duty_offset: u8,
    pub duty_width: u8,
    pub day_alrm: u8,
    pub mon_alrm: u8,
    pub century: u8,
    pub iapc_boot_arch: u16,
    pub reserved1: u8,
    pub flags: u32,
    pub reset_reg: Gas,
    pub reset_value: u8,
    pub arm_boot_arch: u16,
    pub fadt_minor_version: u8,
    pub x_firmware_ctrl: u64,
    pub x_dsdt: u64,
    pub x_pm1a_evt_blk: Gas,
    pub x_pm1b_evt_blk: Gas,
    pub x_pm1a_cnt_blk: Gas,
    pub x_pm1b_cnt_blk: Gas,
    pub x_pm2_cnt_blk: Gas,
    pub x_pm_tmr_blk: Gas,
    pub x_gpe0_blk: Gas,
    pub x_gpe1_blk: Gas,
}

/// `flags` bit 20: hardware-reduced ACPI.
pub const FADT_HW_REDUCED_ACPI: u32 = 1 << 20;

impl Fadt {
    /// Parse from a validated table image; fields past the table's
    /// declared length read as zero.
    pub fn from_bytes(bytes: &[u8]) -> Option<Fadt> {
        let header = SdtHeader::from_bytes(bytes)?;
        let length = (header.length as usize).min(bytes.len());

        let mut raw = [0u8; mem::size_of::<Fadt>()];
        let take = length.min(raw.len());
        raw[..take].copy_from_slice(&bytes[..take]);
        // SAFETY: plain-data packed struct, zero-padded.
        Some(unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const Fadt) })
    }

    pub fn hardware_reduced(&self) -> bool {
        self.flags & FADT_HW_REDUCED_ACPI != 0
    }

    /// The DSDT physical address, preferring a valid `x_dsdt`.
    pub fn dsdt_address(&self) -> u64 {
        let x_dsdt = self.x_dsdt;
        if x_dsdt != 0 && crate::memory::addr::is_canonical(x_dsdt) {
            return x_dsdt;
        }
        self.dsdt as u64
    }
}

/// Firmware ACPI Control Structure; holds the global lock dword.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Facs {
    pub signature: [u8; 4],
    pub length: u32,
    pub hardware_signature: u32,
    pub firmware_waking_vector: u32,
    pub global_lock: u32,
    pub flags: u32,
    pub x_firmware_waking_vector: u64,
    pub version: u8,
}

/// Byte offset of the global-lock dword inside the FACS.
pub const FACS_GLOBAL_LOCK_OFFSET: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sdt(signature: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let length = 36 + payload.len();
        let mut bytes = vec![0u8; length];
        bytes[..4].copy_from_slice(signature);
        bytes[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        bytes[36..].copy_from_slice(payload);
        // Fix up the checksum byte.
        let sum = checksum(&bytes);
        bytes[9] = bytes[9].wrapping_sub(sum);
        bytes
    }

    #[test]
    fn test_sdt_checksum() {
        let table = build_sdt(b"SSDT", &[1, 2, 3]);
        assert!(SdtHeader::validate(&table));

        let mut corrupt = table.clone();
        corrupt[37] ^= 0xFF;
        assert!(!SdtHeader::validate(&corrupt), "Flipped byte breaks the checksum");
    }

    #[test]
    fn test_rsdp_validation() {
        let mut bytes = [0u8; RSDP_V1_SIZE];
        bytes[..8].copy_from_slice(b"RSD PTR ");
        bytes[15] = 0; // revision 0
        bytes[16..20].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        let sum = checksum(&bytes);
        bytes[8] = bytes[8].wrapping_sub(sum);

        let rsdp = Rsdp::validate(&bytes).expect("valid v1 RSDP");
        assert_eq!({ rsdp.rsdt_address }, 0x1234_5678);

        let mut bad = bytes;
        bad[8] ^= 1;
        assert!(Rsdp::validate(&bad).is_none(), "Bad checksum rejected");

        let mut bad = bytes;
        bad[0] = b'X';
        assert!(Rsdp::validate(&bad).is_none(), "Bad signature rejected");
    }

    #[test]
    fn test_rsdp_v2_needs_extended_checksum() {
        let mut bytes = [0u8; RSDP_V2_SIZE];
        bytes[..8].copy_from_slice(b"RSD PTR ");
        bytes[15] = 2;
        bytes[24..32].copy_from_slice(&0xDEAD_0000u64.to_le_bytes());
        let sum = checksum(&bytes[..RSDP_V1_SIZE]);
        bytes[8] = bytes[8].wrapping_sub(sum);
        assert!(
            Rsdp::validate(&bytes).is_none(),
            "v2 table with bad extended checksum rejected"
        );

        let sum = checksum(&bytes[..RSDP_V2_SIZE]);
        bytes[32] = bytes[32].wrapping_sub(sum);
        let rsdp = Rsdp::validate(&bytes).expect("valid v2 RSDP");
        assert_eq!({ rsdp.xsdt_address }, 0xDEAD_0000);
    }

    #[test]
    fn test_fadt_short_table_zero_fills() {
        // A truncated FADT (classic 116-byte layout) still parses;
        // extended fields read as zero.
        let mut payload = vec![0u8; 80];
        payload[10..12].copy_from_slice(&9u16.to_le_bytes()); // sci_int at offset 46
        let table = build_sdt(b"FACP", &payload);
        let fadt = Fadt::from_bytes(&table).expect("parse");
        assert_eq!({ fadt.sci_int }, 9);
        assert_eq!({ fadt.x_dsdt }, 0);
        assert!(!fadt.hardware_reduced());
    }
}
