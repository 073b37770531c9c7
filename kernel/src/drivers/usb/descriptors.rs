//! Standard USB descriptors and configuration-bundle parsing.

use alloc::vec::Vec;
use core::mem;

use crate::error::{KernelError, Result};

pub mod descriptor_type {
    pub const DEVICE: u8 = 1;
    pub const CONFIGURATION: u8 = 2;
    pub const STRING: u8 = 3;
    pub const INTERFACE: u8 = 4;
    pub const ENDPOINT: u8 = 5;
    pub const HID: u8 = 0x21;
    pub const HID_REPORT: u8 = 0x22;
}

pub mod request_type {
    pub const DEVICE_TO_HOST: u8 = 0x80;
    pub const HOST_TO_DEVICE: u8 = 0x00;
    pub const STANDARD: u8 = 0x00;
    pub const CLASS: u8 = 0x20;
    pub const DEVICE: u8 = 0x00;
    pub const INTERFACE: u8 = 0x01;
}

pub mod request {
    pub const GET_DESCRIPTOR: u8 = 6;
    pub const SET_CONFIGURATION: u8 = 9;
    // HID class requests.
    pub const SET_PROTOCOL: u8 = 0x0B;
}

pub mod class_code {
    pub const HID: u8 = 0x03;
}

pub mod hid_subclass {
    pub const BOOT: u8 = 0x01;
}

/// An 8-byte control setup packet.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    /// The packet as the immediate-data parameter of a Setup Stage TRB.
    pub fn as_u64(&self) -> u64 {
        // SAFETY: the packet is exactly 8 plain bytes.
        unsafe { core::mem::transmute_copy(self) }
    }
}

const _: () = assert!(mem::size_of::<SetupPacket>() == 8);

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        self.b_endpoint_address & 0x80 != 0
    }

    pub fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0F
    }

    /// Device context index: `2 * number + direction_in`.
    pub fn dci(&self) -> u8 {
        self.endpoint_number() * 2 + u8::from(self.is_in())
    }

    pub fn transfer_kind(&self) -> u8 {
        self.bm_attributes & 0x03
    }

    pub fn max_packet_size(&self) -> u16 {
        self.w_max_packet_size & 0x07FF
    }
}

fn read_unaligned<T: Copy>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    // SAFETY: length checked; caller only instantiates packed
    // plain-data descriptor types.
    Some(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

impl DeviceDescriptor {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        read_unaligned(bytes)
    }
}

/// A parsed interface: its descriptor, endpoints, and any class
/// descriptors (HID descriptors included) that followed it.
pub struct ParsedInterface {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    pub class_descriptors: Vec<Vec<u8>>,
}

/// A parsed configuration bundle as returned by GET_DESCRIPTOR.
pub struct ParsedConfiguration {
    pub descriptor: ConfigurationDescriptor,
    pub interfaces: Vec<ParsedInterface>,
}

/// Walk the descriptor chain of a configuration bundle.
pub fn parse_configuration(bytes: &[u8]) -> Result<ParsedConfiguration> {
    let config: ConfigurationDescriptor =
        read_unaligned(bytes).ok_or(KernelError::InvalidFormat)?;
    if config.b_descriptor_type != descriptor_type::CONFIGURATION {
        return Err(KernelError::InvalidFormat);
    }

    let total = (config.w_total_length as usize).min(bytes.len());
    let mut interfaces: Vec<ParsedInterface> = Vec::new();

    let mut offset = config.b_length as usize;
    while offset + 2 <= total {
        let length = bytes[offset] as usize;
        let kind = bytes[offset + 1];
        if length < 2 || offset + length > total {
            return Err(KernelError::InvalidFormat);
        }
        let body = &bytes[offset..offset + length];

        match kind {
            descriptor_type::INTERFACE => {
                let descriptor: InterfaceDescriptor =
                    read_unaligned(body).ok_or(KernelError::InvalidFormat)?;
                interfaces.push(ParsedInterface {
                    descriptor,
                    endpoints: Vec::new(),
                    class_descriptors: Vec::new(),
                });
            }
            descriptor_type::ENDPOINT => {
                let descriptor: EndpointDescriptor =
                    read_unaligned(body).ok_or(KernelError::InvalidFormat)?;
                if let Some(interface) = interfaces.last_mut() {
                    interface.endpoints.push(descriptor);
                }
            }
            _ => {
                if let Some(interface) = interfaces.last_mut() {
                    interface.class_descriptors.push(body.to_vec());
                }
            }
        }

        offset += length;
    }

    Ok(ParsedConfiguration {
        descriptor: config,
        interfaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boot_keyboard_config() -> Vec<u8> {
        let mut bytes = Vec::new();
        // Configuration descriptor.
        bytes.extend_from_slice(&[9, 2, 0, 0, 1, 1, 0, 0xA0, 50]);
        // Interface: HID, boot subclass, keyboard protocol, 1 endpoint.
        bytes.extend_from_slice(&[9, 4, 0, 0, 1, 0x03, 0x01, 0x01, 0]);
        // HID class descriptor with one report descriptor of 63 bytes.
        bytes.extend_from_slice(&[9, 0x21, 0x11, 0x01, 0, 1, 0x22, 63, 0]);
        // Endpoint: interrupt IN 0x81, 8 bytes, interval 10.
        bytes.extend_from_slice(&[7, 5, 0x81, 0x03, 8, 0, 10]);
        let total = bytes.len() as u16;
        bytes[2..4].copy_from_slice(&total.to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_boot_keyboard_configuration() {
        let bytes = boot_keyboard_config();
        let config = parse_configuration(&bytes).expect("parse");
        assert_eq!(config.descriptor.b_num_interfaces, 1);
        assert_eq!(config.interfaces.len(), 1);

        let interface = &config.interfaces[0];
        assert_eq!(interface.descriptor.b_interface_class, class_code::HID);
        assert_eq!(interface.descriptor.b_interface_sub_class, hid_subclass::BOOT);
        assert_eq!(interface.endpoints.len(), 1);
        assert_eq!(interface.class_descriptors.len(), 1);
        assert_eq!(interface.class_descriptors[0][1], descriptor_type::HID);

        let endpoint = &interface.endpoints[0];
        assert!(endpoint.is_in());
        assert_eq!(endpoint.endpoint_number(), 1);
        assert_eq!(endpoint.dci(), 3, "EP1 IN has DCI 3");
        assert_eq!(endpoint.transfer_kind(), 3, "Interrupt endpoint");
        assert_eq!(endpoint.max_packet_size(), 8);
    }

    #[test]
    fn test_truncated_configuration_fails() {
        let mut bytes = boot_keyboard_config();
        // Claim a descriptor longer than the buffer.
        let len = bytes.len();
        bytes[len - 7] = 0x40;
        assert!(parse_configuration(&bytes).is_err());
    }

    #[test]
    fn test_setup_packet_immediate_encoding() {
        let packet = SetupPacket {
            bm_request_type: 0x80,
            b_request: request::GET_DESCRIPTOR,
            w_value: 0x0100,
            w_index: 0,
            w_length: 8,
        };
        let raw = packet.as_u64();
        assert_eq!(raw & 0xFF, 0x80);
        assert_eq!((raw >> 8) & 0xFF, 6);
        assert_eq!((raw >> 16) & 0xFFFF, 0x0100);
        assert_eq!((raw >> 48) & 0xFFFF, 8);
    }
}
