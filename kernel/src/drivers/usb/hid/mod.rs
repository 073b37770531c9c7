//! USB HID class support.
//!
//! The report descriptor is a little stack machine: global items
//! persist (with push/pop), local items reset after every main item,
//! and main items emit fields into the open collection. Received
//! reports decompose into those fields bit by bit; variable fields
//! deliver `(usage_page, usage + i, value)` per element, array fields
//! deliver the usage selected by the element's value.

pub mod keyboard;
pub mod mouse;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::memory::dma::DmaRegion;

use super::descriptors::{
    descriptor_type, hid_subclass, request, request_type, ParsedInterface, SetupPacket,
};
use super::xhci::device::XhciDevice;

/// Field kinds from main items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Input,
    Output,
    Feature,
}

/// One input/output/feature field (or a range of array elements).
#[derive(Debug, Clone)]
pub struct ReportField {
    pub kind: ReportKind,
    pub usage_page: u16,
    pub usage_id: u16,
    pub usage_minimum: u32,
    pub usage_maximum: u32,
    pub report_id: u8,
    pub report_size: u32,
    pub report_count: u32,
    pub logical_minimum: i64,
    pub logical_maximum: i64,
    pub physical_minimum: i64,
    pub physical_maximum: i64,
    /// Raw main-item data; bit 1 set means variable, clear means array.
    pub flags: u32,
}

impl ReportField {
    pub fn is_variable(&self) -> bool {
        self.flags & 0x02 != 0
    }
}

/// A collection with its nested entries.
#[derive(Debug, Clone)]
pub struct Collection {
    pub usage_page: u16,
    pub usage_id: u16,
    pub entries: Vec<CollectionEntry>,
}

#[derive(Debug, Clone)]
pub enum CollectionEntry {
    Collection(Collection),
    Field(ReportField),
}

#[derive(Debug, Clone, Default)]
struct GlobalState {
    usage_page: Option<u16>,
    logical_minimum: Option<i64>,
    logical_maximum_signed: Option<i64>,
    logical_maximum_unsigned: Option<i64>,
    physical_minimum: Option<i64>,
    physical_maximum: Option<i64>,
    report_id: Option<u8>,
    report_size: Option<u32>,
    report_count: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct LocalState {
    usage_stack: Vec<u32>,
    usage_minimum: Option<u32>,
    usage_maximum: Option<u32>,
}

/// Parse a report descriptor into top-level collections. The second
/// return is whether reports carry a leading report-id byte.
pub fn parse_report_descriptor(mut data: &[u8]) -> Result<(Vec<Collection>, bool)> {
    let mut global_stack: Vec<GlobalState> = Vec::new();
    let mut global = GlobalState::default();
    let mut local = LocalState::default();

    let mut result: Vec<Collection> = Vec::new();
    let mut open: Vec<Collection> = Vec::new();

    let mut one_has_report_id = false;
    let mut all_have_report_id = true;

    while !data.is_empty() {
        let prefix = data[0];
        let item_size = match prefix & 0x03 {
            0 => 0usize,
            1 => 1,
            2 => 2,
            _ => 4,
        };
        let item_type = (prefix >> 2) & 0x03;
        let item_tag = (prefix >> 4) & 0x0F;

        if data.len() < 1 + item_size {
            return Err(KernelError::NoData);
        }
        let payload = &data[1..1 + item_size];

        let unsigned_value = || -> u32 {
            let mut value = 0u32;
            for (i, &b) in payload.iter().enumerate() {
                value |= (b as u32) << (i * 8);
            }
            value
        };
        let signed_value = || -> i64 {
            match item_size {
                0 => 0,
                1 => payload[0] as i8 as i64,
                2 => i16::from_le_bytes([payload[0], payload[1]]) as i64,
                _ => i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as i64,
            }
        };

        match item_type {
            // Main items.
            0 => {
                match item_tag {
                    0b1000 | 0b1001 | 0b1011 => {
                        let kind = match item_tag {
                            0b1000 => ReportKind::Input,
                            0b1001 => ReportKind::Output,
                            _ => ReportKind::Feature,
                        };
                        let Some(collection) = open.last_mut() else {
                            log::warn!("hid: data item outside any collection");
                            return Err(KernelError::InvalidFormat);
                        };
                        emit_fields(
                            kind,
                            unsigned_value(),
                            &global,
                            &local,
                            &mut collection.entries,
                            &mut one_has_report_id,
                            &mut all_have_report_id,
                        )?;
                    }
                    0b1010 => {
                        // Collection.
                        if local.usage_stack.len() != 1 {
                            log::warn!("hid: collection needs exactly one usage");
                            return Err(KernelError::InvalidFormat);
                        }
                        let usage = local.usage_stack[0];
                        let usage_page = if usage >> 16 != 0 {
                            (usage >> 16) as u16
                        } else {
                            global.usage_page.unwrap_or(0)
                        };
                        if usage_page == 0 {
                            log::warn!("hid: collection without a usage page");
                            return Err(KernelError::InvalidFormat);
                        }
                        open.push(Collection {
                            usage_page,
                            usage_id: (usage & 0xFFFF) as u16,
                            entries: Vec::new(),
                        });
                    }
                    0b1100 => {
                        // End collection.
                        let Some(done) = open.pop() else {
                            log::warn!("hid: end collection without a collection");
                            return Err(KernelError::InvalidFormat);
                        };
                        match open.last_mut() {
                            Some(parent) => parent.entries.push(CollectionEntry::Collection(done)),
                            None => result.push(done),
                        }
                    }
                    _ => {
                        log::warn!("hid: reserved main item tag {:#b}", item_tag);
                        return Err(KernelError::InvalidFormat);
                    }
                }
                local = LocalState::default();
            }
            // Global items.
            1 => match item_tag {
                0b0000 => global.usage_page = Some(unsigned_value() as u16),
                0b0001 => global.logical_minimum = Some(signed_value()),
                0b0010 => {
                    global.logical_maximum_signed = Some(signed_value());
                    global.logical_maximum_unsigned = Some(unsigned_value() as i64);
                }
                0b0011 => global.physical_minimum = Some(signed_value()),
                0b0100 => global.physical_maximum = Some(signed_value()),
                0b0101 | 0b0110 => {
                    log::warn!("hid: units are not supported");
                    return Err(KernelError::NotSupported);
                }
                0b0111 => global.report_size = Some(unsigned_value()),
                0b1000 => {
                    let id = unsigned_value();
                    if id > 0xFF {
                        return Err(KernelError::InvalidFormat);
                    }
                    global.report_id = Some(id as u8);
                }
                0b1001 => global.report_count = Some(unsigned_value()),
                0b1010 => global_stack.push(global.clone()),
                0b1011 => {
                    global = global_stack.pop().ok_or(KernelError::InvalidFormat)?;
                }
                _ => {
                    log::warn!("hid: reserved global item tag {:#b}", item_tag);
                    return Err(KernelError::InvalidFormat);
                }
            },
            // Local items.
            2 => match item_tag {
                0b0000 => local.usage_stack.push(unsigned_value()),
                0b0001 => local.usage_minimum = Some(unsigned_value()),
                0b0010 => local.usage_maximum = Some(unsigned_value()),
                _ => {
                    log::warn!("hid: unsupported local item tag {:#b}", item_tag);
                    return Err(KernelError::NotSupported);
                }
            },
            _ => {
                log::warn!("hid: reserved item type");
                return Err(KernelError::InvalidFormat);
            }
        }

        data = &data[1 + item_size..];
    }

    if result.is_empty() {
        log::warn!("hid: no collection in report descriptor");
        return Err(KernelError::InvalidFormat);
    }
    if one_has_report_id != all_have_report_id {
        log::warn!("hid: only some reports have a report id");
        return Err(KernelError::InvalidFormat);
    }

    Ok((result, one_has_report_id))
}

#[allow(clippy::too_many_arguments)]
fn emit_fields(
    kind: ReportKind,
    item_data: u32,
    global: &GlobalState,
    local: &LocalState,
    entries: &mut Vec<CollectionEntry>,
    one_has_report_id: &mut bool,
    all_have_report_id: &mut bool,
) -> Result<()> {
    let report_size = global.report_size.ok_or(KernelError::InvalidFormat)?;
    let report_count = global.report_count.ok_or(KernelError::InvalidFormat)?;
    let usage_page = global.usage_page.ok_or(KernelError::InvalidFormat)?;

    if global.report_id.is_some() {
        *one_has_report_id = true;
    } else {
        *all_have_report_id = false;
    }

    let logical_minimum = global.logical_minimum.unwrap_or(0);
    // A logical maximum that would be negative under a signed read of
    // a field with a non-negative minimum is really unsigned.
    let logical_maximum = {
        let signed = global.logical_maximum_signed.unwrap_or(0);
        let unsigned = global.logical_maximum_unsigned.unwrap_or(0);
        if logical_minimum < 0 || signed >= 0 {
            signed
        } else {
            unsigned
        }
    };

    let (physical_minimum, physical_maximum) = match (global.physical_minimum, global.physical_maximum) {
        (Some(min), Some(max)) if min != 0 || max != 0 => (min, max),
        _ => (logical_minimum, logical_maximum),
    };

    let base = ReportField {
        kind,
        usage_page,
        usage_id: 0,
        usage_minimum: 0,
        usage_maximum: 0,
        report_id: global.report_id.unwrap_or(0),
        report_size,
        report_count,
        logical_minimum,
        logical_maximum,
        physical_minimum,
        physical_maximum,
        flags: item_data,
    };

    if local.usage_stack.is_empty() {
        let field = match (local.usage_minimum, local.usage_maximum) {
            (Some(minimum), Some(maximum)) => ReportField {
                usage_minimum: minimum,
                usage_maximum: maximum,
                ..base
            },
            (None, None) => ReportField {
                // Padding: no usages at all.
                logical_minimum: 0,
                logical_maximum: 0,
                physical_minimum: 0,
                physical_maximum: 0,
                ..base
            },
            _ => {
                log::warn!("hid: only one of usage minimum/maximum given");
                return Err(KernelError::InvalidFormat);
            }
        };
        entries.push(CollectionEntry::Field(field));
        return Ok(());
    }

    // Discrete usages: one field per stacked usage; the last one
    // absorbs the remaining report count.
    for (i, &usage) in local.usage_stack.iter().enumerate() {
        let count = if i + 1 < local.usage_stack.len() {
            1
        } else {
            report_count.saturating_sub(i as u32).max(1)
        };
        entries.push(CollectionEntry::Field(ReportField {
            usage_page: if usage >> 16 != 0 {
                (usage >> 16) as u16
            } else {
                usage_page
            },
            usage_id: (usage & 0xFFFF) as u16,
            report_count: count,
            ..base.clone()
        }));
    }

    Ok(())
}

/// Collect every Input field of a collection tree in declaration
/// order.
pub fn gather_input_fields(collection: &Collection, output: &mut Vec<ReportField>) {
    for entry in &collection.entries {
        match entry {
            CollectionEntry::Collection(inner) => gather_input_fields(inner, output),
            CollectionEntry::Field(field) => {
                if field.kind == ReportKind::Input {
                    output.push(field.clone());
                }
            }
        }
    }
}

/// Pull `bit_count` bits at `bit_offset` out of a report,
/// sign-extending when the field's logical minimum is negative.
pub fn extract_bits(data: &[u8], mut bit_offset: usize, mut bit_count: usize, as_unsigned: bool) -> i64 {
    if bit_offset >= data.len() * 8 {
        return 0;
    }
    if bit_offset + bit_count > data.len() * 8 {
        bit_count = data.len() * 8 - bit_offset;
    }

    let mut result: u32 = 0;
    let mut result_offset = 0usize;
    let total = bit_count;

    while result_offset < total {
        let byte = bit_offset / 8;
        let bit = bit_offset % 8;
        let count = (total - result_offset).min(8 - bit);
        let mask = (1u32 << count) - 1;

        result |= (((data[byte] >> bit) as u32) & mask) << result_offset;

        bit_offset += count;
        result_offset += count;
    }

    if !as_unsigned && total > 0 && result & (1 << (total - 1)) != 0 {
        let mask = if total >= 32 { u32::MAX } else { (1u32 << total) - 1 };
        return -(((!result) & mask) as i64 + 1);
    }

    result as i64
}

/// A decoded field delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Variable field element: usage and its scaled value.
    Variable {
        usage_page: u16,
        usage_id: u32,
        value: i64,
    },
    /// Array field element: the selected usage.
    Array { usage_page: u16, usage_id: u32 },
}

/// Decode one report against the input fields, invoking `sink` per
/// delivered element.
pub fn decode_report(
    fields: &[ReportField],
    data: &[u8],
    uses_report_id: bool,
    sink: &mut dyn FnMut(Delivery),
) {
    let (report_id, data) = if uses_report_id {
        if data.is_empty() {
            return;
        }
        (Some(data[0]), &data[1..])
    } else {
        (None, data)
    };

    let mut bit_offset = 0usize;
    for field in fields {
        if report_id.unwrap_or(field.report_id) != field.report_id {
            continue;
        }

        // Padding fields move the cursor without delivering.
        if field.usage_id == 0 && field.usage_minimum == 0 && field.usage_maximum == 0 {
            bit_offset += (field.report_size * field.report_count) as usize;
            continue;
        }

        for i in 0..field.report_count {
            let logical = extract_bits(
                data,
                bit_offset,
                field.report_size as usize,
                field.logical_minimum >= 0,
            );
            bit_offset += field.report_size as usize;

            if logical < field.logical_minimum || logical > field.logical_maximum {
                continue;
            }

            let physical = if field.logical_maximum == field.logical_minimum {
                field.physical_minimum
            } else {
                (field.physical_maximum - field.physical_minimum)
                    * (logical - field.logical_minimum)
                    / (field.logical_maximum - field.logical_minimum)
                    + field.physical_minimum
            };

            let usage_base = if field.usage_id != 0 {
                field.usage_id as u32
            } else {
                field.usage_minimum
            };

            if field.is_variable() {
                sink(Delivery::Variable {
                    usage_page: field.usage_page,
                    usage_id: usage_base + i,
                    value: physical,
                });
            } else {
                let usage = usage_base.wrapping_add(physical as u32);
                // Selector zero is the null usage: no event.
                if usage != 0 {
                    sink(Delivery::Array {
                        usage_page: field.usage_page,
                        usage_id: usage,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// Driver attach
// ---------------------------------------------------------------------

/// A device-level consumer of decoded report elements.
pub trait HidSink: Send + Sync {
    fn start_report(&self);
    fn handle_variable(&self, usage_page: u16, usage_id: u32, value: i64);
    fn handle_array(&self, usage_page: u16, usage_id: u32);
    fn stop_report(&self);
}

struct BoundCollection {
    fields: Vec<ReportField>,
    sink: Option<Arc<dyn HidSink>>,
}

/// Attach a HID driver to a configured interface: switch boot-subclass
/// devices to the report protocol, fetch and parse the report
/// descriptors, bind keyboard/mouse sinks, and start the interrupt IN
/// pipeline.
pub fn attach(device: Arc<XhciDevice>, interface: &ParsedInterface) -> Result<()> {
    // Boot-protocol devices are switched to the report protocol so the
    // descriptor describes what they send.
    if interface.descriptor.b_interface_sub_class == hid_subclass::BOOT {
        let setup = SetupPacket {
            bm_request_type: request_type::HOST_TO_DEVICE
                | request_type::CLASS
                | request_type::INTERFACE,
            b_request: request::SET_PROTOCOL,
            w_value: 1, // report protocol
            w_index: interface.descriptor.b_interface_number as u16,
            w_length: 0,
        };
        device.send_request(setup)?;
    }

    // The HID class descriptor lists the report descriptors and their
    // sizes.
    let hid_descriptor = interface
        .class_descriptors
        .iter()
        .find(|d| d.len() >= 6 && d[1] == descriptor_type::HID)
        .ok_or_else(|| {
            log::warn!("hid: interface carries no HID descriptor");
            KernelError::InvalidFormat
        })?;

    let num_descriptors = hid_descriptor[5] as usize;
    if hid_descriptor.len() < 6 + num_descriptors * 3 {
        log::warn!("hid: malformed HID descriptor");
        return Err(KernelError::InvalidFormat);
    }

    let mut collections = Vec::new();
    let mut uses_report_id = false;
    let mut report_index = 0u16;
    for i in 0..num_descriptors {
        let entry = &hid_descriptor[6 + i * 3..9 + i * 3];
        if entry[0] != descriptor_type::HID_REPORT {
            continue;
        }
        let length = u16::from_le_bytes([entry[1], entry[2]]) as usize;

        let mut bytes = alloc::vec![0u8; length];
        let setup = SetupPacket {
            bm_request_type: request_type::DEVICE_TO_HOST
                | request_type::STANDARD
                | request_type::INTERFACE,
            b_request: request::GET_DESCRIPTOR,
            w_value: ((descriptor_type::HID_REPORT as u16) << 8) | report_index,
            w_index: interface.descriptor.b_interface_number as u16,
            w_length: length as u16,
        };
        report_index += 1;

        let transferred = device.send_request(setup)?;
        if transferred < length {
            log::warn!("hid: short report descriptor ({}/{})", transferred, length);
            return Err(KernelError::InvalidFormat);
        }
        device.copy_from_control_buffer(&mut bytes);

        let (parsed, has_ids) = parse_report_descriptor(&bytes)?;
        uses_report_id |= has_ids;
        collections.extend(parsed);
    }

    if collections.is_empty() {
        log::warn!("hid: no collections for device");
        return Err(KernelError::InvalidFormat);
    }

    // Bind device sinks per top-level collection.
    let mut bound = Vec::new();
    for collection in &collections {
        let mut fields = Vec::new();
        gather_input_fields(collection, &mut fields);

        let sink: Option<Arc<dyn HidSink>> = if collection.usage_page == 0x01 {
            match collection.usage_id {
                0x02 => {
                    log::info!("hid: initialized a USB mouse");
                    Some(Arc::new(mouse::HidMouse::new()))
                }
                0x06 => {
                    log::info!("hid: initialized a USB keyboard");
                    Some(Arc::new(keyboard::HidKeyboard::new()))
                }
                other => {
                    log::warn!("hid: unsupported generic-desktop usage {:#x}", other);
                    None
                }
            }
        } else {
            None
        };

        bound.push(BoundCollection { fields, sink });
    }

    // Interrupt IN endpoint with the decode-and-rearm handler.
    let endpoint = interface
        .endpoints
        .iter()
        .find(|e| e.is_in() && e.transfer_kind() == 3)
        .ok_or_else(|| {
            log::warn!("hid: device has no interrupt IN endpoint");
            KernelError::InvalidInput
        })?;

    let buffer = DmaRegion::create(endpoint.max_packet_size() as usize)?;
    let buffer = Arc::new(buffer);
    let dci = endpoint.dci();

    let handler_device = device.clone();
    let handler_buffer = buffer.clone();
    let handler: Box<dyn Fn(usize) + Send + Sync> = Box::new(move |byte_count: usize| {
        let bytes = unsafe {
            core::slice::from_raw_parts(
                handler_buffer.as_ptr::<u8>(),
                byte_count.min(handler_buffer.size()),
            )
        };

        for collection in &bound {
            if let Some(sink) = &collection.sink {
                sink.start_report();
            }
            decode_report(&collection.fields, bytes, uses_report_id, &mut |delivery| {
                let Some(sink) = &collection.sink else { return };
                match delivery {
                    Delivery::Variable {
                        usage_page,
                        usage_id,
                        value,
                    } => sink.handle_variable(usage_page, usage_id, value),
                    Delivery::Array {
                        usage_page,
                        usage_id,
                    } => sink.handle_array(usage_page, usage_id),
                }
            });
            if let Some(sink) = &collection.sink {
                sink.stop_report();
            }
        }

        // Rearm the endpoint for the next report.
        let _ = handler_device.submit_transfer(
            dci,
            handler_buffer.paddr(),
            handler_buffer.size(),
        );
    });

    device.configure_endpoint(endpoint, Some(handler))?;
    device.submit_transfer(dci, buffer.paddr(), buffer.size())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The standard boot-keyboard report descriptor.
    pub(super) fn boot_keyboard_descriptor() -> Vec<u8> {
        vec![
            0x05, 0x01, // Usage Page (Generic Desktop)
            0x09, 0x06, // Usage (Keyboard)
            0xA1, 0x01, // Collection (Application)
            0x05, 0x07, //   Usage Page (Key Codes)
            0x19, 0xE0, //   Usage Minimum (224)
            0x29, 0xE7, //   Usage Maximum (231)
            0x15, 0x00, //   Logical Minimum (0)
            0x25, 0x01, //   Logical Maximum (1)
            0x75, 0x01, //   Report Size (1)
            0x95, 0x08, //   Report Count (8)
            0x81, 0x02, //   Input (Data, Variable) — modifiers
            0x95, 0x01, //   Report Count (1)
            0x75, 0x08, //   Report Size (8)
            0x81, 0x01, //   Input (Constant) — reserved byte
            0x95, 0x06, //   Report Count (6)
            0x75, 0x08, //   Report Size (8)
            0x15, 0x00, //   Logical Minimum (0)
            0x25, 0x65, //   Logical Maximum (101)
            0x05, 0x07, //   Usage Page (Key Codes)
            0x19, 0x00, //   Usage Minimum (0)
            0x29, 0x65, //   Usage Maximum (101)
            0x81, 0x00, //   Input (Data, Array) — keycodes
            0xC0, // End Collection
        ]
    }

    #[test]
    fn test_parse_boot_keyboard_descriptor() {
        let (collections, uses_report_id) =
            parse_report_descriptor(&boot_keyboard_descriptor()).unwrap();
        assert!(!uses_report_id);
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].usage_page, 0x01);
        assert_eq!(collections[0].usage_id, 0x06);

        let mut fields = Vec::new();
        gather_input_fields(&collections[0], &mut fields);
        assert_eq!(fields.len(), 3, "modifiers, padding, keycode array");
        assert!(fields[0].is_variable());
        assert_eq!(fields[0].report_count, 8);
        assert_eq!(fields[2].report_count, 6);
        assert!(!fields[2].is_variable());
        assert_eq!(fields[2].usage_maximum, 0x65);
    }

    #[test]
    fn test_boot_keyboard_single_keypress() {
        // Scenario: report 00 00 04 00 00 00 00 00 — the 'a' key.
        let (collections, uses_report_id) =
            parse_report_descriptor(&boot_keyboard_descriptor()).unwrap();
        let mut fields = Vec::new();
        gather_input_fields(&collections[0], &mut fields);

        let report = [0x00u8, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut array_deliveries = Vec::new();
        decode_report(&fields, &report, uses_report_id, &mut |delivery| {
            if let Delivery::Array {
                usage_page,
                usage_id,
            } = delivery
            {
                array_deliveries.push((usage_page, usage_id));
            }
        });

        assert_eq!(
            array_deliveries,
            vec![(0x07, 0x04)],
            "Exactly one array delivery: usage page 7, usage 4"
        );
    }

    #[test]
    fn test_extract_bits_signed_all_ones_is_minus_one() {
        // An N-bit signed field of all ones decodes to -1.
        for n in 1..=31usize {
            let data = [0xFFu8; 8];
            assert_eq!(extract_bits(&data, 3, n, false), -1, "width {}", n);
        }
    }

    #[test]
    fn test_extract_bits_unsigned() {
        let data = [0b1010_1100u8, 0b0000_0011];
        assert_eq!(extract_bits(&data, 2, 4, true), 0b1011);
        assert_eq!(extract_bits(&data, 6, 4, true), 0b1110, "Crosses a byte boundary");
    }

    #[test]
    fn test_variable_scaling() {
        // A field with logical [0, 100] and physical [0, 200] scales
        // linearly.
        let fields = [ReportField {
            kind: ReportKind::Input,
            usage_page: 0x01,
            usage_id: 0x30,
            usage_minimum: 0,
            usage_maximum: 0,
            report_id: 0,
            report_size: 8,
            report_count: 1,
            logical_minimum: 0,
            logical_maximum: 100,
            physical_minimum: 0,
            physical_maximum: 200,
            flags: 0x02,
        }];

        let mut seen = Vec::new();
        decode_report(&fields, &[50], false, &mut |delivery| seen.push(delivery));
        assert_eq!(
            seen,
            vec![Delivery::Variable {
                usage_page: 0x01,
                usage_id: 0x30,
                value: 100
            }]
        );
    }

    #[test]
    fn test_out_of_range_values_are_dropped() {
        let fields = [ReportField {
            kind: ReportKind::Input,
            usage_page: 0x07,
            usage_id: 0,
            usage_minimum: 0,
            usage_maximum: 101,
            report_id: 0,
            report_size: 8,
            report_count: 1,
            logical_minimum: 0,
            logical_maximum: 101,
            physical_minimum: 0,
            physical_maximum: 101,
            flags: 0,
        }];

        let mut seen = Vec::new();
        decode_report(&fields, &[0xFF], false, &mut |delivery| seen.push(delivery));
        assert!(seen.is_empty(), "255 is outside [0, 101]");
    }
}
