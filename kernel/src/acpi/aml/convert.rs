//! Node conversions.
//!
//! AML freely converts between integers, buffers and strings; field
//! units materialize into integers or buffers through the opregion
//! access path.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};

use super::namespace::Namespace;
use super::node::Node;
use super::opregion;

/// Allowed conversion targets, a bitmask.
pub const CONV_INTEGER: u8 = 1 << 0;
pub const CONV_BUFFER: u8 = 1 << 1;
pub const CONV_STRING: u8 = 1 << 2;

fn integer_to_hex_string(value: u64) -> String {
    format!("{:X}", value)
}

fn buffer_to_integer(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().take(8).enumerate() {
        value |= (b as u64) << (i * 8);
    }
    value
}

fn string_to_integer(text: &str) -> u64 {
    let trimmed = text.trim();
    let (digits, radix) = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(rest) => (rest, 16),
        None => (trimmed, 16),
    };
    let mut value = 0u64;
    for c in digits.chars() {
        let Some(digit) = c.to_digit(radix) else { break };
        value = value.wrapping_shl(4) | digit as u64;
    }
    value
}

/// Convert `node` to one of the `allowed` types.
///
/// A node already of an allowed type passes through unchanged. Field
/// units and buffer fields are read out through their access paths;
/// converting a field unit wider than 64 bits to an integer fails.
/// `max_bytes` caps the integer width (callers pass 8).
pub fn convert_node(
    ns: &mut Namespace,
    node: Node,
    allowed: u8,
    max_bytes: usize,
) -> Result<Node> {
    // Already acceptable?
    let matches = match &node {
        Node::Integer(_) => allowed & CONV_INTEGER != 0,
        Node::Buffer(_) => allowed & CONV_BUFFER != 0,
        Node::String(_) => allowed & CONV_STRING != 0,
        _ => false,
    };
    if matches {
        return Ok(node);
    }

    match node {
        Node::Integer(value) => {
            if allowed & CONV_BUFFER != 0 {
                return Ok(Node::buffer(value.to_le_bytes().to_vec()));
            }
            if allowed & CONV_STRING != 0 {
                return Ok(Node::string(&integer_to_hex_string(value)));
            }
            Err(KernelError::InvalidInput)
        }
        Node::Buffer(buffer) => {
            let bytes = buffer.lock().clone();
            if allowed & CONV_INTEGER != 0 {
                return Ok(Node::Integer(buffer_to_integer(&bytes)));
            }
            if allowed & CONV_STRING != 0 {
                let mut text = String::new();
                for (i, b) in bytes.iter().enumerate() {
                    if i > 0 {
                        text.push(',');
                    }
                    text.push_str(&format!("0x{:02X}", b));
                }
                return Ok(Node::string(&text));
            }
            Err(KernelError::InvalidInput)
        }
        Node::String(buffer) => {
            let bytes = buffer.lock().clone();
            if allowed & CONV_INTEGER != 0 {
                let text = String::from_utf8_lossy(&bytes);
                return Ok(Node::Integer(string_to_integer(&text)));
            }
            if allowed & CONV_BUFFER != 0 {
                let mut out: Vec<u8> = bytes;
                out.push(0);
                return Ok(Node::Buffer(super::node::make_buffer(out)));
            }
            Err(KernelError::InvalidInput)
        }
        Node::FieldUnit(field) => {
            let value = opregion::convert_from_field_unit(ns, &field, allowed, max_bytes)?;
            convert_node(ns, value, allowed, max_bytes)
        }
        Node::BufferField {
            buffer,
            bit_offset,
            bit_count,
        } => {
            if bit_count > 64 {
                return Err(KernelError::InvalidInput);
            }
            let bytes = buffer.lock();
            let value =
                opregion::read_bits_from_buffer(&bytes, bit_offset as usize, bit_count as usize);
            drop(bytes);
            convert_node(ns, Node::Integer(value), allowed, max_bytes)
        }
        other => {
            log::warn!("aml: cannot convert {} to mask {:#x}", other.type_name(), allowed);
            Err(KernelError::InvalidInput)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new()
    }

    #[test]
    fn test_integer_to_buffer() {
        let node = convert_node(&mut ns(), Node::Integer(0x1122334455667788), CONV_BUFFER, 8).unwrap();
        match node {
            Node::Buffer(buffer) => {
                assert_eq!(buffer.lock().as_slice(), &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
            }
            other => panic!("expected buffer, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_buffer_to_integer_le() {
        let node = convert_node(
            &mut ns(),
            Node::buffer(vec![0x0D, 0x0C, 0x0B, 0x0A]),
            CONV_INTEGER,
            8,
        )
        .unwrap();
        assert_eq!(node.as_integer(), Some(0x0A0B0C0D));
    }

    #[test]
    fn test_string_to_integer_hex() {
        let node = convert_node(&mut ns(), Node::string("1A2B"), CONV_INTEGER, 8).unwrap();
        assert_eq!(node.as_integer(), Some(0x1A2B));
    }

    #[test]
    fn test_passthrough_when_allowed() {
        let node = convert_node(&mut ns(), Node::Integer(42), CONV_INTEGER | CONV_BUFFER, 8).unwrap();
        assert_eq!(node.as_integer(), Some(42));
    }

    #[test]
    fn test_package_conversion_fails() {
        let package = Node::Package(alloc::sync::Arc::new(spin::Mutex::new(alloc::vec::Vec::new())));
        assert!(convert_node(&mut ns(), package, CONV_INTEGER, 8).is_err());
    }
}
