//! ACPI embedded controller.
//!
//! ECs are discovered through `PNP0C09` devices; their command and
//! data ports come from the `_CRS` IO resource descriptors. The driver
//! speaks the standard command set (read 0x80 / write 0x81) with
//! IBF/OBF handshaking.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::time::Deadline;

use super::aml::AbsPath;

// EC status register bits.
const EC_STS_OBF: u8 = 1 << 0;
const EC_STS_IBF: u8 = 1 << 1;

// EC commands.
const EC_CMD_READ: u8 = 0x80;
const EC_CMD_WRITE: u8 = 0x81;

const EC_TIMEOUT_MS: u64 = 500;

pub struct EmbeddedController {
    scope: AbsPath,
    command_port: u16,
    data_port: u16,
    gpe: Option<u8>,
    lock: Mutex<()>,
}

static CONTROLLERS: Mutex<Vec<Arc<EmbeddedController>>> = Mutex::new(Vec::new());

/// Register a controller so OpRegion access can find it by its scope.
pub fn register(controller: Arc<EmbeddedController>) {
    CONTROLLERS.lock().push(controller);
}

pub fn find_by_scope(scope: &AbsPath) -> Option<Arc<EmbeddedController>> {
    CONTROLLERS
        .lock()
        .iter()
        .find(|controller| &controller.scope == scope)
        .cloned()
}

pub fn controller_count() -> usize {
    CONTROLLERS.lock().len()
}

#[cfg(not(test))]
fn port_in(port: u16) -> u8 {
    unsafe { x86_64::instructions::port::Port::<u8>::new(port).read() }
}

#[cfg(not(test))]
fn port_out(port: u16, value: u8) {
    unsafe { x86_64::instructions::port::Port::<u8>::new(port).write(value) }
}

#[cfg(test)]
fn port_in(_port: u16) -> u8 {
    0
}

#[cfg(test)]
fn port_out(_port: u16, _value: u8) {}

impl EmbeddedController {
    pub fn new(scope: AbsPath, command_port: u16, data_port: u16, gpe: Option<u8>) -> Self {
        Self {
            scope,
            command_port,
            data_port,
            gpe,
            lock: Mutex::new(()),
        }
    }

    pub fn scope(&self) -> &AbsPath {
        &self.scope
    }

    pub fn gpe(&self) -> Option<u8> {
        self.gpe
    }

    fn wait_input_empty(&self) -> Result<()> {
        let deadline = Deadline::after_ms(EC_TIMEOUT_MS);
        while port_in(self.command_port) & EC_STS_IBF != 0 {
            if deadline.is_expired() {
                return Err(KernelError::DeviceTimeout);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    fn wait_output_full(&self) -> Result<()> {
        let deadline = Deadline::after_ms(EC_TIMEOUT_MS);
        while port_in(self.command_port) & EC_STS_OBF == 0 {
            if deadline.is_expired() {
                return Err(KernelError::DeviceTimeout);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }

    pub fn read_byte(&self, address: u8) -> Result<u8> {
        let _guard = self.lock.lock();

        self.wait_input_empty()?;
        port_out(self.command_port, EC_CMD_READ);
        self.wait_input_empty()?;
        port_out(self.data_port, address);
        self.wait_output_full()?;
        Ok(port_in(self.data_port))
    }

    pub fn write_byte(&self, address: u8, value: u8) -> Result<()> {
        let _guard = self.lock.lock();

        self.wait_input_empty()?;
        port_out(self.command_port, EC_CMD_WRITE);
        self.wait_input_empty()?;
        port_out(self.data_port, address);
        self.wait_input_empty()?;
        port_out(self.data_port, value);
        self.wait_input_empty()?;
        Ok(())
    }
}

/// Pull the first two IO ports out of a `_CRS` resource buffer:
/// data port first, then command port.
pub fn parse_crs_io_ports(buffer: &[u8]) -> Result<(u16, u16)> {
    let mut cursor = buffer;
    let mut extract = || -> Result<u16> {
        let Some(&tag) = cursor.first() else {
            return Err(KernelError::NoData);
        };
        match tag {
            // IO Port Descriptor.
            0x47 => {
                if cursor.len() < 8 {
                    return Err(KernelError::NoData);
                }
                let decode_16 = cursor[1] & 1 != 0;
                let port = u16::from_le_bytes([cursor[2], cursor[3]]);
                cursor = &cursor[8..];
                Ok(port & if decode_16 { 0xFFFF } else { 0x03FF })
            }
            // Fixed Location IO Port Descriptor.
            0x4B => {
                if cursor.len() < 4 {
                    return Err(KernelError::NoData);
                }
                let port = u16::from_le_bytes([cursor[1], cursor[2]]);
                cursor = &cursor[4..];
                Ok(port & 0x03FF)
            }
            other => {
                log::warn!("acpi: unhandled _CRS resource descriptor {:#x}", other);
                Err(KernelError::InvalidFormat)
            }
        }
    };

    let data_port = extract()?;
    let command_port = extract()?;
    Ok((data_port, command_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crs_io_port_extraction() {
        // Two IO port descriptors: data 0x62, command 0x66, 16-bit
        // decode.
        let crs = [
            0x47, 0x01, 0x62, 0x00, 0x62, 0x00, 0x01, 0x01,
            0x47, 0x01, 0x66, 0x00, 0x66, 0x00, 0x01, 0x01,
            0x79, 0x00, // end tag (ignored: ports already found)
        ];
        let (data, command) = parse_crs_io_ports(&crs).unwrap();
        assert_eq!(data, 0x62);
        assert_eq!(command, 0x66);
    }

    #[test]
    fn test_crs_missing_ports() {
        assert!(parse_crs_io_ports(&[]).is_err());
    }

    #[test]
    fn test_registry_lookup_by_scope() {
        use super::super::aml::NameSeg;

        let scope = AbsPath::root().child(NameSeg::new("ECTE"));
        register(Arc::new(EmbeddedController::new(scope.clone(), 0x66, 0x62, Some(9))));

        let found = find_by_scope(&scope).expect("registered EC found");
        assert_eq!(found.gpe(), Some(9));
        assert!(find_by_scope(&AbsPath::root()).is_none());
    }
}
