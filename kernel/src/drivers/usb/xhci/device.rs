//! xHCI device slots.
//!
//! A device owns its input/output contexts and one transfer ring per
//! configured endpoint. Control transfers busy-poll a completion TRB
//! published by the event handler (status dword last, store-release);
//! interrupt and bulk completions are delivered asynchronously to the
//! endpoint's data handler.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;

use crate::error::{KernelError, Result};
use crate::memory::dma::DmaRegion;
use crate::time::Deadline;

use super::super::descriptors::{
    self, descriptor_type, request, request_type, DeviceDescriptor, EndpointDescriptor,
    ParsedConfiguration, SetupPacket,
};
use super::super::SpeedClass;
use super::context::{
    encode_endpoint_context, encode_slot_context, endpoint_type, EndpointContextFields,
    InputContext, OutputContext, SlotContextFields,
};
use super::ring::{
    completion_code, trb_type, ProducerRing, Trb, TRB_CHAIN, TRB_IMMEDIATE_DATA,
    TRB_INTERRUPT_ON_SHORT, TRB_IOC,
};
use super::XhciController;

const TRANSFER_RING_TRBS: usize = 64;
const CONTROL_TIMEOUT_MS: u64 = 1000;

/// A completion TRB published from interrupt context. The status dword
/// (holding the completion code) is stored last with release
/// semantics; the waiter polls it with acquire loads, so every other
/// field is visible once the code is.
pub(super) struct CompletionSlot {
    parameter_lo: AtomicU32,
    parameter_hi: AtomicU32,
    status: AtomicU32,
    control: AtomicU32,
}

impl CompletionSlot {
    pub const fn new() -> Self {
        Self {
            parameter_lo: AtomicU32::new(0),
            parameter_hi: AtomicU32::new(0),
            status: AtomicU32::new(0),
            control: AtomicU32::new(0),
        }
    }

    pub fn clear(&self) {
        self.parameter_lo.store(0, Ordering::Relaxed);
        self.parameter_hi.store(0, Ordering::Relaxed);
        self.control.store(0, Ordering::Relaxed);
        self.status.store(0, Ordering::Release);
    }

    /// Publish from the event handler. `status` goes last.
    pub fn publish(&self, trb: &Trb) {
        self.parameter_lo.store(trb.parameter as u32, Ordering::Relaxed);
        self.parameter_hi
            .store((trb.parameter >> 32) as u32, Ordering::Relaxed);
        self.control.store(trb.control, Ordering::Relaxed);
        self.status.store(trb.status, Ordering::Release);
    }

    /// Busy-poll until the completion code is non-zero or `deadline`.
    pub fn wait(&self, deadline: Deadline) -> Result<Trb> {
        loop {
            let status = self.status.load(Ordering::Acquire);
            if status >> 24 != 0 {
                let parameter = self.parameter_lo.load(Ordering::Relaxed) as u64
                    | ((self.parameter_hi.load(Ordering::Relaxed) as u64) << 32);
                return Ok(Trb::new(
                    parameter,
                    status,
                    self.control.load(Ordering::Relaxed),
                ));
            }
            if deadline.is_expired() {
                return Err(KernelError::DeviceTimeout);
            }
            core::hint::spin_loop();
        }
    }
}

/// Callback invoked with the number of bytes an interrupt/bulk IN
/// transfer produced.
pub type DataHandler = Box<dyn Fn(usize) + Send + Sync>;

struct Endpoint {
    ring: ProducerRing,
    max_packet_size: u16,
    completion: Arc<CompletionSlot>,
    /// Expected byte count of the in-flight control transfer.
    transfer_count: AtomicUsize,
    data_handler: Option<DataHandler>,
}

pub struct XhciDevice {
    controller: Arc<XhciController>,
    slot_id: u8,
    port_id: u8,
    speed: SpeedClass,
    input_context: InputContext,
    #[allow(dead_code)]
    output_context: OutputContext,
    /// Endpoints indexed by DCI - 1 (DCI 1 = endpoint 0).
    endpoints: [Mutex<Option<Endpoint>>; 31],
    /// Scratch buffer for control transfer data stages.
    control_buffer: DmaRegion,
    /// Serializes control transfers on endpoint 0.
    control_lock: Mutex<()>,
}

impl XhciDevice {
    pub(super) fn create(
        controller: Arc<XhciController>,
        port_id: u8,
        slot_id: u8,
        speed: SpeedClass,
    ) -> Result<Arc<XhciDevice>> {
        let context_size = controller.context_size();
        let device = Arc::new(XhciDevice {
            input_context: InputContext::new(context_size)?,
            output_context: OutputContext::new(context_size)?,
            endpoints: [const { Mutex::new(None) }; 31],
            control_buffer: DmaRegion::create(512)?,
            control_lock: Mutex::new(()),
            controller,
            slot_id,
            port_id,
            speed,
        });
        Ok(device)
    }

    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub fn speed(&self) -> SpeedClass {
        self.speed
    }

    /// Address the device and read enough descriptors to know what it
    /// is: EP0 setup, AddressDevice (BSR=1 then BSR=0), the 8-byte
    /// device descriptor, and the max-packet-size fixup.
    pub(super) fn initialize(self: &Arc<Self>) -> Result<DeviceDescriptor> {
        let max_packet = self.speed.default_control_packet_size();

        let ep0_ring = ProducerRing::new(TRANSFER_RING_TRBS)?;
        let ep0_dequeue = ep0_ring.base_paddr() | u64::from(ep0_ring.cycle_state());

        *self.endpoints[0].lock() = Some(Endpoint {
            ring: ep0_ring,
            max_packet_size: max_packet,
            completion: Arc::new(CompletionSlot::new()),
            transfer_count: AtomicUsize::new(0),
            data_handler: None,
        });

        self.input_context.zero();
        // Add slot context and endpoint 0.
        self.input_context.set_add_context_flags(0b11);
        encode_slot_context(
            &mut self.input_context.slot(),
            &SlotContextFields {
                route_string: 0,
                speed: self.speed.speed_id(),
                context_entries: 1,
                root_hub_port: self.port_id,
                interrupter_target: 0,
            },
        );
        encode_endpoint_context(
            &mut self.input_context.endpoint(1),
            &EndpointContextFields {
                endpoint_type: endpoint_type::CONTROL,
                max_packet_size: max_packet,
                max_burst_size: 0,
                error_count: 3,
                interval: 0,
                tr_dequeue_pointer: ep0_dequeue,
                average_trb_length: 8,
                max_esit_payload: 0,
            },
        );

        self.controller
            .dcbaa_set(self.slot_id, self.output_context.paddr());

        // Some legacy devices want a BSR=1 request before the real one.
        for bsr in [true, false] {
            let mut trb = Trb::with_type(trb_type::ADDRESS_DEVICE);
            trb.parameter = self.input_context.paddr();
            trb.control |= (self.slot_id as u32) << 24;
            if bsr {
                trb.control |= 1 << 9;
            }
            self.controller.send_command(trb)?;
        }

        self.update_actual_max_packet_size()?;

        // Full 8-byte descriptor fetch told us the real max packet
        // size; now read the whole descriptor.
        let mut descriptor_bytes = [0u8; 18];
        self.get_descriptor(descriptor_type::DEVICE, 0, &mut descriptor_bytes)?;
        let descriptor =
            DeviceDescriptor::from_bytes(&descriptor_bytes).ok_or(KernelError::InvalidFormat)?;

        Ok(descriptor)
    }

    fn update_actual_max_packet_size(&self) -> Result<()> {
        let mut buffer = [0u8; 8];
        self.get_descriptor(descriptor_type::DEVICE, 0, &mut buffer)?;

        let is_usb3 = matches!(self.speed, SpeedClass::SuperSpeed);
        let new_max_packet: u16 = if is_usb3 {
            1u16 << buffer[7]
        } else {
            buffer[7] as u16
        };

        {
            let mut ep0 = self.endpoints[0].lock();
            let endpoint = ep0.as_mut().unwrap();
            if endpoint.max_packet_size == new_max_packet {
                return Ok(());
            }
            endpoint.max_packet_size = new_max_packet;

            self.input_context.zero();
            self.input_context.set_add_context_flags(0b11);
            encode_endpoint_context(
                &mut self.input_context.endpoint(1),
                &EndpointContextFields {
                    endpoint_type: endpoint_type::CONTROL,
                    max_packet_size: new_max_packet,
                    max_burst_size: 0,
                    error_count: 3,
                    interval: 0,
                    tr_dequeue_pointer: endpoint.ring.base_paddr()
                        | u64::from(endpoint.ring.cycle_state()),
                    average_trb_length: 8,
                    max_esit_payload: 0,
                },
            );
        }

        let mut trb = Trb::with_type(trb_type::EVALUATE_CONTEXT);
        trb.parameter = self.input_context.paddr();
        trb.control |= (self.slot_id as u32) << 24;
        self.controller.send_command(trb)?;

        log::debug!("xhci: slot {} max packet size {}", self.slot_id, new_max_packet);
        Ok(())
    }

    /// GET_DESCRIPTOR into `buffer`.
    pub fn get_descriptor(
        &self,
        kind: u8,
        index: u8,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let setup = SetupPacket {
            bm_request_type: request_type::DEVICE_TO_HOST
                | request_type::STANDARD
                | request_type::DEVICE,
            b_request: request::GET_DESCRIPTOR,
            w_value: ((kind as u16) << 8) | index as u16,
            w_index: 0,
            w_length: buffer.len() as u16,
        };
        let transferred = self.send_request(setup)?;
        let count = transferred.min(buffer.len());
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.control_buffer.as_ptr::<u8>(),
                buffer.as_mut_ptr(),
                count,
            );
        }
        Ok(count)
    }

    /// Read and parse the full configuration bundle.
    pub fn read_configuration(&self) -> Result<ParsedConfiguration> {
        let mut head = [0u8; 9];
        self.get_descriptor(descriptor_type::CONFIGURATION, 0, &mut head)?;
        let total = u16::from_le_bytes([head[2], head[3]]) as usize;
        if total < 9 || total > self.control_buffer.size() {
            return Err(KernelError::InvalidFormat);
        }

        let mut bytes = alloc::vec![0u8; total];
        self.get_descriptor(descriptor_type::CONFIGURATION, 0, &mut bytes)?;
        descriptors::parse_configuration(&bytes)
    }

    pub fn set_configuration(&self, value: u8) -> Result<()> {
        let setup = SetupPacket {
            bm_request_type: request_type::HOST_TO_DEVICE
                | request_type::STANDARD
                | request_type::DEVICE,
            b_request: request::SET_CONFIGURATION,
            w_value: value as u16,
            w_index: 0,
            w_length: 0,
        };
        self.send_request(setup)?;
        Ok(())
    }

    /// Issue a control transfer on endpoint 0. Data stages read into
    /// (or write from) the device's control scratch buffer. Returns
    /// the number of bytes transferred.
    pub fn send_request(&self, setup: SetupPacket) -> Result<usize> {
        let length = setup.w_length as usize;
        if length > self.control_buffer.size() {
            return Err(KernelError::InvalidInput);
        }

        let _control_guard = self.control_lock.lock();

        let completion;
        {
            let mut slot = self.endpoints[0].lock();
            let endpoint = slot.as_mut().ok_or(KernelError::NotFound)?;

            // Transfer type: 0 = no data, 2 = OUT data, 3 = IN data.
            let is_in = setup.bm_request_type & request_type::DEVICE_TO_HOST != 0;
            let transfer_type: u32 = if length == 0 {
                0
            } else if is_in {
                3
            } else {
                2
            };

            let mut setup_trb = Trb::with_type(trb_type::SETUP_STAGE);
            setup_trb.parameter = setup.as_u64();
            setup_trb.status = 8;
            setup_trb.control |= TRB_IMMEDIATE_DATA | (transfer_type << 16);
            endpoint.ring.push(setup_trb, false);

            // Data stage: one TRB per max-packet chunk, chained, with
            // short-packet interrupts.
            let max_packet = endpoint.max_packet_size as usize;
            let packet_count = length.div_ceil(max_packet.max(1));
            let mut offset = 0usize;
            let mut packets_done = 1usize;
            while offset < length {
                let chunk = max_packet.min(length - offset);
                let mut data_trb = Trb::with_type(trb_type::DATA_STAGE);
                data_trb.parameter = self.control_buffer.paddr() + offset as u64;
                let td_size = (packet_count - packets_done).min(31) as u32;
                data_trb.status = chunk as u32 | (td_size << 17);
                data_trb.control |= TRB_INTERRUPT_ON_SHORT;
                if is_in {
                    data_trb.control |= 1 << 16;
                }
                let chained = offset + chunk < length;
                if chained {
                    data_trb.control |= TRB_CHAIN;
                }
                endpoint.ring.push(data_trb, chained);
                offset += chunk;
                packets_done += 1;
            }

            // Status stage: direction opposite to the data stage, IN
            // when there was no data.
            let mut status_trb = Trb::with_type(trb_type::STATUS_STAGE);
            status_trb.control |= TRB_IOC;
            if !is_in || length == 0 {
                status_trb.control |= 1 << 16;
            }
            endpoint.ring.push(status_trb, false);

            endpoint.completion.clear();
            endpoint.transfer_count.store(length, Ordering::Relaxed);
            completion = endpoint.completion.clone();
        }

        self.controller.ring_doorbell(self.slot_id, 1);

        let event = completion.wait(Deadline::after_ms(CONTROL_TIMEOUT_MS))?;
        match event.completion_code() {
            completion_code::SUCCESS => {
                let slot = self.endpoints[0].lock();
                let endpoint = slot.as_ref().unwrap();
                Ok(endpoint.transfer_count.load(Ordering::Relaxed))
            }
            completion_code::SHORT_PACKET => {
                // Residual is against the in-flight stage; report what
                // actually arrived.
                let residual = event.transfer_length() as usize;
                let slot = self.endpoints[0].lock();
                let endpoint = slot.as_ref().unwrap();
                let expected = endpoint.transfer_count.load(Ordering::Relaxed);
                Ok(expected.saturating_sub(residual))
            }
            code => {
                log::warn!("xhci: control transfer completion code {}", code);
                Err(KernelError::DeviceTimeout)
            }
        }
    }

    /// Allocate a transfer ring for a declared endpoint, build its
    /// context, and publish it with ConfigureEndpoint. Interrupt and
    /// bulk IN endpoints take a data handler for async completions.
    pub fn configure_endpoint(
        &self,
        descriptor: &EndpointDescriptor,
        data_handler: Option<DataHandler>,
    ) -> Result<()> {
        let dci = descriptor.dci() as usize;
        if !(2..=31).contains(&dci) {
            return Err(KernelError::InvalidInput);
        }

        let kind = descriptor.transfer_kind();
        let ep_type = match (descriptor.is_in(), kind) {
            (false, 1) => endpoint_type::ISOCH_OUT,
            (false, 2) => endpoint_type::BULK_OUT,
            (false, 3) => endpoint_type::INTERRUPT_OUT,
            (true, 1) => endpoint_type::ISOCH_IN,
            (true, 2) => endpoint_type::BULK_IN,
            (true, 3) => endpoint_type::INTERRUPT_IN,
            _ => return Err(KernelError::NotSupported),
        };

        let is_bulk = kind == 2;
        let is_isoch = kind == 1;
        let max_packet = if is_bulk {
            descriptor.w_max_packet_size
        } else {
            descriptor.max_packet_size()
        };
        let max_burst = if is_bulk {
            0
        } else {
            ((descriptor.w_max_packet_size & 0x1800) >> 11) as u8
        };
        let max_esit = max_packet as u32 * (max_burst as u32 + 1);
        let interval = determine_interval(descriptor, self.speed);
        let error_count = if is_isoch { 0 } else { 3 };

        let ring = ProducerRing::new(TRANSFER_RING_TRBS)?;
        let dequeue = ring.base_paddr() | u64::from(ring.cycle_state());

        {
            let mut slot = self.endpoints[dci - 1].lock();
            if slot.is_some() {
                return Err(KernelError::AlreadyExists);
            }
            *slot = Some(Endpoint {
                ring,
                max_packet_size: max_packet,
                completion: Arc::new(CompletionSlot::new()),
                transfer_count: AtomicUsize::new(0),
                data_handler,
            });
        }

        // Context entries must cover the highest live endpoint.
        let mut last_valid_dci = dci;
        for i in (dci + 1)..=31 {
            if self.endpoints[i - 1].lock().is_some() {
                last_valid_dci = i;
            }
        }

        self.input_context.zero();
        self.input_context
            .set_add_context_flags((1 << dci) | 1);
        encode_slot_context(
            &mut self.input_context.slot(),
            &SlotContextFields {
                route_string: 0,
                speed: self.speed.speed_id(),
                context_entries: last_valid_dci as u8,
                root_hub_port: self.port_id,
                interrupter_target: 0,
            },
        );
        encode_endpoint_context(
            &mut self.input_context.endpoint(dci),
            &EndpointContextFields {
                endpoint_type: ep_type,
                max_packet_size: max_packet,
                max_burst_size: max_burst,
                error_count,
                interval: interval as u8,
                tr_dequeue_pointer: dequeue,
                average_trb_length: if kind == 0 { 8 } else { max_esit as u16 },
                max_esit_payload: max_esit,
            },
        );

        let mut trb = Trb::with_type(trb_type::CONFIGURE_ENDPOINT);
        trb.parameter = self.input_context.paddr();
        trb.control |= (self.slot_id as u32) << 24;
        self.controller.send_command(trb)?;

        Ok(())
    }

    /// Queue one Normal TRB on an interrupt/bulk endpoint and ring its
    /// doorbell. The completion arrives through the data handler.
    pub fn submit_transfer(&self, dci: u8, buffer_paddr: u64, length: usize) -> Result<()> {
        let mut slot = self.endpoints[dci as usize - 1].lock();
        let endpoint = slot.as_mut().ok_or(KernelError::NotFound)?;

        let mut trb = Trb::with_type(trb_type::NORMAL);
        trb.parameter = buffer_paddr;
        trb.status = length as u32;
        trb.control |= TRB_IOC | TRB_INTERRUPT_ON_SHORT;
        endpoint.ring.push(trb, false);
        drop(slot);

        self.controller.ring_doorbell(self.slot_id, dci as u32);
        Ok(())
    }

    /// Route a transfer event from the event handler.
    pub(super) fn on_transfer_event(&self, trb: &Trb) {
        let dci = trb.endpoint_id() as usize;
        if dci == 0 || dci > 31 {
            log::warn!("xhci: transfer event for invalid endpoint {}", dci);
            return;
        }

        let slot = self.endpoints[dci - 1].lock();
        let Some(endpoint) = slot.as_ref() else {
            log::warn!("xhci: transfer event for unconfigured endpoint {}", dci);
            return;
        };

        if let Some(handler) = &endpoint.data_handler {
            match trb.completion_code() {
                completion_code::SUCCESS | completion_code::SHORT_PACKET => {}
                completion_code::STALL => {
                    log::warn!("xhci: endpoint {} stalled", dci);
                    return;
                }
                code => {
                    log::warn!("xhci: endpoint {} completion code {}", dci, code);
                    return;
                }
            }

            // transferred = requested - residual, read back from the
            // completed TRB.
            let transferred = endpoint
                .ring
                .index_of_paddr(trb.parameter)
                .map(|index| {
                    let original = endpoint.ring.read_trb(index).status & 0xFF_FFFF;
                    original.saturating_sub(trb.transfer_length()) as usize
                })
                .unwrap_or(0);

            let handler = handler.as_ref();
            handler(transferred);
            return;
        }

        endpoint.completion.publish(trb);
    }

    /// Copy the head of the control scratch buffer out after a control
    /// IN transfer.
    pub fn copy_from_control_buffer(&self, out: &mut [u8]) {
        let count = out.len().min(self.control_buffer.size());
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.control_buffer.as_ptr::<u8>(),
                out.as_mut_ptr(),
                count,
            );
        }
    }

    pub(super) fn shutdown(&self) {
        let mut trb = Trb::with_type(trb_type::DISABLE_SLOT);
        trb.control |= (self.slot_id as u32) << 24;
        if let Err(err) = self.controller.send_command(trb) {
            log::warn!("xhci: could not disable slot {}: {}", self.slot_id, err);
        }
    }
}

/// xHCI interval encoding per USB 2.0 / 3.0 rules (xHCI 6.2.3.6).
fn determine_interval(descriptor: &EndpointDescriptor, speed: SpeedClass) -> u32 {
    let kind = descriptor.transfer_kind();
    let b_interval = descriptor.b_interval as u32;

    match speed {
        SpeedClass::HighSpeed if kind == 0 || kind == 2 => {
            // Control/bulk: maximum NAK rate.
            if b_interval == 0 {
                0
            } else {
                (31 - b_interval.leading_zeros()).min(15)
            }
        }
        SpeedClass::HighSpeed | SpeedClass::SuperSpeed => {
            if kind == 1 || kind == 3 {
                b_interval.saturating_sub(1).min(15)
            } else {
                0
            }
        }
        SpeedClass::FullSpeed if kind == 1 => (b_interval + 2).clamp(3, 18),
        SpeedClass::FullSpeed | SpeedClass::LowSpeed => {
            if kind == 1 || kind == 3 {
                if b_interval == 0 {
                    0
                } else {
                    (31 - (b_interval * 8).leading_zeros()).clamp(3, 10)
                }
            } else {
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_slot_publishes_status_last() {
        let slot = CompletionSlot::new();
        slot.clear();

        let event = Trb::new(
            0x1000,
            (completion_code::SUCCESS << 24) | 42,
            (trb_type::TRANSFER_EVENT << 10) | (1 << 24),
        );
        slot.publish(&event);

        let got = slot.wait(Deadline::after_ms(10)).unwrap();
        assert_eq!(got.completion_code(), completion_code::SUCCESS);
        assert_eq!(got.parameter, 0x1000);
        assert_eq!(got.slot_id(), 1);
    }

    #[test]
    fn test_completion_slot_times_out_when_empty() {
        let slot = CompletionSlot::new();
        slot.clear();
        assert_eq!(
            slot.wait(Deadline::after_ms(0)).unwrap_err(),
            KernelError::DeviceTimeout
        );
    }

    #[test]
    fn test_interval_encoding() {
        let mut descriptor = EndpointDescriptor {
            b_length: 7,
            b_descriptor_type: 5,
            b_endpoint_address: 0x81,
            bm_attributes: 0x03, // interrupt
            w_max_packet_size: 8,
            b_interval: 10,
        };

        // Low speed interrupt: ilog2(10 * 8) clamped to [3, 10].
        assert_eq!(determine_interval(&descriptor, SpeedClass::LowSpeed), 6);
        // High speed interrupt: bInterval - 1.
        assert_eq!(determine_interval(&descriptor, SpeedClass::HighSpeed), 9);

        descriptor.b_interval = 0;
        assert_eq!(determine_interval(&descriptor, SpeedClass::LowSpeed), 0);
    }
}
