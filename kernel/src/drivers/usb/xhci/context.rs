//! xHCI device contexts.
//!
//! Slot and endpoint contexts are dword-packed hardware structures; a
//! context entry is 32 bytes, or 64 when the controller sets CSZ. The
//! input context prepends an input control context; the output context
//! (slot + 31 endpoints) is owned by the controller and published
//! through the DCBAA.

use crate::error::Result;
use crate::memory::dma::DmaRegion;

/// Endpoint types (endpoint context dword 1, bits 5:3).
pub mod endpoint_type {
    pub const ISOCH_OUT: u32 = 1;
    pub const BULK_OUT: u32 = 2;
    pub const INTERRUPT_OUT: u32 = 3;
    pub const CONTROL: u32 = 4;
    pub const ISOCH_IN: u32 = 5;
    pub const BULK_IN: u32 = 6;
    pub const INTERRUPT_IN: u32 = 7;
}

/// A view over one context entry (32 or 64 bytes) that encodes fields
/// dword by dword.
pub struct ContextView {
    base: *mut u32,
    size: usize,
}

impl ContextView {
    /// # Safety
    /// `base` must point at `size` writable bytes.
    pub unsafe fn new(base: *mut u8, size: usize) -> Self {
        Self {
            base: base as *mut u32,
            size,
        }
    }

    pub fn zero(&mut self) {
        unsafe { core::ptr::write_bytes(self.base as *mut u8, 0, self.size) };
    }

    pub fn read_dword(&self, index: usize) -> u32 {
        debug_assert!(index * 4 < self.size);
        unsafe { self.base.add(index).read_volatile() }
    }

    pub fn write_dword(&mut self, index: usize, value: u32) {
        debug_assert!(index * 4 < self.size);
        unsafe { self.base.add(index).write_volatile(value) };
    }

    pub fn or_dword(&mut self, index: usize, bits: u32) {
        let value = self.read_dword(index);
        self.write_dword(index, value | bits);
    }
}

/// Fields of the slot context.
pub struct SlotContextFields {
    pub route_string: u32,
    pub speed: u8,
    pub context_entries: u8,
    pub root_hub_port: u8,
    pub interrupter_target: u16,
}

pub fn encode_slot_context(view: &mut ContextView, fields: &SlotContextFields) {
    view.zero();
    // Dword 0: route string [19:0], speed [23:20], context entries [31:27].
    view.write_dword(
        0,
        (fields.route_string & 0xF_FFFF)
            | ((fields.speed as u32 & 0xF) << 20)
            | ((fields.context_entries as u32 & 0x1F) << 27),
    );
    // Dword 1: root hub port number [23:16].
    view.write_dword(1, (fields.root_hub_port as u32) << 16);
    // Dword 2: interrupter target [31:22].
    view.write_dword(2, (fields.interrupter_target as u32) << 22);
}

/// Fields of an endpoint context.
pub struct EndpointContextFields {
    pub endpoint_type: u32,
    pub max_packet_size: u16,
    pub max_burst_size: u8,
    pub error_count: u8,
    pub interval: u8,
    /// Dequeue pointer with the cycle state in bit 0.
    pub tr_dequeue_pointer: u64,
    pub average_trb_length: u16,
    pub max_esit_payload: u32,
}

pub fn encode_endpoint_context(view: &mut ContextView, fields: &EndpointContextFields) {
    view.zero();
    // Dword 0: interval [23:16].
    view.write_dword(0, (fields.interval as u32) << 16);
    // Dword 1: error count [2:1], endpoint type [5:3], max burst
    // [15:8], max packet size [31:16].
    view.write_dword(
        1,
        ((fields.error_count as u32 & 0x3) << 1)
            | ((fields.endpoint_type & 0x7) << 3)
            | ((fields.max_burst_size as u32) << 8)
            | ((fields.max_packet_size as u32) << 16),
    );
    // Dwords 2-3: TR dequeue pointer (bit 0 = dequeue cycle state).
    view.write_dword(2, fields.tr_dequeue_pointer as u32);
    view.write_dword(3, (fields.tr_dequeue_pointer >> 32) as u32);
    // Dword 4: average TRB length [15:0], max ESIT payload low [31:16].
    view.write_dword(
        4,
        (fields.average_trb_length as u32) | ((fields.max_esit_payload & 0xFFFF) << 16),
    );
}

/// The input context: input control context followed by slot context
/// and 31 endpoint contexts.
pub struct InputContext {
    region: DmaRegion,
    context_size: usize,
}

impl InputContext {
    pub fn new(context_size: usize) -> Result<Self> {
        assert!(context_size == 32 || context_size == 64);
        let region = DmaRegion::create(33 * context_size)?;
        Ok(Self {
            region,
            context_size,
        })
    }

    pub fn paddr(&self) -> u64 {
        self.region.paddr()
    }

    pub fn zero(&self) {
        self.region.zero();
    }

    fn entry(&self, index: usize) -> ContextView {
        unsafe {
            ContextView::new(
                (self.region.vaddr() as *mut u8).add(index * self.context_size),
                self.context_size,
            )
        }
    }

    /// Input control context: dword 1 holds the add-context flags.
    pub fn set_add_context_flags(&self, flags: u32) {
        let mut view = self.entry(0);
        view.write_dword(1, flags);
    }

    pub fn control(&self) -> ContextView {
        self.entry(0)
    }

    pub fn slot(&self) -> ContextView {
        self.entry(1)
    }

    /// Endpoint context by device context index (1 = EP0).
    pub fn endpoint(&self, dci: usize) -> ContextView {
        debug_assert!((1..=31).contains(&dci));
        self.entry(1 + dci)
    }
}

/// The controller-owned output context.
pub struct OutputContext {
    region: DmaRegion,
}

impl OutputContext {
    pub fn new(context_size: usize) -> Result<Self> {
        let region = DmaRegion::create(32 * context_size)?;
        Ok(Self { region })
    }

    pub fn paddr(&self) -> u64 {
        self.region.paddr()
    }
}

/// Device context base address array: 8 bytes per slot, entry 0 points
/// at the scratchpad array.
pub struct Dcbaa {
    region: DmaRegion,
}

impl Dcbaa {
    pub fn new(max_slots: usize) -> Result<Self> {
        let region = DmaRegion::create((max_slots + 1) * 8)?;
        Ok(Self { region })
    }

    pub fn paddr(&self) -> u64 {
        self.region.paddr()
    }

    pub fn set(&self, slot_id: u8, paddr: u64) {
        unsafe {
            self.region
                .as_ptr::<u64>()
                .add(slot_id as usize)
                .write_volatile(paddr)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_context_encoding() {
        let mut backing = [0u8; 32];
        let mut view = unsafe { ContextView::new(backing.as_mut_ptr(), 32) };
        encode_slot_context(
            &mut view,
            &SlotContextFields {
                route_string: 0x5,
                speed: 3,
                context_entries: 1,
                root_hub_port: 2,
                interrupter_target: 0,
            },
        );

        let dword0 = view.read_dword(0);
        assert_eq!(dword0 & 0xF_FFFF, 0x5, "route string");
        assert_eq!((dword0 >> 20) & 0xF, 3, "speed");
        assert_eq!(dword0 >> 27, 1, "context entries");
        assert_eq!((view.read_dword(1) >> 16) & 0xFF, 2, "root hub port");
    }

    #[test]
    fn test_endpoint_context_encoding() {
        let mut backing = [0u8; 32];
        let mut view = unsafe { ContextView::new(backing.as_mut_ptr(), 32) };
        encode_endpoint_context(
            &mut view,
            &EndpointContextFields {
                endpoint_type: endpoint_type::INTERRUPT_IN,
                max_packet_size: 8,
                max_burst_size: 0,
                error_count: 3,
                interval: 7,
                tr_dequeue_pointer: 0x12345000 | 1,
                average_trb_length: 8,
                max_esit_payload: 8,
            },
        );

        let dword1 = view.read_dword(1);
        assert_eq!((dword1 >> 1) & 0x3, 3, "error count");
        assert_eq!((dword1 >> 3) & 0x7, endpoint_type::INTERRUPT_IN, "type");
        assert_eq!(dword1 >> 16, 8, "max packet size");
        assert_eq!((view.read_dword(0) >> 16) & 0xFF, 7, "interval");
        assert_eq!(view.read_dword(2), 0x12345001, "dequeue pointer low + cycle");
    }

    #[test]
    fn test_dcbaa_slot_entries() {
        let dcbaa = Dcbaa::new(8).unwrap();
        dcbaa.set(1, 0xABCD_E000);
        let value = unsafe { dcbaa.region.as_ptr::<u64>().add(1).read() };
        assert_eq!(value, 0xABCD_E000);
    }
}
