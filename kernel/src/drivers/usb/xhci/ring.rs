//! xHCI rings.
//!
//! Every ring is a contiguous array of 16-byte TRBs. Producer rings
//! (command and transfer) reserve the final slot for a Link TRB that
//! points back to the start with the toggle-cycle bit set; the
//! producer's cycle state flips on every wrap, and the consumer only
//! accepts TRBs whose cycle bit matches its expectation.

use crate::error::Result;
use crate::memory::dma::DmaRegion;

pub const TRB_SIZE: usize = 16;

/// TRB type codes (control bits 15:10).
pub mod trb_type {
    pub const NORMAL: u32 = 1;
    pub const SETUP_STAGE: u32 = 2;
    pub const DATA_STAGE: u32 = 3;
    pub const STATUS_STAGE: u32 = 4;
    pub const LINK: u32 = 6;
    pub const ENABLE_SLOT: u32 = 9;
    pub const DISABLE_SLOT: u32 = 10;
    pub const ADDRESS_DEVICE: u32 = 11;
    pub const CONFIGURE_ENDPOINT: u32 = 12;
    pub const EVALUATE_CONTEXT: u32 = 13;
    pub const STOP_ENDPOINT: u32 = 15;
    pub const SET_TR_DEQUEUE_POINTER: u32 = 16;
    pub const NOOP: u32 = 23;
    pub const TRANSFER_EVENT: u32 = 32;
    pub const COMMAND_COMPLETION: u32 = 33;
    pub const PORT_STATUS_CHANGE: u32 = 34;
    pub const BANDWIDTH_REQUEST: u32 = 35;
    pub const DOORBELL: u32 = 36;
    pub const HOST_CONTROLLER: u32 = 37;
    pub const DEVICE_NOTIFICATION: u32 = 38;
    pub const MFINDEX_WRAP: u32 = 39;
}

/// Completion codes (event status bits 31:24).
pub mod completion_code {
    pub const SUCCESS: u32 = 1;
    pub const STALL: u32 = 6;
    pub const ENDPOINT_NOT_ENABLED: u32 = 12;
    pub const SHORT_PACKET: u32 = 13;
}

// Control-word bits.
pub const TRB_CYCLE: u32 = 1 << 0;
pub const TRB_TOGGLE_CYCLE: u32 = 1 << 1;
pub const TRB_INTERRUPT_ON_SHORT: u32 = 1 << 2;
pub const TRB_CHAIN: u32 = 1 << 4;
pub const TRB_IOC: u32 = 1 << 5;
pub const TRB_IMMEDIATE_DATA: u32 = 1 << 6;

/// A 16-byte transfer request block.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const fn zeroed() -> Self {
        Trb {
            parameter: 0,
            status: 0,
            control: 0,
        }
    }

    pub fn new(parameter: u64, status: u32, control: u32) -> Self {
        Trb {
            parameter,
            status,
            control,
        }
    }

    /// Type field, control bits 15:10.
    pub fn trb_type(&self) -> u32 {
        (self.control >> 10) & 0x3F
    }

    pub fn with_type(trb_type: u32) -> Self {
        Trb {
            parameter: 0,
            status: 0,
            control: trb_type << 10,
        }
    }

    pub fn cycle(&self) -> bool {
        self.control & TRB_CYCLE != 0
    }

    /// Completion code of an event TRB.
    pub fn completion_code(&self) -> u32 {
        (self.status >> 24) & 0xFF
    }

    /// Residual transfer length of a transfer event.
    pub fn transfer_length(&self) -> u32 {
        self.status & 0xFF_FFFF
    }

    /// Slot id of an event TRB.
    pub fn slot_id(&self) -> u8 {
        ((self.control >> 24) & 0xFF) as u8
    }

    /// Endpoint id of a transfer event.
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }
}

/// A producer ring: the kernel enqueues, the controller consumes.
pub struct ProducerRing {
    region: DmaRegion,
    trb_count: usize,
    enqueue: usize,
    cycle: bool,
}

impl ProducerRing {
    pub fn new(trb_count: usize) -> Result<Self> {
        assert!(trb_count >= 2);
        let region = DmaRegion::create(trb_count * TRB_SIZE)?;
        Ok(Self {
            region,
            trb_count,
            enqueue: 0,
            cycle: true,
        })
    }

    pub fn base_paddr(&self) -> u64 {
        self.region.paddr()
    }

    /// The producer cycle state the controller must be told about
    /// (CRCR / endpoint context dequeue cycle).
    pub fn cycle_state(&self) -> bool {
        self.cycle
    }

    pub fn enqueue_index(&self) -> usize {
        self.enqueue
    }

    pub fn trb_count(&self) -> usize {
        self.trb_count
    }

    fn trb_ptr(&self, index: usize) -> *mut Trb {
        debug_assert!(index < self.trb_count);
        unsafe { self.region.as_ptr::<Trb>().add(index) }
    }

    /// Index of the TRB at physical address `paddr`.
    pub fn index_of_paddr(&self, paddr: u64) -> Option<usize> {
        if paddr < self.region.paddr() {
            return None;
        }
        let index = ((paddr - self.region.paddr()) as usize) / TRB_SIZE;
        (index < self.trb_count).then_some(index)
    }

    /// Read back a TRB previously pushed (for residual math on
    /// transfer events).
    pub fn read_trb(&self, index: usize) -> Trb {
        unsafe { self.trb_ptr(index).read_volatile() }
    }

    /// Write `trb` at the enqueue position with the producer's cycle
    /// bit and advance. Wrapping writes a Link TRB with toggle-cycle
    /// (chained when `chain_link`) and flips the cycle state.
    ///
    /// Returns the physical address of the written TRB.
    pub fn push(&mut self, trb: Trb, chain_link: bool) -> u64 {
        let index = self.enqueue;
        let paddr = self.region.paddr() + (index * TRB_SIZE) as u64;

        let control = (trb.control & !TRB_CYCLE) | if self.cycle { TRB_CYCLE } else { 0 };
        unsafe {
            let ptr = self.trb_ptr(index);
            // The cycle bit goes last so the controller never sees a
            // half-written TRB as owned.
            core::ptr::addr_of_mut!((*ptr).parameter).write_volatile(trb.parameter);
            core::ptr::addr_of_mut!((*ptr).status).write_volatile(trb.status);
            core::ptr::addr_of_mut!((*ptr).control).write_volatile(control);
        }

        self.enqueue += 1;
        if self.enqueue == self.trb_count - 1 {
            // Last usable slot consumed; plant the Link TRB.
            let mut link = Trb::with_type(trb_type::LINK);
            link.parameter = self.region.paddr();
            link.control |= TRB_TOGGLE_CYCLE;
            if chain_link {
                link.control |= TRB_CHAIN;
            }
            let link_control =
                (link.control & !TRB_CYCLE) | if self.cycle { TRB_CYCLE } else { 0 };
            unsafe {
                let ptr = self.trb_ptr(self.trb_count - 1);
                core::ptr::addr_of_mut!((*ptr).parameter).write_volatile(link.parameter);
                core::ptr::addr_of_mut!((*ptr).status).write_volatile(0);
                core::ptr::addr_of_mut!((*ptr).control).write_volatile(link_control);
            }
            self.enqueue = 0;
            self.cycle = !self.cycle;
        }

        paddr
    }
}

/// The event ring: the controller produces, the kernel consumes.
pub struct EventRing {
    region: DmaRegion,
    trb_count: usize,
    dequeue: usize,
    cycle: bool,
}

impl EventRing {
    pub fn new(trb_count: usize) -> Result<Self> {
        let region = DmaRegion::create(trb_count * TRB_SIZE)?;
        Ok(Self {
            region,
            trb_count,
            dequeue: 0,
            cycle: true,
        })
    }

    pub fn base_paddr(&self) -> u64 {
        self.region.paddr()
    }

    pub fn trb_count(&self) -> usize {
        self.trb_count
    }

    /// Physical address of the current dequeue slot, for ERDP.
    pub fn dequeue_paddr(&self) -> u64 {
        self.region.paddr() + (self.dequeue * TRB_SIZE) as u64
    }

    /// Consume the next event whose cycle matches; `None` when the
    /// ring is drained. The consumer cycle flips on wrap.
    pub fn pop(&mut self) -> Option<Trb> {
        let trb = unsafe {
            self.region
                .as_ptr::<Trb>()
                .add(self.dequeue)
                .read_volatile()
        };
        if trb.cycle() != self.cycle {
            return None;
        }

        self.dequeue += 1;
        if self.dequeue == self.trb_count {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }

        Some(trb)
    }

    /// Test-only handle for simulating controller-side writes.
    #[cfg(test)]
    pub fn raw_slot(&self, index: usize) -> *mut Trb {
        unsafe { self.region.as_ptr::<Trb>().add(index) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake consumer that follows the producer protocol: matches the
    /// cycle bit and follows Link TRBs, flipping its expectation on
    /// toggle-cycle.
    struct FakeConsumer {
        dequeue: usize,
        cycle: bool,
    }

    impl FakeConsumer {
        fn new() -> Self {
            Self {
                dequeue: 0,
                cycle: true,
            }
        }

        fn consume(&mut self, ring: &ProducerRing) -> Option<Trb> {
            loop {
                let trb = ring.read_trb(self.dequeue);
                if trb.cycle() != self.cycle {
                    return None;
                }
                if trb.trb_type() == trb_type::LINK {
                    // Follow the link; TC=1 flips the expected cycle.
                    assert_eq!(trb.parameter, ring.base_paddr());
                    if trb.control & TRB_TOGGLE_CYCLE != 0 {
                        self.cycle = !self.cycle;
                    }
                    self.dequeue = 0;
                    continue;
                }
                self.dequeue += 1;
                return Some(trb);
            }
        }
    }

    #[test]
    fn test_producer_cycle_protocol_across_wrap() {
        // 4 slots: 3 usable + Link. Push enough TRBs to wrap twice and
        // verify the consumer sees every TRB exactly once, in order.
        let mut ring = ProducerRing::new(4).unwrap();
        let mut consumer = FakeConsumer::new();

        for value in 0..8u64 {
            ring.push(
                Trb::new(value, 0, trb_type::NORMAL << 10),
                false,
            );
            let seen = consumer
                .consume(&ring)
                .expect("consumer must see the pushed TRB");
            assert_eq!(seen.parameter, value);
            assert_eq!(seen.trb_type(), trb_type::NORMAL);
            assert!(
                consumer.consume(&ring).is_none(),
                "No phantom TRBs after draining"
            );
        }
    }

    #[test]
    fn test_consumer_ignores_stale_trbs() {
        let mut ring = ProducerRing::new(4).unwrap();
        let mut consumer = FakeConsumer::new();

        // Push and consume a full lap (3 TRBs -> wrap, cycle flips).
        for value in 0..3u64 {
            ring.push(Trb::new(value, 0, trb_type::NORMAL << 10), false);
        }
        for _ in 0..3 {
            consumer.consume(&ring).expect("first lap");
        }

        // The slots still hold lap-one TRBs with the old cycle bit;
        // the consumer must not re-deliver them.
        assert!(consumer.consume(&ring).is_none());
    }

    #[test]
    fn test_event_ring_wrap_flips_cycle() {
        let mut ring = EventRing::new(2).unwrap();

        // Controller writes lap one with cycle=1.
        for i in 0..2 {
            unsafe {
                ring.raw_slot(i).write(Trb::new(
                    i as u64,
                    0,
                    (trb_type::PORT_STATUS_CHANGE << 10) | TRB_CYCLE,
                ))
            };
        }
        assert_eq!(ring.pop().unwrap().parameter, 0);
        assert_eq!(ring.pop().unwrap().parameter, 1);

        // Stale lap-one TRBs are not re-read after the wrap.
        assert!(ring.pop().is_none(), "Cycle flipped; old TRBs stale");

        // Lap two is written with cycle=0 and is accepted.
        unsafe {
            ring.raw_slot(0)
                .write(Trb::new(7, 0, trb_type::PORT_STATUS_CHANGE << 10))
        };
        assert_eq!(ring.pop().unwrap().parameter, 7);
    }

    #[test]
    fn test_push_returns_trb_paddr() {
        let mut ring = ProducerRing::new(8).unwrap();
        let first = ring.push(Trb::with_type(trb_type::NOOP), false);
        let second = ring.push(Trb::with_type(trb_type::NOOP), false);
        assert_eq!(second - first, TRB_SIZE as u64);
        assert_eq!(ring.index_of_paddr(first), Some(0));
        assert_eq!(ring.index_of_paddr(second), Some(1));
    }
}
