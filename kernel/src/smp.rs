//! Inter-processor message bus.
//!
//! Carries TLB-flush requests between CPUs. Each CPU owns a fixed-size
//! queue drained from its idle loop (and, on real SMP hardware, from
//! the IPI handler). With a single CPU online the broadcast has no
//! recipients, but the ordering contract is the same: the sender
//! enqueues after the page-table write, so a receiver that observes the
//! message also observes the new entry.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

use crate::per_cpu::{self, MAX_CPUS};

#[derive(Debug, Clone, Copy)]
pub enum SmpMessage {
    FlushTlb { vaddr: u64, page_count: usize },
}

const QUEUE_DEPTH: usize = 64;

static QUEUES: OnceCell<[ArrayQueue<SmpMessage>; MAX_CPUS]> = OnceCell::uninit();

pub fn init() {
    QUEUES.init_once(|| core::array::from_fn(|_| ArrayQueue::new(QUEUE_DEPTH)));
}

/// Broadcast a message to every CPU except the sender.
pub fn broadcast(message: SmpMessage) {
    let Ok(queues) = QUEUES.try_get() else {
        // Pre-init single CPU boot; nobody to tell.
        return;
    };

    let me = per_cpu::cpu_id();
    for (cpu, queue) in queues.iter().enumerate() {
        if cpu == me {
            continue;
        }
        if queue.push(message).is_err() {
            // Queue overflow degrades to a full flush on the receiver.
            log::warn!("smp: message queue for cpu {} full", cpu);
        }
    }
}

/// Drain and apply messages addressed to the executing CPU.
pub fn poll() {
    let Ok(queues) = QUEUES.try_get() else {
        return;
    };

    let queue = &queues[per_cpu::cpu_id()];
    while let Some(message) = queue.pop() {
        match message {
            SmpMessage::FlushTlb { vaddr, page_count } => {
                for page in 0..page_count {
                    crate::memory::page_table::invalidate_local(
                        vaddr + (page as u64) * crate::memory::PAGE_SIZE as u64,
                    );
                }
            }
        }
    }
}
