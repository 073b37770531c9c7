//! Per-CPU data.
//!
//! A fixed table indexed by CPU id. Only the bootstrap processor runs
//! today, but everything that is conceptually per-CPU (preempt count,
//! active page table) lives here so SMP bring-up does not have to chase
//! down globals.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const MAX_CPUS: usize = 16;

pub struct PerCpu {
    /// Non-zero while preemption is disabled on this CPU.
    preempt_count: AtomicU32,
    /// Physical address of the CR3 value this CPU last loaded.
    current_page_table: AtomicU64,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            preempt_count: AtomicU32::new(0),
            current_page_table: AtomicU64::new(0),
        }
    }
}

static CPUS: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// Id of the executing CPU. Single-processor for now.
#[inline]
pub fn cpu_id() -> usize {
    0
}

#[inline]
pub fn current() -> &'static PerCpu {
    &CPUS[cpu_id()]
}

pub fn preempt_disable() {
    current().preempt_count.fetch_add(1, Ordering::Relaxed);
}

pub fn preempt_enable() {
    let prev = current().preempt_count.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev != 0, "preempt_enable without matching disable");
}

pub fn preempt_count() -> u32 {
    current().preempt_count.load(Ordering::Relaxed)
}

/// Record the page table this CPU has loaded into CR3.
pub fn set_current_page_table(pml4_paddr: u64) {
    current().current_page_table.store(pml4_paddr, Ordering::Release);
}

pub fn current_page_table() -> u64 {
    current().current_page_table.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preempt_count_balance() {
        let before = preempt_count();
        preempt_disable();
        assert_eq!(preempt_count(), before + 1);
        preempt_enable();
        assert_eq!(preempt_count(), before);
    }
}
