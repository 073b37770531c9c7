//! Raw spinlocks with preempt_count integration.
//!
//! Acquiring a spinlock disables preemption via the per-CPU
//! preempt_count; [`SpinLockIrq`] additionally disables interrupts on
//! the owning CPU, for locks that are taken from interrupt context.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_arch = "x86_64", not(test)))]
fn arch_interrupts_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

#[cfg(all(target_arch = "x86_64", not(test)))]
fn arch_set_interrupts(enable: bool) {
    if enable {
        x86_64::instructions::interrupts::enable();
    } else {
        x86_64::instructions::interrupts::disable();
    }
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn arch_interrupts_enabled() -> bool {
    false
}

#[cfg(any(not(target_arch = "x86_64"), test))]
fn arch_set_interrupts(_enable: bool) {}

/// A spinlock that disables preemption while held.
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire the lock, spinning until it is free.
    ///
    /// Preemption is disabled before the acquire attempt so the holder
    /// cannot be scheduled away while spinning threads wait.
    pub fn lock(&self) -> SpinLockGuard<'_> {
        #[cfg(target_arch = "x86_64")]
        crate::per_cpu::preempt_disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }

        SpinLockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinLockGuard<'_>> {
        #[cfg(target_arch = "x86_64")]
        crate::per_cpu::preempt_disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            #[cfg(target_arch = "x86_64")]
            crate::per_cpu::preempt_enable();
            None
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
        #[cfg(target_arch = "x86_64")]
        crate::per_cpu::preempt_enable();
    }
}

pub struct SpinLockGuard<'a> {
    lock: &'a SpinLock,
}

impl<'a> Drop for SpinLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

unsafe impl Sync for SpinLock {}
unsafe impl Send for SpinLock {}

/// A spinlock that also disables interrupts on the owning CPU.
pub struct SpinLockIrq {
    lock: SpinLock,
}

impl SpinLockIrq {
    pub const fn new() -> Self {
        Self {
            lock: SpinLock::new(),
        }
    }

    pub fn lock(&self) -> SpinLockIrqGuard<'_> {
        let irq_was_enabled = arch_interrupts_enabled();
        arch_set_interrupts(false);

        let _guard = self.lock.lock();
        core::mem::forget(_guard);

        SpinLockIrqGuard {
            lock: &self.lock,
            irq_was_enabled,
        }
    }
}

pub struct SpinLockIrqGuard<'a> {
    lock: &'a SpinLock,
    irq_was_enabled: bool,
}

impl<'a> Drop for SpinLockIrqGuard<'a> {
    fn drop(&mut self) {
        self.lock.unlock();
        if self.irq_was_enabled {
            arch_set_interrupts(true);
        }
    }
}

unsafe impl Sync for SpinLockIrq {}
unsafe impl Send for SpinLockIrq {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock() {
        let lock = SpinLock::new();
        let guard = lock.lock();
        assert!(lock.try_lock().is_none(), "Lock should be held");
        drop(guard);
        assert!(lock.try_lock().is_some(), "Lock should be free again");
    }

    #[test]
    fn test_irq_lock_nests_state() {
        let lock = SpinLockIrq::new();
        let guard = lock.lock();
        drop(guard);
        let guard = lock.lock();
        drop(guard);
    }
}
