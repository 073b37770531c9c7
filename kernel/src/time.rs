//! Monotonic time.
//!
//! A 1 kHz tick driven by the PIT gives millisecond resolution, which
//! is all the hardware timeout paths need. Deadlines are absolute
//! monotonic timestamps so a preempted waiter does not extend its own
//! timeout.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS_MS: AtomicU64 = AtomicU64::new(0);

/// Called from the timer interrupt, once per millisecond.
pub fn tick() {
    TICKS_MS.fetch_add(1, Ordering::Relaxed);
}

/// Milliseconds since boot.
#[cfg(not(test))]
pub fn ms_since_boot() -> u64 {
    TICKS_MS.load(Ordering::Relaxed)
}

/// Host tests have no timer interrupt; fall back to the process clock.
#[cfg(test)]
pub fn ms_since_boot() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Busy-sleep for `ms` milliseconds.
pub fn sleep_ms(ms: u64) {
    let deadline = Deadline::after_ms(ms);
    while !deadline.is_expired() {
        #[cfg(all(target_arch = "x86_64", not(test)))]
        x86_64::instructions::hlt();
        #[cfg(any(not(target_arch = "x86_64"), test))]
        core::hint::spin_loop();
    }
}

/// An absolute monotonic timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at_ms: u64,
}

impl Deadline {
    pub fn after_ms(ms: u64) -> Self {
        Self {
            at_ms: ms_since_boot().saturating_add(ms),
        }
    }

    pub fn is_expired(&self) -> bool {
        ms_since_boot() >= self.at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_ordering() {
        let near = Deadline::after_ms(1);
        let far = Deadline::after_ms(10_000);
        assert!(near < far);
        assert!(!far.is_expired());
    }
}
