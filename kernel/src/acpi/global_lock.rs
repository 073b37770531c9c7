//! The ACPI global lock.
//!
//! A dword in the FACS shared with firmware. Bit 0 is "pending", bit 1
//! is "owned"; both sides use compare-exchange to flip them. When no
//! FACS was found the lock degrades to a no-op, matching firmware that
//! does not use it.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

static LOCK_VADDR: AtomicU64 = AtomicU64::new(0);

const PENDING: u32 = 1 << 0;
const OWNED: u32 = 1 << 1;

/// Record the mapped address of the FACS global-lock dword.
pub fn set_lock_address(vaddr: u64) {
    LOCK_VADDR.store(vaddr, Ordering::Release);
}

fn lock_dword() -> Option<&'static AtomicU32> {
    let vaddr = LOCK_VADDR.load(Ordering::Acquire);
    if vaddr == 0 {
        return None;
    }
    // SAFETY: set_lock_address points at the mapped FACS dword, which
    // lives for the kernel's lifetime.
    Some(unsafe { &*(vaddr as *const AtomicU32) })
}

/// Acquire the global lock, spinning until firmware releases it.
pub fn acquire() {
    let Some(lock) = lock_dword() else { return };

    loop {
        let old = lock.load(Ordering::Acquire);
        let was_owned = old & OWNED != 0;
        let mut new = (old & !PENDING) | OWNED;
        if was_owned {
            new |= PENDING;
        }
        if lock
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            continue;
        }
        if !was_owned {
            return;
        }
        // Owned by firmware; we set pending, poll until released.
        core::hint::spin_loop();
    }
}

/// Release the global lock. Returns `true` if firmware was pending on
/// it (the caller then signals GBL_RLS).
pub fn release() -> bool {
    let Some(lock) = lock_dword() else {
        return false;
    };

    loop {
        let old = lock.load(Ordering::Acquire);
        let new = old & !(PENDING | OWNED);
        if lock
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return old & PENDING != 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_protocol_over_a_dword() {
        static DWORD: AtomicU32 = AtomicU32::new(0);
        set_lock_address(&DWORD as *const AtomicU32 as u64);

        acquire();
        assert_eq!(DWORD.load(Ordering::Relaxed) & OWNED, OWNED);
        assert!(!release(), "Nobody was pending");
        assert_eq!(DWORD.load(Ordering::Relaxed) & (OWNED | PENDING), 0);

        set_lock_address(0);
    }
}
