//! Kernel tasks and thread blocking.
//!
//! Scheduling proper is outside this crate; what the subsystems need is
//! (a) a way to run periodic work (the xHCI port updater, the ACPI
//! event loop) and (b) a blocker that an interrupt handler can wake.
//!
//! Tasks are registered as poll functions and driven round-robin from
//! the boot CPU's idle loop. Each poll call is one iteration of what a
//! preemptive kernel would write as a dedicated thread's `loop` body.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::time::Deadline;

/// A flag a waiter can block on with a timeout and an interrupt handler
/// can trip.
pub struct ThreadBlocker {
    woken: AtomicBool,
}

impl ThreadBlocker {
    pub const fn new() -> Self {
        Self {
            woken: AtomicBool::new(false),
        }
    }

    /// Wait until [`unblock`](Self::unblock) is called or `timeout_ms`
    /// elapses. Returns `true` if woken, `false` on timeout.
    pub fn block_with_timeout_ms(&self, timeout_ms: u64) -> bool {
        let deadline = Deadline::after_ms(timeout_ms);
        loop {
            if self.woken.swap(false, Ordering::AcqRel) {
                return true;
            }
            if deadline.is_expired() {
                return false;
            }
            spin_loop();
        }
    }

    /// Consume a pending wake without waiting.
    pub fn take_pending(&self) -> bool {
        self.woken.swap(false, Ordering::AcqRel)
    }

    /// Wake the blocked task. Safe from interrupt context.
    pub fn unblock(&self) {
        self.woken.store(true, Ordering::Release);
    }
}

type TaskFn = Box<dyn FnMut() + Send>;

struct Task {
    name: &'static str,
    poll: TaskFn,
}

static TASKS: Mutex<Vec<Task>> = Mutex::new(Vec::new());

/// Register a kernel task. `poll` is invoked repeatedly from the idle
/// loop; it must not block for long.
pub fn spawn(name: &'static str, poll: TaskFn) {
    log::info!("task: spawned '{}'", name);
    TASKS.lock().push(Task { name, poll });
}

/// Run one round of every registered task.
pub fn poll_all() {
    let mut tasks = TASKS.lock();
    for task in tasks.iter_mut() {
        let _ = task.name;
        (task.poll)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocker_wake() {
        let blocker = ThreadBlocker::new();
        blocker.unblock();
        assert!(blocker.block_with_timeout_ms(0), "Pending wake should be consumed");
        assert!(!blocker.block_with_timeout_ms(0), "Second wait should time out");
    }
}
