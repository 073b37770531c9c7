//! Input event stream.
//!
//! HID decoding pushes events here from completion context; consumers
//! (the out-of-tree terminal stack) pop them at their leisure. The
//! queue is fixed-capacity and lock-free so the push side never blocks.

use conquer_once::spin::OnceCell;
use crossbeam_queue::ArrayQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// A key transition, identified by HID usage page + usage id.
    Key {
        usage_page: u16,
        usage_id: u16,
        pressed: bool,
    },
    /// Relative mouse motion with the current button mask.
    MouseMotion { dx: i32, dy: i32, buttons: u8 },
    MouseButton { button: u8, pressed: bool },
}

const QUEUE_DEPTH: usize = 256;

static EVENTS: OnceCell<ArrayQueue<InputEvent>> = OnceCell::uninit();

fn queue() -> &'static ArrayQueue<InputEvent> {
    EVENTS.get_or_init(|| ArrayQueue::new(QUEUE_DEPTH))
}

/// Push an event. Never blocks; drops the event when the queue is full.
pub fn push(event: InputEvent) {
    if queue().push(event).is_err() {
        log::warn!("input: event queue full, dropping {:?}", event);
    }
}

pub fn pop() -> Option<InputEvent> {
    queue().pop()
}

/// The queue is process-global; tests that drain it serialize on this.
#[cfg(test)]
pub static TEST_LOCK: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop_order() {
        let _guard = TEST_LOCK.lock();
        while pop().is_some() {}
        push(InputEvent::Key {
            usage_page: 7,
            usage_id: 4,
            pressed: true,
        });
        push(InputEvent::Key {
            usage_page: 7,
            usage_id: 4,
            pressed: false,
        });
        assert_eq!(
            pop(),
            Some(InputEvent::Key {
                usage_page: 7,
                usage_id: 4,
                pressed: true
            })
        );
        assert_eq!(
            pop(),
            Some(InputEvent::Key {
                usage_page: 7,
                usage_id: 4,
                pressed: false
            })
        );
        assert_eq!(pop(), None);
    }
}
