//! HID keyboard routing.
//!
//! Keyboards report the set of currently-held keys; comparing each
//! report with the previous one yields press and release transitions,
//! which go out as input events keyed by HID usage.

use alloc::vec::Vec;
use spin::Mutex;

use crate::input::{self, InputEvent};

use super::HidSink;

/// Keyboard usage page.
const USAGE_PAGE_KEYBOARD: u16 = 0x07;

/// Modifier usages 0xE0..=0xE7 arrive as variable fields.
const USAGE_MODIFIER_FIRST: u32 = 0xE0;
const USAGE_MODIFIER_LAST: u32 = 0xE7;

/// Usages 0 (none) and 1 (rollover error) never produce events.
const FIRST_REAL_USAGE: u32 = 0x04;

struct KeyboardState {
    current: Vec<u16>,
    previous: Vec<u16>,
    modifiers_current: u8,
    modifiers_previous: u8,
}

pub struct HidKeyboard {
    state: Mutex<KeyboardState>,
}

impl HidKeyboard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KeyboardState {
                current: Vec::new(),
                previous: Vec::new(),
                modifiers_current: 0,
                modifiers_previous: 0,
            }),
        }
    }
}

impl Default for HidKeyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl HidSink for HidKeyboard {
    fn start_report(&self) {
        let mut state = self.state.lock();
        state.current.clear();
        state.modifiers_current = 0;
    }

    fn handle_variable(&self, usage_page: u16, usage_id: u32, value: i64) {
        if usage_page != USAGE_PAGE_KEYBOARD {
            return;
        }
        if (USAGE_MODIFIER_FIRST..=USAGE_MODIFIER_LAST).contains(&usage_id) && value != 0 {
            let bit = usage_id - USAGE_MODIFIER_FIRST;
            self.state.lock().modifiers_current |= 1 << bit;
        }
    }

    fn handle_array(&self, usage_page: u16, usage_id: u32) {
        if usage_page != USAGE_PAGE_KEYBOARD || usage_id < FIRST_REAL_USAGE {
            return;
        }
        self.state.lock().current.push(usage_id as u16);
    }

    fn stop_report(&self) {
        let mut state = self.state.lock();

        // Presses: in current, not in previous.
        for i in 0..state.current.len() {
            let usage = state.current[i];
            if !state.previous.contains(&usage) {
                input::push(InputEvent::Key {
                    usage_page: USAGE_PAGE_KEYBOARD,
                    usage_id: usage,
                    pressed: true,
                });
            }
        }
        // Releases: in previous, not in current.
        for i in 0..state.previous.len() {
            let usage = state.previous[i];
            if !state.current.contains(&usage) {
                input::push(InputEvent::Key {
                    usage_page: USAGE_PAGE_KEYBOARD,
                    usage_id: usage,
                    pressed: false,
                });
            }
        }

        // Modifier transitions.
        let changed = state.modifiers_current ^ state.modifiers_previous;
        for bit in 0..8u32 {
            if changed & (1 << bit) == 0 {
                continue;
            }
            input::push(InputEvent::Key {
                usage_page: USAGE_PAGE_KEYBOARD,
                usage_id: (USAGE_MODIFIER_FIRST + bit) as u16,
                pressed: state.modifiers_current & (1 << bit) != 0,
            });
        }

        let current = core::mem::take(&mut state.current);
        state.previous = current;
        state.modifiers_previous = state.modifiers_current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_events() -> Vec<InputEvent> {
        let mut events = Vec::new();
        while let Some(event) = input::pop() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_press_and_release_transitions() {
        let _guard = input::TEST_LOCK.lock();
        drain_events();
        let keyboard = HidKeyboard::new();

        // Report 1: 'a' (usage 4) held.
        keyboard.start_report();
        keyboard.handle_array(0x07, 0x04);
        keyboard.stop_report();
        assert_eq!(
            drain_events(),
            vec![InputEvent::Key {
                usage_page: 0x07,
                usage_id: 0x04,
                pressed: true
            }]
        );

        // Report 2: still held — no new events.
        keyboard.start_report();
        keyboard.handle_array(0x07, 0x04);
        keyboard.stop_report();
        assert!(drain_events().is_empty(), "Held key repeats no event");

        // Report 3: released.
        keyboard.start_report();
        keyboard.stop_report();
        assert_eq!(
            drain_events(),
            vec![InputEvent::Key {
                usage_page: 0x07,
                usage_id: 0x04,
                pressed: false
            }]
        );
    }

    #[test]
    fn test_rollover_and_null_usages_ignored() {
        let _guard = input::TEST_LOCK.lock();
        drain_events();
        let keyboard = HidKeyboard::new();
        keyboard.start_report();
        keyboard.handle_array(0x07, 0x00);
        keyboard.handle_array(0x07, 0x01);
        keyboard.stop_report();
        assert!(drain_events().is_empty());
    }
}
