//! HID mouse routing.
//!
//! Accumulates the variable fields of one report (X/Y displacement,
//! buttons, wheel) and emits a single motion event when the report
//! ends.

use spin::Mutex;

use crate::input::{self, InputEvent};

use super::HidSink;

const USAGE_PAGE_GENERIC_DESKTOP: u16 = 0x01;
const USAGE_PAGE_BUTTON: u16 = 0x09;

const USAGE_X: u32 = 0x30;
const USAGE_Y: u32 = 0x31;
const USAGE_WHEEL: u32 = 0x38;

#[derive(Default)]
struct MouseState {
    dx: i32,
    dy: i32,
    wheel: i32,
    buttons: u8,
    previous_buttons: u8,
}

pub struct HidMouse {
    state: Mutex<MouseState>,
}

impl HidMouse {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MouseState::default()),
        }
    }
}

impl Default for HidMouse {
    fn default() -> Self {
        Self::new()
    }
}

impl HidSink for HidMouse {
    fn start_report(&self) {
        let mut state = self.state.lock();
        state.dx = 0;
        state.dy = 0;
        state.wheel = 0;
        state.buttons = 0;
    }

    fn handle_variable(&self, usage_page: u16, usage_id: u32, value: i64) {
        let mut state = self.state.lock();
        match (usage_page, usage_id) {
            (USAGE_PAGE_GENERIC_DESKTOP, USAGE_X) => state.dx = value as i32,
            (USAGE_PAGE_GENERIC_DESKTOP, USAGE_Y) => state.dy = value as i32,
            (USAGE_PAGE_GENERIC_DESKTOP, USAGE_WHEEL) => state.wheel = value as i32,
            (USAGE_PAGE_BUTTON, button @ 1..=8) => {
                if value != 0 {
                    state.buttons |= 1 << (button - 1);
                }
            }
            _ => {}
        }
    }

    fn handle_array(&self, _usage_page: u16, _usage_id: u32) {}

    fn stop_report(&self) {
        let mut state = self.state.lock();

        if state.dx != 0 || state.dy != 0 || state.buttons != state.previous_buttons {
            input::push(InputEvent::MouseMotion {
                dx: state.dx,
                dy: state.dy,
                buttons: state.buttons,
            });
        }

        let changed = state.buttons ^ state.previous_buttons;
        for bit in 0..8u8 {
            if changed & (1 << bit) == 0 {
                continue;
            }
            input::push(InputEvent::MouseButton {
                button: bit + 1,
                pressed: state.buttons & (1 << bit) != 0,
            });
        }

        state.previous_buttons = state.buttons;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_event_from_report() {
        let _guard = input::TEST_LOCK.lock();
        while input::pop().is_some() {}

        let mouse = HidMouse::new();
        mouse.start_report();
        mouse.handle_variable(0x01, USAGE_X, 5);
        mouse.handle_variable(0x01, USAGE_Y, -3);
        mouse.handle_variable(0x09, 1, 1);
        mouse.stop_report();

        let mut saw_motion = false;
        let mut saw_button = false;
        while let Some(event) = input::pop() {
            match event {
                InputEvent::MouseMotion { dx, dy, buttons } => {
                    assert_eq!((dx, dy, buttons), (5, -3, 1));
                    saw_motion = true;
                }
                InputEvent::MouseButton { button, pressed } => {
                    assert_eq!((button, pressed), (1, true));
                    saw_button = true;
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert!(saw_motion && saw_button);
    }
}
