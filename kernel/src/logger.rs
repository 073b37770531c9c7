//! Serial-backed implementation of the `log` facade.

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(target_arch = "x86_64")]
        crate::serial::_print(format_args!(
            "[{:>5}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
        #[cfg(not(target_arch = "x86_64"))]
        let _ = record;
    }

    fn flush(&self) {}
}

/// Install the serial logger. Called once, before anything logs.
pub fn init() {
    log::set_logger(&LOGGER).expect("Logger already set");
    log::set_max_level(LevelFilter::Info);
}

/// Raise or lower the global log level at runtime.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
