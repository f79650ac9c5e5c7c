//! The `log` facade backend.
//!
//! Routes `log::info!` and friends to the serial console with a level
//! tag. On the host the records are dropped; tests run with the
//! standard harness's own capture anyway.

use log::{LevelFilter, Log, Metadata, Record};

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        crate::println!("[{:5}] {}: {}", record.level(), record.target(), record.args());
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        let _ = record;
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger;

/// Install the logger. Idempotent; the losing racer's error is ignored.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
