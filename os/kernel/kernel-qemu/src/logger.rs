use crate::qemu_fmt::QemuSink;
use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` sink for the QEMU debug console.
pub struct QemuLogger {
    max_level: LevelFilter,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    #[must_use]
    pub const fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Install this logger. Call once during early init.
    ///
    /// # Errors
    /// Fails if a logger was already installed.
    pub fn init(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self)?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

/// Format `record` as `[LEVEL] target: message` plus a newline.
///
/// # Errors
/// Propagates errors of `out`.
pub fn write_record<W: fmt::Write>(out: &mut W, record: &Record<'_>) -> fmt::Result {
    writeln!(
        out,
        "[{}] {}: {}",
        record.level(),
        record.target(),
        record.args()
    )
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = write_record(&mut QemuSink, record);
    }

    fn flush(&self) {}
}
