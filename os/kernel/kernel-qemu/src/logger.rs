use crate::qemu_fmt::QemuSink;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing `"[LEVEL] target: message"` lines to the debug port.
///
/// Lives in a `static`; the level can be changed after installation.
pub struct QemuLogger {
    max_level: AtomicUsize,
}

impl QemuLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level: AtomicUsize::new(max_level as usize),
        }
    }

    /// Install as the global logger with `level`. Call once during early init.
    ///
    /// # Errors
    /// A logger was already installed.
    pub fn init(&'static self, level: LevelFilter) -> Result<(), SetLoggerError> {
        self.set_level(level);
        log::set_logger(self)?;
        log::set_max_level(level);
        Ok(())
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.max_level.store(level as usize, Ordering::Relaxed);
    }

    #[must_use]
    pub fn level(&self) -> LevelFilter {
        match self.max_level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Render one record the way it appears on the port.
pub(crate) fn format_record(out: &mut impl Write, record: &Record) -> fmt::Result {
    writeln!(out, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for QemuLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let _ = format_record(&mut QemuSink, record);
    }

    fn flush(&self) {}
}
