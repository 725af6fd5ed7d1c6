//! # Runtime Configuration
//!
//! Tunables consumed by `Kernel::new`. All values have sane defaults via
//! [`KernelConfig::default_config`]; the boot stub may override them before
//! handing control over.

use log::LevelFilter;

/// Kernel-wide tunables.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Maximum number of concurrently running guest kernels. Bounds the
    /// delayed-interrupt multiplexer's listener table.
    pub max_guests: usize,

    /// Capacity of each guest's delayed (hardware-class) interrupt FIFO.
    /// Events arriving at a full queue are dropped.
    pub delayed_irq_capacity: usize,

    /// Delayed interrupts drained on a single return into a guest.
    pub delayed_irqs_per_return: usize,

    /// Exit status recorded for a guest terminated for misbehaving.
    pub guest_crash_status: i32,

    /// Timer period in milliseconds; one tick per period.
    pub timer_period_ms: u32,

    /// Capacity of a console's raw scan-code ring.
    pub keyboard_buffer_size: usize,

    /// Number of virtual consoles.
    pub consoles: usize,

    /// Default VGA attribute byte for new consoles.
    pub console_color: u8,

    /// Maximum level forwarded to the logger.
    pub log_level: LevelFilter,
}

impl KernelConfig {
    #[must_use]
    pub const fn default_config() -> Self {
        Self {
            max_guests: 4,
            delayed_irq_capacity: 32,
            delayed_irqs_per_return: 1,
            guest_crash_status: -2,
            timer_period_ms: 10,
            keyboard_buffer_size: 256,
            consoles: 4,
            console_color: 0x07,
            log_level: LevelFilter::Debug,
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::default_config()
    }
}
