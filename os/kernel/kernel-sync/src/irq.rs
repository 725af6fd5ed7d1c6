//! Interrupt-flag control.

use core::sync::atomic::{AtomicBool, Ordering};

/// Control over hardware interrupt delivery on the calling core.
pub trait Irq {
    /// Whether interrupts are currently delivered.
    fn interrupts_enabled(&self) -> bool;

    /// Masks interrupt delivery (`cli`).
    fn disable_interrupts(&self);

    /// Unmasks interrupt delivery (`sti`).
    fn enable_interrupts(&self);
}

impl<T: Irq + ?Sized> Irq for &T {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        (**self).interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        (**self).disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        (**self).enable_interrupts();
    }
}

/// Interrupt flag held in memory.
///
/// Used wherever no hardware flag exists: host tests, and as the model of a
/// guest's virtual interrupt flag.
#[derive(Debug)]
pub struct FlagIrq {
    enabled: AtomicBool,
}

impl FlagIrq {
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }
}

impl Default for FlagIrq {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Irq for FlagIrq {
    fn interrupts_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn disable_interrupts(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    fn enable_interrupts(&self) {
        self.enabled.store(true, Ordering::Release);
    }
}

/// The CPU's `IF` flag.
///
/// # Safety & Privilege
///
/// Must only be used in ring 0 where `cli`/`sti` are permitted.
#[cfg(target_arch = "x86")]
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareIrq;

#[cfg(target_arch = "x86")]
impl Irq for HardwareIrq {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        let flags: u32;
        unsafe { core::arch::asm!("pushfd", "pop {}", out(reg) flags, options(preserves_flags)) }
        flags & (1 << 9) != 0
    }

    #[inline]
    fn disable_interrupts(&self) {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    }

    #[inline]
    fn enable_interrupts(&self) {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Not reentrant-aware; nested guards simply each restore what they saw. Use
/// [`LocalLock`](crate::LocalLock) where depth matters.
pub struct IrqGuard<'a, I: Irq + ?Sized> {
    irq: &'a I,
    were_enabled: bool,
}

impl<'a, I: Irq + ?Sized> IrqGuard<'a, I> {
    #[inline]
    #[must_use]
    pub fn new(irq: &'a I) -> Self {
        let were_enabled = irq.interrupts_enabled();
        if were_enabled {
            irq.disable_interrupts();
        }
        Self { irq, were_enabled }
    }
}

impl<I: Irq + ?Sized> Drop for IrqGuard<'_, I> {
    fn drop(&mut self) {
        if self.were_enabled {
            self.irq.enable_interrupts();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_previous_state() {
        let irq = FlagIrq::new(true);
        {
            let _g = IrqGuard::new(&irq);
            assert!(!irq.interrupts_enabled());
        }
        assert!(irq.interrupts_enabled());

        let off = FlagIrq::new(false);
        {
            let _g = IrqGuard::new(&off);
        }
        assert!(!off.interrupts_enabled());
    }
}
