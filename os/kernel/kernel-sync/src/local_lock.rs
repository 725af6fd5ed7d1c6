use crate::Irq;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Reentrant per-core lock that masks interrupt delivery while held.
///
/// The first acquisition records whether interrupts were enabled and masks
/// them; nested acquisitions only bump the depth. Interrupts are restored when
/// the depth returns to zero. It excludes preemption on this core, not other
/// cores.
///
/// ```text
/// depth:   0 ──lock──▶ 1 ──lock──▶ 2 ──unlock──▶ 1 ──unlock──▶ 0
/// IF:      on          off         off            off           on
/// ```
#[derive(Debug, Default)]
pub struct LocalLock {
    depth: AtomicU32,
    restore: AtomicBool,
}

impl LocalLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            depth: AtomicU32::new(0),
            restore: AtomicBool::new(false),
        }
    }

    /// Acquires the lock for the lifetime of the returned guard.
    #[inline]
    pub fn acquire<'a, I: Irq + ?Sized>(&'a self, irq: &'a I) -> LocalGuard<'a, I> {
        self.lock(irq);
        LocalGuard { lock: self, irq }
    }

    /// Raw acquisition. Pair with [`unlock`](Self::unlock).
    pub fn lock<I: Irq + ?Sized>(&self, irq: &I) {
        // Mask first so nothing on this core can observe a half-updated depth.
        let enabled = irq.interrupts_enabled();
        irq.disable_interrupts();
        if self.depth.load(Ordering::Relaxed) == 0 {
            self.restore.store(enabled, Ordering::Relaxed);
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    /// Raw release.
    ///
    /// # Safety
    /// The calling core must hold the lock (depth > 0) through a matching
    /// [`lock`](Self::lock).
    pub unsafe fn unlock<I: Irq + ?Sized>(&self, irq: &I) {
        let prev = self.depth.fetch_sub(1, Ordering::Relaxed);
        assert!(prev > 0, "local lock released while not held");
        if prev == 1 && self.restore.load(Ordering::Relaxed) {
            irq.enable_interrupts();
        }
    }

    /// Releases a level taken by another thread that switched to the caller.
    ///
    /// A thread resuming for the first time never ran the `acquire` whose
    /// guard is live in the switching thread's frame; it finishes the handoff
    /// by releasing that level on its behalf.
    ///
    /// # Safety
    /// Only valid as the first action of a freshly started thread, after a
    /// switch performed with this lock held exactly once for the switch.
    pub unsafe fn release_handoff<I: Irq + ?Sized>(&self, irq: &I) {
        unsafe { self.unlock(irq) }
    }

    /// Current nesting depth.
    #[inline]
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }

    #[inline]
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.depth() > 0
    }
}

/// Scoped hold of a [`LocalLock`].
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LocalGuard<'a, I: Irq + ?Sized> {
    lock: &'a LocalLock,
    irq: &'a I,
}

impl<I: Irq + ?Sized> LocalGuard<'_, I> {
    /// Depth of the underlying lock including this guard.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.lock.depth()
    }
}

impl<I: Irq + ?Sized> Drop for LocalGuard<'_, I> {
    fn drop(&mut self) {
        // Safety: the guard proves one level is held.
        unsafe { self.lock.unlock(self.irq) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlagIrq;

    #[test]
    fn nesting_restores_only_at_depth_zero() {
        let irq = FlagIrq::new(true);
        let lock = LocalLock::new();
        let outer = lock.acquire(&irq);
        assert!(!irq.interrupts_enabled());
        {
            let inner = lock.acquire(&irq);
            assert_eq!(inner.depth(), 2);
        }
        assert!(!irq.interrupts_enabled());
        drop(outer);
        assert!(irq.interrupts_enabled());
        assert!(!lock.is_held());
    }

    #[test]
    fn disabled_state_is_preserved() {
        let irq = FlagIrq::new(false);
        let lock = LocalLock::new();
        drop(lock.acquire(&irq));
        assert!(!irq.interrupts_enabled());
    }

    #[test]
    fn handoff_release_balances_a_foreign_acquire() {
        let irq = FlagIrq::new(true);
        let lock = LocalLock::new();
        // Switching thread takes the lock and never drops its guard here.
        core::mem::forget(lock.acquire(&irq));
        unsafe { lock.release_handoff(&irq) };
        assert_eq!(lock.depth(), 0);
        assert!(irq.interrupts_enabled());
    }

    #[test]
    #[should_panic(expected = "not held")]
    fn unbalanced_unlock_panics() {
        let irq = FlagIrq::new(true);
        let lock = LocalLock::new();
        unsafe { lock.unlock(&irq) };
    }
}
