use crate::{Irq, LocalLock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

const NO_OWNER: u32 = u32::MAX;

/// Reentrant cross-core spin lock.
///
/// Acquiring it first takes the calling core's [`LocalLock`], so holding a
/// global lock also masks interrupts. The owning core may re-acquire freely;
/// other cores spin (test-and-test-and-set) until the depth returns to zero.
#[derive(Debug)]
pub struct GlobalLock {
    owner: AtomicU32,
    depth: AtomicU32,
}

impl Default for GlobalLock {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalLock {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            owner: AtomicU32::new(NO_OWNER),
            depth: AtomicU32::new(0),
        }
    }

    /// Acquires the lock on behalf of core `cpu`.
    pub fn acquire<'a, I: Irq + ?Sized>(
        &'a self,
        cpu: u32,
        local: &'a LocalLock,
        irq: &'a I,
    ) -> GlobalGuard<'a, I> {
        debug_assert_ne!(cpu, NO_OWNER, "reserved core id");
        local.lock(irq);

        if self.owner.load(Ordering::Acquire) != cpu {
            while self
                .owner
                .compare_exchange_weak(NO_OWNER, cpu, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                while self.owner.load(Ordering::Relaxed) != NO_OWNER {
                    spin_loop();
                }
            }
        }
        self.depth.fetch_add(1, Ordering::Relaxed);

        GlobalGuard {
            lock: self,
            local,
            irq,
        }
    }

    /// Core currently holding the lock.
    #[must_use]
    pub fn owner(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            cpu => Some(cpu),
        }
    }

    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Scoped hold of a [`GlobalLock`].
#[must_use = "dropping the guard releases the lock immediately"]
pub struct GlobalGuard<'a, I: Irq + ?Sized> {
    lock: &'a GlobalLock,
    local: &'a LocalLock,
    irq: &'a I,
}

impl<I: Irq + ?Sized> Drop for GlobalGuard<'_, I> {
    fn drop(&mut self) {
        if self.lock.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.lock.owner.store(NO_OWNER, Ordering::Release);
        }
        // Safety: `acquire` took one level of the local lock for this guard.
        unsafe { self.local.unlock(self.irq) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlagIrq;

    #[test]
    fn reentrant_on_same_core() {
        let irq = FlagIrq::new(true);
        let local = LocalLock::new();
        let lock = GlobalLock::new();

        let a = lock.acquire(0, &local, &irq);
        let b = lock.acquire(0, &local, &irq);
        assert_eq!(lock.depth(), 2);
        assert_eq!(local.depth(), 2);
        assert!(!irq.interrupts_enabled());
        drop(b);
        assert_eq!(lock.owner(), Some(0));
        drop(a);
        assert_eq!(lock.owner(), None);
        assert!(irq.interrupts_enabled());
    }
}
