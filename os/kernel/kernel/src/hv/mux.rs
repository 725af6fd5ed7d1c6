//! Fan-out of device interrupts to every running guest.
//!
//! Guests register on their first return to guest code. A broadcast queues
//! `(vector, arg)` on each registered guest; delivery happens on that
//! guest's next return. Slots are fixed at boot so interrupt context never
//! allocates.

use crate::arch::Arch;
use crate::kernel::Kernel;
use alloc::vec;
use alloc::vec::Vec;
use kernel_sync::{Irq, IrqGuard, SpinLock};
use log::{trace, warn};

/// Registered guest pids.
pub struct DelayedMux {
    slots: SpinLock<Vec<Option<u32>>>,
    capacity: usize,
}

impl DelayedMux {
    #[must_use]
    pub fn new(max_guests: usize) -> Self {
        Self {
            slots: SpinLock::new(vec![None; max_guests]),
            capacity: max_guests,
        }
    }

    /// Adds `pid`. Returns `false` when every slot is taken.
    pub fn register(&self, irq: &dyn Irq, pid: u32) -> bool {
        let _masked = IrqGuard::new(irq);
        let mut slots = self.slots.lock();
        if slots.contains(&Some(pid)) {
            return true;
        }
        match slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(pid);
                true
            }
            None => {
                warn!("mux: no slot left for guest {pid}");
                false
            }
        }
    }

    pub fn deregister(&self, irq: &dyn Irq, pid: u32) {
        let _masked = IrqGuard::new(irq);
        for slot in self.slots.lock().iter_mut().filter(|s| **s == Some(pid)) {
            *slot = None;
        }
    }

    #[must_use]
    pub fn registered(&self, irq: &dyn Irq) -> usize {
        let _masked = IrqGuard::new(irq);
        self.slots.lock().iter().flatten().count()
    }

    fn slot(&self, irq: &dyn Irq, index: usize) -> Option<u32> {
        let _masked = IrqGuard::new(irq);
        self.slots.lock().get(index).copied().flatten()
    }

    /// Queues `(vector, arg)` on every registered guest. A guest whose queue
    /// is full loses the interrupt.
    pub fn broadcast<A: Arch>(&self, kernel: &Kernel<A>, vector: u32, arg: u32) {
        for index in 0..self.capacity {
            let Some(pid) = self.slot(kernel.irq(), index) else {
                continue;
            };
            // A guest exiting concurrently is simply not found.
            let Some(process) = kernel.process(pid) else {
                continue;
            };
            let queued = process.with_guest(kernel.irq(), |g| g.queue_delayed(vector, arg));
            if queued == Some(false) {
                trace!("mux: guest {pid} dropped vector {vector}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_sync::FlagIrq;

    #[test]
    fn slots_are_bounded_and_reusable() {
        let irq = FlagIrq::new(true);
        let mux = DelayedMux::new(2);
        assert!(mux.register(&irq, 5));
        assert!(mux.register(&irq, 5));
        assert!(mux.register(&irq, 6));
        assert!(!mux.register(&irq, 7));
        mux.deregister(&irq, 5);
        assert!(mux.register(&irq, 7));
        assert_eq!(mux.registered(&irq), 2);
        assert!(irq.interrupts_enabled());
    }
}
