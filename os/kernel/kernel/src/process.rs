//! # Process Control Blocks
//!
//! Lifecycle: `Initialized → PreZombie` when the last thread exits,
//! `PreZombie → Zombie` once the reaper has reclaimed the address space, and
//! freed when the parent (or INIT) collects it with `wait`.
//!
//! Everything the lifecycle code edits lives in [`ProcessInner`] behind a
//! spin lock that is only taken with interrupts masked. Page-table edits are
//! serialized separately by [`Process::memlock`].

use crate::hv::HyperInfo;
use crate::kmutex::KMutex;
use alloc::boxed::Box;
use alloc::collections::{BTreeSet, VecDeque};
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use kernel_memory_addresses::PhysicalPage;
use kernel_sync::{Irq, IrqGuard, SpinLock};

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    Initialized = 0,
    /// Last thread gone, address space not yet reclaimed.
    PreZombie = 1,
    /// Only the exit status is left.
    Zombie = 2,
}

impl ProcessState {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::PreZombie,
            2 => Self::Zombie,
            _ => Self::Initialized,
        }
    }
}

/// Where the loader put the stack and image.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryLayout {
    pub stack_low: u32,
    pub stack_high: u32,
    /// First page past the loaded image.
    pub image_end: u32,
}

/// Mutable bookkeeping of a process.
#[derive(Debug, Default)]
pub struct ProcessInner {
    /// `None` for INIT and for fork children that never came to life.
    pub parent: Option<u32>,
    /// Threads that have not called `vanish`.
    pub live_threads: u32,
    /// Threads not yet reaped.
    pub threads: u32,
    pub exit_status: i32,
    /// Children that have not become zombies yet.
    pub children: BTreeSet<u32>,
    /// Exited children in arrival order.
    pub zombies: VecDeque<u32>,
    /// Threads blocked in `wait`.
    pub waiters: VecDeque<u32>,
    pub layout: MemoryLayout,
    /// User-pool frames reserved for untouched zero-fill pages.
    pub zfod_reserved: usize,
    pub console: usize,
}

/// Process control block.
pub struct Process {
    pid: u32,
    directory: AtomicU32,
    state: AtomicU8,
    /// Guards every change to this process's page tables.
    pub memlock: KMutex,
    inner: SpinLock<ProcessInner>,
    guest: SpinLock<Option<Box<HyperInfo>>>,
}

impl Process {
    #[must_use]
    pub fn new(pid: u32, directory: PhysicalPage, inner: ProcessInner) -> Self {
        Self {
            pid,
            directory: AtomicU32::new(directory.number()),
            state: AtomicU8::new(ProcessState::Initialized as u8),
            memlock: KMutex::new(),
            inner: SpinLock::new(inner),
            guest: SpinLock::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Page directory of the address space.
    #[must_use]
    pub fn directory(&self) -> PhysicalPage {
        PhysicalPage::from_number(self.directory.load(Ordering::Acquire))
    }

    /// Installs a new directory and returns the old one (`exec`).
    pub fn replace_directory(&self, directory: PhysicalPage) -> PhysicalPage {
        PhysicalPage::from_number(self.directory.swap(directory.number(), Ordering::AcqRel))
    }

    #[must_use]
    pub fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runs `f` on the bookkeeping with interrupts masked.
    pub fn with<R>(&self, irq: &dyn Irq, f: impl FnOnce(&mut ProcessInner) -> R) -> R {
        let _masked = IrqGuard::new(irq);
        f(&mut self.inner.lock())
    }

    #[must_use]
    pub fn is_guest(&self, irq: &dyn Irq) -> bool {
        let _masked = IrqGuard::new(irq);
        self.guest.lock().is_some()
    }

    /// Runs `f` on the guest state, if this process is a guest.
    pub fn with_guest<R>(&self, irq: &dyn Irq, f: impl FnOnce(&mut HyperInfo) -> R) -> Option<R> {
        let _masked = IrqGuard::new(irq);
        self.guest.lock().as_deref_mut().map(f)
    }

    pub fn set_guest(&self, irq: &dyn Irq, info: Option<Box<HyperInfo>>) -> Option<Box<HyperInfo>> {
        let _masked = IrqGuard::new(irq);
        core::mem::replace(&mut *self.guest.lock(), info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_sync::FlagIrq;

    #[test]
    fn bookkeeping_is_masked() {
        let irq = FlagIrq::new(true);
        let p = Process::new(2, PhysicalPage::from_number(9), ProcessInner::default());
        p.with(&irq, |inner| {
            inner.children.insert(5);
            inner.zombies.push_back(6);
        });
        assert!(irq.interrupts_enabled());
        assert_eq!(p.with(&irq, |i| i.zombies.front().copied()), Some(6));
        assert_eq!(p.replace_directory(PhysicalPage::from_number(11)).number(), 9);
        assert_eq!(p.directory().number(), 11);
        assert!(!p.is_guest(&irq));
    }
}
