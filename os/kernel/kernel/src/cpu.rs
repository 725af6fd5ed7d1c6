//! # Per-Core State

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_sync::LocalLock;

/// Tid value meaning "no thread".
pub const NO_THREAD: u32 = 0;

/// One logical core.
#[derive(Debug)]
pub struct Cpu {
    id: u32,
    pub(crate) local: LocalLock,
    current: AtomicU32,
    previous: AtomicU32,
    idle: AtomicU32,
    need_resched: AtomicBool,
}

impl Cpu {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            local: LocalLock::new(),
            current: AtomicU32::new(NO_THREAD),
            previous: AtomicU32::new(NO_THREAD),
            idle: AtomicU32::new(NO_THREAD),
            need_resched: AtomicBool::new(false),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Thread running on this core.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn set_current(&self, tid: u32) {
        self.current.store(tid, Ordering::Release);
    }

    /// Thread this core switched away from last; its token is still ours
    /// until the switch completes.
    #[must_use]
    pub fn previous(&self) -> u32 {
        self.previous.load(Ordering::Acquire)
    }

    pub(crate) fn set_previous(&self, tid: u32) {
        self.previous.store(tid, Ordering::Release);
    }

    pub(crate) fn take_previous(&self) -> u32 {
        self.previous.swap(NO_THREAD, Ordering::AcqRel)
    }

    #[must_use]
    pub fn idle(&self) -> u32 {
        self.idle.load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, tid: u32) {
        self.idle.store(tid, Ordering::Release);
    }

    /// Asks the next return to user mode to yield.
    pub fn request_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub(crate) fn take_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }
}
