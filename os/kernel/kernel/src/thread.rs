//! # Thread Control Blocks

use crate::arch::KernelContext;
use crate::fork::ForkJob;
use crate::ownership::OwnershipToken;
use crate::swexn::SwexnHandler;
use crate::trap::TrapFrame;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use kernel_info::memory::KERNEL_STACK_SIZE;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_sync::{Irq, IrqGuard, SpinLock};
use kernel_vmem::PhysMapper;

/// Scheduling state of a thread.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    Uninitialized = 0,
    /// Built but not yet handed to the scheduler.
    Initialized = 1,
    Runnable = 2,
    Blocked = 3,
    Running = 4,
    /// Exited; waiting for the reaper.
    Dead = 5,
    /// Resources released; about to leave the registry.
    Reaped = 6,
}

impl ThreadStatus {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Initialized,
            2 => Self::Runnable,
            3 => Self::Blocked,
            4 => Self::Running,
            5 => Self::Dead,
            6 => Self::Reaped,
            _ => Self::Uninitialized,
        }
    }
}

/// Thread control block.
pub struct Thread {
    tid: u32,
    pid: u32,
    status: AtomicU8,
    pub(crate) owner: OwnershipToken,
    context: UnsafeCell<KernelContext>,
    kernel_stack: PhysicalPage,
    swexn: SpinLock<Option<SwexnHandler>>,
    descheduled: AtomicBool,
    fork_job: SpinLock<Option<ForkJob>>,
}

// SAFETY: `context` is only touched by the core that owns the thread's
// ownership token.
unsafe impl Sync for Thread {}
unsafe impl Send for Thread {}

impl Thread {
    #[must_use]
    pub fn new(tid: u32, pid: u32, kernel_stack: PhysicalPage, context: KernelContext) -> Self {
        Self {
            tid,
            pid,
            status: AtomicU8::new(ThreadStatus::Initialized as u8),
            owner: OwnershipToken::new(),
            context: UnsafeCell::new(context),
            kernel_stack,
            swexn: SpinLock::new(None),
            descheduled: AtomicBool::new(false),
            fork_job: SpinLock::new(None),
        }
    }

    #[inline]
    #[must_use]
    pub const fn tid(&self) -> u32 {
        self.tid
    }

    #[inline]
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ThreadStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Moves `from → to` atomically. Returns the status found on failure.
    ///
    /// # Errors
    /// The actual status when it was not `from`.
    pub fn transition(&self, from: ThreadStatus, to: ThreadStatus) -> Result<(), ThreadStatus> {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ThreadStatus::from_u8)
    }

    #[inline]
    #[must_use]
    pub const fn kernel_stack(&self) -> PhysicalPage {
        self.kernel_stack
    }

    /// First byte past the kernel stack, loaded into the TSS.
    #[must_use]
    pub const fn kernel_stack_top(&self) -> VirtualAddress {
        VirtualAddress::new(self.kernel_stack.base().as_u32() + KERNEL_STACK_SIZE)
    }

    pub(crate) const fn context_ptr(&self) -> *mut KernelContext {
        self.context.get()
    }

    /// The frame a trap from user mode saved at the top of the kernel stack.
    #[must_use]
    pub fn user_frame<'a, M: PhysMapper + ?Sized>(&self, mapper: &M) -> &'a mut TrapFrame {
        let at = self.kernel_stack.base() + TrapFrame::user_frame_offset() as u32;
        // SAFETY: kernel stacks are kernel-pool frames reachable through the
        // mapper, and the top of the stack is reserved for the user frame.
        unsafe { mapper.phys_to_mut::<TrapFrame>(at) }
    }

    #[must_use]
    pub fn swexn(&self, irq: &dyn Irq) -> Option<SwexnHandler> {
        let _masked = IrqGuard::new(irq);
        *self.swexn.lock()
    }

    pub fn set_swexn(&self, irq: &dyn Irq, handler: Option<SwexnHandler>) {
        let _masked = IrqGuard::new(irq);
        *self.swexn.lock() = handler;
    }

    /// Removes and returns the registered handler.
    pub fn take_swexn(&self, irq: &dyn Irq) -> Option<SwexnHandler> {
        let _masked = IrqGuard::new(irq);
        self.swexn.lock().take()
    }

    #[must_use]
    pub fn is_descheduled(&self) -> bool {
        self.descheduled.load(Ordering::Acquire)
    }

    pub(crate) fn set_descheduled(&self, value: bool) -> bool {
        self.descheduled.swap(value, Ordering::AcqRel)
    }

    pub(crate) fn set_fork_job(&self, irq: &dyn Irq, job: ForkJob) {
        let _masked = IrqGuard::new(irq);
        *self.fork_job.lock() = Some(job);
    }

    pub(crate) fn take_fork_job(&self, irq: &dyn Irq) -> Option<ForkJob> {
        let _masked = IrqGuard::new(irq);
        self.fork_job.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        let t = Thread::new(3, 3, PhysicalPage::from_number(0x500), KernelContext::default());
        assert_eq!(t.status(), ThreadStatus::Initialized);
        assert_eq!(t.transition(ThreadStatus::Initialized, ThreadStatus::Runnable), Ok(()));
        assert_eq!(
            t.transition(ThreadStatus::Blocked, ThreadStatus::Runnable),
            Err(ThreadStatus::Runnable)
        );
        assert_eq!(t.kernel_stack_top().as_u32(), 0x50_1000);
    }
}
