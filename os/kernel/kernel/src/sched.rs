//! # Round-Robin Scheduler
//!
//! [`Kernel::yield_to_next`] is the only place a core changes threads. It
//! walks the thread registry in id order starting just after the current
//! thread and claims each candidate by compare-and-swap on its
//! [`OwnershipToken`](crate::ownership::OwnershipToken):
//!
//! - a runnable candidate is switched to;
//! - a dead candidate is reaped on the spot (unless the caller is itself
//!   leaving the processor) and the walk restarts;
//! - anything else is released and skipped.
//!
//! The idle thread is never picked while another thread can run. If the walk
//! comes back to the caller without a winner the caller simply continues;
//! a caller that cannot continue (blocked or dead) falls back to idle.
//!
//! ## Ownership hand-off
//!
//! While a thread runs its token reads `Thread(tid)`. A switch leaves the
//! outgoing thread's token claimed by the core until the incoming thread has
//! settled in [`Kernel::finish_switch`]; only then is it released. A thread
//! can therefore never be picked up by another core while its registers are
//! still being saved.

use crate::arch::Arch;
use crate::cpu::NO_THREAD;
use crate::kernel::Kernel;
use crate::kmutex::Blocker;
use crate::thread::ThreadStatus;
use log::{debug, trace};

impl<A: Arch> Kernel<A> {
    /// Gives the processor to the next runnable thread, if any.
    pub fn yield_to_next(&self) {
        let cpu = self.cpu();
        cpu.local.lock(self.irq());
        let me = cpu.current();
        let idle = cpu.idle();

        let mut cursor = me;
        let mut first = None;
        // Idle, claimed, in case nothing else turns up.
        let mut fallback = None;
        while let Some(next) = self.threads.next_after(self.irq(), cursor) {
            if next == me || first == Some(next) {
                break;
            }
            first.get_or_insert(next);
            cursor = next;

            let Some(candidate) = self.thread(next) else {
                continue;
            };
            if candidate.owner.claim(cpu.id()).is_err() {
                continue;
            }
            match candidate.status() {
                ThreadStatus::Runnable if next == idle => fallback = Some(next),
                ThreadStatus::Runnable => {
                    drop(candidate);
                    self.release_token(fallback);
                    self.switch_to(me, next);
                    // SAFETY: taken at the top of this function.
                    unsafe { cpu.local.unlock(self.irq()) };
                    return;
                }
                ThreadStatus::Dead if self.status_of(me) == Some(ThreadStatus::Running) => {
                    drop(candidate);
                    trace!("sched: reaping thread {next}");
                    self.reap(next);
                    self.release_token(fallback.take());
                    cursor = me;
                    first = None;
                }
                _ => candidate.owner.release(),
            }
        }

        match self.status_of(me) {
            Some(ThreadStatus::Running) => self.release_token(fallback),
            Some(ThreadStatus::Runnable) => {
                self.release_token(fallback);
                self.set_status_of(me, ThreadStatus::Running);
            }
            status => {
                let Some(idle) = fallback else {
                    panic!("sched: thread {me} cannot continue ({status:?}) and nothing else can run");
                };
                self.switch_to(me, idle);
            }
        }
        // SAFETY: taken at the top of this function.
        unsafe { cpu.local.unlock(self.irq()) };
    }

    /// Switches to `tid`. Returns `false` without switching if `tid` is not
    /// a runnable thread; yielding to oneself succeeds trivially.
    pub fn yield_to(&self, tid: u32) -> bool {
        let cpu = self.cpu();
        let me = cpu.current();
        if tid == me {
            return true;
        }
        let _local = cpu.local.acquire(self.irq());
        let Some(target) = self.thread(tid) else {
            return false;
        };
        if target.owner.claim(cpu.id()).is_err() {
            return false;
        }
        if target.status() != ThreadStatus::Runnable || tid == cpu.idle() {
            target.owner.release();
            return false;
        }
        drop(target);
        self.switch_to(me, tid);
        true
    }

    fn status_of(&self, tid: u32) -> Option<ThreadStatus> {
        self.thread(tid).map(|t| t.status())
    }

    fn set_status_of(&self, tid: u32, status: ThreadStatus) {
        if let Some(t) = self.thread(tid) {
            t.set_status(status);
        }
    }

    fn release_token(&self, tid: Option<u32>) {
        if let Some(t) = tid.and_then(|tid| self.thread(tid)) {
            t.owner.release();
        }
    }

    /// Transfers the processor from `me` to `next`, whose token this core
    /// has claimed. Called with exactly one level of the local lock held.
    fn switch_to(&self, me: u32, next: u32) {
        let cpu = self.cpu();
        debug_assert_eq!(cpu.local.depth(), 1, "switch with nested local lock");

        let (Some(current), Some(incoming)) = (self.thread(me), self.thread(next)) else {
            panic!("sched: switch {me} -> {next} between unregistered threads");
        };
        let _ = current.transition(ThreadStatus::Running, ThreadStatus::Runnable);
        incoming.set_status(ThreadStatus::Running);

        // The process of the incoming thread decides the address space; the
        // idle thread borrows whatever is active.
        if let Some(process) = self.process(incoming.pid()) {
            let directory = process.directory();
            if directory != self.arch.active() {
                self.arch.activate(directory);
            }
        }
        self.arch.set_kernel_stack(incoming.kernel_stack_top());

        let from = current.context_ptr();
        let to = incoming.context_ptr().cast_const();
        // Neither TCB can be freed while this core holds their tokens.
        drop(current);
        drop(incoming);

        cpu.set_previous(me);
        cpu.set_current(next);
        // SAFETY: both contexts belong to threads whose tokens this core owns.
        unsafe { self.arch.switch_context(from, to) };
        self.finish_switch();
    }

    /// Completes a switch on the incoming side: releases the outgoing
    /// thread's token and marks the current one as owned by itself.
    pub(crate) fn finish_switch(&self) {
        let cpu = self.cpu();
        let previous = cpu.take_previous();
        if previous != NO_THREAD {
            if let Some(t) = self.thread(previous) {
                t.owner.release();
            }
        }
        let current = cpu.current();
        if let Some(t) = self.thread(current) {
            t.owner.adopt(current);
        }
    }

    /// First code a new thread runs after its initial switch: completes the
    /// hand-off, runs a pending fork rebuild, and enters user mode.
    pub fn thread_entry(&self) -> ! {
        let cpu = self.cpu();
        self.finish_switch();
        // SAFETY: the switching thread left the local lock held for us.
        unsafe { cpu.local.release_handoff(self.irq()) };

        let thread = self.current_thread();
        if let Some(job) = thread.take_fork_job(self.irq()) {
            drop(thread);
            match self.fork_rebuild(job) {
                Ok(()) => self.current_thread().user_frame(self.arch.mapper()).eax = 0,
                Err(e) => {
                    debug!("fork: child {} failed: {e}", cpu.current());
                    self.vanish_current();
                }
            }
        } else {
            drop(thread);
        }

        let frame = *self.current_thread().user_frame(self.arch.mapper());
        self.return_to_user(frame)
    }

    /// Blocks the calling thread until `done` holds. `done` is evaluated
    /// with preemption excluded, so a waker that updates the condition and
    /// then calls [`wake`](Blocker::wake) under the local lock cannot be
    /// missed.
    pub fn block_until(&self, mut done: impl FnMut() -> bool) {
        let tid = self.cpu().current();
        loop {
            let blocked = self.masked(|| {
                if done() {
                    return false;
                }
                self.prepare_block(tid);
                true
            });
            if !blocked {
                return;
            }
            self.suspend(tid);
        }
    }
}

impl<A: Arch> Blocker for Kernel<A> {
    fn current(&self) -> u32 {
        self.cpu().current()
    }

    fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        Kernel::masked(self, f)
    }

    fn prepare_block(&self, tid: u32) {
        self.set_status_of(tid, ThreadStatus::Blocked);
    }

    fn suspend(&self, tid: u32) {
        while self.status_of(tid) == Some(ThreadStatus::Blocked) {
            self.yield_to_next();
        }
    }

    fn wake(&self, tid: u32) {
        if let Some(t) = self.thread(tid) {
            let _ = t.transition(ThreadStatus::Blocked, ThreadStatus::Runnable);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testkit::{booted, run_as};

    #[test]
    fn round_robin_visits_every_runnable_thread() {
        let (k, init) = booted();
        let a = k.spawn(b"prog", &[]).unwrap();
        let b = k.spawn(b"prog", &[]).unwrap();

        let mut order = Vec::new();
        for _ in 0..6 {
            k.yield_to_next();
            order.push(k.cpu().current());
        }
        assert_eq!(order, [a, b, init, a, b, init]);
        assert_eq!(k.cpu().local.depth(), 0);
    }

    #[test]
    fn idle_and_unknown_threads_cannot_be_yielded_to() {
        let (k, init) = booted();
        assert!(!k.yield_to(k.cpu().idle()));
        assert!(!k.yield_to(999));
        assert!(k.yield_to(init));
        assert_eq!(k.cpu().current(), init);

        let other = k.spawn(b"prog", &[]).unwrap();
        run_as(&k, other);
        assert_eq!(k.arch().switches.lock().unwrap().last(), Some(&(init, other)));
    }
}
