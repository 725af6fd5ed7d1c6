//! # Trap Dispatch
//!
//! Every interrupt gate funnels into [`Kernel::trap`] with the saved
//! registers. Exceptions go through the fault chain, device interrupts to
//! their drivers, `int $0x80` to the hypervisor and the system call range
//! to the syscall table. Frames from user mode leave through
//! [`Kernel::return_to_user`], which is also where preemption and virtual
//! interrupt delivery happen.
//!
//! Kernel code is never preempted in place: the timer only requests a
//! reschedule, honored on the next return to user mode.

use crate::arch::Arch;
use crate::hv::virq;
use crate::kernel::Kernel;
use crate::kmutex::Blocker;
use crate::trap::{TrapFrame, vectors};
use core::sync::atomic::Ordering;
use kernel_syscall::Sysno;
use log::trace;

impl<A: Arch> Kernel<A> {
    /// Handles the trap described by `frame`. Returns only when the
    /// interrupted context was kernel code.
    pub fn trap(&self, frame: &mut TrapFrame) {
        match frame.vector {
            v if v < vectors::EXCEPTION_END => self.dispatch_fault(frame),
            vectors::TIMER => {
                self.arch.end_of_interrupt(vectors::TIMER);
                self.timer_tick();
            }
            vectors::KEYBOARD => {
                let scancode = self.arch.read_scancode();
                self.arch.end_of_interrupt(vectors::KEYBOARD);
                self.keyboard_input(scancode);
            }
            vectors::HYPERCALL => self.hypercall(frame),
            v if Sysno::is_reserved(v) => {
                if frame.from_guest() {
                    self.guest_bad_gate(frame);
                }
                self.syscall(frame);
            }
            v => trace!("trap: spurious vector {v:#x}"),
        }
        if frame.from_user() {
            self.return_to_user(*frame);
        }
    }

    /// Timer interrupt: advance the clock, wake due sleepers, tell the
    /// guests, and ask for a reschedule.
    pub fn timer_tick(&self) {
        let now = self.ticks.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        self.masked(|| {
            self.sleepers.lock().retain(|&(wake_at, tid)| {
                // Due once `now` has reached `wake_at`, modulo wrap-around.
                let due = now.wrapping_sub(wake_at) as i32 >= 0;
                if due {
                    self.wake(tid);
                }
                !due
            });
        });
        self.mux.broadcast(self, virq::TIMER, now);
        self.cpu().request_resched();
    }

    /// Leaves the kernel for user (or guest) code through `frame`, after
    /// any pending reschedule and virtual interrupt delivery.
    pub(crate) fn return_to_user(&self, frame: TrapFrame) -> ! {
        if self.cpu().take_resched() {
            self.yield_to_next();
        }
        if frame.from_guest() {
            if let Some(next) = self.guest_return(&frame) {
                self.flush_and_resume(&next);
            }
        }
        self.resume(&frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::booted;
    use crate::thread::ThreadStatus;
    use crate::trap::selectors;

    fn kernel_frame(vector: u32) -> TrapFrame {
        TrapFrame {
            vector,
            cs: selectors::KERNEL_CS,
            ..TrapFrame::default()
        }
    }

    #[test]
    fn sleepers_wake_when_their_tick_comes() {
        let (k, init) = booted();
        let wake_at = k.ticks().wrapping_add(2);
        k.masked(|| {
            k.sleepers.lock().push((wake_at, init));
            k.prepare_block(init);
        });

        k.timer_tick();
        assert_eq!(k.thread(init).unwrap().status(), ThreadStatus::Blocked);
        k.timer_tick();
        assert_eq!(k.thread(init).unwrap().status(), ThreadStatus::Runnable);
        assert!(k.sleepers.lock().is_empty());
        assert!(k.cpu().take_resched());
    }

    #[test]
    fn wake_time_survives_tick_wrap_around() {
        let (k, init) = booted();
        k.ticks.store(u32::MAX - 1, Ordering::Relaxed);
        let wake_at = k.ticks().wrapping_add(3);
        k.masked(|| {
            k.sleepers.lock().push((wake_at, init));
            k.prepare_block(init);
        });

        k.timer_tick();
        k.timer_tick();
        assert_eq!(k.thread(init).unwrap().status(), ThreadStatus::Blocked);
        k.timer_tick();
        assert_eq!(k.ticks(), 1);
        assert_eq!(k.thread(init).unwrap().status(), ThreadStatus::Runnable);
    }

    #[test]
    fn device_interrupts_are_acknowledged_in_kernel_mode() {
        let (k, _) = booted();
        k.arch().scancodes.lock().unwrap().push_back(0x1E);

        let mut frame = kernel_frame(vectors::KEYBOARD);
        k.trap(&mut frame);
        let mut frame = kernel_frame(vectors::TIMER);
        k.trap(&mut frame);

        assert_eq!(*k.arch().eois.lock().unwrap(), [vectors::KEYBOARD, vectors::TIMER]);
        assert_eq!(k.ticks(), 1);
        assert_eq!(k.getchar(), b'a');
    }

    #[test]
    fn spurious_vectors_are_ignored() {
        let (k, init) = booted();
        let mut frame = kernel_frame(0xF0);
        k.trap(&mut frame);
        assert_eq!(k.cpu().current(), init);
        assert!(k.arch().eois.lock().unwrap().is_empty());
    }
}
