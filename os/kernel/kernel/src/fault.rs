//! # Fault Dispatch
//!
//! Every exception runs through the same ordered chain of steps. A step
//! whose predicate matches gets the frame; the first one reporting
//! [`Outcome::Handled`] ends the dispatch, and the faulting instruction is
//! retried. Steps that transfer control elsewhere never come back.
//!
//! | # | Step      | Applies to                        | Effect                               |
//! |---|-----------|-----------------------------------|--------------------------------------|
//! | 1 | `guest`   | anything raised by a guest        | virtual exception or guest crash     |
//! | 2 | `ignore`  | double fault, invalid TSS, MCE    | handled, nothing done                |
//! | 3 | `zfod`    | write faults on user addresses    | promote a zero-fill placeholder      |
//! | 4 | `log`     | everything                        | register dump at `debug`             |
//! | 5 | `user`    | faults from user mode             | swexn handler, else kill the thread  |
//! | 6 | `fatal`   | everything                        | halt                                 |

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::trap::{TrapFrame, vectors};
use kernel_info::memory::is_user_address;
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::PageFaultError;
use log::{debug, error, trace};

/// Result of one step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Resume the faulting context.
    Handled,
    /// Try the next step.
    Declined,
}

/// One entry of the chain.
pub struct FaultStep<A: Arch> {
    pub name: &'static str,
    pub applies: fn(&Kernel<A>, &TrapFrame) -> bool,
    pub handle: fn(&Kernel<A>, &mut TrapFrame) -> Outcome,
}

/// The chain, in dispatch order.
#[must_use]
pub fn fault_chain<A: Arch>() -> [FaultStep<A>; 6] {
    [
        FaultStep {
            name: "guest",
            applies: |_, frame| frame.from_guest(),
            handle: |k, frame| k.guest_exception(frame),
        },
        FaultStep {
            name: "ignore",
            applies: |_, frame| {
                matches!(frame.vector, vectors::DOUBLE_FAULT | vectors::INVALID_TSS | vectors::MACHINE_CHECK)
            },
            handle: |_, _| Outcome::Handled,
        },
        FaultStep {
            name: "zfod",
            applies: |_, frame| {
                let error = PageFaultError::from_bits(frame.error_code);
                frame.vector == vectors::PAGE_FAULT
                    && error.present()
                    && error.write()
                    && is_user_address(VirtualAddress::new(frame.cr2))
            },
            handle: |k, frame| k.zfod_fault(VirtualAddress::new(frame.cr2)),
        },
        FaultStep {
            name: "log",
            applies: |_, _| true,
            handle: |k, frame| {
                debug!("fault: thread {} unresolved\n{frame}", k.cpu().current());
                Outcome::Declined
            },
        },
        FaultStep {
            name: "user",
            applies: |_, frame| frame.from_user(),
            handle: |k, frame| k.deliver_swexn_or_kill(frame),
        },
        FaultStep {
            name: "fatal",
            applies: |_, _| true,
            handle: |k, frame| {
                error!("fatal kernel fault in thread {}\n{frame}", k.cpu().current());
                k.arch.halt()
            },
        },
    ]
}

impl<A: Arch> Kernel<A> {
    /// Runs the fault chain for `frame`. Returns when the fault was resolved
    /// and the faulting context may continue.
    pub fn dispatch_fault(&self, frame: &mut TrapFrame) {
        for step in &self.faults {
            if (step.applies)(self, frame) && (step.handle)(self, frame) == Outcome::Handled {
                trace!("fault: vector {} handled by {}", frame.vector, step.name);
                return;
            }
        }
        error!("fault: vector {} fell off the chain", frame.vector);
        self.arch.halt()
    }

    /// Materializes a zero-fill page the current process wrote to.
    fn zfod_fault(&self, va: VirtualAddress) -> Outcome {
        let Some(process) = self.current_process() else {
            return Outcome::Declined;
        };
        let _w = process.memlock.write_force(self);
        if self.promote_zfod(&process, va) {
            Outcome::Handled
        } else {
            Outcome::Declined
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::{SimArch, expect_halt};
    use crate::testkit::{USER_ENTRY, booted, trap_from_user};
    use crate::trap::selectors;

    #[test]
    fn chain_order_is_fixed() {
        let names: Vec<_> = fault_chain::<SimArch>().iter().map(|s| s.name).collect();
        assert_eq!(names, ["guest", "ignore", "zfod", "log", "user", "fatal"]);
    }

    #[test]
    fn write_to_zero_fill_page_is_resolved_in_place() {
        let (k, _) = booted();
        let va = VirtualAddress::new(0x0200_0000);
        let process = k.current_process().unwrap();
        k.new_pages(&process, va, 0x1000).unwrap();
        drop(process);

        let resumed = trap_from_user(&k, vectors::PAGE_FAULT, |f| {
            f.cr2 = va.as_u32() + 0x10;
            f.error_code = 0b111;
        });
        assert_eq!(resumed.eip, USER_ENTRY);

        let process = k.current_process().unwrap();
        let leaf = k.space_of(&process).leaf(va).unwrap();
        assert!(!leaf.is_zfod_placeholder());
        assert_ne!(leaf.frame(), k.zero_frame);
        assert!(k.arch().invalidated.lock().unwrap().contains(&va));
    }

    #[test]
    fn kernel_faults_halt_the_machine() {
        let (k, _) = booted();
        let mut frame = TrapFrame {
            vector: vectors::GENERAL_PROTECTION,
            cs: selectors::KERNEL_CS,
            ..TrapFrame::default()
        };
        expect_halt(|| k.trap(&mut frame));
    }

    #[test]
    fn ignored_vectors_return_to_the_caller() {
        let (k, _) = booted();
        let mut frame = TrapFrame {
            vector: vectors::MACHINE_CHECK,
            cs: selectors::KERNEL_CS,
            ..TrapFrame::default()
        };
        k.dispatch_fault(&mut frame);
    }
}
