//! # Hypervisor
//!
//! A guest kernel is an ordinary process whose image was linked below the
//! user region. It runs at CPL 3 in its own segments (base `GUEST_BASE`)
//! and believes it owns an i386:
//!
//! - [`shadow`]: its page tables are compiled into shadow directories;
//! - [`hypercall`]: privileged requests arrive through `int $0x80`;
//! - [`virq`]: exceptions and device interrupts reach it through a virtual
//!   IDT, with a virtual interrupt flag and virtual privilege level;
//! - [`mux`]: timer ticks and key presses fan out to every guest.
//!
//! ```text
//!      load ──► New ── first return ──► Inited ── EXIT / crash ──► gone
//!                      (mux register)                (mux deregister,
//!                                                     original restored)
//! ```

pub mod hypercall;
pub mod info;
pub mod mux;
pub mod shadow;
pub mod virq;

pub use info::{GuestMode, GuestStatus, HyperInfo, VirtualIdtEntry};

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::process::Process;
use log::debug;

impl<A: Arch> Kernel<A> {
    /// Tears down the hypervisor side of an exiting guest: no more delayed
    /// interrupts, and the process is back on its original directory so the
    /// reaper frees exactly what the loader built.
    pub(crate) fn leave_guest(&self, process: &Process) {
        self.mux.deregister(self.irq(), process.pid());
        self.drop_shadow(process);
        if let Some(info) = process.set_guest(self.irq(), None) {
            debug!(
                "hv: guest {} left with {} interrupts pending",
                process.pid(),
                info.delayed.len()
            );
        }
    }
}
