//! # Virtual Interrupts
//!
//! Exceptions raised by guest code and device interrupts queued by the
//! [`mux`](super::mux) reach the guest through its virtual IDT. Delivery
//! pushes an i386-style frame on the guest stack:
//!
//! ```text
//!  user → privileged handler        same privilege
//!  (stack switched to esp0)
//!  ┌──────────┐
//!  │ ss       │
//!  │ esp      │
//!  │ eflags   │                     ┌──────────┐
//!  │ cs       │                     │ eflags   │
//!  │ eip      │                     │ cs       │
//!  │ error    │ (if any)            │ eip      │
//!  └──────────┘ ◄─ new esp          │ error    │ (if any)
//!                                   └──────────┘ ◄─ new esp
//! ```
//!
//! The pushed `eflags` carries the virtual IF. Entering a handler clears
//! the virtual IF; a privileged handler also switches the guest to virtual
//! kernel mode, which recompiles the shadow. Delayed interrupts push their
//! argument word (the tick count, the scan code) in the error-code slot.

use super::info::{GuestMode, GuestStatus};
use super::shadow::ShadowError;
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::process::Process;
use crate::trap::{TrapFrame, vectors};
use alloc::vec::Vec;
use core::fmt::Display;
use kernel_info::memory::GUEST_BASE;
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::Eflags;
use log::{trace, warn};

/// Virtual timer interrupt; argument is the tick count.
pub const TIMER: u32 = 20;
/// Virtual keyboard interrupt; argument is the raw scan code.
pub const KEYBOARD: u32 = 21;
/// Size of the virtual IDT.
pub const VECTOR_COUNT: usize = 22;

/// Code selectors as the guest sees them.
const GUEST_KERNEL_CS: u32 = 0x10;
const GUEST_USER_CS: u32 = 0x1B;
const GUEST_USER_SS: u32 = 0x23;

/// Why a virtual interrupt could not be delivered. Always fatal to the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no handler for vector {0}")]
    NoHandler(u32),
    #[error("guest stack at {0:#x} is not writable")]
    BadStack(u32),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
}

/// Host flags for running guest code with guest-chosen `bits`: the guest
/// picks the arithmetic flags, the host keeps interrupts on.
pub(crate) const fn host_eflags(bits: u32) -> u32 {
    (bits & Eflags::USER_WRITABLE) | Eflags::RESERVED_ONE | Eflags::IF
}

/// Copies the general-purpose registers of `from` into `to`.
pub(crate) const fn carry_registers(to: &mut TrapFrame, from: &TrapFrame) {
    to.edi = from.edi;
    to.esi = from.esi;
    to.ebp = from.ebp;
    to.ebx = from.ebx;
    to.edx = from.edx;
    to.ecx = from.ecx;
    to.eax = from.eax;
}

impl<A: Arch> Kernel<A> {
    /// Pushes the frame for `vector` on the guest stack and returns the host
    /// frame that enters the handler.
    fn push_virtual(
        &self,
        process: &Process,
        frame: &TrapFrame,
        vector: u32,
        error: Option<u32>,
    ) -> Result<TrapFrame, DeliveryError> {
        let (entry, mode, esp0, virtual_if) = process
            .with_guest(self.irq(), |g| {
                (g.idt.get(vector as usize).copied().flatten(), g.mode, g.esp0, g.interrupts_enabled)
            })
            .ok_or(ShadowError::NotGuest)?;
        let entry = entry.ok_or(DeliveryError::NoHandler(vector))?;

        let eflags = (frame.eflags & !Eflags::IF) | if virtual_if { Eflags::IF } else { 0 };
        let cs = match mode {
            GuestMode::Kernel => GUEST_KERNEL_CS,
            GuestMode::User => GUEST_USER_CS,
        };
        let cross = mode == GuestMode::User && entry.privileged;

        // Lowest address first.
        let mut words: Vec<u32> = Vec::with_capacity(6);
        words.extend(error);
        words.extend([frame.eip, cs, eflags]);
        let top = if cross {
            words.extend([frame.esp, GUEST_USER_SS]);
            esp0
        } else {
            frame.esp
        };
        let esp = top
            .checked_sub(4 * words.len() as u32)
            .ok_or(DeliveryError::BadStack(top))?;

        let changed = process
            .with_guest(self.irq(), |g| {
                g.interrupts_enabled = false;
                let before = g.mode;
                if entry.privileged {
                    g.mode = GuestMode::Kernel;
                }
                before != g.mode
            })
            .ok_or(ShadowError::NotGuest)?;
        if changed {
            self.recompile(process)?;
        }

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        let host = esp.checked_add(GUEST_BASE).ok_or(DeliveryError::BadStack(esp))?;
        self.copy_out(process, VirtualAddress::new(host), &bytes)
            .map_err(|_| DeliveryError::BadStack(esp))?;

        trace!("virq: pid {} vector {vector} -> {:#x}", process.pid(), entry.eip);
        let mut next = TrapFrame::guest(entry.eip, esp, host_eflags(frame.eflags));
        carry_registers(&mut next, frame);
        Ok(next)
    }

    /// Delivers `vector` to the calling guest now, or crashes it.
    pub(crate) fn deliver_virtual(&self, frame: &TrapFrame, vector: u32, error: Option<u32>) -> ! {
        let Some(process) = self.current_process() else {
            self.vanish_current();
        };
        let result = self.push_virtual(&process, frame, vector, error);
        drop(process);
        match result {
            Ok(next) => self.flush_and_resume(&next),
            Err(e) => self.crash_guest(e),
        }
    }

    /// Fault-chain entry for anything raised by guest code.
    pub(crate) fn guest_exception(&self, frame: &TrapFrame) -> ! {
        if frame.vector == vectors::PAGE_FAULT {
            if let Some(process) = self.current_process() {
                process.with_guest(self.irq(), |g| g.cr2 = frame.cr2.wrapping_sub(GUEST_BASE));
            }
        }
        let error = vectors::has_error_code(frame.vector).then_some(frame.error_code);
        self.deliver_virtual(frame, frame.vector, error)
    }

    /// A guest used an interrupt gate reserved for ordinary processes.
    /// Reported as a general protection fault naming the gate.
    pub(crate) fn guest_bad_gate(&self, frame: &TrapFrame) -> ! {
        let error = (frame.vector << 3) | 2;
        self.deliver_virtual(frame, vectors::GENERAL_PROTECTION, Some(error))
    }

    /// Ends the calling guest with the configured crash status.
    pub(crate) fn crash_guest(&self, reason: impl Display) -> ! {
        warn!("hv: guest thread {} crashed: {reason}", self.cpu().current());
        self.set_status(self.config.guest_crash_status);
        self.vanish_current()
    }

    /// Work on the way back into guest code: registration on the first
    /// return and delivery of queued interrupts while the virtual IF is on.
    /// Returns the frame to resume instead of `frame` if anything was
    /// delivered.
    pub(crate) fn guest_return(&self, frame: &TrapFrame) -> Option<TrapFrame> {
        let process = self.current_process()?;
        let pid = process.pid();
        let first = process.with_guest(self.irq(), |g| {
            let first = g.status == GuestStatus::New;
            g.status = GuestStatus::Inited;
            first
        })?;
        if first && !self.mux.register(self.irq(), pid) {
            warn!("hv: guest {pid} runs without delayed interrupts");
        }

        let mut current = *frame;
        let mut delivered = false;
        for _ in 0..self.config.delayed_irqs_per_return {
            let next = process
                .with_guest(self.irq(), |g| if g.interrupts_enabled { g.delayed.pop_front() } else { None })
                .flatten();
            let Some((vector, arg)) = next else {
                break;
            };
            match self.push_virtual(&process, &current, vector, Some(arg)) {
                Ok(next) => {
                    current = next;
                    delivered = true;
                }
                Err(e) => {
                    drop(process);
                    self.crash_guest(e);
                }
            }
        }
        delivered.then_some(current)
    }
}
