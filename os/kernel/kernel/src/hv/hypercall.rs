//! # Hypercalls
//!
//! A guest kernel requests privileged work with `int $0x80`: the operation
//! in `%eax`, the parameters as a word block just above the return address
//! of the calling stub (guest `esp + 4`). Every pointer is guest-virtual and
//! is rebased by `GUEST_BASE` before it is checked against the guest's
//! current shadow.
//!
//! | Op | Name                 | Parameters                          | Result            |
//! |----|----------------------|-------------------------------------|-------------------|
//! |  0 | `MAGIC`              |                                     | [`HV_MAGIC`]      |
//! |  1 | `EXIT`               | status                              | does not return   |
//! |  2 | `IRET`               | eip, eflags, esp, esp0, eax         | does not return   |
//! |  3 | `SETIDT`             | vector, eip, privileged             | 0                 |
//! |  4 | `DISABLE_INTERRUPTS` |                                     | 0                 |
//! |  5 | `ENABLE_INTERRUPTS`  |                                     | 0                 |
//! |  6 | `SETPD`              | directory gpa, write-protect        | 0                 |
//! |  7 | `ADJUSTPG`           | guest-virtual address               | 0                 |
//! |  8 | `PRINT`              | len, buf                            | 0                 |
//! |  9 | `SET_COLOR`          | color                               | 0                 |
//! | 10 | `SET_CURSOR`         | row, col                            | 0                 |
//! | 11 | `GET_CURSOR`         | row ptr, col ptr                    | 0                 |
//! | 12 | `PRINT_AT`           | len, buf, row, col, color           | 0                 |
//! | 13 | `GET_CR2`            |                                     | last fault address|
//!
//! Rejected requests return a negative code in `%eax`. Malformed paging
//! state or flags are fatal to the guest. A request made while the guest
//! is in virtual user mode is turned into a virtual general protection
//! fault, as a privileged instruction would be.

use super::info::{GuestMode, VirtualIdtEntry};
use super::shadow::ShadowError;
use super::virq::{VECTOR_COUNT, carry_registers, host_eflags};
use crate::arch::Arch;
use crate::console::ConsoleError;
use crate::kernel::Kernel;
use crate::process::Process;
use crate::trap::TrapFrame;
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::memory::{GUEST_BASE, GUEST_MEM_SIZE, PAGE_SIZE};
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::{Eflags, EflagsViolation};
use kernel_vmem::{Access, AccessError};
use log::{debug, trace};

/// Returned by `MAGIC`.
pub const HV_MAGIC: u32 = 0x1541_0DE0;

/// Longest text a single print accepts.
pub const MAX_PRINT: u32 = 4096;

/// Operation codes.
pub mod ops {
    pub const MAGIC: u32 = 0;
    pub const EXIT: u32 = 1;
    pub const IRET: u32 = 2;
    pub const SETIDT: u32 = 3;
    pub const DISABLE_INTERRUPTS: u32 = 4;
    pub const ENABLE_INTERRUPTS: u32 = 5;
    pub const SETPD: u32 = 6;
    pub const ADJUSTPG: u32 = 7;
    pub const PRINT: u32 = 8;
    pub const SET_COLOR: u32 = 9;
    pub const SET_CURSOR: u32 = 10;
    pub const GET_CURSOR: u32 = 11;
    pub const PRINT_AT: u32 = 12;
    pub const GET_CR2: u32 = 13;
}

/// A refused hypercall.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HypercallError {
    #[error("caller is not a guest kernel")]
    NotGuest,
    #[error("unknown operation {0}")]
    UnknownOp(u32),
    #[error("invalid argument")]
    Invalid,
    #[error("guest address {0:#x} cannot be rebased")]
    BadAddress(u32),
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error("iret flags rejected: {0:?}")]
    BadFlags(EflagsViolation),
    #[error(transparent)]
    Shadow(#[from] ShadowError),
}

impl HypercallError {
    /// Ends the guest instead of returning an error code.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::BadFlags(_) | Self::Shadow(_))
    }

    /// Value left in `%eax`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::BadAddress(_) | Self::Access(_) => -2,
            _ => -1,
        }
    }
}

/// What the dispatcher does once an operation is done.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flow {
    /// Continue the guest with this value in `%eax`.
    Return(u32),
    /// Flush translations and enter the guest through this frame.
    Resume(TrapFrame),
    /// End the guest with this status.
    Exit(i32),
}

type Op<A> = fn(&Kernel<A>, &Process, &TrapFrame, &[u32]) -> Result<Flow, HypercallError>;

/// One operation.
pub struct Hypercall<A: Arch> {
    pub name: &'static str,
    /// Words read from the parameter block.
    pub params: usize,
    pub run: Op<A>,
}

/// Operations indexed by op code.
pub struct HypercallTable<A: Arch> {
    ops: Vec<Hypercall<A>>,
}

impl<A: Arch> HypercallTable<A> {
    #[must_use]
    pub fn get(&self, op: u32) -> Option<&Hypercall<A>> {
        self.ops.get(op as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Host address of guest pointer `gva`.
fn rebase(gva: u32) -> Result<VirtualAddress, HypercallError> {
    gva.checked_add(GUEST_BASE)
        .map(VirtualAddress::new)
        .ok_or(HypercallError::BadAddress(gva))
}

fn guest_text<A: Arch>(k: &Kernel<A>, process: &Process, len: u32, buf: u32) -> Result<Vec<u8>, HypercallError> {
    if len > MAX_PRINT {
        return Err(HypercallError::Invalid);
    }
    let mut text = vec![0; len as usize];
    k.copy_in(process, rebase(buf)?, &mut text)?;
    Ok(text)
}

fn set_interrupts<A: Arch>(k: &Kernel<A>, process: &Process, on: bool) -> Flow {
    process.with_guest(k.irq(), |g| g.interrupts_enabled = on);
    Flow::Return(0)
}

/// The operation table, in op-code order.
#[must_use]
pub fn hypercall_table<A: Arch>() -> HypercallTable<A> {
    let ops: Vec<Hypercall<A>> = vec![
        Hypercall {
            name: "magic",
            params: 0,
            run: |_, _, _, _| Ok(Flow::Return(HV_MAGIC)),
        },
        Hypercall {
            name: "exit",
            params: 1,
            run: |_, _, _, p| Ok(Flow::Exit(p[0] as i32)),
        },
        Hypercall {
            name: "iret",
            params: 5,
            run: |k, process, frame, p| {
                let (eip, eflags, esp, esp0, eax) = (p[0], p[1], p[2], p[3], p[4]);
                let flags = Eflags::validate_user(eflags, false).map_err(HypercallError::BadFlags)?;
                process.with_guest(k.irq(), |g| {
                    g.mode = GuestMode::User;
                    g.esp0 = esp0;
                    g.interrupts_enabled = flags.into_bits() & Eflags::IF != 0;
                });
                k.recompile(process)?;
                let mut next = TrapFrame::guest(eip, esp, host_eflags(eflags));
                carry_registers(&mut next, frame);
                next.eax = eax;
                Ok(Flow::Resume(next))
            },
        },
        Hypercall {
            name: "setidt",
            params: 3,
            run: |k, process, _, p| {
                let (vector, eip, privileged) = (p[0] as usize, p[1], p[2] != 0);
                if vector >= VECTOR_COUNT {
                    return Err(HypercallError::Invalid);
                }
                let entry = (eip != 0).then_some(VirtualIdtEntry { eip, privileged });
                process.with_guest(k.irq(), |g| g.idt[vector] = entry);
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "disable_interrupts",
            params: 0,
            run: |k, process, _, _| Ok(set_interrupts(k, process, false)),
        },
        Hypercall {
            name: "enable_interrupts",
            params: 0,
            run: |k, process, _, _| Ok(set_interrupts(k, process, true)),
        },
        Hypercall {
            name: "setpd",
            params: 2,
            run: |k, process, frame, p| {
                let (directory, wp) = (p[0], p[1] != 0);
                if directory % PAGE_SIZE != 0 || directory >= GUEST_MEM_SIZE {
                    return Err(HypercallError::Invalid);
                }
                process.with_guest(k.irq(), |g| {
                    g.guest_cr3 = Some(directory);
                    g.wp = wp;
                });
                k.recompile(process)?;
                Ok(Flow::Resume(TrapFrame { eax: 0, ..*frame }))
            },
        },
        Hypercall {
            name: "adjustpg",
            params: 1,
            run: |k, process, _, p| {
                k.invalidate_guest(process, p[0])?;
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "print",
            params: 2,
            run: |k, process, _, p| {
                let text = guest_text(k, process, p[0], p[1])?;
                k.print(&text);
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "set_color",
            params: 1,
            run: |k, _, _, p| {
                k.set_term_color(p[0])?;
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "set_cursor",
            params: 2,
            run: |k, _, _, p| {
                k.set_cursor_pos(p[0], p[1])?;
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "get_cursor",
            params: 2,
            run: |k, process, _, p| {
                let (row_at, col_at) = (rebase(p[0])?, rebase(p[1])?);
                k.check_user(process, row_at, 4, Access::Write)?;
                k.check_user(process, col_at, 4, Access::Write)?;
                let (row, col) = k.get_cursor_pos();
                k.write_user_u32(process, row_at, row as u32)?;
                k.write_user_u32(process, col_at, col as u32)?;
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "print_at",
            params: 5,
            run: |k, process, _, p| {
                let text = guest_text(k, process, p[0], p[1])?;
                k.print_at(&text, p[2], p[3], p[4])?;
                Ok(Flow::Return(0))
            },
        },
        Hypercall {
            name: "get_cr2",
            params: 0,
            run: |k, process, _, _| Ok(Flow::Return(process.with_guest(k.irq(), |g| g.cr2).unwrap_or(0))),
        },
    ];
    HypercallTable { ops }
}

impl<A: Arch> Kernel<A> {
    /// Services the hypercall in `frame`. Returns with the result in
    /// `frame.eax`; operations that change the guest's paging or end it do
    /// not return.
    pub(crate) fn hypercall(&self, frame: &mut TrapFrame) {
        let Some(process) = self.current_process() else {
            frame.eax = HypercallError::NotGuest.code() as u32;
            return;
        };
        let Some(mode) = process.with_guest(self.irq(), |g| g.mode) else {
            debug!("hv: pid {} is not a guest, hypercall {} refused", process.pid(), frame.eax);
            frame.eax = HypercallError::NotGuest.code() as u32;
            return;
        };
        if mode == GuestMode::User {
            drop(process);
            self.guest_bad_gate(frame);
        }

        let op = frame.eax;
        let flow = self.run_hypercall(&process, frame);
        drop(process);
        match flow {
            Ok(Flow::Return(value)) => frame.eax = value,
            Ok(Flow::Resume(next)) => self.flush_and_resume(&next),
            Ok(Flow::Exit(status)) => {
                debug!("hv: guest thread {} exits with {status}", self.cpu().current());
                self.set_status(status);
                self.vanish_current()
            }
            Err(e) if e.is_fatal() => self.crash_guest(e),
            Err(e) => {
                debug!("hv: hypercall {op} rejected: {e}");
                frame.eax = e.code() as u32;
            }
        }
    }

    fn run_hypercall(&self, process: &Process, frame: &TrapFrame) -> Result<Flow, HypercallError> {
        let op = self.hypercalls.get(frame.eax).ok_or(HypercallError::UnknownOp(frame.eax))?;
        let params = if op.params == 0 {
            Vec::new()
        } else {
            let block = frame.esp.checked_add(4).ok_or(HypercallError::BadAddress(frame.esp))?;
            self.read_user_words(process, rebase(block)?, op.params)?
        };
        trace!("hv: pid {} {}{params:x?}", process.pid(), op.name);
        (op.run)(self, process, frame, &params)
    }
}
