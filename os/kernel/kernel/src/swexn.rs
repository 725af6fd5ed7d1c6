//! # User Software-Exception Handlers
//!
//! A thread may register one handler with its own stack. When the thread
//! takes a fault the kernel does not resolve itself, the handler runs on
//! that stack with the saved registers as a [`Ureg`]:
//!
//! ```text
//!  esp3 ┌───────────────┐ (exclusive top of the handler stack)
//!       │ Ureg          │ 20 words
//!       ├───────────────┤ ◄─ ureg
//!       │ &ureg         │
//!       │ arg           │
//!       │ 0             │ return address
//!       └───────────────┘ ◄─ esp on handler entry
//! ```
//!
//! Delivery is one-shot: the registration is dropped before the handler
//! runs, and a thread without a handler is killed by the fault chain.

use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::trap::{TrapFrame, selectors};
use kernel_info::memory::{USER_MEM_START, is_user_address};
use kernel_memory_addresses::VirtualAddress;
use kernel_registers::{Eflags, EflagsViolation};
use kernel_vmem::{Access, AccessError};
use log::debug;

/// A registered handler.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SwexnHandler {
    /// One past the highest byte of the handler stack.
    pub esp3: u32,
    pub eip: u32,
    pub arg: u32,
}

/// Why a `swexn` request was refused. Nothing changed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwexnError {
    #[error("handler stack is not writable user memory")]
    BadStack,
    #[error("handler entry is not user memory")]
    BadHandler,
    #[error("register set uses a foreign segment")]
    BadSegments,
    #[error("register set has invalid flags: {0:?}")]
    BadFlags(EflagsViolation),
    #[error(transparent)]
    Access(#[from] AccessError),
}

/// Register dump handed to a handler, and the layout of `newureg`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Ureg {
    pub cause: u32,
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub zero: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Words in a [`Ureg`].
pub const UREG_WORDS: usize = 20;
const UREG_SIZE: u32 = UREG_WORDS as u32 * 4;

const _: () = assert!(size_of::<Ureg>() == UREG_SIZE as usize);

impl Ureg {
    #[must_use]
    pub const fn from_frame(frame: &TrapFrame) -> Self {
        Self {
            cause: frame.vector,
            cr2: frame.cr2,
            ds: frame.ds,
            es: frame.es,
            fs: frame.fs,
            gs: frame.gs,
            edi: frame.edi,
            esi: frame.esi,
            ebp: frame.ebp,
            zero: 0,
            ebx: frame.ebx,
            edx: frame.edx,
            ecx: frame.ecx,
            eax: frame.eax,
            error_code: frame.error_code,
            eip: frame.eip,
            cs: frame.cs,
            eflags: frame.eflags,
            esp: frame.esp,
            ss: frame.ss,
        }
    }

    #[must_use]
    pub const fn from_words(w: &[u32; UREG_WORDS]) -> Self {
        Self {
            cause: w[0],
            cr2: w[1],
            ds: w[2],
            es: w[3],
            fs: w[4],
            gs: w[5],
            edi: w[6],
            esi: w[7],
            ebp: w[8],
            zero: w[9],
            ebx: w[10],
            edx: w[11],
            ecx: w[12],
            eax: w[13],
            error_code: w[14],
            eip: w[15],
            cs: w[16],
            eflags: w[17],
            esp: w[18],
            ss: w[19],
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; UREG_WORDS * 4] {
        let words = [
            self.cause,
            self.cr2,
            self.ds,
            self.es,
            self.fs,
            self.gs,
            self.edi,
            self.esi,
            self.ebp,
            self.zero,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.error_code,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ];
        let mut out = [0; UREG_WORDS * 4];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Checks that user code may adopt these registers and builds the frame
    /// to return with.
    ///
    /// # Errors
    /// [`SwexnError::BadSegments`] or [`SwexnError::BadFlags`].
    pub fn to_user_frame(&self) -> Result<TrapFrame, SwexnError> {
        if self.cs != selectors::USER_CS
            || [self.ss, self.ds, self.es, self.fs, self.gs].iter().any(|s| *s != selectors::USER_DS)
        {
            return Err(SwexnError::BadSegments);
        }
        let eflags = Eflags::validate_user(self.eflags, true).map_err(SwexnError::BadFlags)?;
        let mut frame = TrapFrame::user(self.eip, self.esp, eflags.into_bits());
        frame.edi = self.edi;
        frame.esi = self.esi;
        frame.ebp = self.ebp;
        frame.ebx = self.ebx;
        frame.edx = self.edx;
        frame.ecx = self.ecx;
        frame.eax = self.eax;
        Ok(frame)
    }
}

impl<A: Arch> Kernel<A> {
    /// `swexn(esp3, eip, arg, newureg)`. A zero `esp3` or `eip` removes the
    /// handler. Returns the frame to adopt when `newureg` is given.
    ///
    /// # Errors
    /// See [`SwexnError`]; on error neither the handler nor the registers
    /// change.
    pub fn swexn(&self, esp3: u32, eip: u32, arg: u32, newureg: u32) -> Result<Option<TrapFrame>, SwexnError> {
        let Some(process) = self.current_process() else {
            return Err(SwexnError::BadHandler);
        };
        let handler = if esp3 == 0 || eip == 0 {
            None
        } else {
            if esp3 <= USER_MEM_START + UREG_SIZE + 12 {
                return Err(SwexnError::BadStack);
            }
            let _r = process.memlock.read(self);
            let space = self.space_of(&process);
            self.masked(|| space.check_user_range(VirtualAddress::new(esp3 - UREG_SIZE - 12), UREG_SIZE + 12, Access::Write))
                .map_err(|_| SwexnError::BadStack)?;
            if !is_user_address(VirtualAddress::new(eip)) {
                return Err(SwexnError::BadHandler);
            }
            Some(SwexnHandler { esp3, eip, arg })
        };

        let adopt = if newureg == 0 {
            None
        } else {
            let words = self.read_user_words(&process, VirtualAddress::new(newureg), UREG_WORDS)?;
            let mut buf = [0u32; UREG_WORDS];
            buf.copy_from_slice(&words);
            Some(Ureg::from_words(&buf).to_user_frame()?)
        };

        self.current_thread().set_swexn(self.irq(), handler);
        Ok(adopt)
    }

    /// Runs the calling thread's handler for `frame`, or kills the thread.
    pub(crate) fn deliver_swexn_or_kill(&self, frame: &TrapFrame) -> ! {
        let tid = self.cpu().current();
        let handler = self.current_thread().take_swexn(self.irq());
        let Some(handler) = handler else {
            debug!("swexn: thread {tid} has no handler for vector {}, killing", frame.vector);
            self.vanish_current();
        };
        let Some(process) = self.current_process() else {
            self.vanish_current();
        };

        let ureg_at = handler.esp3 - UREG_SIZE;
        let esp = ureg_at - 12;
        let mut block = [0u8; UREG_WORDS * 4 + 12];
        block[4..8].copy_from_slice(&handler.arg.to_le_bytes());
        block[8..12].copy_from_slice(&ureg_at.to_le_bytes());
        block[12..].copy_from_slice(&Ureg::from_frame(frame).to_bytes());
        if let Err(e) = self.copy_out(&process, VirtualAddress::new(esp), &block) {
            debug!("swexn: thread {tid} handler stack unusable ({e}), killing");
            drop(process);
            self.vanish_current();
        }
        drop(process);

        debug!("swexn: thread {tid} vector {} -> handler {:#x}", frame.vector, handler.eip);
        self.return_to_user(TrapFrame::user(handler.eip, esp, Eflags::user_default().into_bits()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;
    use crate::testkit::{USER_DATA, USER_ENTRY, booted, expect_vanish, trap_from_user, user_frame};
    use crate::trap::vectors;

    #[test]
    fn ureg_matches_the_saved_frame() {
        let mut frame = TrapFrame::user(0x0100_0040, 0xFFFF_EFF0, Eflags::user_default().into_bits());
        frame.vector = 14;
        frame.cr2 = 0;
        frame.error_code = 0b110;
        frame.eax = 7;
        let ureg = Ureg::from_frame(&frame);
        let bytes = ureg.to_bytes();
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 14);
        assert_eq!(u32::from_le_bytes(bytes[52..56].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(bytes[60..64].try_into().unwrap()), 0x0100_0040);
        assert_eq!(ureg.to_user_frame().unwrap().eip, 0x0100_0040);
    }

    #[test]
    fn foreign_registers_are_refused() {
        let frame = TrapFrame::user(0x0100_0040, 0xFFFF_EFF0, Eflags::user_default().into_bits());
        let mut ureg = Ureg::from_frame(&frame);
        ureg.cs = selectors::KERNEL_CS;
        assert_eq!(ureg.to_user_frame(), Err(SwexnError::BadSegments));

        let mut ureg = Ureg::from_frame(&frame);
        ureg.eflags |= 3 << 12;
        assert_eq!(ureg.to_user_frame(), Err(SwexnError::BadFlags(EflagsViolation::PrivilegedBits)));

        let mut ureg = Ureg::from_frame(&frame);
        ureg.eflags &= !Eflags::IF;
        assert_eq!(ureg.to_user_frame(), Err(SwexnError::BadFlags(EflagsViolation::InterruptsDisabled)));
    }

    const HANDLER_STACK: u32 = 0x0300_0000;
    const FAULT_AT: u32 = 0x0500_0000;

    fn register_handler(k: &Kernel<SimArch>) -> u32 {
        let process = k.current_process().unwrap();
        k.new_pages(&process, VirtualAddress::new(HANDLER_STACK), 0x1000).unwrap();
        drop(process);
        let esp3 = HANDLER_STACK + 0x1000;
        assert_eq!(k.swexn(esp3, USER_ENTRY + 4, 0x55, 0), Ok(None));
        esp3
    }

    fn page_fault(k: &Kernel<SimArch>) -> TrapFrame {
        trap_from_user(k, vectors::PAGE_FAULT, |f| {
            f.cr2 = FAULT_AT;
            f.error_code = 0b110;
        })
    }

    #[test]
    fn unresolved_fault_runs_the_handler_once() {
        let (k, _) = booted();
        let esp3 = register_handler(&k);

        let entered = page_fault(&k);
        assert_eq!(entered.eip, USER_ENTRY + 4);
        assert_eq!(entered.esp, esp3 - UREG_SIZE - 12);
        assert!(entered.from_user());

        let process = k.current_process().unwrap();
        let words = k.read_user_words(&process, VirtualAddress::new(entered.esp), 5).unwrap();
        drop(process);
        assert_eq!(words, [0, 0x55, entered.esp + 12, vectors::PAGE_FAULT, FAULT_AT]);
        assert_eq!(k.current_thread().swexn(k.irq()), None);

        expect_vanish(&k, || {
            page_fault(&k);
        });
    }

    #[test]
    fn removed_handler_no_longer_catches_faults() {
        let (k, _) = booted();
        register_handler(&k);
        assert_eq!(k.swexn(0, 0, 0, 0), Ok(None));
        assert_eq!(k.current_thread().swexn(k.irq()), None);

        expect_vanish(&k, || {
            page_fault(&k);
        });
    }

    #[test]
    fn handler_stack_must_be_writable_user_memory() {
        let (k, _) = booted();
        assert_eq!(k.swexn(USER_MEM_START + 8, USER_ENTRY, 0, 0), Err(SwexnError::BadStack));
        assert_eq!(k.swexn(0x0700_0000, USER_ENTRY, 0, 0), Err(SwexnError::BadStack));
        assert_eq!(k.swexn(0, USER_ENTRY, 0, 0), Ok(None));
    }

    #[test]
    fn adopted_registers_are_validated() {
        let (k, _) = booted();
        let mut ureg = Ureg::from_frame(user_frame(&k));
        ureg.eip = USER_ENTRY + 8;
        let at = USER_DATA + 0x100;
        let process = k.current_process().unwrap();
        k.copy_out(&process, VirtualAddress::new(at), &ureg.to_bytes()).unwrap();
        drop(process);
        let adopted = k.swexn(0, 0, 0, at).unwrap().unwrap();
        assert_eq!(adopted.eip, USER_ENTRY + 8);

        ureg.cs = selectors::KERNEL_CS;
        let process = k.current_process().unwrap();
        k.copy_out(&process, VirtualAddress::new(at), &ureg.to_bytes()).unwrap();
        drop(process);
        assert_eq!(k.swexn(0, 0, 0, at), Err(SwexnError::BadSegments));
    }
}
