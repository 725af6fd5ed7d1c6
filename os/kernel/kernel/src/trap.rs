//! # Trap Frames
//!
//! Every entry into the kernel (exception, hardware interrupt, syscall,
//! hypercall) saves the interrupted register state as a [`TrapFrame`] on the
//! current kernel stack. Traps arriving from user mode always land at the very
//! top of the thread's kernel stack, so a thread's user frame has a fixed
//! address ([`TrapFrame::user_frame_offset`]).
//!
//! ```text
//!  high ┌──────────┐ ◄─ kernel stack top (TSS esp0)
//!       │ ss       │  pushed by the CPU on a ring change
//!       │ esp      │
//!       │ eflags   │  pushed by the CPU
//!       │ cs       │
//!       │ eip      │
//!       │ error    │  CPU or stub (0)
//!       │ vector   │  stub
//!       │ eax..edi │  pusha
//!       │ ds..gs   │  stub
//!  low  │ cr2      │  stub
//!       └──────────┘ ◄─ &TrapFrame
//! ```

use core::fmt;
use kernel_info::memory::KERNEL_STACK_SIZE;

/// Segment selectors installed in the GDT.
pub mod selectors {
    /// Ring-0 code.
    pub const KERNEL_CS: u32 = 0x08;
    /// Ring-0 data.
    pub const KERNEL_DS: u32 = 0x10;
    /// Ring-3 flat code.
    pub const USER_CS: u32 = 0x1B;
    /// Ring-3 flat data.
    pub const USER_DS: u32 = 0x23;
    /// Ring-3 code with base `GUEST_BASE`, used by guest kernels.
    pub const GUEST_CS: u32 = 0x2B;
    /// Ring-3 data with base `GUEST_BASE`, used by guest kernels.
    pub const GUEST_DS: u32 = 0x33;
    /// Task state segment.
    pub const TSS: u32 = 0x38;
}

/// Interrupt vectors with a fixed meaning.
pub mod vectors {
    pub const DIVIDE: u32 = 0;
    pub const DEBUG: u32 = 1;
    pub const NMI: u32 = 2;
    pub const BREAKPOINT: u32 = 3;
    pub const OVERFLOW: u32 = 4;
    pub const BOUND: u32 = 5;
    pub const INVALID_OPCODE: u32 = 6;
    pub const DEVICE_NOT_AVAILABLE: u32 = 7;
    pub const DOUBLE_FAULT: u32 = 8;
    pub const COPROCESSOR_SEGMENT: u32 = 9;
    pub const INVALID_TSS: u32 = 10;
    pub const SEGMENT_NOT_PRESENT: u32 = 11;
    pub const STACK_FAULT: u32 = 12;
    pub const GENERAL_PROTECTION: u32 = 13;
    pub const PAGE_FAULT: u32 = 14;
    pub const FPU_ERROR: u32 = 16;
    pub const ALIGNMENT_CHECK: u32 = 17;
    pub const MACHINE_CHECK: u32 = 18;
    pub const SIMD: u32 = 19;

    /// First vector past the architectural exceptions.
    pub const EXCEPTION_END: u32 = 32;

    /// Remapped PIC line 0.
    pub const TIMER: u32 = 0x20;
    /// Remapped PIC line 1.
    pub const KEYBOARD: u32 = 0x21;

    /// Hypercall gate.
    pub const HYPERCALL: u32 = 0x80;

    /// Exceptions that push an error code.
    #[must_use]
    pub const fn has_error_code(vector: u32) -> bool {
        matches!(vector, 8 | 10..=14 | 17)
    }
}

/// Register state saved on kernel entry.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub cr2: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Value of `esp` pushed by `pusha`; ignored on restore.
    pub kernel_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Only valid for traps from user mode.
    pub esp: u32,
    /// Only valid for traps from user mode.
    pub ss: u32,
}

const _: () = assert!(size_of::<TrapFrame>() == 20 * 4);

impl TrapFrame {
    /// Offset of a user-origin frame from the bottom of a kernel stack.
    #[must_use]
    pub const fn user_frame_offset() -> usize {
        KERNEL_STACK_SIZE as usize - size_of::<Self>()
    }

    /// Interrupted code ran at CPL 3.
    #[inline]
    #[must_use]
    pub const fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Interrupted code ran in a guest kernel's segments.
    #[inline]
    #[must_use]
    pub const fn from_guest(&self) -> bool {
        self.cs == selectors::GUEST_CS
    }

    /// Flat ring-3 frame starting at `eip` with stack `esp`.
    #[must_use]
    pub const fn user(eip: u32, esp: u32, eflags: u32) -> Self {
        Self::with_segments(eip, esp, eflags, selectors::USER_CS, selectors::USER_DS)
    }

    /// Guest-segment frame; `eip`/`esp` are guest-relative.
    #[must_use]
    pub const fn guest(eip: u32, esp: u32, eflags: u32) -> Self {
        Self::with_segments(eip, esp, eflags, selectors::GUEST_CS, selectors::GUEST_DS)
    }

    const fn with_segments(eip: u32, esp: u32, eflags: u32, cs: u32, ds: u32) -> Self {
        Self {
            cr2: 0,
            gs: ds,
            fs: ds,
            es: ds,
            ds,
            edi: 0,
            esi: 0,
            ebp: 0,
            kernel_esp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            vector: 0,
            error_code: 0,
            eip,
            cs,
            eflags,
            esp,
            ss: ds,
        }
    }

    /// The frame as the word sequence it occupies in memory.
    #[must_use]
    pub fn to_words(&self) -> [u32; 20] {
        [
            self.cr2,
            self.gs,
            self.fs,
            self.es,
            self.ds,
            self.edi,
            self.esi,
            self.ebp,
            self.kernel_esp,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.vector,
            self.error_code,
            self.eip,
            self.cs,
            self.eflags,
            self.esp,
            self.ss,
        ]
    }

    /// Inverse of [`to_words`](Self::to_words).
    #[must_use]
    pub const fn from_words(w: &[u32; 20]) -> Self {
        Self {
            cr2: w[0],
            gs: w[1],
            fs: w[2],
            es: w[3],
            ds: w[4],
            edi: w[5],
            esi: w[6],
            ebp: w[7],
            kernel_esp: w[8],
            ebx: w[9],
            edx: w[10],
            ecx: w[11],
            eax: w[12],
            vector: w[13],
            error_code: w[14],
            eip: w[15],
            cs: w[16],
            eflags: w[17],
            esp: w[18],
            ss: w[19],
        }
    }
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "vector {:#04x} error {:#010x} cr2 {:#010x}",
            self.vector, self.error_code, self.cr2
        )?;
        writeln!(
            f,
            "eax {:#010x} ebx {:#010x} ecx {:#010x} edx {:#010x}",
            self.eax, self.ebx, self.ecx, self.edx
        )?;
        writeln!(
            f,
            "esi {:#010x} edi {:#010x} ebp {:#010x} esp {:#010x}",
            self.esi, self.edi, self.ebp, self.esp
        )?;
        writeln!(
            f,
            "eip {:#010x} eflags {:#010x} cs {:#06x} ss {:#06x}",
            self.eip, self.eflags, self.cs, self.ss
        )?;
        write!(
            f,
            "ds {:#06x} es {:#06x} fs {:#06x} gs {:#06x}",
            self.ds, self.es, self.fs, self.gs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_classification() {
        let user = TrapFrame::user(0x0100_0000, 0xFFFF_F000, 0x202);
        assert!(user.from_user() && !user.from_guest());

        let guest = TrapFrame::guest(0x1000, 0x10_0000, 0x202);
        assert!(guest.from_user() && guest.from_guest());

        let kernel = TrapFrame {
            cs: selectors::KERNEL_CS,
            ..TrapFrame::default()
        };
        assert!(!kernel.from_user());
    }

    #[test]
    fn word_layout_matches_struct() {
        let mut frame = TrapFrame::user(1, 2, 3);
        frame.eax = 7;
        frame.cr2 = 9;
        let words = frame.to_words();
        assert_eq!(words[0], 9);
        assert_eq!(words[12], 7);
        assert_eq!(words[15], 1);
        assert_eq!(TrapFrame::from_words(&words), frame);
    }

    #[test]
    fn user_frame_sits_at_stack_top() {
        assert_eq!(TrapFrame::user_frame_offset() + size_of::<TrapFrame>(), 4096);
    }
}
