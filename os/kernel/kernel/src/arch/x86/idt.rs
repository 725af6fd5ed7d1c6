//! # IDT and Trap Stubs
//!
//! All 256 vectors get a 16-byte stub in one table. Each stub evens out the
//! error code, pushes its vector and jumps to a common path that completes
//! the [`TrapFrame`](crate::trap::TrapFrame) and calls the kernel:
//!
//! ```text
//! trap_stub_table + 16 * v:   [push 0]  push v  jmp trap_common
//!
//! trap_common:  pusha, push ds/es/fs/gs, push cr2
//!               load kernel data segments
//!               trap_entry(&frame)
//! trap_return:  pop cr2/gs/fs/es/ds, popa, drop vector+error, iretd
//! ```
//!
//! Every gate is an interrupt gate, so handlers start with interrupts
//! off. Gates user code may raise with `int` have DPL 3: the system call
//! range and the hypercall vector.

use crate::trap::{selectors, vectors};
use bitfield_struct::bitfield;
use kernel_syscall::Sysno;

/// One 8-byte interrupt gate.
#[bitfield(u64)]
pub struct GateDescriptor {
    pub offset_lo: u16,
    pub selector: u16,
    pub reserved: u8,
    /// `0b1110`: 32-bit interrupt gate.
    #[bits(4)]
    pub typ: u8,
    pub zero: bool,
    #[bits(2)]
    pub dpl: u8,
    pub p: bool,
    pub offset_hi: u16,
}

const INTERRUPT_GATE: u8 = 0b1110;
const STUB_SIZE: u32 = 16;

impl GateDescriptor {
    #[must_use]
    pub const fn interrupt(handler: u32, dpl: u8) -> Self {
        Self::new()
            .with_offset_lo(handler as u16)
            .with_offset_hi((handler >> 16) as u16)
            .with_selector(selectors::KERNEL_CS as u16)
            .with_typ(INTERRUPT_GATE)
            .with_dpl(dpl)
            .with_p(true)
    }
}

core::arch::global_asm!(
    ".section .text",
    ".balign 16",
    ".global trap_stub_table",
    "trap_stub_table:",
    ".set vec, 0",
    ".rept 256",
    ".balign 16",
    ".if !((vec == 8) || ((vec >= 10) && (vec <= 14)) || (vec == 17))",
    "push 0",
    ".endif",
    "push vec",
    "jmp trap_common",
    ".set vec, vec + 1",
    ".endr",
    "",
    "trap_common:",
    "pushad",
    "push ds",
    "push es",
    "push fs",
    "push gs",
    "mov eax, cr2",
    "push eax",
    "mov ax, {kernel_ds}",
    "mov ds, ax",
    "mov es, ax",
    "mov fs, ax",
    "mov gs, ax",
    "mov eax, esp",
    "push eax",
    "call {entry}",
    "add esp, 4",
    ".global trap_return",
    "trap_return:",
    "add esp, 4",
    "pop gs",
    "pop fs",
    "pop es",
    "pop ds",
    "popad",
    "add esp, 8",
    "iretd",
    kernel_ds = const selectors::KERNEL_DS,
    entry = sym super::entry::trap_entry,
);

unsafe extern "C" {
    static trap_stub_table: u8;
    /// Restores a [`TrapFrame`](crate::trap::TrapFrame) sitting at `esp`.
    pub fn trap_return() -> !;
}

static mut IDT: [GateDescriptor; 256] = [GateDescriptor::new(); 256];

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Privilege user code needs to raise `vector` with `int`.
const fn gate_dpl(vector: u32) -> u8 {
    if vector == vectors::HYPERCALL || Sysno::is_reserved(vector) { 3 } else { 0 }
}

/// Fills every gate and loads the IDT.
///
/// # Safety
/// Call once, after the GDT, with interrupts off.
pub unsafe fn init() {
    unsafe {
        let base = (&raw const trap_stub_table) as u32;
        let idt = &mut *(&raw mut IDT);
        for (vector, gate) in (0u32..).zip(idt.iter_mut()) {
            *gate = GateDescriptor::interrupt(base + vector * STUB_SIZE, gate_dpl(vector));
        }
        let pointer = DescriptorPointer {
            limit: (size_of::<[GateDescriptor; 256]>() - 1) as u16,
            base: (&raw const IDT) as u32,
        };
        core::arch::asm!("lidt [{}]", in(reg) &raw const pointer, options(readonly, nostack, preserves_flags));
    }
}
