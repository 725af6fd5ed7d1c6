//! # i386
//!
//! The real machine: one core, legacy PIC and PIT, VGA text mode, 32-bit
//! paging without PAE.
//!
//! | Module | Provides |
//! |--------|----------|
//! | [`gdt`] | flat and guest segments, TSS `esp0` |
//! | [`idt`] | 256 trap stubs, gate table, `trap_return` |
//! | [`pic`] | interrupt controller, timer, keyboard port |
//! | [`ports`] | `in` / `out` |
//! | [`entry`] | `kernel_main`, global allocator, panic handler |

pub mod entry;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod ports;

use super::{Arch, CONSOLE_COLS, CONSOLE_ROWS, KernelContext};
use crate::trap::TrapFrame;
use kernel_alloc::WindowedPhysMapper;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_registers::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sync::{HardwareIrq, Irq};
use kernel_vmem::{Mmu, PageTable};
use ports::outb;

/// Physical (and identity-mapped) address of the VGA text buffer.
const VGA_BUFFER: usize = 0xB_8000;
const CRTC_INDEX: u16 = 0x3D4;
const CRTC_DATA: u16 = 0x3D5;

/// Translation control through CR3 and `invlpg`.
#[derive(Debug, Default, Copy, Clone)]
pub struct Cr3Mmu;

impl Mmu for Cr3Mmu {
    fn activate(&self, root: PhysicalPage) {
        // SAFETY: every directory the kernel activates carries the kernel half.
        unsafe { Cr3::from_directory(root).store_unsafe() };
    }

    fn active(&self) -> PhysicalPage {
        // SAFETY: reading CR3 has no side effects in ring 0.
        unsafe { Cr3::load_unsafe() }.directory()
    }

    fn invalidate(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u32(), options(nostack, preserves_flags));
        }
    }
}

core::arch::global_asm!(
    ".global switch_context",
    "switch_context:",
    "mov eax, [esp + 4]",
    "mov edx, [esp + 8]",
    "push ebp",
    "push ebx",
    "push esi",
    "push edi",
    "mov [eax], esp",
    "mov esp, [edx]",
    "pop edi",
    "pop esi",
    "pop ebx",
    "pop ebp",
    "ret",
    "",
    ".global thread_start",
    "thread_start:",
    "call {entry}",
    "ud2",
    entry = sym entry::thread_trampoline,
);

unsafe extern "C" {
    fn switch_context(from: *mut KernelContext, to: *const KernelContext);
    static thread_start: u8;
}

/// Callee-saved registers `switch_context` pops before returning.
const SAVED_REGISTERS: usize = 4;

pub struct X86 {
    mapper: WindowedPhysMapper<Cr3Mmu>,
}

impl X86 {
    /// # Safety
    /// `window` must be the kernel page table holding the frame-window
    /// slots, shared by every address space.
    pub const unsafe fn new(window: *mut PageTable) -> Self {
        Self {
            mapper: unsafe { WindowedPhysMapper::new(window, Cr3Mmu) },
        }
    }
}

impl Irq for X86 {
    #[inline]
    fn interrupts_enabled(&self) -> bool {
        HardwareIrq.interrupts_enabled()
    }

    #[inline]
    fn disable_interrupts(&self) {
        HardwareIrq.disable_interrupts();
    }

    #[inline]
    fn enable_interrupts(&self) {
        HardwareIrq.enable_interrupts();
    }
}

impl Mmu for X86 {
    fn activate(&self, root: PhysicalPage) {
        Cr3Mmu.activate(root);
    }

    fn active(&self) -> PhysicalPage {
        Cr3Mmu.active()
    }

    fn invalidate(&self, va: VirtualAddress) {
        Cr3Mmu.invalidate(va);
    }
}

impl Arch for X86 {
    type Mapper = WindowedPhysMapper<Cr3Mmu>;

    fn mapper(&self) -> &Self::Mapper {
        &self.mapper
    }

    fn cpu_id(&self) -> u32 {
        0
    }

    fn initial_context(&self, stack: PhysicalPage) -> KernelContext {
        // Below the user frame: the saved registers, then `thread_start` as
        // the return address of the first switch.
        let frame_at = stack.base().as_u32() + TrapFrame::user_frame_offset() as u32;
        let esp = frame_at - (SAVED_REGISTERS as u32 + 1) * 4;
        let words = esp as usize as *mut u32;
        // SAFETY: kernel stacks are identity-mapped kernel-pool frames owned
        // by the new thread.
        unsafe {
            for i in 0..SAVED_REGISTERS {
                words.add(i).write(0);
            }
            words.add(SAVED_REGISTERS).write((&raw const thread_start) as u32);
        }
        KernelContext { esp }
    }

    unsafe fn switch_context(&self, from: *mut KernelContext, to: *const KernelContext) {
        unsafe { switch_context(from, to) };
    }

    fn set_kernel_stack(&self, top: VirtualAddress) {
        gdt::set_kernel_stack(top.as_u32());
    }

    fn frame_pointer(&self) -> u32 {
        let ebp: u32;
        unsafe { core::arch::asm!("mov {}, ebp", out(reg) ebp, options(nomem, nostack, preserves_flags)) };
        ebp
    }

    fn resume(&self, frame: &TrapFrame) -> ! {
        let at: *const TrapFrame = frame;
        // SAFETY: `frame` lives on the current kernel stack above `esp`;
        // whatever lies below it is abandoned.
        unsafe {
            core::arch::asm!(
                "cli",
                "mov esp, {}",
                "jmp {ret}",
                in(reg) at,
                ret = sym idt::trap_return,
                options(noreturn),
            )
        }
    }

    fn end_of_interrupt(&self, vector: u32) {
        pic::end_of_interrupt(vector);
    }

    fn read_scancode(&self) -> u8 {
        pic::read_scancode()
    }

    fn wait_for_interrupt(&self) {
        unsafe { core::arch::asm!("sti", "hlt", options(nomem, nostack)) };
    }

    fn halt(&self) -> ! {
        loop {
            unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
        }
    }

    fn show(&self, cells: &[u16], cursor: (usize, usize)) {
        let buffer = VGA_BUFFER as *mut u16;
        for (i, cell) in cells.iter().take(CONSOLE_ROWS * CONSOLE_COLS).enumerate() {
            // SAFETY: the text buffer is identity-mapped and holds 80x25 cells.
            unsafe { buffer.add(i).write_volatile(*cell) };
        }
        let position = (cursor.0 * CONSOLE_COLS + cursor.1).min(CONSOLE_ROWS * CONSOLE_COLS - 1) as u16;
        unsafe {
            outb(CRTC_INDEX, 0x0F);
            outb(CRTC_DATA, (position & 0xFF) as u8);
            outb(CRTC_INDEX, 0x0E);
            outb(CRTC_DATA, (position >> 8) as u8);
        }
    }
}
