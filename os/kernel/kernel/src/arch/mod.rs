//! # Architecture Seam
//!
//! Everything the portable kernel needs from the machine, behind [`Arch`]:
//! interrupt masking ([`Irq`]), translation control ([`Mmu`]), reaching
//! physical frames ([`PhysMapper`]), kernel context switches, one-way returns
//! to user mode, the text-mode screen and halting.
//!
//! The i386 implementation lives in [`x86`] and is only built for
//! `target_arch = "x86"`. Host tests use a recording double.

use crate::trap::TrapFrame;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_sync::Irq;
use kernel_vmem::{Mmu, PhysMapper};

#[cfg(target_arch = "x86")]
pub mod x86;

#[cfg(test)]
pub(crate) mod sim;

/// Saved kernel stack pointer of a switched-out thread. Callee-saved
/// registers live on the stack it points to.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelContext {
    pub esp: u32,
}

/// Text-mode screen geometry.
pub const CONSOLE_ROWS: usize = 25;
pub const CONSOLE_COLS: usize = 80;

/// One machine.
pub trait Arch: Irq + Mmu + Sync {
    type Mapper: PhysMapper + Sync;

    fn mapper(&self) -> &Self::Mapper;

    /// Index of the calling core.
    fn cpu_id(&self) -> u32;

    /// Context that, when switched to, enters the kernel's new-thread path
    /// on `stack` with the user frame at the top of that stack.
    fn initial_context(&self, stack: PhysicalPage) -> KernelContext;

    /// Saves the callee-saved state into `from` and continues from `to`.
    /// Returns when some core switches back to `from`.
    ///
    /// # Safety
    /// Both pointers must be valid thread contexts owned by the calling
    /// core; `to` must have been produced by a switch or by
    /// [`initial_context`](Self::initial_context).
    unsafe fn switch_context(&self, from: *mut KernelContext, to: *const KernelContext);

    /// Kernel stack used for the next ring change (TSS `esp0`).
    fn set_kernel_stack(&self, top: VirtualAddress);

    /// Frame pointer of the caller.
    fn frame_pointer(&self) -> u32;

    /// Leaves the kernel by restoring `frame`. Never returns; everything on
    /// the current kernel stack below the frame is abandoned.
    fn resume(&self, frame: &TrapFrame) -> !;

    /// Acknowledges device interrupt `vector` at the interrupt controller.
    fn end_of_interrupt(&self, vector: u32);

    /// Raw scan code of the pending keyboard interrupt.
    fn read_scancode(&self) -> u8;

    /// Waits for the next interrupt.
    fn wait_for_interrupt(&self);

    /// Stops the machine.
    fn halt(&self) -> !;

    /// Shows a full console grid (`attribute << 8 | character` cells) and
    /// places the hardware cursor.
    fn show(&self, cells: &[u16], cursor: (usize, usize));
}
