//! # I/O Port Access
//!
//! Thin wrappers around `in`/`out` for the legacy devices the kernel drives:
//!
//! ```text
//! 0x0020-0x0021   PIC #1 (master)
//! 0x0040-0x0043   PIT
//! 0x0060          keyboard data
//! 0x00A0-0x00A1   PIC #2 (slave)
//! 0x03D4-0x03D5   CRT controller (cursor)
//! ```
//!
//! ## Safety
//! Every access talks to hardware directly. Callers must run at CPL 0,
//! target the intended device register, and serialize multi-step
//! protocols against interrupt handlers touching the same device.

/// Write one byte to an I/O port.
///
/// # Safety
/// - **Privilege:** CPL 0, otherwise `#GP`.
/// - **Correct port:** `port` must belong to the intended device and accept
///   `val` in its current state.
/// - **Ordering:** `out` is not a memory fence.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port.
///
/// # Safety
/// - **Privilege:** CPL 0, otherwise `#GP`.
/// - **Correct port:** `port` must be a readable register of the intended
///   device; some reads acknowledge device state.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let mut v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}

/// Short delay for devices that need time between accesses (write to the
/// unused POST port).
#[inline]
pub fn io_wait() {
    unsafe { outb(0x80, 0) };
}
