//! # 8259 PIC and 8253 PIT
//!
//! The two PICs are remapped so their lines land on vectors `0x20..0x30`,
//! right after the exceptions. Only the timer (line 0) and the keyboard
//! (line 1) are unmasked.

use super::ports::{inb, io_wait, outb};
use crate::trap::vectors;

const MASTER_CMD: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_CMD: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const EOI: u8 = 0x20;

/// Lines on the slave controller.
const SLAVE_BASE: u32 = vectors::TIMER + 8;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;
/// Channel 0, lobyte/hibyte, rate generator.
const PIT_MODE: u8 = 0x34;
const PIT_HZ: u32 = 1_193_182;

/// Keyboard controller data port.
pub const KEYBOARD_DATA: u16 = 0x60;

/// Remaps both PICs and masks everything but timer and keyboard.
///
/// # Safety
/// Interrupts must be off; the IDT must cover vectors `0x20..0x30`.
pub unsafe fn init() {
    unsafe {
        outb(MASTER_CMD, ICW1_INIT);
        io_wait();
        outb(SLAVE_CMD, ICW1_INIT);
        io_wait();
        outb(MASTER_DATA, vectors::TIMER as u8);
        io_wait();
        outb(SLAVE_DATA, SLAVE_BASE as u8);
        io_wait();
        // Slave on line 2.
        outb(MASTER_DATA, 0b0000_0100);
        io_wait();
        outb(SLAVE_DATA, 2);
        io_wait();
        outb(MASTER_DATA, ICW4_8086);
        io_wait();
        outb(SLAVE_DATA, ICW4_8086);
        io_wait();

        outb(MASTER_DATA, 0b1111_1100);
        outb(SLAVE_DATA, 0xFF);
    }
}

/// Programs the PIT to fire every `period_ms` milliseconds.
///
/// # Safety
/// Interrupts must be off.
pub unsafe fn init_timer(period_ms: u32) {
    let divisor = (PIT_HZ * period_ms.max(1) / 1000).clamp(1, 0xFFFF);
    unsafe {
        outb(PIT_COMMAND, PIT_MODE);
        outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
        outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    }
}

/// Acknowledges the line behind `vector`.
pub fn end_of_interrupt(vector: u32) {
    if !(vectors::TIMER..vectors::TIMER + 16).contains(&vector) {
        return;
    }
    unsafe {
        if vector >= SLAVE_BASE {
            outb(SLAVE_CMD, EOI);
        }
        outb(MASTER_CMD, EOI);
    }
}

/// Reads the pending scan code.
pub fn read_scancode() -> u8 {
    unsafe { inb(KEYBOARD_DATA) }
}
