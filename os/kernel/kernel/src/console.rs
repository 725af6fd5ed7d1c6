//! # Virtual Consoles
//!
//! A fixed set of text consoles, one of them shown on the screen. Each keeps
//! its own cell grid, cursor, color and a ring of raw keyboard scan codes.
//! The keyboard interrupt only appends the raw code to the active console;
//! codes are decoded when a reader consumes them.
//!
//! Consoles are reference counted by the processes attached to them. A
//! console whose count drops to zero is destroyed unless it is on screen.

use crate::arch::{Arch, CONSOLE_COLS, CONSOLE_ROWS};
use crate::hv::virq;
use crate::kernel::Kernel;
use crate::kmutex::Blocker;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::config::KernelConfig;
use log::{debug, trace};

const CELLS: usize = CONSOLE_ROWS * CONSOLE_COLS;

/// A console request that cannot be honored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsoleError {
    #[error("position ({0}, {1}) is off screen")]
    BadPosition(u32, u32),
    #[error("color {0:#x} is not an attribute byte")]
    BadColor(u32),
    #[error("all consoles are in use")]
    NoFreeConsole,
}

const PLAIN: &[u8; 58] = b"\0\x1b1234567890-=\x08\tqwertyuiop[]\n\0asdfghjkl;'`\0\\zxcvbnm,./\0*\0 ";
const SHIFTED: &[u8; 58] = b"\0\x1b!@#$%^&*()_+\x08\tQWERTYUIOP{}\n\0ASDFGHJKL:\"~\0|ZXCVBNM<>?\0*\0 ";

const EXTENDED_PREFIX: u8 = 0xE0;
const BREAK: u8 = 0x80;
const LEFT_SHIFT: u8 = 0x2A;
const RIGHT_SHIFT: u8 = 0x36;
const CTRL: u8 = 0x1D;
const CAPS_LOCK: u8 = 0x3A;
const ENTER: u8 = 0x1C;
const SLASH: u8 = 0x35;

/// Scan-code set 1 decoder for a US layout.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Decoder {
    extended: bool,
    left_shift: bool,
    right_shift: bool,
    ctrl: bool,
    caps: bool,
}

impl Decoder {
    /// Feeds one scan code; returns the character it completes, if any.
    pub fn feed(&mut self, code: u8) -> Option<u8> {
        if code == EXTENDED_PREFIX {
            self.extended = true;
            return None;
        }
        if core::mem::take(&mut self.extended) {
            return match code {
                CTRL => {
                    self.ctrl = true;
                    None
                }
                c if c == CTRL | BREAK => {
                    self.ctrl = false;
                    None
                }
                ENTER => Some(b'\n'),
                SLASH => Some(b'/'),
                _ => None,
            };
        }
        if code & BREAK != 0 {
            match code & !BREAK {
                LEFT_SHIFT => self.left_shift = false,
                RIGHT_SHIFT => self.right_shift = false,
                CTRL => self.ctrl = false,
                _ => {}
            }
            return None;
        }
        match code {
            LEFT_SHIFT => self.left_shift = true,
            RIGHT_SHIFT => self.right_shift = true,
            CTRL => self.ctrl = true,
            CAPS_LOCK => self.caps = !self.caps,
            _ => {}
        }
        let shift = self.left_shift || self.right_shift;
        let table = if shift { SHIFTED } else { PLAIN };
        let mut c = *table.get(code as usize)?;
        if c == 0 {
            return None;
        }
        if c.is_ascii_alphabetic() {
            if self.caps {
                c ^= 0x20;
            }
            if self.ctrl {
                c &= 0x1F;
            }
        }
        Some(c)
    }
}

/// One virtual console.
#[derive(Debug)]
pub struct Console {
    cells: Vec<u16>,
    cursor: (usize, usize),
    color: u8,
    keys: VecDeque<u8>,
    key_capacity: usize,
    decoder: Decoder,
    /// Threads blocked on input.
    readers: Vec<u32>,
    refs: usize,
}

impl Console {
    fn new(color: u8, key_capacity: usize) -> Self {
        Self {
            cells: vec![blank(color); CELLS],
            cursor: (0, 0),
            color,
            keys: VecDeque::with_capacity(key_capacity),
            key_capacity,
            decoder: Decoder::default(),
            readers: Vec::new(),
            refs: 0,
        }
    }

    fn put(&mut self, c: u8) {
        let (row, col) = self.cursor;
        match c {
            b'\n' => self.cursor = (row + 1, 0),
            b'\r' => self.cursor = (row, 0),
            b'\x08' => {
                if col > 0 {
                    self.cursor = (row, col - 1);
                    self.cells[row * CONSOLE_COLS + col - 1] = blank(self.color);
                }
            }
            _ => {
                self.cells[row * CONSOLE_COLS + col] = cell(c, self.color);
                self.cursor = if col + 1 == CONSOLE_COLS { (row + 1, 0) } else { (row, col + 1) };
            }
        }
        if self.cursor.0 == CONSOLE_ROWS {
            self.cells.copy_within(CONSOLE_COLS.., 0);
            self.cells[CELLS - CONSOLE_COLS..].fill(blank(self.color));
            self.cursor.0 = CONSOLE_ROWS - 1;
        }
    }

    #[must_use]
    pub fn cells(&self) -> &[u16] {
        &self.cells
    }

    #[must_use]
    pub const fn cursor(&self) -> (usize, usize) {
        self.cursor
    }
}

const fn cell(c: u8, color: u8) -> u16 {
    (color as u16) << 8 | c as u16
}

const fn blank(color: u8) -> u16 {
    cell(b' ', color)
}

fn position(row: u32, col: u32) -> Result<(usize, usize), ConsoleError> {
    if (row as usize) < CONSOLE_ROWS && (col as usize) < CONSOLE_COLS {
        Ok((row as usize, col as usize))
    } else {
        Err(ConsoleError::BadPosition(row, col))
    }
}

fn attribute(color: u32) -> Result<u8, ConsoleError> {
    u8::try_from(color).map_err(|_| ConsoleError::BadColor(color))
}

/// All consoles plus the index of the one on screen.
#[derive(Debug)]
pub struct ConsoleSet {
    consoles: Vec<Option<Console>>,
    active: usize,
    color: u8,
    key_capacity: usize,
}

impl ConsoleSet {
    /// Console 0 exists and is active; the others are created on demand.
    #[must_use]
    pub fn new(config: &KernelConfig) -> Self {
        let mut consoles: Vec<Option<Console>> = (0..config.consoles.max(1)).map(|_| None).collect();
        consoles[0] = Some(Console::new(config.console_color, config.keyboard_buffer_size));
        Self {
            consoles,
            active: 0,
            color: config.console_color,
            key_capacity: config.keyboard_buffer_size,
        }
    }

    #[must_use]
    pub const fn active(&self) -> usize {
        self.active
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Console> {
        self.consoles.get(index)?.as_ref()
    }

    fn console(&mut self, index: usize) -> &mut Console {
        match self.consoles.get_mut(index).and_then(Option::as_mut) {
            Some(c) => c,
            None => panic!("console {index} does not exist"),
        }
    }

    pub fn print(&mut self, index: usize, text: &[u8]) {
        let console = self.console(index);
        for c in text {
            console.put(*c);
        }
    }

    /// Writes `text` at `(row, col)` in `color` without moving the cursor.
    /// Text running past the last cell is dropped.
    ///
    /// # Errors
    /// Position or color out of range.
    pub fn print_at(&mut self, index: usize, text: &[u8], row: u32, col: u32, color: u32) -> Result<(), ConsoleError> {
        let (row, col) = position(row, col)?;
        let color = attribute(color)?;
        let console = self.console(index);
        let start = row * CONSOLE_COLS + col;
        for (slot, c) in console.cells[start..].iter_mut().zip(text) {
            *slot = cell(*c, color);
        }
        Ok(())
    }

    /// # Errors
    /// [`ConsoleError::BadColor`].
    pub fn set_color(&mut self, index: usize, color: u32) -> Result<(), ConsoleError> {
        let color = attribute(color)?;
        self.console(index).color = color;
        Ok(())
    }

    /// # Errors
    /// [`ConsoleError::BadPosition`].
    pub fn set_cursor(&mut self, index: usize, row: u32, col: u32) -> Result<(), ConsoleError> {
        let at = position(row, col)?;
        self.console(index).cursor = at;
        Ok(())
    }

    #[must_use]
    pub fn get_cursor(&self, index: usize) -> (usize, usize) {
        self.get(index).map_or((0, 0), Console::cursor)
    }

    /// Queues a raw scan code on the active console. Returns the readers to
    /// wake; the code is dropped when the ring is full.
    pub fn push_scancode(&mut self, code: u8) -> Vec<u32> {
        let active = self.active;
        let console = self.console(active);
        if console.keys.len() < console.key_capacity {
            console.keys.push_back(code);
        }
        core::mem::take(&mut console.readers)
    }

    /// Decodes queued scan codes until one yields a character.
    pub fn read_char(&mut self, index: usize) -> Option<u8> {
        let console = self.console(index);
        while let Some(code) = console.keys.pop_front() {
            if let Some(c) = console.decoder.feed(code) {
                return Some(c);
            }
        }
        None
    }

    /// Records `tid` as waiting for input on `index`.
    pub fn add_reader(&mut self, index: usize, tid: u32) {
        let console = self.console(index);
        if !console.readers.contains(&tid) {
            console.readers.push(tid);
        }
    }

    /// Creates a console and returns its index. Its count starts at zero.
    ///
    /// # Errors
    /// [`ConsoleError::NoFreeConsole`].
    pub fn create(&mut self) -> Result<usize, ConsoleError> {
        let index = self
            .consoles
            .iter()
            .position(Option::is_none)
            .ok_or(ConsoleError::NoFreeConsole)?;
        self.consoles[index] = Some(Console::new(self.color, self.key_capacity));
        Ok(index)
    }

    /// Puts `index` on screen. The console left behind is destroyed if
    /// nobody references it.
    pub fn switch(&mut self, index: usize) {
        let previous = core::mem::replace(&mut self.active, index);
        if previous != index {
            self.collect(previous);
        }
    }

    pub fn retain(&mut self, index: usize) {
        self.console(index).refs += 1;
    }

    pub fn release(&mut self, index: usize) {
        let console = self.console(index);
        console.refs = console.refs.saturating_sub(1);
        self.collect(index);
    }

    #[must_use]
    pub fn refs(&self, index: usize) -> usize {
        self.get(index).map_or(0, |c| c.refs)
    }

    fn collect(&mut self, index: usize) {
        if index != self.active && self.get(index).is_some_and(|c| c.refs == 0) {
            self.consoles[index] = None;
            trace!("console {index} destroyed");
        }
    }
}

impl<A: Arch> Kernel<A> {
    pub(crate) fn consoles_retain(&self, index: usize) {
        self.masked(|| self.consoles.lock().retain(index));
    }

    pub(crate) fn consoles_release(&self, index: usize) {
        self.masked(|| self.consoles.lock().release(index));
    }

    /// Console of the calling process; the idle thread uses the active one.
    pub fn current_console(&self) -> usize {
        match self.current_process() {
            Some(p) => p.with(self.irq(), |p| p.console),
            None => self.masked(|| self.consoles.lock().active()),
        }
    }

    /// Runs `f` on the console set and redraws the screen if console
    /// `index` is the one showing.
    pub(crate) fn with_console<R>(&self, index: usize, f: impl FnOnce(&mut ConsoleSet) -> R) -> R {
        self.masked(|| {
            let mut consoles = self.consoles.lock();
            let result = f(&mut consoles);
            if consoles.active() == index {
                if let Some(c) = consoles.get(index) {
                    self.arch.show(c.cells(), c.cursor());
                }
            }
            result
        })
    }

    pub fn print(&self, text: &[u8]) {
        let index = self.current_console();
        self.with_console(index, |c| c.print(index, text));
    }

    /// # Errors
    /// See [`ConsoleSet::print_at`].
    pub fn print_at(&self, text: &[u8], row: u32, col: u32, color: u32) -> Result<(), ConsoleError> {
        let index = self.current_console();
        self.with_console(index, |c| c.print_at(index, text, row, col, color))
    }

    /// # Errors
    /// See [`ConsoleSet::set_color`].
    pub fn set_term_color(&self, color: u32) -> Result<(), ConsoleError> {
        let index = self.current_console();
        self.with_console(index, |c| c.set_color(index, color))
    }

    /// # Errors
    /// See [`ConsoleSet::set_cursor`].
    pub fn set_cursor_pos(&self, row: u32, col: u32) -> Result<(), ConsoleError> {
        let index = self.current_console();
        self.with_console(index, |c| c.set_cursor(index, row, col))
    }

    pub fn get_cursor_pos(&self) -> (usize, usize) {
        let index = self.current_console();
        self.masked(|| self.consoles.lock().get_cursor(index))
    }

    /// Next decoded character typed on the caller's console. Blocks.
    pub fn getchar(&self) -> u8 {
        let index = self.current_console();
        let tid = self.cpu().current();
        loop {
            let c = self.masked(|| {
                let mut consoles = self.consoles.lock();
                let c = consoles.read_char(index);
                if c.is_none() {
                    consoles.add_reader(index, tid);
                    self.prepare_block(tid);
                }
                c
            });
            match c {
                Some(c) => return c,
                None => self.suspend(tid),
            }
        }
    }

    /// Reads a line of at most `max` bytes with echo and backspace editing.
    /// The terminating newline is included when it fits.
    pub fn readline(&self, max: usize) -> Vec<u8> {
        let _input = self.input.write(self);
        let mut line = Vec::with_capacity(max);
        while line.len() < max {
            let c = self.getchar();
            if c == b'\x08' {
                if line.pop().is_some() {
                    self.print(b"\x08");
                }
                continue;
            }
            line.push(c);
            self.print(&[c]);
            if c == b'\n' {
                break;
            }
        }
        line
    }

    /// Gives the caller a fresh console and puts it on screen.
    ///
    /// # Errors
    /// [`ConsoleError::NoFreeConsole`].
    pub fn new_console(&self) -> Result<usize, ConsoleError> {
        let Some(process) = self.current_process() else {
            return Err(ConsoleError::NoFreeConsole);
        };
        let index = self.masked(|| {
            let mut consoles = self.consoles.lock();
            let index = consoles.create()?;
            consoles.retain(index);
            consoles.switch(index);
            Ok::<_, ConsoleError>(index)
        })?;
        let old = process.with(self.irq(), |p| core::mem::replace(&mut p.console, index));
        self.consoles_release(old);
        self.with_console(index, |_| ());
        debug!("console: pid {} now on console {index}", process.pid());
        Ok(index)
    }

    /// Keyboard interrupt: queue the scan code and wake readers.
    pub fn keyboard_input(&self, scancode: u8) {
        let woken = self.masked(|| self.consoles.lock().push_scancode(scancode));
        for tid in woken {
            self.wake(tid);
        }
        self.mux.broadcast(self, virq::KEYBOARD, u32::from(scancode));
    }
}
