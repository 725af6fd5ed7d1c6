//! # System Call ABI
//!
//! Numbers shared by the kernel and user programs. Every call has its own
//! interrupt vector. A single argument travels in `%esi`; several arguments
//! travel as a packed word block whose address is in `%esi`. The result,
//! or a negative [`errno`] code, comes back in `%eax`.

#![cfg_attr(not(any(test, doctest)), no_std)]

/// System call vectors.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Sysno {
    Fork = 0x41,
    Exec = 0x42,
    Wait = 0x44,
    Yield = 0x45,
    Deschedule = 0x46,
    MakeRunnable = 0x47,
    GetTid = 0x48,
    NewPages = 0x49,
    RemovePages = 0x4A,
    Sleep = 0x4B,
    GetChar = 0x4C,
    ReadLine = 0x4D,
    Print = 0x4E,
    SetTermColor = 0x4F,
    SetCursorPos = 0x50,
    GetCursorPos = 0x51,
    ThreadFork = 0x52,
    GetTicks = 0x53,
    Halt = 0x55,
    SetStatus = 0x59,
    Vanish = 0x60,
    Swexn = 0x74,
    NewConsole = 0x75,
}

impl Sysno {
    /// Every call, in vector order.
    pub const ALL: [Self; 23] = [
        Self::Fork,
        Self::Exec,
        Self::Wait,
        Self::Yield,
        Self::Deschedule,
        Self::MakeRunnable,
        Self::GetTid,
        Self::NewPages,
        Self::RemovePages,
        Self::Sleep,
        Self::GetChar,
        Self::ReadLine,
        Self::Print,
        Self::SetTermColor,
        Self::SetCursorPos,
        Self::GetCursorPos,
        Self::ThreadFork,
        Self::GetTicks,
        Self::Halt,
        Self::SetStatus,
        Self::Vanish,
        Self::Swexn,
        Self::NewConsole,
    ];

    /// Lowest vector reserved for system calls.
    pub const FIRST_VECTOR: u32 = 0x41;

    /// Highest vector reserved for system calls.
    pub const LAST_VECTOR: u32 = 0x75;

    #[inline]
    #[must_use]
    pub const fn vector(self) -> u32 {
        self as u32
    }

    /// The call behind `vector`, if any.
    #[must_use]
    pub const fn from_vector(vector: u32) -> Option<Self> {
        let mut i = 0;
        while i < Self::ALL.len() {
            if Self::ALL[i] as u32 == vector {
                return Some(Self::ALL[i]);
            }
            i += 1;
        }
        None
    }

    /// Whether `vector` lies in the system call range, assigned or not.
    #[inline]
    #[must_use]
    pub const fn is_reserved(vector: u32) -> bool {
        vector >= Self::FIRST_VECTOR && vector <= Self::LAST_VECTOR
    }

    /// Words in the parameter block; `0` means the argument, if any, is
    /// passed directly in `%esi`.
    #[must_use]
    pub const fn block_words(self) -> usize {
        match self {
            Self::Exec | Self::NewPages | Self::ReadLine | Self::Print | Self::SetCursorPos | Self::GetCursorPos => 2,
            Self::Swexn => 4,
            _ => 0,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fork => "fork",
            Self::Exec => "exec",
            Self::Wait => "wait",
            Self::Yield => "yield",
            Self::Deschedule => "deschedule",
            Self::MakeRunnable => "make_runnable",
            Self::GetTid => "gettid",
            Self::NewPages => "new_pages",
            Self::RemovePages => "remove_pages",
            Self::Sleep => "sleep",
            Self::GetChar => "getchar",
            Self::ReadLine => "readline",
            Self::Print => "print",
            Self::SetTermColor => "set_term_color",
            Self::SetCursorPos => "set_cursor_pos",
            Self::GetCursorPos => "get_cursor_pos",
            Self::ThreadFork => "thread_fork",
            Self::GetTicks => "get_ticks",
            Self::Halt => "halt",
            Self::SetStatus => "set_status",
            Self::Vanish => "vanish",
            Self::Swexn => "swexn",
            Self::NewConsole => "new_console",
        }
    }
}

/// Negative results left in `%eax`.
pub mod errno {
    /// Malformed or out-of-range argument.
    pub const INVALID: i32 = -1;
    /// A pointer argument is not accessible user memory.
    pub const BAD_ADDRESS: i32 = -2;
    pub const OUT_OF_MEMORY: i32 = -3;
    /// `wait` found nothing to wait for.
    pub const NO_CHILDREN: i32 = -4;
    pub const NO_SUCH_THREAD: i32 = -5;
    /// `fork` or `exec` from a multi-threaded process.
    pub const NOT_SINGLE_THREADED: i32 = -6;
    pub const NO_SUCH_IMAGE: i32 = -7;
    /// Vector in the system call range without a call behind it.
    pub const UNSUPPORTED: i32 = -8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_round_trip() {
        for call in Sysno::ALL {
            assert_eq!(Sysno::from_vector(call.vector()), Some(call));
            assert!(Sysno::is_reserved(call.vector()));
        }
        assert_eq!(Sysno::from_vector(0x43), None);
        assert!(Sysno::is_reserved(0x43));
        assert!(!Sysno::is_reserved(0x80));
    }

    #[test]
    fn all_is_sorted() {
        assert!(Sysno::ALL.windows(2).all(|w| w[0].vector() < w[1].vector()));
    }
}
