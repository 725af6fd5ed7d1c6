//! # System Call Dispatch
//!
//! Each vector in [`Sysno`] maps to one handler in a [`SyscallTable`]. The
//! dispatcher gathers the arguments (from `%esi`, or from the word block
//! `%esi` points at), runs the handler and stores the result or the
//! negative error code in `%eax`. Handlers that leave the kernel another
//! way (`exec`, `vanish`, `swexn` with new registers, `halt`) never return.
//!
//! Every user pointer is checked against the caller's page tables before
//! anything is copied, and output buffers are checked before a call
//! commits to its effect.

use crate::arch::Arch;
use crate::console::ConsoleError;
use crate::fork::ForkError;
use crate::kernel::Kernel;
use crate::lifecycle::{ExecError, WaitError};
use crate::loader::LoadError;
use crate::memory::MemoryError;
use crate::process::Process;
use crate::registry::Ephemeral;
use crate::swexn::SwexnError;
use crate::trap::TrapFrame;
use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;
use kernel_syscall::{Sysno, errno};
use kernel_vmem::{Access, AccessError};
use log::{info, trace};

/// Longest image name or argument `exec` accepts.
pub const MAX_NAME: usize = 256;
/// Most arguments `exec` accepts.
pub const MAX_ARGS: usize = 64;
/// Longest buffer `print` and `readline` accept.
pub const MAX_IO: u32 = 4096;

/// A failed system call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyscallError {
    #[error("invalid argument")]
    Invalid,
    #[error("bad user address")]
    BadAddress,
    #[error("out of memory")]
    OutOfMemory,
    #[error("no children")]
    NoChildren,
    #[error("no such thread")]
    NoSuchThread,
    #[error("caller has more than one thread")]
    NotSingleThreaded,
    #[error("no such image")]
    NoSuchImage,
    #[error("vector {0:#x} has no system call")]
    Unsupported(u32),
}

impl SyscallError {
    /// Value left in `%eax`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Invalid => errno::INVALID,
            Self::BadAddress => errno::BAD_ADDRESS,
            Self::OutOfMemory => errno::OUT_OF_MEMORY,
            Self::NoChildren => errno::NO_CHILDREN,
            Self::NoSuchThread => errno::NO_SUCH_THREAD,
            Self::NotSingleThreaded => errno::NOT_SINGLE_THREADED,
            Self::NoSuchImage => errno::NO_SUCH_IMAGE,
            Self::Unsupported(_) => errno::UNSUPPORTED,
        }
    }
}

impl From<AccessError> for SyscallError {
    fn from(_: AccessError) -> Self {
        Self::BadAddress
    }
}

impl From<MemoryError> for SyscallError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::OutOfMemory => Self::OutOfMemory,
            _ => Self::Invalid,
        }
    }
}

impl From<ForkError> for SyscallError {
    fn from(e: ForkError) -> Self {
        match e {
            ForkError::NotSingleThreaded => Self::NotSingleThreaded,
            ForkError::OutOfMemory => Self::OutOfMemory,
        }
    }
}

impl From<WaitError> for SyscallError {
    fn from(WaitError::NoChildren: WaitError) -> Self {
        Self::NoChildren
    }
}

impl From<LoadError> for SyscallError {
    fn from(e: LoadError) -> Self {
        match e {
            LoadError::NoSuchImage => Self::NoSuchImage,
            LoadError::OutOfMemory => Self::OutOfMemory,
            _ => Self::Invalid,
        }
    }
}

impl From<ExecError> for SyscallError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::NotSingleThreaded => Self::NotSingleThreaded,
            ExecError::Load(e) => e.into(),
        }
    }
}

impl From<ConsoleError> for SyscallError {
    fn from(e: ConsoleError) -> Self {
        match e {
            ConsoleError::NoFreeConsole => Self::OutOfMemory,
            _ => Self::Invalid,
        }
    }
}

impl From<SwexnError> for SyscallError {
    fn from(e: SwexnError) -> Self {
        match e {
            SwexnError::Access(_) | SwexnError::BadStack => Self::BadAddress,
            _ => Self::Invalid,
        }
    }
}

type Handler<A> = fn(&Kernel<A>, &[u32]) -> Result<u32, SyscallError>;

/// One system call.
pub struct Syscall<A: Arch> {
    pub call: Sysno,
    pub run: Handler<A>,
}

/// Handlers indexed by vector.
pub struct SyscallTable<A: Arch> {
    slots: Vec<Option<Syscall<A>>>,
}

impl<A: Arch> SyscallTable<A> {
    fn new(calls: Vec<Syscall<A>>) -> Self {
        let span = (Sysno::LAST_VECTOR - Sysno::FIRST_VECTOR + 1) as usize;
        let mut slots: Vec<Option<Syscall<A>>> = (0..span).map(|_| None).collect();
        for call in calls {
            let index = (call.call.vector() - Sysno::FIRST_VECTOR) as usize;
            debug_assert!(slots[index].is_none(), "{} registered twice", call.call.name());
            slots[index] = Some(call);
        }
        Self { slots }
    }

    /// Handler for `vector`, if one is installed.
    #[must_use]
    pub fn get(&self, vector: u32) -> Option<&Syscall<A>> {
        let index = vector.checked_sub(Sysno::FIRST_VECTOR)? as usize;
        self.slots.get(index)?.as_ref()
    }

    /// Number of installed handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn caller<A: Arch>(k: &Kernel<A>) -> Result<Ephemeral<'_, Process>, SyscallError> {
    k.current_process().ok_or(SyscallError::Invalid)
}

fn user(va: u32) -> VirtualAddress {
    VirtualAddress::new(va)
}

/// Reads a NULL-terminated vector of string pointers.
fn read_argv<A: Arch>(k: &Kernel<A>, process: &Process, argv: u32) -> Result<Vec<Vec<u8>>, SyscallError> {
    let mut args = Vec::new();
    for i in 0..=MAX_ARGS {
        let slot = argv.checked_add(4 * i as u32).ok_or(SyscallError::BadAddress)?;
        let ptr = k.read_user_u32(process, user(slot))?;
        if ptr == 0 {
            return Ok(args);
        }
        if i == MAX_ARGS {
            break;
        }
        args.push(k.read_user_str(process, user(ptr), MAX_NAME)?);
    }
    Err(SyscallError::Invalid)
}

fn read_text<A: Arch>(k: &Kernel<A>, process: &Process, len: u32, buf: u32) -> Result<Vec<u8>, SyscallError> {
    if len > MAX_IO {
        return Err(SyscallError::Invalid);
    }
    let mut text = vec![0; len as usize];
    k.copy_in(process, user(buf), &mut text)?;
    Ok(text)
}

/// The installed system calls.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn syscall_table<A: Arch>() -> SyscallTable<A> {
    SyscallTable::new(vec![
        Syscall {
            call: Sysno::Fork,
            run: |k, _| Ok(k.fork()?),
        },
        Syscall {
            call: Sysno::Exec,
            run: |k, a| {
                let (name, args) = {
                    let process = caller(k)?;
                    let name = k.read_user_str(&process, user(a[0]), MAX_NAME)?;
                    (name, read_argv(k, &process, a[1])?)
                };
                let frame = k.exec(&name, &args)?;
                k.return_to_user(frame)
            },
        },
        Syscall {
            call: Sysno::Wait,
            run: |k, a| {
                let status_at = a[0];
                let process = caller(k)?;
                if status_at != 0 {
                    k.check_user(&process, user(status_at), 4, Access::Write)?;
                }
                let (pid, status) = k.wait()?;
                if status_at != 0 {
                    k.write_user_u32(&process, user(status_at), status as u32)?;
                }
                Ok(pid)
            },
        },
        Syscall {
            call: Sysno::Yield,
            run: |k, a| {
                if a[0] as i32 == -1 {
                    k.yield_to_next();
                    Ok(0)
                } else if k.yield_to(a[0]) {
                    Ok(0)
                } else {
                    Err(SyscallError::NoSuchThread)
                }
            },
        },
        Syscall {
            call: Sysno::Deschedule,
            run: |k, a| {
                k.deschedule(user(a[0]))?;
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::MakeRunnable,
            run: |k, a| if k.make_runnable(a[0]) { Ok(0) } else { Err(SyscallError::NoSuchThread) },
        },
        Syscall {
            call: Sysno::GetTid,
            run: |k, _| Ok(k.cpu().current()),
        },
        Syscall {
            call: Sysno::NewPages,
            run: |k, a| {
                k.new_pages(&*caller(k)?, user(a[0]), a[1])?;
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::RemovePages,
            run: |k, a| {
                k.remove_pages(&*caller(k)?, user(a[0]))?;
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::Sleep,
            run: |k, a| {
                let ticks = u32::try_from(a[0] as i32).map_err(|_| SyscallError::Invalid)?;
                k.sleep(ticks);
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::GetChar,
            run: |k, _| Ok(u32::from(k.getchar())),
        },
        Syscall {
            call: Sysno::ReadLine,
            run: |k, a| {
                let (len, buf) = (a[0], a[1]);
                if len > MAX_IO {
                    return Err(SyscallError::Invalid);
                }
                let process = caller(k)?;
                k.check_user(&process, user(buf), len, Access::Write)?;
                let line = k.readline(len as usize);
                k.copy_out(&process, user(buf), &line)?;
                Ok(line.len() as u32)
            },
        },
        Syscall {
            call: Sysno::Print,
            run: |k, a| {
                let text = read_text(k, &*caller(k)?, a[0], a[1])?;
                k.print(&text);
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::SetTermColor,
            run: |k, a| {
                k.set_term_color(a[0])?;
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::SetCursorPos,
            run: |k, a| {
                k.set_cursor_pos(a[0], a[1])?;
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::GetCursorPos,
            run: |k, a| {
                let process = caller(k)?;
                k.check_user(&process, user(a[0]), 4, Access::Write)?;
                k.check_user(&process, user(a[1]), 4, Access::Write)?;
                let (row, col) = k.get_cursor_pos();
                k.write_user_u32(&process, user(a[0]), row as u32)?;
                k.write_user_u32(&process, user(a[1]), col as u32)?;
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::ThreadFork,
            run: |k, _| Ok(k.thread_fork()?),
        },
        Syscall {
            call: Sysno::GetTicks,
            run: |k, _| Ok(k.ticks()),
        },
        Syscall {
            call: Sysno::Halt,
            run: |k, _| {
                info!("halt requested by thread {}", k.cpu().current());
                k.arch.halt()
            },
        },
        Syscall {
            call: Sysno::SetStatus,
            run: |k, a| {
                k.set_status(a[0] as i32);
                Ok(0)
            },
        },
        Syscall {
            call: Sysno::Vanish,
            run: |k, _| k.vanish_current(),
        },
        Syscall {
            call: Sysno::Swexn,
            run: |k, a| match k.swexn(a[0], a[1], a[2], a[3])? {
                None => Ok(0),
                Some(frame) => k.return_to_user(frame),
            },
        },
        Syscall {
            call: Sysno::NewConsole,
            run: |k, _| Ok(k.new_console()? as u32),
        },
    ])
}

impl<A: Arch> Kernel<A> {
    /// Runs the system call in `frame` and stores its result in `frame.eax`.
    pub(crate) fn syscall(&self, frame: &mut TrapFrame) {
        let vector = frame.vector;
        frame.eax = match self.run_syscall(frame) {
            Ok(value) => value,
            Err(e) => {
                trace!("syscall {vector:#x} by thread {} failed: {e}", self.cpu().current());
                e.code() as u32
            }
        };
    }

    fn run_syscall(&self, frame: &TrapFrame) -> Result<u32, SyscallError> {
        let entry = self.syscalls.get(frame.vector).ok_or(SyscallError::Unsupported(frame.vector))?;
        let words = entry.call.block_words();
        let args = if words == 0 {
            vec![frame.esi]
        } else {
            let process = caller(self)?;
            self.read_user_words(&process, user(frame.esi), words)?
        };
        trace!("syscall {} {args:x?} by thread {}", entry.call.name(), self.cpu().current());
        (entry.run)(self, &args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimArch;
    use crate::testkit::{USER_DATA, booted, syscall, trap_from_user};

    #[test]
    fn every_call_has_a_handler() {
        let table = syscall_table::<SimArch>();
        assert_eq!(table.len(), Sysno::ALL.len());
        for call in Sysno::ALL {
            assert_eq!(table.get(call.vector()).map(|s| s.call), Some(call));
        }
        assert!(table.get(0x43).is_none());
        assert!(table.get(0x40).is_none());
        assert!(table.get(0x80).is_none());
    }

    #[test]
    fn errors_map_to_stable_codes() {
        assert_eq!(SyscallError::from(WaitError::NoChildren).code(), -4);
        assert_eq!(SyscallError::from(ExecError::Load(LoadError::NoSuchImage)).code(), -7);
        assert_eq!(SyscallError::from(ForkError::NotSingleThreaded).code(), -6);
        assert_eq!(SyscallError::from(AccessError::Overflow).code(), -2);
        assert_eq!(SyscallError::Unsupported(0x43).code(), -8);
    }

    /// Writes `bytes` into the user data page and returns their address.
    fn block(k: &Kernel<SimArch>, offset: u32, bytes: &[u8]) -> u32 {
        let at = USER_DATA + offset;
        let process = k.current_process().unwrap();
        k.copy_out(&process, user(at), bytes).unwrap();
        at
    }

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn results_come_back_in_eax() {
        let (k, init) = booted();
        assert_eq!(syscall(&k, Sysno::GetTid, 0), init);
        assert_eq!(syscall(&k, Sysno::Wait, 0) as i32, SyscallError::NoChildren.code());
        assert_eq!(syscall(&k, Sysno::Sleep, (-1i32) as u32) as i32, SyscallError::Invalid.code());
    }

    #[test]
    fn print_reads_its_argument_block() {
        let (k, _) = booted();
        let text = block(&k, 0x200, b"hello");
        let args = block(&k, 0x100, &words(&[5, text]));
        assert_eq!(syscall(&k, Sysno::Print, args), 0);
        assert_eq!(k.arch().screen_text(0), "hello");

        assert_eq!(syscall(&k, Sysno::Print, 0x10) as i32, SyscallError::BadAddress.code());
    }

    #[test]
    fn unused_gates_are_unsupported() {
        let (k, _) = booted();
        let eax = trap_from_user(&k, 0x43, |_| ()).eax;
        assert_eq!(eax as i32, SyscallError::Unsupported(0x43).code());
    }

    #[test]
    fn new_pages_reports_overlap() {
        let (k, _) = booted();
        let args = block(&k, 0x100, &words(&[0x0200_0000, 0x2000]));
        assert_eq!(syscall(&k, Sysno::NewPages, args), 0);
        assert_eq!(syscall(&k, Sysno::NewPages, args) as i32, SyscallError::Invalid.code());
        assert_eq!(syscall(&k, Sysno::RemovePages, 0x0200_0000), 0);
    }
}
