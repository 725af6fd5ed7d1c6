//! Host-side kernel assembly for tests: a [`SimArch`] machine, small frame
//! pools, generated ELF images and helpers to act as a given thread.

use crate::arch::Arch;
use crate::arch::sim::{SimArch, expect_resume};
use crate::elf::test_image::{self, Segment};
use crate::kernel::{FramePools, Kernel};
use crate::loader::ImageTable;
use crate::thread::ThreadStatus;
use crate::trap::TrapFrame;
use kernel_alloc::FrameStack;
use kernel_info::config::KernelConfig;
use kernel_info::memory::{GUEST_FRAMES, USER_MEM_START};
use kernel_syscall::Sysno;
use kernel_vmem::KernelMappings;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

/// Entry point of every generated user program.
pub const USER_ENTRY: u32 = USER_MEM_START;
/// Writable data page of every generated user program.
pub const USER_DATA: u32 = USER_MEM_START + 0x1000;
/// Entry point (guest-physical) of the generated guest kernel.
pub const GUEST_ENTRY: u32 = 0x0010_0000;

/// A user program with one text and one data page.
pub fn user_image() -> &'static [u8] {
    let text: &[u8] = &[0x90; 16];
    let data: &[u8] = b"parent data";
    let segments: [Segment<'_>; 2] = [(USER_ENTRY, false, text, 0x1000), (USER_DATA, true, data, 0x1000)];
    Box::leak(test_image::build(USER_ENTRY, &segments).into_boxed_slice())
}

/// A guest kernel: one text segment at a low guest-physical address.
pub fn guest_image() -> &'static [u8] {
    let text: &[u8] = &[0xF4; 16];
    let segments: [Segment<'_>; 1] = [(GUEST_ENTRY, false, text, 0x1000)];
    Box::leak(test_image::build(GUEST_ENTRY, &segments).into_boxed_slice())
}

/// `init`, `prog` and `guest`.
pub fn images() -> ImageTable {
    ImageTable::new()
        .with("init", user_image())
        .with("prog", user_image())
        .with("guest", guest_image())
}

/// Pools with enough user frames for one guest and a few processes.
pub fn pools() -> FramePools {
    let user_first = USER_MEM_START >> 12;
    FramePools {
        kernel: FrameStack::from_range("kernel", 0x400, 0x1000),
        user: FrameStack::from_range("user", user_first, user_first + GUEST_FRAMES + 512),
    }
}

/// A kernel that has booted `init` and is running as it.
pub fn booted() -> (Kernel<SimArch>, u32) {
    let kernel = match Kernel::new(SimArch::new(), KernelConfig::default_config(), pools(), KernelMappings::empty(), images()) {
        Ok(k) => k,
        Err(e) => panic!("kernel: {e}"),
    };
    let init = kernel.boot(b"init").unwrap();
    run_as(&kernel, init);
    (kernel, init)
}

/// Switches the simulated core to `tid` the way the scheduler would.
pub fn run_as(kernel: &Kernel<SimArch>, tid: u32) {
    assert!(kernel.yield_to(tid), "thread {tid} is not runnable");
    assert_eq!(kernel.cpu().current(), tid);
}

/// Starts the current thread the way a freshly created thread starts, and
/// returns the frame it enters user mode with.
pub fn start_current(kernel: &Kernel<SimArch>) -> TrapFrame {
    // The switch that scheduled a new thread leaves the local lock held.
    kernel.cpu().local.lock(kernel.irq());
    expect_resume(|| kernel.thread_entry())
}

/// The saved user frame of the current thread.
pub fn user_frame(kernel: &Kernel<SimArch>) -> &mut TrapFrame {
    kernel.current_thread().user_frame(kernel.arch().mapper())
}

/// Raises trap `vector` from the current thread's user frame, after `edit`
/// adjusted the registers, and returns the frame it resumes with.
pub fn trap_from_user(kernel: &Kernel<SimArch>, vector: u32, edit: impl FnOnce(&mut TrapFrame)) -> TrapFrame {
    let frame = user_frame(kernel);
    frame.vector = vector;
    frame.error_code = 0;
    edit(frame);
    expect_resume(|| kernel.trap(frame))
}

/// Issues system call `call` with `%esi = esi`. Returns `%eax`.
pub fn syscall(kernel: &Kernel<SimArch>, call: Sysno, esi: u32) -> u32 {
    trap_from_user(kernel, call.vector(), |f| f.esi = esi).eax
}

/// Runs `f`, which must end the calling thread, and checks that the core
/// moved on to another thread.
pub fn expect_vanish(kernel: &Kernel<SimArch>, f: impl FnOnce()) {
    let tid = kernel.cpu().current();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => panic!("thread {tid} survived"),
        Err(payload) => {
            let vanished = payload
                .downcast_ref::<String>()
                .is_some_and(|m| m.contains("after vanishing"));
            if !vanished {
                resume_unwind(payload);
            }
        }
    }
    assert_ne!(kernel.cpu().current(), tid);
    assert_eq!(kernel.thread(tid).map(|t| t.status()), Some(ThreadStatus::Dead));
}
