//! # Kernel Composition Root
//!
//! [`Kernel`] owns every global structure: frame pools, registries, per-core
//! state, consoles, the delayed-interrupt multiplexer and the dispatch
//! tables. It is generic over the machine so the same code runs on i386 and
//! under host tests.
//!
//! ## Locking helpers
//!
//! | Helper | Takes | Use for |
//! |--------|-------|---------|
//! | [`Kernel::masked`] | local lock | frame windows, per-core state |
//! | [`Kernel::critical`] | global lock | process graph changes |
//! | [`Kernel::with_frames`] | global lock + pool lock | frame and page-table allocation |

use crate::arch::Arch;
use crate::console::ConsoleSet;
use crate::cpu::{Cpu, NO_THREAD};
use crate::fault::{FaultStep, fault_chain};
use crate::hv::hypercall::{HypercallTable, hypercall_table};
use crate::hv::mux::DelayedMux;
use crate::kmutex::KMutex;
use crate::loader::ImageTable;
use crate::process::Process;
use crate::registry::{Ephemeral, Registry};
use crate::syscall::{SyscallTable, syscall_table};
use crate::thread::Thread;
use crate::trap::TrapFrame;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_alloc::FrameStack;
use kernel_info::boot::BootInfo;
use kernel_info::config::KernelConfig;
use kernel_info::memory::{FRAME_WINDOW_BASE, KERNEL_RESERVED_END, PAGE_SIZE, USER_MEM_START};
use kernel_memory_addresses::PhysicalPage;
use kernel_sync::{GlobalLock, Irq, SpinLock};
use kernel_vmem::{AddressSpace, KernelMappings, MapError, PhysMapper};
use log::info;

/// The two physical frame pools.
pub struct FramePools {
    /// Identity-mapped frames: page tables, kernel stacks.
    pub kernel: FrameStack,
    /// Everything above the kernel region: user and guest memory.
    pub user: FrameStack,
}

impl FramePools {
    /// Pools covering the memory the boot stub reported.
    #[must_use]
    pub fn from_boot(boot: &BootInfo) -> Self {
        let kernel_start = boot.kernel_image_end.max(KERNEL_RESERVED_END).div_ceil(PAGE_SIZE);
        Self {
            kernel: FrameStack::from_range("kernel", kernel_start, FRAME_WINDOW_BASE / PAGE_SIZE),
            user: FrameStack::from_range("user", USER_MEM_START / PAGE_SIZE, boot.phys_mem_end / PAGE_SIZE),
        }
    }
}

/// The kernel.
pub struct Kernel<A: Arch> {
    pub(crate) arch: A,
    pub(crate) config: KernelConfig,
    cpus: Box<[Cpu]>,
    global: GlobalLock,
    frames: SpinLock<FramePools>,
    pub(crate) kernel_map: KernelMappings,
    /// Directory with only the kernel half, active when no process is.
    pub(crate) kernel_directory: PhysicalPage,
    /// Shared read-only frame behind every zero-fill placeholder.
    pub(crate) zero_frame: PhysicalPage,
    pub(crate) threads: Registry<Thread>,
    pub(crate) processes: Registry<Process>,
    next_id: AtomicU32,
    init_pid: AtomicU32,
    pub(crate) ticks: AtomicU32,
    /// `(wake tick, tid)`; capacity is reserved before insertion so the
    /// timer never allocates.
    pub(crate) sleepers: SpinLock<Vec<(u32, u32)>>,
    pub(crate) images: ImageTable,
    pub(crate) consoles: SpinLock<ConsoleSet>,
    /// Serializes line reads so two readers never interleave one line.
    pub(crate) input: KMutex,
    pub(crate) mux: DelayedMux,
    pub(crate) syscalls: SyscallTable<A>,
    pub(crate) hypercalls: HypercallTable<A>,
    pub(crate) faults: [FaultStep<A>; 6],
}

impl<A: Arch> Kernel<A> {
    /// Assembles the kernel. `kernel_map` must have been built from
    /// `pools.kernel`.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the kernel pool cannot provide the
    /// kernel directory and the zero frame.
    pub fn new(
        arch: A,
        config: KernelConfig,
        mut pools: FramePools,
        kernel_map: KernelMappings,
        images: ImageTable,
    ) -> Result<Self, MapError> {
        let kernel_directory =
            AddressSpace::create(arch.mapper(), &mut pools.kernel, kernel_map.entries())?.root();
        let zero_frame = pools.kernel.allocate().ok_or(MapError::OutOfMemory)?;
        arch.mapper().zero_frame(zero_frame);

        info!(
            "kernel: {} kernel frames, {} user frames, {} consoles",
            pools.kernel.available(),
            pools.user.available(),
            config.consoles
        );

        Ok(Self {
            consoles: SpinLock::new(ConsoleSet::new(&config)),
            input: KMutex::new(),
            mux: DelayedMux::new(config.max_guests),
            cpus: (0..1).map(Cpu::new).collect(),
            arch,
            config,
            global: GlobalLock::new(),
            frames: SpinLock::new(pools),
            kernel_map,
            kernel_directory,
            zero_frame,
            threads: Registry::new(),
            processes: Registry::new(),
            next_id: AtomicU32::new(1),
            init_pid: AtomicU32::new(NO_THREAD),
            ticks: AtomicU32::new(0),
            sleepers: SpinLock::new(Vec::new()),
            images,
            syscalls: syscall_table(),
            hypercalls: hypercall_table(),
            faults: fault_chain(),
        })
    }

    #[inline]
    pub fn arch(&self) -> &A {
        &self.arch
    }

    #[inline]
    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub(crate) fn irq(&self) -> &dyn Irq {
        &self.arch
    }

    /// State of the calling core.
    pub fn cpu(&self) -> &Cpu {
        let id = self.arch.cpu_id() as usize;
        &self.cpus[id.min(self.cpus.len() - 1)]
    }

    /// Fresh thread/process id. A process shares its id with its first thread.
    pub(crate) fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn init_pid(&self) -> Option<u32> {
        match self.init_pid.load(Ordering::Acquire) {
            NO_THREAD => None,
            pid => Some(pid),
        }
    }

    pub(crate) fn set_init_pid(&self, pid: u32) {
        self.init_pid.store(pid, Ordering::Release);
    }

    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Runs `f` with preemption on this core excluded.
    pub fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _local = self.cpu().local.acquire(&self.arch);
        f()
    }

    /// Runs `f` holding the global lock.
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        let cpu = self.cpu();
        let _global = self.global.acquire(cpu.id(), &cpu.local, &self.arch);
        f()
    }

    /// Runs `f` on the frame pools. Must not nest.
    pub fn with_frames<R>(&self, f: impl FnOnce(&mut FramePools) -> R) -> R {
        self.critical(|| f(&mut self.frames.lock()))
    }

    /// Free `(kernel, user)` frames.
    pub fn free_frames(&self) -> (usize, usize) {
        self.with_frames(|p| (p.kernel.available(), p.user.available()))
    }

    pub fn thread(&self, tid: u32) -> Option<Ephemeral<'_, Thread>> {
        self.threads.find(&self.arch, tid)
    }

    pub fn process(&self, pid: u32) -> Option<Ephemeral<'_, Process>> {
        self.processes.find(&self.arch, pid)
    }

    /// The thread running on this core.
    ///
    /// # Panics
    /// Before [`boot`](Self::boot) has registered the idle thread.
    pub fn current_thread(&self) -> Ephemeral<'_, Thread> {
        let tid = self.cpu().current();
        match self.thread(tid) {
            Some(t) => t,
            None => panic!("current thread {tid} is not registered"),
        }
    }

    /// The process of the running thread, if it has one (idle has none).
    pub fn current_process(&self) -> Option<Ephemeral<'_, Process>> {
        self.process(self.current_thread().pid())
    }

    /// Address space rooted at `process`'s directory.
    pub fn space_of(&self, process: &Process) -> AddressSpace<'_, A::Mapper> {
        AddressSpace::from_root(self.arch.mapper(), process.directory())
    }

    /// Leaves the kernel through `frame`.
    pub(crate) fn resume(&self, frame: &TrapFrame) -> ! {
        debug_assert!(!self.cpu().local.is_held(), "one-way transfer with the local lock held");
        self.arch.resume(frame)
    }
}
