//! # Kernel Entry
//!
//! The boot stub jumps to [`kernel_main`] in protected mode with paging off,
//! flat segments, interrupts disabled and a stack inside the kernel image.
//!
//! ```text
//! kernel_main
//!   ├─ logger, GDT + TSS, IDT, PIC + PIT
//!   ├─ heap (static region), frame pools, kernel identity map
//!   ├─ Kernel::new, paging on
//!   ├─ Kernel::boot(INIT)
//!   └─ sti, idle loop
//! ```

use super::{X86, gdt, idt, pic};
use crate::arch::Arch;
use crate::kernel::{FramePools, Kernel};
use crate::loader::ImageTable;
use crate::trap::{TrapFrame, vectors};
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::IdentityMapper;
use kernel_alloc::heap::KernelHeap;
use kernel_info::boot::{BootInfo, BootModule};
use kernel_info::config::KernelConfig;
use kernel_qemu::{QemuLogger, qemu_trace};
use kernel_registers::{Cr0, Eflags, LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sync::{HardwareIrq, Irq, IrqGuard, SyncOnceCell};
use kernel_vmem::{KernelMappings, Mmu};
use log::{LevelFilter, error, info};

/// Program started first.
const INIT_NAME: &str = "init";

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[repr(align(4096))]
struct HeapSpace([u8; HEAP_SIZE]);

static mut HEAP_SPACE: HeapSpace = HeapSpace([0; HEAP_SIZE]);

/// [`KernelHeap`] with interrupts masked around every call, so interrupt
/// handlers may free what they are handed.
struct MaskedHeap(KernelHeap);

unsafe impl GlobalAlloc for MaskedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let _masked = IrqGuard::new(&HardwareIrq);
        unsafe { self.0.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let _masked = IrqGuard::new(&HardwareIrq);
        unsafe { self.0.dealloc(ptr, layout) }
    }
}

#[global_allocator]
static HEAP: MaskedHeap = MaskedHeap(KernelHeap::new());

static LOGGER: QemuLogger = QemuLogger::new(LevelFilter::Info);

static KERNEL: SyncOnceCell<Kernel<X86>> = SyncOnceCell::new();

fn kernel() -> &'static Kernel<X86> {
    match KERNEL.get() {
        Some(k) => k,
        None => panic!("trap before the kernel was assembled"),
    }
}

/// Called by the boot stub.
///
/// # Safety
/// `boot` must point at a valid [`BootInfo`] whose modules stay in place.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn kernel_main(boot: *const BootInfo) -> ! {
    let boot = unsafe { *boot };
    let config = KernelConfig::default_config();
    let _ = LOGGER.init(config.log_level);

    unsafe {
        gdt::init();
        idt::init();
        pic::init();
        pic::init_timer(config.timer_period_ms);
        HEAP.0.init((&raw mut HEAP_SPACE) as usize, HEAP_SIZE);
    }

    let images = unsafe { image_table(&boot) };
    let mut pools = FramePools::from_boot(&boot);
    let kernel_map = match KernelMappings::build(&IdentityMapper, &mut pools.kernel) {
        Ok(map) => map,
        Err(e) => panic!("kernel identity map: {e}"),
    };
    let Some(window) = kernel_map.window_table(&IdentityMapper) else {
        panic!("kernel identity map has no frame-window table");
    };
    // SAFETY: the window table is part of the shared kernel half.
    let arch = unsafe { X86::new(window) };

    let kernel = match Kernel::new(arch, config, pools, kernel_map, images) {
        Ok(k) => k,
        Err(e) => panic!("kernel: {e}"),
    };
    if KERNEL.set(kernel).is_err() {
        panic!("kernel_main entered twice");
    }
    let kernel = self::kernel();

    enable_paging(kernel);
    match kernel.boot(INIT_NAME.as_bytes()) {
        Ok(pid) => info!("boot: {INIT_NAME} is pid {pid}"),
        Err(e) => {
            error!("boot: cannot start {INIT_NAME}: {e}");
            kernel.arch().halt();
        }
    }
    kernel.idle_loop()
}

/// Loads the kernel directory and turns paging on.
fn enable_paging(kernel: &Kernel<X86>) {
    kernel.arch().activate(kernel.kernel_directory);
    // SAFETY: the kernel directory identity-maps the code running now.
    unsafe {
        Cr0::load_unsafe().with_pg_paging(true).with_wp_write_protect(true).store_unsafe();
    }
}

/// Programs the boot stub handed over.
///
/// # Safety
/// The module table and every image must stay mapped and unchanged.
unsafe fn image_table(boot: &BootInfo) -> ImageTable {
    let mut table = ImageTable::new();
    if boot.modules.is_null() {
        return table;
    }
    let modules: &'static [BootModule] =
        unsafe { core::slice::from_raw_parts(boot.modules, boot.module_count as usize) };
    for module in modules {
        let name = unsafe { core::slice::from_raw_parts(module.name, module.name_len as usize) };
        let Ok(name) = core::str::from_utf8(name) else {
            continue;
        };
        let bytes = unsafe {
            core::slice::from_raw_parts(module.start as usize as *const u8, (module.end - module.start) as usize)
        };
        table = table.with(name, bytes);
    }
    table
}

/// Common trap path, called from `trap_common` with the saved frame.
pub extern "C" fn trap_entry(frame: *mut TrapFrame) {
    // SAFETY: the stub passes the frame it just built on this stack.
    let frame = unsafe { &mut *frame };
    let device = matches!(frame.vector, vectors::TIMER | vectors::KEYBOARD);
    if !device && frame.eflags & Eflags::IF != 0 {
        HardwareIrq.enable_interrupts();
    }
    kernel().trap(frame);
}

/// First code a new thread runs, reached through `thread_start`.
pub extern "C" fn thread_trampoline() -> ! {
    kernel().thread_entry()
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
    qemu_trace!("kernel panic: {info}\n");
    loop {
        unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
    }
}
