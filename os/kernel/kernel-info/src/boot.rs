//! # Kernel Boot Information

/// Kernel function pointer the boot stub jumps to once paging is off and a
/// flat segment setup is loaded.
pub type KernelEntryFn = extern "C" fn(*const BootInfo) -> !;

/// What the boot stub discovered about the machine.
/// Keep this `#[repr(C)]`; it crosses the assembly boundary.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootInfo {
    /// First physical byte past usable RAM.
    pub phys_mem_end: u32,

    /// First physical byte past the kernel image and boot-time allocations,
    /// program modules included.
    pub kernel_image_end: u32,

    /// Program images the boot stub loaded next to the kernel.
    pub modules: *const BootModule,

    /// Number of entries at `modules`.
    pub module_count: u32,
}

/// One program image loaded by the boot stub.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BootModule {
    /// UTF-8 program name, not terminated.
    pub name: *const u8,
    pub name_len: u32,
    /// Physical (and identity-mapped) start of the ELF image.
    pub start: u32,
    /// First byte past the image.
    pub end: u32,
}
