//! # GDT and TSS
//!
//! Segmentation is flat except for the two guest segments, whose base is
//! [`GUEST_BASE`] and whose limit is the guest window. A guest kernel
//! therefore runs at CPL 3 with its own idea of address zero, while its
//! page tables are compiled into host tables over the same window.
//!
//! | Selector | Entry | Base | Limit | DPL |
//! |----------|-------|------|-------|-----|
//! | `0x08` | kernel code | 0 | 4 GiB | 0 |
//! | `0x10` | kernel data | 0 | 4 GiB | 0 |
//! | `0x1B` | user code | 0 | 4 GiB | 3 |
//! | `0x23` | user data | 0 | 4 GiB | 3 |
//! | `0x2B` | guest code | `GUEST_BASE` | `GUEST_MEM_SIZE` | 3 |
//! | `0x33` | guest data | `GUEST_BASE` | `GUEST_MEM_SIZE` | 3 |
//! | `0x38` | TSS | `&TSS` | 103 | 0 |

use crate::trap::selectors;
use bitfield_struct::bitfield;
use kernel_info::memory::{GUEST_BASE, GUEST_MEM_SIZE, PAGE_SIZE};

/// One 8-byte segment descriptor.
#[bitfield(u64)]
pub struct SegmentDescriptor {
    pub limit_lo: u16,
    pub base_lo: u16,
    pub base_mid: u8,
    /// Code: `0b1010` (execute/read). Data: `0b0010` (read/write).
    /// 32-bit available TSS: `0b1001`.
    #[bits(4)]
    pub typ: u8,
    /// Code/data (as opposed to system).
    pub s: bool,
    #[bits(2)]
    pub dpl: u8,
    pub p: bool,
    #[bits(4)]
    pub limit_hi: u8,
    pub avl: bool,
    pub l: bool,
    /// 32-bit default operand size.
    pub db: bool,
    /// Limit counts pages.
    pub g: bool,
    pub base_hi: u8,
}

const CODE: u8 = 0b1010;
const DATA: u8 = 0b0010;
const TSS_AVAILABLE: u8 = 0b1001;

impl SegmentDescriptor {
    /// Page-granular code or data segment covering `pages` pages at `base`.
    #[must_use]
    pub const fn segment(typ: u8, dpl: u8, base: u32, pages: u32) -> Self {
        let limit = pages - 1;
        Self::new()
            .with_limit_lo(limit as u16)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_base_lo(base as u16)
            .with_base_mid((base >> 16) as u8)
            .with_base_hi((base >> 24) as u8)
            .with_typ(typ)
            .with_s(true)
            .with_dpl(dpl)
            .with_p(true)
            .with_db(true)
            .with_g(true)
    }

    /// Byte-granular 32-bit TSS descriptor.
    #[must_use]
    pub const fn tss(base: u32, limit: u32) -> Self {
        Self::new()
            .with_limit_lo(limit as u16)
            .with_limit_hi(((limit >> 16) & 0xF) as u8)
            .with_base_lo(base as u16)
            .with_base_mid((base >> 16) as u8)
            .with_base_hi((base >> 24) as u8)
            .with_typ(TSS_AVAILABLE)
            .with_p(true)
    }
}

/// 32-bit task state segment. Only `esp0`/`ss0` are used.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct Tss32 {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u32,
    pub esp1: u32,
    pub ss1: u32,
    pub esp2: u32,
    pub ss2: u32,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub regs: [u32; 8],
    pub segments: [u32; 6],
    pub ldt: u32,
    pub trap: u16,
    /// Offset of the I/O bitmap; past the end means "none".
    pub iomap_base: u16,
}

const _: () = assert!(size_of::<Tss32>() == 104);

const FLAT_PAGES: u32 = 0x10_0000;
const GUEST_PAGES: u32 = GUEST_MEM_SIZE / PAGE_SIZE;
const GDT_ENTRIES: usize = 8;

static mut TSS: Tss32 = Tss32 {
    link: 0,
    esp0: 0,
    ss0: selectors::KERNEL_DS,
    esp1: 0,
    ss1: 0,
    esp2: 0,
    ss2: 0,
    cr3: 0,
    eip: 0,
    eflags: 0,
    regs: [0; 8],
    segments: [0; 6],
    ldt: 0,
    trap: 0,
    iomap_base: size_of::<Tss32>() as u16,
};

static mut GDT: [SegmentDescriptor; GDT_ENTRIES] = [
    SegmentDescriptor::new(),
    SegmentDescriptor::segment(CODE, 0, 0, FLAT_PAGES),
    SegmentDescriptor::segment(DATA, 0, 0, FLAT_PAGES),
    SegmentDescriptor::segment(CODE, 3, 0, FLAT_PAGES),
    SegmentDescriptor::segment(DATA, 3, 0, FLAT_PAGES),
    SegmentDescriptor::segment(CODE, 3, GUEST_BASE, GUEST_PAGES),
    SegmentDescriptor::segment(DATA, 3, GUEST_BASE, GUEST_PAGES),
    // Filled in by `init` once the TSS address is known.
    SegmentDescriptor::new(),
];

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Loads the GDT, reloads every segment register and the task register.
///
/// # Safety
/// Call once, early, with interrupts off.
pub unsafe fn init() {
    unsafe {
        let tss = (&raw const TSS) as u32;
        (*(&raw mut GDT))[GDT_ENTRIES - 1] = SegmentDescriptor::tss(tss, size_of::<Tss32>() as u32 - 1);
        let pointer = DescriptorPointer {
            limit: (size_of::<[SegmentDescriptor; GDT_ENTRIES]>() - 1) as u16,
            base: (&raw const GDT) as u32,
        };
        core::arch::asm!(
            "lgdt [{ptr}]",
            "mov ds, {ds:x}",
            "mov es, {ds:x}",
            "mov fs, {ds:x}",
            "mov gs, {ds:x}",
            "mov ss, {ds:x}",
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            "ltr {tss:x}",
            ptr = in(reg) &raw const pointer,
            ds = in(reg) selectors::KERNEL_DS,
            cs = in(reg) selectors::KERNEL_CS,
            tss = in(reg) selectors::TSS,
            tmp = out(reg) _,
        );
    }
}

/// Sets the stack the CPU switches to on the next trap from ring 3.
pub fn set_kernel_stack(top: u32) {
    // SAFETY: single core; only the scheduler writes this, with the local lock held.
    unsafe {
        (*(&raw mut TSS)).esp0 = top;
    }
}
