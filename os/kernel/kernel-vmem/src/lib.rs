//! # Virtual Memory Support
//!
//! Two-level i386 paging (no PAE) for a kernel whose low 16 MiB are shared by
//! every address space and whose user half is private to each process.
//!
//! ## i386 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//!
//!  CR3 ─► Page Directory ─► Page Table ─► 4 KiB frame
//!          (1024 PDEs)       (1024 PTEs)
//! ```
//!
//! | Level | Table | Entry | Role |
//! |:------|:------|:------|:-----|
//! | 1 | **Page Directory** | **PDE** | Points at a page table; always present + writable, the leaf decides. |
//! | 2 | **Page Table** | **PTE** | Maps one 4 KiB frame with present / writable / user bits. |
//!
//! ## Software bits
//!
//! Bits 9–11 of an entry are ignored by the MMU. The kernel uses them as
//! [`SoftwareBits`]: zero-fill-on-demand placeholders and the head / body
//! marks of a `new_pages` span.
//!
//! ## What you get
//!
//! - [`PageEntry`] and [`PageTable`], the raw structures.
//! - [`AddressSpace`], a handle to one page directory with `map`, `search`,
//!   `translate`, `unmap`, `traverse` (fold over present leaves) and
//!   `clone_tables` (page-table-only duplication).
//! - Validate-then-copy helpers for touching user memory from the kernel
//!   ([`AddressSpace::check_user_range`], [`AddressSpace::copy_from_user`], …).
//! - The hardware seams: [`PhysMapper`] (reach a frame), [`FrameAlloc`]
//!   (obtain a frame) and [`Mmu`] (activate a directory, flush a translation).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod address_space;
mod entry;
mod kernel_map;
mod table;
mod user_access;

pub use crate::address_space::{AddressSpace, MapError};
pub use crate::entry::{EntryFlags, PageEntry, SoftwareBits};
pub use crate::kernel_map::KernelMappings;
pub use crate::table::PageTable;
pub use crate::user_access::{Access, AccessError};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use core::ops::Range;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};

/// Directory indices covering user memory.
pub const USER_PDE_RANGE: Range<usize> = info::KERNEL_PDE_COUNT..info::PDE_COUNT;

/// Source of physical 4 KiB frames.
///
/// Returned frames **must** be 4 KiB aligned. Returns `None` on exhaustion.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame.
    fn alloc_4k(&mut self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage);
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        (**self).alloc_4k()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage) {
        (**self).free_4k(frame);
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space (identity map for kernel memory, a frame
/// window for everything else).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be reachable and writable through this mapper.
    /// - The mapping must remain valid for `'a`; window-backed mappers only
    ///   guarantee that until the next call.
    /// - Type `T` must match the bytes at `pa` (no aliasing UB).
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the page table held in `frame`.
    #[inline]
    fn table_mut<'a>(&self, frame: PhysicalPage) -> &'a mut PageTable {
        unsafe { self.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Borrow the raw bytes of `frame`.
    #[inline]
    fn frame_bytes<'a>(&self, frame: PhysicalPage) -> &'a mut [u8; 4096] {
        unsafe { self.phys_to_mut::<[u8; 4096]>(frame.base()) }
    }

    /// Fill `frame` with zeroes.
    fn zero_frame(&self, frame: PhysicalPage) {
        self.frame_bytes(frame).fill(0);
    }

    /// Copy the contents of frame `from` into frame `to`.
    fn copy_frame(&self, from: PhysicalPage, to: PhysicalPage) {
        debug_assert_ne!(from, to, "copying a frame onto itself");
        let src: &[u8; 4096] = self.frame_bytes(from);
        self.frame_bytes(to).copy_from_slice(src);
    }
}

/// Translation hardware of the current core.
pub trait Mmu {
    /// Load `root` as the active page directory. Flushes every non-global
    /// translation.
    fn activate(&self, root: PhysicalPage);

    /// The directory currently loaded.
    fn active(&self) -> PhysicalPage;

    /// Flush the single translation for `va`.
    fn invalidate(&self, va: VirtualAddress);

    /// Flush every non-global translation.
    fn flush_all(&self) {
        self.activate(self.active());
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use alloc::vec::Vec;
    use core::cell::UnsafeCell;

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(align(4096))]
    pub struct Aligned4K(UnsafeCell<[u8; 4096]>);

    /// In-memory "RAM": physical address `n * 4096` is frame `n` of the vector.
    pub struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| Aligned4K(UnsafeCell::new([0; 4096]))).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u32() >> 12) as usize;
            let off = (pa.as_u32() & 0xfff) as usize;
            let base = self.frames[idx].0.get().cast::<u8>();
            unsafe { &mut *base.add(off).cast::<T>() }
        }
    }

    /// A trivial stack allocator over a frame range.
    pub struct StackAlloc {
        pub free: Vec<PhysicalPage>,
    }

    impl StackAlloc {
        pub fn new(first: u32, count: u32) -> Self {
            Self {
                free: (first..first + count).rev().map(PhysicalPage::from_number).collect(),
            }
        }
    }

    impl FrameAlloc for StackAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage> {
            self.free.pop()
        }

        fn free_4k(&mut self, frame: PhysicalPage) {
            self.free.push(frame);
        }
    }
}
