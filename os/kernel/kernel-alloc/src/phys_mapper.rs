//! # Physical Mappers
//!
//! Rust can only dereference virtual addresses. The kernel half of every
//! address space identity-maps physical memory below
//! [`USER_MEM_START`](kernel_info::memory::USER_MEM_START), so kernel-pool
//! frames (page tables, kernel stacks) are reachable at their own address.
//! User-pool frames live above that and are reached one at a time through a
//! pair of frame windows at the top of kernel memory.
//!
//! ## Window discipline
//! - Two slots, handed out round robin, so a frame-to-frame copy can hold
//!   source and destination at once.
//! - A window reference is valid until the next-but-one window request. The
//!   caller must hold the local lock across the use so no interrupt handler
//!   recycles the slot underneath it.

use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{FRAME_WINDOW_BASE, FRAME_WINDOW_COUNT, PAGE_SIZE, USER_MEM_START};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{EntryFlags, Mmu, PageEntry, PageTable, PhysMapper, SoftwareBits};

/// [`PhysMapper`] for memory inside the kernel's identity map.
///
/// # Safety
/// Only valid for addresses below `USER_MEM_START`.
#[derive(Debug, Default, Copy, Clone)]
pub struct IdentityMapper;

impl PhysMapper for IdentityMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u32() < USER_MEM_START, "{pa} is outside the identity map");
        // SAFETY: the kernel half maps every frame below USER_MEM_START at its own address.
        unsafe { &mut *(pa.as_usize() as *mut T) }
    }
}

/// [`PhysMapper`] for any frame: identity below `USER_MEM_START`, a frame
/// window above it.
pub struct WindowedPhysMapper<U: Mmu> {
    /// The kernel page table covering the window slots, reached through the identity map.
    window: *mut PageTable,
    next: AtomicU32,
    mmu: U,
}

// SAFETY: the window table is only edited with the local lock held.
unsafe impl<U: Mmu + Sync> Sync for WindowedPhysMapper<U> {}
unsafe impl<U: Mmu + Send> Send for WindowedPhysMapper<U> {}

impl<U: Mmu> WindowedPhysMapper<U> {
    /// # Safety
    /// `window` must be the page table that maps `FRAME_WINDOW_BASE` in every
    /// address space, and must outlive the mapper.
    pub const unsafe fn new(window: *mut PageTable, mmu: U) -> Self {
        Self {
            window,
            next: AtomicU32::new(0),
            mmu,
        }
    }

    /// Point the next window slot at `frame` and return the slot's address.
    pub fn open_window(&self, frame: PhysicalPage) -> VirtualAddress {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % FRAME_WINDOW_COUNT;
        let va = VirtualAddress::new(FRAME_WINDOW_BASE + slot * PAGE_SIZE);
        let entry = PageEntry::leaf(frame, EntryFlags::WRITABLE, SoftwareBits::empty());
        // SAFETY: `window` is valid per `new`; the local lock serializes edits.
        unsafe { (*self.window).set(va.pt_index(), entry) };
        self.mmu.invalidate(va);
        va
    }

    /// Where `pa` can be reached right now, opening a window if needed.
    pub fn reach(&self, pa: PhysicalAddress) -> VirtualAddress {
        if pa.as_u32() < USER_MEM_START {
            VirtualAddress::new(pa.as_u32())
        } else {
            self.open_window(pa.page::<Size4K>()) + pa.offset::<Size4K>()
        }
    }
}

impl<U: Mmu> PhysMapper for WindowedPhysMapper<U> {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.reach(pa);
        // SAFETY: `reach` returned a mapped, writable kernel address for `pa`.
        unsafe { &mut *(va.as_usize() as *mut T) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingMmu {
        flushed: RefCell<Vec<VirtualAddress>>,
    }

    impl Mmu for &RecordingMmu {
        fn activate(&self, _root: PhysicalPage) {}

        fn active(&self) -> PhysicalPage {
            PhysicalPage::from_number(0)
        }

        fn invalidate(&self, va: VirtualAddress) {
            self.flushed.borrow_mut().push(va);
        }
    }

    #[test]
    fn windows_alternate_and_flush() {
        let mut table: Box<PageTable> = Box::new(unsafe { core::mem::zeroed() });
        let mmu = RecordingMmu::default();
        let mapper = unsafe { WindowedPhysMapper::new(&raw mut *table, &mmu) };

        let low = mapper.reach(PhysicalAddress::new(0x0030_0040));
        assert_eq!(low.as_u32(), 0x0030_0040);

        let a = mapper.reach(PhysicalAddress::new(0x0200_0010));
        let b = mapper.reach(PhysicalAddress::new(0x0300_0000));
        let c = mapper.reach(PhysicalAddress::new(0x0400_0000));
        assert_eq!(a.as_u32(), FRAME_WINDOW_BASE + 0x10);
        assert_eq!(b.as_u32(), FRAME_WINDOW_BASE + PAGE_SIZE);
        assert_eq!(c.as_u32(), FRAME_WINDOW_BASE);
        assert_eq!(mmu.flushed.borrow().len(), 3);

        let slot = table.get(VirtualAddress::new(FRAME_WINDOW_BASE).pt_index());
        assert_eq!(slot.frame().number(), 0x4000);
        assert!(slot.present() && slot.writable() && !slot.user());
    }
}
