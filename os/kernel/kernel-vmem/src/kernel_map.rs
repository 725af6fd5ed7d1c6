//! Shared kernel-half directory entries.

use crate::info::{FRAME_WINDOW_BASE, KERNEL_PDE_COUNT, PAGE_SIZE};
use crate::{AddressSpace, EntryFlags, FrameAlloc, MapError, PageEntry, PageTable, PhysMapper, SoftwareBits};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use log::debug;

/// The kernel half every address space starts from.
///
/// Built once at boot: `[PAGE_SIZE, FRAME_WINDOW_BASE)` is identity-mapped
/// supervisor, writable and global. Page zero stays unmapped so null
/// dereferences in the kernel fault. The frame-window slots at the top are
/// left non-present in a table of their own that the physical mapper edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelMappings {
    pdes: [PageEntry; KERNEL_PDE_COUNT],
}

impl KernelMappings {
    /// No kernel mappings at all.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            pdes: [PageEntry::zero(); KERNEL_PDE_COUNT],
        }
    }

    /// Build the identity map using a scratch directory from `alloc`.
    ///
    /// Page tables built here are never freed.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when the page tables cannot be allocated.
    pub fn build<M: PhysMapper + ?Sized, A: FrameAlloc + ?Sized>(
        mapper: &M,
        alloc: &mut A,
    ) -> Result<Self, MapError> {
        let scratch = AddressSpace::create(mapper, alloc, &Self::empty().pdes)?;
        let flags = EntryFlags::WRITABLE | EntryFlags::GLOBAL;

        let mut va = PAGE_SIZE;
        while va < FRAME_WINDOW_BASE {
            let page = VirtualAddress::new(va);
            let frame = PhysicalPage::from_number(va >> 12);
            scratch.map(alloc, page, frame, flags, SoftwareBits::empty())?;
            va += PAGE_SIZE;
        }
        // The window table must exist even though its slots start empty.
        scratch.ensure_table(alloc, VirtualAddress::new(FRAME_WINDOW_BASE))?;

        let mut pdes = [PageEntry::zero(); KERNEL_PDE_COUNT];
        for (i, pde) in pdes.iter_mut().enumerate() {
            *pde = scratch.pde(i);
        }
        alloc.free_4k(scratch.root());

        debug!("kernel identity map: {KERNEL_PDE_COUNT} tables, window at {FRAME_WINDOW_BASE:#010x}");
        Ok(Self { pdes })
    }

    /// Directory entries to copy into every new address space.
    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &[PageEntry; KERNEL_PDE_COUNT] {
        &self.pdes
    }

    /// The page table holding the frame-window slots.
    #[must_use]
    pub fn window_table<'a, M: PhysMapper + ?Sized>(&self, mapper: &M) -> Option<&'a mut PageTable> {
        let pde = self.pdes[VirtualAddress::new(FRAME_WINDOW_BASE).pd_index()];
        pde.present().then(|| mapper.table_mut(pde.frame()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StackAlloc, TestPhys};

    #[test]
    fn identity_map_is_supervisor_global() {
        let phys = TestPhys::with_frames(16);
        let mut alloc = StackAlloc::new(1, 15);
        let kernel = KernelMappings::build(&phys, &mut alloc).unwrap();
        // directory was scratch; the four tables are kept
        assert_eq!(alloc.free.len(), 15 - 4);

        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        let sample = VirtualAddress::new(0x0012_3000);
        let leaf = space.leaf(sample).unwrap();
        assert!(leaf.writable() && leaf.global() && !leaf.user());
        assert_eq!(leaf.frame().number(), 0x123);

        assert!(space.leaf(VirtualAddress::zero()).is_none());
        assert!(space.leaf(VirtualAddress::new(FRAME_WINDOW_BASE)).is_none());
        assert!(space.search(VirtualAddress::new(FRAME_WINDOW_BASE)).is_some());
        assert!(kernel.window_table(&phys).is_some());
    }
}
