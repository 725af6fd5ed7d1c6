//! # Address Space (i386, directory-rooted)
//!
//! A handle to one page directory plus the mapper used to reach its tables.
//!
//! ## Design
//!
//! - Directory entries are created present + writable, with the user bit set
//!   only for the user half. Permission enforcement happens at the leaf.
//! - The kernel half (`0..KERNEL_PDE_COUNT`) points at tables shared by every
//!   address space and is never freed here.
//! - Page tables come from the caller's [`FrameAlloc`]; leaf frames are the
//!   caller's business entirely. Nothing here copies or frees a leaf frame.
//!
//! ## Safety
//!
//! Mutating the active directory requires TLB maintenance through
//! [`Mmu`](crate::Mmu) by the caller.

use crate::info::{KERNEL_PDE_COUNT, is_user_address};
use crate::{EntryFlags, FrameAlloc, PageEntry, PageTable, PhysMapper, SoftwareBits, USER_PDE_RANGE};
use core::ops::Range;
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::trace;

/// Failure to build paging structures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// No frame was available for a page table.
    #[error("out of memory")]
    OutOfMemory,
    /// The page is already mapped.
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper + ?Sized> {
    root: PhysicalPage,
    mapper: &'m M,
}

impl<M: PhysMapper + ?Sized> Clone for AddressSpace<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: PhysMapper + ?Sized> Copy for AddressSpace<'_, M> {}

impl<'m, M: PhysMapper + ?Sized> AddressSpace<'m, M> {
    /// View an existing directory.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage) -> Self {
        Self { root, mapper }
    }

    /// Allocate a fresh directory whose kernel half is `kernel` and whose
    /// user half is empty.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is available for the directory.
    pub fn create<A: FrameAlloc + ?Sized>(
        mapper: &'m M,
        alloc: &mut A,
        kernel: &[PageEntry; KERNEL_PDE_COUNT],
    ) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let dir = mapper.table_mut(root);
        dir.zero();
        for (i, e) in kernel.iter().enumerate() {
            dir.set(i, *e);
        }
        Ok(Self { root, mapper })
    }

    /// Physical frame of the page directory.
    #[inline]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// Borrow the page directory.
    #[inline]
    pub fn directory(&self) -> &'m mut PageTable {
        self.mapper.table_mut(self.root)
    }

    #[inline]
    #[must_use]
    pub fn pde(&self, index: usize) -> PageEntry {
        self.directory().get(index)
    }

    #[inline]
    pub fn set_pde(&self, index: usize, entry: PageEntry) {
        self.directory().set(index, entry);
    }

    /// Page table linked from directory slot `index`, if present.
    #[inline]
    #[must_use]
    pub fn table(&self, index: usize) -> Option<&'m mut PageTable> {
        let pde = self.pde(index);
        pde.present().then(|| self.mapper.table_mut(pde.frame()))
    }

    /// Install `va → frame` with `flags` (present is implied) and bookkeeping
    /// `sw`, allocating the intermediate table if needed. An existing leaf is
    /// overwritten.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when a page table is needed and none is available.
    pub fn map<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage,
        flags: EntryFlags,
        sw: SoftwareBits,
    ) -> Result<(), MapError> {
        debug_assert!(va.is_aligned::<Size4K>(), "unaligned mapping {va}");
        let table = self.ensure_table(alloc, va)?;
        table.set(va.pt_index(), PageEntry::leaf(frame, flags, sw));
        Ok(())
    }

    /// Like [`map`](Self::map), but refuses to replace a present leaf.
    ///
    /// # Errors
    /// [`MapError::AlreadyMapped`] or [`MapError::OutOfMemory`].
    pub fn map_new<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage,
        flags: EntryFlags,
        sw: SoftwareBits,
    ) -> Result<(), MapError> {
        if self.leaf(va).is_some() {
            return Err(MapError::AlreadyMapped(va));
        }
        self.map(alloc, va, frame, flags, sw)
    }

    /// The page table covering `va`, allocated and linked if absent.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] on table allocation failure.
    pub fn ensure_table<A: FrameAlloc + ?Sized>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<&'m mut PageTable, MapError> {
        let index = va.pd_index();
        if let Some(table) = self.table(index) {
            return Ok(table);
        }

        let frame = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let table = self.mapper.table_mut(frame);
        table.zero();
        self.set_pde(index, PageEntry::table_link(frame, is_user_address(va)));
        trace!("linked page table {frame:?} at PDE {index}");
        Ok(table)
    }

    /// The leaf slot for `va` if its page table exists. The entry itself may
    /// be non-present.
    #[must_use]
    pub fn search(&self, va: VirtualAddress) -> Option<&'m mut PageEntry> {
        self.table(va.pd_index()).map(|t| t.entry_mut(va.pt_index()))
    }

    /// The present leaf for `va`, by value.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageEntry> {
        self.search(va).map(|e| *e).filter(|e| e.present())
    }

    /// Translate `va` to a physical address if mapped.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.leaf(va).map(|e| e.frame().base() + va.offset::<Size4K>())
    }

    /// Clear the leaf for `va`, returning it if it was present. The page
    /// table stays linked.
    pub fn unmap(&self, va: VirtualAddress) -> Option<PageEntry> {
        let slot = self.search(va)?;
        let old = *slot;
        *slot = PageEntry::zero();
        old.present().then_some(old)
    }

    /// Fold over every present leaf in directory slots `pd_range`.
    ///
    /// The visitor receives the page address, the entry (which it may modify
    /// or clear) and the running token, and returns the next token.
    pub fn traverse<T>(
        &self,
        pd_range: Range<usize>,
        init: T,
        mut visit: impl FnMut(VirtualAddress, &mut PageEntry, T) -> T,
    ) -> T {
        let mut token = init;
        for pdi in pd_range {
            let Some(table) = self.table(pdi) else {
                continue;
            };
            for pti in 0..ENTRIES_PER_TABLE {
                let entry = table.entry_mut(pti);
                if entry.present() {
                    token = visit(VirtualAddress::from_indices(pdi, pti), entry, token);
                }
            }
        }
        token
    }

    /// Page-table-only duplicate: a new directory with the same kernel half,
    /// fresh copies of every user page table, and the very same leaf frames.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`]; nothing is leaked, partial copies are freed.
    pub fn clone_tables<A: FrameAlloc + ?Sized>(&self, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfMemory)?;
        let child = Self::from_root(self.mapper, root);
        let dir = child.directory();
        dir.zero();
        for i in 0..KERNEL_PDE_COUNT {
            dir.set(i, self.pde(i));
        }

        for i in USER_PDE_RANGE {
            let pde = self.pde(i);
            if !pde.present() {
                continue;
            }
            let Some(frame) = alloc.alloc_4k() else {
                child.destroy(alloc);
                return Err(MapError::OutOfMemory);
            };
            let src = self.mapper.table_mut(pde.frame());
            self.mapper.table_mut(frame).copy_from(src);
            child.set_pde(i, pde.with_frame(frame));
        }
        Ok(child)
    }

    /// Free every user-half page table and clear the user half of the
    /// directory. Leaf frames are not touched.
    pub fn free_user_tables<A: FrameAlloc + ?Sized>(&self, alloc: &mut A) {
        for i in USER_PDE_RANGE {
            let pde = self.pde(i);
            if pde.present() {
                alloc.free_4k(pde.frame());
                self.set_pde(i, PageEntry::zero());
            }
        }
    }

    /// [`free_user_tables`](Self::free_user_tables) and free the directory itself.
    pub fn destroy<A: FrameAlloc + ?Sized>(self, alloc: &mut A) {
        self.free_user_tables(alloc);
        alloc.free_4k(self.root);
    }

    /// Free the page tables in user slots `range` that no longer hold any
    /// present leaf.
    pub fn prune_empty_tables<A: FrameAlloc + ?Sized>(&self, alloc: &mut A, range: Range<usize>) {
        for i in range {
            let empty = self.table(i).is_some_and(|t| !t.any_present());
            if empty {
                alloc.free_4k(self.pde(i).frame());
                self.set_pde(i, PageEntry::zero());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StackAlloc, TestPhys};
    use crate::KernelMappings;

    fn setup() -> (TestPhys, StackAlloc) {
        (TestPhys::with_frames(64), StackAlloc::new(1, 63))
    }

    #[test]
    fn map_creates_table_and_leaf() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();

        let va = VirtualAddress::new(0x0100_3000);
        let frame = PhysicalPage::from_number(40);
        space
            .map(&mut alloc, va, frame, EntryFlags::USER | EntryFlags::WRITABLE, SoftwareBits::empty())
            .unwrap();

        let pde = space.pde(va.pd_index());
        assert!(pde.present() && pde.writable() && pde.user());

        let leaf = space.leaf(va).unwrap();
        assert!(leaf.user() && leaf.writable());
        assert_eq!(leaf.frame(), frame);
        assert_eq!(
            space.translate(va + 0x12),
            Some(PhysicalAddress::new((40 << 12) + 0x12))
        );
        assert!(space.translate(VirtualAddress::new(0x0100_4000)).is_none());
        assert!(space.search(VirtualAddress::new(0x0100_4000)).is_some());
        assert!(space.search(VirtualAddress::new(0x4000_0000)).is_none());
    }

    #[test]
    fn map_new_refuses_present_leaf() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        let va = VirtualAddress::new(0x0100_0000);
        let frame = PhysicalPage::from_number(9);
        space.map_new(&mut alloc, va, frame, EntryFlags::USER, SoftwareBits::empty()).unwrap();
        assert_eq!(
            space.map_new(&mut alloc, va, frame, EntryFlags::USER, SoftwareBits::empty()),
            Err(MapError::AlreadyMapped(va))
        );
    }

    #[test]
    fn kernel_half_directory_entry_is_supervisor() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        let va = VirtualAddress::new(0x0000_5000);
        space
            .map(&mut alloc, va, PhysicalPage::from_number(5), EntryFlags::WRITABLE, SoftwareBits::empty())
            .unwrap();
        assert!(!space.pde(0).user());
        assert!(space.pde(0).writable());
    }

    #[test]
    fn traverse_folds_and_clears() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        for (i, va) in [0x0100_0000u32, 0x0100_1000, 0x0200_0000].into_iter().enumerate() {
            space
                .map(
                    &mut alloc,
                    VirtualAddress::new(va),
                    PhysicalPage::from_number(50 + i as u32),
                    EntryFlags::USER,
                    SoftwareBits::empty(),
                )
                .unwrap();
        }

        let seen = space.traverse(USER_PDE_RANGE, 0u32, |_, _, n| n + 1);
        assert_eq!(seen, 3);

        let only_first = space.traverse(4..5, 0u32, |va, e, n| {
            *e = PageEntry::zero();
            assert!(va.as_u32() < 0x0140_0000);
            n + 1
        });
        assert_eq!(only_first, 2);
        assert_eq!(space.traverse(USER_PDE_RANGE, 0u32, |_, _, n| n + 1), 1);
    }

    #[test]
    fn clone_tables_duplicates_tables_not_frames() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let parent = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        let va = VirtualAddress::new(0x0180_0000);
        let frame = PhysicalPage::from_number(60);
        parent
            .map(&mut alloc, va, frame, EntryFlags::USER, SoftwareBits::ZFOD)
            .unwrap();

        let child = parent.clone_tables(&mut alloc).unwrap();
        assert_ne!(child.root(), parent.root());
        assert_ne!(child.pde(va.pd_index()).frame(), parent.pde(va.pd_index()).frame());
        assert_eq!(child.leaf(va), parent.leaf(va));

        child.unmap(va);
        assert!(parent.leaf(va).is_some(), "child tables must be private");
    }

    #[test]
    fn clone_tables_out_of_memory_leaks_nothing() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let parent = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        for pd in 4..8u32 {
            parent
                .map(
                    &mut alloc,
                    VirtualAddress::new(pd << 22),
                    PhysicalPage::from_number(1),
                    EntryFlags::USER,
                    SoftwareBits::empty(),
                )
                .unwrap();
        }

        let keep = alloc.free.len() - 3;
        let mut starved = StackAlloc {
            free: alloc.free.split_off(keep),
        };
        let before = starved.free.len();
        assert_eq!(parent.clone_tables(&mut starved).err(), Some(MapError::OutOfMemory));
        assert_eq!(starved.free.len(), before);
    }

    #[test]
    fn destroy_returns_tables() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let before = alloc.free.len();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        space
            .map(
                &mut alloc,
                VirtualAddress::new(0x0300_0000),
                PhysicalPage::from_number(2),
                EntryFlags::USER,
                SoftwareBits::empty(),
            )
            .unwrap();
        space.destroy(&mut alloc);
        assert_eq!(alloc.free.len(), before);
    }

    #[test]
    fn prune_drops_empty_tables_only() {
        let (phys, mut alloc) = setup();
        let kernel = KernelMappings::empty();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        let a = VirtualAddress::new(0x0100_0000);
        let b = VirtualAddress::new(0x0200_0000);
        for va in [a, b] {
            space
                .map(&mut alloc, va, PhysicalPage::from_number(3), EntryFlags::USER, SoftwareBits::empty())
                .unwrap();
        }
        space.unmap(a);
        space.prune_empty_tables(&mut alloc, USER_PDE_RANGE);
        assert!(!space.pde(a.pd_index()).present());
        assert!(space.pde(b.pd_index()).present());
    }
}
