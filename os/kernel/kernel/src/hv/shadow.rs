//! # Shadow Paging
//!
//! A guest never runs on its own page tables. Until it turns paging on it
//! runs on the *original* directory the loader built, where guest-physical
//! address `gpa` lives at host address `GUEST_BASE + gpa`. Once it installs
//! a directory with `SETPD`, the kernel compiles a *shadow* directory:
//!
//! ```text
//!  guest VA ──guest PD/PT──► gpa ──original──► host frame
//!      │                                          ▲
//!      └──── + GUEST_BASE ──► host VA ──shadow────┘
//! ```
//!
//! The shadow is rebuilt from scratch on every `SETPD` and every change of
//! virtual privilege, and patched one page at a time by `ADJUSTPG`. Guest
//! tables are read entry by entry through the frame windows, so no more
//! than two guest frames are ever reachable at once.
//!
//! Shadow leaves are always user-accessible because the guest runs at
//! CPL 3 whatever its virtual mode; pages the guest marked supervisor-only
//! are simply left out while it is in virtual user mode.

use super::info::GuestMode;
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::process::Process;
use crate::trap::TrapFrame;
use kernel_info::memory::{GUEST_BASE, GUEST_MEM_SIZE, KERNEL_PDE_COUNT, PAGE_SIZE, PDE_COUNT, USER_STACK_PAGE};
use kernel_memory_addresses::{ENTRIES_PER_TABLE, PhysicalPage, VirtualAddress};
use kernel_vmem::{AddressSpace, EntryFlags, FrameAlloc, MapError, PageEntry, PageTable, PhysMapper, SoftwareBits};
use log::{debug, trace, warn};

/// A shadow that could not be built.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShadowError {
    #[error("guest table at {0:#x} is outside guest memory")]
    BadTable(u32),
    #[error("guest entry {entry:#010x} for {va:#x} sets reserved bits")]
    Corrupt { va: u32, entry: u32 },
    #[error("guest entry for {0:#x} names a frame outside guest memory")]
    BadFrame(u32),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("process is not a guest")]
    NotGuest,
}

/// The guest paging state a shadow is compiled from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GuestPaging {
    /// Guest-physical address of the guest page directory.
    pub cr3: u32,
    pub mode: GuestMode,
    pub wp: bool,
}

/// Host address of guest-virtual `gva`, unless it collides with the
/// kernel-owned top of the address space.
fn host_address(gva: u32) -> Option<VirtualAddress> {
    gva.checked_add(GUEST_BASE).filter(|va| *va < USER_STACK_PAGE).map(VirtualAddress::new)
}

/// The guest page table at `gpa`, reached through a frame window.
fn guest_table<'a, M: PhysMapper + ?Sized>(
    original: AddressSpace<'a, M>,
    gpa: u32,
) -> Result<&'a mut PageTable, ShadowError> {
    if gpa % PAGE_SIZE != 0 || gpa >= GUEST_MEM_SIZE {
        return Err(ShadowError::BadTable(gpa));
    }
    let leaf = original
        .leaf(VirtualAddress::new(GUEST_BASE + gpa))
        .ok_or(ShadowError::BadTable(gpa))?;
    Ok(original.mapper().table_mut(leaf.frame()))
}

fn check_clean(gva: u32, entry: PageEntry) -> Result<(), ShadowError> {
    if entry.is_guest_clean() {
        Ok(())
    } else {
        Err(ShadowError::Corrupt { va: gva, entry: entry.into_bits() })
    }
}

/// Host leaf for the guest translation `pde`/`pte` of `gva`, or `None` when
/// the page must stay invisible.
fn host_entry<M: PhysMapper + ?Sized>(
    original: AddressSpace<'_, M>,
    gva: u32,
    pde: PageEntry,
    pte: PageEntry,
    paging: GuestPaging,
) -> Result<Option<PageEntry>, ShadowError> {
    if !pte.present() {
        return Ok(None);
    }
    check_clean(gva, pte)?;
    if paging.mode == GuestMode::User && !(pde.user() && pte.user()) {
        return Ok(None);
    }
    let gpa = pte.frame().base().as_u32();
    if gpa >= GUEST_MEM_SIZE {
        return Err(ShadowError::BadFrame(gva));
    }
    let host = original
        .leaf(VirtualAddress::new(GUEST_BASE + gpa))
        .ok_or(ShadowError::BadFrame(gva))?;

    let mut flags = EntryFlags::PRESENT | EntryFlags::USER;
    if (pde.writable() && pte.writable()) || (paging.mode == GuestMode::Kernel && !paging.wp) {
        flags |= EntryFlags::WRITABLE;
    }
    Ok(Some(PageEntry::leaf(host.frame(), flags, SoftwareBits::empty())))
}

/// Builds a shadow directory for `paging` over the guest memory mapped by
/// `original`. Page tables come from `alloc`; nothing is left allocated on
/// failure.
///
/// # Errors
/// See [`ShadowError`].
pub fn compile<M: PhysMapper + ?Sized, F: FrameAlloc + ?Sized>(
    mapper: &M,
    alloc: &mut F,
    kernel: &[PageEntry; KERNEL_PDE_COUNT],
    original: PhysicalPage,
    paging: GuestPaging,
) -> Result<PhysicalPage, ShadowError> {
    let original = AddressSpace::from_root(mapper, original);
    let shadow = AddressSpace::create(mapper, alloc, kernel)?;
    match fill(original, shadow, alloc, paging) {
        Ok(skipped) => {
            if skipped > 0 {
                warn!("shadow: {skipped} guest pages overlap the kernel-owned top, not mapped");
            }
            Ok(shadow.root())
        }
        Err(e) => {
            shadow.destroy(alloc);
            Err(e)
        }
    }
}

/// Returns the number of pages left out for lack of host address space.
fn fill<M: PhysMapper + ?Sized, F: FrameAlloc + ?Sized>(
    original: AddressSpace<'_, M>,
    shadow: AddressSpace<'_, M>,
    alloc: &mut F,
    paging: GuestPaging,
) -> Result<usize, ShadowError> {
    let mut skipped = 0;
    for pdi in 0..PDE_COUNT {
        // Copied out: the window behind the directory is reused below.
        let pde = guest_table(original, paging.cr3)?.get(pdi);
        let gva_base = (pdi as u32) << 22;
        if !pde.present() {
            continue;
        }
        check_clean(gva_base, pde)?;
        if paging.mode == GuestMode::User && !pde.user() {
            continue;
        }
        let table = guest_table(original, pde.frame().base().as_u32())?;
        for pti in 0..ENTRIES_PER_TABLE {
            let gva = gva_base | (pti as u32) << 12;
            let Some(entry) = host_entry(original, gva, pde, table.get(pti), paging)? else {
                continue;
            };
            let Some(va) = host_address(gva) else {
                skipped += 1;
                continue;
            };
            shadow.ensure_table(alloc, va)?.set(va.pt_index(), entry);
        }
    }
    Ok(skipped)
}

/// Re-derives the single shadow leaf for guest page `gva`.
fn patch<M: PhysMapper + ?Sized, F: FrameAlloc + ?Sized>(
    original: AddressSpace<'_, M>,
    shadow: AddressSpace<'_, M>,
    alloc: &mut F,
    paging: GuestPaging,
    gva: u32,
    va: VirtualAddress,
) -> Result<(), ShadowError> {
    let pdi = (gva >> 22) as usize;
    let pde = guest_table(original, paging.cr3)?.get(pdi);
    let entry = if !pde.present() {
        None
    } else {
        check_clean(gva & !0x3F_FFFF, pde)?;
        if paging.mode == GuestMode::User && !pde.user() {
            None
        } else {
            let pte = guest_table(original, pde.frame().base().as_u32())?.get(((gva >> 12) & 0x3FF) as usize);
            host_entry(original, gva, pde, pte, paging)?
        }
    };
    match entry {
        Some(entry) => shadow.ensure_table(alloc, va)?.set(va.pt_index(), entry),
        None => {
            shadow.unmap(va);
        }
    }
    Ok(())
}

impl<A: Arch> Kernel<A> {
    /// Rebuilds the shadow of `process` from its current virtual paging
    /// state and installs it. Without guest paging the original directory
    /// is installed instead.
    ///
    /// # Errors
    /// See [`ShadowError`]; the previous directory stays installed.
    pub(crate) fn recompile(&self, process: &Process) -> Result<(), ShadowError> {
        let (original, paging) = process
            .with_guest(self.irq(), |g| {
                (g.original, g.guest_cr3.map(|cr3| GuestPaging { cr3, mode: g.mode, wp: g.wp }))
            })
            .ok_or(ShadowError::NotGuest)?;
        let _w = process.memlock.write(self);
        let shadow = match paging {
            Some(paging) => Some(self.with_frames(|pools| {
                compile(self.arch.mapper(), &mut pools.kernel, self.kernel_map.entries(), original, paging)
            })?),
            None => None,
        };
        self.install_shadow(process, original, shadow);
        trace!("shadow: pid {} recompiled ({paging:?})", process.pid());
        Ok(())
    }

    /// Puts the original directory back and frees the shadow.
    pub(crate) fn drop_shadow(&self, process: &Process) {
        let Some(original) = process.with_guest(self.irq(), |g| g.original) else {
            return;
        };
        let _w = process.memlock.write_force(self);
        self.install_shadow(process, original, None);
    }

    fn install_shadow(&self, process: &Process, original: PhysicalPage, shadow: Option<PhysicalPage>) {
        let old = process
            .with_guest(self.irq(), |g| core::mem::replace(&mut g.shadow, shadow))
            .flatten();
        let directory = shadow.unwrap_or(original);
        self.masked(|| {
            let previous = process.replace_directory(directory);
            if self.arch.active() == previous {
                self.arch.activate(directory);
            }
        });
        if let Some(old) = old {
            self.with_frames(|pools| AddressSpace::from_root(self.arch.mapper(), old).destroy(&mut pools.kernel));
        }
    }

    /// `ADJUSTPG`: refreshes the shadow entry for guest page `gva` after
    /// the guest edited its tables.
    ///
    /// # Errors
    /// See [`ShadowError`].
    pub(crate) fn invalidate_guest(&self, process: &Process, gva: u32) -> Result<(), ShadowError> {
        let gva = gva & !(PAGE_SIZE - 1);
        let (original, shadow, paging) = process
            .with_guest(self.irq(), |g| {
                (g.original, g.shadow, g.guest_cr3.map(|cr3| GuestPaging { cr3, mode: g.mode, wp: g.wp }))
            })
            .ok_or(ShadowError::NotGuest)?;
        let Some(va) = host_address(gva) else {
            debug!("shadow: adjustpg {gva:#x} is outside the host window");
            return Ok(());
        };
        if let (Some(shadow), Some(paging)) = (shadow, paging) {
            let _w = process.memlock.write(self);
            self.with_frames(|pools| {
                let mapper = self.arch.mapper();
                patch(
                    AddressSpace::from_root(mapper, original),
                    AddressSpace::from_root(mapper, shadow),
                    &mut pools.kernel,
                    paging,
                    gva,
                    va,
                )
            })?;
        }
        self.invalidate_if_active(process, va);
        Ok(())
    }

    /// Flushes every translation and leaves for `frame`. Used after any
    /// change to the guest's shadow.
    pub(crate) fn flush_and_resume(&self, frame: &TrapFrame) -> ! {
        self.arch.flush_all();
        self.resume(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::sim::SimPhys;
    use kernel_alloc::FrameStack;
    use kernel_vmem::KernelMappings;

    const PD_GPA: u32 = 0x1000;
    const PT_GPA: u32 = 0x2000;
    const GUEST_PAGES: u32 = 16;

    struct Guest {
        phys: SimPhys,
        tables: FrameStack,
        original: PhysicalPage,
    }

    impl Guest {
        /// 16 pages of guest memory backed by frames 0x2000.. and an empty
        /// guest directory at `PD_GPA` linking a table at `PT_GPA`.
        fn new() -> Self {
            let phys = SimPhys::default();
            let mut tables = FrameStack::from_range("tables", 0x400, 0x800);
            let original = AddressSpace::create(&phys, &mut tables, KernelMappings::empty().entries()).unwrap();
            for i in 0..GUEST_PAGES {
                original
                    .map(
                        &mut tables,
                        VirtualAddress::new(GUEST_BASE + i * PAGE_SIZE),
                        PhysicalPage::from_number(0x2000 + i),
                        EntryFlags::USER | EntryFlags::WRITABLE,
                        SoftwareBits::empty(),
                    )
                    .unwrap();
            }
            let original = original.root();
            let guest = Self { phys, tables, original };
            guest.set(PD_GPA, 0, PT_GPA | 0b111);
            guest
        }

        fn set(&self, table_gpa: u32, index: usize, raw: u32) {
            let frame = PhysicalPage::from_number(0x2000 + table_gpa / PAGE_SIZE);
            self.phys.table_mut(frame).set(index, PageEntry::from_bits(raw));
        }

        fn compile(&mut self, mode: GuestMode, wp: bool) -> Result<PhysicalPage, ShadowError> {
            let paging = GuestPaging { cr3: PD_GPA, mode, wp };
            compile(&self.phys, &mut self.tables, KernelMappings::empty().entries(), self.original, paging)
        }

        fn leaves(&self, root: PhysicalPage) -> Vec<(u32, u32)> {
            AddressSpace::from_root(&self.phys, root).traverse(0..PDE_COUNT, Vec::new(), |va, e, mut acc| {
                acc.push((va.as_u32(), e.into_bits()));
                acc
            })
        }
    }

    #[test]
    fn guest_mapping_lands_on_the_backing_frame() {
        let mut g = Guest::new();
        // gva 0x10000 -> gpa 0x5000, user read-write
        g.set(PT_GPA, 0x10, 0x5000 | 0b111);
        let root = g.compile(GuestMode::Kernel, true).unwrap();
        let leaf = AddressSpace::from_root(&g.phys, root).leaf(VirtualAddress::new(GUEST_BASE + 0x10000)).unwrap();
        assert_eq!(leaf.frame(), PhysicalPage::from_number(0x2005));
        assert!(leaf.user() && leaf.writable());
    }

    #[test]
    fn reversed_mappings_follow_the_guest() {
        let mut g = Guest::new();
        g.set(PT_GPA, 0, 0x3000 | 0b111);
        g.set(PT_GPA, 1, 0x2000 | 0b111);
        let root = g.compile(GuestMode::Kernel, true).unwrap();
        let space = AddressSpace::from_root(&g.phys, root);
        assert_eq!(space.leaf(VirtualAddress::new(GUEST_BASE)).unwrap().frame().number(), 0x2003);
        assert_eq!(space.leaf(VirtualAddress::new(GUEST_BASE + PAGE_SIZE)).unwrap().frame().number(), 0x2002);
    }

    #[test]
    fn user_mode_hides_supervisor_pages() {
        let mut g = Guest::new();
        g.set(PT_GPA, 4, 0x4000 | 0b011);
        g.set(PT_GPA, 5, 0x5000 | 0b111);
        let kernel = g.compile(GuestMode::Kernel, true).unwrap();
        let user = g.compile(GuestMode::User, true).unwrap();
        assert_eq!(g.leaves(kernel).len(), 2);
        let visible = g.leaves(user);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0, GUEST_BASE + 5 * PAGE_SIZE);
    }

    #[test]
    fn write_protect_governs_read_only_pages_in_kernel_mode() {
        let mut g = Guest::new();
        g.set(PT_GPA, 6, 0x6000 | 0b101);
        let va = VirtualAddress::new(GUEST_BASE + 6 * PAGE_SIZE);
        let loose = g.compile(GuestMode::Kernel, false).unwrap();
        assert!(AddressSpace::from_root(&g.phys, loose).leaf(va).unwrap().writable());
        let strict = g.compile(GuestMode::Kernel, true).unwrap();
        assert!(!AddressSpace::from_root(&g.phys, strict).leaf(va).unwrap().writable());
    }

    #[test]
    fn recompiling_is_idempotent() {
        let mut g = Guest::new();
        for i in 0..GUEST_PAGES as usize {
            g.set(PT_GPA, 0x100 + i, (i as u32 * PAGE_SIZE) | 0b111);
        }
        let first = g.compile(GuestMode::Kernel, true).unwrap();
        let second = g.compile(GuestMode::Kernel, true).unwrap();
        assert_ne!(first, second);
        assert_eq!(g.leaves(first), g.leaves(second));
    }

    #[test]
    fn reserved_bits_are_corruption_and_leak_nothing() {
        let mut g = Guest::new();
        g.set(PT_GPA, 3, 0x3000 | 0b111 | 1 << 4);
        let before = g.tables.available();
        assert_eq!(
            g.compile(GuestMode::Kernel, true),
            Err(ShadowError::Corrupt { va: 0x3000, entry: 0x3000 | 0b111 | 1 << 4 })
        );
        assert_eq!(g.tables.available(), before);
    }

    #[test]
    fn frames_beyond_guest_memory_are_refused() {
        let mut g = Guest::new();
        g.set(PT_GPA, 2, GUEST_MEM_SIZE | 0b111);
        assert_eq!(g.compile(GuestMode::Kernel, true), Err(ShadowError::BadFrame(0x2000)));
    }

    #[test]
    fn top_of_guest_space_is_skipped() {
        let mut g = Guest::new();
        g.set(PD_GPA, PDE_COUNT - 1, PT_GPA | 0b111);
        g.set(PT_GPA, ENTRIES_PER_TABLE - 1, 0x1000 | 0b111);
        let root = g.compile(GuestMode::Kernel, true).unwrap();
        // Table 0 still maps gva 0x3FF000; the alias at the top is dropped.
        let leaves = g.leaves(root);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].0, GUEST_BASE + 0x3F_F000);
    }

    #[test]
    fn patch_follows_a_single_edit() {
        let mut g = Guest::new();
        g.set(PT_GPA, 7, 0x7000 | 0b111);
        let root = g.compile(GuestMode::Kernel, true).unwrap();
        g.set(PT_GPA, 7, 0x8000 | 0b111);
        g.set(PT_GPA, 9, 0x9000 | 0b111);
        let va = VirtualAddress::new(GUEST_BASE + 7 * PAGE_SIZE);
        let paging = GuestPaging { cr3: PD_GPA, mode: GuestMode::Kernel, wp: true };
        let original = AddressSpace::from_root(&g.phys, g.original);
        let shadow = AddressSpace::from_root(&g.phys, root);
        patch(original, shadow, &mut g.tables, paging, 7 * PAGE_SIZE, va).unwrap();
        assert_eq!(shadow.leaf(va).unwrap().frame().number(), 0x2008);
        // Page 9 was not adjusted and stays invisible.
        assert!(shadow.leaf(VirtualAddress::new(GUEST_BASE + 9 * PAGE_SIZE)).is_none());

        g.set(PT_GPA, 7, 0);
        patch(original, shadow, &mut g.tables, paging, 7 * PAGE_SIZE, va).unwrap();
        assert!(shadow.leaf(va).is_none());
    }
}
