//! # User Memory Management
//!
//! `new_pages` spans are backed lazily: every page starts as a read-only
//! mapping of the shared zero frame stamped [`SoftwareBits::ZFOD`], and one
//! user-pool frame per page is reserved up front so the first write can never
//! run out of memory. The page fault handler (or a kernel write through
//! [`Kernel::copy_out`]) promotes the placeholder to a private zeroed frame.
//!
//! All page-table edits of a process happen under its `memlock` write lock;
//! readers of user memory take the read lock. Frame contents are touched only
//! with the local lock held because the physical mapper may go through the
//! per-core frame windows.

use crate::arch::Arch;
use crate::kernel::{FramePools, Kernel};
use crate::process::Process;
use alloc::vec::Vec;
use kernel_info::memory::{PAGE_SIZE, USER_MEM_START, is_user_address};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{
    Access, AccessError, AddressSpace, EntryFlags, FrameAlloc, MapError, PageEntry, PhysMapper,
    SoftwareBits, USER_PDE_RANGE,
};
use log::{debug, trace};

/// Why a `new_pages` / `remove_pages` request was refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("base {0} or length is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("range at {0} leaves user memory")]
    OutOfRange(VirtualAddress),
    #[error("page {0} is already mapped")]
    Overlap(VirtualAddress),
    #[error("out of memory")]
    OutOfMemory,
    #[error("{0} does not start a span")]
    NotASpan(VirtualAddress),
}

impl From<MapError> for MemoryError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => Self::OutOfMemory,
            MapError::AlreadyMapped(va) => Self::Overlap(va),
        }
    }
}

impl<A: Arch> Kernel<A> {
    /// Maps `len` bytes of zero-fill-on-demand memory at `base`.
    ///
    /// # Errors
    /// See [`MemoryError`]; nothing is mapped or reserved on failure.
    pub fn new_pages(&self, process: &Process, base: VirtualAddress, len: u32) -> Result<(), MemoryError> {
        if len == 0 || !base.is_aligned::<Size4K>() || len % PAGE_SIZE != 0 {
            return Err(MemoryError::Unaligned(base));
        }
        if base.as_u32() < USER_MEM_START || base.checked_add(len - 1).is_none() {
            return Err(MemoryError::OutOfRange(base));
        }
        let pages = len / PAGE_SIZE;
        let _w = process.memlock.write(self);
        let space = self.space_of(process);

        if let Some(taken) = (0..pages).map(|i| base + i * PAGE_SIZE).find(|va| space.leaf(*va).is_some()) {
            return Err(MemoryError::Overlap(taken));
        }

        self.with_frames(|pools| -> Result<(), MemoryError> {
            pools.user.try_reserve(pages as usize).map_err(|_| MemoryError::OutOfMemory)?;
            for i in 0..pages {
                let va = base + i * PAGE_SIZE;
                let sw = SoftwareBits::ZFOD
                    | if i == 0 {
                        SoftwareBits::SPAN_HEAD
                    } else {
                        SoftwareBits::SPAN_BODY
                    };
                if let Err(e) = space.map(&mut pools.kernel, va, self.zero_frame, EntryFlags::USER, sw) {
                    for j in 0..i {
                        space.unmap(base + j * PAGE_SIZE);
                    }
                    space.prune_empty_tables(&mut pools.kernel, USER_PDE_RANGE);
                    pools.user.unreserve(pages as usize);
                    return Err(e.into());
                }
            }
            Ok(())
        })?;

        process.with(self.irq(), |p| p.zfod_reserved += pages as usize);
        self.flush_if_active(process);
        debug!("new_pages: pid {} {base}+{len:#x}", process.pid());
        Ok(())
    }

    /// Unmaps the span that `new_pages` created at `base`.
    ///
    /// # Errors
    /// [`MemoryError::NotASpan`] if `base` is not the head of a span.
    pub fn remove_pages(&self, process: &Process, base: VirtualAddress) -> Result<(), MemoryError> {
        let _w = process.memlock.write(self);
        let space = self.space_of(process);
        let head = space
            .leaf(base)
            .filter(|e| base.is_aligned::<Size4K>() && e.software().contains(SoftwareBits::SPAN_HEAD))
            .ok_or(MemoryError::NotASpan(base))?;

        let mut released_zfod = 0;
        self.with_frames(|pools| {
            let mut va = base;
            let mut entry = Some(head);
            while let Some(e) = entry {
                space.unmap(va);
                if e.is_zfod_placeholder() {
                    pools.user.unreserve(1);
                    released_zfod += 1;
                } else {
                    pools.user.free(e.frame());
                }
                self.invalidate_if_active(process, va);
                let Some(next) = va.checked_add(PAGE_SIZE) else {
                    break;
                };
                va = next;
                entry = space.leaf(va).filter(|e| e.software().contains(SoftwareBits::SPAN_BODY));
            }
            space.prune_empty_tables(&mut pools.kernel, USER_PDE_RANGE);
        });
        process.with(self.irq(), |p| p.zfod_reserved -= released_zfod);
        debug!("remove_pages: pid {} {base}", process.pid());
        Ok(())
    }

    /// Replaces the zero-fill placeholder at `va` by a private zeroed frame.
    /// Returns `false` (and changes nothing) for any other kind of entry.
    ///
    /// The caller holds `process.memlock` for writing.
    pub(crate) fn promote_zfod(&self, process: &Process, va: VirtualAddress) -> bool {
        let space = self.space_of(process);
        let promoted = self.with_frames(|pools| {
            let Some(slot) = space.search(va) else {
                return false;
            };
            if !slot.is_zfod_placeholder() {
                return false;
            }
            let frame = pools.user.allocate_reserved();
            space.mapper().zero_frame(frame);
            let sw = slot.software() - SoftwareBits::ZFOD;
            *slot = PageEntry::leaf(frame, EntryFlags::WRITABLE | EntryFlags::USER, sw);
            true
        });
        if promoted {
            process.with(self.irq(), |p| p.zfod_reserved -= 1);
            self.invalidate_if_active(process, va.page::<Size4K>().base());
            trace!("zfod: pid {} promoted {va}", process.pid());
        }
        promoted
    }

    /// Copies user memory of `process` at `va` into `buf`.
    ///
    /// # Errors
    /// The first page that is not readable user memory.
    pub fn copy_in(&self, process: &Process, va: VirtualAddress, buf: &mut [u8]) -> Result<(), AccessError> {
        let _r = process.memlock.read(self);
        let space = self.space_of(process);
        self.masked(|| space.copy_from_user(va, buf))
    }

    /// Reads a little-endian word from user memory.
    ///
    /// # Errors
    /// As [`copy_in`](Self::copy_in).
    pub fn read_user_u32(&self, process: &Process, va: VirtualAddress) -> Result<u32, AccessError> {
        let _r = process.memlock.read(self);
        let space = self.space_of(process);
        self.masked(|| space.read_u32(va))
    }

    /// Reads `count` consecutive words; used for syscall parameter blocks.
    ///
    /// # Errors
    /// As [`copy_in`](Self::copy_in).
    pub fn read_user_words(&self, process: &Process, va: VirtualAddress, count: usize) -> Result<Vec<u32>, AccessError> {
        let _r = process.memlock.read(self);
        let space = self.space_of(process);
        self.masked(|| space.read_u32_array(va, count))
    }

    /// Reads a NUL-terminated string of at most `max` bytes.
    ///
    /// # Errors
    /// As [`copy_in`](Self::copy_in), or [`AccessError::TooLong`].
    pub fn read_user_str(&self, process: &Process, va: VirtualAddress, max: usize) -> Result<Vec<u8>, AccessError> {
        let _r = process.memlock.read(self);
        let space = self.space_of(process);
        self.masked(|| space.read_cstr(va, max))
    }

    /// Copies `data` into user memory of `process` at `va`, materializing
    /// zero-fill pages on the way.
    ///
    /// # Errors
    /// The first page that is not writable user memory.
    pub fn copy_out(&self, process: &Process, va: VirtualAddress, data: &[u8]) -> Result<(), AccessError> {
        let Ok(len) = u32::try_from(data.len()) else {
            return Err(AccessError::Overflow);
        };
        let _w = process.memlock.write(self);
        let space = self.space_of(process);
        space.check_user_range(va, len, Access::Write)?;
        if len > 0 {
            let last = (va + (len - 1)).page::<Size4K>().number();
            for page in va.page::<Size4K>().number()..=last {
                let at = VirtualAddress::new(page << 12);
                if space.leaf(at).is_some_and(PageEntry::is_zfod_placeholder) {
                    self.promote_zfod(process, at);
                }
            }
        }
        self.masked(|| space.copy_to_user(va, data))
    }

    /// Checks that `len` bytes at `va` may be accessed, without copying.
    /// Lets a call validate an output buffer before it commits to anything.
    ///
    /// # Errors
    /// As [`copy_in`](Self::copy_in) or [`copy_out`](Self::copy_out).
    pub fn check_user(&self, process: &Process, va: VirtualAddress, len: u32, access: Access) -> Result<(), AccessError> {
        let _r = process.memlock.read(self);
        let space = self.space_of(process);
        self.masked(|| space.check_user_range(va, len, access))
    }

    /// Writes a word to user memory.
    ///
    /// # Errors
    /// As [`copy_out`](Self::copy_out).
    pub fn write_user_u32(&self, process: &Process, va: VirtualAddress, value: u32) -> Result<(), AccessError> {
        self.copy_out(process, va, &value.to_le_bytes())
    }

    /// Frees every user frame and page table of `directory` and the
    /// directory itself. Zero-fill placeholders give their reservation back.
    /// The directory must not be active.
    pub(crate) fn destroy_address_space(&self, directory: PhysicalPage) {
        debug_assert_ne!(directory, self.arch.active(), "destroying the active directory");
        let space = AddressSpace::from_root(self.arch.mapper(), directory);
        self.with_frames(|pools| {
            release_user_frames(space, pools);
            space.destroy(&mut pools.kernel);
        });
    }

    /// Reloads the translation for `va` if `process` is the active space.
    pub(crate) fn invalidate_if_active(&self, process: &Process, va: VirtualAddress) {
        if process.directory() == self.arch.active() {
            self.arch.invalidate(va);
        }
    }

    fn flush_if_active(&self, process: &Process) {
        if process.directory() == self.arch.active() {
            self.arch.flush_all();
        }
    }
}

/// Returns every leaf frame of the user half to the user pool, clearing the
/// leaves. Page tables stay.
pub(crate) fn release_user_frames<M: PhysMapper + ?Sized>(space: AddressSpace<'_, M>, pools: &mut FramePools) {
    let (freed, zfod) = space.traverse(USER_PDE_RANGE, (0usize, 0usize), |va, entry, (freed, zfod)| {
        let e = *entry;
        *entry = PageEntry::zero();
        if e.is_zfod_placeholder() {
            pools.user.unreserve(1);
            (freed, zfod + 1)
        } else {
            debug_assert!(is_user_address(va));
            pools.user.free_4k(e.frame());
            (freed + 1, zfod)
        }
    });
    trace!("released {freed} user frames, {zfod} reservations");
}
