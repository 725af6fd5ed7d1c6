//! Validate-then-copy access to user memory.
//!
//! The kernel never dereferences a user pointer directly. Each page of the
//! range is looked up in the address space and reached through the
//! [`PhysMapper`], so a bad pointer surfaces as an [`AccessError`] instead of
//! a kernel page fault.

use crate::info::{PAGE_SIZE, is_user_address};
use crate::{AddressSpace, PageEntry, PhysMapper};
use alloc::vec::Vec;
use kernel_memory_addresses::{Size4K, VirtualAddress};

/// Kind of access being validated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// A user range that cannot be accessed as requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("user address {0} is not mapped")]
    Unmapped(VirtualAddress),
    #[error("user address {0} does not permit the access")]
    Protection(VirtualAddress),
    #[error("user range wraps the address space")]
    Overflow,
    #[error("address {0} lies in kernel memory")]
    Kernel(VirtualAddress),
    #[error("string exceeds {0} bytes")]
    TooLong(usize),
}

impl<M: PhysMapper + ?Sized> AddressSpace<'_, M> {
    /// Check that every page of `[va, va + len)` is a present user page
    /// permitting `access`.
    ///
    /// A zero-fill placeholder passes a [`Access::Write`] check; it has to be
    /// materialized before [`copy_to_user`](Self::copy_to_user) will write it.
    ///
    /// # Errors
    /// The first offending address.
    pub fn check_user_range(&self, va: VirtualAddress, len: u32, access: Access) -> Result<(), AccessError> {
        if len == 0 {
            return Ok(());
        }
        let last = va.checked_add(len - 1).ok_or(AccessError::Overflow)?;
        if !is_user_address(va) {
            return Err(AccessError::Kernel(va));
        }

        let mut page = va.page::<Size4K>().base();
        loop {
            let entry = self.user_leaf(page)?;
            if access == Access::Write && !entry.writable() && !entry.is_zfod_placeholder() {
                return Err(AccessError::Protection(page));
            }
            if page.pd_index() == last.pd_index() && page.pt_index() == last.pt_index() {
                return Ok(());
            }
            page += PAGE_SIZE;
        }
    }

    fn user_leaf(&self, page: VirtualAddress) -> Result<PageEntry, AccessError> {
        let entry = self.leaf(page).ok_or(AccessError::Unmapped(page))?;
        if entry.user() {
            Ok(entry)
        } else {
            Err(AccessError::Protection(page))
        }
    }

    /// Walk `[va, va + len)` page by page, handing each chunk's frame bytes
    /// to `f` together with the offset into the caller's buffer.
    fn for_each_chunk(
        &self,
        va: VirtualAddress,
        len: usize,
        access: Access,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), AccessError> {
        let mut done = 0usize;
        while done < len {
            #[allow(clippy::cast_possible_truncation)]
            let addr = va.checked_add(done as u32).ok_or(AccessError::Overflow)?;
            if !is_user_address(addr) {
                return Err(AccessError::Kernel(addr));
            }
            let page = addr.page::<Size4K>().base();
            let entry = self.user_leaf(page)?;
            if access == Access::Write && !entry.writable() {
                return Err(AccessError::Protection(page));
            }

            let offset = addr.offset::<Size4K>() as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(len - done);
            let bytes = self.mapper().frame_bytes(entry.frame());
            f(&mut bytes[offset..offset + chunk], done);
            done += chunk;
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes from user `va` into `buf`.
    ///
    /// # Errors
    /// Any page of the source is absent, supervisor-only or kernel memory.
    pub fn copy_from_user(&self, va: VirtualAddress, buf: &mut [u8]) -> Result<(), AccessError> {
        let len = buf.len();
        self.for_each_chunk(va, len, Access::Read, |chunk, at| {
            buf[at..at + chunk.len()].copy_from_slice(chunk);
        })
    }

    /// Copy `data` to user `va`.
    ///
    /// # Errors
    /// Any page of the destination is absent, read-only (including
    /// unresolved zero-fill placeholders) or kernel memory.
    pub fn copy_to_user(&self, va: VirtualAddress, data: &[u8]) -> Result<(), AccessError> {
        self.for_each_chunk(va, data.len(), Access::Write, |chunk, at| {
            chunk.copy_from_slice(&data[at..at + chunk.len()]);
        })
    }

    /// # Errors
    /// See [`copy_from_user`](Self::copy_from_user).
    pub fn read_u32(&self, va: VirtualAddress) -> Result<u32, AccessError> {
        let mut word = [0u8; 4];
        self.copy_from_user(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// # Errors
    /// See [`copy_to_user`](Self::copy_to_user).
    pub fn write_u32(&self, va: VirtualAddress, value: u32) -> Result<(), AccessError> {
        self.copy_to_user(va, &value.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `max` bytes (terminator
    /// excluded) starting at `va`.
    ///
    /// # Errors
    /// [`AccessError::TooLong`] when no terminator appears within `max + 1`
    /// bytes, or any page along the way is inaccessible.
    pub fn read_cstr(&self, va: VirtualAddress, max: usize) -> Result<Vec<u8>, AccessError> {
        let mut out = Vec::new();
        let mut addr = va;
        loop {
            if !is_user_address(addr) {
                return Err(AccessError::Kernel(addr));
            }
            let entry = self.user_leaf(addr.page::<Size4K>().base())?;
            let bytes = self.mapper().frame_bytes(entry.frame());
            for &b in &bytes[addr.offset::<Size4K>() as usize..] {
                if b == 0 {
                    return Ok(out);
                }
                if out.len() == max {
                    return Err(AccessError::TooLong(max));
                }
                out.push(b);
            }
            addr = addr
                .page::<Size4K>()
                .checked_add_pages(1)
                .ok_or(AccessError::Overflow)?
                .base();
        }
    }

    /// Read `count` consecutive user words starting at `va`.
    ///
    /// # Errors
    /// See [`copy_from_user`](Self::copy_from_user).
    pub fn read_u32_array(&self, va: VirtualAddress, count: usize) -> Result<Vec<u32>, AccessError> {
        let mut out = Vec::with_capacity(count);
        let mut addr = va;
        for _ in 0..count {
            out.push(self.read_u32(addr)?);
            addr = addr.checked_add(4).ok_or(AccessError::Overflow)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StackAlloc, TestPhys};
    use crate::{EntryFlags, KernelMappings, SoftwareBits};
    use kernel_memory_addresses::PhysicalPage;

    const BASE: u32 = 0x0100_0000;

    fn with_space(f: impl FnOnce(AddressSpace<'_, TestPhys>, &mut StackAlloc)) {
        let phys = TestPhys::with_frames(32);
        let mut alloc = StackAlloc::new(1, 20);
        let kernel = KernelMappings::empty();
        let space = AddressSpace::create(&phys, &mut alloc, kernel.entries()).unwrap();
        // two consecutive writable user pages backed by frames 30 and 31
        for (i, frame) in [30u32, 31].into_iter().enumerate() {
            space
                .map(
                    &mut alloc,
                    VirtualAddress::new(BASE + i as u32 * PAGE_SIZE),
                    PhysicalPage::from_number(frame),
                    EntryFlags::USER | EntryFlags::WRITABLE,
                    SoftwareBits::empty(),
                )
                .unwrap();
        }
        f(space, &mut alloc);
    }

    #[test]
    fn copy_across_page_boundary() {
        with_space(|space, _| {
            let at = VirtualAddress::new(BASE + PAGE_SIZE - 3);
            space.copy_to_user(at, b"hello").unwrap();
            let mut back = [0u8; 5];
            space.copy_from_user(at, &mut back).unwrap();
            assert_eq!(&back, b"hello");
            assert_eq!(space.mapper().frame_bytes(PhysicalPage::from_number(31))[..2], *b"lo");
        });
    }

    #[test]
    fn words_and_strings() {
        with_space(|space, _| {
            let at = VirtualAddress::new(BASE + 16);
            space.write_u32(at, 0xDEAD_BEEF).unwrap();
            assert_eq!(space.read_u32(at).unwrap(), 0xDEAD_BEEF);

            let s = VirtualAddress::new(BASE + 0x100);
            space.copy_to_user(s, b"init\0").unwrap();
            assert_eq!(space.read_cstr(s, 16).unwrap(), b"init");
            assert_eq!(space.read_cstr(s, 3), Err(AccessError::TooLong(3)));
        });
    }

    #[test]
    fn rejects_bad_ranges() {
        with_space(|space, alloc| {
            let end = VirtualAddress::new(BASE + 2 * PAGE_SIZE);
            assert_eq!(
                space.check_user_range(VirtualAddress::new(BASE + 8), 2 * PAGE_SIZE, Access::Read),
                Err(AccessError::Unmapped(end))
            );
            assert_eq!(
                space.check_user_range(VirtualAddress::new(0x1000), 4, Access::Read),
                Err(AccessError::Kernel(VirtualAddress::new(0x1000)))
            );
            assert_eq!(
                space.check_user_range(VirtualAddress::new(0xFFFF_FFF0), 0x20, Access::Read),
                Err(AccessError::Overflow)
            );
            assert!(space.check_user_range(VirtualAddress::new(BASE), 0, Access::Write).is_ok());

            space
                .map(alloc, end, PhysicalPage::from_number(29), EntryFlags::USER, SoftwareBits::ZFOD)
                .unwrap();
            assert!(space.check_user_range(end, 4, Access::Write).is_ok());
            assert_eq!(space.write_u32(end, 1), Err(AccessError::Protection(end)));

            let ro = end + PAGE_SIZE;
            space
                .map(alloc, ro, PhysicalPage::from_number(28), EntryFlags::USER, SoftwareBits::empty())
                .unwrap();
            assert_eq!(space.check_user_range(ro, 4, Access::Write), Err(AccessError::Protection(ro)));
            assert!(space.check_user_range(ro, 4, Access::Read).is_ok());
        });
    }
}
