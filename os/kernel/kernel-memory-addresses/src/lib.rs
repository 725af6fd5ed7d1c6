//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in paging, frame allocation and user-memory validation code.
//!
//! ## Overview
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//!
//! These are wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory frames. |
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: 4 KiB pages, the leaf granularity of the two-level i386 scheme.
//! - [`Size4M`]: 4 MiB, the span covered by one page-directory entry.
//!
//! ## Address split
//!
//! ```text
//!  31            22 21            12 11             0
//! +----------------+----------------+----------------+
//! |   PD index     |   PT index     |  page offset   |
//! +----------------+----------------+----------------+
//! ```
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0040_1234);
//! assert_eq!(va.pd_index(), 1);
//! assert_eq!(va.pt_index(), 1);
//! assert_eq!(va.offset::<Size4K>(), 0x234);
//! assert_eq!(VirtualAddress::from_indices(1, 1).as_u32(), 0x0040_1000);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;
pub use virtual_page::VirtualPage;

use core::fmt;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Principal raw memory address ([virtual](VirtualAddress) or [physical](PhysicalAddress)).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryAddress(u32);

impl MemoryAddress {
    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> MemoryPage<S> {
        MemoryPage::from_addr(self)
    }

    /// Offset of this address within its page of size `S`.
    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u32 {
        self.0 & (S::SIZE - 1)
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.offset::<S>() == 0
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Rounds up to the next multiple of `S::SIZE`; `None` on overflow.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Option<Self> {
        match self.0.checked_add(S::SIZE - 1) {
            Some(v) => Some(Self(v & !(S::SIZE - 1))),
            None => None,
        }
    }
}

impl fmt::Debug for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Display for MemoryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl From<u32> for MemoryAddress {
    #[inline]
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_round_trip() {
        let va = VirtualAddress::new(0xBFFF_F123);
        assert_eq!(va.pd_index(), 0x2FF);
        assert_eq!(va.pt_index(), 0x3FF);
        let page = va.page::<Size4K>();
        assert_eq!(page.base().as_u32(), 0xBFFF_F000);
        assert_eq!(page.base().as_u32() + va.offset::<Size4K>(), va.as_u32());
    }

    #[test]
    fn directory_span_covers_4m() {
        let va = VirtualAddress::new(0x0123_4567);
        let span = va.page::<Size4M>();
        assert_eq!(span.base().as_u32(), 0x0100_0000);
        assert_eq!(span.base().pd_index(), va.pd_index());
    }

    #[test]
    fn align_up_overflows_at_top() {
        assert_eq!(
            MemoryAddress::new(0x1001).align_up::<Size4K>(),
            Some(MemoryAddress::new(0x2000))
        );
        assert_eq!(MemoryAddress::new(0xFFFF_F001).align_up::<Size4K>(), None);
    }

    #[test]
    fn physical_page_numbering() {
        let pp = PhysicalPage::<Size4K>::from_number(0x1234);
        assert_eq!(pp.base().as_u32(), 0x0123_4000);
        assert_eq!(pp.number(), 0x1234);
        assert_eq!(PhysicalAddress::new(0x0123_4FFF).page::<Size4K>(), pp);
    }
}
