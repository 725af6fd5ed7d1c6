use crate::PageEntry;
use kernel_memory_addresses::ENTRIES_PER_TABLE;

/// A page directory or page table: 1024 entries in one 4 KiB frame.
///
/// Only ever reached through a [`PhysMapper`](crate::PhysMapper); never
/// constructed on a (one page) kernel stack.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    /// Clear all entries to zero (all non-present).
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &[PageEntry; ENTRIES_PER_TABLE] {
        &self.entries
    }

    /// Overwrite every entry with the matching entry of `other`.
    #[inline]
    pub fn copy_from(&mut self, other: &Self) {
        self.entries.copy_from_slice(&other.entries);
    }

    /// Whether any entry is present.
    #[must_use]
    pub fn any_present(&self) -> bool {
        self.entries.iter().any(|e| e.present())
    }
}
