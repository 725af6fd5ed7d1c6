use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalPage;

/// One 32-bit paging-structure entry (PDE or PTE).
///
/// ```text
///  31                  12 11  9 8 7 6 5 4 3 2 1 0
/// +----------------------+-----+-+-+-+-+-+-+-+-+-+
/// |     frame number     | SW  |G|L|D|A|C|T|U|W|P|
/// +----------------------+-----+-+-+-+-+-+-+-+-+-+
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Bit 0: the entry is valid.
    pub present: bool,

    /// Bit 1: writes permitted (subject to CR0.WP in supervisor mode).
    pub writable: bool,

    /// Bit 2: accessible from CPL 3.
    pub user: bool,

    /// Bit 3: write-through caching.
    pub write_through: bool,

    /// Bit 4: caching disabled.
    pub cache_disable: bool,

    /// Bit 5: set by the CPU on access.
    pub accessed: bool,

    /// Bit 6: set by the CPU on write (leaf only).
    pub dirty: bool,

    /// Bit 7: 4 MiB page in a PDE; PAT in a PTE. Never set by this kernel.
    pub large: bool,

    /// Bit 8: survives CR3 reloads when CR4.PGE is on.
    pub global: bool,

    /// Bits 9–11: ignored by the MMU, see [`SoftwareBits`].
    #[bits(3)]
    available: u8,

    /// Bits 12–31: physical frame number.
    #[bits(20)]
    frame_number: u32,
}

bitflags::bitflags! {
    /// Hardware permission bits used when installing mappings.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u32 {
        /// Entry is valid.
        const PRESENT  = 1 << 0;
        /// Page is writable.
        const WRITABLE = 1 << 1;
        /// Page is accessible from user mode.
        const USER     = 1 << 2;
        /// Translation is global (kernel mappings only).
        const GLOBAL   = 1 << 8;
    }
}

bitflags::bitflags! {
    /// Kernel bookkeeping stored in the entry's available bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct SoftwareBits: u8 {
        /// Read-only placeholder of the shared zero frame; the first write
        /// replaces it with a private zeroed frame.
        const ZFOD      = 1 << 0;
        /// First page of a `new_pages` span.
        const SPAN_HEAD = 1 << 1;
        /// Subsequent page of a `new_pages` span.
        const SPAN_BODY = 1 << 2;
    }
}

impl PageEntry {
    /// Attribute bits a guest kernel may set in its own page tables: present,
    /// writable, user and the three software bits.
    pub const GUEST_ALLOWED: u32 = 0b111 | (0b111 << 9);

    /// Mask of the non-address part of an entry.
    pub const ATTRIBUTE_MASK: u32 = 0xFFF;

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }

    /// A leaf pointing at `frame` with the given permissions and bookkeeping.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage, flags: EntryFlags, sw: SoftwareBits) -> Self {
        Self::from_bits((frame.number() << 12) | flags.bits())
            .with_available(sw.bits())
            .with_present(true)
    }

    /// Directory entry linking a page table. Always present and writable;
    /// the leaf decides the effective permission.
    #[inline]
    #[must_use]
    pub const fn table_link(table: PhysicalPage, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame_number(table.number())
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage {
        PhysicalPage::from_number(self.frame_number())
    }

    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalPage) -> Self {
        self.with_frame_number(frame.number())
    }

    #[inline]
    #[must_use]
    pub const fn software(self) -> SoftwareBits {
        SoftwareBits::from_bits_truncate(self.available())
    }

    #[inline]
    #[must_use]
    pub const fn with_software(self, sw: SoftwareBits) -> Self {
        self.with_available(sw.bits())
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.into_bits())
    }

    /// Present, read-only and stamped [`SoftwareBits::ZFOD`].
    #[inline]
    #[must_use]
    pub const fn is_zfod_placeholder(self) -> bool {
        self.present() && !self.writable() && self.software().contains(SoftwareBits::ZFOD)
    }

    /// Low twelve bits: permissions, status and software bits.
    #[inline]
    #[must_use]
    pub const fn attribute_bits(self) -> u32 {
        self.into_bits() & Self::ATTRIBUTE_MASK
    }

    /// Whether a guest-supplied entry stays within [`GUEST_ALLOWED`](Self::GUEST_ALLOWED).
    #[inline]
    #[must_use]
    pub const fn is_guest_clean(self) -> bool {
        self.attribute_bits() & !Self::GUEST_ALLOWED == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_encoding() {
        let e = PageEntry::leaf(
            PhysicalPage::from_number(0x1234),
            EntryFlags::WRITABLE | EntryFlags::USER,
            SoftwareBits::SPAN_HEAD,
        );
        assert_eq!(e.into_bits(), 0x0123_4000 | 0b111 | (0b010 << 9));
        assert!(e.present() && e.writable() && e.user());
        assert_eq!(e.frame().number(), 0x1234);
        assert_eq!(e.software(), SoftwareBits::SPAN_HEAD);
    }

    #[test]
    fn zfod_placeholder_is_read_only() {
        let zero = PhysicalPage::from_number(7);
        let e = PageEntry::leaf(zero, EntryFlags::USER, SoftwareBits::ZFOD);
        assert!(e.is_zfod_placeholder());
        assert!(!e.with_writable(true).is_zfod_placeholder());
    }

    #[test]
    fn guest_allow_list() {
        let ok = PageEntry::from_bits(0x0040_0007 | (0b101 << 9));
        assert!(ok.is_guest_clean());
        let global = ok.with_global(true);
        assert!(!global.is_guest_clean());
        let pwt = PageEntry::from_bits(0x0040_0009);
        assert!(!pwt.is_guest_clean());
    }
}
