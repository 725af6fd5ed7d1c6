use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// CR3: Page-Directory Base Register (32-bit paging, no PAE).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–2: Reserved.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3: PWT: Page-level Write-Through for the directory.
    pub pwt: bool,

    /// Bit 4: PCD: Page-level Cache Disable for the directory.
    pub pcd: bool,

    /// Bits 5–11: Reserved.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–31: Page directory physical base >> 12.
    #[bits(20)]
    pd_base_4k: u32,
}

impl Cr3 {
    /// CR3 value selecting the directory at `pd`, default caching.
    #[must_use]
    pub const fn from_directory(pd: PhysicalPage) -> Self {
        Self::new().with_pd_base_4k(pd.number())
    }

    /// Physical address of the page directory.
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(self.pd_base_4k() << 12))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let bits: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) bits, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(bits)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let bits = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) bits, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_round_trip() {
        let pd = PhysicalPage::from_number(0x345);
        let cr3 = Cr3::from_directory(pd);
        assert_eq!(cr3.into_bits(), 0x0034_5000);
        assert_eq!(cr3.directory(), pd);
    }
}
