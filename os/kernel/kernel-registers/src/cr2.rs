use kernel_memory_addresses::VirtualAddress;

/// CR2: the linear address of the most recent page fault.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Cr2(pub VirtualAddress);

impl Cr2 {
    #[inline]
    #[must_use]
    pub const fn address(self) -> VirtualAddress {
        self.0
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let bits: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) bits, options(nomem, nostack, preserves_flags));
        }
        Self(VirtualAddress::new(bits))
    }
}
