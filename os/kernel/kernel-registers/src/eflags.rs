use bitfield_struct::bitfield;

/// Architectural EFLAGS model for i386.
///
/// Reserved bits are private and default to their architectural value.
#[bitfield(u32, order = Lsb)]
#[derive(PartialEq, Eq)]
pub struct Eflags {
    /// Carry Flag
    pub cf_carry: bool, // 0

    /// Always 1.
    #[bits(default = true)]
    _always1: bool, // 1

    /// Parity Flag
    pub pf_parity: bool, // 2

    #[bits(default = false)]
    _rsvd3: bool, // 3

    /// Adjust Flag
    pub af_adjust: bool, // 4

    #[bits(default = false)]
    _rsvd5: bool, // 5

    /// Zero Flag
    pub zf_zero: bool, // 6

    /// Sign Flag
    pub sf_sign: bool, // 7

    /// Trap Flag
    pub tf_trap: bool, // 8

    /// Interrupt Enable Flag
    pub if_interrupt_enable: bool, // 9

    /// Direction Flag
    pub df_direction: bool, // 10

    /// Overflow Flag
    pub of_overflow: bool, // 11

    /// I/O Privilege Level
    #[bits(2)]
    pub iopl: u8, // 12–13

    /// Nested Task
    pub nt_nested: bool, // 14

    #[bits(default = false)]
    _rsvd15: bool, // 15

    /// Resume Flag
    pub rf_resume: bool, // 16

    /// Virtual 8086 mode
    pub vm_virtual_8086: bool, // 17

    /// Alignment Check
    pub ac_alignment_check: bool, // 18

    /// Virtual Interrupt Flag
    pub vif_virtual_interrupt: bool, // 19

    /// Virtual Interrupt Pending
    pub vip_virtual_interrupt_pending: bool, // 20

    /// ID Flag
    pub id_cpuid: bool, // 21

    #[bits(10, default = 0)]
    _reserved_rest: u16,
}

/// Why a flags word supplied by unprivileged code was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EflagsViolation {
    /// A reserved bit does not hold its architectural value.
    ReservedBits,
    /// A bit outside the user-writable set differs from what the kernel requires.
    PrivilegedBits,
    /// Interrupts would be disabled on return to user mode.
    InterruptsDisabled,
}

impl Eflags {
    /// Bits an unprivileged caller may choose freely.
    pub const USER_WRITABLE: u32 = (1 << 0)
        | (1 << 2)
        | (1 << 4)
        | (1 << 6)
        | (1 << 7)
        | (1 << 8)
        | (1 << 10)
        | (1 << 11)
        | (1 << 16)
        | (1 << 18)
        | (1 << 21);

    /// Interrupt enable bit.
    pub const IF: u32 = 1 << 9;

    /// Reserved bits that must be zero.
    pub const RESERVED_ZERO: u32 = (1 << 3) | (1 << 5) | (1 << 15) | 0xFFC0_0000;

    /// Reserved bit that must be one.
    pub const RESERVED_ONE: u32 = 1 << 1;

    /// Flags a fresh user thread starts with: interrupts on, IOPL 0.
    #[must_use]
    pub const fn user_default() -> Self {
        Self::from_bits(Self::RESERVED_ONE | Self::IF)
    }

    /// Validates a flags word for a return to unprivileged code.
    ///
    /// Only [`USER_WRITABLE`](Self::USER_WRITABLE) bits may vary. When
    /// `require_if` is set the interrupt flag must be on; otherwise it is
    /// treated as a caller-chosen value (the virtual interrupt flag of a guest).
    ///
    /// # Errors
    /// The first violated rule.
    pub const fn validate_user(bits: u32, require_if: bool) -> Result<Self, EflagsViolation> {
        if bits & Self::RESERVED_ZERO != 0 || bits & Self::RESERVED_ONE == 0 {
            return Err(EflagsViolation::ReservedBits);
        }
        let free = Self::USER_WRITABLE | Self::RESERVED_ONE | Self::IF;
        if bits & !free != 0 {
            return Err(EflagsViolation::PrivilegedBits);
        }
        if require_if && bits & Self::IF == 0 {
            return Err(EflagsViolation::InterruptsDisabled);
        }
        Ok(Self::from_bits(bits))
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::LoadRegisterUnsafe for Eflags {
    unsafe fn load_unsafe() -> Self {
        let bits: u32;
        unsafe {
            core::arch::asm!("pushfd", "pop {}", out(reg) bits, options(preserves_flags));
        }
        Self::from_bits(bits)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl crate::StoreRegisterUnsafe for Eflags {
    unsafe fn store_unsafe(self) {
        let bits = self.into_bits();
        unsafe {
            core::arch::asm!("push {}", "popfd", in(reg) bits);
        }
    }
}
