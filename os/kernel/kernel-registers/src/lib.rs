//! # Typed i386 Registers
//!
//! Bitfield models of the control and flag registers the kernel inspects or
//! validates. Register access instructions are compiled only with the `asm`
//! feature on `target_arch = "x86"`; the types themselves are plain values and
//! usable anywhere, e.g. to validate a flags word supplied by user code.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cr0;
mod cr2;
mod cr3;
mod eflags;
mod page_fault_error;

pub use cr0::Cr0;
pub use cr2::Cr2;
pub use cr3::Cr3;
pub use eflags::{Eflags, EflagsViolation};
pub use page_fault_error::PageFaultError;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}
