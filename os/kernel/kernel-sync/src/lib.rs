//! # Kernel synchronization primitives
//!
//! Two lock classes carry every critical section in the kernel:
//!
//! | Lock | Excludes | Reentrant | Masks interrupts |
//! |------|----------|-----------|------------------|
//! | [`LocalLock`] | preemption on the current core | yes, per core | yes |
//! | [`GlobalLock`] | every other core, and preemption | yes, per owning core | yes |
//!
//! [`SpinLock<T>`] is a data-carrying, non-reentrant test-and-test-and-set lock
//! for short leaf sections (the frame stack, registries, wait lists). It is
//! always taken inside one of the two classes above.
//!
//! None of these may be held across a voluntary context switch except by the
//! explicit local-lock handoff of the scheduler, see
//! [`LocalLock::release_handoff`].
//!
//! Interrupt masking is abstracted by [`Irq`] so the same code runs on the
//! hardware (`cli`/`sti`) and under `cargo test` with [`FlagIrq`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod global_lock;
pub mod irq;
mod local_lock;
mod spin_lock;
mod sync_once_cell;

pub use global_lock::{GlobalGuard, GlobalLock};
pub use irq::{FlagIrq, Irq, IrqGuard};
#[cfg(target_arch = "x86")]
pub use irq::HardwareIrq;
pub use local_lock::{LocalGuard, LocalLock};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
