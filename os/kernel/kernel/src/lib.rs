//! # Pebbles Kernel
//!
//! A uniprocessor i386 kernel that runs ordinary user programs and, next to
//! them, unmodified guest kernels under a paravirtual hypervisor.
//!
//! ## Layout
//!
//! | Area | Modules |
//! |------|---------|
//! | machine seam | [`arch`], [`trap`], [`dispatch`] |
//! | memory | [`memory`], [`loader`], [`elf`], [`fork`] |
//! | threads | [`thread`], [`process`], [`registry`], [`ownership`], [`cpu`], [`sched`], [`reaper`], [`lifecycle`] |
//! | blocking | [`kmutex`] |
//! | faults | [`fault`], [`swexn`] |
//! | services | [`syscall`], [`console`] |
//! | hypervisor | [`hv`] |
//!
//! Everything hangs off [`Kernel`], which is generic over [`Arch`] so the
//! same code runs on the machine and under host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod arch;
pub mod console;
pub mod cpu;
pub mod dispatch;
pub mod elf;
pub mod fault;
pub mod fork;
pub mod hv;
pub mod kernel;
pub mod kmutex;
pub mod lifecycle;
pub mod loader;
pub mod memory;
pub mod ownership;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod sched;
pub mod swexn;
pub mod syscall;
pub mod thread;
pub mod trap;

#[cfg(test)]
mod testkit;

pub use arch::Arch;
pub use kernel::{FramePools, Kernel};
pub use loader::{Image, ImageTable};
pub use trap::TrapFrame;
