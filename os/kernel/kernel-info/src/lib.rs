//! # Kernel Configuration and Boot Interface
//!
//! Memory layout constants, runtime tunables and the boot handoff structure
//! shared by every kernel crate.
//!
//! ## Virtual Memory Architecture
//!
//! Every address space shares the same low, supervisor-only kernel region.
//! Only the user half differs between processes.
//!
//! ```text
//! Virtual Address Space Layout (32-bit):
//!
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  Kernel direct map (identity)   │  supervisor only, shared tables
//!             │  text, data, heap, page tables, │
//!             │  kernel stacks                  │
//! 0x00FF_E000 ├─────────────────────────────────┤
//!             │  Frame windows (2 pages)        │  temporary mappings of user frames
//! USER_MEM    ├─────────────────────────────────┤ 0x0100_0000 (16 MiB)
//!             │  User space / guest window      │  per-process tables
//!             │                                 │
//! USER_STACK  ├─────────────────────────────────┤ 0xFFFF_E000
//!             │  Initial stack page             │
//! USER_ARGS   ├─────────────────────────────────┤ 0xFFFF_F000
//!             │  Argument page                  │
//! 0xFFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! A guest kernel sees its physical memory at `0..GUEST_MEM_SIZE`; the host
//! places it at `GUEST_BASE + gpa` inside the guest process.
//!
//! ## Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`memory`] | Compile-time layout, checked by `const` assertions |
//! | [`config`] | [`KernelConfig`](config::KernelConfig) runtime tunables |
//! | [`boot`]   | [`BootInfo`](boot::BootInfo) handed over by the boot stub |

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod config;
pub mod memory;
