//! # Kernel Memory Allocation
//!
//! Physical frames, the ways the kernel reaches them, and the kernel heap.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Kernel heap                        │
//! │    • first-fit free list, address ordered           │
//! │    • backs Vec / BTreeMap / Box in the kernel       │
//! └─────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────┐
//! │              Physical mappers                       │
//! │    • identity for the low 16 MiB                    │
//! │    • two frame windows for everything above         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Frame stacks                           │
//! │    • kernel pool: page tables, kernel stacks        │
//! │    • user pool: user pages, guest memory            │
//! │    • O(1) pop / push, reservations                  │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Frame stacks
//!
//! [`FrameStack`] keeps free frames on a stack that is fully allocated at
//! boot, so pushing a frame back never allocates. Frames are neither merged
//! nor zeroed. Handing a frame back that was not obtained from the same
//! stack, or handing it back twice, corrupts the pool; nothing here detects
//! it.
//!
//! Reservations let a caller claim capacity up front (fork, `new_pages`) and
//! draw it later without a failure path: [`FrameStack::allocate`] never
//! dips into reserved frames, [`FrameStack::allocate_reserved`] only does.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod frame_stack;
mod free_list;
pub mod heap;
pub mod phys_mapper;

pub use crate::frame_stack::{FrameError, FrameStack};
pub use crate::phys_mapper::{IdentityMapper, WindowedPhysMapper};
