//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K, Size4M, VirtualAddress};

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u32 = Size4K::SIZE;

/// First user-accessible virtual address. Everything below is the kernel's
/// identity-mapped region.
pub const USER_MEM_START: u32 = 0x0100_0000;

/// Number of page-directory entries covering kernel memory.
pub const KERNEL_PDE_COUNT: usize = (USER_MEM_START >> Size4M::SHIFT) as usize;

/// Number of page-directory entries in a directory.
pub const PDE_COUNT: usize = 1024;

/// Kernel virtual pages used to temporarily reach frames outside the
/// direct map. They are the last two pages of kernel memory.
pub const FRAME_WINDOW_BASE: u32 = USER_MEM_START - 2 * PAGE_SIZE;

/// Number of frame windows.
pub const FRAME_WINDOW_COUNT: u32 = 2;

/// Physical frames below this address are never handed out; the kernel
/// image, boot structures and legacy memory live there.
pub const KERNEL_RESERVED_END: u32 = 0x0040_0000;

/// One page of kernel stack per thread.
pub const KERNEL_STACK_SIZE: u32 = PAGE_SIZE;

/// Page holding the argument package of a freshly loaded program.
pub const USER_ARGS_PAGE: u32 = 0xFFFF_F000;

/// Initial user stack page, directly below the argument page.
pub const USER_STACK_PAGE: u32 = USER_ARGS_PAGE - PAGE_SIZE;

/// Host virtual address at which guest-physical address zero is placed.
pub const GUEST_BASE: u32 = USER_MEM_START;

/// Size of a guest's physical memory window.
pub const GUEST_MEM_SIZE: u32 = 24 * 1024 * 1024;

/// Number of 4 KiB frames backing a guest.
pub const GUEST_FRAMES: u32 = GUEST_MEM_SIZE / PAGE_SIZE;

/// Returns `true` when `va` lies in the user half.
#[inline]
#[must_use]
pub const fn is_user_address(va: VirtualAddress) -> bool {
    va.as_u32() >= USER_MEM_START
}

const _: () = {
    assert!(USER_MEM_START % Size4M::SIZE == 0);
    assert!(KERNEL_PDE_COUNT == 4);
    assert!(KERNEL_STACK_SIZE % PAGE_SIZE == 0);
    assert!(FRAME_WINDOW_BASE >= KERNEL_RESERVED_END);
    assert!(GUEST_MEM_SIZE % Size4M::SIZE == 0);
    assert!((GUEST_BASE as u64) + (GUEST_MEM_SIZE as u64) <= USER_STACK_PAGE as u64);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_half_boundary() {
        assert!(!is_user_address(VirtualAddress::new(USER_MEM_START - 1)));
        assert!(is_user_address(VirtualAddress::new(USER_MEM_START)));
        assert_eq!(VirtualAddress::new(USER_MEM_START).pd_index(), KERNEL_PDE_COUNT);
    }

    #[test]
    fn guest_window_fits_below_stack() {
        assert!(GUEST_BASE + GUEST_MEM_SIZE <= USER_STACK_PAGE);
        assert_eq!(GUEST_FRAMES, 6144);
    }
}
