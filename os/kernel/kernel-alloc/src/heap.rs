//! # Kernel Heap
//!
//! A [`GlobalAlloc`] over a [`FreeList`] guarded by a [`SpinLock`].
//!
//! The heap region is handed over once at boot with [`KernelHeap::init`];
//! allocations before that fail (return null). The lock does not mask
//! interrupts: interrupt handlers must not allocate.

use crate::free_list::FreeList;
use core::alloc::{GlobalAlloc, Layout};
use kernel_sync::SpinLock;
use log::info;

pub struct KernelHeap {
    list: SpinLock<FreeList>,
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            list: SpinLock::new(FreeList::new()),
        }
    }

    /// Give `[start, start + size)` to the heap.
    ///
    /// # Safety
    /// The region must be mapped, writable, unused by anything else and
    /// aligned to at least a pointer.
    pub unsafe fn init(&self, start: usize, size: usize) {
        self.list.with_lock(|list| unsafe { list.add_region(start, size) });
        info!("kernel heap: {size} bytes at {start:#010x}");
    }

    /// Bytes managed in total.
    pub fn capacity(&self) -> usize {
        self.list.with_lock(|list| list.capacity())
    }

    /// Bytes currently free, headers included.
    pub fn free_bytes(&self) -> usize {
        self.list.with_lock(|list| list.free_bytes())
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.list
            .with_lock(|list| unsafe { list.allocate(layout.size(), layout.align()) })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.list.with_lock(|list| unsafe { list.deallocate(ptr, layout.size()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct Region([u8; 16 * 1024]);

    #[test]
    fn global_alloc_contract() {
        let mut region = Box::new(Region([0; 16 * 1024]));
        let heap = KernelHeap::new();
        unsafe { heap.init(region.0.as_mut_ptr() as usize, region.0.len()) };
        let before = heap.free_bytes();

        let layout = Layout::from_size_align(256, 32).unwrap();
        let p = unsafe { heap.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 32, 0);
        unsafe {
            p.write_bytes(0xAB, 256);
            heap.dealloc(p, layout);
        }
        assert_eq!(heap.free_bytes(), before);

        let too_big = Layout::from_size_align(64 * 1024, 8).unwrap();
        assert!(unsafe { heap.alloc(too_big) }.is_null());
    }

    #[test]
    fn uninitialized_heap_refuses() {
        let heap = KernelHeap::new();
        assert!(unsafe { heap.alloc(Layout::new::<u64>()) }.is_null());
        assert_eq!(heap.capacity(), 0);
    }
}
