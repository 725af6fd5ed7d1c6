use core::ptr::{self, null_mut};

/// Header stored at the beginning of every **free** block.
///
/// ```text
/// +----------------------+-------------------------+
/// | Node (header)        |      payload (size)     |
/// +----------------------+-------------------------+
/// ^ block                ^ block + size_of::<Node>()
/// ```
#[repr(C)]
struct Node {
    /// Payload bytes following this header.
    size: usize,
    next: *mut Node,
}

const HEADER: usize = size_of::<Node>();

#[inline]
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

/// First-fit, split-and-coalesce free list over one contiguous region.
///
/// Free blocks are kept sorted by address so neighbours merge on insert.
///
/// # Invariants
/// - Free blocks do not overlap and lie inside the managed region.
/// - Every free block can hold a [`Node`].
pub(crate) struct FreeList {
    /// Sentinel; `head.next` is the first real block.
    head: Node,
    capacity: usize,
}

// SAFETY: only ever used behind a lock.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: Node {
                size: 0,
                next: null_mut(),
            },
            capacity: 0,
        }
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take over `[start, start + size)`.
    ///
    /// # Safety
    /// The range must be valid, writable, exclusively owned by this list,
    /// aligned for a header, and added at most once.
    pub(crate) unsafe fn add_region(&mut self, start: usize, size: usize) {
        if size < HEADER {
            return;
        }
        self.capacity += size;
        unsafe { self.insert(start, size) };
    }

    /// Insert `[addr, addr + size)` in address order and merge neighbours.
    unsafe fn insert(&mut self, addr: usize, size: usize) {
        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }

        let node = addr as *mut Node;
        unsafe {
            ptr::write(
                node,
                Node {
                    size: size - HEADER,
                    next: current,
                },
            );
            (*prev).next = node;
            self.coalesce(prev);
        }
    }

    /// Merge the block after `prev` with its successor, then `prev` with it.
    unsafe fn coalesce(&mut self, prev: *mut Node) {
        let curr = unsafe { (*prev).next };
        if curr.is_null() {
            return;
        }
        let next = unsafe { (*curr).next };
        if !next.is_null() && curr as usize + HEADER + unsafe { (*curr).size } == next as usize {
            unsafe {
                (*curr).size += HEADER + (*next).size;
                (*curr).next = (*next).next;
            }
        }
        if !ptr::eq(prev, &raw const self.head)
            && prev as usize + HEADER + unsafe { (*prev).size } == curr as usize
        {
            unsafe {
                (*prev).size += HEADER + (*curr).size;
                (*prev).next = (*curr).next;
            }
        }
    }

    /// Carve `size` bytes aligned to `align` out of the first block that
    /// fits. Null when nothing fits.
    ///
    /// # Safety
    /// The caller holds the list's lock.
    pub(crate) unsafe fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        let size = align_up(size.max(HEADER), align_of::<Node>());
        let align = align.max(align_of::<Node>());
        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() {
            let region_start = current as usize + HEADER;
            let region_end = region_start + unsafe { (*current).size };
            // The header for a later free of this block sits right before the payload.
            let mut alloc_start = align_up(region_start, align);
            while alloc_start != region_start && alloc_start - region_start < HEADER {
                alloc_start += align;
            }
            let alloc_end = alloc_start.saturating_add(size);
            if alloc_end <= region_end {
                unsafe { (*prev).next = (*current).next };
                let head_room = alloc_start - HEADER - current as usize;
                let tail_room = region_end - alloc_end;
                if tail_room >= HEADER {
                    unsafe { self.insert(alloc_end, tail_room) };
                }
                if head_room >= HEADER {
                    unsafe { self.insert(current as usize, head_room) };
                }
                return alloc_start as *mut u8;
            }
            prev = current;
            current = unsafe { (*current).next };
        }
        null_mut()
    }

    /// Return a block obtained from [`allocate`](Self::allocate) with the same `size`.
    ///
    /// # Safety
    /// `ptr`/`size` must describe a live allocation of this list.
    pub(crate) unsafe fn deallocate(&mut self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        let size = align_up(size.max(HEADER), align_of::<Node>());
        unsafe { self.insert(ptr as usize - HEADER, size + HEADER) };
    }

    /// Free bytes, headers included.
    pub(crate) fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut current = self.head.next;
        while !current.is_null() {
            unsafe {
                total += HEADER + (*current).size;
                current = (*current).next;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct Arena([u8; 4096]);

    fn with_list(f: impl FnOnce(&mut FreeList)) {
        let mut arena = Box::new(Arena([0; 4096]));
        let mut list = FreeList::new();
        unsafe { list.add_region(arena.0.as_mut_ptr() as usize, 4096) };
        f(&mut list);
    }

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        with_list(|list| unsafe {
            let a = list.allocate(24, 8);
            let b = list.allocate(100, 64);
            let c = list.allocate(1, 1);
            assert!(!a.is_null() && !b.is_null() && !c.is_null());
            assert_eq!(b as usize % 64, 0);
            let mut spans = [(a as usize, 24), (b as usize, 100), (c as usize, 1)];
            spans.sort_unstable();
            for w in spans.windows(2) {
                assert!(w[0].0 + w[0].1 <= w[1].0);
            }
        });
    }

    #[test]
    fn free_coalesces_back_to_one_block() {
        with_list(|list| unsafe {
            let before = list.free_bytes();
            let blocks: Vec<_> = (0..8).map(|i| (list.allocate(32 + i * 16, 16), 32 + i * 16)).collect();
            for &(p, s) in blocks.iter().rev().step_by(2) {
                list.deallocate(p, s);
            }
            for &(p, s) in blocks.iter().rev().skip(1).step_by(2) {
                list.deallocate(p, s);
            }
            assert_eq!(list.free_bytes(), before);
            assert!(!list.allocate(3000, 8).is_null());
        });
    }

    #[test]
    fn exhaustion_returns_null() {
        with_list(|list| unsafe {
            assert!(list.allocate(8192, 8).is_null());
            assert_eq!(list.capacity(), 4096);
        });
    }
}
