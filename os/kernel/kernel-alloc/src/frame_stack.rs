use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalPage;
use kernel_vmem::FrameAlloc;
use log::info;

/// Frame pool failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// No unreserved frame is left.
    #[error("physical frames exhausted")]
    Exhausted,
    /// Fewer unreserved frames are left than the reservation asks for.
    #[error("cannot reserve {wanted} frames, {available} available")]
    InsufficientReserve { wanted: usize, available: usize },
}

/// A stack of free physical frames.
pub struct FrameStack {
    name: &'static str,
    free: Vec<PhysicalPage>,
    reserved: usize,
    total: usize,
}

impl FrameStack {
    /// A pool holding frames `[first, end)` (frame numbers). The lowest
    /// frame is handed out first.
    #[must_use]
    pub fn from_range(name: &'static str, first: u32, end: u32) -> Self {
        let free: Vec<PhysicalPage> = (first..end).rev().map(PhysicalPage::from_number).collect();
        let total = free.len();
        info!("{name} frame pool: {total} frames [{first:#x}, {end:#x})");
        Self {
            name,
            free,
            reserved: 0,
            total,
        }
    }

    #[inline]
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Frames ever managed by this pool.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    /// Free frames not promised to a reservation.
    #[inline]
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len() - self.reserved
    }

    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// Pop one unreserved frame.
    pub fn allocate(&mut self) -> Option<PhysicalPage> {
        if self.available() == 0 {
            return None;
        }
        self.free.pop()
    }

    /// Push `frame` back.
    pub fn free(&mut self, frame: PhysicalPage) {
        debug_assert!(self.free.len() < self.total, "{}: more frames freed than owned", self.name);
        self.free.push(frame);
    }

    /// Set aside `count` frames for later [`allocate_reserved`](Self::allocate_reserved).
    ///
    /// # Errors
    /// [`FrameError::InsufficientReserve`]; nothing is reserved then.
    pub fn try_reserve(&mut self, count: usize) -> Result<(), FrameError> {
        let available = self.available();
        if count > available {
            return Err(FrameError::InsufficientReserve {
                wanted: count,
                available,
            });
        }
        self.reserved += count;
        Ok(())
    }

    /// Pop a frame promised by an earlier reservation.
    ///
    /// # Panics
    /// If nothing is reserved; a caller drawing more than it reserved is a
    /// kernel defect.
    pub fn allocate_reserved(&mut self) -> PhysicalPage {
        assert!(self.reserved > 0, "{}: reserved allocation without a reservation", self.name);
        self.reserved -= 1;
        match self.free.pop() {
            Some(frame) => frame,
            None => unreachable!("reserved frames are always on the stack"),
        }
    }

    /// Return `count` unused reserved frames to general use.
    pub fn unreserve(&mut self, count: usize) {
        debug_assert!(count <= self.reserved);
        self.reserved -= count.min(self.reserved);
    }
}

impl FrameAlloc for FrameStack {
    #[inline]
    fn alloc_4k(&mut self) -> Option<PhysicalPage> {
        self.allocate()
    }

    #[inline]
    fn free_4k(&mut self, frame: PhysicalPage) {
        self.free(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn lowest_frame_first_and_exhaustion() {
        let mut pool = FrameStack::from_range("test", 10, 13);
        assert_eq!(pool.allocate().map(PhysicalPage::number), Some(10));
        assert_eq!(pool.allocate().map(PhysicalPage::number), Some(11));
        assert_eq!(pool.allocate().map(PhysicalPage::number), Some(12));
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn no_double_issue_and_restores_state() {
        let mut pool = FrameStack::from_range("test", 0x100, 0x140);
        let mut seen = HashSet::new();
        let mut held = Vec::new();
        for round in 0..4 {
            while let Some(f) = pool.allocate() {
                assert!(seen.insert(f), "frame {f:?} issued twice");
                held.push(f);
            }
            // give back a varying share
            for _ in 0..(held.len() / (round + 2)) {
                let f = held.pop().unwrap();
                seen.remove(&f);
                pool.free(f);
            }
        }
        for f in held.drain(..) {
            pool.free(f);
        }
        assert_eq!(pool.available(), pool.total());
    }

    #[test]
    fn reservations_are_protected() {
        let mut pool = FrameStack::from_range("test", 0, 4);
        pool.try_reserve(3).unwrap();
        assert_eq!(pool.available(), 1);
        assert!(pool.allocate().is_some());
        assert_eq!(pool.allocate(), None);
        assert_eq!(
            pool.try_reserve(1),
            Err(FrameError::InsufficientReserve { wanted: 1, available: 0 })
        );

        let _ = pool.allocate_reserved();
        pool.unreserve(2);
        assert_eq!(pool.reserved(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    #[should_panic(expected = "without a reservation")]
    fn reserved_draw_requires_reservation() {
        let mut pool = FrameStack::from_range("test", 0, 4);
        let _ = pool.allocate_reserved();
    }
}
