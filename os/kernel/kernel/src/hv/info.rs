//! Per-guest hypervisor state.

use super::virq::VECTOR_COUNT;
use alloc::collections::VecDeque;
use kernel_memory_addresses::PhysicalPage;

/// Whether the guest has returned to its own code at least once.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuestStatus {
    /// Loaded, not yet registered for delayed interrupts.
    New,
    Inited,
}

/// Virtual privilege level of the guest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuestMode {
    Kernel,
    User,
}

/// One slot of the virtual interrupt table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VirtualIdtEntry {
    /// Guest-virtual handler address.
    pub eip: u32,
    /// Handler runs in virtual kernel mode.
    pub privileged: bool,
}

/// Everything the hypervisor tracks for one guest process.
#[derive(Debug)]
pub struct HyperInfo {
    pub status: GuestStatus,
    pub mode: GuestMode,
    pub idt: [Option<VirtualIdtEntry>; VECTOR_COUNT],
    /// Pending `(vector, argument)` pairs, oldest first.
    pub delayed: VecDeque<(u32, u32)>,
    delayed_capacity: usize,
    /// Directory built by the loader: guest-physical memory at `GUEST_BASE`.
    pub original: PhysicalPage,
    /// Directory compiled from the guest's own tables, while paging is on.
    pub shadow: Option<PhysicalPage>,
    /// Guest-physical address of the guest page directory.
    pub guest_cr3: Option<u32>,
    /// Virtual CR0.WP: supervisor writes honor read-only entries.
    pub wp: bool,
    /// Guest-virtual kernel stack for privilege changes.
    pub esp0: u32,
    /// Virtual IF.
    pub interrupts_enabled: bool,
    /// Guest-virtual address of the last page fault.
    pub cr2: u32,
}

impl HyperInfo {
    /// A freshly loaded guest running on `original` in virtual kernel mode
    /// with interrupts off.
    #[must_use]
    pub fn new(original: PhysicalPage, delayed_capacity: usize) -> Self {
        Self {
            status: GuestStatus::New,
            mode: GuestMode::Kernel,
            idt: [None; VECTOR_COUNT],
            delayed: VecDeque::with_capacity(delayed_capacity),
            delayed_capacity,
            original,
            shadow: None,
            guest_cr3: None,
            wp: false,
            esp0: 0,
            interrupts_enabled: false,
            cr2: 0,
        }
    }

    /// Queues a delayed interrupt. Returns `false` and drops it when the
    /// queue is full; never allocates.
    pub fn queue_delayed(&mut self, vector: u32, arg: u32) -> bool {
        if self.delayed.len() >= self.delayed_capacity {
            return false;
        }
        self.delayed.push_back((vector, arg));
        true
    }

    /// Directory the guest currently runs on.
    #[must_use]
    pub fn directory(&self) -> PhysicalPage {
        self.shadow.unwrap_or(self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_queue_drops_when_full() {
        let mut info = HyperInfo::new(PhysicalPage::from_number(9), 2);
        assert!(info.queue_delayed(20, 1));
        assert!(info.queue_delayed(21, 0x1e));
        assert!(!info.queue_delayed(20, 2));
        assert_eq!(info.delayed.pop_front(), Some((20, 1)));
        assert_eq!(info.delayed.len(), 1);
    }

    #[test]
    fn starts_in_kernel_mode_without_paging() {
        let info = HyperInfo::new(PhysicalPage::from_number(9), 4);
        assert_eq!(info.mode, GuestMode::Kernel);
        assert!(!info.interrupts_enabled);
        assert_eq!(info.directory(), PhysicalPage::from_number(9));
    }
}
