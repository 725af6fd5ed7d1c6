use bitfield_struct::bitfield;

/// Error code pushed by the CPU on a page fault (#PF, vector 14).
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// The fault was a protection violation on a present page.
    pub present: bool,

    /// The access was a write.
    pub write: bool,

    /// The access originated in user mode (CPL 3).
    pub user: bool,

    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,

    /// The access was an instruction fetch.
    pub instruction_fetch: bool,

    #[bits(27)]
    __: u32,
}
