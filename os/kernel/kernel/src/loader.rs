//! # Program Loader
//!
//! Populates an empty user half from a named ELF32 image.
//!
//! ```text
//! ordinary process                      guest kernel
//!
//! 0xFFFF_F000 ┌──────────────┐          GUEST_BASE + GUEST_MEM_SIZE ┌──────────────┐
//!             │ argv + strs  │                                      │              │
//! 0xFFFF_E000 ├──────────────┤                                      │ guest RAM,   │
//!             │ stack        │                                      │ zero-filled, │
//!             ├──────────────┤                                      │ segments at  │
//!             │ ...          │                                      │ their gpa    │
//!             ├──────────────┤                                      │              │
//!             │ .data / .bss │                                      │              │
//!             │ .text        │                                      │              │
//! 0x0100_0000 └──────────────┘          GUEST_BASE                  └──────────────┘
//! ```
//!
//! An image whose lowest segment lies below `USER_MEM_START` is a guest
//! kernel: its addresses are guest-physical and it receives the whole guest
//! memory window up front.

use crate::arch::Arch;
use crate::elf::{ElfError, ElfView, elf32_view};
use crate::kernel::{FramePools, Kernel};
use crate::process::MemoryLayout;
use crate::trap::TrapFrame;
use alloc::string::String;
use alloc::vec::Vec;
use kernel_info::memory::{
    GUEST_BASE, GUEST_FRAMES, GUEST_MEM_SIZE, PAGE_SIZE, USER_ARGS_PAGE, USER_MEM_START, USER_STACK_PAGE,
};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_registers::Eflags;
use kernel_vmem::{AddressSpace, EntryFlags, MapError, PhysMapper, SoftwareBits};
use log::debug;

/// A program that can be started by name.
#[derive(Copy, Clone, Debug)]
pub struct Image {
    pub name: &'static str,
    pub bytes: &'static [u8],
}

/// The built-in program table.
#[derive(Clone, Debug, Default)]
pub struct ImageTable {
    images: Vec<Image>,
}

impl ImageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self { images: Vec::new() }
    }

    /// Adds (or replaces) `name`.
    #[must_use]
    pub fn with(mut self, name: &'static str, bytes: &'static [u8]) -> Self {
        self.images.retain(|i| i.name != name);
        self.images.push(Image { name, bytes });
        self
    }

    #[must_use]
    pub fn find(&self, name: &[u8]) -> Option<&'static [u8]> {
        self.images.iter().find(|i| i.name.as_bytes() == name).map(|i| i.bytes)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.images.iter().map(|i| i.name)
    }
}

/// Why an image could not be loaded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("no image with that name")]
    NoSuchImage,
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("segment outside the loadable range")]
    SegmentOutOfRange,
    #[error("argument package exceeds a page")]
    ArgsTooLarge,
    #[error("out of memory")]
    OutOfMemory,
}

impl From<MapError> for LoadError {
    fn from(_: MapError) -> Self {
        Self::OutOfMemory
    }
}

/// Result of a successful load.
#[derive(Copy, Clone, Debug)]
pub struct LoadedImage {
    /// Register state to enter the program with.
    pub frame: TrapFrame,
    pub layout: MemoryLayout,
    pub guest: bool,
}

impl<A: Arch> Kernel<A> {
    /// Loads image `name` into the empty user half of `space`. On error the
    /// caller discards `space`; whatever was mapped is freed with it.
    ///
    /// # Errors
    /// See [`LoadError`].
    pub(crate) fn load_image(
        &self,
        space: AddressSpace<'_, A::Mapper>,
        name: &[u8],
        args: &[Vec<u8>],
    ) -> Result<LoadedImage, LoadError> {
        let bytes = self.images.find(name).ok_or(LoadError::NoSuchImage)?;
        let elf = elf32_view(bytes)?;
        let (lo, hi) = elf.extent()?;

        let loaded = if lo < USER_MEM_START {
            if hi > GUEST_MEM_SIZE {
                return Err(LoadError::SegmentOutOfRange);
            }
            self.with_frames(|pools| load_guest(space, pools, &elf))?;
            LoadedImage {
                frame: TrapFrame::guest(elf.entry().as_u32(), GUEST_MEM_SIZE, Eflags::user_default().into_bits()),
                layout: MemoryLayout {
                    stack_low: 0,
                    stack_high: GUEST_MEM_SIZE,
                    image_end: hi,
                },
                guest: true,
            }
        } else {
            if hi > USER_STACK_PAGE {
                return Err(LoadError::SegmentOutOfRange);
            }
            let esp = self.with_frames(|pools| {
                load_segments(space, pools, &elf)?;
                build_stack(space, pools, args)
            })?;
            LoadedImage {
                frame: TrapFrame::user(elf.entry().as_u32(), esp, Eflags::user_default().into_bits()),
                layout: MemoryLayout {
                    stack_low: USER_STACK_PAGE,
                    stack_high: USER_ARGS_PAGE,
                    image_end: hi.next_multiple_of(PAGE_SIZE),
                },
                guest: false,
            }
        };
        debug!(
            "loader: {} entry {:#x} esp {:#x}{}",
            String::from_utf8_lossy(name),
            loaded.frame.eip,
            loaded.frame.esp,
            if loaded.guest { " (guest)" } else { "" }
        );
        Ok(loaded)
    }
}

/// Maps every page of every segment and copies the file bytes. Pages
/// shared by a read-only and a writable segment end up writable.
fn load_segments<M: PhysMapper + ?Sized>(
    space: AddressSpace<'_, M>,
    pools: &mut FramePools,
    elf: &ElfView<'_>,
) -> Result<(), LoadError> {
    for ph in elf.segments() {
        let data = elf.segment_bytes(&ph)?;
        let start = ph.p_vaddr.as_u32();
        if ph.p_memsz == 0 {
            continue;
        }
        let first = start >> 12;
        let last = (start + (ph.p_memsz - 1)) >> 12;
        let writable = ph.p_flags.write();
        for page in first..=last {
            let va = VirtualAddress::new(page << 12);
            match space.search(va).filter(|e| e.present()) {
                Some(entry) => {
                    if writable {
                        entry.set_writable(true);
                    }
                }
                None => {
                    let frame = pools.user.allocate().ok_or(LoadError::OutOfMemory)?;
                    space.mapper().zero_frame(frame);
                    let mut flags = EntryFlags::USER;
                    if writable {
                        flags |= EntryFlags::WRITABLE;
                    }
                    if let Err(e) = space.map(&mut pools.kernel, va, frame, flags, SoftwareBits::empty()) {
                        pools.user.free(frame);
                        return Err(e.into());
                    }
                }
            }
        }
        write_bytes(space, VirtualAddress::new(start), data);
    }
    Ok(())
}

/// Writes `data` through the page tables of `space`, ignoring permissions.
/// Every page must be mapped.
pub(crate) fn write_bytes<M: PhysMapper + ?Sized>(space: AddressSpace<'_, M>, at: VirtualAddress, data: &[u8]) {
    let mut va = at;
    let mut rest = data;
    while !rest.is_empty() {
        let offset = va.offset::<Size4K>() as usize;
        let n = rest.len().min(PAGE_SIZE as usize - offset);
        let Some(pa) = space.translate(va) else {
            panic!("loader: writing unmapped {va}");
        };
        let frame = PhysicalPage::containing(pa);
        space.mapper().frame_bytes(frame)[offset..offset + n].copy_from_slice(&rest[..n]);
        rest = &rest[n..];
        va += n as u32;
    }
}

/// Maps the stack and argument pages and lays out
/// `_main(argc, argv, stack_high, stack_low)`. Returns the initial `esp`.
fn build_stack<M: PhysMapper + ?Sized>(
    space: AddressSpace<'_, M>,
    pools: &mut FramePools,
    args: &[Vec<u8>],
) -> Result<u32, LoadError> {
    let pointers = (args.len() + 1) * 4;
    let strings: usize = args.iter().map(|a| a.len() + 1).sum();
    if pointers + strings > PAGE_SIZE as usize {
        return Err(LoadError::ArgsTooLarge);
    }

    for va in [USER_STACK_PAGE, USER_ARGS_PAGE] {
        let frame = pools.user.allocate().ok_or(LoadError::OutOfMemory)?;
        space.mapper().zero_frame(frame);
        if let Err(e) = space.map(
            &mut pools.kernel,
            VirtualAddress::new(va),
            frame,
            EntryFlags::USER | EntryFlags::WRITABLE,
            SoftwareBits::empty(),
        ) {
            pools.user.free(frame);
            return Err(e.into());
        }
    }

    let mut package = Vec::with_capacity(pointers + strings);
    let mut string_at = USER_ARGS_PAGE + pointers as u32;
    for arg in args {
        package.extend_from_slice(&string_at.to_le_bytes());
        string_at += arg.len() as u32 + 1;
    }
    package.extend_from_slice(&0u32.to_le_bytes());
    for arg in args {
        package.extend_from_slice(arg);
        package.push(0);
    }
    write_bytes(space, VirtualAddress::new(USER_ARGS_PAGE), &package);

    let esp = USER_ARGS_PAGE - 20;
    let mut frame = Vec::with_capacity(20);
    for word in [0, args.len() as u32, USER_ARGS_PAGE, USER_ARGS_PAGE, USER_STACK_PAGE] {
        frame.extend_from_slice(&word.to_le_bytes());
    }
    write_bytes(space, VirtualAddress::new(esp), &frame);
    Ok(esp)
}

/// Backs the whole guest window with zeroed frames and copies the segments
/// to `GUEST_BASE + gpa`.
fn load_guest<M: PhysMapper + ?Sized>(
    space: AddressSpace<'_, M>,
    pools: &mut FramePools,
    elf: &ElfView<'_>,
) -> Result<(), LoadError> {
    if pools.user.available() < GUEST_FRAMES as usize {
        return Err(LoadError::OutOfMemory);
    }
    for i in 0..GUEST_FRAMES {
        let Some(frame) = pools.user.allocate() else {
            return Err(LoadError::OutOfMemory);
        };
        space.mapper().zero_frame(frame);
        if let Err(e) = space.map(
            &mut pools.kernel,
            VirtualAddress::new(GUEST_BASE + i * PAGE_SIZE),
            frame,
            EntryFlags::USER | EntryFlags::WRITABLE,
            SoftwareBits::empty(),
        ) {
            pools.user.free(frame);
            return Err(e.into());
        }
    }
    for ph in elf.segments() {
        let data = elf.segment_bytes(&ph)?;
        write_bytes(space, VirtualAddress::new(GUEST_BASE + ph.p_vaddr.as_u32()), data);
    }
    Ok(())
}
