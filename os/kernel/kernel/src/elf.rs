//! # ELF32 Images
//!
//! Allocation-free view over a little-endian `EM_386` executable: header
//! checks plus an iterator over the `PT_LOAD` program headers. Section
//! headers are never consulted.

use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// Malformed or unsupported image.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("image shorter than an ELF header")]
    TooShort,
    #[error("bad ELF magic")]
    BadMagic,
    #[error("not a 32-bit image")]
    BadClass,
    #[error("not an i386 image")]
    BadMachine,
    #[error("malformed ELF header")]
    BadHeader,
    #[error("program header or segment out of bounds")]
    OutOfBounds,
    #[error("segment file size exceeds its memory size")]
    BadSegment,
    #[error("no loadable segment")]
    NothingToLoad,
}

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
pub struct Eh32 {
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: VirtualAddress,
    pub e_phoff: u32,
    pub e_phentsize: u16,
    pub e_phnum: u16,
}

#[derive(Copy, Clone, Debug)]
#[allow(clippy::struct_field_names)]
pub struct Ph32 {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: VirtualAddress,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: PFlags,
}

/// `Elf32_Phdr.p_flags`: bit0=X, bit1=W, bit2=R.
#[bitfield(u32)]
pub struct PFlags {
    pub execute: bool,
    pub write: bool,
    pub read: bool,
    #[bits(29)]
    __: u32,
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

#[inline]
fn le16(x: &[u8]) -> u16 {
    u16::from_le_bytes([x[0], x[1]])
}

#[inline]
fn le32(x: &[u8]) -> u32 {
    u32::from_le_bytes([x[0], x[1], x[2], x[3]])
}

pub struct ElfView<'a> {
    bytes: &'a [u8],
    pub eh: Eh32,
}

/// Validates the header of `bytes`.
///
/// # Errors
/// See [`ElfError`].
pub fn elf32_view(bytes: &[u8]) -> Result<ElfView<'_>, ElfError> {
    if bytes.len() < EHDR_SIZE {
        return Err(ElfError::TooShort);
    }
    if &bytes[0..4] != b"\x7FELF" {
        return Err(ElfError::BadMagic);
    }
    // ELFCLASS32
    if bytes[4] != 1 {
        return Err(ElfError::BadClass);
    }
    // little-endian
    if bytes[5] != 1 {
        return Err(ElfError::BadHeader);
    }

    let eh = Eh32 {
        e_type: le16(&bytes[16..18]),
        e_machine: le16(&bytes[18..20]),
        e_version: le32(&bytes[20..24]),
        e_entry: VirtualAddress::new(le32(&bytes[24..28])),
        e_phoff: le32(&bytes[28..32]),
        e_phentsize: le16(&bytes[42..44]),
        e_phnum: le16(&bytes[44..46]),
    };

    if eh.e_type != ET_EXEC || eh.e_version != 1 || eh.e_phentsize as usize != PHDR_SIZE {
        return Err(ElfError::BadHeader);
    }
    if eh.e_machine != EM_386 {
        return Err(ElfError::BadMachine);
    }

    let need = (eh.e_phoff as usize)
        .checked_add(eh.e_phnum as usize * PHDR_SIZE)
        .ok_or(ElfError::OutOfBounds)?;
    if need > bytes.len() {
        return Err(ElfError::OutOfBounds);
    }

    Ok(ElfView { bytes, eh })
}

impl<'a> ElfView<'a> {
    pub const fn entry(&self) -> VirtualAddress {
        self.eh.e_entry
    }

    fn ph(&self, i: usize) -> Option<Ph32> {
        if i >= self.eh.e_phnum as usize {
            return None;
        }
        let p = self.eh.e_phoff as usize + i * PHDR_SIZE;
        let s = self.bytes.get(p..p + PHDR_SIZE)?;
        Some(Ph32 {
            p_type: le32(&s[0..4]),
            p_offset: le32(&s[4..8]),
            p_vaddr: VirtualAddress::new(le32(&s[8..12])),
            p_filesz: le32(&s[16..20]),
            p_memsz: le32(&s[20..24]),
            p_flags: PFlags::from_bits(le32(&s[24..28])),
        })
    }

    /// `PT_LOAD` headers in file order.
    pub fn segments(&self) -> impl Iterator<Item = Ph32> + '_ {
        (0..self.eh.e_phnum as usize)
            .filter_map(|i| self.ph(i))
            .filter(|ph| ph.p_type == PT_LOAD)
    }

    /// File bytes backing `ph`; `.bss` is the remainder up to `p_memsz`.
    ///
    /// # Errors
    /// [`ElfError::OutOfBounds`] or [`ElfError::BadSegment`].
    pub fn segment_bytes(&self, ph: &Ph32) -> Result<&'a [u8], ElfError> {
        if ph.p_filesz > ph.p_memsz {
            return Err(ElfError::BadSegment);
        }
        let start = ph.p_offset as usize;
        let end = start.checked_add(ph.p_filesz as usize).ok_or(ElfError::OutOfBounds)?;
        self.bytes.get(start..end).ok_or(ElfError::OutOfBounds)
    }

    /// `[lowest, highest)` virtual range covered by loadable segments.
    ///
    /// # Errors
    /// [`ElfError::NothingToLoad`] or [`ElfError::OutOfBounds`] if a segment
    /// wraps the address space.
    pub fn extent(&self) -> Result<(u32, u32), ElfError> {
        let mut range: Option<(u32, u32)> = None;
        for ph in self.segments() {
            let start = ph.p_vaddr.as_u32();
            let end = start.checked_add(ph.p_memsz).ok_or(ElfError::OutOfBounds)?;
            range = Some(range.map_or((start, end), |(lo, hi)| (lo.min(start), hi.max(end))));
        }
        range.ok_or(ElfError::NothingToLoad)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loadable_segments() {
        let image = test_image::build(
            0x0100_0010,
            &[(0x0100_0000, false, b"text", 4), (0x0100_1000, true, b"data", 0x20)],
        );
        let view = elf32_view(&image).unwrap();
        assert_eq!(view.entry().as_u32(), 0x0100_0010);

        let segs: Vec<_> = view.segments().collect();
        assert_eq!(segs.len(), 2);
        assert!(!segs[0].p_flags.write() && segs[0].p_flags.execute());
        assert!(segs[1].p_flags.write());
        assert_eq!(view.segment_bytes(&segs[1]).unwrap(), b"data");
        assert_eq!(view.extent().unwrap(), (0x0100_0000, 0x0100_1020));
    }

    #[test]
    fn rejects_foreign_images() {
        assert_eq!(elf32_view(b"\x7FELF").err(), Some(ElfError::TooShort));

        let mut image = test_image::build(0, &[(0x0100_0000, false, b"x", 1)]);
        image[4] = 2;
        assert_eq!(elf32_view(&image).err(), Some(ElfError::BadClass));

        let mut image = test_image::build(0, &[(0x0100_0000, false, b"x", 1)]);
        image[18] = 62;
        assert_eq!(elf32_view(&image).err(), Some(ElfError::BadMachine));

        let mut image = test_image::build(0, &[(0x0100_0000, false, b"x", 1)]);
        image.truncate(60);
        assert_eq!(elf32_view(&image).err(), Some(ElfError::OutOfBounds));
    }

    #[test]
    fn bss_larger_than_file_is_fine_but_not_the_reverse() {
        let image = test_image::build(0, &[(0x0100_0000, true, b"abcd", 2)]);
        let view = elf32_view(&image).unwrap();
        let seg = view.segments().next().unwrap();
        assert_eq!(view.segment_bytes(&seg).err(), Some(ElfError::BadSegment));
    }
}
