// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address ranges of the target process tagged with permissions and origin.

use crate::elf::PF_R;
use crate::elf::PF_W;
use crate::elf::PF_X;
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Permission and bookkeeping bits of a memory region.
    ///
    /// The permission bits share their values with the ELF `p_flags`
    /// so that they can be written into program headers as is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegionFlags: u32 {
        const EXECUTE = PF_X;
        const WRITE = PF_W;
        const READ = PF_R;
        const SHARED = 0x100;
        const PRIVATE = 0x200;
        const MEMORY_BACKED = 0x400;
    }
}

impl RegionFlags {
    /// Core permission bits only
    pub const PERMISSIONS: RegionFlags = RegionFlags::READ
        .union(RegionFlags::WRITE)
        .union(RegionFlags::EXECUTE);

    pub fn permissions(self) -> RegionFlags {
        self.intersection(Self::PERMISSIONS)
    }
}

/// Rounds `address` down to the page boundary.
pub fn page_floor(address: u64, page_size: u64) -> u64 {
    debug_assert!(page_size.is_power_of_two());
    address & !(page_size - 1)
}

/// Rounds `address` up to the page boundary, saturating at the top of the
/// address space.
pub fn page_ceil(address: u64, page_size: u64) -> u64 {
    debug_assert!(page_size.is_power_of_two());
    match address.checked_add(page_size - 1) {
        Some(value) => value & !(page_size - 1),
        None => page_floor(u64::MAX, page_size),
    }
}

/// A span of the target address space `[start, end)`.
///
/// Regions that carry a file name describe the mapping of a native or
/// managed image.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    pub flags: RegionFlags,
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub file_name: Option<String>,
}

impl MemoryRegion {
    pub fn new(flags: RegionFlags, start: u64, end: u64) -> Self {
        Self {
            flags,
            start,
            end,
            offset: 0,
            file_name: None,
        }
    }

    /// Region of a mapped image
    pub fn module(flags: RegionFlags, start: u64, end: u64, offset: u64, file_name: &str) -> Self {
        Self {
            flags,
            start,
            end,
            offset,
            file_name: Some(file_name.to_owned()),
        }
    }

    /// Same range and flags, different file name.
    pub fn renamed(&self, file_name: &str) -> Self {
        Self {
            file_name: Some(file_name.to_owned()),
            ..self.clone()
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    pub fn permissions(&self) -> RegionFlags {
        self.flags.permissions()
    }

    pub fn is_backed_by_memory(&self) -> bool {
        self.flags.contains(RegionFlags::MEMORY_BACKED)
    }

    pub fn contains_address(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    /// Whether `other` lies completely within this region.
    pub fn contains(&self, other: &MemoryRegion) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{:016x} - {:016x} ({:06x}) {:08x} {}{}{}{}{}{}",
            self.start,
            self.end,
            self.size() / 0x1000,
            self.offset,
            flag(self.flags.contains(RegionFlags::READ), 'r'),
            flag(self.flags.contains(RegionFlags::WRITE), 'w'),
            flag(self.flags.contains(RegionFlags::EXECUTE), 'x'),
            flag(self.flags.contains(RegionFlags::SHARED), 's'),
            flag(self.flags.contains(RegionFlags::PRIVATE), 'p'),
            flag(self.flags.contains(RegionFlags::MEMORY_BACKED), 'm'),
        )?;
        if let Some(name) = &self.file_name {
            write!(f, " {name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_floor(0x1fff, 0x1000), 0x1000);
        assert_eq!(page_ceil(0x1001, 0x1000), 0x2000);
        assert_eq!(page_ceil(0x2000, 0x1000), 0x2000);
        assert_eq!(page_ceil(u64::MAX - 3, 0x1000), 0xffff_ffff_ffff_f000);
    }

    #[test]
    fn permissions_ignore_bookkeeping_bits() {
        let region = MemoryRegion::new(
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::PRIVATE | RegionFlags::MEMORY_BACKED,
            0x1000,
            0x3000,
        );
        assert_eq!(region.permissions(), RegionFlags::READ | RegionFlags::WRITE);
        assert_eq!(region.permissions().bits(), PF_R | PF_W);
        assert!(region.is_backed_by_memory());
        assert!(region.contains(&MemoryRegion::new(RegionFlags::empty(), 0x1000, 0x2000)));
        assert!(!region.contains(&MemoryRegion::new(RegionFlags::empty(), 0x2000, 0x4000)));
        assert!(region.overlaps(0x2fff, 0x5000));
        assert!(!region.overlaps(0x3000, 0x5000));
    }
}
