// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading target memory while building the set of regions to dump.

use super::region::MemoryRegion;
use super::region::RegionFlags;
use super::region_set::MemoryRegionSet;
use super::region_set::PageOracle;
use crate::error::DumpError;
use crate::platform::PlatformProcessInspector;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Target memory as seen by the dump pipeline.
///
/// Every successful read through [`ProcessMemory::read`] adds the pages it
/// touched to the dump, so whatever was needed to interpret the process
/// (link maps, runtime data structures, stacks walked) is also available
/// to whoever opens the dump later.
pub struct ProcessMemory {
    inspector: Box<dyn PlatformProcessInspector>,
    page_size: u64,
    all_mappings: MemoryRegionSet,
    regions: MemoryRegionSet,
}

/// Borrows what the region set needs to validate pages, apart from the
/// region set itself.
struct TargetPages<'a> {
    inspector: &'a mut dyn PlatformProcessInspector,
    all_mappings: &'a MemoryRegionSet,
    page_size: u64,
}

impl PageOracle for TargetPages<'_> {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn page_flags(&self, address: u64) -> Option<RegionFlags> {
        self.all_mappings.find_containing(address).map(|mapping| {
            mapping.flags & (RegionFlags::PERMISSIONS | RegionFlags::SHARED | RegionFlags::PRIVATE)
        })
    }

    fn is_valid_page(&mut self, address: u64) -> bool {
        if !self.inspector.is_page_resident(address) {
            return false;
        }
        let mut byte = [0_u8; 1];
        matches!(self.inspector.read_memory(address, &mut byte), Ok(1))
    }
}

impl ProcessMemory {
    pub fn new(inspector: Box<dyn PlatformProcessInspector>) -> Self {
        let page_size = inspector.page_size();
        Self {
            inspector,
            page_size,
            all_mappings: MemoryRegionSet::new(),
            regions: MemoryRegionSet::new(),
        }
    }

    pub fn inspector(&self) -> &dyn PlatformProcessInspector {
        self.inspector.as_ref()
    }

    pub fn inspector_mut(&mut self) -> &mut dyn PlatformProcessInspector {
        self.inspector.as_mut()
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Records every mapping of the target, used to look up the
    /// permissions of inserted pages.
    pub fn set_all_mappings(&mut self, mappings: MemoryRegionSet) {
        self.all_mappings = mappings;
    }

    pub fn all_mappings(&self) -> &MemoryRegionSet {
        &self.all_mappings
    }

    /// Regions to be written to the dump
    pub fn regions(&self) -> &MemoryRegionSet {
        &self.regions
    }

    /// Flags of the mapping containing `address`.
    pub fn mapping_flags(&self, address: u64) -> Option<RegionFlags> {
        self.all_mappings.find_containing(address).map(|mapping| mapping.flags)
    }

    /// Adds the valid pages of `[address, address + size)` to the dump.
    pub fn insert_region(&mut self, address: u64, size: u64) -> usize {
        let mut pages = TargetPages {
            inspector: self.inspector.as_mut(),
            all_mappings: &self.all_mappings,
            page_size: self.page_size,
        };
        self.regions.insert(address, size, &mut pages)
    }

    /// Adds the valid pages of `region` to the dump.
    pub fn insert_mapping(&mut self, region: &MemoryRegion) -> usize {
        self.insert_region(region.start, region.size())
    }

    /// Adds `region` to the dump as is.
    pub fn insert_unchecked(&mut self, region: MemoryRegion) -> bool {
        self.regions.insert_unchecked(region)
    }

    pub fn combine_regions(&mut self) {
        self.regions.combine();
    }

    /// Reads target memory and adds the pages read to the dump. A read
    /// crossing into unreadable memory returns the bytes read up to there.
    pub fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError> {
        let read = self.read_raw(address, buf)?;
        if read > 0 {
            self.insert_region(address, read as u64);
        }
        Ok(read)
    }

    /// Reads target memory without touching the dump regions.
    pub fn read_raw(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.inspector.read_memory(address, buf)
    }

    /// Fills `buf` completely or fails with [`DumpError::ShortRead`].
    pub fn read_exact(&mut self, address: u64, buf: &mut [u8]) -> Result<(), DumpError> {
        let read = self.read(address, buf)?;
        if read != buf.len() {
            return Err(DumpError::ShortRead {
                address,
                requested: buf.len(),
                read,
            });
        }
        Ok(())
    }

    /// Reads a plain data structure from the target.
    pub fn read_struct<T: FromBytes + IntoBytes>(&mut self, address: u64) -> Result<T, DumpError> {
        let mut value = T::new_zeroed();
        self.read_exact(address, value.as_mut_bytes())?;
        Ok(value)
    }

    pub fn read_u64(&mut self, address: u64) -> Result<u64, DumpError> {
        self.read_struct::<u64>(address)
    }

    /// Reads a NUL terminated string of at most `max_len` bytes.
    pub fn read_c_string(&mut self, address: u64, max_len: usize) -> Result<String, DumpError> {
        let mut bytes = Vec::new();
        let mut chunk = [0_u8; 64];
        let mut at = address;

        while bytes.len() < max_len {
            // Stay within the page so a string ending right before unreadable
            // memory can still be read.
            let to_page_end = (self.page_size - (at % self.page_size)) as usize;
            let want = chunk.len().min(to_page_end).min(max_len - bytes.len());
            let read = self.read(at, &mut chunk[..want])?;
            if read == 0 {
                break;
            }
            if let Some(nul) = chunk[..read].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&chunk[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&chunk[..read]);
            at += read as u64;
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
