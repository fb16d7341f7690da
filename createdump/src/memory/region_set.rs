// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ordered collection of non-overlapping memory regions.
//!
//! The regions are kept in a vector sorted by start address. As the stored
//! intervals never overlap, the first region whose end lies past a query
//! address is the only candidate that can contain it, so every lookup is a
//! binary search followed by an explicit containment check.

use super::region::page_ceil;
use super::region::page_floor;
use super::region::MemoryRegion;
use super::region::RegionFlags;

/// Source of truth about the pages of the target consulted while inserting.
pub trait PageOracle {
    /// Page size of the target
    fn page_size(&self) -> u64;

    /// Flags the OS reports for the mapping containing `address`, if any
    fn page_flags(&self, address: u64) -> Option<RegionFlags>;

    /// Whether the page at `address` is backed by physical memory and can
    /// be read. Probing must not fault the page in.
    fn is_valid_page(&mut self, address: u64) -> bool;
}

/// Non-overlapping regions ordered by start address.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegionSet {
    regions: Vec<MemoryRegion>,
}

impl MemoryRegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MemoryRegion> {
        self.regions.iter()
    }

    /// Total number of bytes covered by the regions
    pub fn total_size(&self) -> u64 {
        self.regions.iter().map(MemoryRegion::size).sum()
    }

    // Index of the first region ending after `address`.
    fn lower_bound(&self, address: u64) -> usize {
        self.regions.partition_point(|region| region.end <= address)
    }

    /// Finds the stored region overlapping `[start, end)`, the lowest one if
    /// there are several.
    pub fn find_overlapping(&self, start: u64, end: u64) -> Option<&MemoryRegion> {
        self.regions
            .get(self.lower_bound(start))
            .filter(|region| region.overlaps(start, end))
    }

    /// Finds the stored region containing `address`.
    pub fn find_containing(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions
            .get(self.lower_bound(address))
            .filter(|region| region.contains_address(address))
    }

    /// Finds the stored region containing the start of `probe`.
    pub fn find(&self, probe: &MemoryRegion) -> Option<&MemoryRegion> {
        self.find_containing(probe.start)
    }

    /// Inserts `region` as is, without any page validation.
    ///
    /// Returns `false` and leaves the set untouched if the region is empty or
    /// overlaps a stored one.
    pub fn insert_unchecked(&mut self, region: MemoryRegion) -> bool {
        if region.start >= region.end || self.find_overlapping(region.start, region.end).is_some() {
            return false;
        }
        let index = self.lower_bound(region.start);
        self.regions.insert(index, region);
        true
    }

    /// Removes the region starting exactly at `start`.
    pub fn remove(&mut self, start: u64) -> Option<MemoryRegion> {
        let index = self.lower_bound(start);
        match self.regions.get(index) {
            Some(region) if region.start == start => Some(self.regions.remove(index)),
            _ => None,
        }
    }

    /// Adds the pages of `[address, address + size)` that are valid and not
    /// stored yet, returns the number of pages added.
    pub fn insert(&mut self, address: u64, size: u64, oracle: &mut dyn PageOracle) -> usize {
        if size == 0 {
            return 0;
        }
        let page_size = oracle.page_size();
        let start = page_floor(address, page_size);
        let end = page_ceil(address.saturating_add(size), page_size);
        if start >= end {
            return 0;
        }

        if let Some(found) = self.find_overlapping(start, end) {
            if found.start <= start && end <= found.end {
                return 0;
            }
        }

        let mut added = 0_usize;
        let mut run: Option<MemoryRegion> = None;
        let mut page = start;

        while page < end {
            let usable =
                self.find_overlapping(page, page + page_size).is_none() && oracle.is_valid_page(page);

            if usable {
                let flags = oracle
                    .page_flags(page)
                    .unwrap_or(RegionFlags::PERMISSIONS)
                    .union(RegionFlags::MEMORY_BACKED);
                match run.as_mut() {
                    Some(current) if current.flags == flags && current.end == page => {
                        current.end += page_size;
                    }
                    _ => {
                        if let Some(done) = run.take() {
                            self.insert_unchecked(done);
                        }
                        run = Some(MemoryRegion::new(flags, page, page + page_size));
                    }
                }
                added += 1;
            } else {
                tracing::trace!("Skipping page 0x{:x}, stored already or not valid", page);
                if let Some(done) = run.take() {
                    self.insert_unchecked(done);
                }
            }

            page += page_size;
        }

        if let Some(done) = run.take() {
            self.insert_unchecked(done);
        }

        added
    }

    /// Same as [`MemoryRegionSet::insert`] for the range of `candidate`.
    pub fn insert_region(&mut self, candidate: &MemoryRegion, oracle: &mut dyn PageOracle) -> usize {
        self.insert(candidate.start, candidate.end.saturating_sub(candidate.start), oracle)
    }

    /// Merges every run of touching regions with identical permissions into
    /// one region. Must run once, after the last insertion.
    pub fn combine(&mut self) {
        let before = self.regions.len();
        let mut combined: Vec<MemoryRegion> = Vec::with_capacity(before);

        for region in self.regions.drain(..) {
            if let Some(last) = combined.last_mut() {
                if last.end == region.start && last.permissions() == region.permissions() {
                    last.end = region.end;
                    last.flags = merged_flags(last.flags, region.flags);
                    continue;
                }
            }
            combined.push(region);
        }

        tracing::debug!(
            "Combined {} memory regions into {}",
            before,
            combined.len()
        );
        self.regions = combined;
    }
}

/// Flags of two combined regions. Sharing is only kept when both sides
/// agree on it.
fn merged_flags(left: RegionFlags, right: RegionFlags) -> RegionFlags {
    let sharing = RegionFlags::SHARED | RegionFlags::PRIVATE;
    let backed = (left | right) & RegionFlags::MEMORY_BACKED;
    left.permissions() | backed | (left & right & sharing)
}

impl<'a> IntoIterator for &'a MemoryRegionSet {
    type Item = &'a MemoryRegion;
    type IntoIter = std::slice::Iter<'a, MemoryRegion>;

    fn into_iter(self) -> Self::IntoIter {
        self.regions.iter()
    }
}
