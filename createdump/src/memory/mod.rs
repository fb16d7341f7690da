// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory of the target process: regions, region sets and the reader that
//! records what it reads.

mod process;
mod region;
mod region_set;

pub use process::ProcessMemory;
pub use region::page_ceil;
pub use region::page_floor;
pub use region::MemoryRegion;
pub use region::RegionFlags;
pub use region_set::MemoryRegionSet;
pub use region_set::PageOracle;
