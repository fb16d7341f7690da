// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Native and managed modules of the target.

use crate::memory::page_ceil;
use crate::memory::page_floor;
use crate::memory::MemoryRegion;
use crate::memory::MemoryRegionSet;
use crate::memory::ProcessMemory;
use crate::memory::RegionFlags;
use crate::pe;
use std::collections::BTreeMap;
use std::path::Path;
use uguid::Guid;

/// What the data access service knows about a managed module.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagedModuleDetails {
    pub is_main_module: bool,
    pub version_id: Option<Guid>,
}

/// A loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base_address: u64,
    pub is_managed: bool,
    pub time_stamp: u32,
    pub image_size: u32,
    pub version_id: Guid,
    /// Path of the image as the loader reports it
    pub name: String,
    /// Difference between run-time and link-time addresses (native only)
    pub load_bias: u64,
    /// Run-time address of the dynamic section (native only)
    pub dynamic_address: Option<u64>,
}

impl ModuleInfo {
    /// Name of the image without the directory
    pub fn file_name(&self) -> &str {
        file_name_of(&self.name)
    }
}

fn file_name_of(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

fn same_file_name(a: &str, b: &str) -> bool {
    if cfg!(target_os = "macos") {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Extra information recorded for a native module.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeImage {
    pub load_bias: u64,
    pub dynamic_address: Option<u64>,
}

/// Registry of the modules of the target and of the mappings backing them.
#[derive(Debug, Default)]
pub struct ModuleCatalog {
    modules: BTreeMap<u64, ModuleInfo>,
    mappings: MemoryRegionSet,
    // start -> (end, module base)
    address_ranges: BTreeMap<u64, (u64, u64)>,
    main_module: Option<u64>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a file-backed mapping found while sweeping the memory maps.
    pub fn add_mapping(&mut self, region: MemoryRegion) -> bool {
        self.mappings.insert_unchecked(region)
    }

    /// Mappings backed by module images
    pub fn mappings(&self) -> &MemoryRegionSet {
        &self.mappings
    }

    /// Makes sure a mapping named `name` covers the image at `base_address`
    /// and that its header page is part of the dump.
    ///
    /// An existing mapping at the header page with a different name is
    /// replaced by one with the same bounds carrying `name`.
    pub fn add_or_replace_mapping(
        &mut self,
        base_address: u64,
        size: u64,
        name: &str,
        memory: &mut ProcessMemory,
    ) {
        let page_size = memory.page_size();
        let start = page_floor(base_address, page_size);
        let end = page_ceil(base_address.saturating_add(size.max(1)), page_size);

        match self.mappings.find_overlapping(start, start + page_size).cloned() {
            None => {
                let flags = memory
                    .mapping_flags(start)
                    .unwrap_or(RegionFlags::READ | RegionFlags::PRIVATE)
                    .difference(RegionFlags::MEMORY_BACKED);
                let region = MemoryRegion::module(flags, start, end, 0, name);
                tracing::debug!("Adding module mapping {:?}", region);
                if !self.mappings.insert_unchecked(region) {
                    // The image overlaps another mapping further up, keep
                    // at least its header page.
                    let header = MemoryRegion::module(flags, start, start + page_size, 0, name);
                    self.mappings.insert_unchecked(header);
                }
            }
            Some(found) if found.file_name.as_deref() != Some(name) => {
                tracing::debug!("Replacing module mapping {:?} with name {}", found, name);
                self.mappings.remove(found.start);
                self.mappings.insert_unchecked(found.renamed(name));
            }
            Some(_) => {}
        }

        memory.insert_region(start, page_size);
    }

    /// Registers a module unless one is already known at `base_address`.
    /// Returns whether it was added.
    ///
    /// Managed images get their size and time stamp from the PE headers,
    /// main module flag and version from `details`.
    pub fn add_module_info(
        &mut self,
        is_managed: bool,
        base_address: u64,
        details: Option<ManagedModuleDetails>,
        name: &str,
        memory: &mut ProcessMemory,
    ) -> bool {
        self.add_module(is_managed, base_address, details, name, NativeImage::default(), memory)
    }

    /// Registers a native module along with what is needed to symbolize
    /// addresses inside of it.
    pub fn add_native_module(
        &mut self,
        base_address: u64,
        name: &str,
        image: NativeImage,
        memory: &mut ProcessMemory,
    ) -> bool {
        self.add_module(false, base_address, None, name, image, memory)
    }

    fn add_module(
        &mut self,
        is_managed: bool,
        base_address: u64,
        details: Option<ManagedModuleDetails>,
        name: &str,
        image: NativeImage,
        memory: &mut ProcessMemory,
    ) -> bool {
        if self.modules.contains_key(&base_address) {
            return false;
        }

        let mut time_stamp = 0;
        let mut image_size = 0;
        let mut version_id = Guid::ZERO;

        if is_managed {
            match pe::read_image_info(memory, base_address) {
                Ok(info) => {
                    time_stamp = info.time_date_stamp;
                    image_size = info.size_of_image;
                }
                Err(e) => tracing::warn!(
                    "Reading PE headers of {} at 0x{:x} failed, {}",
                    name,
                    base_address,
                    e
                ),
            }
            if let Some(details) = details {
                if details.is_main_module {
                    self.main_module = Some(base_address);
                }
                version_id = details.version_id.unwrap_or(Guid::ZERO);
            }
        }

        tracing::debug!(
            "Module 0x{:x} {} {}",
            base_address,
            if is_managed { "managed" } else { "native" },
            name
        );

        self.modules.insert(
            base_address,
            ModuleInfo {
                base_address,
                is_managed,
                time_stamp,
                image_size,
                version_id,
                name: name.to_owned(),
                load_bias: image.load_bias,
                dynamic_address: image.dynamic_address,
            },
        );
        true
    }

    /// Marks `[start, end)` as belonging to the module at `base_address`.
    pub fn add_module_address_range(&mut self, start: u64, end: u64, base_address: u64) {
        if start >= end {
            return;
        }
        tracing::trace!(
            "Module address range 0x{:x} - 0x{:x} base 0x{:x}",
            start,
            end,
            base_address
        );
        self.address_ranges.insert(start, (end, base_address));
    }

    pub fn get_by_base_address(&self, base_address: u64) -> Option<&ModuleInfo> {
        self.modules.get(&base_address)
    }

    /// Base address of the module whose file name is `name`. Only the file
    /// name part of both sides is compared.
    pub fn get_base_address_by_name(&self, name: &str) -> Option<u64> {
        let wanted = file_name_of(name);
        self.modules
            .values()
            .find(|module| same_file_name(module.file_name(), wanted))
            .map(|module| module.base_address)
    }

    /// Base address of the module an address belongs to.
    pub fn base_address_of(&self, address: u64) -> Option<u64> {
        self.address_ranges
            .range(..=address)
            .next_back()
            .filter(|(_, (end, _))| address < *end)
            .map(|(_, (_, base))| *base)
    }

    pub fn get_module_containing_address(&self, address: u64) -> Option<&ModuleInfo> {
        self.base_address_of(address)
            .and_then(|base| self.modules.get(&base))
    }

    /// The module the data access service flagged as main, the last one if
    /// there are several.
    pub fn main_module(&self) -> Option<&ModuleInfo> {
        self.main_module.and_then(|base| self.modules.get(&base))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.values()
    }
}
