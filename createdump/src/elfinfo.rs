// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Discovery of the ELF images loaded in the target.
//!
//! The main executable is found through its program headers listed in the
//! auxiliary vector, the shared objects through the dynamic linker's
//! `r_debug` structure the `DT_DEBUG` entry of the executable points to.

use crate::elf::Elf64_Auxv;
use crate::elf::Elf64_Dyn;
use crate::elf::Elf64_Ehdr;
use crate::elf::Elf64_Phdr;
use crate::elf::AT_PHDR;
use crate::elf::AT_PHNUM;
use crate::elf::DT_DEBUG;
use crate::elf::DT_NULL;
use crate::elf::PT_DYNAMIC;
use crate::elf::PT_GNU_EH_FRAME;
use crate::elf::PT_LOAD;
use crate::elf::PT_NOTE;
use crate::elf::PT_PHDR;
use crate::elf::{link_map, r_debug};
use crate::error::DumpError;
use crate::memory::page_ceil;
use crate::memory::page_floor;
use crate::memory::ProcessMemory;
use crate::modules::ModuleCatalog;
use crate::modules::NativeImage;
use std::collections::HashSet;

const MAX_PROGRAM_HEADERS: u64 = 0x1000;
const MAX_DYNAMIC_ENTRIES: u64 = 0x1000;
const MAX_LINK_MAP_ENTRIES: usize = 0x4000;
const MAX_PATH: usize = 4096;

fn aux_value(auxv: &[Elf64_Auxv], a_type: u64) -> Option<u64> {
    auxv.iter().find(|entry| entry.a_type == a_type).map(|entry| entry.a_val)
}

fn read_program_headers(
    memory: &mut ProcessMemory,
    address: u64,
    count: u64,
) -> Result<Vec<Elf64_Phdr>, DumpError> {
    if count > MAX_PROGRAM_HEADERS {
        return Err(DumpError::UnsupportedHeader);
    }
    let size = std::mem::size_of::<Elf64_Phdr>() as u64;
    (0..count)
        .map(|index| memory.read_struct::<Elf64_Phdr>(address + index * size))
        .collect()
}

/// Registers the address ranges of an image and adds its notes, dynamic
/// section and unwind table index to the dump. Returns the image base,
/// i.e. the lowest loaded page.
fn visit_program_headers(
    memory: &mut ProcessMemory,
    modules: &mut ModuleCatalog,
    load_bias: u64,
    phdrs: &[Elf64_Phdr],
) -> Option<u64> {
    let page_size = memory.page_size();
    let base = phdrs
        .iter()
        .filter(|phdr| phdr.p_type == PT_LOAD)
        .map(|phdr| page_floor(load_bias.wrapping_add(phdr.p_vaddr), page_size))
        .min()?;

    for phdr in phdrs {
        let address = load_bias.wrapping_add(phdr.p_vaddr);
        match phdr.p_type {
            PT_LOAD => modules.add_module_address_range(
                page_floor(address, page_size),
                page_ceil(address.saturating_add(phdr.p_memsz), page_size),
                base,
            ),
            PT_NOTE | PT_DYNAMIC | PT_GNU_EH_FRAME => {
                memory.insert_region(address, phdr.p_memsz);
            }
            _ => {}
        }
    }

    Some(base)
}

fn read_dynamic_section(
    memory: &mut ProcessMemory,
    address: u64,
    size: u64,
) -> Result<Vec<Elf64_Dyn>, DumpError> {
    let entry_size = std::mem::size_of::<Elf64_Dyn>() as u64;
    let mut entries = Vec::new();
    for index in 0..(size / entry_size).min(MAX_DYNAMIC_ENTRIES) {
        let entry: Elf64_Dyn = memory.read_struct(address + index * entry_size)?;
        if entry.d_tag == DT_NULL {
            break;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Walks the main executable and the shared object list. Returns the
/// base address of the main executable.
pub(crate) fn enumerate_elf_info(
    memory: &mut ProcessMemory,
    modules: &mut ModuleCatalog,
    auxv: &[Elf64_Auxv],
    process_name: &str,
) -> Result<u64, DumpError> {
    let phdr_address = aux_value(auxv, AT_PHDR).ok_or(DumpError::MissingAuxvEntry(AT_PHDR))?;
    let phnum = aux_value(auxv, AT_PHNUM).ok_or(DumpError::MissingAuxvEntry(AT_PHNUM))?;

    tracing::info!("Enumerating program headers at 0x{:x}, {} entries", phdr_address, phnum);

    let phdrs = read_program_headers(memory, phdr_address, phnum)?;
    let load_bias = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_PHDR)
        .map(|phdr| phdr_address.wrapping_sub(phdr.p_vaddr))
        .unwrap_or(0);

    let executable_base = visit_program_headers(memory, modules, load_bias, &phdrs)
        .ok_or(DumpError::UnsupportedHeader)?;

    let dynamic_address = phdrs
        .iter()
        .find(|phdr| phdr.p_type == PT_DYNAMIC)
        .map(|phdr| (load_bias.wrapping_add(phdr.p_vaddr), phdr.p_memsz));

    let executable_name = modules
        .mappings()
        .find_containing(executable_base)
        .and_then(|mapping| mapping.file_name.clone())
        .unwrap_or_else(|| process_name.to_owned());

    modules.add_native_module(
        executable_base,
        &executable_name,
        NativeImage {
            load_bias,
            dynamic_address: dynamic_address.map(|(address, _)| address),
        },
        memory,
    );

    let Some((dynamic_address, dynamic_size)) = dynamic_address else {
        tracing::info!("Main executable has no dynamic section, statically linked");
        return Ok(executable_base);
    };

    let debug_address = read_dynamic_section(memory, dynamic_address, dynamic_size)?
        .iter()
        .find(|entry| entry.d_tag == DT_DEBUG)
        .map(|entry| entry.d_val)
        .unwrap_or(0);

    if debug_address == 0 {
        tracing::warn!("DT_DEBUG is not set, shared objects are not enumerated");
        return Ok(executable_base);
    }

    let debug: r_debug = memory.read_struct(debug_address)?;
    enumerate_link_map(memory, modules, debug.r_map);

    Ok(executable_base)
}

fn enumerate_link_map(memory: &mut ProcessMemory, modules: &mut ModuleCatalog, first: u64) {
    let mut seen = HashSet::new();
    let mut entry_address = first;

    while entry_address != 0 && seen.len() < MAX_LINK_MAP_ENTRIES {
        if !seen.insert(entry_address) {
            tracing::warn!("Link map loops back to 0x{:x}", entry_address);
            break;
        }

        let entry: link_map = match memory.read_struct(entry_address) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!("Reading link map entry at 0x{:x} failed, {}", entry_address, e);
                break;
            }
        };
        entry_address = entry.l_next;

        let name = if entry.l_name != 0 {
            memory.read_c_string(entry.l_name, MAX_PATH).unwrap_or_default()
        } else {
            String::new()
        };

        // The main executable is listed with an empty name.
        if name.is_empty() {
            continue;
        }

        tracing::debug!("Shared object 0x{:x} {}", entry.l_addr, name);

        if let Err(e) = add_shared_object(memory, modules, &entry, &name) {
            tracing::warn!("Skipping shared object {}, {}", name, e);
        }
    }
}

fn add_shared_object(
    memory: &mut ProcessMemory,
    modules: &mut ModuleCatalog,
    entry: &link_map,
    name: &str,
) -> Result<(), DumpError> {
    // For shared objects the load bias is the address of the ELF header.
    let ehdr: Elf64_Ehdr = memory.read_struct(entry.l_addr)?;
    if !ehdr.is_valid_image() {
        return Err(DumpError::UnsupportedHeader);
    }
    let phdrs = read_program_headers(
        memory,
        entry.l_addr.wrapping_add(ehdr.e_phoff),
        u64::from(ehdr.e_phnum),
    )?;
    let base = visit_program_headers(memory, modules, entry.l_addr, &phdrs)
        .ok_or(DumpError::UnsupportedHeader)?;

    modules.add_native_module(
        base,
        name,
        NativeImage {
            load_bias: entry.l_addr,
            dynamic_address: (entry.l_ld != 0).then_some(entry.l_ld),
        },
        memory,
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::elf::*;
    use crate::platform::fake::FakeProcess;
    use zerocopy::FromZeros;
    use zerocopy::IntoBytes;

    pub(crate) fn phdr(p_type: u32, vaddr: u64, memsz: u64) -> Elf64_Phdr {
        let mut phdr = Elf64_Phdr::new_zeroed();
        phdr.p_type = p_type;
        phdr.p_flags = PF_R;
        phdr.p_vaddr = vaddr;
        phdr.p_memsz = memsz;
        phdr.p_filesz = memsz;
        phdr
    }

    pub(crate) fn ehdr(phnum: u16) -> Elf64_Ehdr {
        let mut ehdr = Elf64_Ehdr::new_zeroed();
        ehdr.e_ident[..4].copy_from_slice(&[ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3]);
        ehdr.e_ident[EI_CLASS] = ELFCLASS64;
        ehdr.e_ident[EI_DATA] = ELFDATA2LSB;
        ehdr.e_ident[EI_VERSION] = EV_CURRENT;
        ehdr.e_type = ET_DYN;
        ehdr.e_ehsize = std::mem::size_of::<Elf64_Ehdr>() as u16;
        ehdr.e_phentsize = std::mem::size_of::<Elf64_Phdr>() as u16;
        ehdr.e_phoff = 0x40;
        ehdr.e_phnum = phnum;
        ehdr
    }

    fn write_phdrs(process: &mut FakeProcess, address: u64, phdrs: &[Elf64_Phdr]) {
        for (index, phdr) in phdrs.iter().enumerate() {
            process.write(address + (index * std::mem::size_of::<Elf64_Phdr>()) as u64, phdr.as_bytes());
        }
    }

    /// Position independent executable at 0x400000 with one shared object
    /// at 0x7f0000000000.
    pub(crate) fn process_with_images() -> FakeProcess {
        let mut process = FakeProcess::default();
        let exe = 0x40_0000_u64;
        let lib = 0x7f00_0000_0000_u64;

        process.map(exe, exe + 0x4000);
        let exe_phdrs = [
            phdr(PT_PHDR, 0x40, 3 * 56),
            phdr(PT_LOAD, 0, 0x2000),
            phdr(PT_DYNAMIC, 0x2000, 2 * 16),
        ];
        process.write(exe, ehdr(3).as_bytes());
        write_phdrs(&mut process, exe + 0x40, &exe_phdrs);
        // dynamic section: DT_DEBUG -> r_debug at exe + 0x3000
        process.write_u64(exe + 0x2000, DT_DEBUG as u64);
        process.write_u64(exe + 0x2008, exe + 0x3000);

        let mut debug = r_debug::new_zeroed();
        debug.r_version = 1;
        debug.r_map = exe + 0x3100;
        process.write(exe + 0x3000, debug.as_bytes());

        // main executable entry, empty name
        let main_entry = link_map {
            l_addr: exe,
            l_name: exe + 0x3200,
            l_ld: exe + 0x2000,
            l_next: exe + 0x3300,
            l_prev: 0,
        };
        process.write(exe + 0x3100, main_entry.as_bytes());
        let lib_entry = link_map {
            l_addr: lib,
            l_name: exe + 0x3400,
            l_ld: lib + 0x3000,
            l_next: 0,
            l_prev: exe + 0x3100,
        };
        process.write(exe + 0x3300, lib_entry.as_bytes());
        process.write(exe + 0x3400, b"/usr/lib/libcoreclr.so\0");

        process.map(lib, lib + 0x4000);
        process.write(lib, ehdr(3).as_bytes());
        write_phdrs(
            &mut process,
            lib + 0x40,
            &[
                phdr(PT_LOAD, 0, 0x3000),
                phdr(PT_NOTE, 0x200, 0x20),
                phdr(PT_DYNAMIC, 0x3000, 0x100),
            ],
        );

        process.auxv = vec![
            Elf64_Auxv { a_type: AT_PHDR, a_val: exe + 0x40 },
            Elf64_Auxv { a_type: AT_PHNUM, a_val: 3 },
        ];
        process
    }

    #[test]
    fn walks_executable_and_shared_objects() {
        let process = process_with_images();
        let auxv = process.auxv.clone();
        let mut memory = ProcessMemory::new(Box::new(process));
        let mut modules = ModuleCatalog::new();

        let base = enumerate_elf_info(&mut memory, &mut modules, &auxv, "app").unwrap();
        assert_eq!(base, 0x40_0000);
        assert_eq!(modules.len(), 2);
        assert_eq!(modules.get_by_base_address(0x40_0000).unwrap().name, "app");

        let lib = modules.get_by_base_address(0x7f00_0000_0000).unwrap();
        assert_eq!(lib.name, "/usr/lib/libcoreclr.so");
        assert_eq!(lib.dynamic_address, Some(0x7f00_0000_3000));
        assert_eq!(modules.get_base_address_by_name("libcoreclr.so"), Some(0x7f00_0000_0000));
        assert_eq!(modules.base_address_of(0x7f00_0000_1234), Some(0x7f00_0000_0000));
        assert_eq!(modules.base_address_of(0x40_1000), Some(0x40_0000));

        // notes and dynamic sections are dumped, plus everything read
        assert!(memory.regions().find_containing(0x7f00_0000_0200).is_some());
        assert!(memory.regions().find_containing(0x40_3000).is_some());
    }

    #[test]
    fn missing_program_headers_entry_is_fatal() {
        let mut memory = ProcessMemory::new(Box::new(FakeProcess::default()));
        let mut modules = ModuleCatalog::new();
        let auxv = [Elf64_Auxv { a_type: AT_PHNUM, a_val: 1 }];
        assert!(matches!(
            enumerate_elf_info(&mut memory, &mut modules, &auxv, "app"),
            Err(DumpError::MissingAuxvEntry(AT_PHDR))
        ));
    }
}
