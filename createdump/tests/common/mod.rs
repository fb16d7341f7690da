// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-memory target process shared by the integration tests.

#![allow(dead_code)]

use createdump::arch::ArchState;
use createdump::elf::*;
use createdump::memory::MemoryRegion;
use createdump::memory::RegionFlags;
use createdump::platform::ThreadStatus;
use createdump::DumpError;
use createdump::PlatformProcessInspector;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

pub const PAGE: u64 = 0x1000;
pub const PID: i32 = 4242;

pub const EXE: u64 = 0x40_0000;
pub const HEAP: u64 = 0x1000_0000;
pub const EXEC_ONLY: u64 = 0x2000_0000;
pub const RESERVED: u64 = 0x3000_0000;
pub const STACK: u64 = 0x7ffd_0000_0000;

/// Target process backed by a page map.
#[derive(Clone, Default)]
pub struct TestTarget {
    pub pages: BTreeMap<u64, Vec<u8>>,
    pub mappings: Vec<MemoryRegion>,
    pub threads: Vec<ThreadStatus>,
    pub auxv: Vec<Elf64_Auxv>,
    pub resumed: Rc<Cell<usize>>,
    /// Reads larger than a page come back empty, as if the process
    /// exited once region data is copied.
    pub exits_on_bulk_read: bool,
}

impl TestTarget {
    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let at = address + i as u64;
            let page = self
                .pages
                .entry(at & !(PAGE - 1))
                .or_insert_with(|| vec![0; PAGE as usize]);
            page[(at & (PAGE - 1)) as usize] = *byte;
        }
    }

    /// Maps `[start, end)` filled with a pattern derived from the address.
    pub fn map_pattern(&mut self, start: u64, end: u64) {
        let mut page = start;
        while page < end {
            let bytes = (0..PAGE).map(|offset| ((page + offset) >> 4) as u8 ^ (page >> 12) as u8);
            self.pages.insert(page, bytes.collect());
            page += PAGE;
        }
    }

    /// Byte at `address`, if it is mapped.
    pub fn byte_at(&self, address: u64) -> Option<u8> {
        self.pages
            .get(&(address & !(PAGE - 1)))
            .map(|page| page[(address & (PAGE - 1)) as usize])
    }
}

impl PlatformProcessInspector for TestTarget {
    fn pid(&self) -> i32 {
        PID
    }

    fn page_size(&self) -> u64 {
        PAGE
    }

    fn process_name(&mut self) -> Result<String, DumpError> {
        Ok("testapp".to_owned())
    }

    fn enumerate_and_suspend_threads(&mut self) -> Result<Vec<i32>, DumpError> {
        Ok(self.threads.iter().map(|thread| thread.tid).collect())
    }

    fn thread_status(&mut self, tid: i32) -> Result<ThreadStatus, DumpError> {
        self.threads
            .iter()
            .find(|thread| thread.tid == tid)
            .cloned()
            .ok_or(DumpError::UnknownThread(tid))
    }

    fn read_aux_vector(&mut self) -> Result<Vec<Elf64_Auxv>, DumpError> {
        Ok(self.auxv.clone())
    }

    fn memory_mappings(&mut self) -> Result<Vec<MemoryRegion>, DumpError> {
        Ok(self.mappings.clone())
    }

    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError> {
        if self.exits_on_bulk_read && buf.len() as u64 > PAGE {
            return Ok(0);
        }
        for (i, byte) in buf.iter_mut().enumerate() {
            match self.byte_at(address + i as u64) {
                Some(value) => *byte = value,
                None if i == 0 => return Err(DumpError::NixError(nix::Error::EFAULT)),
                None => return Ok(i),
            }
        }
        Ok(buf.len())
    }

    fn is_page_resident(&mut self, address: u64) -> bool {
        self.pages.contains_key(&(address & !(PAGE - 1)))
    }

    fn resume(&mut self) {
        self.resumed.set(self.resumed.get() + 1);
    }
}

fn program_header(p_type: u32, vaddr: u64, memsz: u64) -> Elf64_Phdr {
    let mut phdr = Elf64_Phdr::new_zeroed();
    phdr.p_type = p_type;
    phdr.p_flags = PF_R | PF_X;
    phdr.p_vaddr = vaddr;
    phdr.p_memsz = memsz;
    phdr.p_filesz = memsz;
    phdr
}

fn read_write() -> RegionFlags {
    RegionFlags::READ | RegionFlags::WRITE | RegionFlags::PRIVATE
}

/// A statically linked executable, a heap, an execute-only mapping, a
/// reserved range and the stack of the only thread.
pub fn target() -> TestTarget {
    let mut target = TestTarget::default();

    target.map_pattern(EXE, EXE + 2 * PAGE);
    let mut ehdr = Elf64_Ehdr::new_zeroed();
    ehdr.e_ident[..4].copy_from_slice(&[ELFMAG0, ELFMAG1, ELFMAG2, ELFMAG3]);
    ehdr.e_ident[EI_CLASS] = ELFCLASS64;
    ehdr.e_ident[EI_DATA] = ELFDATA2LSB;
    ehdr.e_ident[EI_VERSION] = EV_CURRENT;
    ehdr.e_type = ET_DYN;
    ehdr.e_ehsize = std::mem::size_of::<Elf64_Ehdr>() as u16;
    ehdr.e_phentsize = std::mem::size_of::<Elf64_Phdr>() as u16;
    ehdr.e_phoff = 0x40;
    ehdr.e_phnum = 2;
    target.write(EXE, ehdr.as_bytes());
    let phdrs = [
        program_header(PT_PHDR, 0x40, 2 * std::mem::size_of::<Elf64_Phdr>() as u64),
        program_header(PT_LOAD, 0, 2 * PAGE),
    ];
    target.write(EXE + 0x40, phdrs.as_bytes());

    target.map_pattern(HEAP, HEAP + 2 * PAGE);
    target.map_pattern(EXEC_ONLY, EXEC_ONLY + PAGE);
    target.map_pattern(STACK, STACK + 4 * PAGE);

    target.mappings = vec![
        MemoryRegion::module(
            RegionFlags::READ | RegionFlags::EXECUTE | RegionFlags::PRIVATE,
            EXE,
            EXE + 2 * PAGE,
            0,
            "/app/testapp",
        ),
        MemoryRegion::new(read_write(), HEAP, HEAP + 2 * PAGE),
        MemoryRegion::new(RegionFlags::EXECUTE | RegionFlags::PRIVATE, EXEC_ONLY, EXEC_ONLY + PAGE),
        MemoryRegion::new(RegionFlags::PRIVATE, RESERVED, RESERVED + PAGE),
        MemoryRegion::module(read_write(), STACK, STACK + 4 * PAGE, 0, "[stack]"),
    ];

    let mut state = ArchState::from_gprs(Vec::new());
    state.set_instruction_pointer(EXE + 0x1010);
    state.set_stack_pointer(STACK + 2 * PAGE + 0x10);
    target.threads = vec![ThreadStatus {
        tid: PID,
        ppid: 1,
        tgid: PID,
        arch_state: state,
    }];

    target.auxv = vec![
        Elf64_Auxv {
            a_type: AT_PHDR,
            a_val: EXE + 0x40,
        },
        Elf64_Auxv {
            a_type: AT_PHNUM,
            a_val: 2,
        },
    ];
    target
}
