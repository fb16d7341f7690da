// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ELF constants. There is the `object` crate that is pretty large.
//! Need a tiny portion of ELF specification as the code might run in a very
//! constrained environment, next to a crashing process.

#![allow(non_camel_case_types)]

use super::arch;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const EI_MAG0: usize = 0;
pub const EI_MAG1: usize = 1;
pub const EI_MAG2: usize = 2;
pub const EI_MAG3: usize = 3;
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const EI_OSABI: usize = 7;

pub const ELFMAG0: u8 = 0x7f;
pub const ELFMAG1: u8 = b'E';
pub const ELFMAG2: u8 = b'L';
pub const ELFMAG3: u8 = b'F';

/// ELF version
pub const EV_CURRENT: u8 = 1;

/// Executable file
pub const ET_EXEC: u16 = 2;
/// Shared object file
pub const ET_DYN: u16 = 3;
/// Core file
pub const ET_CORE: u16 = 4;
/// ELF class
pub const ELFCLASS64: u8 = 2;
/// Endianness
pub const ELFDATA2LSB: u8 = 1;

/// No ELF ABI
pub const ELFOSABI_NONE: u8 = 0;

/// Program header count sentinel, the real count lives in the `sh_info`
/// field of the first section header.
pub const PN_XNUM: u16 = 0xffff;
/// Inactive section header
pub const SHT_NULL: u32 = 0;

/// Loadable program segment
pub const PT_LOAD: u32 = 1;
/// Dynamic linking information
pub const PT_DYNAMIC: u32 = 2;
/// Auxiliary information
pub const PT_NOTE: u32 = 4;
/// Program header table itself
pub const PT_PHDR: u32 = 6;
/// Sorted table of unwind information
pub const PT_GNU_EH_FRAME: u32 = 0x6474_e550;

/// Segment is executable
pub const PF_X: u32 = 1 << 0;
/// Segment is writable
pub const PF_W: u32 = 1 << 1;
/// Segment is readable
pub const PF_R: u32 = 1 << 2;

// Dynamic section tags

pub const DT_NULL: i64 = 0;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_STRSZ: i64 = 10;
pub const DT_DEBUG: i64 = 21;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

// Auxiliary vector types

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_BASE: u64 = 7;
pub const AT_ENTRY: u64 = 9;
pub const AT_SYSINFO_EHDR: u64 = 33;

// ELF note types

/// Program status note
pub const NT_PRSTATUS: u32 = 1;
/// Program floating point registers note
pub const NT_FPREGSET: u32 = 2;
/// Program information note
pub const NT_PRPSINFO: u32 = 3;
/// Auxiliary vector note
pub const NT_AUXV: u32 = 6;
/// Mapped files note
pub const NT_FILE: u32 = 0x4649_4c45;

/// Process information
#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct prpsinfo_t {
    // total size (bytes):  136
    pub pr_state: u8,
    pub pr_sname: u8,
    pub pr_zomb: u8,
    pub pr_nice: u8,
    pub pad0: u32,
    pub pr_flag: u64,
    pub pr_uid: u32,
    pub pr_gid: u32,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_fname: [u8; 16],
    pub pr_psargs: [u8; 80],
}

/// Kernel time value
#[derive(IntoBytes, Immutable, Default)]
#[repr(C)]
pub struct pr_timeval_t {
    pub tv_sec: u64,
    pub tv_usec: u64,
}

/// Program status
#[derive(IntoBytes, Immutable)]
#[repr(C)]
pub struct prstatus_t {
    // total size (bytes):  336 (x86_64), 392 (aarch64)
    pub si_signo: u32,
    pub si_code: u32,
    pub si_errno: u32,
    pub pr_cursig: u16,
    pub pad0: u16,
    pub pr_sigpend: u64,
    pub pr_sighold: u64,
    pub pr_pid: u32,
    pub pr_ppid: u32,
    pub pr_pgrp: u32,
    pub pr_sid: u32,
    pub pr_utime: pr_timeval_t,
    pub pr_stime: pr_timeval_t,
    pub pr_cutime: pr_timeval_t,
    pub pr_cstime: pr_timeval_t,
    pub pr_reg: arch::elf_gregset_t,
    pub pr_fpvalid: u32,
    pub pad1: u32,
}

/// ELF auxiliary vector entry
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct Elf64_Auxv {
    /// AUXV type
    pub a_type: u64, // from auxvec.h
    /// AUXV value
    pub a_val: u64,
}

/// ELF note header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Debug)]
#[repr(C)]
pub struct Elf64_Nhdr {
    pub namesz: u32,
    pub descsz: u32,
    pub ntype: u32,
}

/// ELF header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Debug)]
#[repr(C)]
pub struct Elf64_Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Elf64_Ehdr {
    /// Checks the identification bytes and the record sizes of a header
    /// read out of the target.
    pub fn is_valid_image(&self) -> bool {
        self.e_ident[EI_MAG0] == ELFMAG0
            && self.e_ident[EI_MAG1] == ELFMAG1
            && self.e_ident[EI_MAG2] == ELFMAG2
            && self.e_ident[EI_MAG3] == ELFMAG3
            && self.e_ident[EI_CLASS] == ELFCLASS64
            && self.e_ident[EI_VERSION] == EV_CURRENT
            && self.e_ehsize == std::mem::size_of::<Elf64_Ehdr>() as u16
            && (self.e_type == ET_EXEC || self.e_type == ET_DYN)
            && self.e_phentsize == std::mem::size_of::<Elf64_Phdr>() as u16
    }
}

/// ELF program header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// ELF section header
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct Elf64_Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// Dynamic section entry
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

/// Symbol table entry
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct Elf64_Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

/// `struct r_debug` of the dynamic linker
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct r_debug {
    pub r_version: i32,
    pub pad0: u32,
    pub r_map: u64,
    pub r_brk: u64,
    pub r_state: i32,
    pub pad1: u32,
    pub r_ldbase: u64,
}

/// `struct link_map` of the dynamic linker, public part only
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct link_map {
    pub l_addr: u64,
    pub l_name: u64,
    pub l_ld: u64,
    pub l_next: u64,
    pub l_prev: u64,
}
