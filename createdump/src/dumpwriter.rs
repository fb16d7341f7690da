// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Writing the gathered crash information as an ELF core dump file.
//!
//! The code below must not do backward seeks so that the content can be
//! streamed. Every size is computed up front and checked against what was
//! actually written.

use crate::arch;
use crate::crashinfo::CrashInfo;
use crate::crashinfo::SPECIAL_DIAGINFO_ADDRESS;
use crate::crashinfo::SPECIAL_DIAGINFO_SIZE;
use crate::elf::*;
use crate::error::DumpError;
use crate::memory::MemoryRegion;
use crate::thread::ThreadInfo;
use smallvec::smallvec;
use smallvec::SmallVec;
use std::io::Write;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

const ELF_HEADER_ALIGN: usize = 8;
const NOTE_HEADER_PADDING: usize = 8;
const ELF_NOTE_PADDING: usize = 4;

/// Signature of the diagnostics header, NUL padded
pub const DIAGINFO_SIGNATURE: &[u8; 16] = b"DIAGINFOHEADER\0\0";
pub const DIAGINFO_VERSION: i32 = 2;

/// Wraps a Write to emulate forward seeks
struct ElfCoreWriter<T: Write> {
    writer: T,
    written: usize,
}

impl<T> std::io::Write for ElfCoreWriter<T>
where
    T: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let result = self.writer.write(buf);
        if let Ok(written) = result {
            self.written += written;
        }
        result
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl<T> ElfCoreWriter<T>
where
    T: Write,
{
    pub fn new(writer: T) -> Self {
        Self { writer, written: 0 }
    }

    pub fn align_position(&mut self, alignment: u64) -> std::io::Result<usize> {
        const INLINE_CAPACITY: usize = 0x10000;

        let buf: SmallVec<[u8; INLINE_CAPACITY]> =
            smallvec![0; round_up(self.written as u64, alignment) as usize - self.written];
        self.write_all(&buf)?;
        Ok(buf.len())
    }

    pub fn stream_position(&self) -> usize {
        self.written
    }
}

#[derive(IntoBytes, Immutable)]
#[repr(C, packed)]
struct MappedFilesNoteIntro {
    file_count: u64,
    page_size: u64,
}

#[derive(IntoBytes, Immutable)]
#[repr(C, packed)]
struct MappedFilesNoteItem {
    start_addr: u64,
    end_addr: u64,
    page_offset: u64,
}

/// Content of the diagnostics page, found by debuggers at
/// [`SPECIAL_DIAGINFO_ADDRESS`].
#[derive(IntoBytes, Immutable, Debug)]
#[repr(C)]
pub struct SpecialDiagInfoHeader {
    pub signature: [u8; 16],
    pub version: i32,
    pub process_id: u32,
    pub exception_record: u64,
    pub signal: i32,
    pub signal_code: i32,
    pub signal_errno: i32,
    pub pad: i32,
    pub signal_address: u64,
}

impl SpecialDiagInfoHeader {
    pub fn new(crash_info: &CrashInfo) -> Self {
        let options = crash_info.options();
        Self {
            signature: *DIAGINFO_SIGNATURE,
            version: DIAGINFO_VERSION,
            process_id: crash_info.pid() as u32,
            exception_record: 0,
            signal: options.signal,
            signal_code: options.signal_code,
            signal_errno: options.signal_errno,
            pad: 0,
            signal_address: options.signal_address,
        }
    }
}

#[derive(Default, Debug)]
struct NoteSizes {
    process_info: usize,
    aux_vector: usize,
    mapped_files: usize,
    thread_status: usize,
    total_note_size: usize,
}

/// A mapped file as recorded in `NT_FILE`.
struct MappedFile<'a> {
    start: u64,
    end: u64,
    offset: u64,
    name: &'a str,
}

/// Module mappings with a file behind them, pseudo mappings such as
/// `[vdso]` are left out.
fn mapped_files(crash_info: &CrashInfo) -> Vec<MappedFile<'_>> {
    crash_info
        .modules()
        .mappings()
        .iter()
        .filter_map(|mapping| {
            let name = mapping.file_name.as_deref()?;
            (!name.starts_with('[')).then_some(MappedFile {
                start: mapping.start,
                end: mapping.end,
                offset: mapping.offset,
                name,
            })
        })
        .collect()
}

fn get_elf_notes_sizes(crash_info: &CrashInfo) -> NoteSizes {
    let header_and_name = std::mem::size_of::<Elf64_Nhdr>() + NOTE_HEADER_PADDING;
    let note = |payload: usize| header_and_name + round_up(payload as u64, ELF_NOTE_PADDING as u64) as usize;

    let process_info = note(std::mem::size_of::<prpsinfo_t>());
    let aux_vector = note(std::mem::size_of_val(crash_info.auxv()));

    let mapped_files = {
        let files = mapped_files(crash_info);
        let items = std::mem::size_of::<MappedFilesNoteItem>() * files.len();
        let strings: usize = files.iter().map(|file| file.name.len() + 1).sum();
        note(std::mem::size_of::<MappedFilesNoteIntro>() + items + strings)
    };

    let thread_status = crash_info
        .threads()
        .iter()
        .map(|thread| {
            note(std::mem::size_of::<prstatus_t>())
                + thread
                    .arch_state
                    .components()
                    .iter()
                    .map(|component| note(component.data.len()))
                    .sum::<usize>()
        })
        .sum();

    let total_note_size = process_info + aux_vector + mapped_files + thread_status;

    tracing::debug!("Estimated process info note size: {}", process_info);
    tracing::debug!("Estimated aux vector note size: {}", aux_vector);
    tracing::debug!("Estimated mapped files note size: {}", mapped_files);
    tracing::debug!("Estimated thread status note size: {}", thread_status);
    tracing::info!("Estimated total note size: {}", total_note_size);

    NoteSizes {
        process_info,
        aux_vector,
        mapped_files,
        thread_status,
        total_note_size,
    }
}

/// Creates an ELF core dump out of the gathered crash information.
///
/// # Arguments:
/// * `writer` - a `std::io::Write` the data is sent to.
/// * `crash_info` - the gathered crash information, its target still
///   suspended.
///
pub fn write_core_dump<T: Write>(writer: T, crash_info: &mut CrashInfo) -> Result<usize, DumpError> {
    let mut total_written = 0_usize;
    let mut writer = ElfCoreWriter::new(writer);

    let regions: Vec<MemoryRegion> = crash_info
        .memory()
        .regions()
        .iter()
        .filter(|region| region.is_backed_by_memory())
        .cloned()
        .collect();
    let page_size = crash_info.memory().page_size();

    tracing::info!(
        "Creating core dump file for process {}, {} regions",
        crash_info.pid(),
        regions.len()
    );

    let note_sizes = get_elf_notes_sizes(crash_info);

    total_written += write_elf_header(&mut writer, regions.len())?;
    total_written += writer.align_position(ELF_HEADER_ALIGN as u64)?;
    total_written += write_program_headers(&mut writer, &regions, &note_sizes, page_size)?;
    total_written += writer.align_position(ELF_HEADER_ALIGN as u64)?;
    total_written += write_elf_notes(&mut writer, crash_info, &note_sizes)?;
    total_written += writer.align_position(page_size)?;
    total_written += write_va_regions(&mut writer, crash_info, &regions)?;
    writer.flush()?;

    tracing::info!("Wrote {} bytes for ELF core dump", total_written);

    Ok(total_written)
}

fn round_up(value: u64, alignment: u64) -> u64 {
    if value % alignment != 0 {
        (value + alignment) / alignment * alignment
    } else {
        value
    }
}

/// Whether the program header count overflows `e_phnum`.
fn needs_extended_numbering(phnum: usize) -> bool {
    phnum >= PN_XNUM as usize
}

fn write_elf_header<T: Write>(writer: &mut ElfCoreWriter<T>, region_count: usize) -> Result<usize, DumpError> {
    let mut e_ident = [0_u8; 16];
    e_ident[EI_MAG0] = ELFMAG0;
    e_ident[EI_MAG1] = ELFMAG1;
    e_ident[EI_MAG2] = ELFMAG2;
    e_ident[EI_MAG3] = ELFMAG3;
    e_ident[EI_CLASS] = ELFCLASS64;
    e_ident[EI_DATA] = ELFDATA2LSB;
    e_ident[EI_VERSION] = EV_CURRENT;
    e_ident[EI_OSABI] = ELFOSABI_NONE;

    // PT_NOTE and the regions
    let phnum = region_count + 1;
    let ehdr_size = std::mem::size_of::<Elf64_Ehdr>();
    let shdr_size = std::mem::size_of::<Elf64_Shdr>();
    let extended = needs_extended_numbering(phnum);

    let elf_header = Elf64_Ehdr {
        e_ident,
        e_type: ET_CORE,
        e_machine: arch::EM_ELF_MACHINE,
        e_version: EV_CURRENT as u32,
        e_entry: 0,
        e_phoff: (if extended { ehdr_size + shdr_size } else { ehdr_size }) as u64,
        e_shoff: if extended { ehdr_size as u64 } else { 0 },
        e_flags: 0,
        e_ehsize: ehdr_size as u16,
        e_phentsize: std::mem::size_of::<Elf64_Phdr>() as u16,
        e_phnum: if extended { PN_XNUM } else { phnum as u16 },
        e_shentsize: if extended { shdr_size as u16 } else { 0 },
        e_shnum: u16::from(extended),
        e_shstrndx: 0,
    };

    tracing::info!("Writing ELF header at offset {}...", writer.stream_position());

    let mut written = 0_usize;
    writer.write_all(elf_header.as_bytes())?;
    written += elf_header.as_bytes().len();

    if extended {
        // The real count goes to the first section header.
        tracing::info!("{} program headers, using extended numbering", phnum);
        let section_header = Elf64_Shdr {
            sh_name: 0,
            sh_type: SHT_NULL,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: phnum as u32,
            sh_addralign: 0,
            sh_entsize: 0,
        };
        writer.write_all(section_header.as_bytes())?;
        written += section_header.as_bytes().len();
    }

    tracing::info!("Wrote {} bytes", written);

    Ok(written)
}

fn write_program_headers<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    regions: &[MemoryRegion],
    note_sizes: &NoteSizes,
    page_size: u64,
) -> Result<usize, DumpError> {
    tracing::info!("Writing program headers at offset {}...", writer.stream_position());

    let mut written = 0_usize;

    // There will a header for PT_NOTE, and
    // as many PT_LOAD as there are regions.
    // Notes are situated right after the headers.

    let phdr_size = std::mem::size_of::<Elf64_Phdr>() * (regions.len() + 1);
    let data_offset = round_up(writer.stream_position() as u64, ELF_HEADER_ALIGN as u64)
        + round_up(phdr_size as u64, ELF_HEADER_ALIGN as u64);

    let note_header = Elf64_Phdr {
        p_type: PT_NOTE,
        p_flags: 0,
        p_offset: data_offset,
        p_vaddr: 0,
        p_paddr: 0,
        p_filesz: note_sizes.total_note_size as u64,
        p_memsz: note_sizes.total_note_size as u64,
        p_align: 1,
    };
    writer.write_all(note_header.as_bytes())?;
    written += note_header.as_bytes().len();

    let mut current_offset = round_up(data_offset + note_sizes.total_note_size as u64, page_size);

    for region in regions {
        let seg_header = Elf64_Phdr {
            p_type: PT_LOAD,
            p_flags: region.permissions().bits(),
            p_offset: current_offset,
            p_vaddr: region.start,
            p_paddr: 0,
            p_filesz: region.size(),
            p_memsz: region.size(),
            p_align: page_size,
        };
        writer.write_all(seg_header.as_bytes())?;
        written += seg_header.as_bytes().len();

        current_offset += region.size();
    }

    tracing::info!("Wrote {} bytes", written);

    Ok(written)
}

fn write_elf_note<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    note_kind: u32,
    name_bytes: &[u8],
    data: &[u8],
) -> Result<usize, DumpError> {
    let mut written = 0_usize;

    let mut note_header = Elf64_Nhdr {
        ntype: note_kind,
        namesz: std::cmp::min(name_bytes.len() as u32, 7),
        descsz: data.len() as u32,
    };

    let mut note_name = [0_u8; NOTE_HEADER_PADDING];
    let name_len = note_header.namesz as usize;
    note_name[..name_len].copy_from_slice(&name_bytes[..name_len]);

    // Account for the terminating zero.
    // ELF-64 Object File Format, Version 1.5 claims that is not required
    // but readelf and gdb refuse to read it otherwise

    note_header.namesz += 1;

    tracing::trace!(
        "Writing note {:x} with {} bytes at offset {}...",
        note_kind,
        data.len(),
        writer.stream_position()
    );

    writer.write_all(note_header.as_bytes())?;
    written += note_header.as_bytes().len();

    writer.write_all(&note_name)?;
    written += note_name.len();

    writer.write_all(data)?;
    written += data.len();
    written += writer.align_position(ELF_NOTE_PADDING as u64)?;

    Ok(written)
}

/// Copies `src` into `dst`, truncating it and leaving the rest zeroed.
fn copy_truncated<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut dst = [0_u8; N];
    let len = src.len().min(N);
    dst[..len].copy_from_slice(&src[..len]);
    dst
}

fn write_process_info_note<T: Write>(writer: &mut ElfCoreWriter<T>, crash_info: &CrashInfo) -> Result<usize, DumpError> {
    tracing::info!("Writing process info note at offset {}...", writer.stream_position());

    let name = crash_info.process_name().as_bytes();
    let pr_info = prpsinfo_t {
        pr_state: 0,
        pr_sname: b'R',
        pr_zomb: 0,
        pr_nice: 0,
        pad0: 0,
        pr_flag: 0,
        pr_uid: 0,
        pr_gid: 0,
        pr_pid: crash_info.pid() as u32,
        pr_ppid: crash_info.ppid() as u32,
        pr_pgrp: crash_info.tgid() as u32,
        pr_sid: 0,
        pr_fname: copy_truncated(name),
        pr_psargs: copy_truncated(name),
    };
    let written = write_elf_note(writer, NT_PRPSINFO, b"CORE", pr_info.as_bytes())?;

    tracing::info!("Wrote {} bytes for the process info note", written);

    Ok(written)
}

fn write_aux_vector_note<T: Write>(writer: &mut ElfCoreWriter<T>, crash_info: &CrashInfo) -> Result<usize, DumpError> {
    tracing::info!("Writing auxiliary vector at offset {}...", writer.stream_position());

    let written = write_elf_note(writer, NT_AUXV, b"CORE", crash_info.auxv().as_bytes())?;

    tracing::info!("Wrote {} bytes for the auxiliary vector", written);

    Ok(written)
}

fn write_mapped_files_note<T: Write>(writer: &mut ElfCoreWriter<T>, crash_info: &CrashInfo) -> Result<usize, DumpError> {
    tracing::debug!("Writing mapped files note at offset {}...", writer.stream_position());

    let page_size = crash_info.memory().page_size();
    let files = mapped_files(crash_info);
    let mut data: Vec<u8> = Vec::with_capacity(page_size as usize);

    let intro = MappedFilesNoteIntro {
        file_count: files.len() as u64,
        page_size,
    };
    data.extend_from_slice(intro.as_bytes());

    for file in &files {
        let item = MappedFilesNoteItem {
            start_addr: file.start,
            end_addr: file.end,
            page_offset: file.offset / page_size,
        };
        data.extend_from_slice(item.as_bytes());
    }

    for file in &files {
        data.extend_from_slice(file.name.as_bytes());
        data.push(0_u8);
    }

    let written = write_elf_note(writer, NT_FILE, b"CORE", &data)?;

    tracing::debug!("Wrote {} bytes for mapped files note, {} files", written, files.len());

    Ok(written)
}

/// Signal reported for a thread: the crash signal for the crashing thread,
/// `SIGABRT` for the others.
fn current_signal(crash_info: &CrashInfo, thread: &ThreadInfo) -> u16 {
    let options = crash_info.options();
    if options.crash_thread == Some(thread.tid) && options.signal != 0 {
        options.signal as u16
    } else {
        libc::SIGABRT as u16
    }
}

fn write_thread_status_notes<T: Write>(writer: &mut ElfCoreWriter<T>, crash_info: &CrashInfo) -> Result<usize, DumpError> {
    let mut total_written = 0_usize;

    tracing::info!("Writing thread status notes at offset {}...", writer.stream_position());

    for thread in crash_info.threads() {
        let cursig = current_signal(crash_info, thread);
        let status = prstatus_t {
            si_signo: u32::from(cursig),
            si_code: 0,
            si_errno: 0,
            pr_cursig: cursig,
            pad0: 0,
            pr_sigpend: 0,
            pr_sighold: 0,
            pr_pid: thread.tid as u32,
            pr_ppid: thread.ppid as u32,
            pr_pgrp: thread.tgid as u32,
            pr_sid: 0,
            pr_utime: pr_timeval_t::default(),
            pr_stime: pr_timeval_t::default(),
            pr_cutime: pr_timeval_t::default(),
            pr_cstime: pr_timeval_t::default(),
            pr_reg: thread.arch_state.greg_set(),
            pr_fpvalid: u32::from(!thread.arch_state.components().is_empty()),
            pad1: 0,
        };

        total_written += write_elf_note(writer, NT_PRSTATUS, b"CORE", status.as_bytes())?;

        for component in thread.arch_state.components() {
            total_written += write_elf_note(writer, component.note_type, component.note_name, &component.data)?;
        }
    }

    tracing::info!(
        "Wrote {} bytes for the thread status notes, {} threads",
        total_written,
        crash_info.threads().len()
    );

    Ok(total_written)
}

fn check_note_size(written: usize, expected: usize, what: &'static str) -> Result<usize, DumpError> {
    if written != expected {
        tracing::error!("{}: wrote {} bytes, expected {}", what, written, expected);
        return Err(DumpError::InternalError(what));
    }
    Ok(written)
}

fn write_elf_notes<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    crash_info: &CrashInfo,
    note_sizes: &NoteSizes,
) -> Result<usize, DumpError> {
    let mut total_written = 0_usize;

    tracing::info!("Writing notes at offset {}...", writer.stream_position());

    total_written += check_note_size(
        write_process_info_note(writer, crash_info)?,
        note_sizes.process_info,
        "Mismatched process info note size",
    )?;
    total_written += check_note_size(
        write_aux_vector_note(writer, crash_info)?,
        note_sizes.aux_vector,
        "Mismatched aux vector note size",
    )?;
    total_written += check_note_size(
        write_mapped_files_note(writer, crash_info)?,
        note_sizes.mapped_files,
        "Mismatched mapped files note size",
    )?;
    total_written += check_note_size(
        write_thread_status_notes(writer, crash_info)?,
        note_sizes.thread_status,
        "Mismatched thread status note size",
    )?;

    tracing::info!("Wrote {} bytes for notes", total_written);

    Ok(total_written)
}

/// Bytes of the diagnostics page, the header followed by zeroes.
fn special_diag_info_page(crash_info: &CrashInfo) -> Vec<u8> {
    let mut page = vec![0_u8; SPECIAL_DIAGINFO_SIZE as usize];
    let header = SpecialDiagInfoHeader::new(crash_info);
    page[..std::mem::size_of::<SpecialDiagInfoHeader>()].copy_from_slice(header.as_bytes());
    page
}

fn write_va_region<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    crash_info: &mut CrashInfo,
    region: &MemoryRegion,
    diag_page: Option<&[u8]>,
) -> Result<usize, DumpError> {
    // For optimal performance should be in [8KiB; 64KiB] range.
    // Selected 64 KiB as data on various hardware platforms shows
    // peak performance in this case.
    const BUFFER_SIZE: usize = 0x10000;

    let special_end = SPECIAL_DIAGINFO_ADDRESS + SPECIAL_DIAGINFO_SIZE;
    let mut dumped = 0_usize;
    let mut address = region.start;
    let mut buffer = vec![0_u8; BUFFER_SIZE];

    while address < region.end {
        if let Some(diag_page) = diag_page.filter(|_| (SPECIAL_DIAGINFO_ADDRESS..special_end).contains(&address)) {
            let from = (address - SPECIAL_DIAGINFO_ADDRESS) as usize;
            let len = std::cmp::min(special_end, region.end) - address;
            let bytes = &diag_page[from..from + len as usize];
            writer.write_all(bytes)?;
            address += len;
            dumped += bytes.len();
            continue;
        }

        let mut chunk_end = std::cmp::min(region.end, address.saturating_add(BUFFER_SIZE as u64));
        if diag_page.is_some() && address < SPECIAL_DIAGINFO_ADDRESS {
            chunk_end = std::cmp::min(chunk_end, SPECIAL_DIAGINFO_ADDRESS);
        }
        let len = (chunk_end - address) as usize;

        // Every page was validated when it was added, a short read now
        // means the target went away.
        let read = crash_info.memory_mut().read_raw(address, &mut buffer[..len])?;
        if read != len {
            return Err(DumpError::ShortRead {
                address,
                requested: len,
                read,
            });
        }

        writer.write_all(&buffer[..len])?;
        address += len as u64;
        dumped += len;
    }

    Ok(dumped)
}

fn write_va_regions<T: Write>(
    writer: &mut ElfCoreWriter<T>,
    crash_info: &mut CrashInfo,
    regions: &[MemoryRegion],
) -> Result<usize, DumpError> {
    let mut written = 0_usize;
    let diag_page = crash_info
        .has_special_region()
        .then(|| special_diag_info_page(crash_info));

    tracing::info!("Writing memory content at offset {}...", writer.stream_position());

    for region in regions {
        let dumped = write_va_region(writer, crash_info, region, diag_page.as_deref())?;

        written += dumped;

        tracing::debug!(
            "Saved {} bytes from region [0x{:x}; 0x{:x}] of size {}, current file offset {}",
            dumped,
            region.start,
            region.end,
            region.size(),
            writer.stream_position()
        );
    }

    tracing::info!("Wrote {} bytes for memory regions", written);

    Ok(written)
}
