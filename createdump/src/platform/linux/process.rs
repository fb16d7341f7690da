// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Gathering process information from procfs.

use crate::elf::Elf64_Auxv;
use crate::elf::AT_NULL;
use crate::error::DumpError;
use crate::memory::MemoryRegion;
use crate::memory::RegionFlags;
use nix::unistd::Pid;
use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::Read;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

pub(crate) fn get_thread_ids(pid: Pid) -> Result<Vec<Pid>, DumpError> {
    let mut threads = Vec::new();
    let task_dir = format!("/proc/{}/task", pid);
    tracing::debug!("Reading {task_dir}");
    let paths = std::fs::read_dir(task_dir)?;

    tracing::debug!(
        "Enumerating threads(light-weight processes) for the process {}",
        pid
    );

    for entry in paths {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let tid = Pid::from_raw(name.parse::<u32>()? as nix::libc::pid_t);

        tracing::debug!("Found thread {}", tid);

        threads.push(tid)
    }

    threads.sort();
    Ok(threads)
}

/// Parent process id of a thread, from its stat file.
pub(crate) fn get_thread_ppid(pid: Pid, tid: Pid) -> Result<i32, DumpError> {
    // The command name might contain spaces and parentheses, the fields
    // start after the last closing parenthesis.
    let stat_path = format!("/proc/{}/task/{}/stat", pid, tid);
    tracing::debug!("Reading {stat_path}");
    let stat_str = fs::read_to_string(stat_path)?;
    parse_stat_ppid(&stat_str)
}

pub(crate) fn parse_stat_ppid(stat: &str) -> Result<i32, DumpError> {
    let Some(comm_pos_end) = stat.rfind(')') else {
        tracing::error!(
            "Unsupported format of the procfs stat file, could not find command line: {}",
            stat
        );
        return Err(DumpError::ProcParsingError);
    };

    let fields = stat[comm_pos_end + 1..].split_whitespace().collect::<Vec<_>>();
    if fields.len() < 2 {
        tracing::error!("Unsupported format of the procfs stat file: {}", stat);
        return Err(DumpError::ProcParsingError);
    }

    Ok(fields[1].parse::<i32>()?)
}

/// Thread group id of a thread, from its status file.
pub(crate) fn get_thread_tgid(pid: Pid, tid: Pid) -> Result<i32, DumpError> {
    let status_path = format!("/proc/{pid}/task/{tid}/status");
    tracing::debug!("Reading {status_path}");
    let status_file = fs::File::open(&status_path)?;
    let reader = std::io::BufReader::new(status_file);

    for line in reader.lines() {
        let line = line?;
        if let Some(s) = line.strip_prefix("Tgid:") {
            return Ok(s.trim().parse::<i32>()?);
        }
    }

    Err(DumpError::ProcParsingError)
}

pub(crate) fn get_process_name(pid: Pid) -> Result<String, DumpError> {
    let comm_path = format!("/proc/{pid}/comm");
    tracing::debug!("Reading {comm_path}");
    Ok(fs::read_to_string(comm_path)?.trim_end().to_owned())
}

pub(crate) fn get_aux_vector(pid: Pid) -> Result<Vec<Elf64_Auxv>, DumpError> {
    let mut auxv: Vec<Elf64_Auxv> = Vec::new();

    let auxv_file_name = format!("/proc/{}/auxv", pid);
    tracing::debug!("Reading {auxv_file_name}");
    let mut file = File::open(auxv_file_name)?;

    loop {
        let mut aux = Elf64_Auxv::new_zeroed();

        match file.read_exact(aux.as_mut_bytes()) {
            Ok(_) if aux.a_type == AT_NULL => break,
            Ok(_) => auxv.push(aux),
            Err(_) => break,
        }
    }

    Ok(auxv)
}

pub(crate) fn get_memory_mappings(pid: Pid) -> Result<Vec<MemoryRegion>, DumpError> {
    let maps_path = format!("/proc/{}/maps", pid);
    tracing::debug!("Reading {maps_path}");
    let maps_file = fs::File::open(maps_path)?;
    let reader = std::io::BufReader::new(maps_file);

    let mut maps = Vec::new();
    for line in reader.lines() {
        let line = line?;
        tracing::trace!("Memory maps: {line}");
        maps.push(parse_maps_line(&line)?);
    }

    maps.sort_by_key(|region| region.start);
    Ok(maps)
}

/// Parses one line of `/proc/<pid>/maps`:
/// `start-end perms offset dev inode [name]`. The name might contain
/// spaces.
pub(crate) fn parse_maps_line(line: &str) -> Result<MemoryRegion, DumpError> {
    let mut parts = line.splitn(6, |c: char| c.is_ascii_whitespace());
    let range = parts.next().ok_or(DumpError::ProcParsingError)?;
    let perms = parts.next().ok_or(DumpError::ProcParsingError)?.as_bytes();
    let offset = parts.next().ok_or(DumpError::ProcParsingError)?;
    let _dev = parts.next().ok_or(DumpError::ProcParsingError)?;
    let _inode = parts.next().ok_or(DumpError::ProcParsingError)?;
    let name = parts.next().map(str::trim).filter(|name| !name.is_empty());

    let (begin, end) = range.split_once('-').ok_or(DumpError::ProcParsingError)?;
    let start = u64::from_str_radix(begin, 16)?;
    let end = u64::from_str_radix(end, 16)?;
    let offset = u64::from_str_radix(offset, 16)?;

    if perms.len() < 4 {
        return Err(DumpError::ProcParsingError);
    }

    let mut flags = RegionFlags::empty();
    flags.set(RegionFlags::READ, perms[0] == b'r');
    flags.set(RegionFlags::WRITE, perms[1] == b'w');
    flags.set(RegionFlags::EXECUTE, perms[2] == b'x');
    flags.set(RegionFlags::PRIVATE, perms[3] == b'p');
    flags.set(RegionFlags::SHARED, perms[3] == b's');

    Ok(MemoryRegion {
        flags,
        start,
        end,
        offset,
        file_name: name.map(str::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_lines() {
        let region = parse_maps_line(
            "7f0e5c400000-7f0e5c428000 r--p 00002000 08:01 1837 /usr/lib/x86_64-linux-gnu/libc.so.6",
        )
        .unwrap();
        assert_eq!(region.start, 0x7f0e5c400000);
        assert_eq!(region.end, 0x7f0e5c428000);
        assert_eq!(region.offset, 0x2000);
        assert_eq!(region.flags, RegionFlags::READ | RegionFlags::PRIVATE);
        assert_eq!(
            region.file_name.as_deref(),
            Some("/usr/lib/x86_64-linux-gnu/libc.so.6")
        );

        let anonymous = parse_maps_line("7ffd1000-7ffd3000 rw-s 00000000 00:00 0 ").unwrap();
        assert_eq!(
            anonymous.flags,
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::SHARED
        );
        assert!(anonymous.file_name.is_none());

        let spaced =
            parse_maps_line("1000-2000 r-xp 00000000 08:01 77      /opt/my app/run (deleted)").unwrap();
        assert_eq!(spaced.file_name.as_deref(), Some("/opt/my app/run (deleted)"));

        assert!(parse_maps_line("garbage").is_err());
    }

    #[test]
    fn stat_with_parentheses_in_the_name() {
        let stat = "4242 (my (odd) app) S 17 4242 4242 0 -1 4194560 130 0 0 0 0 0 0 0 20 0 1 0";
        assert_eq!(parse_stat_ppid(stat).unwrap(), 17);
        assert!(parse_stat_ppid("4242 no parens").is_err());
    }

    #[test]
    fn own_process_is_readable() {
        let pid = nix::unistd::getpid();
        let tids = get_thread_ids(pid).unwrap();
        assert!(tids.contains(&pid));
        assert_eq!(get_thread_tgid(pid, pid).unwrap(), pid.as_raw());
        let auxv = get_aux_vector(pid).unwrap();
        assert!(auxv.iter().any(|entry| entry.a_type == crate::elf::AT_PHDR));
        let maps = get_memory_mappings(pid).unwrap();
        assert!(maps.windows(2).all(|pair| pair[0].start <= pair[1].start));
    }
}
