// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This submodule contains the `memory` handling functionality for
//! a linux process.

use crate::error::DumpError;
use nix::errno::Errno;
use nix::sys::uio::process_vm_readv;
use nix::sys::uio::RemoteIoVec;
use nix::unistd::Pid;
use std::fs::File;
use std::io::IoSliceMut;
use std::os::unix::fs::FileExt;

/// Reads memory of another process.
///
/// Starts with the `process_vm_readv` system call available on Linux 3.2+.
/// It might be disabled in the kernel configuration or refused by the
/// security policy, then the `/proc/<pid>/mem` file is used from there on.
pub(crate) struct MemoryReader {
    pid: Pid,
    mem_file: Option<File>,
    use_fast_path: bool,
}

impl MemoryReader {
    pub fn new(pid: Pid) -> Self {
        let use_fast_path = process_vm_readv_works();
        if use_fast_path {
            tracing::info!("Using the fast process memory read on this system");
        } else {
            tracing::info!("Using the slow process memory read on this system");
        }
        Self {
            pid,
            mem_file: None,
            use_fast_path,
        }
    }

    pub fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.use_fast_path {
            let len = buf.len();
            match process_vm_readv(
                self.pid,
                &mut [IoSliceMut::new(buf)],
                &[RemoteIoVec {
                    base: address as usize,
                    len,
                }],
            ) {
                Ok(read) => return Ok(read),
                Err(Errno::EPERM) | Err(Errno::ENOSYS) => {
                    tracing::info!("process_vm_readv refused, falling back to the slow memory read");
                    self.use_fast_path = false;
                }
                Err(e) => return Err(DumpError::NixError(e)),
            }
        }

        self.read_slow(address, buf)
    }

    fn read_slow(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError> {
        if self.mem_file.is_none() {
            let path = format!("/proc/{}/mem", self.pid);
            tracing::debug!("Opening {path}");
            self.mem_file = Some(File::open(path)?);
        }
        let Some(file) = &self.mem_file else {
            return Err(DumpError::InternalError("memory file is not open"));
        };

        let mut total = 0;
        while total < buf.len() {
            match file.read_at(&mut buf[total..], address + total as u64) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(e) if total == 0 => return Err(DumpError::IoError(e)),
                Err(_) => break,
            }
        }
        Ok(total)
    }
}

/// Page residency from `/proc/<pid>/pagemap`. Each page has a 64-bit entry,
/// bit 63 tells if the page is present in RAM.
pub(crate) struct PageMap {
    file: Option<File>,
    page_size: u64,
}

const PAGEMAP_PRESENT: u64 = 1 << 63;

impl PageMap {
    pub fn open(pid: Pid, page_size: u64) -> Self {
        let path = format!("/proc/{pid}/pagemap");
        let file = match File::open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Cannot open {path}, {e}; all pages are treated as resident");
                None
            }
        };
        Self { file, page_size }
    }

    pub fn is_resident(&self, address: u64) -> bool {
        let Some(file) = &self.file else {
            return true;
        };
        let mut entry = [0_u8; 8];
        match file.read_exact_at(&mut entry, (address / self.page_size) * 8) {
            Ok(()) => u64::from_le_bytes(entry) & PAGEMAP_PRESENT != 0,
            Err(e) => {
                tracing::trace!("Reading the page map entry for 0x{address:x} failed, {e}");
                true
            }
        }
    }
}

/// The `process_vm_readv` system call might be unavailable. An extra check is made to be
/// sure the ABI works.
pub(crate) fn process_vm_readv_works() -> bool {
    let probe_in = [0xc1c2c3c4c5c6c7c8_u64];
    let mut probe_out = 0u64.to_le_bytes();

    let result = process_vm_readv(
        nix::unistd::getpid(),
        &mut [IoSliceMut::new(&mut probe_out)],
        &[RemoteIoVec {
            base: probe_in.as_ptr() as usize,
            len: std::mem::size_of_val(&probe_in),
        }],
    );

    if let Err(e) = result {
        tracing::debug!("process_vm_readv has not succeeded, error {e:?}, won't be using it");
        return false;
    }

    if probe_in[0] != u64::from_le_bytes(probe_out) {
        tracing::debug!(
            "process_vm_readv did not return expected data: {probe_in:x?} != {probe_out:x?}, won't be using it"
        );
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_own_memory() {
        let data = *b"0123456789abcdef";
        let mut reader = MemoryReader::new(nix::unistd::getpid());
        let mut buf = [0_u8; 16];
        let read = reader.read(data.as_ptr() as u64, &mut buf).unwrap();
        assert_eq!(read, 16);
        assert_eq!(buf, data);
        assert_eq!(reader.read(data.as_ptr() as u64, &mut []).unwrap(), 0);
    }

    #[test]
    fn slow_path_reads_own_memory() {
        let data = [0x5a_u8; 32];
        let mut reader = MemoryReader {
            pid: nix::unistd::getpid(),
            mem_file: None,
            use_fast_path: false,
        };
        let mut buf = [0_u8; 32];
        assert_eq!(reader.read(data.as_ptr() as u64, &mut buf).unwrap(), 32);
        assert_eq!(buf, data);
    }

    #[test]
    fn stack_of_the_test_is_resident() {
        let local = 42_u64;
        let page_size = super::super::page_size();
        let map = PageMap::open(nix::unistd::getpid(), page_size);
        assert!(map.is_resident(&local as *const u64 as u64));
    }
}
