// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to the target process provided by the operating system.

use crate::arch::ArchState;
use crate::elf::Elf64_Auxv;
use crate::error::DumpError;
use crate::memory::MemoryRegion;

#[cfg(target_os = "linux")]
pub mod linux;

/// Status of a suspended thread.
#[derive(Debug, Clone)]
pub struct ThreadStatus {
    pub tid: i32,
    pub ppid: i32,
    pub tgid: i32,
    pub arch_state: ArchState,
}

/// Crash parameters some platforms record alongside a crash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrashParameters {
    pub exception_type: u32,
    pub os_version: String,
    pub system_model: String,
    pub system_manufacturer: String,
}

/// Operations the dump pipeline needs from the platform. One instance
/// serves one target process.
pub trait PlatformProcessInspector {
    /// Process id of the target
    fn pid(&self) -> i32;

    /// Page size of the target
    fn page_size(&self) -> u64;

    /// Short name of the target process
    fn process_name(&mut self) -> Result<String, DumpError>;

    /// Stops every thread of the target and returns their ids.
    fn enumerate_and_suspend_threads(&mut self) -> Result<Vec<i32>, DumpError>;

    /// Registers and identity of a thread suspended earlier.
    fn thread_status(&mut self, tid: i32) -> Result<ThreadStatus, DumpError>;

    fn read_aux_vector(&mut self) -> Result<Vec<Elf64_Auxv>, DumpError>;

    /// Every mapping of the target, sorted by address
    fn memory_mappings(&mut self) -> Result<Vec<MemoryRegion>, DumpError>;

    /// Reads target memory. Returns the number of bytes read, which is
    /// smaller than the buffer when the read crosses into unreadable memory.
    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError>;

    /// Whether the page containing `address` is resident, without faulting
    /// it in.
    fn is_page_resident(&mut self, address: u64) -> bool;

    fn crash_parameters(&self) -> Option<CrashParameters> {
        None
    }

    /// Lets the target continue. Safe to call more than once.
    fn resume(&mut self);
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory target for unit tests.

    use super::*;
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use std::collections::HashSet;
    use std::rc::Rc;

    pub(crate) const PAGE: u64 = 0x1000;

    #[derive(Default)]
    pub(crate) struct FakeProcess {
        pub pages: BTreeMap<u64, Vec<u8>>,
        pub non_resident: HashSet<u64>,
        pub mappings: Vec<MemoryRegion>,
        pub threads: Vec<ThreadStatus>,
        pub auxv: Vec<Elf64_Auxv>,
        /// Shared so tests can observe it once the process is boxed
        pub resumed: Rc<Cell<usize>>,
    }

    impl FakeProcess {
        /// Stores `bytes` at `address`, allocating zeroed pages as needed.
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

        pub fn write_u64(&mut self, address: u64, value: u64) {
            self.write(address, &value.to_le_bytes());
        }

        /// Makes `[start, end)` readable and zeroed.
        pub fn map(&mut self, start: u64, end: u64) {
            let mut page = start & !(PAGE - 1);
            while page < end {
                self.pages.entry(page).or_insert_with(|| vec![0; PAGE as usize]);
                page += PAGE;
            }
        }
    }

    impl PlatformProcessInspector for FakeProcess {
        fn pid(&self) -> i32 {
            100
        }

        fn page_size(&self) -> u64 {
            PAGE
        }

        fn process_name(&mut self) -> Result<String, DumpError> {
            Ok("fake".to_owned())
        }

        fn enumerate_and_suspend_threads(&mut self) -> Result<Vec<i32>, DumpError> {
            Ok(self.threads.iter().map(|t| t.tid).collect())
        }

        fn thread_status(&mut self, tid: i32) -> Result<ThreadStatus, DumpError> {
            self.threads
                .iter()
                .find(|t| t.tid == tid)
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
            for (i, byte) in buf.iter_mut().enumerate() {
                let at = address + i as u64;
                match self.pages.get(&(at & !(PAGE - 1))) {
                    Some(page) => *byte = page[(at & (PAGE - 1)) as usize],
                    None if i == 0 => return Err(DumpError::NixError(nix::Error::EFAULT)),
                    None => return Ok(i),
                }
            }
            Ok(buf.len())
        }

        fn is_page_resident(&mut self, address: u64) -> bool {
            let page = address & !(PAGE - 1);
            self.pages.contains_key(&page) && !self.non_resident.contains(&page)
        }

        fn resume(&mut self) {
            self.resumed.set(self.resumed.get() + 1);
        }
    }
}
