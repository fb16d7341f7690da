// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This module contains the functionality for
//! inspecting a process on Linux systems.

mod memory;
mod process;
pub mod ptrace;

use self::memory::MemoryReader;
use self::memory::PageMap;
use self::process::get_thread_ids;
use self::ptrace::ptrace_interrupt;
use super::PlatformProcessInspector;
use super::ThreadStatus;
use crate::elf::Elf64_Auxv;
use crate::error::DumpError;
use crate::memory::MemoryRegion;
use nix::sys;
use nix::sys::ptrace::seize;
use nix::sys::ptrace::Options;
use nix::sys::wait::waitpid;
use nix::unistd::sysconf;
use nix::unistd::Pid;
use nix::unistd::SysconfVar;

/// Page size of this system
pub fn page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(s)) => s as u64,
        _ => 0x1000_u64,
    }
}

/// Inspects a live process through procfs and the process trace API.
///
/// Threads are seized when enumerated and detached either by
/// [`PlatformProcessInspector::resume`] or when the inspector is dropped.
pub struct LinuxInspector {
    pid: Pid,
    seized: Vec<Pid>,
    reader: MemoryReader,
    page_map: PageMap,
    page_size: u64,
}

impl LinuxInspector {
    /// Creates an inspector for the process `pid`. Nothing is stopped yet.
    pub fn new(pid: i32) -> Result<Self, DumpError> {
        let pid = Pid::from_raw(pid);

        // Guard against calling for itself. Fail early as seizing the threads
        // would fail with -EPERM later.
        if pid == nix::unistd::getpid() {
            return Err(DumpError::CantDumpItself);
        }

        let page_size = page_size();
        Ok(Self {
            pid,
            seized: Vec::new(),
            reader: MemoryReader::new(pid),
            page_map: PageMap::open(pid, page_size),
            page_size,
        })
    }

    fn seize_thread(&mut self, tid: Pid) -> Result<(), DumpError> {
        tracing::debug!("Seizing thread {}", tid);

        if let Err(e) = seize(tid, Options::empty()) {
            tracing::error!("Seizing thread {} failed, error {}", tid, e);
            return Err(DumpError::NixError(e));
        }
        self.seized.push(tid);

        tracing::debug!("Interrupting thread {}", tid);

        ptrace_interrupt(tid)?;

        tracing::debug!("Waiting for thread {} to stop", tid);

        match waitpid(tid, None) {
            Ok(s) => {
                tracing::debug!("Thread {} stopped, status {:?}", tid, s);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Waiting for thread {} failed, error {}", tid, e);
                Err(DumpError::NixError(e))
            }
        }
    }
}

impl PlatformProcessInspector for LinuxInspector {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn process_name(&mut self) -> Result<String, DumpError> {
        process::get_process_name(self.pid)
    }

    fn enumerate_and_suspend_threads(&mut self) -> Result<Vec<i32>, DumpError> {
        let tids = get_thread_ids(self.pid)?;

        if tids.binary_search(&nix::unistd::gettid()).is_ok() {
            return Err(DumpError::CantDumpItself);
        };

        tracing::info!("Attaching to {} threads of process {}", tids.len(), self.pid);

        for tid in &tids {
            self.seize_thread(*tid)?;
        }

        // There is a race here:
        //  1) us stopping threads,
        //  2) the process that might be creating new ones,
        //  3) the existing threads might exit.
        // See if the threads ids are still the same. Not bullet-proof as thread ids
        // might be re-used.
        if tids != get_thread_ids(self.pid)? {
            return Err(DumpError::RaceTryAgain);
        }

        Ok(tids.iter().map(|tid| tid.as_raw()).collect())
    }

    fn thread_status(&mut self, tid: i32) -> Result<ThreadStatus, DumpError> {
        let tid = Pid::from_raw(tid);
        if !self.seized.contains(&tid) {
            return Err(DumpError::UnknownThread(tid.as_raw()));
        }

        let arch_state = ptrace::get_arch_state(tid)?;
        let status = ThreadStatus {
            tid: tid.as_raw(),
            ppid: process::get_thread_ppid(self.pid, tid)?,
            tgid: process::get_thread_tgid(self.pid, tid)?,
            arch_state,
        };
        tracing::debug!("Thread state: {:x?}", status);
        Ok(status)
    }

    fn read_aux_vector(&mut self) -> Result<Vec<Elf64_Auxv>, DumpError> {
        let aux_vector = process::get_aux_vector(self.pid)?;
        tracing::debug!("Auxiliary vector {:x?}", aux_vector);
        Ok(aux_vector)
    }

    fn memory_mappings(&mut self) -> Result<Vec<MemoryRegion>, DumpError> {
        process::get_memory_mappings(self.pid)
    }

    fn read_memory(&mut self, address: u64, buf: &mut [u8]) -> Result<usize, DumpError> {
        self.reader.read(address, buf)
    }

    fn is_page_resident(&mut self, address: u64) -> bool {
        self.page_map.is_resident(address)
    }

    fn resume(&mut self) {
        if self.seized.is_empty() {
            return;
        }

        tracing::info!(
            "Detaching from {} threads of process {}",
            self.seized.len(),
            self.pid
        );

        for tid in self.seized.drain(..) {
            match sys::ptrace::detach(tid, None) {
                Ok(_) => {
                    tracing::debug!("Thread {} resumed", tid);
                }
                Err(e) => {
                    tracing::error!("Thread {} failed to resume: {:?}", tid, e);
                }
            };
        }
    }
}

impl Drop for LinuxInspector {
    fn drop(&mut self) {
        self.resume();
    }
}
