// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Gathers everything a dump of the target is made of: threads, modules and
//! the set of memory regions to write out.
//!
//! The target must stay suspended from [`CrashInfo::enumerate_and_suspend_threads`]
//! until the dump is written. [`CrashInfo::cleanup_and_resume`] lets it
//! continue and runs at the latest when the `CrashInfo` is dropped.

use crate::dac::DataAccessBridge;
use crate::dac::DataAccessLocator;
use crate::dac::MemoryEnumeration;
use crate::dac::RuntimeModule;
use crate::elf::Elf64_Auxv;
use crate::elfinfo;
use crate::error::DumpError;
use crate::memory::MemoryRegion;
use crate::memory::MemoryRegionSet;
use crate::memory::ProcessMemory;
use crate::memory::RegionFlags;
use crate::modules::ModuleCatalog;
use crate::options::AppModel;
use crate::options::CreateDumpOptions;
use crate::options::DumpType;
use crate::platform::PlatformProcessInspector;
use crate::thread::ThreadInfo;
use crate::unwind::NativeUnwinder;
use crate::unwind::ThreadUnwinder;
use std::path::PathBuf;

/// Address of the page carrying the diagnostics header, a fixed location
/// where debuggers look for it.
pub const SPECIAL_DIAGINFO_ADDRESS: u64 = 0x7fff_fff1_0000;
pub const SPECIAL_DIAGINFO_SIZE: u64 = 0x1000;

/// Progress of the gathering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Created,
    ThreadsEnumerated,
    AuxvAndMapsGathered,
    DataAccessInitialized,
    ModulesEnumerated,
    SpecialRegionAdded,
    ThreadsUnwound,
    FinalRegionSetAssembled,
    Done,
}

/// Crash information of one target process.
pub struct CrashInfo {
    options: CreateDumpOptions,
    memory: ProcessMemory,
    modules: ModuleCatalog,
    other_mappings: MemoryRegionSet,
    thread_ids: Vec<i32>,
    threads: Vec<ThreadInfo>,
    auxv: Vec<Elf64_Auxv>,
    process_name: String,
    state: PipelineState,
    has_special_region: bool,
    resumed: bool,
}

fn is_never_dumped(name: &str) -> bool {
    name == "[vvar]" || name == "[vsyscall]" || name.starts_with("/dev/")
}

impl CrashInfo {
    pub fn new(options: CreateDumpOptions, inspector: Box<dyn PlatformProcessInspector>) -> Self {
        Self {
            options,
            memory: ProcessMemory::new(inspector),
            modules: ModuleCatalog::new(),
            other_mappings: MemoryRegionSet::new(),
            thread_ids: Vec::new(),
            threads: Vec::new(),
            auxv: Vec::new(),
            process_name: String::new(),
            state: PipelineState::Created,
            has_special_region: false,
            resumed: false,
        }
    }

    fn advance(&mut self, state: PipelineState) {
        tracing::debug!("Crash info {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Stops every thread of the target. Nothing read before this can be
    /// trusted.
    pub fn enumerate_and_suspend_threads(&mut self) -> Result<(), DumpError> {
        if self.state != PipelineState::Created {
            return Err(DumpError::InternalError("threads are already suspended"));
        }
        self.thread_ids = self.memory.inspector_mut().enumerate_and_suspend_threads()?;
        tracing::info!(
            "Suspended {} threads of process {}",
            self.thread_ids.len(),
            self.pid()
        );
        self.advance(PipelineState::ThreadsEnumerated);
        Ok(())
    }

    /// Collects threads, modules and memory regions of the suspended target.
    pub fn gather_crash_info(
        &mut self,
        locator: &dyn DataAccessLocator,
        unwinder: &mut dyn NativeUnwinder,
    ) -> Result<(), DumpError> {
        if self.state != PipelineState::ThreadsEnumerated {
            return Err(DumpError::InternalError("threads must be suspended first"));
        }

        for tid in self.thread_ids.clone() {
            let status = self.memory.inspector_mut().thread_status(tid)?;
            self.threads.push(ThreadInfo::new(status));
        }

        self.process_name = self.memory.inspector_mut().process_name()?;
        self.auxv = self.memory.inspector_mut().read_aux_vector()?;
        self.enumerate_memory_mappings()?;
        let executable_base =
            elfinfo::enumerate_elf_info(&mut self.memory, &mut self.modules, &self.auxv, &self.process_name)?;
        self.advance(PipelineState::AuxvAndMapsGathered);

        let runtime = self.runtime_module(executable_base);
        let mut bridge = DataAccessBridge::initialize(&self.options, runtime.as_ref(), locator);
        self.advance(PipelineState::DataAccessInitialized);

        bridge.enumerate_managed_modules(&mut self.memory, &mut self.modules);
        self.advance(PipelineState::ModulesEnumerated);

        self.insert_special_region();
        self.advance(PipelineState::SpecialRegionAdded);

        {
            let mut thread_unwinder = ThreadUnwinder {
                memory: &mut self.memory,
                modules: &self.modules,
                native: unwinder,
                bridge: &mut bridge,
                record_frames: self.options.gather_frames(),
            };
            for thread in &mut self.threads {
                thread_unwinder.unwind_thread(thread)?;
            }
        }
        self.advance(PipelineState::ThreadsUnwound);

        self.assemble_regions(&mut bridge);
        self.advance(PipelineState::FinalRegionSetAssembled);

        tracing::info!(
            "Gathered {} threads, {} modules, {} regions of {} bytes",
            self.threads.len(),
            self.modules.len(),
            self.memory.regions().len(),
            self.memory.regions().total_size()
        );
        Ok(())
    }

    /// Sorts the mappings of the target into module and other mappings.
    fn enumerate_memory_mappings(&mut self) -> Result<(), DumpError> {
        let mappings = self.memory.inspector_mut().memory_mappings()?;
        let mut all = MemoryRegionSet::new();
        let mut vdso = None;

        for region in mappings {
            if !all.insert_unchecked(region.clone()) {
                tracing::warn!("Overlapping mapping {:?} ignored", region);
                continue;
            }
            match region.file_name.as_deref() {
                Some(name) if is_never_dumped(name) => {
                    tracing::trace!("Not dumping {:?}", region);
                }
                Some("[vdso]") => {
                    vdso = Some(region.clone());
                    self.modules.add_mapping(region);
                }
                Some(name) if name.starts_with('/') => {
                    self.modules.add_mapping(region);
                }
                _ => {
                    self.other_mappings.insert_unchecked(region);
                }
            }
        }

        tracing::info!(
            "{} mappings, {} module mappings, {} other mappings",
            all.len(),
            self.modules.mappings().len(),
            self.other_mappings.len()
        );
        self.memory.set_all_mappings(all);

        if let Some(vdso) = vdso {
            self.memory.insert_mapping(&vdso);
        }
        Ok(())
    }

    fn runtime_module(&self, executable_base: u64) -> Option<RuntimeModule> {
        let base_address = match self.options.app_model {
            AppModel::SingleFile => executable_base,
            _ => self.modules.get_base_address_by_name(&self.options.runtime_module_name)?,
        };
        let module = self.modules.get_by_base_address(base_address)?;
        Some(RuntimeModule {
            base_address,
            path: PathBuf::from(&module.name),
        })
    }

    fn insert_special_region(&mut self) {
        let region = MemoryRegion::new(
            RegionFlags::READ | RegionFlags::PRIVATE | RegionFlags::MEMORY_BACKED,
            SPECIAL_DIAGINFO_ADDRESS,
            SPECIAL_DIAGINFO_ADDRESS + SPECIAL_DIAGINFO_SIZE,
        );
        self.has_special_region = self.memory.insert_unchecked(region);
        if !self.has_special_region {
            tracing::warn!(
                "Diagnostics page at 0x{:x} overlaps gathered memory",
                SPECIAL_DIAGINFO_ADDRESS
            );
        }
    }

    /// Adds what the dump type asks for, then merges the regions.
    fn assemble_regions(&mut self, bridge: &mut DataAccessBridge) {
        let dump_type = self.options.dump_type;
        tracing::info!("Assembling regions for a {}", dump_type.name());

        if dump_type == DumpType::Full {
            for mapping in self.modules.mappings().iter() {
                self.memory.insert_mapping(mapping);
            }
            for mapping in self.other_mappings.iter() {
                if !mapping.permissions().is_empty() {
                    self.memory.insert_mapping(mapping);
                }
            }
        } else {
            if let Some(kind) = MemoryEnumeration::for_dump(dump_type, self.options.fast_heap_dumps) {
                bridge.enumerate_memory_regions(&mut self.memory, kind);
            }

            if dump_type == DumpType::Heap {
                let read_write = RegionFlags::READ | RegionFlags::WRITE;
                for mapping in self.other_mappings.iter() {
                    let permissions = mapping.permissions();
                    if permissions == read_write || permissions == RegionFlags::PERMISSIONS {
                        self.memory.insert_mapping(mapping);
                    }
                }
            }

            for thread in &self.threads {
                thread.get_thread_stack(&self.other_mappings, &mut self.memory);
            }
        }

        self.memory.combine_regions();
    }

    /// Lets the target continue. Only the first call has an effect.
    pub fn cleanup_and_resume(&mut self) {
        if self.resumed {
            return;
        }
        self.resumed = true;
        tracing::info!("Resuming process {}", self.pid());
        self.memory.inspector_mut().resume();
    }

    /// Marks the crash information as completely written.
    pub fn finish(&mut self) {
        self.cleanup_and_resume();
        self.advance(PipelineState::Done);
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn options(&self) -> &CreateDumpOptions {
        &self.options
    }

    pub fn pid(&self) -> i32 {
        self.memory.inspector().pid()
    }

    /// Parent process id, from the main thread if it is known
    pub fn ppid(&self) -> i32 {
        self.main_thread().map_or(0, |thread| thread.ppid)
    }

    pub fn tgid(&self) -> i32 {
        self.main_thread().map_or(self.pid(), |thread| thread.tgid)
    }

    fn main_thread(&self) -> Option<&ThreadInfo> {
        let pid = self.pid();
        self.threads
            .iter()
            .find(|thread| thread.tid == pid)
            .or_else(|| self.threads.first())
    }

    /// Whether the diagnostics page was added to the dump. When it was not,
    /// the target's own memory at its address is dumped instead.
    pub fn has_special_region(&self) -> bool {
        self.has_special_region
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    pub fn modules(&self) -> &ModuleCatalog {
        &self.modules
    }

    pub fn other_mappings(&self) -> &MemoryRegionSet {
        &self.other_mappings
    }

    pub fn auxv(&self) -> &[Elf64_Auxv] {
        &self.auxv
    }

    pub fn memory(&self) -> &ProcessMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut ProcessMemory {
        &mut self.memory
    }

    /// Memory together with the modules, for symbolization.
    pub fn memory_and_modules(&mut self) -> (&mut ProcessMemory, &ModuleCatalog) {
        (&mut self.memory, &self.modules)
    }
}

impl Drop for CrashInfo {
    fn drop(&mut self) {
        self.cleanup_and_resume();
    }
}
