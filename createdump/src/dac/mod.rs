// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bridge to the data access service that understands the managed runtime.
//!
//! The service is driven through two sides:
//! * [`DataTarget`] is what the service calls back into: it pulls memory
//!   of the target and pushes regions it wants in the dump,
//! * [`DataAccessService`] and [`ManagedStackWalker`] are what the dump
//!   pipeline asks of the service.
//!
//! Every memory access the service makes goes through [`ProcessMemory`],
//! so whatever it reads ends up in the dump as well.

pub mod ffi;

use crate::arch;
use crate::arch::ArchState;
use crate::error::DumpError;
use crate::memory::ProcessMemory;
use crate::modules::ManagedModuleDetails;
use crate::modules::ModuleCatalog;
use crate::options::AppModel;
use crate::options::CreateDumpOptions;
use crate::options::DumpType;
use std::path::Path;
use std::path::PathBuf;

/// File name of the data access component, found next to the runtime
pub const DATA_ACCESS_MODULE_NAME: &str = "libmscordaccore.so";

pub const IMAGE_FILE_MACHINE_AMD64: u32 = 0x8664;
pub const IMAGE_FILE_MACHINE_ARM64: u32 = 0xaa64;

/// Machine type as the data access service knows it
pub fn machine_type() -> u32 {
    match arch::ARCH_NAME {
        "arm64" => IMAGE_FILE_MACHINE_ARM64,
        _ => IMAGE_FILE_MACHINE_AMD64,
    }
}

/// Callbacks the data access service uses to reach the target.
pub trait DataTarget {
    fn machine_type(&self) -> u32;

    fn pointer_size(&self) -> u32;

    /// Reads target memory, the number of bytes read might be short.
    fn read_virtual(&mut self, address: u64, buffer: &mut [u8]) -> Result<usize, DumpError>;

    /// Asks for a range to be part of the dump. Always succeeds.
    fn request_memory_region(&mut self, address: u64, size: u64) -> bool;

    /// Base address of the runtime's primary module
    fn runtime_base_address(&self) -> u64;

    fn log(&mut self, message: &str);
}

/// The [`DataTarget`] of a dump run.
pub struct CrashDataTarget<'a> {
    memory: &'a mut ProcessMemory,
    runtime_base_address: u64,
}

impl<'a> CrashDataTarget<'a> {
    pub fn new(memory: &'a mut ProcessMemory, runtime_base_address: u64) -> Self {
        Self {
            memory,
            runtime_base_address,
        }
    }
}

impl DataTarget for CrashDataTarget<'_> {
    fn machine_type(&self) -> u32 {
        machine_type()
    }

    fn pointer_size(&self) -> u32 {
        std::mem::size_of::<u64>() as u32
    }

    fn read_virtual(&mut self, address: u64, buffer: &mut [u8]) -> Result<usize, DumpError> {
        self.memory.read(address, buffer)
    }

    fn request_memory_region(&mut self, address: u64, size: u64) -> bool {
        self.memory.insert_region(address, size);
        true
    }

    fn runtime_base_address(&self) -> u64 {
        self.runtime_base_address
    }

    fn log(&mut self, message: &str) {
        tracing::trace!(target: "createdump::dac", "{}", message);
    }
}

/// How much of its data the service should report for a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEnumeration {
    Mini,
    Heap,
    /// Coarse heap enumeration, faster with a larger result
    FastHeap,
    Triage,
}

impl MemoryEnumeration {
    /// Enumeration for a dump type, `None` for full dumps which need none.
    pub fn for_dump(dump_type: DumpType, fast_heap_dumps: bool) -> Option<Self> {
        match dump_type {
            DumpType::Mini => Some(MemoryEnumeration::Mini),
            DumpType::Heap if fast_heap_dumps => Some(MemoryEnumeration::FastHeap),
            DumpType::Heap => Some(MemoryEnumeration::Heap),
            DumpType::Triage => Some(MemoryEnumeration::Triage),
            DumpType::Full => None,
        }
    }
}

/// A module the runtime has loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedModule {
    pub base_address: u64,
    pub size: u64,
    /// Generated at run time, there is no image
    pub is_dynamic: bool,
    /// Loaded from a byte array rather than a file
    pub is_in_memory: bool,
    pub file_name: String,
    /// Service handle for detail queries
    pub handle: u64,
}

/// Exception a managed thread is processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedException {
    pub object_address: u64,
    pub hresult: Option<u32>,
    pub type_name: Option<String>,
}

/// Which exception of a thread to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionSlot {
    Current,
    Last,
}

/// A frame reported by a managed stack walk. The details are resolved on
/// a best-effort basis, any of them might be missing.
#[derive(Debug, Clone)]
pub struct ManagedFrame {
    pub context: ArchState,
    pub module_base: Option<u64>,
    pub token: Option<u32>,
    pub il_offset: Option<u32>,
    pub method_start: Option<u64>,
    pub method_name: Option<String>,
}

/// Walks the managed frames of one thread, innermost first.
pub trait ManagedStackWalker {
    fn exception(&mut self, target: &mut dyn DataTarget, slot: ExceptionSlot) -> Option<ManagedException>;

    fn next_frame(&mut self, target: &mut dyn DataTarget) -> Option<ManagedFrame>;
}

/// The data access service of the runtime.
pub trait DataAccessService {
    fn enumerate_modules(&mut self, target: &mut dyn DataTarget) -> Result<Vec<ManagedModule>, DumpError>;

    fn module_details(&mut self, target: &mut dyn DataTarget, handle: u64) -> Result<ManagedModuleDetails, DumpError>;

    /// Reports, through [`DataTarget::request_memory_region`], the runtime
    /// data needed to inspect the dump.
    fn enumerate_memory_regions(&mut self, target: &mut dyn DataTarget, kind: MemoryEnumeration) -> Result<(), DumpError>;

    /// Stack walker of a managed thread, `None` for threads unknown to the
    /// runtime.
    fn stack_walker(&mut self, target: &mut dyn DataTarget, tid: i32) -> Option<Box<dyn ManagedStackWalker>>;
}

/// Finds and loads the data access service.
pub trait DataAccessLocator {
    /// `component_path` is where the component is expected, next to the
    /// runtime.
    fn locate(&self, component_path: &Path) -> Result<Box<dyn DataAccessService>, DumpError>;
}

/// Locator for targets inspected without managed insight.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDataAccess;

impl DataAccessLocator for NoDataAccess {
    fn locate(&self, component_path: &Path) -> Result<Box<dyn DataAccessService>, DumpError> {
        tracing::debug!("No data access for {}", component_path.display());
        Err(DumpError::InternalError("data access is not available"))
    }
}

/// The runtime of the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeModule {
    pub base_address: u64,
    pub path: PathBuf,
}

/// Owns the data access service of a dump run. All failures are soft: an
/// unavailable service leaves a native-only view of the target.
#[derive(Default)]
pub struct DataAccessBridge {
    service: Option<Box<dyn DataAccessService>>,
    runtime_base_address: u64,
}

impl DataAccessBridge {
    /// Bridge without a service.
    pub fn unavailable() -> Self {
        Self::default()
    }

    /// Loads the service for `runtime`, if the options call for one.
    pub fn initialize(
        options: &CreateDumpOptions,
        runtime: Option<&RuntimeModule>,
        locator: &dyn DataAccessLocator,
    ) -> Self {
        match options.app_model {
            AppModel::NativeAot => {
                tracing::info!("Ahead-of-time compiled application, no data access");
                return Self::unavailable();
            }
            AppModel::SingleFile if options.dump_type == DumpType::Full => {
                tracing::info!("Full dump of a single-file application, no data access");
                return Self::unavailable();
            }
            _ => {}
        }

        let Some(runtime) = runtime else {
            tracing::warn!("Runtime module {} not found", options.runtime_module_name);
            return Self::unavailable();
        };

        let component_path = runtime
            .path
            .parent()
            .map(|dir| dir.join(DATA_ACCESS_MODULE_NAME))
            .unwrap_or_else(|| PathBuf::from(DATA_ACCESS_MODULE_NAME));

        match locator.locate(&component_path) {
            Ok(service) => {
                tracing::info!(
                    "Data access initialized from {}, runtime at 0x{:x}",
                    component_path.display(),
                    runtime.base_address
                );
                Self {
                    service: Some(service),
                    runtime_base_address: runtime.base_address,
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Data access {} unavailable, {}; continuing without managed information",
                    component_path.display(),
                    e
                );
                Self::unavailable()
            }
        }
    }

    /// Bridge to an already loaded service.
    pub fn with_service(service: Box<dyn DataAccessService>, runtime_base_address: u64) -> Self {
        Self {
            service: Some(service),
            runtime_base_address,
        }
    }

    pub fn is_available(&self) -> bool {
        self.service.is_some()
    }

    pub fn runtime_base_address(&self) -> u64 {
        self.runtime_base_address
    }

    /// Registers the managed modules with `modules`. Dynamic modules are
    /// skipped, failures only skip the module at hand.
    pub fn enumerate_managed_modules(&mut self, memory: &mut ProcessMemory, modules: &mut ModuleCatalog) {
        let Some(service) = self.service.as_mut() else {
            return;
        };

        let managed = {
            let mut target = CrashDataTarget::new(memory, self.runtime_base_address);
            match service.enumerate_modules(&mut target) {
                Ok(managed) => managed,
                Err(e) => {
                    tracing::warn!("Enumerating managed modules failed, {}", e);
                    return;
                }
            }
        };

        tracing::info!("Enumerating {} managed modules", managed.len());

        for module in managed {
            if module.is_dynamic {
                tracing::debug!("Skipping dynamic module {}", module.file_name);
                continue;
            }
            if module.base_address == 0 {
                tracing::debug!("Skipping module {} without image", module.file_name);
                continue;
            }

            let details = {
                let mut target = CrashDataTarget::new(memory, self.runtime_base_address);
                match service.module_details(&mut target, module.handle) {
                    Ok(details) => Some(details),
                    Err(e) => {
                        tracing::warn!("Details of module {} unavailable, {}", module.file_name, e);
                        None
                    }
                }
            };

            tracing::debug!(
                "Managed module 0x{:x} size 0x{:x}{} {}",
                module.base_address,
                module.size,
                if module.is_in_memory { " in memory" } else { "" },
                module.file_name
            );

            modules.add_or_replace_mapping(module.base_address, module.size, &module.file_name, memory);
            modules.add_module_info(true, module.base_address, details, &module.file_name, memory);
        }
    }

    /// Lets the service add the runtime data structures to the dump.
    pub fn enumerate_memory_regions(&mut self, memory: &mut ProcessMemory, kind: MemoryEnumeration) {
        let Some(service) = self.service.as_mut() else {
            return;
        };
        tracing::info!("Gathering runtime memory, {:?}", kind);
        let mut target = CrashDataTarget::new(memory, self.runtime_base_address);
        if let Err(e) = service.enumerate_memory_regions(&mut target, kind) {
            tracing::warn!("Enumerating runtime memory failed, {}", e);
        }
    }

    pub fn stack_walker(&mut self, memory: &mut ProcessMemory, tid: i32) -> Option<Box<dyn ManagedStackWalker>> {
        let service = self.service.as_mut()?;
        let mut target = CrashDataTarget::new(memory, self.runtime_base_address);
        service.stack_walker(&mut target, tid)
    }

    /// Current exception of the walked thread, or the last one if there is
    /// none in flight.
    pub fn exception_info(
        &self,
        memory: &mut ProcessMemory,
        walker: &mut dyn ManagedStackWalker,
    ) -> Option<ManagedException> {
        let mut target = CrashDataTarget::new(memory, self.runtime_base_address);
        walker
            .exception(&mut target, ExceptionSlot::Current)
            .or_else(|| walker.exception(&mut target, ExceptionSlot::Last))
    }

    pub fn next_frame(&self, memory: &mut ProcessMemory, walker: &mut dyn ManagedStackWalker) -> Option<ManagedFrame> {
        let mut target = CrashDataTarget::new(memory, self.runtime_base_address);
        walker.next_frame(&mut target)
    }
}
