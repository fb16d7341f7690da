// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! JSON crash report written next to the dump.
//!
//! Numbers are written as `0x` prefixed hexadecimal strings.

use crate::arch;
use crate::crashinfo::CrashInfo;
use crate::error::DumpError;
use crate::memory::ProcessMemory;
use crate::modules::ModuleCatalog;
use crate::symbols::DynamicSymbols;
use crate::thread::StackFrame;
use crate::thread::ThreadInfo;
use serde::Serialize;
use serde::Serializer;
use std::collections::HashMap;
use std::io::Write;

pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Number serialized as a hexadecimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hex(pub u64);

impl Serialize for Hex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&format_args!("0x{:x}", self.0))
    }
}

#[derive(Debug, Serialize)]
pub struct CrashReport {
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

#[derive(Debug, Serialize)]
pub struct Payload {
    pub protocol_version: &'static str,
    pub configuration: Configuration,
    pub process_name: String,
    pub threads: Vec<ThreadReport>,
}

#[derive(Debug, Serialize)]
pub struct Configuration {
    pub architecture: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ThreadReport {
    pub is_managed: bool,
    pub crashed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_exception_object: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_exception_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_exception_hresult: Option<Hex>,
    pub native_thread_id: Hex,
    pub ctx: Context,
    pub unmanaged_frames: Vec<FrameReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Context {
    pub ip: Hex,
    pub sp: Hex,
    pub bp: Hex,
}

#[derive(Debug, Default, Serialize)]
pub struct FrameReport {
    pub is_managed: bool,
    pub module_address: Hex,
    pub stack_pointer: Hex,
    pub native_address: Hex,
    pub native_offset: Hex,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub il_offset: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sizeofimage: Option<Hex>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unmanaged_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_module: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Parameters {
    #[serde(rename = "ExceptionType", skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<Hex>,
    #[serde(rename = "OSVersion", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(rename = "SystemModel", skip_serializing_if = "Option::is_none")]
    pub system_model: Option<String>,
    #[serde(rename = "SystemManufacturer", skip_serializing_if = "Option::is_none")]
    pub system_manufacturer: Option<String>,
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_owned())
}

/// Dynamic symbols loaded on first use, per module base.
#[derive(Default)]
struct Symbolizer {
    tables: HashMap<u64, Option<DynamicSymbols>>,
}

impl Symbolizer {
    fn lookup(&mut self, memory: &mut ProcessMemory, modules: &ModuleCatalog, base: u64, address: u64) -> Option<String> {
        let table = self.tables.entry(base).or_insert_with(|| {
            let module = modules.get_by_base_address(base)?;
            DynamicSymbols::load(memory, module)
        });
        table
            .as_ref()
            .and_then(|symbols| symbols.lookup(address))
            .map(|(name, _)| name.to_owned())
    }
}

fn frame_report(
    frame: &StackFrame,
    memory: &mut ProcessMemory,
    modules: &ModuleCatalog,
    symbolizer: &mut Symbolizer,
) -> FrameReport {
    let module = modules.get_by_base_address(frame.module_base_address);
    let mut report = FrameReport {
        is_managed: frame.is_managed,
        module_address: Hex(frame.module_base_address),
        stack_pointer: Hex(frame.stack_pointer),
        native_address: Hex(frame.instruction_pointer),
        native_offset: Hex(u64::from(frame.native_offset)),
        ..Default::default()
    };

    if frame.is_managed {
        report.token = Some(Hex(u64::from(frame.token)));
        report.il_offset = Some(Hex(u64::from(frame.il_offset)));
        report.method_name = frame.method_name.clone();
        if let Some(module) = module {
            report.filename = Some(module.file_name().to_owned());
            report.timestamp = Some(Hex(u64::from(module.time_stamp)));
            report.sizeofimage = Some(Hex(u64::from(module.image_size)));
            report.guid = Some(module.version_id.to_string());
        }
    } else {
        report.native_module = module.map(|module| module.file_name().to_owned());
        report.unmanaged_name = symbolizer.lookup(memory, modules, frame.module_base_address, frame.instruction_pointer);
    }
    report
}

fn thread_report(
    thread: &ThreadInfo,
    crashed: bool,
    memory: &mut ProcessMemory,
    modules: &ModuleCatalog,
    symbolizer: &mut Symbolizer,
) -> ThreadReport {
    if let Some(repeated) = thread.repeated_frames() {
        tracing::info!(
            "Thread {}: frames from sp 0x{:x} repeat about {} times",
            thread.tid,
            repeated.begin,
            repeated.count
        );
    }

    ThreadReport {
        is_managed: thread.is_managed,
        crashed,
        managed_exception_object: thread.exception_object.map(Hex),
        managed_exception_type: thread.exception_type.clone(),
        managed_exception_hresult: thread.exception_hresult.map(|hresult| Hex(u64::from(hresult))),
        native_thread_id: Hex(thread.tid as u64),
        ctx: Context {
            ip: Hex(thread.instruction_pointer()),
            sp: Hex(thread.stack_pointer()),
            bp: Hex(thread.frame_pointer()),
        },
        unmanaged_frames: thread
            .frames()
            .map(|frame| frame_report(frame, memory, modules, symbolizer))
            .collect(),
    }
}

impl CrashReport {
    /// Builds the report out of gathered crash information. Symbol lookups
    /// read target memory, but never add to the dump.
    pub fn build(crash_info: &mut CrashInfo) -> Self {
        let crash_thread = crash_info.options().crash_thread;
        let process_name = crash_info.process_name().to_owned();
        let parameters = crash_info
            .memory()
            .inspector()
            .crash_parameters()
            .map(|params| Parameters {
                exception_type: (params.exception_type != 0).then_some(Hex(u64::from(params.exception_type))),
                os_version: non_empty(&params.os_version),
                system_model: non_empty(&params.system_model),
                system_manufacturer: non_empty(&params.system_manufacturer),
            });
        let threads_snapshot = crash_info.threads().to_vec();

        let mut symbolizer = Symbolizer::default();
        let (memory, modules) = crash_info.memory_and_modules();
        let threads = threads_snapshot
            .iter()
            .map(|thread| {
                let crashed = crash_thread == Some(thread.tid);
                thread_report(thread, crashed, memory, modules, &mut symbolizer)
            })
            .collect();

        Self {
            payload: Payload {
                protocol_version: PROTOCOL_VERSION,
                configuration: Configuration {
                    architecture: arch::ARCH_NAME,
                    version: env!("CARGO_PKG_VERSION"),
                },
                process_name,
                threads,
            },
            parameters,
        }
    }

    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), DumpError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}
