// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Options controlling what is gathered and written.

use std::path::PathBuf;

/// Amount of memory included in the dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpType {
    /// Stacks, module headers and what the runtime reports as necessary
    Mini,
    /// Mini plus private read/write memory
    #[default]
    Heap,
    /// Mini with runtime data minimized for triage
    Triage,
    /// Every mapping with any access rights
    Full,
}

impl DumpType {
    pub fn name(self) -> &'static str {
        match self {
            DumpType::Mini => "minidump",
            DumpType::Heap => "minidump with heap",
            DumpType::Triage => "triage minidump",
            DumpType::Full => "full dump",
        }
    }
}

/// How the target application was deployed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppModel {
    #[default]
    Normal,
    /// Runtime and assemblies are bundled into the main executable
    SingleFile,
    /// Ahead-of-time compiled, there is no data access component
    NativeAot,
}

/// Diagnostic output settings.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
}

/// Everything the dump pipeline needs to know about the request.
#[derive(Debug, Clone)]
pub struct CreateDumpOptions {
    pub pid: i32,
    /// Output path, any template is already expanded
    pub dump_path: PathBuf,
    pub dump_type: DumpType,
    pub app_model: AppModel,
    pub crash_report: bool,
    /// Write the crash report only, no core file
    pub crash_report_only: bool,
    pub crash_thread: Option<i32>,
    pub signal: i32,
    pub signal_code: i32,
    pub signal_errno: i32,
    pub signal_address: u64,
    /// Coarse (faster) enumeration of runtime memory for heap dumps
    pub fast_heap_dumps: bool,
    /// File name of the runtime's primary module
    pub runtime_module_name: String,
    pub diagnostics: Diagnostics,
}

impl Default for CreateDumpOptions {
    fn default() -> Self {
        Self {
            pid: 0,
            dump_path: PathBuf::from("/tmp/coredump"),
            dump_type: DumpType::default(),
            app_model: AppModel::default(),
            crash_report: false,
            crash_report_only: false,
            crash_thread: None,
            signal: 0,
            signal_code: 0,
            signal_errno: 0,
            signal_address: 0,
            fast_heap_dumps: false,
            runtime_module_name: String::from("libcoreclr.so"),
            diagnostics: Diagnostics::default(),
        }
    }
}

impl CreateDumpOptions {
    /// Frames are only recorded when somebody is going to read them.
    pub fn gather_frames(&self) -> bool {
        self.crash_report || self.crash_report_only
    }

    /// Path of the crash report written next to the dump
    pub fn crash_report_path(&self) -> PathBuf {
        let mut path = self.dump_path.clone().into_os_string();
        path.push(".crashreport.json");
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_report_sits_next_to_the_dump() {
        let options = CreateDumpOptions {
            dump_path: PathBuf::from("/var/dumps/core.42"),
            ..Default::default()
        };
        assert_eq!(
            options.crash_report_path(),
            PathBuf::from("/var/dumps/core.42.crashreport.json")
        );
        assert!(!options.gather_frames());
        assert_eq!(options.dump_type, DumpType::Heap);
    }
}
