// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A Rust library for creating post-mortem dumps of managed runtime
//! processes: an ELF core dump file with the memory a debugger needs, and
//! optionally a JSON crash report next to it.
//!
//! Example:
//!
//! ```no_run
//! use createdump::create_dump;
//! use createdump::dac::NoDataAccess;
//! use createdump::platform::linux::LinuxInspector;
//! use createdump::unwind::FramePointerUnwinder;
//! use createdump::CreateDumpOptions;
//!
//! let options = CreateDumpOptions {
//!     pid: 1234,
//!     dump_path: "/tmp/coredump.1234".into(),
//!     ..Default::default()
//! };
//! let inspector = LinuxInspector::new(options.pid).unwrap();
//! let outcome = create_dump(&options, Box::new(inspector), &NoDataAccess, &mut FramePointerUnwinder).unwrap();
//! println!("{:?}", outcome);
//! ```

#![cfg(target_os = "linux")]

pub mod arch;
pub mod crashinfo;
pub mod crashreport;
pub mod dac;
pub mod dumpwriter;
pub mod elf;
mod elfinfo;
pub mod error;
pub mod memory;
pub mod modules;
pub mod options;
mod pe;
pub mod platform;
pub mod symbols;
pub mod thread;
pub mod unwind;

pub use crashinfo::CrashInfo;
pub use crashreport::CrashReport;
pub use error::DumpError;
pub use options::AppModel;
pub use options::CreateDumpOptions;
pub use options::Diagnostics;
pub use options::DumpType;
pub use platform::PlatformProcessInspector;

use dac::DataAccessLocator;
use std::fs;
use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;
use unwind::NativeUnwinder;

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutcome {
    /// The core dump file, unless only a crash report was asked for
    pub dump_path: Option<PathBuf>,
    pub dump_size: usize,
    pub crash_report_path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Creates `path` and writes it with `write`. A file that could not be
/// written completely is removed.
fn write_file_or_remove<F>(path: &Path, write: F) -> Result<usize, DumpError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<usize, DumpError>,
{
    let mut writer = BufWriter::new(File::create(path)?);
    let result = write(&mut writer).and_then(|written| {
        writer.flush()?;
        Ok::<_, DumpError>(written)
    });

    if result.is_err() {
        drop(writer);
        tracing::warn!("Removing partially written {}", path.display());
        if let Err(e) = fs::remove_file(path) {
            tracing::warn!("Could not remove {}, {}", path.display(), e);
        }
    }
    result
}

/// Suspends the target, gathers its crash information, writes the dump
/// and the crash report as `options` ask, then lets the target continue.
///
/// The target is resumed exactly once, whether the dump could be written
/// or not.
pub fn create_dump(
    options: &CreateDumpOptions,
    inspector: Box<dyn PlatformProcessInspector>,
    locator: &dyn DataAccessLocator,
    unwinder: &mut dyn NativeUnwinder,
) -> Result<DumpOutcome, DumpError> {
    if options.pid <= 0 {
        return Err(DumpError::InvalidOptions("the process id must be positive"));
    }

    let start = Instant::now();
    let mut options = options.clone();
    if options.crash_report_only {
        options.crash_report = true;
    }

    tracing::info!("Gathering state for process {}", inspector.pid());

    let mut crash_info = CrashInfo::new(options.clone(), inspector);
    crash_info.enumerate_and_suspend_threads()?;
    crash_info.gather_crash_info(locator, unwinder)?;

    let mut outcome = DumpOutcome {
        dump_path: None,
        dump_size: 0,
        crash_report_path: None,
        elapsed: Duration::ZERO,
    };

    if !options.crash_report_only {
        tracing::info!(
            "Writing {} to file {}",
            options.dump_type.name(),
            options.dump_path.display()
        );
        outcome.dump_size = write_file_or_remove(&options.dump_path, |writer| {
            dumpwriter::write_core_dump(writer, &mut crash_info)
        })?;
        outcome.dump_path = Some(options.dump_path.clone());
    }

    if options.crash_report {
        let report = CrashReport::build(&mut crash_info);
        let path = options.crash_report_path();
        write_file_or_remove(&path, |writer| {
            report.write_to(writer)?;
            Ok(0)
        })?;
        outcome.crash_report_path = Some(path);
    }

    crash_info.finish();
    outcome.elapsed = start.elapsed();
    tracing::info!("Dump written in {}ms", outcome.elapsed.as_millis());
    Ok(outcome)
}
