// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Errors that might be seen when gathering crash information and writing dumps.

use thiserror::Error;

/// Error encountered while creating a dump or crash report
#[derive(Debug, Error)]
pub enum DumpError {
    /// Race when seizing threads
    #[error("race when seizing threads")]
    RaceTryAgain,
    /// A process cannot dump itself
    #[error("cannot create a dump for the process itself")]
    CantDumpItself,
    /// A /proc file parsing error
    #[error("/proc parsing error")]
    ProcParsingError,
    /// A /proc file integer parsing error
    #[error("/proc integer parsing error")]
    ProcIntParsingError(#[from] std::num::ParseIntError),
    /// Internal error
    #[error("internal error: {0}")]
    InternalError(&'static str),
    /// OS error
    #[error("OS error: {0}")]
    NixError(#[from] nix::Error),
    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    /// The target returned less data than requested
    #[error("short read at 0x{address:x}: requested {requested} bytes, got {read}")]
    ShortRead {
        /// Address of the read
        address: u64,
        /// Number of bytes requested
        requested: usize,
        /// Number of bytes actually read
        read: usize,
    },
    /// The auxiliary vector lacks an entry needed to walk the loaded images
    #[error("auxiliary vector entry {0} is missing")]
    MissingAuxvEntry(u64),
    /// Unwinding a thread failed
    #[error("unwinding thread {0} failed")]
    UnwindFailed(i32),
    /// Thread was not suspended before use
    #[error("thread {0} is unknown or not suspended")]
    UnknownThread(i32),
    /// Header provided contains unsupported fields
    #[error("header provided contains unsupported fields")]
    UnsupportedHeader,
    /// Options are inconsistent
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    /// Crash report serialization failed
    #[error("crash report serialization failed: {0}")]
    ReportError(#[from] serde_json::Error),
}
