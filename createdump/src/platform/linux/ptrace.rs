// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Process trace helpers, not machine-specific ones.

use std::ffi::c_void;
use std::ptr;

use crate::arch;
use crate::arch::ArchComponentState;
use crate::arch::ArchState;
use crate::elf::NT_FPREGSET;
use crate::elf::NT_PRSTATUS;
use crate::error::DumpError;
use nix::sys;
use nix::sys::ptrace::Request;
use nix::sys::ptrace::RequestType;
use nix::unistd::Pid;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

// Large enough for the XSAVE area with AVX-512.
const REG_SET_BUFFER_SIZE: usize = 0x4000;

pub fn ptrace_get_reg_set<T: IntoBytes + FromBytes>(pid: Pid, set: u32) -> Result<Vec<T>, DumpError> {
    let count = REG_SET_BUFFER_SIZE / std::mem::size_of::<T>();
    let mut data: Vec<T> = std::iter::repeat_with(T::new_zeroed).take(count).collect();
    let mut vec = nix::libc::iovec {
        iov_base: data.as_mut_ptr() as *mut c_void,
        iov_len: count * std::mem::size_of::<T>(),
    };

    // SAFETY: the kernel writes at most `iov_len` bytes into the buffer
    // owned by `data` and updates `iov_len` with the size of the set.
    let err = unsafe {
        nix::libc::ptrace(
            Request::PTRACE_GETREGSET as RequestType,
            nix::libc::pid_t::from(pid),
            set as usize as *mut c_void,
            &mut vec as *mut _ as *mut c_void,
        )
    };
    nix::errno::Errno::result(err)?;

    data.truncate(vec.iov_len / std::mem::size_of::<T>());
    Ok(data)
}

pub fn ptrace_interrupt(pid: Pid) -> Result<(), DumpError> {
    // SAFETY: Using FFI with the process trace API, no memory is passed.
    let ret = unsafe {
        nix::errno::Errno::clear();
        nix::libc::ptrace(
            nix::libc::PTRACE_INTERRUPT as sys::ptrace::RequestType,
            nix::libc::pid_t::from(pid),
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    match nix::errno::Errno::result(ret) {
        Ok(..) => Ok(()),
        Err(e) => Err(DumpError::NixError(e)),
    }
}

/// Reads the complete register state of a stopped thread: general purpose
/// registers, then the floating point set and the machine-specific extras.
/// Sets the kernel does not provide are left out.
pub fn get_arch_state(tid: Pid) -> Result<ArchState, DumpError> {
    let gpr_state: Vec<u64> = ptrace_get_reg_set(tid, NT_PRSTATUS)?;
    let mut state = ArchState::from_gprs(gpr_state);

    match ptrace_get_reg_set::<u8>(tid, NT_FPREGSET) {
        Ok(data) => state.components.push(ArchComponentState {
            name: "FPU",
            note_type: NT_FPREGSET,
            note_name: b"CORE",
            data,
        }),
        Err(e) => tracing::warn!("Thread {tid}: floating point registers unavailable, {e}"),
    }

    for &(name, note_type, note_name) in arch::extra_register_sets() {
        match ptrace_get_reg_set::<u8>(tid, note_type) {
            Ok(data) if !data.is_empty() => state.components.push(ArchComponentState {
                name,
                note_type,
                note_name,
                data,
            }),
            Ok(_) => {}
            Err(e) => tracing::debug!("Thread {tid}: register set {name} unavailable, {e}"),
        }
    }

    Ok(state)
}
