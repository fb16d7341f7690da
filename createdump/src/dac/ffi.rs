// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! C callbacks for data access components loaded as native libraries.
//!
//! Their memory read callback carries no context parameter, so the target
//! it reads from lives in a thread-local slot. The slot is filled by
//! [`with_target`] for the extent of one call into the component and is
//! empty otherwise. Nothing outside this module touches it.

use super::DataTarget;
use std::cell::Cell;
use std::ffi::c_char;
use std::ffi::CStr;
use std::ptr;

pub const S_OK: i32 = 0;
pub const E_FAIL: i32 = 0x8000_4005_u32 as i32;
pub const E_INVALIDARG: i32 = 0x8007_0057_u32 as i32;

type TargetPtr = *mut (dyn DataTarget + 'static);

thread_local! {
    static CURRENT_TARGET: Cell<Option<TargetPtr>> = const { Cell::new(None) };
}

struct RestoreOnDrop(Option<TargetPtr>);

impl Drop for RestoreOnDrop {
    fn drop(&mut self) {
        CURRENT_TARGET.with(|slot| slot.set(self.0));
    }
}

/// Runs `f` with `target` reachable from the callbacks below.
pub fn with_target<R>(target: &mut dyn DataTarget, f: impl FnOnce() -> R) -> R {
    let raw: *mut (dyn DataTarget + '_) = target;
    // SAFETY: only the lifetime bound of the trait object is erased. The
    // pointer is removed from the slot before `target`'s borrow ends, even
    // when `f` unwinds.
    let raw: TargetPtr = unsafe { std::mem::transmute(raw) };
    let _restore = RestoreOnDrop(CURRENT_TARGET.with(|slot| slot.replace(Some(raw))));
    f()
}

fn current<R>(f: impl FnOnce(&mut dyn DataTarget) -> R) -> Option<R> {
    let raw = CURRENT_TARGET.with(|slot| slot.take())?;
    let _restore = RestoreOnDrop(Some(raw));
    // SAFETY: the pointer was stored by `with_target` whose borrow is still
    // active. Taking it out of the slot while in use keeps a nested
    // callback from creating a second mutable reference.
    Some(f(unsafe { &mut *raw }))
}

/// `ReadVirtual` callback.
///
/// # Safety
/// `buffer` must be valid for `size` bytes of writes, `bytes_read` must be
/// null or valid for a write.
pub unsafe extern "C" fn read_virtual(address: u64, buffer: *mut u8, size: u32, bytes_read: *mut u32) -> i32 {
    if !bytes_read.is_null() {
        // SAFETY: checked for null, valid per the contract.
        unsafe { ptr::write(bytes_read, 0) };
    }
    if size == 0 {
        return S_OK;
    }
    if buffer.is_null() {
        return E_INVALIDARG;
    }

    // SAFETY: valid per the contract.
    let buf = unsafe { std::slice::from_raw_parts_mut(buffer, size as usize) };
    match current(|target| target.read_virtual(address, buf)) {
        Some(Ok(read)) if read > 0 => {
            if !bytes_read.is_null() {
                // SAFETY: checked for null, valid per the contract.
                unsafe { ptr::write(bytes_read, read as u32) };
            }
            S_OK
        }
        _ => E_FAIL,
    }
}

/// `EnumMemoryRegion` callback, the region becomes part of the dump.
pub extern "C" fn request_memory_region(address: u64, size: u32) -> i32 {
    match current(|target| target.request_memory_region(address, u64::from(size))) {
        Some(true) => S_OK,
        _ => E_FAIL,
    }
}

/// `GetRuntimeBase` callback.
///
/// # Safety
/// `base_address` must be valid for a write.
pub unsafe extern "C" fn runtime_base_address(base_address: *mut u64) -> i32 {
    if base_address.is_null() {
        return E_INVALIDARG;
    }
    match current(|target| target.runtime_base_address()) {
        Some(address) => {
            // SAFETY: checked for null, valid per the contract.
            unsafe { ptr::write(base_address, address) };
            S_OK
        }
        None => E_FAIL,
    }
}

/// Logging callback.
///
/// # Safety
/// `message` must be null or point to a NUL terminated string.
pub unsafe extern "C" fn log_message(message: *const c_char) {
    if message.is_null() {
        return;
    }
    // SAFETY: NUL terminated per the contract.
    let message = unsafe { CStr::from_ptr(message) }.to_string_lossy();
    current(|target| target.log(message.trim_end()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DumpError;

    #[derive(Default)]
    struct RecordingTarget {
        requested: Vec<(u64, u64)>,
        logged: Vec<String>,
    }

    impl DataTarget for RecordingTarget {
        fn machine_type(&self) -> u32 {
            0
        }

        fn pointer_size(&self) -> u32 {
            8
        }

        fn read_virtual(&mut self, address: u64, buffer: &mut [u8]) -> Result<usize, DumpError> {
            if address >= 0x1000 {
                return Err(DumpError::ShortRead {
                    address,
                    requested: buffer.len(),
                    read: 0,
                });
            }
            buffer.fill(0xab);
            Ok(buffer.len())
        }

        fn request_memory_region(&mut self, address: u64, size: u64) -> bool {
            self.requested.push((address, size));
            true
        }

        fn runtime_base_address(&self) -> u64 {
            0x7000_0000
        }

        fn log(&mut self, message: &str) {
            self.logged.push(message.to_owned());
        }
    }

    #[test]
    fn callbacks_reach_the_current_target() {
        let mut target = RecordingTarget::default();
        let mut buf = [0_u8; 4];
        let mut read = 0_u32;
        let mut base = 0_u64;

        let (ok, failed, based) = with_target(&mut target, || unsafe {
            let ok = read_virtual(0x10, buf.as_mut_ptr(), 4, &mut read);
            let failed = read_virtual(0x2000, buf.as_mut_ptr(), 4, ptr::null_mut());
            request_memory_region(0x5000, 0x100);
            log_message(c"loading\n".as_ptr());
            (ok, failed, runtime_base_address(&mut base))
        });

        assert_eq!((ok, failed, based), (S_OK, E_FAIL, S_OK));
        assert_eq!(read, 4);
        assert_eq!(buf, [0xab; 4]);
        assert_eq!(base, 0x7000_0000);
        assert_eq!(target.requested, vec![(0x5000, 0x100)]);
        assert_eq!(target.logged, vec!["loading".to_owned()]);
    }

    #[test]
    fn callbacks_fail_outside_of_a_call() {
        let mut base = 0_u64;
        assert_eq!(request_memory_region(0x1000, 1), E_FAIL);
        assert_eq!(unsafe { runtime_base_address(&mut base) }, E_FAIL);
        let mut read = 7_u32;
        let mut buf = [0_u8; 1];
        assert_eq!(unsafe { read_virtual(0, buf.as_mut_ptr(), 1, &mut read) }, E_FAIL);
        assert_eq!(read, 0);
    }
}
