// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Stack unwinding of the target threads.
//!
//! Unwinding is mostly done for the side effect: every page the unwinder
//! reads becomes part of the dump, so that a debugger can unwind the same
//! stacks later. The frames are only recorded when a crash report is to be
//! written.

use crate::arch::ArchState;
use crate::dac::DataAccessBridge;
use crate::dac::ManagedFrame;
use crate::dac::ManagedStackWalker;
use crate::error::DumpError;
use crate::memory::ProcessMemory;
use crate::modules::ModuleCatalog;
use crate::thread::StackFrame;
use crate::thread::ThreadInfo;
use zerocopy::IntoBytes;

/// Stop when the same instruction pointer comes back this many times in a
/// row, the unwinder is stuck or the stack overflowed.
pub const MAX_REPEATED_INSTRUCTION_POINTER: usize = 1000;

/// Result of unwinding one native frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnwoundFrame {
    /// Start of the function the frame was in, when the unwinder knows it
    pub function_start: Option<u64>,
}

/// Interprets the unwind information of native code.
pub trait NativeUnwinder {
    /// Replaces `context` with the context of the caller. Memory must be
    /// read through `memory` so it is recorded. Returns `None` when the
    /// frame cannot be unwound.
    fn unwind_frame(
        &mut self,
        context: &mut ArchState,
        module_base: u64,
        memory: &mut ProcessMemory,
    ) -> Option<UnwoundFrame>;
}

/// Follows the frame pointer chain: the frame pointer points at the saved
/// frame pointer of the caller, followed by the return address. This holds
/// for `rbp` on x86_64 and for `x29`/`x30` on aarch64.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramePointerUnwinder;

impl NativeUnwinder for FramePointerUnwinder {
    fn unwind_frame(
        &mut self,
        context: &mut ArchState,
        _module_base: u64,
        memory: &mut ProcessMemory,
    ) -> Option<UnwoundFrame> {
        let fp = context.frame_pointer();
        if fp == 0 || fp < context.stack_pointer() || fp % 8 != 0 {
            return None;
        }

        let mut record = [0_u64; 2];
        memory.read_exact(fp, record.as_mut_bytes()).ok()?;
        let [saved_fp, return_address] = record;

        context.set_instruction_pointer(return_address);
        context.set_stack_pointer(fp + 16);
        context.set_frame_pointer(saved_fp);
        Some(UnwoundFrame::default())
    }
}

/// Walks native and managed frames of threads.
pub struct ThreadUnwinder<'a> {
    pub memory: &'a mut ProcessMemory,
    pub modules: &'a ModuleCatalog,
    pub native: &'a mut dyn NativeUnwinder,
    pub bridge: &'a mut DataAccessBridge,
    pub record_frames: bool,
}

impl ThreadUnwinder<'_> {
    /// Unwinds `thread` from its registers, then every managed frame the
    /// runtime reports for it along with the native frames in between.
    pub fn unwind_thread(&mut self, thread: &mut ThreadInfo) -> Result<(), DumpError> {
        // A suspended thread always has a stack, no stack pointer means
        // its registers could not be fetched.
        if thread.stack_pointer() == 0 {
            tracing::error!("Thread {} has no register state", thread.tid);
            return Err(DumpError::UnwindFailed(thread.tid));
        }

        tracing::debug!(
            "Unwinding thread {} ip 0x{:x} sp 0x{:x}",
            thread.tid,
            thread.instruction_pointer(),
            thread.stack_pointer()
        );

        let context = thread.arch_state.clone();
        self.unwind_native_frames(thread, &context);

        let Some(mut walker) = self.bridge.stack_walker(self.memory, thread.tid) else {
            return Ok(());
        };
        thread.is_managed = true;

        if let Some(exception) = self.bridge.exception_info(self.memory, walker.as_mut()) {
            tracing::debug!(
                "Thread {} exception 0x{:x} {:?} hresult {:x?}",
                thread.tid,
                exception.object_address,
                exception.type_name,
                exception.hresult
            );
            thread.exception_object = Some(exception.object_address);
            thread.exception_type = exception.type_name;
            thread.exception_hresult = exception.hresult;
        }

        self.unwind_managed_frames(thread, walker.as_mut());
        Ok(())
    }

    fn unwind_managed_frames(&mut self, thread: &mut ThreadInfo, walker: &mut dyn ManagedStackWalker) {
        while let Some(frame) = self.bridge.next_frame(self.memory, walker) {
            if self.record_frames {
                thread.add_stack_frame(managed_stack_frame(thread.tid, &frame));
            }
            self.unwind_native_frames(thread, &frame.context);
        }
    }

    /// Unwinds native frames starting at `context` until the unwinder gives
    /// up or leaves known code.
    pub fn unwind_native_frames(&mut self, thread: &mut ThreadInfo, context: &ArchState) {
        let page_size = self.memory.page_size();
        let mut context = context.clone();
        let mut previous_sp: Option<u64> = None;
        let mut previous_ip = 0_u64;
        let mut repeats = 0_usize;

        loop {
            let ip = context.instruction_pointer();
            let sp = context.stack_pointer();

            if ip == 0 || previous_sp.is_some_and(|previous| sp <= previous) {
                break;
            }

            if ip == previous_ip {
                repeats += 1;
                if repeats > MAX_REPEATED_INSTRUCTION_POINTER {
                    tracing::debug!("Thread {} ip 0x{:x} repeats, stopping", thread.tid, ip);
                    break;
                }
            } else {
                repeats = 0;
            }

            // Code around the instruction pointer
            self.memory.insert_region(ip.saturating_sub(page_size), page_size * 2);

            let Some(module_base) = self.modules.base_address_of(ip) else {
                tracing::trace!("Thread {} ip 0x{:x} outside of known modules", thread.tid, ip);
                break;
            };

            let Some(unwound) = self.native.unwind_frame(&mut context, module_base, self.memory) else {
                break;
            };

            if self.record_frames {
                let native_offset = unwound
                    .function_start
                    .filter(|start| *start <= ip)
                    .map_or(0, |start| (ip - start) as u32);
                thread.add_stack_frame(StackFrame::native(module_base, ip, sp, native_offset));
            }

            previous_sp = Some(sp);
            previous_ip = ip;
        }
    }
}

fn managed_stack_frame(tid: i32, frame: &ManagedFrame) -> StackFrame {
    let ip = frame.context.instruction_pointer();
    let native_offset = match frame.method_start {
        Some(start) if start <= ip => (ip - start) as u32,
        _ => {
            tracing::debug!("Thread {} frame 0x{:x}: no method start", tid, ip);
            0
        }
    };
    if frame.token.is_none() {
        tracing::debug!("Thread {} frame 0x{:x}: no method token", tid, ip);
    }
    if frame.il_offset.is_none() {
        tracing::debug!("Thread {} frame 0x{:x}: no IL offset", tid, ip);
    }

    StackFrame {
        is_managed: true,
        module_base_address: frame.module_base.unwrap_or(0),
        instruction_pointer: ip,
        stack_pointer: frame.context.stack_pointer(),
        native_offset,
        token: frame.token.unwrap_or(0),
        il_offset: frame.il_offset.unwrap_or(0),
        method_name: frame.method_name.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dac::DataAccessService;
    use crate::dac::DataTarget;
    use crate::dac::ExceptionSlot;
    use crate::dac::ManagedException;
    use crate::dac::ManagedModule;
    use crate::dac::MemoryEnumeration;
    use crate::modules::ManagedModuleDetails;
    use crate::platform::fake::FakeProcess;
    use crate::platform::ThreadStatus;

    const CODE: u64 = 0x40_0000;

    fn context(ip: u64, sp: u64, fp: u64) -> ArchState {
        let mut state = ArchState::from_gprs(Vec::new());
        state.set_instruction_pointer(ip);
        state.set_stack_pointer(sp);
        state.set_frame_pointer(fp);
        state
    }

    fn thread(state: ArchState) -> ThreadInfo {
        ThreadInfo::new(ThreadStatus {
            tid: 11,
            ppid: 1,
            tgid: 10,
            arch_state: state,
        })
    }

    /// Three frames linked by frame pointers on a stack at 0x7f000.
    fn stack_process() -> FakeProcess {
        let mut process = FakeProcess::default();
        process.map(CODE, CODE + 0x4000);
        process.map(0x7f000, 0x80000);
        process.write_u64(0x7f100, 0x7f200);
        process.write_u64(0x7f108, CODE + 0x1200);
        process.write_u64(0x7f200, 0);
        process.write_u64(0x7f208, CODE + 0x2300);
        process
    }

    fn catalog() -> ModuleCatalog {
        let mut modules = ModuleCatalog::new();
        modules.add_module_address_range(CODE, CODE + 0x4000, CODE);
        modules
    }

    #[test]
    fn frame_pointer_chain_is_followed_and_recorded() {
        let mut memory = ProcessMemory::new(Box::new(stack_process()));
        let modules = catalog();
        let mut bridge = DataAccessBridge::unavailable();
        let mut native = FramePointerUnwinder;
        let mut thread = thread(context(CODE + 0x100, 0x7f0f0, 0x7f100));

        let mut unwinder = ThreadUnwinder {
            memory: &mut memory,
            modules: &modules,
            native: &mut native,
            bridge: &mut bridge,
            record_frames: true,
        };
        unwinder.unwind_thread(&mut thread).unwrap();

        let ips: Vec<_> = thread.frames().map(|f| f.instruction_pointer).collect();
        assert_eq!(ips, vec![CODE + 0x100, CODE + 0x1200]);
        assert!(!thread.is_managed);
        assert!(memory.regions().find_containing(0x7f100).is_some());
        assert!(memory.regions().find_containing(CODE + 0x2300).is_some());
    }

    #[test]
    fn unknown_code_stops_the_walk() {
        let mut memory = ProcessMemory::new(Box::new(stack_process()));
        let modules = ModuleCatalog::new();
        let mut bridge = DataAccessBridge::unavailable();
        let mut native = FramePointerUnwinder;
        let mut thread = thread(context(CODE + 0x100, 0x7f0f0, 0x7f100));

        ThreadUnwinder {
            memory: &mut memory,
            modules: &modules,
            native: &mut native,
            bridge: &mut bridge,
            record_frames: true,
        }
        .unwind_thread(&mut thread)
        .unwrap();

        assert_eq!(thread.frame_count(), 0);
        // the code pages are still captured
        assert!(memory.regions().find_containing(CODE + 0x100).is_some());
    }

    /// Unwinder that never moves, to check the repeat guard.
    struct StuckUnwinder(usize);

    impl NativeUnwinder for StuckUnwinder {
        fn unwind_frame(&mut self, context: &mut ArchState, _: u64, _: &mut ProcessMemory) -> Option<UnwoundFrame> {
            self.0 += 1;
            let sp = context.stack_pointer();
            context.set_stack_pointer(sp + 8);
            Some(UnwoundFrame {
                function_start: Some(context.instruction_pointer() - 0x10),
            })
        }
    }

    #[test]
    fn repeated_instruction_pointer_stops_the_walk() {
        let mut memory = ProcessMemory::new(Box::new(stack_process()));
        let modules = catalog();
        let mut bridge = DataAccessBridge::unavailable();
        let mut native = StuckUnwinder(0);
        let mut thread = thread(context(CODE + 0x100, 0x7f000, 0));

        ThreadUnwinder {
            memory: &mut memory,
            modules: &modules,
            native: &mut native,
            bridge: &mut bridge,
            record_frames: false,
        }
        .unwind_thread(&mut thread)
        .unwrap();

        assert_eq!(native.0, MAX_REPEATED_INSTRUCTION_POINTER + 1);
        assert_eq!(thread.frame_count(), 0);
    }

    struct OneFrameWalker {
        frames: Vec<ManagedFrame>,
    }

    impl ManagedStackWalker for OneFrameWalker {
        fn exception(&mut self, _: &mut dyn DataTarget, slot: ExceptionSlot) -> Option<ManagedException> {
            (slot == ExceptionSlot::Last).then(|| ManagedException {
                object_address: 0x5_0000,
                hresult: Some(0x8000_4005),
                type_name: Some("System.InvalidOperationException".to_owned()),
            })
        }

        fn next_frame(&mut self, _: &mut dyn DataTarget) -> Option<ManagedFrame> {
            self.frames.pop()
        }
    }

    struct WalkingService;

    impl DataAccessService for WalkingService {
        fn enumerate_modules(&mut self, _: &mut dyn DataTarget) -> Result<Vec<ManagedModule>, DumpError> {
            Ok(Vec::new())
        }

        fn module_details(&mut self, _: &mut dyn DataTarget, _: u64) -> Result<ManagedModuleDetails, DumpError> {
            Ok(ManagedModuleDetails::default())
        }

        fn enumerate_memory_regions(&mut self, _: &mut dyn DataTarget, _: MemoryEnumeration) -> Result<(), DumpError> {
            Ok(())
        }

        fn stack_walker(&mut self, _: &mut dyn DataTarget, _: i32) -> Option<Box<dyn ManagedStackWalker>> {
            Some(Box::new(OneFrameWalker {
                frames: vec![ManagedFrame {
                    context: context(CODE + 0x3010, 0x7f300, 0),
                    module_base: Some(0x90_0000),
                    token: Some(0x0600_0001),
                    il_offset: Some(0x12),
                    method_start: Some(CODE + 0x3000),
                    method_name: Some("Program.Main".to_owned()),
                }],
            }))
        }
    }

    #[test]
    fn managed_frames_and_exception_are_recorded() {
        let mut memory = ProcessMemory::new(Box::new(stack_process()));
        let modules = ModuleCatalog::new();
        let mut bridge = DataAccessBridge::with_service(Box::new(WalkingService), 0);
        let mut native = FramePointerUnwinder;
        let mut thread = thread(context(0, 0x7f0f0, 0));

        ThreadUnwinder {
            memory: &mut memory,
            modules: &modules,
            native: &mut native,
            bridge: &mut bridge,
            record_frames: true,
        }
        .unwind_thread(&mut thread)
        .unwrap();

        assert!(thread.is_managed);
        assert_eq!(thread.exception_object, Some(0x5_0000));
        assert_eq!(thread.exception_hresult, Some(0x8000_4005));
        let frame = thread.frames().next().unwrap();
        assert!(frame.is_managed);
        assert_eq!(frame.native_offset, 0x10);
        assert_eq!(frame.token, 0x0600_0001);
        assert_eq!(frame.il_offset, 0x12);
        assert_eq!(frame.module_base_address, 0x90_0000);
    }

    #[test]
    fn thread_without_registers_fails_to_unwind() {
        let mut memory = ProcessMemory::new(Box::new(stack_process()));
        let modules = catalog();
        let mut bridge = DataAccessBridge::unavailable();
        let mut native = FramePointerUnwinder;
        let mut thread = thread(ArchState::from_gprs(Vec::new()));

        let result = ThreadUnwinder {
            memory: &mut memory,
            modules: &modules,
            native: &mut native,
            bridge: &mut bridge,
            record_frames: true,
        }
        .unwind_thread(&mut thread);

        assert!(matches!(result, Err(DumpError::UnwindFailed(11))));
        assert_eq!(thread.frames().count(), 0);
    }
}
