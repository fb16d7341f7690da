// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Threads of the target and the frames recorded for them.

use crate::arch::ArchState;
use crate::memory::page_floor;
use crate::memory::MemoryRegionSet;
use crate::memory::ProcessMemory;
use crate::platform::ThreadStatus;
use std::collections::BTreeMap;

/// HRESULT of `COR_E_STACKOVERFLOW`
pub const STACK_OVERFLOW_HRESULT: u32 = 0x8007_03e9;

/// Pages of stack captured when no mapping contains the stack pointer
const DEFAULT_STACK_PAGES: u64 = 4;

/// One frame of a thread's stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub is_managed: bool,
    pub module_base_address: u64,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub native_offset: u32,
    pub token: u32,
    pub il_offset: u32,
    pub method_name: Option<String>,
}

impl StackFrame {
    pub fn native(module_base_address: u64, instruction_pointer: u64, stack_pointer: u64, native_offset: u32) -> Self {
        Self {
            is_managed: false,
            module_base_address,
            instruction_pointer,
            stack_pointer,
            native_offset,
            token: 0,
            il_offset: 0,
            method_name: None,
        }
    }
}

/// Range of recorded frames a stack overflow repeats, and how often.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RepeatedFrames {
    /// Stack pointer of the first frame of the repeated sequence
    pub begin: u64,
    /// Stack pointer of the first frame after the sequence
    pub end: Option<u64>,
    /// Approximate number of repetitions
    pub count: usize,
}

/// Thread of the target.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub tid: i32,
    pub ppid: i32,
    pub tgid: i32,
    pub is_managed: bool,
    pub arch_state: ArchState,
    pub exception_object: Option<u64>,
    pub exception_type: Option<String>,
    pub exception_hresult: Option<u32>,
    frames: BTreeMap<u64, StackFrame>,
    repeat_begin: Option<u64>,
    repeat_end: Option<u64>,
    repeated_frames: usize,
}

impl ThreadInfo {
    pub fn new(status: ThreadStatus) -> Self {
        Self {
            tid: status.tid,
            ppid: status.ppid,
            tgid: status.tgid,
            is_managed: false,
            arch_state: status.arch_state,
            exception_object: None,
            exception_type: None,
            exception_hresult: None,
            frames: BTreeMap::new(),
            repeat_begin: None,
            repeat_end: None,
            repeated_frames: 0,
        }
    }

    pub fn instruction_pointer(&self) -> u64 {
        self.arch_state.instruction_pointer()
    }

    pub fn stack_pointer(&self) -> u64 {
        self.arch_state.stack_pointer()
    }

    pub fn frame_pointer(&self) -> u64 {
        self.arch_state.frame_pointer()
    }

    fn is_stack_overflow(&self) -> bool {
        self.exception_hresult == Some(STACK_OVERFLOW_HRESULT)
    }

    /// Recorded frames, innermost first
    pub fn frames(&self) -> impl Iterator<Item = &StackFrame> {
        self.frames.values()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The repeated sequence of a stack overflow, if one was found.
    pub fn repeated_frames(&self) -> Option<RepeatedFrames> {
        let begin = self.repeat_begin?;
        let window = match self.repeat_end {
            Some(end) => self.frames.range(begin..end).count(),
            None => self.frames.range(begin..).count(),
        };
        Some(RepeatedFrames {
            begin,
            end: self.repeat_end,
            count: self.repeated_frames.div_ceil(window.max(1)) + 1,
        })
    }

    /// Records a frame. Frames at an already recorded stack pointer are
    /// dropped. While a stack overflow is being processed, frames repeating
    /// the instruction pointer of a recorded frame are only counted.
    pub fn add_stack_frame(&mut self, frame: StackFrame) {
        if self.frames.contains_key(&frame.stack_pointer) {
            return;
        }

        if self.is_stack_overflow() && self.repeat_end.is_none() {
            let ip = frame.instruction_pointer;
            match self.repeat_begin {
                None => {
                    if let Some(first) = self.frames.values().find(|f| f.instruction_pointer == ip) {
                        self.repeat_begin = Some(first.stack_pointer);
                        self.repeated_frames += 1;
                        return;
                    }
                }
                Some(begin) => {
                    if self.frames.range(begin..).any(|(_, f)| f.instruction_pointer == ip) {
                        self.repeated_frames += 1;
                        return;
                    }
                    self.repeat_end = Some(frame.stack_pointer);
                }
            }
        }

        self.frames.insert(frame.stack_pointer, frame);
    }

    /// Adds the stack of the thread to the dump: the mapping containing the
    /// stack pointer from its page up, or a few pages if there is none.
    pub fn get_thread_stack(&self, other_mappings: &MemoryRegionSet, memory: &mut ProcessMemory) -> usize {
        let page_size = memory.page_size();
        let start = page_floor(self.stack_pointer(), page_size);
        let size = match other_mappings.find_containing(start) {
            Some(mapping) => mapping.end - start,
            None => DEFAULT_STACK_PAGES * page_size,
        };
        tracing::debug!(
            "Thread {} stack 0x{:x} - 0x{:x}",
            self.tid,
            start,
            start.saturating_add(size)
        );
        memory.insert_region(start, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRegion;
    use crate::memory::RegionFlags;
    use crate::platform::fake::FakeProcess;
    use crate::platform::fake::PAGE;

    fn thread(hresult: Option<u32>) -> ThreadInfo {
        let mut thread = ThreadInfo::new(ThreadStatus {
            tid: 7,
            ppid: 1,
            tgid: 7,
            arch_state: ArchState::from_gprs(Vec::new()),
        });
        thread.exception_hresult = hresult;
        thread
    }

    #[test]
    fn frames_at_the_same_stack_pointer_are_dropped() {
        let mut thread = thread(None);
        thread.add_stack_frame(StackFrame::native(0x1000, 0x1010, 0x7000, 0x10));
        thread.add_stack_frame(StackFrame::native(0x1000, 0x1020, 0x7000, 0x20));
        thread.add_stack_frame(StackFrame::native(0x1000, 0x1010, 0x7100, 0x10));
        let ips: Vec<_> = thread.frames().map(|f| f.instruction_pointer).collect();
        assert_eq!(ips, vec![0x1010, 0x1010]);
        assert!(thread.repeated_frames().is_none());
    }

    #[test]
    fn stack_overflow_repeats_are_compressed() {
        let mut thread = thread(Some(STACK_OVERFLOW_HRESULT));
        let cycle = [0xa000_u64, 0xb000, 0xc000];
        let mut sp = 0x10_0000_u64;

        // the faulting frame, then 100 times the recursive sequence
        thread.add_stack_frame(StackFrame::native(0x9000, 0x9010, sp, 0x10));
        for _ in 0..100 {
            for ip in cycle {
                sp += 0x40;
                thread.add_stack_frame(StackFrame::native(0x9000, ip, sp, 0));
            }
        }
        sp += 0x40;
        thread.add_stack_frame(StackFrame::native(0x9000, 0xd000, sp, 0));
        sp += 0x40;
        thread.add_stack_frame(StackFrame::native(0x9000, 0xe000, sp, 0));

        assert_eq!(thread.frame_count(), 6);
        let repeated = thread.repeated_frames().unwrap();
        assert_eq!(repeated.count, 100);
        assert_eq!(repeated.end, Some(sp - 0x40));
    }

    #[test]
    fn repeats_are_only_tracked_for_stack_overflows() {
        let mut thread = thread(Some(0x8000_4005));
        for i in 0..30_u64 {
            thread.add_stack_frame(StackFrame::native(0, 0xa000 + (i % 3), 0x1000 + i * 0x10, 0));
        }
        assert_eq!(thread.frame_count(), 30);
        assert!(thread.repeated_frames().is_none());
    }

    #[test]
    fn stack_is_captured_from_the_containing_mapping() {
        let mut process = FakeProcess::default();
        process.map(0x7f000, 0x84000);
        let mut memory = ProcessMemory::new(Box::new(process));
        let mut other = MemoryRegionSet::new();
        other.insert_unchecked(MemoryRegion::new(
            RegionFlags::READ | RegionFlags::WRITE | RegionFlags::PRIVATE,
            0x7f000,
            0x84000,
        ));

        let mut thread = thread(None);
        thread.arch_state.set_stack_pointer(0x81234);
        assert_eq!(thread.get_thread_stack(&other, &mut memory), 3);
        assert!(memory.regions().find_containing(0x80fff).is_none());

        thread.arch_state.set_stack_pointer(0x7f010);
        let empty = MemoryRegionSet::new();
        let mut memory = ProcessMemory::new(Box::new({
            let mut process = FakeProcess::default();
            process.map(0x7f000, 0x90000);
            process
        }));
        assert_eq!(thread.get_thread_stack(&empty, &mut memory), 4);
        assert_eq!(memory.regions().total_size(), 4 * PAGE);
    }
}
