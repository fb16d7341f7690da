// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Machine-specific register state for ELF core dump files and unwinding.

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::elf_gregset_t;
#[cfg(target_arch = "x86_64")]
use x86_64 as native;

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::elf_gregset_t;
#[cfg(target_arch = "aarch64")]
use aarch64 as native;

pub(crate) use native::extra_register_sets;

/// ELF machine of the dumps produced by this build
pub const EM_ELF_MACHINE: u16 = native::EM_ELF_MACHINE;

/// Architecture name as reported in crash reports
pub const ARCH_NAME: &str = native::ARCH_NAME;

/// Number of 64-bit words in the general purpose register set
pub const GPR_COUNT: usize = native::GPR_COUNT;

/// Contains SSE registers on amd64, NEON on arm64,
/// XSAVE state on amd64, etc
#[derive(Debug, Clone)]
pub struct ArchComponentState {
    /// Name
    pub name: &'static str,
    /// Note type
    pub note_type: u32,
    /// Note name
    pub note_name: &'static [u8],
    /// Data
    pub data: Vec<u8>,
}

/// Describes CPU state of a thread or of an unwound frame.
///
/// The general purpose registers follow the kernel `user_regs_struct`
/// layout, so a thread context can be fed directly to `NT_PRSTATUS`.
#[derive(Debug, Clone)]
pub struct ArchState {
    /// GP registers.
    pub gpr_state: Vec<u64>,

    /// Floating point registers first, then the architecture-specific
    /// extra register sets
    pub components: Vec<ArchComponentState>,
}

impl ArchState {
    /// Creates the state from general purpose registers only.
    pub fn from_gprs(mut gpr_state: Vec<u64>) -> Self {
        gpr_state.resize(GPR_COUNT, 0);
        Self {
            gpr_state,
            components: Vec::new(),
        }
    }

    fn gpr(&self, index: usize) -> u64 {
        self.gpr_state.get(index).copied().unwrap_or_default()
    }

    fn set_gpr(&mut self, index: usize, value: u64) {
        if self.gpr_state.len() <= index {
            self.gpr_state.resize(GPR_COUNT.max(index + 1), 0);
        }
        self.gpr_state[index] = value;
    }

    /// Program counter
    pub fn instruction_pointer(&self) -> u64 {
        self.gpr(native::IP_INDEX)
    }

    /// Stack pointer
    pub fn stack_pointer(&self) -> u64 {
        self.gpr(native::SP_INDEX)
    }

    /// Frame pointer (`rbp` or `x29`)
    pub fn frame_pointer(&self) -> u64 {
        self.gpr(native::FP_INDEX)
    }

    /// Link register on machines that have one
    pub fn link_register(&self) -> Option<u64> {
        native::LR_INDEX.map(|index| self.gpr(index))
    }

    pub fn set_instruction_pointer(&mut self, value: u64) {
        self.set_gpr(native::IP_INDEX, value)
    }

    pub fn set_stack_pointer(&mut self, value: u64) {
        self.set_gpr(native::SP_INDEX, value)
    }

    pub fn set_frame_pointer(&mut self, value: u64) {
        self.set_gpr(native::FP_INDEX, value)
    }

    pub fn set_link_register(&mut self, value: u64) {
        if let Some(index) = native::LR_INDEX {
            self.set_gpr(index, value)
        }
    }

    /// Register set in the `NT_PRSTATUS` layout
    pub fn greg_set(&self) -> elf_gregset_t {
        let mut regs = [0_u64; GPR_COUNT];
        for (dst, src) in regs.iter_mut().zip(self.gpr_state.iter()) {
            *dst = *src;
        }
        native::get_gpr_set(&regs)
    }

    pub fn components(&self) -> &[ArchComponentState] {
        &self.components
    }
}
