// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Aarch64 specifics for ELF core dump files.

use zerocopy::Immutable;
use zerocopy::IntoBytes;

// aarch64 machine
pub const EM_ELF_MACHINE: u16 = 183;
pub const ARCH_NAME: &str = "arm64";

// aarch64 notes
pub const NT_ARM_TLS: u32 = 0x401;
pub const NT_ARM_HW_BREAK: u32 = 0x402;
pub const NT_ARM_HW_WATCH: u32 = 0x403;
pub const NT_ARM_SYSTEM_CALL: u32 = 0x404;

pub const GPR_COUNT: usize = 34;
pub const FP_INDEX: usize = 29;
pub const LR_INDEX: Option<usize> = Some(30);
pub const SP_INDEX: usize = 31;
pub const IP_INDEX: usize = 32;

#[allow(non_camel_case_types)]
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, IntoBytes, Immutable)]
pub struct elf_gregset_t {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
}

/// Register sets written after the floating point one, as
/// `(name, note type, note name)`.
pub(crate) fn extra_register_sets() -> &'static [(&'static str, u32, &'static [u8])] {
    &[
        ("TLS", NT_ARM_TLS, b"LINUX"),
        ("HW BREAK", NT_ARM_HW_BREAK, b"LINUX"),
        ("HW WATCH", NT_ARM_HW_WATCH, b"LINUX"),
        ("SYSCALL", NT_ARM_SYSTEM_CALL, b"LINUX"),
    ]
}

pub fn get_gpr_set(gpr_state: &[u64; GPR_COUNT]) -> elf_gregset_t {
    let mut regs = [0_u64; 31];
    regs.copy_from_slice(&gpr_state[..31]);

    elf_gregset_t {
        regs,
        sp: gpr_state[31],
        pc: gpr_state[32],
        pstate: gpr_state[33],
    }
}
