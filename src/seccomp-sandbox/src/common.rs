// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Module that defines the raw seccomp-BPF data structures shared by the
//! compiler, the verifier and the installer.

/// The maximum seccomp-BPF program length allowed by the linux kernel.
pub const BPF_MAX_LEN: usize = 4096;

// BPF Instruction classes.
// See /usr/include/linux/bpf_common.h .
pub(crate) const BPF_LD: u16 = 0x00;
pub(crate) const BPF_JMP: u16 = 0x05;
pub(crate) const BPF_RET: u16 = 0x06;

// BPF ld/ldx fields.
// See /usr/include/linux/bpf_common.h .
pub(crate) const BPF_W: u16 = 0x00;
pub(crate) const BPF_ABS: u16 = 0x20;

// BPF jmp fields.
// See /usr/include/linux/bpf_common.h .
pub(crate) const BPF_JA: u16 = 0x00;
pub(crate) const BPF_JEQ: u16 = 0x10;
pub(crate) const BPF_JGT: u16 = 0x20;
pub(crate) const BPF_JGE: u16 = 0x30;
pub(crate) const BPF_JSET: u16 = 0x40;
pub(crate) const BPF_K: u16 = 0x00;

// Return codes for BPF programs.
// See /usr/include/linux/seccomp.h .
pub(crate) const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub(crate) const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub(crate) const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub(crate) const SECCOMP_RET_ACTION: u32 = 0x7fff_0000;
pub(crate) const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// Architecture identifiers.
// See /usr/include/linux/audit.h .

// Defined as:
// `#define AUDIT_ARCH_X86_64	(EM_X86_64|__AUDIT_ARCH_64BIT|__AUDIT_ARCH_LE)`
pub(crate) const AUDIT_ARCH_X86_64: u32 = 62 | 0x8000_0000 | 0x4000_0000;

// Defined as:
// `#define AUDIT_ARCH_AARCH64	(EM_AARCH64|__AUDIT_ARCH_64BIT|__AUDIT_ARCH_LE)`
pub(crate) const AUDIT_ARCH_AARCH64: u32 = 183 | 0x8000_0000 | 0x4000_0000;

/// The audit architecture tag the generated filters are built for.
#[cfg(target_arch = "x86_64")]
pub const SECCOMP_ARCH: u32 = AUDIT_ARCH_X86_64;
/// The audit architecture tag the generated filters are built for.
#[cfg(target_arch = "aarch64")]
pub const SECCOMP_ARCH: u32 = AUDIT_ARCH_AARCH64;

// `struct seccomp_data` offsets of fields in bytes:
//
// ```c
// struct seccomp_data {
//     int nr;
//     __u32 arch;
//     __u64 instruction_pointer;
//     __u64 args[6];
// };
// ```
pub(crate) const SECCOMP_DATA_NR_OFFSET: u32 = 0;
pub(crate) const SECCOMP_DATA_ARCH_OFFSET: u32 = 4;
pub(crate) const SECCOMP_DATA_IP_OFFSET: u32 = 8;
pub(crate) const SECCOMP_DATA_ARGS_OFFSET: u32 = 16;

/// BPF instruction structure definition.
/// See /usr/include/linux/filter.h .
#[repr(C)]
#[derive(Clone, Debug, PartialEq, Eq)]
#[doc(hidden)]
#[allow(non_camel_case_types)]
pub struct sock_filter {
    pub code: ::std::os::raw::c_ushort,
    pub jt: ::std::os::raw::c_uchar,
    pub jf: ::std::os::raw::c_uchar,
    pub k: ::std::os::raw::c_uint,
}

/// Program made up of a sequence of BPF instructions.
pub type BpfProgram = Vec<sock_filter>;

/// The per-syscall context record the kernel exposes to a BPF filter, and the
/// record handed to trap callbacks.
/// See `struct seccomp_data` in /usr/include/linux/seccomp.h .
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeccompData {
    /// Number of the attempted system call.
    pub nr: i32,
    /// Audit architecture tag of the calling thread.
    pub arch: u32,
    /// Instruction pointer at the time of the system call.
    pub instruction_pointer: u64,
    /// The six raw system call argument words.
    pub args: [u64; 6],
}

/// Builds a "jump" BPF instruction.
#[allow(non_snake_case)]
#[inline(always)]
pub(crate) fn BPF_JUMP(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

/// Builds a "statement" BPF instruction.
#[allow(non_snake_case)]
#[inline(always)]
pub(crate) fn BPF_STMT(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}
