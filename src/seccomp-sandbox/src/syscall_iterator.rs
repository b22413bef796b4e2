// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Enumeration of the system call number domain.
//!
//! The kernel defines syscall numbers as a signed `int`, but BPF compares
//! unsigned 32-bit quantities, so the domain covered here is the full `u32`
//! range. The iterator yields every architecturally-valid number plus a
//! handful of representative invalid probes (one past the maximum, the
//! boundaries of the foreign-ABI region on x86_64, the sign-bit edges and
//! `u32::MAX`), in strictly increasing order. Range construction relies on
//! policies treating everything between two consecutive probes uniformly,
//! which the range finder enforces.

/// Lowest architecturally-defined system call number.
pub(crate) const MIN_SYSCALL: u32 = 0;

/// Highest architecturally-defined system call number.
/// See arch/x86/entry/syscalls/syscall_64.tbl .
#[cfg(target_arch = "x86_64")]
pub(crate) const MAX_SYSCALL: u32 = 462;

/// Highest architecturally-defined system call number.
/// See include/uapi/asm-generic/unistd.h .
#[cfg(target_arch = "aarch64")]
pub(crate) const MAX_SYSCALL: u32 = 463;

/// Marker bit of the x32 compatibility ABI. The i386 and x86-64 ABIs clear
/// bit 30 on all system calls; the x32 ABI always sets it.
#[cfg(target_arch = "x86_64")]
pub(crate) const X32_SYSCALL_BIT: u32 = 0x4000_0000;

#[cfg(target_arch = "x86_64")]
const INVALID_PROBES: [u32; 7] = [
    MAX_SYSCALL + 1,
    X32_SYSCALL_BIT - 1,
    X32_SYSCALL_BIT,
    X32_SYSCALL_BIT | MAX_SYSCALL,
    0x7fff_ffff,
    0x8000_0000,
    u32::MAX,
];

#[cfg(target_arch = "aarch64")]
const INVALID_PROBES: [u32; 4] = [MAX_SYSCALL + 1, 0x7fff_ffff, 0x8000_0000, u32::MAX];

/// Whether `sysnum` is an architecturally-defined system call number.
/// Negative numbers are never valid.
pub fn is_valid_syscall_number(sysnum: i32) -> bool {
    #[allow(clippy::cast_sign_loss)]
    let sysnum = sysnum as u32;
    (MIN_SYSCALL..=MAX_SYSCALL).contains(&sysnum)
}

/// Iterator over the syscall number domain, as unsigned 32-bit values in
/// strictly increasing order. With `invalid_only`, skips the valid region
/// and yields only the invalid probes.
#[derive(Debug)]
pub(crate) struct SyscallIterator {
    next_valid: Option<u32>,
    probe_idx: usize,
}

impl SyscallIterator {
    pub(crate) fn new(invalid_only: bool) -> SyscallIterator {
        SyscallIterator {
            next_valid: if invalid_only { None } else { Some(MIN_SYSCALL) },
            probe_idx: 0,
        }
    }
}

impl Iterator for SyscallIterator {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if let Some(sysnum) = self.next_valid {
            self.next_valid = if sysnum < MAX_SYSCALL {
                Some(sysnum + 1)
            } else {
                None
            };
            return Some(sysnum);
        }
        let probe = INVALID_PROBES.get(self.probe_idx).copied();
        if probe.is_some() {
            self.probe_idx += 1;
        }
        probe
    }
}
