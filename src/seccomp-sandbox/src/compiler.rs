// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Translation of a syscall policy into a loadable BPF filter.
//!
//! A policy is a plain function from system call number to `ErrorCode`. The
//! compiler samples it over the whole `u32` domain (valid numbers
//! exhaustively, invalid regions at representative probe points), coalesces
//! equal verdicts into contiguous ranges, and lowers the ranges into a
//! binary-search comparison tree prefixed by the architecture and ABI
//! guards. Every generated filter is re-checked by the verifier before it is
//! allowed anywhere near the kernel.

use crate::codegen::{CodeGen, CodegenError, NodeRef};
use crate::common::{
    BpfProgram, BPF_JEQ, BPF_JGE, SECCOMP_ARCH, SECCOMP_DATA_ARCH_OFFSET, SECCOMP_DATA_NR_OFFSET,
};
use crate::errorcode::{ErrorCode, Range};
use crate::syscall_iterator::SyscallIterator;
use crate::trap;
use crate::verifier::{self, VerifierError};

/// A syscall policy: maps each system call number to its outcome.
///
/// The function must be a pure function of the number. It is consulted many
/// times during compilation and again during verification, and divergent
/// answers fail the build.
pub type SyscallEvaluator = fn(i32) -> ErrorCode;

/// Filter compilation errors.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum CompileError {
    /// policy must fail invalid syscall {sysnum:#010x} with a plain errno, got {value:#010x}
    InvalidSyscallDenial {
        /// Invalid probe point that produced the offending verdict.
        sysnum: u32,
        /// Encoded verdict the policy returned.
        value: u32,
    },
    /// policy is not uniform over invalid syscalls: {sysnum:#010x} maps to {value:#010x}, expected {expected:#010x}
    NonUniformInvalidDenial {
        /// Invalid probe point that produced the offending verdict.
        sysnum: u32,
        /// Encoded verdict the policy returned.
        value: u32,
        /// Encoded verdict of the first invalid probe point.
        expected: u32,
    },
    /// filter generation failed: {0}
    Codegen(#[from] CodegenError),
    /// generated filter failed self-verification: {0}
    Verify(#[from] VerifierError),
}

/// Samples `evaluator` over the syscall domain and coalesces equal verdicts
/// into contiguous, sorted, gap-free ranges covering all of `u32`.
///
/// Numbers between two invalid probe points are never evaluated; the policy
/// is therefore required to give every invalid number one and the same plain
/// errno verdict, which also guarantees the unevaluated gaps are covered
/// correctly.
pub(crate) fn find_ranges(evaluator: SyscallEvaluator) -> Result<Vec<Range>, CompileError> {
    let mut first_invalid: Option<ErrorCode> = None;
    #[allow(clippy::cast_possible_wrap)]
    for sysnum in SyscallIterator::new(true) {
        let code = evaluator(sysnum as i32);
        if !code.is_errno() {
            return Err(CompileError::InvalidSyscallDenial {
                sysnum,
                value: code.err(),
            });
        }
        match first_invalid {
            None => first_invalid = Some(code),
            Some(expected) if expected != code => {
                return Err(CompileError::NonUniformInvalidDenial {
                    sysnum,
                    value: code.err(),
                    expected: expected.err(),
                });
            }
            Some(_) => {}
        }
    }

    let mut ranges = Vec::new();
    let mut iter = SyscallIterator::new(false);
    // The iterator always starts at syscall zero.
    let mut from = match iter.next() {
        Some(sysnum) => sysnum,
        None => return Ok(ranges),
    };
    #[allow(clippy::cast_possible_wrap)]
    let mut code = evaluator(from as i32);
    #[allow(clippy::cast_possible_wrap)]
    for sysnum in iter {
        let next = evaluator(sysnum as i32);
        if next != code {
            ranges.push(Range::new(from, sysnum - 1, code));
            from = sysnum;
            code = next;
        }
    }
    ranges.push(Range::new(from, u32::MAX, code));
    Ok(ranges)
}

/// Lowers sorted ranges into a binary comparison tree. Each inner node
/// splits the remaining ranges in half on a `JGE` against the middle range's
/// first syscall number.
fn assemble_jump_table(gen: &mut CodeGen, ranges: &[Range]) -> NodeRef {
    if let [range] = ranges {
        return gen.make_ret(range.code.err());
    }
    let mid = ranges.len() / 2;
    let lower = assemble_jump_table(gen, &ranges[..mid]);
    let upper = assemble_jump_table(gen, &ranges[mid..]);
    gen.make_jump(BPF_JGE, ranges[mid].from, upper, lower)
}

/// Compiles `evaluator` into a kernel-loadable BPF filter.
///
/// The filter first traps on any foreign audit architecture, then (on
/// x86_64) on any syscall carrying the x32 ABI marker bit, and only then
/// dispatches the syscall number through the policy's comparison tree.
pub fn build_program(evaluator: SyscallEvaluator) -> Result<BpfProgram, CompileError> {
    let ranges = find_ranges(evaluator)?;

    let mut gen = CodeGen::new();
    let jump_table = assemble_jump_table(&mut gen, &ranges);

    let load_nr = gen.make_load(SECCOMP_DATA_NR_OFFSET, None);
    #[cfg(target_arch = "x86_64")]
    {
        let abi_trap = gen.make_ret(trap::kill("Illegal mixing of system call ABIs").err());
        let abi_guard = gen.make_jump(
            crate::common::BPF_JSET,
            crate::syscall_iterator::X32_SYSCALL_BIT,
            abi_trap,
            jump_table,
        );
        gen.join(load_nr, abi_guard)?;
    }
    #[cfg(not(target_arch = "x86_64"))]
    gen.join(load_nr, jump_table)?;

    let arch_trap = gen.make_ret(trap::kill("Invalid audit architecture in BPF filter").err());
    let arch_guard = gen.make_jump(BPF_JEQ, SECCOMP_ARCH, load_nr, arch_trap);
    let head = gen.make_load(SECCOMP_DATA_ARCH_OFFSET, Some(arch_guard));

    let program = gen.compile(head)?;
    verifier::verify(&program, evaluator, &ranges)?;
    Ok(program)
}
