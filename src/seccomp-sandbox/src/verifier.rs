// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! An independent interpreter for generated filters.
//!
//! The compiler is checked, not trusted: before a filter is handed to the
//! kernel, this module re-executes the flat instruction sequence against
//! probe inputs and compares every outcome with what the policy demands.
//! The interpreter shares no code with the compiler beyond the instruction
//! struct itself, so a bug has to appear in two unrelated implementations to
//! slip through.

use crate::common::{
    sock_filter, SeccompData, AUDIT_ARCH_AARCH64, AUDIT_ARCH_X86_64, BPF_ABS, BPF_JA, BPF_JEQ,
    BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_K, BPF_LD, BPF_RET, BPF_W, SECCOMP_ARCH,
    SECCOMP_DATA_ARGS_OFFSET, SECCOMP_DATA_IP_OFFSET, SECCOMP_RET_ACTION, SECCOMP_RET_TRAP,
};
use crate::compiler::SyscallEvaluator;
use crate::errorcode::Range;

/// Describes a failed self-check of a generated filter.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum VerifierError {
    /// filter is empty
    EmptyProgram,
    /// unsupported instruction {code:#06x} at pc {pc}
    UnknownInstruction {
        /// Raw instruction code.
        code: u16,
        /// Offset of the instruction in the filter.
        pc: usize,
    },
    /// load from unsupported seccomp_data offset {0}
    InvalidLoadOffset(u32),
    /// jump beyond the end of the filter at pc {0}
    JumpOutOfBounds(usize),
    /// execution fell off the end of the filter
    FellThrough,
    /// filter returned {actual:#010x} for syscall {sysnum:#010x}, policy requires {expected:#010x}
    ReturnMismatch {
        /// Probed system call number.
        sysnum: u32,
        /// Encoded value the policy demands.
        expected: u32,
        /// Encoded value the filter produced.
        actual: u32,
    },
    /// filter returned {actual:#010x} for foreign audit architecture {arch:#010x} instead of a trap
    ForeignArchNotTrapped {
        /// Probed audit architecture tag.
        arch: u32,
        /// Encoded value the filter produced.
        actual: u32,
    },
    /// filter returned {actual:#010x} for foreign-ABI syscall {sysnum:#010x} instead of a trap
    ForeignAbiNotTrapped {
        /// Probed system call number.
        sysnum: u32,
        /// Encoded value the filter produced.
        actual: u32,
    },
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn load_word(data: &SeccompData, offset: u32) -> Result<u32, VerifierError> {
    // seccomp-BPF exposes `struct seccomp_data` as little-endian 32-bit
    // words; 64-bit fields are read one half at a time.
    match offset {
        0 => Ok(data.nr as u32),
        4 => Ok(data.arch),
        SECCOMP_DATA_IP_OFFSET => Ok(data.instruction_pointer as u32),
        12 => Ok((data.instruction_pointer >> 32) as u32),
        _ if offset >= SECCOMP_DATA_ARGS_OFFSET
            && offset < SECCOMP_DATA_ARGS_OFFSET + 48
            && offset % 4 == 0 =>
        {
            let arg = ((offset - SECCOMP_DATA_ARGS_OFFSET) / 8) as usize;
            if offset % 8 == 0 {
                Ok(data.args[arg] as u32)
            } else {
                Ok((data.args[arg] >> 32) as u32)
            }
        }
        _ => Err(VerifierError::InvalidLoadOffset(offset)),
    }
}

/// Executes `program` over `data` exactly as the kernel's classic BPF
/// machine would, returning the encoded filter verdict.
pub(crate) fn simulate(
    program: &[sock_filter],
    data: &SeccompData,
) -> Result<u32, VerifierError> {
    if program.is_empty() {
        return Err(VerifierError::EmptyProgram);
    }
    let mut acc: u32 = 0;
    let mut pc = 0;
    // All jumps are forward, so the walk terminates.
    while pc < program.len() {
        let insn = &program[pc];
        let next = if insn.code == BPF_LD + BPF_W + BPF_ABS {
            acc = load_word(data, insn.k)?;
            pc + 1
        } else if insn.code == BPF_RET + BPF_K {
            return Ok(insn.k);
        } else if insn.code == BPF_JMP + BPF_JA {
            pc + 1 + insn.k as usize
        } else if insn.code & !0xf0 == BPF_JMP + BPF_K {
            let matched = match insn.code & 0xf0 {
                BPF_JEQ => acc == insn.k,
                BPF_JGE => acc >= insn.k,
                BPF_JGT => acc > insn.k,
                BPF_JSET => acc & insn.k != 0,
                _ => {
                    return Err(VerifierError::UnknownInstruction {
                        code: insn.code,
                        pc,
                    })
                }
            };
            pc + 1 + usize::from(if matched { insn.jt } else { insn.jf })
        } else {
            return Err(VerifierError::UnknownInstruction {
                code: insn.code,
                pc,
            });
        };
        if next == program.len() {
            return Err(VerifierError::FellThrough);
        }
        if next > program.len() {
            return Err(VerifierError::JumpOutOfBounds(pc));
        }
        pc = next;
    }
    Err(VerifierError::FellThrough)
}

#[allow(clippy::cast_possible_wrap)]
fn probe_data(sysnum: u32, arch: u32) -> SeccompData {
    SeccompData {
        nr: sysnum as i32,
        arch,
        instruction_pointer: 0,
        args: [0; 6],
    }
}

fn is_trap_verdict(value: u32) -> bool {
    value & SECCOMP_RET_ACTION == SECCOMP_RET_TRAP
}

fn check_probe(
    program: &[sock_filter],
    evaluator: SyscallEvaluator,
    sysnum: u32,
) -> Result<(), VerifierError> {
    let actual = simulate(program, &probe_data(sysnum, SECCOMP_ARCH))?;

    #[cfg(target_arch = "x86_64")]
    {
        // Numbers in the x32 region never reach the policy; the filter's ABI
        // guard must stop them with a fatal trap.
        if sysnum & crate::syscall_iterator::X32_SYSCALL_BIT != 0 {
            if !is_trap_verdict(actual) {
                return Err(VerifierError::ForeignAbiNotTrapped { sysnum, actual });
            }
            return Ok(());
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    let expected = evaluator(sysnum as i32).err();
    if actual != expected {
        return Err(VerifierError::ReturnMismatch {
            sysnum,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Checks `program` against the policy it was generated from.
///
/// Every range is probed at its first, last and middle system call number,
/// and the filter's verdict must match the policy's. Foreign audit
/// architectures must always end in a fatal trap, regardless of policy.
pub(crate) fn verify(
    program: &[sock_filter],
    evaluator: SyscallEvaluator,
    ranges: &[Range],
) -> Result<(), VerifierError> {
    for range in ranges {
        check_probe(program, evaluator, range.from)?;
        check_probe(program, evaluator, range.to)?;
        check_probe(program, evaluator, range.from + (range.to - range.from) / 2)?;
    }
    for arch in [AUDIT_ARCH_X86_64, AUDIT_ARCH_AARCH64, 0] {
        if arch == SECCOMP_ARCH {
            continue;
        }
        let actual = simulate(program, &probe_data(0, arch))?;
        if !is_trap_verdict(actual) {
            return Err(VerifierError::ForeignArchNotTrapped { arch, actual });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BPF_JUMP, BPF_STMT, SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO};

    #[test]
    fn test_simulate_trivial_return() {
        let program = vec![BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW)];
        assert_eq!(
            simulate(&program, &probe_data(0, SECCOMP_ARCH)),
            Ok(SECCOMP_RET_ALLOW)
        );
    }

    #[test]
    fn test_simulate_arch_branch() {
        let errno_verdict = SECCOMP_RET_ERRNO + libc::EPERM as u32;
        let program = vec![
            BPF_STMT(BPF_LD + BPF_W + BPF_ABS, 4),
            BPF_JUMP(BPF_JMP + BPF_JEQ + BPF_K, SECCOMP_ARCH, 0, 1),
            BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW),
            BPF_STMT(BPF_RET + BPF_K, errno_verdict),
        ];
        assert_eq!(
            simulate(&program, &probe_data(0, SECCOMP_ARCH)),
            Ok(SECCOMP_RET_ALLOW)
        );
        assert_eq!(simulate(&program, &probe_data(0, 0)), Ok(errno_verdict));
    }

    #[test]
    fn test_simulate_reads_syscall_number() {
        let errno_verdict = SECCOMP_RET_ERRNO + libc::ENOSYS as u32;
        let program = vec![
            BPF_STMT(BPF_LD + BPF_W + BPF_ABS, 0),
            BPF_JUMP(BPF_JMP + BPF_JGE + BPF_K, 100, 0, 1),
            BPF_STMT(BPF_RET + BPF_K, errno_verdict),
            BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW),
        ];
        assert_eq!(
            simulate(&program, &probe_data(99, SECCOMP_ARCH)),
            Ok(SECCOMP_RET_ALLOW)
        );
        assert_eq!(
            simulate(&program, &probe_data(100, SECCOMP_ARCH)),
            Ok(errno_verdict)
        );
    }

    #[test]
    fn test_simulate_rejects_bad_programs() {
        assert_eq!(simulate(&[], &probe_data(0, 0)), Err(VerifierError::EmptyProgram));

        let falls_through = vec![BPF_STMT(BPF_LD + BPF_W + BPF_ABS, 0)];
        assert_eq!(
            simulate(&falls_through, &probe_data(0, 0)),
            Err(VerifierError::FellThrough)
        );

        let out_of_bounds = vec![
            BPF_STMT(BPF_LD + BPF_W + BPF_ABS, 0),
            BPF_JUMP(BPF_JMP + BPF_JEQ + BPF_K, 0, 5, 5),
            BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW),
        ];
        assert_eq!(
            simulate(&out_of_bounds, &probe_data(0, 0)),
            Err(VerifierError::JumpOutOfBounds(1))
        );

        let bad_offset = vec![
            BPF_STMT(BPF_LD + BPF_W + BPF_ABS, 2),
            BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW),
        ];
        assert_eq!(
            simulate(&bad_offset, &probe_data(0, 0)),
            Err(VerifierError::InvalidLoadOffset(2))
        );

        let bad_insn = vec![BPF_STMT(0xffff, 0)];
        assert_eq!(
            simulate(&bad_insn, &probe_data(0, 0)),
            Err(VerifierError::UnknownInstruction {
                code: 0xffff,
                pc: 0
            })
        );
    }

    #[test]
    fn test_simulate_argument_halves() {
        let program = vec![
            BPF_STMT(BPF_LD + BPF_W + BPF_ABS, SECCOMP_DATA_ARGS_OFFSET + 8 + 4),
            BPF_JUMP(BPF_JMP + BPF_JEQ + BPF_K, 0xdead_beef, 0, 1),
            BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ALLOW),
            BPF_STMT(BPF_RET + BPF_K, SECCOMP_RET_ERRNO + 1),
        ];
        let mut data = probe_data(0, SECCOMP_ARCH);
        data.args[1] = 0xdead_beef_0000_0000;
        assert_eq!(simulate(&program, &data), Ok(SECCOMP_RET_ALLOW));
        data.args[1] = 0x0000_0000_dead_beef;
        assert_eq!(simulate(&program, &data), Ok(SECCOMP_RET_ERRNO + 1));
    }
}
