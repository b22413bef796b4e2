// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A seccomp-BPF application sandbox.
//!
//! A policy is an ordinary function mapping each system call number to an
//! [`ErrorCode`]: allow the call, fail it with an errno, or divert it to a
//! userspace callback. The crate compiles the policy into a classic BPF
//! filter (a binary-search comparison tree behind architecture and ABI
//! guards), checks the generated filter against the policy with an
//! independent interpreter, and loads it into the kernel. From that point on
//! the policy is enforced on every system call the process makes, and there
//! is no way back.
//!
//! Kernel support is detected empirically, by enforcing a canary policy in a
//! forked child and observing the verdicts, rather than by trusting version
//! numbers.
//!
//! ```no_run
//! use seccomp_sandbox::{
//!     is_valid_syscall_number, set_sandbox_policy, start_sandbox,
//!     supports_seccomp_sandbox, ErrorCode, SandboxStatus,
//! };
//!
//! fn policy(sysnum: i32) -> ErrorCode {
//!     if !is_valid_syscall_number(sysnum) {
//!         return ErrorCode::errno(libc::ENOSYS);
//!     }
//!     match i64::from(sysnum) {
//!         libc::SYS_nanosleep => ErrorCode::errno(libc::EACCES),
//!         _ => ErrorCode::ALLOWED,
//!     }
//! }
//!
//! if supports_seccomp_sandbox(-1) == SandboxStatus::Available {
//!     set_sandbox_policy(policy);
//!     start_sandbox();
//! }
//! ```
//!
//! Misusing the lifecycle (starting twice, changing an active policy,
//! starting from a multi-threaded process) does not return errors: it
//! terminates the process. A process that continues running with a sandbox
//! it merely believes to be active is the one outcome this crate must never
//! produce.

mod codegen;
mod common;
mod compiler;
mod errorcode;
mod fatal;
mod sandbox;
mod syscall_iterator;
mod trap;
mod verifier;

pub use codegen::CodegenError;
pub use common::{sock_filter, BpfProgram, SeccompData, BPF_MAX_LEN, SECCOMP_ARCH};
pub use compiler::{build_program, CompileError, SyscallEvaluator};
pub use errorcode::{ErrorCode, Range, TrapFnc, ERR_MAX_ERRNO, ERR_MIN_ERRNO};
pub use sandbox::{
    set_sandbox_policy, start_sandbox, supports_seccomp_sandbox, SandboxStatus,
};
pub use syscall_iterator::is_valid_syscall_number;
pub use trap::{kill, trap};
pub use verifier::VerifierError;
