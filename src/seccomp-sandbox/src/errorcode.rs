// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The outcome model for a single system call: allow it, fail it with an
//! errno, or trap to a userspace callback.
//!
//! Every `ErrorCode` corresponds to exactly one encoded seccomp-BPF return
//! value, and the three variants occupy disjoint numeric bands, so "is this a
//! denial" is decidable from the raw encoding alone. The generated filter,
//! the verifier and the trap dispatcher all operate on the encoded form.

use std::os::raw::c_void;

use crate::common::{
    SeccompData, SECCOMP_RET_ACTION, SECCOMP_RET_ALLOW, SECCOMP_RET_DATA, SECCOMP_RET_ERRNO,
    SECCOMP_RET_TRAP,
};
use crate::fatal::die;

/// Smallest errno an `ErrorCode` may carry.
pub const ERR_MIN_ERRNO: u32 = 1;
/// Largest errno an `ErrorCode` may carry (the kernel's `MAX_ERRNO`).
pub const ERR_MAX_ERRNO: u32 = 4095;

/// Callback invoked by the trap dispatcher when a trapped system call fires.
///
/// Receives the reconstructed syscall context and the opaque auxiliary
/// pointer given at registration time; the return value becomes the system
/// call's result. Runs in signal context: it must not allocate, lock, or
/// call non-reentrant libc functions.
pub type TrapFnc = fn(&SeccompData, *mut c_void) -> i64;

/// The result of evaluating a policy for one system call number.
#[derive(Clone, Copy, Debug)]
pub struct ErrorCode {
    /// Encoded seccomp-BPF return value. This is the only field that takes
    /// part in comparisons; callback and auxiliary data are carried for the
    /// trap dispatcher's benefit.
    err: u32,
    fnc: Option<TrapFnc>,
    aux: *mut c_void,
}

impl ErrorCode {
    /// The system call proceeds unfiltered.
    pub const ALLOWED: ErrorCode = ErrorCode {
        err: SECCOMP_RET_ALLOW,
        fnc: None,
        aux: std::ptr::null_mut(),
    };

    /// The system call is blocked and fails with `-err` without executing.
    ///
    /// Terminates the process if `err` falls outside the kernel's valid
    /// errno range; an out-of-band errno would silently alias another
    /// encoding band.
    pub fn errno(err: i32) -> ErrorCode {
        #[allow(clippy::cast_sign_loss)]
        let err = err as u32;
        if !(ERR_MIN_ERRNO..=ERR_MAX_ERRNO).contains(&err) {
            die(Some("Errno value out of range for a seccomp filter"));
        }
        ErrorCode {
            err: SECCOMP_RET_ERRNO + err,
            fnc: None,
            aux: std::ptr::null_mut(),
        }
    }

    /// Trap codes are only minted by the trap registry, which owns id
    /// assignment and deduplication.
    pub(crate) fn trap(fnc: TrapFnc, aux: *mut c_void, id: u16) -> ErrorCode {
        ErrorCode {
            err: SECCOMP_RET_TRAP + u32::from(id),
            fnc: Some(fnc),
            aux,
        }
    }

    /// The encoded seccomp-BPF return value.
    pub fn err(&self) -> u32 {
        self.err
    }

    /// Whether this code blocks the system call (trap band or errno band).
    pub fn is_denied(&self) -> bool {
        is_denied_value(self.err)
    }

    /// Whether this code is a plain errno denial (neither allow nor trap).
    pub fn is_errno(&self) -> bool {
        self.err >= SECCOMP_RET_ERRNO + ERR_MIN_ERRNO
            && self.err <= SECCOMP_RET_ERRNO + ERR_MAX_ERRNO
    }

    /// The registered callback, if this is a trap code.
    pub fn trap_fnc(&self) -> Option<TrapFnc> {
        self.fnc
    }

    /// The auxiliary pointer the callback was registered with.
    pub fn trap_aux(&self) -> *mut c_void {
        self.aux
    }

    /// The dense 1-based trap id, if this is a trap code.
    pub fn trap_id(&self) -> Option<u16> {
        if (self.err & SECCOMP_RET_ACTION) == SECCOMP_RET_TRAP {
            #[allow(clippy::cast_possible_truncation)]
            let id = (self.err & SECCOMP_RET_DATA) as u16;
            Some(id)
        } else {
            None
        }
    }
}

/// Whether a raw encoded value denotes a denial. Shared with the verifier,
/// which only ever sees encoded values.
pub(crate) fn is_denied_value(err: u32) -> bool {
    (err & SECCOMP_RET_ACTION) == SECCOMP_RET_TRAP
        || (err >= SECCOMP_RET_ERRNO + ERR_MIN_ERRNO && err <= SECCOMP_RET_ERRNO + ERR_MAX_ERRNO)
}

impl PartialEq for ErrorCode {
    /// Two codes are the same decision iff they encode identically.
    fn eq(&self, other: &Self) -> bool {
        self.err == other.err
    }
}

impl Eq for ErrorCode {}

/// A contiguous span of system call numbers sharing one `ErrorCode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Range {
    /// First system call number in the span.
    pub from: u32,
    /// Last system call number in the span (inclusive).
    pub to: u32,
    /// Outcome for every number in `[from, to]`.
    pub code: ErrorCode,
}

impl Range {
    pub(crate) fn new(from: u32, to: u32, code: ErrorCode) -> Range {
        Range { from, to, code }
    }
}
