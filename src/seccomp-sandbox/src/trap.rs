// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Registration and dispatch of `SECCOMP_RET_TRAP` callbacks.
//!
//! The filter can only carry a 16-bit payload per trap, so callbacks are
//! registered ahead of time and the payload is a dense 1-based id into a
//! process-global table. Registration deduplicates on the (callback,
//! auxiliary pointer) pair, which keeps filter generation idempotent.
//!
//! The SIGSYS handler may interrupt any thread at any instruction, so it
//! reads the table through a pair of atomics rather than the registry mutex.
//! Each registration republishes a freshly leaked snapshot of the table; old
//! snapshots stay valid forever, so a handler racing a registration sees a
//! consistent, possibly slightly stale, table. The leak is bounded by
//! `MAX_TRAPS` registrations over the process lifetime.

use std::collections::BTreeMap;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::common::SeccompData;
use crate::errorcode::{ErrorCode, TrapFnc};
use crate::fatal::die;

/// Upper bound on distinct trap registrations. Ids must fit the 16-bit
/// `SECCOMP_RET_DATA` field of the filter return value.
pub(crate) const MAX_TRAPS: usize = 1 << 15;

/// `si_code` the kernel sets on a seccomp-generated SIGSYS.
const SYS_SECCOMP_CODE: c_int = 1;

// Offsets of the `_sigsys` fields inside `siginfo_t`, counted in units of
// the pointed-to type. `call_addr` sits after the three leading ints plus
// padding, `syscall` and `arch` follow it.
const SI_OFF_CALL_ADDR: isize = 2;
const SI_OFF_SYSCALL: isize = 6;
const SI_OFF_ARCH: isize = 7;

/// One registered callback, as seen by the SIGSYS handler.
#[derive(Clone, Copy, Debug)]
struct TrapEntry {
    fnc: TrapFnc,
    aux: *mut c_void,
}

// SAFETY: the registry never dereferences `aux`; it is an opaque token that
// only the registered callback interprets, on whatever thread SIGSYS lands.
unsafe impl Send for TrapEntry {}

#[derive(Debug, Default)]
struct Registry {
    /// (callback address, aux address) -> assigned id.
    ids: BTreeMap<(usize, usize), u16>,
    /// Entries indexed by id - 1.
    entries: Vec<TrapEntry>,
    /// Message data pointer -> leaked aux pointer, so repeated `kill` calls
    /// with the same message reuse one registration.
    kill_msgs: BTreeMap<usize, usize>,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    ids: BTreeMap::new(),
    entries: Vec::new(),
    kill_msgs: BTreeMap::new(),
});

// Published table snapshot. Writers store the pointer before the length;
// readers load the length before the pointer, so an id that passes the
// length check always indexes an array at least that long.
static TRAP_ARRAY: AtomicPtr<TrapEntry> = AtomicPtr::new(std::ptr::null_mut());
static TRAP_ARRAY_LEN: AtomicUsize = AtomicUsize::new(0);

fn lock_registry() -> std::sync::MutexGuard<'static, Registry> {
    // A poisoning panic cannot corrupt the table: snapshots are immutable
    // once published.
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

fn register(fnc: TrapFnc, aux: *mut c_void) -> u16 {
    let mut reg = lock_registry();
    let key = (fnc as usize, aux as usize);
    if let Some(&id) = reg.ids.get(&key) {
        return id;
    }
    if reg.entries.len() >= MAX_TRAPS {
        drop(reg);
        die(Some("Too many SECCOMP_RET_TRAP callbacks requested"));
    }
    reg.entries.push(TrapEntry { fnc, aux });
    #[allow(clippy::cast_possible_truncation)]
    let id = reg.entries.len() as u16;
    reg.ids.insert(key, id);

    let snapshot: Box<[TrapEntry]> = reg.entries.clone().into_boxed_slice();
    let len = snapshot.len();
    let ptr = Box::into_raw(snapshot).cast::<TrapEntry>();
    TRAP_ARRAY.store(ptr, Ordering::Release);
    TRAP_ARRAY_LEN.store(len, Ordering::Release);
    id
}

/// Registers `fnc` to be invoked, with `aux`, whenever a system call matched
/// to the returned code is attempted. Idempotent per (callback, aux) pair.
pub fn trap(fnc: TrapFnc, aux: *mut c_void) -> ErrorCode {
    let id = register(fnc, aux);
    ErrorCode::trap(fnc, aux, id)
}

/// Returns a code that terminates the process with `msg` on stderr when the
/// matched system call is attempted. Idempotent per message.
pub fn kill(msg: &'static str) -> ErrorCode {
    let aux = {
        let mut reg = lock_registry();
        let key = msg.as_ptr() as usize;
        match reg.kill_msgs.get(&key) {
            Some(&aux) => aux,
            None => {
                // Leaked on purpose: the filter outlives every scope and may
                // fire this trap at any later point in the process lifetime.
                let aux = Box::into_raw(Box::new(msg)) as usize;
                reg.kill_msgs.insert(key, aux);
                aux
            }
        }
    };
    trap(bpf_failure, aux as *mut c_void)
}

fn bpf_failure(_data: &SeccompData, aux: *mut c_void) -> i64 {
    // SAFETY: `aux` was minted by `kill` from a leaked boxed `&'static str`.
    let msg: &str = unsafe { *aux.cast::<&'static str>() };
    die(Some(msg))
}

/// Installs the SIGSYS dispatcher. Must be called before a trapping filter is
/// loaded into the kernel; a SIGSYS with the default disposition kills the
/// process with no diagnostic.
pub(crate) fn install_sigsys_handler() -> Result<(), std::io::Error> {
    // SAFETY: zeroing a sigaction yields a valid all-defaults value.
    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    act.sa_sigaction = sigsys_handler as usize;
    act.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    // SAFETY: `sa_mask` is a valid sigset owned by `act`.
    unsafe { libc::sigfillset(&mut act.sa_mask) };
    // SAFETY: `act` is fully initialized and outlives the call.
    if unsafe { libc::sigaction(libc::SIGSYS, &act, std::ptr::null_mut()) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
unsafe fn context_syscall_info(uctx: *const libc::ucontext_t) -> (i64, u64, [u64; 6]) {
    let gregs = &(*uctx).uc_mcontext.gregs;
    #[allow(clippy::cast_sign_loss)]
    let info = (
        gregs[libc::REG_RAX as usize],
        gregs[libc::REG_RIP as usize] as u64,
        [
            gregs[libc::REG_RDI as usize] as u64,
            gregs[libc::REG_RSI as usize] as u64,
            gregs[libc::REG_RDX as usize] as u64,
            gregs[libc::REG_R10 as usize] as u64,
            gregs[libc::REG_R8 as usize] as u64,
            gregs[libc::REG_R9 as usize] as u64,
        ],
    );
    info
}

#[cfg(target_arch = "x86_64")]
unsafe fn context_set_result(uctx: *mut libc::ucontext_t, rc: i64) {
    (*uctx).uc_mcontext.gregs[libc::REG_RAX as usize] = rc;
}

#[cfg(target_arch = "aarch64")]
unsafe fn context_syscall_info(uctx: *const libc::ucontext_t) -> (i64, u64, [u64; 6]) {
    let regs = &(*uctx).uc_mcontext.regs;
    #[allow(clippy::cast_possible_wrap)]
    let info = (
        regs[8] as i64,
        (*uctx).uc_mcontext.pc,
        [regs[0], regs[1], regs[2], regs[3], regs[4], regs[5]],
    );
    info
}

#[cfg(target_arch = "aarch64")]
unsafe fn context_set_result(uctx: *mut libc::ucontext_t, rc: i64) {
    #[allow(clippy::cast_sign_loss)]
    {
        (*uctx).uc_mcontext.regs[0] = rc as u64;
    }
}

/// The SIGSYS handler. Everything here must remain async-signal-safe: no
/// allocation, no locks, no formatted output. All inconsistencies are fatal;
/// a SIGSYS we cannot attribute to our own filter means the process state is
/// no longer trustworthy.
extern "C" fn sigsys_handler(num: c_int, info: *mut libc::siginfo_t, ctx: *mut c_void) {
    // SAFETY: `__errno_location` is async-signal-safe and always valid.
    let saved_errno = unsafe { *libc::__errno_location() };

    if num != libc::SIGSYS || info.is_null() || ctx.is_null() {
        die(Some("Unexpected SIGSYS received"));
    }
    // SAFETY: `info` points to the kernel-provided siginfo for this signal.
    let si_code = unsafe { (*info).si_code };
    if si_code != SYS_SECCOMP_CODE {
        die(Some("Unexpected SIGSYS received"));
    }
    // The kernel delivers the filter's 16-bit payload in `si_errno`.
    // SAFETY: as above.
    let trap_id = unsafe { (*info).si_errno };

    let len = TRAP_ARRAY_LEN.load(Ordering::Acquire);
    #[allow(clippy::cast_sign_loss)]
    if trap_id < 1 || trap_id as usize > len {
        die(Some("Cannot find any handler for this syscall trap"));
    }
    let table = TRAP_ARRAY.load(Ordering::Acquire);
    // SAFETY: the length check above guarantees the published array holds at
    // least `trap_id` entries, and published arrays are never freed.
    #[allow(clippy::cast_sign_loss)]
    let entry = unsafe { *table.add(trap_id as usize - 1) };

    // SAFETY: `_sigsys` is the active siginfo union member for SYS_SECCOMP;
    // libc does not expose it, so read it at its known field offsets.
    let (si_syscall, si_arch, si_call_addr) = unsafe {
        (
            *info.cast::<i32>().offset(SI_OFF_SYSCALL),
            *info.cast::<u32>().offset(SI_OFF_ARCH),
            *info.cast::<u64>().offset(SI_OFF_CALL_ADDR),
        )
    };
    if si_arch != crate::common::SECCOMP_ARCH {
        die(Some("Unexpected audit architecture in SIGSYS"));
    }

    let uctx = ctx.cast::<libc::ucontext_t>();
    // SAFETY: `ctx` is the kernel-provided ucontext for this signal.
    let (ctx_nr, ctx_ip, args) = unsafe { context_syscall_info(uctx) };
    // Cross-check siginfo against the machine context; a mismatch means the
    // signal did not come from our filter.
    #[allow(clippy::cast_possible_truncation)]
    if ctx_nr as i32 != si_syscall || ctx_ip != si_call_addr {
        die(Some("Syscall information in siginfo and ucontext disagree"));
    }

    let data = SeccompData {
        nr: si_syscall,
        arch: si_arch,
        instruction_pointer: si_call_addr,
        args,
    };
    let rc = (entry.fnc)(&data, entry.aux);

    // SAFETY: as above; the updated result register takes effect on return.
    unsafe {
        context_set_result(uctx, rc);
        *libc::__errno_location() = saved_errno;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler_a(_data: &SeccompData, _aux: *mut c_void) -> i64 {
        -libc::ENOMEM as i64
    }

    fn handler_b(_data: &SeccompData, _aux: *mut c_void) -> i64 {
        0
    }

    #[test]
    fn test_registration_is_idempotent() {
        let mut cookie = 0u32;
        let aux: *mut c_void = (&mut cookie as *mut u32).cast();
        let first = trap(handler_a, aux);
        let second = trap(handler_a, aux);
        assert_eq!(first, second);
        assert!(first.is_denied());
        assert!(first.trap_id().is_some());
    }

    #[test]
    fn test_distinct_pairs_get_distinct_ids() {
        let mut x = 0u32;
        let mut y = 0u32;
        let with_x = trap(handler_b, (&mut x as *mut u32).cast());
        let with_y = trap(handler_b, (&mut y as *mut u32).cast());
        assert_ne!(with_x, with_y);
        let other_fnc = trap(handler_a, (&mut x as *mut u32).cast());
        assert_ne!(with_x, other_fnc);
    }

    #[test]
    fn test_kill_deduplicates_by_message() {
        let msg = "filter self-destructed";
        assert_eq!(kill(msg), kill(msg));
    }

    #[test]
    fn test_published_table_matches_registration() {
        let mut cookie = 0u32;
        let aux: *mut c_void = (&mut cookie as *mut u32).cast();
        let code = trap(handler_a, aux);
        assert_eq!(code.trap_fnc().map(|f| f as usize), Some(handler_a as usize));
        assert_eq!(code.trap_aux(), aux);
        let id = usize::from(code.trap_id().unwrap());

        let len = TRAP_ARRAY_LEN.load(Ordering::Acquire);
        assert!(id <= len);
        let table = TRAP_ARRAY.load(Ordering::Acquire);
        let entry = unsafe { *table.add(id - 1) };
        assert_eq!(entry.fnc as usize, handler_a as usize);
        assert_eq!(entry.aux as usize, aux as usize);
    }
}
