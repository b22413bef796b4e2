// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide sandbox lifecycle: support detection, policy configuration
//! and the irrevocable switch into enforcement.
//!
//! Kernel support is established empirically. Reading version numbers says
//! nothing about seccomp-BPF actually working, so the detector forks a
//! throwaway child, installs a canary policy in it, and checks that the
//! kernel enforces the expected verdicts. A second probe confirms that the
//! legacy vsyscall page cannot be used to bypass filtering.
//!
//! Once `start_sandbox` returns, the calling process can never leave the
//! sandbox again. Every setup error on that path is deliberately fatal; a
//! process that silently continues unsandboxed defeats the whole point.

use std::os::raw::{c_int, c_ushort};
use std::os::unix::io::RawFd;
use std::sync::{Mutex, PoisonError};

use log::{info, warn};

use crate::common::sock_filter;
use crate::compiler::{self, SyscallEvaluator};
use crate::errorcode::ErrorCode;
use crate::fatal::{die, die_bytes, write_fd};
use crate::syscall_iterator::{is_valid_syscall_number, SyscallIterator};
use crate::trap;

/// Exit code a probe child must produce to prove the canary policy was
/// enforced. Any other exit, including clean exit 0, fails the probe.
const EXPECTED_EXIT_CODE: c_int = 100;

/// See `struct sock_fprog` in /usr/include/linux/filter.h .
#[repr(C)]
struct sock_fprog {
    len: c_ushort,
    filter: *const sock_filter,
}

/// Where the process stands in the sandbox lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxStatus {
    /// Support has not been determined yet.
    Unknown,
    /// The kernel cannot run this sandbox; permanent.
    Unsupported,
    /// Temporarily unusable, currently because the process is
    /// multi-threaded.
    Unavailable,
    /// The sandbox can be started.
    Available,
    /// The sandbox is enforcing; permanent.
    Enabled,
}

#[derive(Debug)]
struct Sandbox {
    status: SandboxStatus,
    proc_fd: RawFd,
    evaluator: Option<SyscallEvaluator>,
}

static GLOBAL: Mutex<Sandbox> = Mutex::new(Sandbox::new());

fn lock_global() -> std::sync::MutexGuard<'static, Sandbox> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Determines whether the sandbox can be used.
///
/// `proc_fd` should be a file descriptor for `/proc`, opened while that was
/// still permitted, or -1 if none is available. Passing -1 degrades the
/// multi-threading check to an optimistic guess.
///
/// The verdict moves between `Available` and `Unavailable` as threads come
/// and go; an `Unsupported` verdict is final.
pub fn supports_seccomp_sandbox(proc_fd: RawFd) -> SandboxStatus {
    lock_global().supports(proc_fd)
}

/// Configures the policy that `start_sandbox` will enforce. Must be called
/// exactly once, before the sandbox is started. Terminates the process on
/// any misuse, and on policies that fail to deny all invalid syscall numbers
/// with one and the same errno.
pub fn set_sandbox_policy(evaluator: SyscallEvaluator) {
    lock_global().set_policy(evaluator);
}

/// Compiles the configured policy, installs it into the kernel and flips the
/// process into enforcement. Irrevocable. The process must still be
/// single-threaded at this point.
pub fn start_sandbox() {
    lock_global().start_internal(false);
}

impl Sandbox {
    const fn new() -> Sandbox {
        Sandbox {
            status: SandboxStatus::Unknown,
            proc_fd: -1,
            evaluator: None,
        }
    }

    fn supports(&mut self, proc_fd: RawFd) -> SandboxStatus {
        if self.status == SandboxStatus::Unknown {
            if proc_fd >= 0 && self.proc_fd < 0 {
                self.proc_fd = proc_fd;
            }
            self.status = if kernel_supports_seccomp(self.proc_fd) {
                SandboxStatus::Available
            } else {
                SandboxStatus::Unsupported
            };
        }
        // Multi-threadedness is transient; flip between Available and
        // Unavailable without redoing the kernel probes.
        if self.status == SandboxStatus::Available && !is_single_threaded(self.proc_fd) {
            self.status = SandboxStatus::Unavailable;
        } else if self.status == SandboxStatus::Unavailable && is_single_threaded(self.proc_fd) {
            self.status = SandboxStatus::Available;
        }
        self.status
    }

    fn set_policy(&mut self, evaluator: SyscallEvaluator) {
        if self.status == SandboxStatus::Enabled {
            die(Some("Cannot change policy after sandbox has started"));
        }
        if self.evaluator.is_some() {
            die(Some("Cannot change policy after it has been configured"));
        }
        // A policy that lets unknown syscall numbers through, or denies them
        // unevenly, is always a bug; catch it at configuration time rather
        // than when the filter is compiled.
        let mut invalid_denial: Option<ErrorCode> = None;
        #[allow(clippy::cast_possible_wrap)]
        for sysnum in SyscallIterator::new(true) {
            let code = evaluator(sysnum as i32);
            if !code.is_denied() {
                die(Some("Policies should deny system calls that are outside the valid range"));
            }
            if !code.is_errno() {
                die(Some("Policies should deny invalid system calls with a plain errno"));
            }
            match invalid_denial {
                None => invalid_denial = Some(code),
                Some(expected) => {
                    if code != expected {
                        die(Some("Policies should deny all invalid system calls identically"));
                    }
                }
            }
        }
        self.evaluator = Some(evaluator);
    }

    fn start_internal(&mut self, quiet: bool) {
        match self.status {
            SandboxStatus::Unsupported | SandboxStatus::Unavailable => {
                die(Some("Trying to start sandbox, even though it is known to be unavailable"));
            }
            SandboxStatus::Enabled => {
                die(Some("Cannot start sandbox multiple times"));
            }
            // Unknown is allowed through on purpose: probe children enforce
            // their canary policy without ever probing recursively.
            SandboxStatus::Unknown | SandboxStatus::Available => {}
        }
        if self.proc_fd < 0 {
            // SAFETY: opening a static path; the fd is owned below.
            self.proc_fd = unsafe {
                libc::open(
                    b"/proc\0".as_ptr().cast(),
                    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                )
            };
        }
        if !is_single_threaded(self.proc_fd) {
            die(Some("Cannot start sandbox, if process is already multi-threaded"));
        }
        // /proc is no longer needed, and the fd must not leak into the
        // sandboxed phase.
        if self.proc_fd >= 0 {
            // SAFETY: fd is owned by this struct and valid.
            unsafe { libc::close(self.proc_fd) };
            self.proc_fd = -1;
        }
        self.install_filter(quiet);
        self.status = SandboxStatus::Enabled;
    }

    fn install_filter(&mut self, quiet: bool) {
        let evaluator = match self.evaluator {
            Some(evaluator) => evaluator,
            None => die(Some("Cannot install filter before a policy was configured")),
        };

        if trap::install_sigsys_handler().is_err() {
            die_quiet(quiet, "Failed to configure SIGSYS handler");
        }
        // The probe children run with all signals blocked; SIGSYS must be
        // deliverable once the filter is active.
        // SAFETY: sigset is initialized by sigemptyset before use.
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGSYS);
            if libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()) != 0 {
                die_quiet(quiet, "Failed to unblock SIGSYS");
            }
        }

        let program = match compiler::build_program(evaluator) {
            Ok(program) => program,
            Err(err) => {
                if quiet {
                    die(None);
                }
                die_bytes(Some(format!("Policy compilation failed: {err}").as_bytes()));
            }
        };
        if !quiet {
            info!(
                "installing seccomp filter ({} instructions)",
                program.len()
            );
        }
        #[allow(clippy::cast_possible_truncation)]
        let prog = sock_fprog {
            len: program.len() as c_ushort,
            filter: program.as_ptr(),
        };

        // SAFETY: `prog` points at a live, correctly sized program.
        unsafe {
            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                die_quiet(quiet, "Kernel refuses to enable no-new-privs");
            }
            if libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &prog as *const sock_fprog,
            ) != 0
            {
                die_quiet(quiet, "Kernel refuses to turn on BPF filters");
            }
        }
        // The kernel keeps its own copy. Dropping ours would issue syscalls
        // that the just-installed policy may already deny.
        std::mem::forget(program);
    }
}

fn die_quiet(quiet: bool, msg: &str) -> ! {
    if quiet {
        die(None);
    }
    die(Some(msg))
}

/// Counts threads via the link count of `/proc/self/task`: two directory
/// links plus one per thread. Without a `/proc` fd the check degrades to an
/// optimistic guess.
fn is_single_threaded(proc_fd: RawFd) -> bool {
    if proc_fd < 0 {
        warn!("single-thread check skipped, no /proc available");
        return true;
    }
    // SAFETY: static relative path under an owned directory fd.
    let task_fd = unsafe {
        libc::openat(
            proc_fd,
            b"self/task\0".as_ptr().cast(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    };
    if task_fd < 0 {
        return false;
    }
    // SAFETY: `st` is fully written by a successful fstat.
    let single = unsafe {
        let mut st: libc::stat = std::mem::zeroed();
        let rc = libc::fstat(task_fd, &mut st);
        libc::close(task_fd);
        rc == 0 && st.st_nlink == 3
    };
    single
}

fn kernel_supports_seccomp(proc_fd: RawFd) -> bool {
    run_probe(probe_process, probe_evaluator, proc_fd)
        && run_probe(try_vsyscall_process, allow_all_evaluator, proc_fd)
}

/// Canary policy: `getpid` fails with EPERM, `exit_group` is allowed,
/// everything else fails with EINVAL.
fn probe_evaluator(sysnum: i32) -> ErrorCode {
    match i64::from(sysnum) {
        libc::SYS_getpid => ErrorCode::errno(libc::EPERM),
        libc::SYS_exit_group => ErrorCode::ALLOWED,
        _ => ErrorCode::errno(libc::EINVAL),
    }
}

/// Runs in the probe child, under `probe_evaluator`. Proves enforcement by
/// observing the canary verdicts from the inside.
fn probe_process() {
    // SAFETY: raw syscall so the canary policy sees the real syscall; the
    // libc wrapper may cache getpid.
    let pid = unsafe { libc::syscall(libc::SYS_getpid) };
    // SAFETY: errno read, async-signal-safe.
    let errno = unsafe { *libc::__errno_location() };
    if pid < 0 && errno == libc::EPERM {
        // SAFETY: terminates the probe child.
        unsafe { libc::syscall(libc::SYS_exit_group, i64::from(EXPECTED_EXIT_CODE)) };
    }
}

/// Permissive policy for the vsyscall probe; only invalid numbers are
/// denied.
fn allow_all_evaluator(sysnum: i32) -> ErrorCode {
    if is_valid_syscall_number(sysnum) {
        ErrorCode::ALLOWED
    } else {
        ErrorCode::errno(libc::ENOSYS)
    }
}

/// Runs in the probe child, under `allow_all_evaluator`. On x86_64, `time`
/// may go through the legacy vsyscall page, bypassing seccomp entirely; a
/// kernel where that bypass still works cannot host this sandbox.
fn try_vsyscall_process() {
    // SAFETY: time(2) with a null out-pointer is always valid.
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    if now != -1 {
        // SAFETY: terminates the probe child.
        unsafe { libc::syscall(libc::SYS_exit_group, i64::from(EXPECTED_EXIT_CODE)) };
    }
}

/// Raw-writes a stderr-setup diagnostic into the probe pipe. Runs in a
/// freshly forked child, so no allocation or formatting machinery.
#[allow(clippy::cast_possible_truncation)]
fn write_stderr_setup_failure(out_fd: RawFd, errno: c_int) {
    let mut digits = [0u8; 10];
    let mut n = errno.unsigned_abs();
    let mut pos = digits.len();
    loop {
        pos -= 1;
        digits[pos] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    write_fd(out_fd, b"Failed to set up stderr: ");
    write_fd(out_fd, &digits[pos..]);
    write_fd(out_fd, b"\n");
}

/// Forks a child, installs `evaluator` in it and runs `body`. The child
/// borrows `proc_fd` for its own single-thread check; pass -1 if none is
/// available. The probe succeeds iff the child exits with
/// `EXPECTED_EXIT_CODE`. A diagnostic the child leaves on its stderr pipe
/// marks an unexpected, fatal failure.
fn run_probe(body: fn(), evaluator: SyscallEvaluator, proc_fd: RawFd) -> bool {
    // Block signals around the fork so the child starts deterministic.
    // SAFETY: both sets are initialized by sigfillset/sigprocmask.
    let old_mask = unsafe {
        let mut all: libc::sigset_t = std::mem::zeroed();
        let mut old: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut all);
        if libc::sigprocmask(libc::SIG_BLOCK, &all, &mut old) != 0 {
            die(Some("Failed to block signals"));
        }
        old
    };

    let mut fds: [RawFd; 2] = [-1, -1];
    // SAFETY: the array has room for both pipe ends.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        die(Some("Failed to create pipe"));
    }
    // The child redirects stderr over the write end; that only works if the
    // standard descriptors are actually occupied.
    if fds[0] <= 2 || fds[1] <= 2 {
        die(Some("Process started without standard file descriptors"));
    }

    // SAFETY: fork with all signals blocked; the child only calls
    // async-signal-safe functions until it replaces its own state.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        die(Some("Failed to fork"));
    }
    if pid == 0 {
        // Route fatal diagnostics into the pipe. A child that cannot rewire
        // its stderr is itself a broken probe and must not report a pass.
        // SAFETY: rewiring fds owned by this (single-threaded) child.
        let wired = unsafe {
            libc::close(fds[0]) == 0
                && libc::dup2(fds[1], libc::STDERR_FILENO) == libc::STDERR_FILENO
                && libc::close(fds[1]) == 0
        };
        if !wired {
            // SAFETY: errno read.
            let errno = unsafe { *libc::__errno_location() };
            write_stderr_setup_failure(fds[1], errno);
            die(None);
        }
        let mut child = Sandbox::new();
        child.proc_fd = proc_fd;
        child.set_policy(evaluator);
        child.start_internal(true);
        body();
        // `body` must exit via exit_group; reaching this point means the
        // kernel did not enforce the policy.
        die(None);
    }

    // SAFETY: closing our copy of the write end, restoring the signal mask.
    unsafe {
        libc::close(fds[1]);
        libc::sigprocmask(libc::SIG_SETMASK, &old_mask, std::ptr::null_mut());
    }

    let mut status: c_int = 0;
    let rc = loop {
        // SAFETY: status out-pointer is valid.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        // SAFETY: errno read.
        if rc >= 0 || unsafe { *libc::__errno_location() } != libc::EINTR {
            break rc;
        }
    };
    let passed =
        rc == pid && libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == EXPECTED_EXIT_CODE;

    if !passed {
        // An expected failure exits silently. Any diagnostic in the pipe
        // means the sandbox setup itself is broken.
        let mut buf = [0u8; 4096];
        // SAFETY: reading into a live buffer; the pipe is non-blocking.
        let len = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        if len > 0 {
            #[allow(clippy::cast_sign_loss)]
            let mut len = len as usize;
            while len > 0 && buf[len - 1] == b'\n' {
                len -= 1;
            }
            die_bytes(Some(&buf[..len]));
        }
    }
    // SAFETY: closing our copy of the read end.
    unsafe { libc::close(fds[0]) };
    passed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_policy_verdicts() {
        assert_eq!(
            probe_evaluator(libc::SYS_getpid as i32),
            ErrorCode::errno(libc::EPERM)
        );
        assert_eq!(
            probe_evaluator(libc::SYS_exit_group as i32),
            ErrorCode::ALLOWED
        );
        assert_eq!(
            probe_evaluator(libc::SYS_openat as i32),
            ErrorCode::errno(libc::EINVAL)
        );
    }

    #[test]
    fn test_allow_all_still_denies_invalid_numbers() {
        assert_eq!(
            allow_all_evaluator(libc::SYS_openat as i32),
            ErrorCode::ALLOWED
        );
        assert_eq!(allow_all_evaluator(-1), ErrorCode::errno(libc::ENOSYS));
    }

    #[test]
    fn test_unavailable_recovers_without_reprobing() {
        // With no /proc fd the thread check degrades to "single-threaded",
        // so an Unavailable sandbox flips straight back to Available.
        let mut sandbox = Sandbox::new();
        sandbox.status = SandboxStatus::Unavailable;
        assert_eq!(sandbox.supports(-1), SandboxStatus::Available);
    }

    #[test]
    fn test_enabled_is_terminal_for_supports() {
        let mut sandbox = Sandbox::new();
        sandbox.status = SandboxStatus::Enabled;
        assert_eq!(sandbox.supports(-1), SandboxStatus::Enabled);
    }

    #[test]
    fn test_stderr_setup_diagnostic_reaches_the_pipe() {
        let mut fds: [RawFd; 2] = [-1, -1];
        // SAFETY: the array has room for both pipe ends.
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        write_stderr_setup_failure(fds[1], libc::EACCES);

        let mut buf = [0u8; 64];
        // SAFETY: reading into a live buffer.
        let len = unsafe { libc::read(fds[0], buf.as_mut_ptr().cast(), buf.len()) };
        let len = usize::try_from(len).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..len]).unwrap(),
            "Failed to set up stderr: 13\n"
        );
        // SAFETY: both fds were opened above.
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_probe_child_borrows_the_callers_proc_fd() {
        // SAFETY: opening a static path; closed below.
        let proc_fd = unsafe {
            libc::open(
                b"/proc\0".as_ptr().cast(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        assert!(proc_fd >= 0);

        let _ = run_probe(probe_process, probe_evaluator, proc_fd);

        // The child runs its thread check on the borrowed fd and closes only
        // its own copy; the caller's fd must stay usable afterwards.
        // SAFETY: fstat on an fd this test owns.
        let alive = unsafe {
            let mut st: libc::stat = std::mem::zeroed();
            libc::fstat(proc_fd, &mut st) == 0
        };
        assert!(alive);
        // SAFETY: fd opened above.
        unsafe { libc::close(proc_fd) };
    }

    #[test]
    fn test_thread_counting() {
        let proc_fd = unsafe {
            libc::open(
                b"/proc\0".as_ptr().cast(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        assert!(proc_fd >= 0);

        // With an extra thread parked, the process cannot look
        // single-threaded.
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let parked = std::thread::spawn(move || {
            rx.recv().ok();
        });
        assert!(!is_single_threaded(proc_fd));
        tx.send(()).unwrap();
        parked.join().unwrap();

        unsafe { libc::close(proc_fd) };
    }
}
