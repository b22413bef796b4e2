// Copyright 2024 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Unrecoverable-error termination.
//!
//! The sandbox must never keep running after a setup mistake: a process that
//! believes it is sandboxed when it is not is strictly worse than a dead one.
//! Diagnostics go through raw `write(2)` so this path stays usable from the
//! SIGSYS handler, where allocation and formatted logging are off limits.

use std::os::unix::io::RawFd;

const PREFIX: &[u8] = b"seccomp-sandbox: ";

/// Writes `buf` to `fd`, retrying on `EINTR`. Best effort; a failing
/// descriptor must not keep the process alive.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) {
    let mut written = 0;
    while written < buf.len() {
        // SAFETY: the pointer/length pair describes a live slice.
        let rc = unsafe {
            libc::write(
                fd,
                buf[written..].as_ptr().cast(),
                buf.len() - written,
            )
        };
        if rc > 0 {
            #[allow(clippy::cast_sign_loss)]
            {
                written += rc as usize;
            }
        } else if rc < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
            continue;
        } else {
            return;
        }
    }
}

/// Writes `buf` to stderr, retrying on `EINTR`.
pub(crate) fn write_stderr(buf: &[u8]) {
    write_fd(libc::STDERR_FILENO, buf);
}

/// Terminates the process with an optional diagnostic on stderr.
///
/// `None` is the quiet variant used by self-test children, where the failure
/// is expected and reported through the probe pipe instead.
pub(crate) fn die_bytes(msg: Option<&[u8]>) -> ! {
    if let Some(msg) = msg {
        write_stderr(PREFIX);
        write_stderr(msg);
        write_stderr(b"\n");
    }
    // SAFETY: `_exit` never returns and performs no cleanup, which is exactly
    // what an async-signal-safe fatal path needs.
    unsafe { libc::_exit(1) }
}

/// Terminates the process with an optional diagnostic on stderr.
pub(crate) fn die(msg: Option<&str>) -> ! {
    die_bytes(msg.map(str::as_bytes))
}
