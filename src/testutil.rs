// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Forked-child helpers shared by the ptrace-heavy tests. Children never
//! return into the test harness; they either pause forever or `_exit`.

use std::io::Error;
use std::time::Duration;

pub struct Paused {
    pub pid: i32,
}

/// Fork a child that pauses forever. Returns `None` (with a note) when fork
/// itself is unavailable. The caller must `reap` the child.
pub fn pause_child() -> Option<Paused> {
    unsafe {
        let pid = libc::fork();
        if pid < 0 {
            eprintln!("skipping: fork failed ({})", Error::last_os_error());
            return None;
        }
        if pid == 0 {
            loop {
                libc::pause();
            }
        }
        // Let the child reach its pause loop.
        std::thread::sleep(Duration::from_millis(50));
        Some(Paused { pid })
    }
}

/// Fork a child that maps one writable anonymous page, seeds it with the
/// given 64-bit words, reports the page address through a pipe, and pauses.
/// Returns the child's pid and the page address.
pub fn seeded_child(values: &[u64]) -> Option<(i32, u64)> {
    unsafe {
        let mut pipefd = [0i32; 2];
        if libc::pipe(pipefd.as_mut_ptr()) != 0 {
            eprintln!("skipping: pipe failed ({})", Error::last_os_error());
            return None;
        }

        let pid = libc::fork();
        if pid < 0 {
            eprintln!("skipping: fork failed ({})", Error::last_os_error());
            libc::close(pipefd[0]);
            libc::close(pipefd[1]);
            return None;
        }

        if pid == 0 {
            libc::close(pipefd[0]);
            let page = libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if page == libc::MAP_FAILED {
                libc::_exit(1);
            }
            let words = page as *mut u64;
            for (i, v) in values.iter().enumerate() {
                words.add(i).write(*v);
            }
            let addr_bytes = (page as u64).to_ne_bytes();
            libc::write(pipefd[1], addr_bytes.as_ptr() as *const _, 8);
            libc::close(pipefd[1]);
            loop {
                libc::pause();
            }
        }

        libc::close(pipefd[1]);
        let mut addr_bytes = [0u8; 8];
        let n = libc::read(pipefd[0], addr_bytes.as_mut_ptr() as *mut _, 8);
        libc::close(pipefd[0]);
        if n != 8 {
            eprintln!("skipping: child did not report its page address");
            reap(pid);
            return None;
        }
        Some((pid, u64::from_ne_bytes(addr_bytes)))
    }
}

/// Kill and reap a forked test child.
pub fn reap(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGKILL);
        libc::waitpid(pid, std::ptr::null_mut(), 0);
    }
}

/// Attach to a forked child, or skip the test (reaping the child) when the
/// sandbox forbids ptrace.
pub fn attach_or_skip(pid: i32) -> Option<crate::process::TracedProcess> {
    let mut proc_ = crate::process::TracedProcess::new(pid).ok()?;
    match proc_.attach() {
        Ok(()) => Some(proc_),
        Err(e) => {
            eprintln!("skipping: ptrace attach unavailable ({})", e);
            reap(pid);
            None
        }
    }
}

/// Wait for a child to exit within `timeout`; returns its exit code, or
/// `None` (after killing it) when it does not exit in time.
pub fn wait_exit(pid: i32, timeout: Duration) -> Option<i32> {
    let start = std::time::Instant::now();
    loop {
        let mut status: libc::c_int = 0;
        let r = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if r == pid {
            if libc::WIFEXITED(status) {
                return Some(libc::WEXITSTATUS(status));
            }
            return None;
        }
        if start.elapsed() > timeout {
            reap(pid);
            return None;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
