// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Process control: ptrace attach/detach lifecycle and remote memory I/O.
//!
//! Reads and writes go through `process_vm_readv`/`process_vm_writev` first
//! and fall back to word-at-a-time `PTRACE_PEEKDATA`/`PTRACE_POKEDATA` when
//! the scatter-gather call fails or transfers short.

use std::io;
use std::mem;
use std::ptr;

use crate::region::{self, MemoryRegion};

const WORD: usize = mem::size_of::<libc::c_long>();

// ── Scatter-gather helpers ──────────────────────────────────────────────────

/// Read `buf.len()` bytes from `addr` in the target's address space via
/// `process_vm_readv`. Returns the number of bytes actually transferred.
/// Does not require a ptrace attachment; the checkpoint layer uses this
/// directly during its snapshot transaction.
pub(crate) fn vm_read(pid: i32, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let n = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write `buf` to `addr` in the target's address space via
/// `process_vm_writev`. Returns the number of bytes actually transferred.
pub(crate) fn vm_write(pid: i32, addr: u64, buf: &[u8]) -> io::Result<usize> {
    let local = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: addr as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let n = unsafe { libc::process_vm_writev(pid, &local, 1, &remote, 1, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

// ── ptrace word fallback ────────────────────────────────────────────────────

fn peek_word(pid: i32, addr: u64) -> io::Result<libc::c_long> {
    unsafe {
        *libc::__errno_location() = 0;
        let word = libc::ptrace(
            libc::PTRACE_PEEKDATA,
            pid,
            addr as *mut libc::c_void,
            ptr::null_mut::<libc::c_void>(),
        );
        let errno = *libc::__errno_location();
        if errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(word)
    }
}

fn poke_word(pid: i32, addr: u64, word: libc::c_long) -> io::Result<()> {
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEDATA,
            pid,
            addr as *mut libc::c_void,
            word as *mut libc::c_void,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn peek_range(pid: i32, addr: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut offset = 0usize;
    while offset < buf.len() {
        let word = peek_word(pid, addr + offset as u64)?;
        let bytes = word.to_ne_bytes();
        let take = WORD.min(buf.len() - offset);
        buf[offset..offset + take].copy_from_slice(&bytes[..take]);
        offset += WORD;
    }
    Ok(())
}

fn poke_range(pid: i32, addr: u64, buf: &[u8]) -> io::Result<()> {
    let full_words = buf.len() / WORD;
    for i in 0..full_words {
        let mut bytes = [0u8; WORD];
        bytes.copy_from_slice(&buf[i * WORD..(i + 1) * WORD]);
        poke_word(pid, addr + (i * WORD) as u64, libc::c_long::from_ne_bytes(bytes))?;
    }

    // Sub-word tail: read the word, patch the low bytes, write it back.
    let tail = buf.len() % WORD;
    if tail > 0 {
        let tail_addr = addr + (full_words * WORD) as u64;
        let mut bytes = peek_word(pid, tail_addr)?.to_ne_bytes();
        bytes[..tail].copy_from_slice(&buf[full_words * WORD..]);
        poke_word(pid, tail_addr, libc::c_long::from_ne_bytes(bytes))?;
    }
    Ok(())
}

// ── Wait helpers ────────────────────────────────────────────────────────────

fn wait_for_child(pid: i32) -> io::Result<libc::c_int> {
    let mut status: libc::c_int = 0;
    if unsafe { libc::waitpid(pid, &mut status, 0) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(status)
}

// ── Traced process ──────────────────────────────────────────────────────────

/// Handle to one stoppable traced process. Owns the attached flag (the
/// single source of truth for whether remote I/O is legal) and the region
/// tables rebuilt at every attach.
#[derive(Debug)]
pub struct TracedProcess {
    pid: i32,
    attached: bool,
    page_size: usize,
    readable_regions: Vec<MemoryRegion>,
    all_regions: Vec<MemoryRegion>,
}

impl TracedProcess {
    pub fn new(pid: i32) -> io::Result<Self> {
        if pid <= 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid process id {}", pid),
            ));
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as usize } else { 4096 };
        Ok(TracedProcess {
            pid,
            attached: false,
            page_size,
            readable_regions: Vec::new(),
            all_regions: Vec::new(),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Regions we can read from, sorted by start address.
    pub fn readable_regions(&self) -> &[MemoryRegion] {
        &self.readable_regions
    }

    /// The full region table, sorted by start address.
    pub fn all_regions(&self) -> &[MemoryRegion] {
        &self.all_regions
    }

    /// Attach to the target and wait for it to stop. A `SIGTRAP` arising
    /// from the child's own exec is consumed by continuing once and waiting
    /// for the subsequent `SIGSTOP`; any other stop signal is rejected.
    /// Attaching while already attached is a no-op.
    pub fn attach(&mut self) -> io::Result<()> {
        if self.attached {
            return Ok(());
        }

        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_ATTACH,
                self.pid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }

        if let Err(e) = self.await_attach_stop() {
            self.raw_detach();
            return Err(e);
        }

        self.attached = true;
        if let Err(e) = self.refresh_memory_map() {
            let _ = self.detach();
            return Err(e);
        }
        Ok(())
    }

    fn await_attach_stop(&self) -> io::Result<()> {
        let status = wait_for_child(self.pid)?;
        if !libc::WIFSTOPPED(status) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "process did not stop as expected",
            ));
        }

        if libc::WSTOPSIG(status) == libc::SIGTRAP {
            // Absorb the exec trap, then require the attach SIGSTOP.
            let rc = unsafe {
                libc::ptrace(
                    libc::PTRACE_CONT,
                    self.pid,
                    ptr::null_mut::<libc::c_void>(),
                    ptr::null_mut::<libc::c_void>(),
                )
            };
            if rc == -1 {
                return Err(io::Error::last_os_error());
            }
            let status = wait_for_child(self.pid)?;
            if !libc::WIFSTOPPED(status) {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "process did not stop as expected",
                ));
            }
            if libc::WSTOPSIG(status) != libc::SIGSTOP {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("unexpected stop signal {}", libc::WSTOPSIG(status)),
                ));
            }
        }
        Ok(())
    }

    fn raw_detach(&self) {
        unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                self.pid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            );
        }
    }

    /// Detach from the target. Detaching while not attached is a no-op.
    pub fn detach(&mut self) -> io::Result<()> {
        if !self.attached {
            return Ok(());
        }
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                self.pid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        self.attached = false;
        Ok(())
    }

    /// Rebuild the region tables from `/proc/[pid]/maps`. Fails when no
    /// region at all can be recovered.
    pub fn refresh_memory_map(&mut self) -> io::Result<()> {
        let mut all = region::read_process_maps(self.pid)?;
        all.sort_by_key(|r| r.start);

        if all.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("no regions recovered from /proc/{}/maps", self.pid),
            ));
        }

        let mut readable: Vec<MemoryRegion> =
            all.iter().filter(|r| r.is_readable).cloned().collect();
        readable.sort_by_key(|r| r.start);

        self.all_regions = all;
        self.readable_regions = readable;
        Ok(())
    }

    /// Read `buf.len()` bytes from the target at `addr`. Fails when not
    /// attached; scatter-gather first, word-by-word peek fallback.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> io::Result<()> {
        if !self.attached {
            return Err(io::Error::new(io::ErrorKind::Other, "not attached"));
        }
        match vm_read(self.pid, addr, buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(n) => {
                tracing::debug!(addr, want = buf.len(), got = n, "short remote read, using ptrace fallback");
            }
            Err(e) => {
                tracing::debug!(addr, error = %e, "process_vm_readv failed, using ptrace fallback");
            }
        }
        peek_range(self.pid, addr, buf)
    }

    /// Write `buf` to the target at `addr`. Fails when not attached;
    /// scatter-gather first, word-by-word poke fallback with a
    /// read-patch-write sub-word tail.
    pub fn write_memory(&self, addr: u64, buf: &[u8]) -> io::Result<()> {
        if !self.attached {
            return Err(io::Error::new(io::ErrorKind::Other, "not attached"));
        }
        match vm_write(self.pid, addr, buf) {
            Ok(n) if n == buf.len() => return Ok(()),
            Ok(n) => {
                tracing::debug!(addr, want = buf.len(), got = n, "short remote write, using ptrace fallback");
            }
            Err(e) => {
                tracing::debug!(addr, error = %e, "process_vm_writev failed, using ptrace fallback");
            }
        }
        poke_range(self.pid, addr, buf)
    }

    /// Whether `addr` falls inside some mapped region of the target.
    pub fn is_valid_pointer_target(&self, addr: u64) -> bool {
        region::is_valid_target(addr, &self.all_regions)
    }

    /// Heuristic pointer test against the current region table.
    pub fn is_likely_pointer(&self, value: u64) -> bool {
        region::is_likely_pointer(value, &self.all_regions)
    }
}

impl Drop for TracedProcess {
    fn drop(&mut self) {
        if self.attached {
            if let Err(e) = self.detach() {
                tracing::warn!(pid = self.pid, error = %e, "detach on drop failed");
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
