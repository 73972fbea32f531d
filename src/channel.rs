// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Signal control channel between the traced process and the monitor.
//!
//! Commands travel child → monitor on the `REQUEST` real-time signal with
//! the whole command packed into the queued `sigval`; the monitor answers
//! monitor → child on `RESPONSE`. Handlers on both sides only perform
//! atomic stores. Every non-trivial step happens outside signal context,
//! in the control thread that drains the pending flag or in the sender
//! blocked on the response wait.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

// ── Command encoding ────────────────────────────────────────────────────────

const PARAM_BITS: u32 = 28;
const PARAM_MASK: u64 = (1 << PARAM_BITS) - 1;

/// Commands a traced process may send to the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorCommand {
    NoOp = 0,
    /// Snapshot writable memory.
    Checkpoint = 1,
    /// Write the last snapshot back.
    Restore = 2,
    /// Run a scan with the injection strategy live.
    InjectErrors = 3,
    /// Run a scan and report statistics.
    Scan = 4,
}

impl MonitorCommand {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MonitorCommand::NoOp),
            1 => Some(MonitorCommand::Checkpoint),
            2 => Some(MonitorCommand::Restore),
            3 => Some(MonitorCommand::InjectErrors),
            4 => Some(MonitorCommand::Scan),
            _ => None,
        }
    }
}

/// One command plus its two 28-bit parameters, as carried by a single
/// queued pointer-width value: `[kind:8][param1:28][param2:28]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub cmd: MonitorCommand,
    pub param1: u32,
    pub param2: u32,
}

impl CommandRequest {
    /// Parameters are truncated to 28 bits.
    pub fn new(cmd: MonitorCommand, param1: u32, param2: u32) -> Self {
        CommandRequest {
            cmd,
            param1: param1 & PARAM_MASK as u32,
            param2: param2 & PARAM_MASK as u32,
        }
    }

    pub fn pack(self) -> u64 {
        ((self.cmd as u64) << (2 * PARAM_BITS))
            | ((self.param1 as u64 & PARAM_MASK) << PARAM_BITS)
            | (self.param2 as u64 & PARAM_MASK)
    }

    /// Rejects values whose kind byte is out of range.
    pub fn unpack(raw: u64) -> Option<Self> {
        let cmd = MonitorCommand::from_u8((raw >> (2 * PARAM_BITS)) as u8)?;
        Some(CommandRequest {
            cmd,
            param1: ((raw >> PARAM_BITS) & PARAM_MASK) as u32,
            param2: (raw & PARAM_MASK) as u32,
        })
    }
}

/// Child → monitor command signal.
pub fn request_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

/// Monitor → child completion signal.
pub fn response_signal() -> libc::c_int {
    libc::SIGRTMIN() + 1
}

fn install_handler(
    signal: libc::c_int,
    handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void),
) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signal, &sa, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

// ── Monitor side ────────────────────────────────────────────────────────────

static REQUEST_SLOT: AtomicU64 = AtomicU64::new(0);
static REQUEST_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn on_request(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if info.is_null() {
        // Async-signal-safe diagnostic; nothing else is legal here.
        const MSG: &[u8] = b"clawfault: request signal without siginfo\n";
        unsafe {
            libc::write(libc::STDERR_FILENO, MSG.as_ptr() as *const _, MSG.len());
        }
        return;
    }
    let raw = unsafe { (*info).si_value().sival_ptr } as u64;
    REQUEST_SLOT.store(raw, Ordering::Release);
    REQUEST_PENDING.store(true, Ordering::Release);
}

/// Register the monitor's command handler. Must run before the traced
/// process can send its first command; the default disposition of an
/// unhandled real-time signal would kill the monitor.
pub fn install_request_handler() -> io::Result<()> {
    install_handler(request_signal(), on_request)
}

/// Post a command into the monitor's queue from normal (non-signal)
/// context, as if the request signal had just been handled. Lets the
/// monitor enqueue work for its own command loop.
pub fn post_command(request: CommandRequest) {
    REQUEST_SLOT.store(request.pack(), Ordering::Release);
    REQUEST_PENDING.store(true, Ordering::Release);
}

pub fn command_pending() -> bool {
    REQUEST_PENDING.load(Ordering::Acquire)
}

pub fn clear_command_pending() {
    REQUEST_PENDING.store(false, Ordering::Release);
}

/// The raw packed value most recently stored by the request handler.
pub fn last_command_raw() -> u64 {
    REQUEST_SLOT.load(Ordering::Acquire)
}

/// The most recently received command, if its kind byte is valid.
pub fn last_command() -> Option<CommandRequest> {
    CommandRequest::unpack(last_command_raw())
}

/// Signal command completion back to the traced process.
pub fn send_response(pid: i32) -> io::Result<()> {
    let value = libc::sigval {
        sival_ptr: ptr::null_mut(),
    };
    if unsafe { libc::sigqueue(pid, response_signal(), value) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ── Traced-process side ─────────────────────────────────────────────────────

static RESPONSE_RECEIVED: AtomicBool = AtomicBool::new(false);

/// How long `send_command` waits for the monitor before giving up.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_POLL: Duration = Duration::from_millis(1);

extern "C" fn on_response(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    RESPONSE_RECEIVED.store(true, Ordering::Release);
}

/// Install the response handler in the traced process. Call once, before
/// the first `send_command`.
pub fn init_traced_process() -> io::Result<()> {
    install_handler(response_signal(), on_response)
}

/// Send a command to the monitor (this process's parent) and wait for its
/// response signal. Returns `false` on queueing failure or when no response
/// arrives within the timeout, the only protection the child has against a
/// wedged monitor.
pub fn send_command(cmd: MonitorCommand, param1: u32, param2: u32) -> bool {
    RESPONSE_RECEIVED.store(false, Ordering::Release);

    let monitor = unsafe { libc::getppid() };
    let request = CommandRequest::new(cmd, param1, param2);
    tracing::debug!(?cmd, param1, param2, monitor, "sending command");

    let value = libc::sigval {
        sival_ptr: request.pack() as *mut libc::c_void,
    };
    if unsafe { libc::sigqueue(monitor, request_signal(), value) } < 0 {
        tracing::error!(
            monitor,
            error = %io::Error::last_os_error(),
            "failed to queue command signal"
        );
        return false;
    }

    let start = Instant::now();
    while !RESPONSE_RECEIVED.load(Ordering::Acquire) {
        if start.elapsed() > RESPONSE_TIMEOUT {
            tracing::warn!(?cmd, "timed out waiting for monitor response");
            return false;
        }
        std::thread::sleep(RESPONSE_POLL);
    }
    true
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_layout_is_kind_p1_p2() {
        let request = CommandRequest::new(MonitorCommand::Scan, 0x123, 0x456);
        let raw = request.pack();
        assert_eq!(raw >> 56, 4);
        assert_eq!((raw >> 28) & PARAM_MASK, 0x123);
        assert_eq!(raw & PARAM_MASK, 0x456);
    }

    #[test]
    fn round_trip_over_all_kinds_and_extremes() {
        let kinds = [
            MonitorCommand::NoOp,
            MonitorCommand::Checkpoint,
            MonitorCommand::Restore,
            MonitorCommand::InjectErrors,
            MonitorCommand::Scan,
        ];
        let params = [0u32, 1, 0x0ABC_DEF0 & PARAM_MASK as u32, PARAM_MASK as u32];
        for cmd in kinds {
            for &p1 in &params {
                for &p2 in &params {
                    let packed = CommandRequest::new(cmd, p1, p2).pack();
                    let unpacked = CommandRequest::unpack(packed).unwrap();
                    assert_eq!(unpacked.cmd, cmd);
                    assert_eq!(unpacked.param1, p1);
                    assert_eq!(unpacked.param2, p2);
                }
            }
        }
    }

    #[test]
    fn params_are_masked_to_28_bits() {
        let request = CommandRequest::new(MonitorCommand::NoOp, u32::MAX, u32::MAX);
        assert_eq!(request.param1, PARAM_MASK as u32);
        assert_eq!(request.param2, PARAM_MASK as u32);
        let unpacked = CommandRequest::unpack(request.pack()).unwrap();
        assert_eq!(unpacked.param1, PARAM_MASK as u32);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(CommandRequest::unpack(5u64 << 56).is_none());
        assert!(CommandRequest::unpack(u64::MAX).is_none());
    }

    #[test]
    fn noop_with_zero_params_packs_to_zero() {
        let raw = CommandRequest::new(MonitorCommand::NoOp, 0, 0).pack();
        assert_eq!(raw, 0);
        assert_eq!(
            CommandRequest::unpack(raw).unwrap().cmd,
            MonitorCommand::NoOp
        );
    }

    #[test]
    fn signals_are_distinct_realtime_numbers() {
        assert!(request_signal() >= libc::SIGRTMIN());
        assert!(response_signal() <= libc::SIGRTMAX());
        assert_ne!(request_signal(), response_signal());
    }
}
