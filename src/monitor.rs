// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! The mode controller: drives scans either on a timer (periodic mode) or
//! in response to commands from the traced process (command mode).
//!
//! Every iteration runs under a scoped attach so the child is released on
//! all exit paths. The loop ends when the child exits, the iteration cap is
//! reached, or a shutdown is requested from a signal handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::attach_guard::AttachGuard;
use crate::channel::{self, CommandRequest, MonitorCommand};
use crate::checkpoint::ProcessCheckpoint;
use crate::config::MonitorOptions;
use crate::injection::ErrorInjectionStrategy;
use crate::process::TracedProcess;
use crate::scanner::{self, ScanStats};

/// How the monitor decides when to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Scan on a timer.
    Periodic,
    /// Wait for signal-carried commands from the traced process.
    Command,
}

/// Timing parameters for periodic mode.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub iteration_limit: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            initial_delay: Duration::from_millis(1000),
            interval: Duration::from_millis(1000),
            iteration_limit: None,
        }
    }
}

const COMMAND_POLL: Duration = Duration::from_millis(10);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Ask the running controller to wind down after the current iteration.
/// Only performs an atomic store, so it is legal from a signal handler.
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::Release);
}

fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::Acquire)
}

/// Scan summary emitted as a structured event.
#[derive(Serialize)]
struct ScanEvent<'a> {
    at: DateTime<Utc>,
    pid: i32,
    stats: &'a ScanStats,
}

fn emit_scan_event(pid: i32, stats: &ScanStats) {
    tracing::info!(pid, "{stats}");
    match serde_json::to_string(&ScanEvent {
        at: Utc::now(),
        pid,
        stats,
    }) {
        Ok(json) => tracing::info!(target: "clawfault::events", %json, "scan complete"),
        Err(e) => tracing::warn!(error = %e, "failed to serialize scan event"),
    }
}

/// Owns the process handle, the stateful injection strategy, and the
/// checkpoint store, and runs one of the two monitoring loops over them.
/// Strategy state (quotas, RNG stream, change map) persists across
/// iterations.
pub struct MonitorController {
    process: TracedProcess,
    strategy: ErrorInjectionStrategy,
    checkpoint: ProcessCheckpoint,
    num_workers: usize,
    mode: MonitorMode,
    config: MonitorConfig,
    last_scan_stats: Option<ScanStats>,
    commands_handled: u64,
}

impl MonitorController {
    pub fn new(child_pid: i32, options: &MonitorOptions) -> Result<Self> {
        options.validate()?;
        let process = TracedProcess::new(child_pid)
            .with_context(|| format!("cannot monitor pid {}", child_pid))?;
        let strategy = ErrorInjectionStrategy::new(options.injection_config());
        tracing::info!(
            pid = child_pid,
            workers = options.workers,
            seed = strategy.seed(),
            mode = ?options.mode,
            "monitor ready"
        );
        Ok(MonitorController {
            process,
            strategy,
            checkpoint: ProcessCheckpoint::new(child_pid),
            num_workers: options.workers,
            mode: options.monitor_mode(),
            config: options.monitor_config(),
            last_scan_stats: None,
            commands_handled: 0,
        })
    }

    /// Statistics of the most recent completed scan, if any.
    pub fn last_scan_stats(&self) -> Option<&ScanStats> {
        self.last_scan_stats.as_ref()
    }

    /// Number of commands dispatched in command mode.
    pub fn commands_handled(&self) -> u64 {
        self.commands_handled
    }

    /// Read-only view of the injection strategy (change map, quotas, seed).
    pub fn strategy(&self) -> &ErrorInjectionStrategy {
        &self.strategy
    }

    pub fn checkpoint_mut(&mut self) -> &mut ProcessCheckpoint {
        &mut self.checkpoint
    }

    /// Run the configured monitoring loop until the child exits, the
    /// iteration cap is reached, or a shutdown is requested.
    pub fn run(&mut self) -> Result<()> {
        match self.mode {
            MonitorMode::Periodic => self.run_periodic(),
            MonitorMode::Command => self.run_command(),
        }
    }

    /// `waitpid(WNOHANG)`: the child is gone once a status is reaped.
    fn child_running(&self) -> bool {
        let mut status: libc::c_int = 0;
        let result = unsafe { libc::waitpid(self.process.pid(), &mut status, libc::WNOHANG) };
        if result == -1 {
            tracing::error!(
                pid = self.process.pid(),
                error = %std::io::Error::last_os_error(),
                "error checking child process"
            );
            false
        } else if result > 0 && (libc::WIFEXITED(status) || libc::WIFSIGNALED(status)) {
            tracing::info!(pid = self.process.pid(), "child process terminated");
            false
        } else {
            true
        }
    }

    fn run_periodic(&mut self) -> Result<()> {
        if !self.config.initial_delay.is_zero() {
            std::thread::sleep(self.config.initial_delay);
        }

        let mut iterations = 0u64;
        while self.child_running() && !shutdown_requested() {
            {
                let guard = AttachGuard::new(&mut self.process);
                if !guard.success() {
                    bail!("unable to attach to process {}", guard.pid());
                }

                match scanner::scan_for_pointers(&guard, &mut self.strategy, self.num_workers) {
                    Ok(Some(stats)) => {
                        emit_scan_event(guard.pid(), &stats);
                        self.last_scan_stats = Some(stats);
                    }
                    Ok(None) => tracing::debug!("scan declined by strategy"),
                    Err(e) => return Err(e).context("periodic scan failed"),
                }

                iterations += 1;
                if let Some(limit) = self.config.iteration_limit {
                    if iterations >= limit {
                        break;
                    }
                }
            }
            std::thread::sleep(self.config.interval);
        }
        Ok(())
    }

    fn run_command(&mut self) -> Result<()> {
        channel::install_request_handler().context("failed to install command handler")?;

        while self.child_running() && !shutdown_requested() {
            if channel::command_pending() {
                channel::clear_command_pending();
                if let Err(e) = self.process_command() {
                    tracing::error!(error = format_args!("{e:#}"), "command processing failed");
                }
            } else {
                std::thread::sleep(COMMAND_POLL);
            }
        }
        Ok(())
    }

    fn process_command(&mut self) -> Result<()> {
        let raw = channel::last_command_raw();
        let Some(request) = CommandRequest::unpack(raw) else {
            tracing::warn!(raw = format_args!("{raw:#018x}"), "ignoring command with unknown kind");
            return Ok(());
        };
        tracing::info!(cmd = ?request.cmd, p1 = request.param1, p2 = request.param2, "processing command");

        let mut guard = AttachGuard::new(&mut self.process);
        if !guard.success() {
            bail!("failed to attach to process for command processing");
        }

        let mut scan_stats = None;
        let outcome: Result<()> = match request.cmd {
            MonitorCommand::NoOp => Ok(()),
            MonitorCommand::Checkpoint => {
                tracing::info!("creating checkpoint");
                self.checkpoint.create(&mut *guard)
            }
            MonitorCommand::Restore => {
                tracing::info!("restoring from checkpoint");
                self.checkpoint.restore(&mut *guard)
            }
            MonitorCommand::InjectErrors | MonitorCommand::Scan => {
                match scanner::scan_for_pointers(&guard, &mut self.strategy, self.num_workers) {
                    Ok(Some(stats)) => {
                        scan_stats = Some(stats);
                        Ok(())
                    }
                    Ok(None) => {
                        tracing::debug!("scan declined by strategy");
                        Ok(())
                    }
                    Err(e) => Err(e).context("scan failed"),
                }
            }
        };

        // The response signals completion, not success; failures stay in the
        // monitor log.
        if let Err(e) = channel::send_response(guard.pid()) {
            tracing::error!(error = %e, "failed to signal command completion");
        }
        drop(guard);

        if let Some(stats) = scan_stats {
            if request.cmd == MonitorCommand::Scan {
                emit_scan_event(self.process.pid(), &stats);
            } else {
                tracing::info!(
                    changes = self.strategy.changes().len(),
                    "injection pass complete"
                );
            }
            self.last_scan_stats = Some(stats);
        }

        self.commands_handled += 1;
        outcome
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::testutil::{pause_child, reap, Paused};

    #[test]
    fn controller_rejects_invalid_options() {
        let mut options = MonitorOptions::default();
        options.workers = 0;
        assert!(MonitorController::new(std::process::id() as i32, &options).is_err());

        let mut options = MonitorOptions::default();
        options.pointer_error_rate = 1.5;
        assert!(MonitorController::new(std::process::id() as i32, &options).is_err());
    }

    #[test]
    fn controller_rejects_bad_pid() {
        let options = MonitorOptions::default();
        assert!(MonitorController::new(-1, &options).is_err());
    }

    #[test]
    fn child_running_tracks_lifecycle() {
        let Paused { pid } = match pause_child() {
            Some(child) => child,
            None => return,
        };
        let mut options = MonitorOptions::default();
        options.mode = RunMode::Command;
        let controller = MonitorController::new(pid, &options).unwrap();
        assert!(controller.child_running());

        reap(pid);
        // The reap consumed the exit status; a vanished child reads as not
        // running either way.
        assert!(!controller.child_running());
    }

    #[test]
    fn default_monitor_config_matches_cli_defaults() {
        let config = MonitorConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.interval, Duration::from_millis(1000));
        assert!(config.iteration_limit.is_none());
    }
}
