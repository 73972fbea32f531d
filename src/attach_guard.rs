// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Scoped attach: an owning guard that attaches on construction if needed
//! and detaches on drop only if this guard performed the attach.

use std::ops::{Deref, DerefMut};

use crate::process::TracedProcess;

/// Guarantees the controller is released on every exit path of a scope.
/// Construction over an already-attached process leaves the attachment
/// untouched on drop.
pub struct AttachGuard<'a> {
    process: &'a mut TracedProcess,
    should_detach: bool,
}

impl<'a> AttachGuard<'a> {
    pub fn new(process: &'a mut TracedProcess) -> Self {
        let mut should_detach = false;
        if !process.is_attached() {
            match process.attach() {
                Ok(()) => should_detach = true,
                Err(e) => {
                    tracing::warn!(pid = process.pid(), error = %e, "scoped attach failed");
                }
            }
        }
        AttachGuard {
            process,
            should_detach,
        }
    }

    /// Whether the process is attached, however that came about.
    pub fn success(&self) -> bool {
        self.process.is_attached()
    }
}

impl Deref for AttachGuard<'_> {
    type Target = TracedProcess;

    fn deref(&self) -> &TracedProcess {
        self.process
    }
}

impl DerefMut for AttachGuard<'_> {
    fn deref_mut(&mut self) -> &mut TracedProcess {
        self.process
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.should_detach {
            if let Err(e) = self.process.detach() {
                tracing::warn!(pid = self.process.pid(), error = %e, "scoped detach failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{pause_child, reap, Paused};

    #[test]
    fn guard_reports_failure_without_a_target() {
        // Attaching to init is never permitted for an unprivileged test.
        let mut proc_ = TracedProcess::new(1).unwrap();
        let guard = AttachGuard::new(&mut proc_);
        if guard.success() {
            eprintln!("note: running privileged, skipping failure assertion");
            return;
        }
        assert!(!guard.success());
    }

    #[test]
    fn guard_attaches_and_releases() {
        let Paused { pid } = match pause_child() {
            Some(child) => child,
            None => return,
        };
        let mut proc_ = TracedProcess::new(pid).unwrap();
        {
            let guard = AttachGuard::new(&mut proc_);
            if !guard.success() {
                eprintln!("skipping: ptrace attach unavailable");
                drop(guard);
                reap(pid);
                return;
            }
            assert!(guard.is_attached());
        }
        assert!(!proc_.is_attached());
        reap(pid);
    }

    #[test]
    fn guard_leaves_prior_attachment_alone() {
        let Paused { pid } = match pause_child() {
            Some(child) => child,
            None => return,
        };
        let mut proc_ = TracedProcess::new(pid).unwrap();
        if proc_.attach().is_err() {
            eprintln!("skipping: ptrace attach unavailable");
            reap(pid);
            return;
        }
        {
            let guard = AttachGuard::new(&mut proc_);
            assert!(guard.success());
        }
        // The outer attach is still in force.
        assert!(proc_.is_attached());
        proc_.detach().unwrap();
        reap(pid);
    }
}
