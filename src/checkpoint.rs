// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Checkpoint and restore of the target's writable memory.
//!
//! The snapshot mechanism owns the child for the duration of its
//! transaction: the caller's ptrace attachment is released first, the child
//! is frozen with `SIGSTOP`, regions are captured through the scatter-gather
//! reader, and the child is left running afterwards (`SIGCONT`). A prior
//! attachment is restored on the way out. Chunks are also dumped to the
//! per-PID backing directory `/tmp/checkpoint_<pid>`.

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};

use crate::process::{self, TracedProcess};
use crate::region::{self, MemoryRegion};

struct MemoryChunk {
    addr: u64,
    data: Vec<u8>,
    digest: [u8; 32],
}

/// In-memory snapshot of every writable region, with the readable-region
/// descriptors needed to verify the layout has not shifted before a restore.
/// A new checkpoint overwrites the previous one.
pub struct ProcessCheckpoint {
    pid: i32,
    regions: Vec<MemoryRegion>,
    chunks: Vec<MemoryChunk>,
    /// Whether restore additionally requires mapping labels to be identical.
    /// Off by default: the layout check compares `start`, `end`, and the
    /// writable flag only.
    pub match_labels: bool,
}

impl ProcessCheckpoint {
    pub fn new(pid: i32) -> Self {
        ProcessCheckpoint {
            pid,
            regions: Vec::new(),
            chunks: Vec::new(),
            match_labels: false,
        }
    }

    /// Working directory of the snapshot backing store.
    pub fn backing_dir(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/checkpoint_{}", self.pid))
    }

    pub fn has_checkpoint(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Drop the snapshot data.
    pub fn clear(&mut self) {
        self.regions.clear();
        self.chunks.clear();
    }

    /// Snapshot the target's writable regions. Detaches the caller's
    /// attachment for the duration of the transaction and restores it
    /// afterwards.
    pub fn create(&mut self, target: &mut TracedProcess) -> Result<()> {
        let was_attached = target.is_attached();
        if was_attached {
            target
                .detach()
                .context("failed to detach before checkpoint")?;
        }

        let result = self.snapshot();

        let reattach = if was_attached {
            target
                .attach()
                .context("failed to reattach process after checkpoint")
        } else {
            Ok(())
        };
        result.and(reattach)
    }

    /// Write the snapshot back. Fails without touching memory when no
    /// checkpoint exists, when the current region layout no longer matches
    /// the recorded descriptors, or when a chunk fails its integrity check.
    pub fn restore(&mut self, target: &mut TracedProcess) -> Result<()> {
        if self.chunks.is_empty() {
            bail!("no checkpoint exists for pid {}", self.pid);
        }

        let was_attached = target.is_attached();
        if was_attached {
            target
                .detach()
                .context("failed to detach before checkpoint restore")?;
        }

        let result = self.write_back();

        let reattach = if was_attached {
            target
                .attach()
                .context("failed to reattach process after checkpoint restore")
        } else {
            Ok(())
        };
        result.and(reattach)
    }

    fn snapshot(&mut self) -> Result<()> {
        freeze(self.pid).context("failed to stop target for snapshot")?;
        let result = self.snapshot_frozen();
        thaw(self.pid);
        result
    }

    fn snapshot_frozen(&mut self) -> Result<()> {
        let mut readable: Vec<MemoryRegion> = region::read_process_maps(self.pid)
            .with_context(|| format!("failed to read /proc/{}/maps", self.pid))?
            .into_iter()
            .filter(|r| r.is_readable)
            .collect();
        readable.sort_by_key(|r| r.start);
        if readable.is_empty() {
            bail!("no readable regions to checkpoint");
        }

        let mut chunks = Vec::new();
        for r in readable.iter().filter(|r| r.is_writable) {
            let mut data = vec![0u8; r.len() as usize];
            match process::vm_read(self.pid, r.start, &mut data) {
                Ok(n) if n == data.len() => {}
                Ok(n) => {
                    self.clear();
                    bail!(
                        "short snapshot read of region {:#x}..{:#x} ({} of {} bytes)",
                        r.start,
                        r.end,
                        n,
                        data.len()
                    );
                }
                Err(e) => {
                    self.clear();
                    return Err(e).with_context(|| {
                        format!("failed to snapshot region {:#x}..{:#x}", r.start, r.end)
                    });
                }
            }
            chunks.push(MemoryChunk {
                addr: r.start,
                digest: blake3::hash(&data).into(),
                data,
            });
        }

        let total_bytes: usize = chunks.iter().map(|c| c.data.len()).sum();
        self.regions = readable;
        self.chunks = chunks;

        if let Err(e) = self.write_backing_store() {
            tracing::warn!(dir = %self.backing_dir().display(), error = %e, "failed to dump checkpoint backing store");
        }

        tracing::info!(
            pid = self.pid,
            chunks = self.chunks.len(),
            bytes = total_bytes,
            "checkpoint created"
        );
        Ok(())
    }

    fn write_back(&self) -> Result<()> {
        freeze(self.pid).context("failed to stop target for restore")?;
        let result = self.write_back_frozen();
        thaw(self.pid);
        result
    }

    fn write_back_frozen(&self) -> Result<()> {
        let mut current: Vec<MemoryRegion> = region::read_process_maps(self.pid)
            .with_context(|| format!("failed to read /proc/{}/maps", self.pid))?
            .into_iter()
            .filter(|r| r.is_readable)
            .collect();
        current.sort_by_key(|r| r.start);

        if !layout_matches(&self.regions, &current, self.match_labels) {
            bail!(
                "memory layout of pid {} changed since the checkpoint; refusing to restore",
                self.pid
            );
        }

        verify_chunks(&self.chunks)?;

        for chunk in &self.chunks {
            match process::vm_write(self.pid, chunk.addr, &chunk.data) {
                Ok(n) if n == chunk.data.len() => {}
                Ok(n) => bail!(
                    "short restore write at {:#x} ({} of {} bytes)",
                    chunk.addr,
                    n,
                    chunk.data.len()
                ),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to write checkpoint chunk at {:#x}", chunk.addr)
                    })
                }
            }
        }

        tracing::info!(pid = self.pid, chunks = self.chunks.len(), "checkpoint restored");
        Ok(())
    }

    fn write_backing_store(&self) -> io::Result<()> {
        let dir = self.backing_dir();
        fs::create_dir_all(&dir)?;
        let manifest = serde_json::to_vec_pretty(&self.regions)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(dir.join("regions.json"), manifest)?;
        for chunk in &self.chunks {
            fs::write(dir.join(format!("{:016x}.img", chunk.addr)), &chunk.data)?;
        }
        Ok(())
    }
}

/// Layout check used before a restore: same region count, and per region
/// equal `start`, `end`, and writable flag. Labels participate only when
/// `match_labels` is set.
fn layout_matches(expected: &[MemoryRegion], current: &[MemoryRegion], match_labels: bool) -> bool {
    expected.len() == current.len()
        && expected.iter().zip(current).all(|(a, b)| {
            a.start == b.start
                && a.end == b.end
                && a.is_writable == b.is_writable
                && (!match_labels || a.mapping_label == b.mapping_label)
        })
}

fn verify_chunks(chunks: &[MemoryChunk]) -> Result<()> {
    for chunk in chunks {
        let digest: [u8; 32] = blake3::hash(&chunk.data).into();
        if digest != chunk.digest {
            bail!(
                "checkpoint chunk at {:#x} failed its integrity check",
                chunk.addr
            );
        }
    }
    Ok(())
}

// ── Freeze / thaw ───────────────────────────────────────────────────────────

/// Stop the child for the snapshot transaction and wait for the stop to
/// land. The monitor is the child's parent, so `waitpid(WUNTRACED)` observes
/// the stop without a ptrace attachment.
fn freeze(pid: i32) -> io::Result<()> {
    unsafe {
        if libc::kill(pid, libc::SIGSTOP) != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut status: libc::c_int = 0;
        if libc::waitpid(pid, &mut status, libc::WUNTRACED) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Leave-running semantics: the child continues once the transaction ends.
fn thaw(pid: i32) {
    if unsafe { libc::kill(pid, libc::SIGCONT) } != 0 {
        tracing::warn!(
            pid,
            error = %io::Error::last_os_error(),
            "failed to resume target after snapshot transaction"
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64, writable: bool, label: &str) -> MemoryRegion {
        MemoryRegion {
            start,
            end,
            is_readable: true,
            is_writable: writable,
            is_executable: false,
            is_private: true,
            mapping_label: label.into(),
        }
    }

    #[test]
    fn layout_matches_on_identical_tables() {
        let a = vec![
            region(0x1000, 0x2000, true, "[heap]"),
            region(0x3000, 0x4000, false, "/usr/bin/x"),
        ];
        assert!(layout_matches(&a, &a.clone(), false));
        assert!(layout_matches(&a, &a.clone(), true));
    }

    #[test]
    fn layout_mismatch_on_bounds_or_writability() {
        let expected = vec![region(0x1000, 0x2000, true, "[heap]")];

        let shifted = vec![region(0x1000, 0x3000, true, "[heap]")];
        assert!(!layout_matches(&expected, &shifted, false));

        let remapped = vec![region(0x1000, 0x2000, false, "[heap]")];
        assert!(!layout_matches(&expected, &remapped, false));

        let grown = vec![
            region(0x1000, 0x2000, true, "[heap]"),
            region(0x5000, 0x6000, true, ""),
        ];
        assert!(!layout_matches(&expected, &grown, false));
    }

    #[test]
    fn label_comparison_is_behind_the_knob() {
        let expected = vec![region(0x1000, 0x2000, true, "[heap]")];
        let relabeled = vec![region(0x1000, 0x2000, true, "[stack]")];
        assert!(layout_matches(&expected, &relabeled, false));
        assert!(!layout_matches(&expected, &relabeled, true));
    }

    #[test]
    fn chunk_digests_catch_corruption() {
        let data = vec![0xABu8; 64];
        let good = MemoryChunk {
            addr: 0x1000,
            digest: blake3::hash(&data).into(),
            data: data.clone(),
        };
        assert!(verify_chunks(&[good]).is_ok());

        let bad = MemoryChunk {
            addr: 0x1000,
            digest: [0u8; 32],
            data,
        };
        assert!(verify_chunks(&[bad]).is_err());
    }

    #[test]
    fn restore_without_checkpoint_fails_fast() {
        let mut checkpoint = ProcessCheckpoint::new(std::process::id() as i32);
        let mut target = TracedProcess::new(std::process::id() as i32).unwrap();
        let err = checkpoint.restore(&mut target).unwrap_err();
        assert!(err.to_string().contains("no checkpoint"));
    }

    #[test]
    fn backing_dir_is_per_pid() {
        let checkpoint = ProcessCheckpoint::new(4242);
        assert_eq!(
            checkpoint.backing_dir(),
            PathBuf::from("/tmp/checkpoint_4242")
        );
    }
}
