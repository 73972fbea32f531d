// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Parallel pointer scanner: shards the readable regions across worker
//! threads, classifies every 8-byte aligned word, and drives the injection
//! strategy over each one.
//!
//! The region table and the attachment are read-only for the whole scan
//! (enforced by the shared borrow of [`TracedProcess`]), and every worker
//! owns its page buffer and counter struct. Strategy calls are serialized
//! behind one mutex for the scan's duration; between scans the strategy is
//! exclusively owned again and needs no lock.

use std::fmt;
use std::sync::Mutex;
use std::thread;
use std::time::Instant;

use anyhow::{bail, Result};
use serde::Serialize;

use crate::process::TracedProcess;
use crate::region::{self, MemoryRegion};
use crate::strategy::InjectionStrategy;

const WORD_SIZE: usize = std::mem::size_of::<u64>();

// ── Statistics ──────────────────────────────────────────────────────────────

/// Per-scan counters. Additive: worker shards are merged by summation after
/// all workers join.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub regions_scanned: u64,
    pub bytes_scanned: u64,
    pub bytes_readable: u64,
    pub bytes_writable: u64,
    pub bytes_executable: u64,
    pub bytes_skipped: u64,
    pub pointers_found: u64,
    pub scan_time_ms: u64,
}

impl ScanStats {
    fn absorb(&mut self, other: &ScanStats) {
        self.regions_scanned += other.regions_scanned;
        self.bytes_scanned += other.bytes_scanned;
        self.bytes_readable += other.bytes_readable;
        self.bytes_writable += other.bytes_writable;
        self.bytes_executable += other.bytes_executable;
        self.bytes_skipped += other.bytes_skipped;
        self.pointers_found += other.pointers_found;
    }

    fn pointer_density_percent(&self) -> f64 {
        let denominator = self.bytes_readable.saturating_sub(self.bytes_executable);
        if denominator == 0 {
            return 0.0;
        }
        100.0 * (WORD_SIZE as f64 * self.pointers_found as f64) / denominator as f64
    }
}

impl fmt::Display for ScanStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MB: f64 = 1024.0 * 1024.0;
        writeln!(f, "Scan statistics:")?;
        writeln!(f, "  Regions scanned:         {}", self.regions_scanned)?;
        writeln!(
            f,
            "  Total bytes scanned:     {} ({:.2} MB)",
            self.bytes_scanned,
            self.bytes_scanned as f64 / MB
        )?;
        writeln!(
            f,
            "  Readable bytes:          {} ({:.2} MB)",
            self.bytes_readable,
            self.bytes_readable as f64 / MB
        )?;
        writeln!(
            f,
            "  Writable bytes:          {} ({:.2} MB)",
            self.bytes_writable,
            self.bytes_writable as f64 / MB
        )?;
        writeln!(
            f,
            "  Executable bytes:        {} ({:.2} MB)",
            self.bytes_executable,
            self.bytes_executable as f64 / MB
        )?;
        writeln!(
            f,
            "  Bytes skipped:           {} ({:.2} MB)",
            self.bytes_skipped,
            self.bytes_skipped as f64 / MB
        )?;
        writeln!(f, "  Pointers found:          {}", self.pointers_found)?;
        writeln!(
            f,
            "  Pointers as % of memory: {:.2}%",
            self.pointer_density_percent()
        )?;
        write!(f, "  Scan time:               {} ms", self.scan_time_ms)
    }
}

// ── Scan driver ─────────────────────────────────────────────────────────────

/// Scan every readable region of the target, invoking `strategy` on each
/// 8-byte aligned word. Regions are dealt round-robin to `num_workers`
/// threads; the scan refuses to run when the process is not attached, and
/// returns `Ok(None)` when the strategy's pre-runner declines.
pub fn scan_for_pointers(
    process: &TracedProcess,
    strategy: &mut dyn InjectionStrategy,
    num_workers: usize,
) -> Result<Option<ScanStats>> {
    if !process.is_attached() {
        bail!("cannot scan pid {}: not attached", process.pid());
    }
    if num_workers == 0 {
        bail!("worker count must be at least 1");
    }
    if !strategy.pre_runner() {
        tracing::debug!(pid = process.pid(), "scan declined by strategy pre-runner");
        return Ok(None);
    }

    let started = Instant::now();

    let regions = process.readable_regions();
    let mut shards: Vec<Vec<&MemoryRegion>> = vec![Vec::new(); num_workers];
    for (i, r) in regions.iter().enumerate() {
        shards[i % num_workers].push(r);
    }

    let strategy_lock = Mutex::new(strategy);

    let worker_stats: Vec<ScanStats> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(num_workers);
        for shard in &shards {
            let strategy_lock = &strategy_lock;
            handles.push(scope.spawn(move || {
                let mut stats = ScanStats::default();
                let mut page = vec![0u8; process.page_size()];
                for r in shard {
                    scan_region(process, r, strategy_lock, &mut page, &mut stats);
                    stats.regions_scanned += 1;
                }
                stats
            }));
        }
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(stats) => stats,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    });

    let mut stats = ScanStats::default();
    for worker in &worker_stats {
        stats.absorb(worker);
    }

    let strategy = strategy_lock
        .into_inner()
        .unwrap_or_else(|poison| poison.into_inner());
    if !strategy.post_runner() {
        tracing::warn!(pid = process.pid(), "strategy post-runner reported failure");
    }

    stats.scan_time_ms = started.elapsed().as_millis() as u64;
    Ok(Some(stats))
}

/// Walk one region page by page. Unreadable pages count toward
/// `bytes_skipped` and the walk advances; a page any handler mutated is
/// written back whole, but only into writable regions.
fn scan_region(
    process: &TracedProcess,
    region: &MemoryRegion,
    strategy_lock: &Mutex<&mut dyn InjectionStrategy>,
    page: &mut [u8],
    stats: &mut ScanStats,
) {
    let mut current = region.start;
    while current < region.end {
        let to_read = ((region.end - current) as usize).min(page.len());
        let chunk = &mut page[..to_read];

        if let Err(e) = process.read_memory(current, chunk) {
            tracing::debug!(
                addr = format_args!("{current:#x}"),
                len = to_read,
                error = %e,
                "page unreadable, skipping"
            );
            stats.bytes_skipped += to_read as u64;
            current += to_read as u64;
            continue;
        }

        let dirty = {
            let mut strategy = strategy_lock
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            strategy.set_current_region(region);
            let (pointers, dirty) = scan_page(
                chunk,
                current,
                region,
                process.all_regions(),
                &mut **strategy,
            );
            stats.pointers_found += pointers;
            dirty
        };

        stats.bytes_scanned += to_read as u64;
        stats.bytes_readable += to_read as u64;
        if region.is_writable {
            stats.bytes_writable += to_read as u64;
        }
        if region.is_executable {
            stats.bytes_executable += to_read as u64;
        }

        if dirty && region.is_writable {
            if let Err(e) = process.write_memory(current, chunk) {
                tracing::warn!(
                    addr = format_args!("{current:#x}"),
                    len = to_read,
                    error = %e,
                    "failed to write mutated page back"
                );
            }
        }

        current += to_read as u64;
    }
}

/// Classify and dispatch every 8-byte aligned word of one page buffer, in
/// strictly ascending offset order. Returns the number of words that passed
/// the pointer test and whether any handler mutated the buffer.
fn scan_page(
    chunk: &mut [u8],
    base_addr: u64,
    region: &MemoryRegion,
    targets: &[MemoryRegion],
    strategy: &mut dyn InjectionStrategy,
) -> (u64, bool) {
    let mut pointers_found = 0u64;
    let mut dirty = false;

    let mut offset = 0usize;
    while offset + WORD_SIZE <= chunk.len() {
        let mut word = [0u8; WORD_SIZE];
        word.copy_from_slice(&chunk[offset..offset + WORD_SIZE]);
        let mut value = u64::from_ne_bytes(word);
        let addr = base_addr + offset as u64;

        let modified = if region::is_likely_pointer(value, targets) {
            pointers_found += 1;
            strategy.handle_pointer(addr, &mut value, region.is_writable, region)
        } else {
            strategy.handle_nonpointer(addr, &mut value, region.is_writable, region)
        };

        if modified {
            chunk[offset..offset + WORD_SIZE].copy_from_slice(&value.to_ne_bytes());
            dirty = true;
        }
        offset += WORD_SIZE;
    }

    (pointers_found, dirty)
}

// ── Tests ───────────────────────────────────────────────────────────────────
