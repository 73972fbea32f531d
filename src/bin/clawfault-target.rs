// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Demo target for `clawfault`. Allocates heap structures full of real
//! pointers, prints their addresses, and either sleeps through a periodic
//! scan or drives the monitor itself over the command channel.
//!
//! ```console
//! clawfault periodic --interval-ms=500 --max-iterations=3 clawfault-target
//! clawfault command --pointer-error-rate=1.0 --error-limit=2 clawfault-target drive
//! ```

use std::time::Duration;

use clawfault::channel::{self, MonitorCommand};

fn build_allocations() -> (Vec<Box<u64>>, Vec<*const u64>) {
    let mut boxes = Vec::new();
    let mut addresses = Vec::new();
    for i in 0..64u64 {
        let boxed = Box::new(0x1000_0000 + i);
        addresses.push(&*boxed as *const u64);
        boxes.push(boxed);
    }
    (boxes, addresses)
}

fn checksum(boxes: &[Box<u64>]) -> u64 {
    // The monitor mutates these words from outside the process; volatile
    // reads keep the compiler from caching them.
    boxes
        .iter()
        .map(|b| unsafe { std::ptr::read_volatile(&**b) })
        .fold(0, u64::wrapping_add)
}

/// Command-channel walkthrough: checkpoint, ask for fault injection, observe
/// the damage, then restore and verify the values came back.
fn drive_monitor(boxes: &[Box<u64>]) {
    if let Err(e) = channel::init_traced_process() {
        eprintln!("failed to install response handler: {}", e);
        return;
    }

    let before = checksum(boxes);
    println!("checksum before: {:#x}", before);

    for (cmd, label) in [
        (MonitorCommand::NoOp, "no-op"),
        (MonitorCommand::Checkpoint, "checkpoint"),
        (MonitorCommand::InjectErrors, "inject"),
    ] {
        if !channel::send_command(cmd, 0, 0) {
            eprintln!("monitor did not acknowledge {}", label);
            return;
        }
        println!("{} acknowledged", label);
    }

    let corrupted = checksum(boxes);
    println!(
        "checksum after injection: {:#x} ({})",
        corrupted,
        if corrupted == before { "unchanged" } else { "changed" }
    );

    if !channel::send_command(MonitorCommand::Restore, 0, 0) {
        eprintln!("monitor did not acknowledge restore");
        return;
    }
    let restored = checksum(boxes);
    println!(
        "checksum after restore: {:#x} ({})",
        restored,
        if restored == before { "restored" } else { "still corrupted" }
    );
}

fn main() {
    println!("target process pid: {}", std::process::id());

    let (boxes, addresses) = build_allocations();
    println!("known pointer addresses:");
    for addr in addresses.iter().take(8) {
        println!("  {:p}", addr);
    }
    println!("  ... ({} total)", addresses.len());

    let drive = std::env::args().nth(1).as_deref() == Some("drive");
    if drive {
        // Give the monitor a moment to enter its command loop.
        std::thread::sleep(Duration::from_millis(200));
        drive_monitor(&boxes);
    } else {
        println!("waiting to be scanned (60 seconds)...");
        std::thread::sleep(Duration::from_secs(60));
    }

    println!("final checksum: {:#x}", checksum(&boxes));
}
