// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! The injection-strategy interface the scanner drives.
//!
//! The scanner calls `set_current_region` when it enters a region's page,
//! then one handler per 8-byte word. A handler returns `true` when it
//! mutated the word, which marks the page dirty for write-back.

use crate::region::MemoryRegion;

/// Per-word visitor invoked by the pointer scanner. All methods have no-op
/// defaults so observers can implement only what they need.
pub trait InjectionStrategy: Send {
    /// Runs before a scan; returning `false` aborts the scan cleanly.
    fn pre_runner(&mut self) -> bool {
        true
    }

    /// Called for each word that passed the pointer test. Returns whether
    /// the word was mutated.
    fn handle_pointer(
        &mut self,
        _addr: u64,
        _value: &mut u64,
        _writable: bool,
        _region: &MemoryRegion,
    ) -> bool {
        false
    }

    /// Called for each word that failed the pointer test. Returns whether
    /// the word was mutated.
    fn handle_nonpointer(
        &mut self,
        _addr: u64,
        _value: &mut u64,
        _writable: bool,
        _region: &MemoryRegion,
    ) -> bool {
        false
    }

    /// Runs after all workers have joined and statistics are merged.
    fn post_runner(&mut self) -> bool {
        true
    }

    /// Region context for the words that follow.
    fn set_current_region(&mut self, _region: &MemoryRegion) {}
}

/// Counts classifications without touching anything. Useful for plain scans
/// and as the no-op end of the strategy spectrum.
#[derive(Debug, Default)]
pub struct ObserveOnlyStrategy {
    pub pointers_seen: u64,
    pub nonpointers_seen: u64,
}

impl InjectionStrategy for ObserveOnlyStrategy {
    fn handle_pointer(
        &mut self,
        _addr: u64,
        _value: &mut u64,
        _writable: bool,
        _region: &MemoryRegion,
    ) -> bool {
        self.pointers_seen += 1;
        false
    }

    fn handle_nonpointer(
        &mut self,
        _addr: u64,
        _value: &mut u64,
        _writable: bool,
        _region: &MemoryRegion,
    ) -> bool {
        self.nonpointers_seen += 1;
        false
    }
}
