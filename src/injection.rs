// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025-2026 JR Morton

//! Error injection: decides per word whether to corrupt it, applies the
//! configured bit-level fault, and records every change it makes.
//!
//! The strategy owns its RNG. One seed feeds two deterministic streams: a
//! uniform gate in [0,1) for the injection decision and a bounded integer
//! stream for bit indices. Seed zero means "seed from the wall clock"; any
//! other seed reproduces the same fault pattern run over run.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::region::{MemoryRegion, PointerClass};
use crate::strategy::InjectionStrategy;

// ── Error modes ─────────────────────────────────────────────────────────────

/// The transformation applied to a word selected for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorMode {
    /// Flip one random bit.
    #[default]
    BitFlip,
    /// Force one random bit to zero.
    StuckAtZero,
    /// Force one random bit to one.
    StuckAtOne,
}

impl FromStr for ErrorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bitflip" | "bit-flip" => Ok(ErrorMode::BitFlip),
            "zero" | "stuck-at-zero" | "stuckatzero" => Ok(ErrorMode::StuckAtZero),
            "one" | "stuck-at-one" | "stuckatone" => Ok(ErrorMode::StuckAtOne),
            other => Err(format!("unknown error mode '{}'", other)),
        }
    }
}

impl std::fmt::Display for ErrorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorMode::BitFlip => write!(f, "bit-flip"),
            ErrorMode::StuckAtZero => write!(f, "stuck-at-zero"),
            ErrorMode::StuckAtOne => write!(f, "stuck-at-one"),
        }
    }
}

// ── Change records ──────────────────────────────────────────────────────────

/// One injected fault. Keyed by absolute child address in the change map;
/// re-injection at the same address overwrites the record.
#[derive(Debug, Clone)]
pub struct ValueChange {
    pub original: u64,
    pub modified: u64,
    pub class: PointerClass,
    pub region_label: String,
    pub injected_at: Instant,
}

// ── Quotas ──────────────────────────────────────────────────────────────────

/// Per-class fault budgets plus a wildcard pool any class may borrow from
/// once its own budget is spent.
#[derive(Debug, Clone, Default)]
pub struct RegionQuota {
    pub heap_errors: u64,
    pub stack_errors: u64,
    pub static_errors: u64,
    pub unknown_errors: u64,
    pub wildcard_errors: u64,

    pub heap_quota: u64,
    pub stack_quota: u64,
    pub static_quota: u64,
    pub unknown_quota: u64,
    pub wildcard_quota: u64,
}

impl RegionQuota {
    fn class_state(&self, class: PointerClass) -> (u64, u64) {
        match class {
            PointerClass::Heap => (self.heap_errors, self.heap_quota),
            PointerClass::Stack => (self.stack_errors, self.stack_quota),
            PointerClass::Static => (self.static_errors, self.static_quota),
            PointerClass::Unknown => (self.unknown_errors, self.unknown_quota),
        }
    }

    /// Whether `class` may still inject: its own budget has room, or the
    /// wildcard pool does.
    pub fn available(&self, class: PointerClass) -> bool {
        let (errors, quota) = self.class_state(class);
        errors < quota || self.wildcard_errors < self.wildcard_quota
    }

    /// Record one injection for `class`: the class counter if it has room,
    /// the wildcard counter otherwise.
    pub fn increment(&mut self, class: PointerClass) {
        let counter = match class {
            PointerClass::Heap => &mut self.heap_errors,
            PointerClass::Stack => &mut self.stack_errors,
            PointerClass::Static => &mut self.static_errors,
            PointerClass::Unknown => &mut self.unknown_errors,
        };
        let quota = match class {
            PointerClass::Heap => self.heap_quota,
            PointerClass::Stack => self.stack_quota,
            PointerClass::Static => self.static_quota,
            PointerClass::Unknown => self.unknown_quota,
        };
        if *counter == quota {
            self.wildcard_errors += 1;
        } else {
            *counter += 1;
        }
    }

    /// Total injections recorded across all counters.
    pub fn total_injected(&self) -> u64 {
        self.heap_errors
            + self.stack_errors
            + self.static_errors
            + self.unknown_errors
            + self.wildcard_errors
    }

    fn reset_counters(&mut self) {
        self.heap_errors = 0;
        self.stack_errors = 0;
        self.static_errors = 0;
        self.unknown_errors = 0;
        self.wildcard_errors = 0;
    }
}

// ── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ErrorInjectionConfig {
    pub mode: ErrorMode,
    /// Injection probability for words classified as pointers, in [0, 1].
    pub pointer_error_rate: f64,
    /// Injection probability for everything else, in [0, 1].
    pub non_pointer_error_rate: f64,
    /// Global fault budget (becomes the wildcard quota).
    pub error_limit: u64,
    /// RNG seed; zero derives one from the wall clock.
    pub seed: u64,
}

impl Default for ErrorInjectionConfig {
    fn default() -> Self {
        ErrorInjectionConfig {
            mode: ErrorMode::BitFlip,
            pointer_error_rate: 0.0,
            non_pointer_error_rate: 0.0,
            error_limit: u64::MAX,
            seed: 0,
        }
    }
}

// ── Strategy ────────────────────────────────────────────────────────────────

/// The stateful fault injector. Quotas, the change map, and the RNG stream
/// all persist across scans; only an explicit `reset` clears the first two.
pub struct ErrorInjectionStrategy {
    mode: ErrorMode,
    pointer_error_rate: f64,
    non_pointer_error_rate: f64,
    quota: RegionQuota,
    rng: ChaCha8Rng,
    seed: u64,
    changes: HashMap<u64, ValueChange>,
}

impl ErrorInjectionStrategy {
    pub fn new(config: ErrorInjectionConfig) -> Self {
        let seed = if config.seed != 0 {
            config.seed
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        };
        let quota = RegionQuota {
            wildcard_quota: config.error_limit,
            ..RegionQuota::default()
        };
        ErrorInjectionStrategy {
            mode: config.mode,
            pointer_error_rate: config.pointer_error_rate,
            non_pointer_error_rate: config.non_pointer_error_rate,
            quota,
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            changes: HashMap::new(),
        }
    }

    /// The effective seed (the wall-clock one if the config said zero), so a
    /// run can be reproduced from its log.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Read-only view of every fault injected so far, keyed by address.
    pub fn changes(&self) -> &HashMap<u64, ValueChange> {
        &self.changes
    }

    pub fn quota(&self) -> &RegionQuota {
        &self.quota
    }

    /// Budget tuning between scans (per-class quotas default to zero, so the
    /// wildcard pool is the whole budget unless a class gets its own).
    pub fn quota_mut(&mut self) -> &mut RegionQuota {
        &mut self.quota
    }

    /// Clear the change map and the quota counters. The RNG stream is left
    /// where it is: a reset does not replay past draws.
    pub fn reset(&mut self) {
        self.changes.clear();
        self.quota.reset_counters();
    }

    /// Log what became of a previously injected address when the scanner
    /// passes over it again.
    fn observe(&self, addr: u64, value: u64) {
        let Some(change) = self.changes.get(&addr) else {
            return;
        };
        if value == change.original {
            tracing::debug!(addr = format_args!("{addr:#x}"), "injected word reverted to original value");
        } else if value == change.modified {
            tracing::debug!(addr = format_args!("{addr:#x}"), "injected word retained modified value");
        } else {
            tracing::debug!(
                addr = format_args!("{addr:#x}"),
                value = format_args!("{value:#x}"),
                original = format_args!("{:#x}", change.original),
                modified = format_args!("{:#x}", change.modified),
                "injected word moved to a third value"
            );
        }
    }

    fn inject(
        &mut self,
        rate: f64,
        addr: u64,
        value: &mut u64,
        writable: bool,
        region: &MemoryRegion,
    ) -> bool {
        self.observe(addr, *value);

        if !writable {
            return false;
        }
        let class = region.pointer_class();
        if !self.quota.available(class) {
            return false;
        }
        if self.rng.gen::<f64>() > rate {
            return false;
        }

        let original = *value;
        let bit = self.rng.gen_range(0..64u32);
        match self.mode {
            ErrorMode::BitFlip => *value ^= 1u64 << bit,
            ErrorMode::StuckAtZero => {
                let bit = self.rng.gen_range(0..64u32);
                *value &= !(1u64 << bit);
            }
            ErrorMode::StuckAtOne => {
                let bit = self.rng.gen_range(0..64u32);
                *value |= 1u64 << bit;
            }
        }

        self.changes.insert(
            addr,
            ValueChange {
                original,
                modified: *value,
                class,
                region_label: region.mapping_label.clone(),
                injected_at: Instant::now(),
            },
        );
        tracing::info!(
            mode = %self.mode,
            class = %class,
            region = %region.mapping_label,
            addr = format_args!("{addr:#x}"),
            original = format_args!("{original:#x}"),
            modified = format_args!("{:#x}", *value),
            "injected error"
        );
        self.quota.increment(class);
        true
    }
}

impl InjectionStrategy for ErrorInjectionStrategy {
    fn handle_pointer(
        &mut self,
        addr: u64,
        value: &mut u64,
        writable: bool,
        region: &MemoryRegion,
    ) -> bool {
        self.inject(self.pointer_error_rate, addr, value, writable, region)
    }

    fn handle_nonpointer(
        &mut self,
        addr: u64,
        value: &mut u64,
        writable: bool,
        region: &MemoryRegion,
    ) -> bool {
        self.inject(self.non_pointer_error_rate, addr, value, writable, region)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_region() -> MemoryRegion {
        MemoryRegion {
            start: 0x7f00_0000_0000,
            end: 0x7f00_0000_1000,
            is_readable: true,
            is_writable: true,
            is_executable: false,
            is_private: true,
            mapping_label: "[heap]".into(),
        }
    }

    fn stack_region() -> MemoryRegion {
        MemoryRegion {
            mapping_label: "[stack]".into(),
            ..heap_region()
        }
    }

    fn anon_region() -> MemoryRegion {
        MemoryRegion {
            mapping_label: String::new(),
            ..heap_region()
        }
    }

    fn strategy(mode: ErrorMode, rate: f64, limit: u64, seed: u64) -> ErrorInjectionStrategy {
        ErrorInjectionStrategy::new(ErrorInjectionConfig {
            mode,
            pointer_error_rate: rate,
            non_pointer_error_rate: rate,
            error_limit: limit,
            seed,
        })
    }

    #[test]
    fn error_mode_parses_cli_spellings() {
        assert_eq!("bitflip".parse::<ErrorMode>().unwrap(), ErrorMode::BitFlip);
        assert_eq!("zero".parse::<ErrorMode>().unwrap(), ErrorMode::StuckAtZero);
        assert_eq!(
            "stuck-at-one".parse::<ErrorMode>().unwrap(),
            ErrorMode::StuckAtOne
        );
        assert!("gamma-ray".parse::<ErrorMode>().is_err());
    }

    #[test]
    fn bitflip_changes_exactly_one_bit() {
        let mut strat = strategy(ErrorMode::BitFlip, 1.0, u64::MAX, 42);
        let region = heap_region();
        let mut value = 0x7f00_0000_0040u64;
        let original = value;

        assert!(strat.handle_pointer(region.start, &mut value, true, &region));
        let delta = original ^ value;
        assert_eq!(delta.count_ones(), 1);

        let change = &strat.changes()[&region.start];
        assert_eq!(change.original, original);
        assert_eq!(change.modified, value);
        assert_eq!(change.class, PointerClass::Heap);
        assert_eq!(change.region_label, "[heap]");

        // Re-applying the same flip restores the word.
        assert_eq!(value ^ delta, original);
    }

    #[test]
    fn stuck_at_modes_touch_at_most_one_bit() {
        let region = heap_region();

        let mut strat = strategy(ErrorMode::StuckAtZero, 1.0, u64::MAX, 7);
        let mut value = u64::MAX;
        assert!(strat.handle_nonpointer(region.start, &mut value, true, &region));
        assert_eq!((u64::MAX ^ value).count_ones(), 1);

        let mut strat = strategy(ErrorMode::StuckAtOne, 1.0, u64::MAX, 7);
        let mut value = 0u64;
        assert!(strat.handle_nonpointer(region.start, &mut value, true, &region));
        assert_eq!(value.count_ones(), 1);
    }

    #[test]
    fn stuck_at_zero_may_leave_the_word_unchanged_but_still_records() {
        // All-zero word: whatever bit is drawn is already clear.
        let region = heap_region();
        let mut strat = strategy(ErrorMode::StuckAtZero, 1.0, u64::MAX, 3);
        let mut value = 0u64;
        assert!(strat.handle_nonpointer(region.start + 8, &mut value, true, &region));
        assert_eq!(value, 0);
        let change = &strat.changes()[&(region.start + 8)];
        assert_eq!(change.original, change.modified);
    }

    #[test]
    fn same_seed_reproduces_the_same_faults() {
        let region = heap_region();
        let run = |seed: u64| {
            let mut strat = strategy(ErrorMode::BitFlip, 0.5, u64::MAX, seed);
            let mut out = Vec::new();
            for i in 0..64u64 {
                let mut value = 0x1000_0000u64 + i;
                let addr = region.start + i * 8;
                strat.handle_nonpointer(addr, &mut value, true, &region);
                out.push(value);
            }
            out
        };
        assert_eq!(run(1234), run(1234));
        assert_ne!(run(1234), run(4321));
    }

    #[test]
    fn rate_zero_never_injects() {
        let region = heap_region();
        let mut strat = strategy(ErrorMode::BitFlip, 0.0, u64::MAX, 99);
        for i in 0..256u64 {
            let mut value = 0xAAAA_AAAAu64;
            assert!(!strat.handle_pointer(region.start + i * 8, &mut value, true, &region));
            assert_eq!(value, 0xAAAA_AAAA);
        }
        assert!(strat.changes().is_empty());
    }

    #[test]
    fn non_writable_words_are_never_touched() {
        let region = heap_region();
        let mut strat = strategy(ErrorMode::BitFlip, 1.0, u64::MAX, 5);
        let mut value = 0x55u64;
        assert!(!strat.handle_pointer(region.start, &mut value, false, &region));
        assert_eq!(value, 0x55);
        assert!(strat.changes().is_empty());
    }

    #[test]
    fn error_limit_bounds_the_change_map() {
        let region = heap_region();
        let mut strat = strategy(ErrorMode::BitFlip, 1.0, 3, 11);
        for i in 0..100u64 {
            let mut value = 0xF0F0u64;
            strat.handle_nonpointer(region.start + i * 8, &mut value, true, &region);
        }
        assert_eq!(strat.changes().len(), 3);
        assert_eq!(strat.quota().total_injected(), 3);
        // A second scan cannot push past the budget either.
        for i in 100..200u64 {
            let mut value = 0xF0F0u64;
            strat.handle_nonpointer(region.start + i * 8, &mut value, true, &region);
        }
        assert_eq!(strat.changes().len(), 3);
    }

    #[test]
    fn class_quota_then_wildcard_borrowing() {
        let heap = heap_region();
        let stack = stack_region();
        let mut strat = strategy(ErrorMode::BitFlip, 1.0, 2, 21);
        strat.quota_mut().heap_quota = 1;

        // Three heap injections: one on the class budget, two borrowed.
        for i in 0..3u64 {
            let mut value = 0u64;
            assert!(strat.handle_nonpointer(heap.start + i * 8, &mut value, true, &heap));
        }
        assert_eq!(strat.quota().heap_errors, 1);
        assert_eq!(strat.quota().wildcard_errors, 2);

        // Everything is exhausted now, for any class.
        let mut value = 0u64;
        assert!(!strat.handle_nonpointer(heap.start + 0x100, &mut value, true, &heap));
        assert!(!strat.handle_nonpointer(stack.start + 0x108, &mut value, true, &stack));
    }

    #[test]
    fn unknown_class_draws_from_its_own_budget() {
        let anon = anon_region();
        let mut strat = strategy(ErrorMode::BitFlip, 1.0, 0, 31);
        strat.quota_mut().unknown_quota = 2;

        let mut injected = 0;
        for i in 0..10u64 {
            let mut value = 0u64;
            if strat.handle_nonpointer(anon.start + i * 8, &mut value, true, &anon) {
                injected += 1;
            }
        }
        assert_eq!(injected, 2);
        assert_eq!(strat.quota().unknown_errors, 2);
        assert_eq!(strat.quota().wildcard_errors, 0);
    }

    #[test]
    fn exhausted_quota_consumes_no_gate_draws() {
        // With a zero budget the very first word is refused before any RNG
        // draw, so two strategies stay in lockstep when one of them later
        // gets budget back.
        let region = heap_region();
        let mut limited = strategy(ErrorMode::BitFlip, 1.0, 0, 77);
        let mut value = 0u64;
        assert!(!limited.handle_nonpointer(region.start, &mut value, true, &region));

        limited.quota_mut().wildcard_quota = 1;
        let mut a = 0x1234u64;
        limited.handle_nonpointer(region.start + 8, &mut a, true, &region);

        let mut fresh = strategy(ErrorMode::BitFlip, 1.0, 1, 77);
        let mut b = 0x1234u64;
        fresh.handle_nonpointer(region.start + 8, &mut b, true, &region);

        assert_eq!(a, b);
    }

    #[test]
    fn repeat_injection_overwrites_the_record() {
        let region = heap_region();
        let mut strat = strategy(ErrorMode::StuckAtOne, 1.0, u64::MAX, 13);
        let mut value = 0u64;
        strat.handle_nonpointer(region.start, &mut value, true, &region);
        let first_modified = strat.changes()[&region.start].modified;

        let mut value2 = 0xFF00u64;
        strat.handle_nonpointer(region.start, &mut value2, true, &region);
        assert_eq!(strat.changes().len(), 1);
        let change = &strat.changes()[&region.start];
        assert_eq!(change.original, 0xFF00);
        assert_ne!(change.modified, first_modified);
    }

    #[test]
    fn reset_clears_counters_but_not_quotas() {
        let region = heap_region();
        let mut strat = strategy(ErrorMode::BitFlip, 1.0, 5, 17);
        for i in 0..5u64 {
            let mut value = 0u64;
            strat.handle_nonpointer(region.start + i * 8, &mut value, true, &region);
        }
        assert_eq!(strat.changes().len(), 5);

        strat.reset();
        assert!(strat.changes().is_empty());
        assert_eq!(strat.quota().total_injected(), 0);
        assert_eq!(strat.quota().wildcard_quota, 5);

        // Budget is spendable again after the reset.
        let mut value = 0u64;
        assert!(strat.handle_nonpointer(region.start, &mut value, true, &region));
    }

    #[test]
    fn wall_clock_seed_is_reported() {
        let strat = strategy(ErrorMode::BitFlip, 0.0, 1, 0);
        assert_ne!(strat.seed(), 0);
        let strat = strategy(ErrorMode::BitFlip, 0.0, 1, 42);
        assert_eq!(strat.seed(), 42);
    }
}
