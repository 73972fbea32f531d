use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::injection::{ErrorInjectionConfig, ErrorMode};
use crate::monitor::{MonitorConfig, MonitorMode};

/// Which monitoring loop to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Periodic,
    Command,
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "periodic" => Ok(RunMode::Periodic),
            "command" => Ok(RunMode::Command),
            other => Err(format!("unknown run mode '{}'", other)),
        }
    }
}

/// The validated configuration the monitor core consumes. Loadable from a
/// TOML file; every field has a sensible default so a bare run scans
/// without injecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorOptions {
    /// Scanner worker threads (1–256).
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub error_mode: ErrorMode,
    /// Injection probability for pointer-classified words, in [0, 1].
    #[serde(default)]
    pub pointer_error_rate: f64,
    /// Injection probability for everything else, in [0, 1].
    #[serde(default)]
    pub non_pointer_error_rate: f64,
    /// Global fault budget; must be positive.
    #[serde(default = "default_error_limit")]
    pub error_limit: u64,
    /// RNG seed; zero seeds from the wall clock.
    #[serde(default)]
    pub error_seed: u64,
    #[serde(default)]
    pub mode: RunMode,
    /// Delay before the first periodic scan.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Pause between periodic scans.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Optional cap on periodic iterations.
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

fn default_workers() -> usize {
    12
}
fn default_error_limit() -> u64 {
    u64::MAX
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_interval_ms() -> u64 {
    1000
}

impl Default for MonitorOptions {
    fn default() -> Self {
        MonitorOptions {
            workers: default_workers(),
            error_mode: ErrorMode::BitFlip,
            pointer_error_rate: 0.0,
            non_pointer_error_rate: 0.0,
            error_limit: default_error_limit(),
            error_seed: 0,
            mode: RunMode::Periodic,
            initial_delay_ms: default_initial_delay_ms(),
            interval_ms: default_interval_ms(),
            max_iterations: None,
        }
    }
}

impl MonitorOptions {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let options: MonitorOptions =
            toml::from_str(&content).with_context(|| "failed to parse config")?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > 256 {
            bail!("workers must be within 1..=256, got {}", self.workers);
        }
        for (name, rate) in [
            ("pointer_error_rate", self.pointer_error_rate),
            ("non_pointer_error_rate", self.non_pointer_error_rate),
        ] {
            if !rate.is_finite() || !(0.0..=1.0).contains(&rate) {
                bail!("{} must be within [0, 1], got {}", name, rate);
            }
        }
        if self.error_limit == 0 {
            bail!("error_limit must be positive");
        }
        Ok(())
    }

    pub fn injection_config(&self) -> ErrorInjectionConfig {
        ErrorInjectionConfig {
            mode: self.error_mode,
            pointer_error_rate: self.pointer_error_rate,
            non_pointer_error_rate: self.non_pointer_error_rate,
            error_limit: self.error_limit,
            seed: self.error_seed,
        }
    }

    pub fn monitor_mode(&self) -> MonitorMode {
        match self.mode {
            RunMode::Periodic => MonitorMode::Periodic,
            RunMode::Command => MonitorMode::Command,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            interval: Duration::from_millis(self.interval_ms),
            iteration_limit: self.max_iterations,
        }
    }
}
