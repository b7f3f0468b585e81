//! Runtime configuration, assembled from [`crate::cli::Cli`] flags.

use std::time::Duration;

use anyhow::{ensure, Result};

/// Non-linear scaling factors and sampling cadences shared by every
/// subsystem of the engine. Defaults mirror the original tool's
/// `configs/default.py`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Output directory for CSV trace files.
    pub output: String,
    /// Path to the persisted baseline power JSON file.
    pub basefile: String,
    /// Baseline estimation sampling period (must be representative of idle
    /// draw, hence coarser than `rapl_period`).
    pub base_period: Duration,
    /// RAPL / NUMA sampler cadence (high-rate background sampling).
    pub rapl_period: Duration,
    /// Attribution engine loop period.
    pub interval: Duration,
    /// Non-linear CPU credit exponent.
    pub gamma: f64,
    /// Non-linear DRAM credit exponent.
    pub delta: f64,
    /// Debug-log emission cadence, in seconds (only used at `loglvl=debug`).
    pub logging_period_sec: u64,
}

impl Config {
    pub fn new(
        output: String,
        basefile: String,
        base_period: f64,
        rapl_period: f64,
        interval: f64,
        gamma: f64,
        delta: f64,
        logging_period_sec: u64,
    ) -> Result<Config> {
        ensure!(rapl_period >= 0.010, "--rapl_period must be >= 10ms, got {rapl_period}s");
        ensure!(interval >= 0.050, "--interval must be >= 50ms, got {interval}s");
        ensure!(base_period > 0.0, "--base_period must be positive, got {base_period}s");

        Ok(Config {
            output,
            basefile,
            base_period: Duration::from_secs_f64(base_period),
            rapl_period: Duration::from_secs_f64(rapl_period),
            interval: Duration::from_secs_f64(interval),
            gamma,
            delta,
            logging_period_sec,
        })
    }
}
