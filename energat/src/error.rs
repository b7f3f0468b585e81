//! Error taxonomy for the attribution engine.
//!
//! Only conditions the engine cannot recover from are modeled as
//! [`EngineError`] and propagate out of `main`. Everything else — a RAPL
//! overflow, a baseline that exceeds the total reading, an interval overrun,
//! the sampler thread vanishing — is recoverable and only ever logged via
//! `log::warn!`, never surfaced as an `Err` (see the engine loop).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("powercap RAPL hierarchy doesn't match the detected topology: {0}")]
    TopologyMismatch(#[from] rapl_probes::powercap::PowercapError),

    #[error("baseline power has not been estimated (expected a file at {path})")]
    BaselineMissing { path: String },

    #[error("target {pid} doesn't exist")]
    TargetGone { pid: i32 },
}

impl EngineError {
    /// Reclassifies a failure from [`rapl_probes::powercap::RaplReader::open`]
    /// as the typed [`EngineError::TopologyMismatch`] fatal condition when
    /// its root cause was a [`rapl_probes::powercap::PowercapError`], leaving
    /// any other error (a missing file, a permissions issue) untouched.
    pub fn from_rapl_open(err: anyhow::Error) -> anyhow::Error {
        match err.downcast::<rapl_probes::powercap::PowercapError>() {
            Ok(pe) => EngineError::TopologyMismatch(pe).into(),
            Err(err) => err,
        }
    }
}
