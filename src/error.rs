//! Custom error types for the acquisition engine.
//!
//! `MxdcError` is the single error type returned by the engines, the run
//! store and the configuration layer. Device drivers themselves report
//! failures through `anyhow::Result` (see [`crate::hardware::capabilities`]);
//! the engines wrap those into [`MxdcError::Device`] once the local retry
//! policy has given up.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: the configuration file could not be
//!   parsed, or parsed into values that are logically wrong.
//! - **`InvalidRun`**: a run template failed validation (zero delta,
//!   mismatched energy lists, ...). Raised before any hardware is touched.
//! - **`Device`** / **`Timeout`**: hardware failures that survived the retry
//!   policy. These abort the current collection or scan.
//! - **`Busy`**: another top-level activity holds the beamline lock.
//! - **`Chooch`**: the external CHOOCH analysis tool failed. Never retried.
//!
//! Operational interruptions (beam loss, user pause/stop) are *not* errors;
//! they are state transitions of the engines.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, MxdcError>;

#[derive(Error, Debug)]
pub enum MxdcError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid run {run}: {reason}")]
    InvalidRun { run: u32, reason: String },

    #[error("Device '{device}' failed: {message}")]
    Device { device: String, message: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Beamline is busy with another activity")]
    Busy,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Run store serialization error: {0}")]
    RunStore(String),

    #[error("CHOOCH analysis failed: {0}")]
    Chooch(String),

    #[error("Engine channel closed")]
    ChannelClosed,

    #[error("Engine task failed: {0}")]
    Task(String),

    #[error("Frame position {pos} out of range (run list has {len} frames)")]
    PositionOutOfRange { pos: usize, len: usize },
}

impl MxdcError {
    /// Wrap a driver-level failure for the named device.
    pub fn device(device: impl Into<String>, err: anyhow::Error) -> Self {
        MxdcError::Device {
            device: device.into(),
            message: format!("{err:#}"),
        }
    }

    /// True for failures an operator can recover from by fixing the beamline
    /// and restarting (device and timeout errors), false for setup mistakes.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MxdcError::Device { .. } | MxdcError::Timeout(_) | MxdcError::Busy
        )
    }
}

impl From<figment::Error> for MxdcError {
    fn from(value: figment::Error) -> Self {
        MxdcError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_keeps_context_chain() {
        let err = anyhow::anyhow!("no response").context("detector start");
        let wrapped = MxdcError::device("ccd", err);
        let text = wrapped.to_string();
        assert!(text.contains("ccd"));
        assert!(text.contains("detector start"));
        assert!(text.contains("no response"));
        assert!(wrapped.is_recoverable());
    }

    #[test]
    fn invalid_run_is_not_recoverable() {
        let err = MxdcError::InvalidRun {
            run: 3,
            reason: "delta must be positive".into(),
        };
        assert!(!err.is_recoverable());
        assert_eq!(err.to_string(), "Invalid run 3: delta must be positive");
    }
}
