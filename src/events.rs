//! Engine state and the events engines publish.
//!
//! Engines never call back into their owner. Each engine task sends
//! immutable events over a single-consumer `mpsc` channel and publishes its
//! [`EngineState`] on a `watch` channel; whoever holds the receiving ends
//! applies them on its own task.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐   start()   ┌─────────┐
//! │ Idle │────────────▶│ Running │
//! └──────┘             └────┬────┘
//!    ▲                      │ pause() / beam lost
//!    │                      ▼
//!    │                 ┌────────┐
//!    │                 │ Paused │──resume()──▶ Running
//!    │                 └────────┘
//!    │  stop() / completed
//!    └──────────────────────────
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::hardware::Spectrum;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Not running, ready to start
    Idle,
    /// Working through its frames or points
    Running,
    /// Waiting for resume or stop
    Paused,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Paused => write!(f, "paused"),
        }
    }
}

/// Why a collection or scan ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    /// Every frame or point was processed
    Completed,
    /// Stopped on request before the end
    Stopped,
    /// Scan aborted; nothing was saved
    Aborted,
    /// A device error ended the activity
    Failed(String),
}

/// Requests sent to a running engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Wait at the next boundary
    Pause,
    /// Leave the paused state
    Resume,
    /// Finish at the next boundary; scans still save their data
    Stop,
    /// Finish at the next boundary without saving (scans only)
    Abort,
    /// Continue from this frame; only honoured while paused
    Seek(usize),
}

/// Events emitted by the collector
#[derive(Debug, Clone, PartialEq)]
pub enum CollectEvent {
    /// Collection started with this many frames
    Started { total: usize },
    /// Engine state changed
    StateChanged(EngineState),
    /// Ring current too low or falling; the collector paused itself
    BeamLost { current: f64 },
    /// Frame was already saved and was not exposed
    Skipped { index: usize },
    /// Frame written
    NewImage { index: usize, file_name: String },
    /// Share of the run list walked so far, 0.0 to 1.0
    Progress(f64),
    /// Stopped on request
    Stopped,
    /// Collection finished normally
    Done,
    /// Device failure ended the collection
    Error(String),
}

/// Events emitted by scanners
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Scan started with this many points
    Started { total: usize },
    /// One point counted: position, raw counts, normalised counts
    NewPoint { x: f64, y: f64, normalized: f64 },
    /// Fluorescence spectrum acquired
    Spectrum(Spectrum),
    /// Operator-facing progress message
    Log(String),
    /// Share of points counted, 0.0 to 1.0
    Progress(f64),
    /// Waiting for resume, on request or after beam loss
    Paused,
    /// Counting again
    Resumed,
    /// Ring current too low or falling; the scan pauses until resumed
    BeamLost { current: f64 },
    /// Scan ended and its data were written
    Done,
    /// Scan ended without saving
    Aborted,
    /// Device failure ended the scan
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(EngineState::Paused.to_string(), "paused");
        assert_eq!(format!("{}", EngineState::Idle), "idle");
    }
}
