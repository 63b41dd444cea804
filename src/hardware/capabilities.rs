//! Hardware Capabilities
//!
//! Fine-grained capability traits for beamline devices. The engines only
//! depend on this surface, never on the transport behind a device:
//!
//! - a motor implements [`Positioner`]
//! - an ion chamber implements [`Counter`]
//! - an MCA implements [`Counter`] + [`Spectrometer`]
//! - a CCD implements [`ImageDetector`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Implementations use interior mutability for their state; all methods take
//! `&self` so a device can be shared as `Arc<dyn Trait>` between an engine task
//! and the operator.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Capability: Positioning
///
/// Motors, pseudo-motors and any other settable scalar.
///
/// # Contract
/// - Positions are in device-native units (mm, degrees, keV)
/// - `move_to(.., wait = false)` returns once motion has been commanded
/// - `move_to(.., wait = true)` returns once the device reports it has stopped
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Device name used in logs and data file headers
    fn name(&self) -> &str;

    /// Current position (may be approximate while moving)
    async fn position(&self) -> Result<f64>;

    /// Move to an absolute position
    async fn move_to(&self, target: f64, wait: bool) -> Result<()>;

    /// Whether the device is currently in motion
    async fn is_moving(&self) -> Result<bool>;

    /// Stop motion in progress
    async fn stop(&self) -> Result<()>;

    /// Subscribe to position changes, for devices that publish them
    fn watch_position(&self) -> Option<watch::Receiver<f64>> {
        None
    }
}

/// Capability: Counting
///
/// Scalar detectors integrated over a count time (ion chambers, MCA ROI sums).
#[async_trait]
pub trait Counter: Send + Sync {
    /// Device name used in logs and data file headers
    fn name(&self) -> &str;

    /// Integrate for `time` seconds and return the total
    async fn count(&self, time: f64) -> Result<f64>;

    /// Instantaneous reading without integrating
    async fn value(&self) -> Result<f64>;
}

/// A calibrated fluorescence spectrum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Channel energies in keV
    pub energy: Vec<f64>,
    /// Counts per channel
    pub counts: Vec<f64>,
}

/// Capability: Spectrum acquisition (multichannel analysers)
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Acquire a full spectrum for `time` seconds
    async fn acquire(&self, time: f64) -> Result<Spectrum>;
}

/// Metadata pushed to an area detector before each exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageHeader {
    /// File name without directory
    pub filename: String,
    /// Output directory
    pub directory: String,
    /// Sample-detector distance in mm
    pub distance: f64,
    /// X-ray wavelength in Å
    pub wavelength: f64,
    /// Oscillation start angle in degrees
    pub start_angle: f64,
    /// Oscillation width in degrees
    pub delta: f64,
    /// Exposure time in seconds
    pub exposure_time: f64,
    /// Beam centre (pixels)
    pub beam_x: f64,
    /// Beam centre (pixels)
    pub beam_y: f64,
}

/// Capability: Area detector exposure cycle
///
/// `set_header` → `start` → (goniometer scan) → `save`.
#[async_trait]
pub trait ImageDetector: Send + Sync {
    /// Device name used in logs
    fn name(&self) -> &str;

    /// Push header metadata for the next image
    async fn set_header(&self, header: &ImageHeader) -> Result<()>;

    /// Begin integrating; returns once the detector is acquiring
    async fn start(&self) -> Result<()>;

    /// Read out and write the current image to disk
    async fn save(&self) -> Result<()>;
}

/// Capability: Oscillation
///
/// Performs one oscillation of `delta` degrees from `start_angle` over `time`
/// seconds, opening the shutter for the duration. Returns when the sweep ends.
#[async_trait]
pub trait Goniometer: Send + Sync {
    /// Perform a single oscillation
    async fn scan(&self, start_angle: f64, delta: f64, time: f64) -> Result<()>;
}

/// Capability: Beam shutter
#[async_trait]
pub trait Shutter: Send + Sync {
    /// Open the shutter
    async fn open(&self) -> Result<()>;

    /// Close the shutter
    async fn close(&self) -> Result<()>;

    /// Whether the shutter is open
    async fn is_open(&self) -> Result<bool>;
}

/// Capability: Storage ring status
#[async_trait]
pub trait BeamMonitor: Send + Sync {
    /// Stored ring current in mA
    async fn ring_current(&self) -> Result<f64>;
}

/// Combined trait for fluorescence detectors used in scans
///
/// Implement the individual traits and get this automatically.
pub trait Mca: Counter + Spectrometer {}

impl<T: Counter + Spectrometer> Mca for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct PlainStage {
        position: Mutex<f64>,
    }

    #[async_trait]
    impl Positioner for PlainStage {
        fn name(&self) -> &str {
            "plain"
        }

        async fn position(&self) -> Result<f64> {
            Ok(*self.position.lock().unwrap())
        }

        async fn move_to(&self, target: f64, _wait: bool) -> Result<()> {
            *self.position.lock().unwrap() = target;
            Ok(())
        }

        async fn is_moving(&self) -> Result<bool> {
            Ok(false)
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_positioner_defaults() {
        let stage = PlainStage {
            position: Mutex::new(0.0),
        };
        stage.move_to(12.5, true).await.unwrap();
        assert_eq!(stage.position().await.unwrap(), 12.5);
        assert!(stage.watch_position().is_none());
    }
}
