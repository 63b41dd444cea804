//! Beamline Hardware
//!
//! Capability traits, the device registry, detector drivers and simulated
//! devices. Engines only see the capability traits.

pub mod capabilities;
pub mod ccd;
pub mod energy;
pub mod mock;
pub mod registry;
pub mod retry;

pub use capabilities::{
    BeamMonitor, Counter, Goniometer, ImageDetector, ImageHeader, Mca, Positioner, Shutter,
    Spectrometer, Spectrum,
};
pub use registry::{Beamline, BeamlineBuilder};
