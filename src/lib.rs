//! # MXDC Core Library
//!
//! Acquisition sequencing for macromolecular crystallography beamlines: the
//! logic that turns a list of run definitions into detector exposures, and the
//! energy scans used to pick wavelengths for anomalous-dispersion experiments.
//! Frontends (the `mxdc` CLI here, a GUI elsewhere) drive the engines through
//! handles and consume the events they publish.
//!
//! ## Crate Structure
//!
//! - **`run`**: `Run` definitions and their expansion into an ordered `RunList`
//!   of frames (wedges, inverse beam, interleaved energies).
//! - **`run_store`**: persistence of run definitions between sessions.
//! - **`collector`**: the diffraction collection engine: pause, resume, stop,
//!   seek, beam-loss handling and skipping of frames already saved.
//! - **`scan`**: MAD, EXAFS and linear step scans, flux normalisation, the
//!   fluorescence excitation scan and CHOOCH analysis.
//! - **`hardware`**: device capability traits, the `Beamline` registry with its
//!   activity lock, the CCD status-word driver and simulated devices.
//! - **`events`**: engine states, control commands and published events.
//! - **`config`**: Figment-based configuration loading and validation.
//! - **`error`**: the `MxdcError` enum shared by all engines.
//! - **`logging`**: `tracing-subscriber` initialisation.
//! - **`units`**: energy, wavelength and Bragg-angle conversions.

pub mod collector;
pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod logging;
pub mod run;
pub mod run_store;
pub mod scan;
pub mod units;

pub use collector::{CollectReport, Collector, CollectorControl, CollectorHandle};
pub use error::{MxdcError, Result};
pub use run::{Frame, Run, RunList};
pub use scan::{ScanPlan, Scanner};
