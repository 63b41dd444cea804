//! Beamline configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (default `config/beamline.toml`)
//! 2. Environment variables prefixed with `MXDC_` (nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use mxdc::config::BeamlineConfig;
//!
//! let config = BeamlineConfig::load()?;
//! config.validate()?;
//! println!("Beamline: {}", config.application.name);
//! # Ok::<(), mxdc::error::MxdcError>(())
//! ```

use crate::error::{MxdcError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Top-level beamline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeamlineConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Data collection settings
    #[serde(default)]
    pub collector: CollectorSettings,
    /// Spectroscopy scan settings
    #[serde(default)]
    pub scan: ScanSettings,
    /// Device definitions (simulated backends)
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Beamline name, e.g. "08ID-1"
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Settings for the acquisition sequencer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Energy moves smaller than this (keV) are skipped
    #[serde(default = "default_energy_tolerance")]
    pub energy_tolerance: f64,
    /// Distance moves smaller than this (mm) are skipped
    #[serde(default = "default_distance_tolerance")]
    pub distance_tolerance: f64,
    /// Skip frames already marked as saved unless a recollection is requested
    #[serde(default = "default_true")]
    pub skip_collected: bool,
    /// Attempts made to start the detector before giving up
    #[serde(default = "default_detector_retries")]
    pub detector_retries: u32,
    /// Horizontal beam centre written to image headers (pixels)
    #[serde(default = "default_beam_center")]
    pub beam_x: f64,
    /// Vertical beam centre (pixels)
    #[serde(default = "default_beam_center")]
    pub beam_y: f64,
}

impl CollectorSettings {
    /// Whether saved frames are skipped; `recollect` overrides the setting
    pub fn skips_saved_frames(&self, recollect: bool) -> bool {
        self.skip_collected && !recollect
    }
}

/// Settings for spectroscopy scans
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Default count time per point in seconds
    #[serde(default = "default_count_time")]
    pub count_time: f64,
    /// Normalizer sampling interval in milliseconds
    #[serde(default = "default_normalizer_interval")]
    pub normalizer_interval_ms: u64,
    /// Length of the normalizer averaging window in seconds
    #[serde(default = "default_normalizer_window")]
    pub normalizer_window_secs: f64,
    /// Attempts made to count a scan point before aborting
    #[serde(default = "default_detector_retries")]
    pub count_retries: u32,
    /// External CHOOCH executable
    #[serde(default = "default_chooch_command")]
    pub chooch_command: String,
}

/// Device role on the beamline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Monochromator Bragg axis (degrees); energy is derived from it
    Bragg,
    /// Detector distance (mm)
    Distance,
    /// Omega axis doing the oscillation
    Goniometer,
    /// Area detector for diffraction images
    Detector,
    /// Fluorescence detector (MCA)
    Mca,
    /// Incident-flux reference counter used for normalisation
    I0,
    /// Experiment shutter
    Shutter,
    /// Storage ring current monitor
    RingCurrent,
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Role the device plays in the experiment
    pub role: DeviceRole,
    /// Simulated speed (units per second) for motors
    #[serde(default = "default_speed")]
    pub speed: f64,
    /// Initial position or reading
    #[serde(default)]
    pub initial: f64,
}

fn default_energy_tolerance() -> f64 {
    0.0005
}

fn default_distance_tolerance() -> f64 {
    0.1
}

fn default_true() -> bool {
    true
}

fn default_detector_retries() -> u32 {
    3
}

fn default_beam_center() -> f64 {
    1024.0
}

fn default_count_time() -> f64 {
    1.0
}

fn default_normalizer_interval() -> u64 {
    10
}

fn default_normalizer_window() -> f64 {
    1.0
}

fn default_chooch_command() -> String {
    "chooch".to_string()
}

fn default_speed() -> f64 {
    50.0
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            energy_tolerance: default_energy_tolerance(),
            distance_tolerance: default_distance_tolerance(),
            skip_collected: true,
            detector_retries: default_detector_retries(),
            beam_x: default_beam_center(),
            beam_y: default_beam_center(),
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            count_time: default_count_time(),
            normalizer_interval_ms: default_normalizer_interval(),
            normalizer_window_secs: default_normalizer_window(),
            count_retries: default_detector_retries(),
            chooch_command: default_chooch_command(),
        }
    }
}

impl Default for BeamlineConfig {
    fn default() -> Self {
        let device = |id: &str, role, initial| DeviceDefinition {
            id: id.to_string(),
            role,
            speed: default_speed(),
            initial,
        };
        Self {
            application: ApplicationConfig {
                name: "08ID-1".to_string(),
                log_level: "info".to_string(),
            },
            collector: CollectorSettings::default(),
            scan: ScanSettings::default(),
            devices: vec![
                device("bragg", DeviceRole::Bragg, 9.0),
                device("detector_z", DeviceRole::Distance, 150.0),
                device("omega", DeviceRole::Goniometer, 0.0),
                device("ccd", DeviceRole::Detector, 0.0),
                device("mca", DeviceRole::Mca, 0.0),
                device("i0", DeviceRole::I0, 1.0e5),
                device("shutter", DeviceRole::Shutter, 0.0),
                device("ring_current", DeviceRole::RingCurrent, 250.0),
            ],
        }
    }
}

impl BeamlineConfig {
    /// Load configuration from `config/beamline.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `MXDC_`.
    /// Example: `MXDC_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self> {
        Self::load_from("config/beamline.toml")
    }

    /// Load configuration from a specific file path, on top of the defaults
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Figment::from(Serialized::defaults(BeamlineConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MXDC_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MxdcError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let tolerances = [self.collector.energy_tolerance, self.collector.distance_tolerance];
        if tolerances.iter().any(|t| !t.is_finite() || *t < 0.0) {
            return Err(MxdcError::Configuration(
                "Move tolerances must not be negative".to_string(),
            ));
        }

        if self.collector.detector_retries == 0 || self.scan.count_retries == 0 {
            return Err(MxdcError::Configuration(
                "Retry counts must be at least 1".to_string(),
            ));
        }

        let window = self.scan.normalizer_window_secs;
        if self.scan.normalizer_interval_ms == 0 || !window.is_finite() || window <= 0.0 {
            return Err(MxdcError::Configuration(
                "Normalizer interval and window must be positive".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        let mut roles = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(MxdcError::Configuration(format!(
                    "Device with role {:?} has no name",
                    device.role
                )));
            }
            if !ids.insert(&device.id) {
                return Err(MxdcError::Configuration(format!(
                    "Duplicate device ID: {}",
                    device.id
                )));
            }
            if !roles.insert(device.role) {
                return Err(MxdcError::Configuration(format!(
                    "Role {:?} assigned to more than one device",
                    device.role
                )));
            }
        }

        Ok(())
    }

    /// Definition of the device playing `role`, if configured
    pub fn device(&self, role: DeviceRole) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| d.role == role)
    }
}
