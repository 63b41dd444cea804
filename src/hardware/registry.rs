//! Beamline Device Registry
//!
//! The [`Beamline`] is the one place that knows which device plays which role.
//! It is constructed once at startup, either from configuration
//! ([`Beamline::simulated`]) or piece by piece with [`BeamlineBuilder`], and is
//! then shared as `Arc<Beamline>` with every engine that needs hardware.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Beamline                             │
//! │  energy · distance · goniometer · detector · mca · i0 · ...  │
//! │                    beamline lock (Mutex<()>)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │                    Capability Traits                         │
//! │  Positioner | Counter | Spectrometer | ImageDetector | ...   │
//! ├──────────────────────────────────────────────────────────────┤
//! │              Drivers / simulated devices                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use mxdc::config::BeamlineConfig;
//! use mxdc::hardware::registry::Beamline;
//!
//! let beamline = Beamline::simulated(&BeamlineConfig::default())?;
//! let _guard = beamline.try_lock()?; // Busy if another activity holds it
//! beamline.energy().move_to(12.658, true).await?;
//! ```

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::{BeamlineConfig, DeviceDefinition, DeviceRole};
use crate::error::{MxdcError, Result};
use crate::hardware::capabilities::{
    BeamMonitor, Counter, Goniometer, ImageDetector, Mca, Positioner, Shutter, Spectrometer,
};
use crate::hardware::ccd::{CcdDetector, SimCcdController};
use crate::hardware::energy::EnergyPositioner;
use crate::hardware::mock::{SimBeamMonitor, SimCounter, SimGoniometer, SimMca, SimMotor, SimShutter};

/// Absorption edge the simulated MCA responds to (Se K, keV)
const SIM_EDGE_KEV: f64 = 12.658;

/// Information about a registered device (returned by list operations)
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Role on the beamline
    pub role: DeviceRole,
    /// Device name as reported by the driver
    pub name: String,
}

/// All devices an acquisition engine may use, plus the beamline lock
pub struct Beamline {
    name: String,
    energy: Arc<dyn Positioner>,
    distance: Arc<dyn Positioner>,
    goniometer: Arc<dyn Goniometer>,
    detector: Arc<dyn ImageDetector>,
    mca: Arc<dyn Counter>,
    spectrometer: Arc<dyn Spectrometer>,
    i0: Option<Arc<dyn Counter>>,
    shutter: Option<Arc<dyn Shutter>>,
    beam_monitor: Arc<dyn BeamMonitor>,
    lock: Arc<Mutex<()>>,
}

impl Beamline {
    /// Start building a beamline from individual devices
    pub fn builder(name: impl Into<String>) -> BeamlineBuilder {
        BeamlineBuilder::new(name)
    }

    /// Build a fully simulated beamline from configuration
    ///
    /// Every role except `i0` and `shutter` is required.
    pub fn simulated(config: &BeamlineConfig) -> Result<Self> {
        config.validate()?;
        let required = |role: DeviceRole| -> Result<&DeviceDefinition> {
            config.device(role).ok_or_else(|| {
                MxdcError::Configuration(format!("no device configured for role {role:?}"))
            })
        };

        let bragg_def = required(DeviceRole::Bragg)?;
        let bragg: Arc<dyn Positioner> =
            Arc::new(SimMotor::new(&bragg_def.id, bragg_def.initial, bragg_def.speed));
        let energy: Arc<dyn Positioner> = Arc::new(EnergyPositioner::new("energy", bragg));

        let dist_def = required(DeviceRole::Distance)?;
        let distance = Arc::new(SimMotor::new(&dist_def.id, dist_def.initial, dist_def.speed));

        required(DeviceRole::Goniometer)?;
        let ccd_def = required(DeviceRole::Detector)?;
        let detector = Arc::new(CcdDetector::new(&ccd_def.id, SimCcdController::new()));

        let mca_def = required(DeviceRole::Mca)?;
        let mca = Arc::new(SimMca::new(&mca_def.id, energy.clone(), SIM_EDGE_KEV));

        let ring_def = required(DeviceRole::RingCurrent)?;
        let beam_monitor = Arc::new(SimBeamMonitor::new(ring_def.initial));

        let mut builder = BeamlineBuilder::new(&config.application.name)
            .energy(energy)
            .distance(distance)
            .goniometer(Arc::new(SimGoniometer::new()))
            .detector(detector)
            .mca(mca)
            .beam_monitor(beam_monitor);

        if let Some(def) = config.device(DeviceRole::I0) {
            builder = builder.i0(Arc::new(SimCounter::new(&def.id, def.initial)));
        }
        if config.device(DeviceRole::Shutter).is_some() {
            builder = builder.shutter(Arc::new(SimShutter::new()));
        }

        let beamline = builder.build()?;
        info!(
            beamline = %beamline.name,
            devices = beamline.list_devices().len(),
            "Simulated beamline ready"
        );
        Ok(beamline)
    }

    /// Take the beamline lock for a top-level activity
    ///
    /// Fails with [`MxdcError::Busy`] while another activity holds it.
    pub fn try_lock(&self) -> Result<OwnedMutexGuard<()>> {
        let guard = self.lock.clone().try_lock_owned().map_err(|_| MxdcError::Busy)?;
        debug!(beamline = %self.name, "Beamline lock acquired");
        Ok(guard)
    }

    /// Whether a top-level activity currently holds the beamline lock
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }

    /// Beamline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Photon energy positioner (keV)
    pub fn energy(&self) -> &Arc<dyn Positioner> {
        &self.energy
    }

    /// Detector distance positioner (mm)
    pub fn distance(&self) -> &Arc<dyn Positioner> {
        &self.distance
    }

    /// Oscillation axis
    pub fn goniometer(&self) -> &Arc<dyn Goniometer> {
        &self.goniometer
    }

    /// Area detector for diffraction images
    pub fn detector(&self) -> &Arc<dyn ImageDetector> {
        &self.detector
    }

    /// Fluorescence detector ROI counter
    pub fn mca(&self) -> &Arc<dyn Counter> {
        &self.mca
    }

    /// Fluorescence detector full-spectrum acquisition
    pub fn spectrometer(&self) -> &Arc<dyn Spectrometer> {
        &self.spectrometer
    }

    /// Incident-flux reference counter, if installed
    pub fn i0(&self) -> Option<&Arc<dyn Counter>> {
        self.i0.as_ref()
    }

    /// Experiment shutter, if installed
    pub fn shutter(&self) -> Option<&Arc<dyn Shutter>> {
        self.shutter.as_ref()
    }

    /// Storage ring current monitor
    pub fn beam_monitor(&self) -> &Arc<dyn BeamMonitor> {
        &self.beam_monitor
    }

    /// List installed devices with their roles
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices = vec![
            DeviceInfo {
                role: DeviceRole::Bragg,
                name: self.energy.name().to_string(),
            },
            DeviceInfo {
                role: DeviceRole::Distance,
                name: self.distance.name().to_string(),
            },
            DeviceInfo {
                role: DeviceRole::Detector,
                name: self.detector.name().to_string(),
            },
            DeviceInfo {
                role: DeviceRole::Mca,
                name: self.mca.name().to_string(),
            },
        ];
        if let Some(i0) = &self.i0 {
            devices.push(DeviceInfo {
                role: DeviceRole::I0,
                name: i0.name().to_string(),
            });
        }
        devices
    }
}

/// Builder for [`Beamline`]
///
/// Missing required devices are reported by [`BeamlineBuilder::build`].
pub struct BeamlineBuilder {
    name: String,
    energy: Option<Arc<dyn Positioner>>,
    distance: Option<Arc<dyn Positioner>>,
    goniometer: Option<Arc<dyn Goniometer>>,
    detector: Option<Arc<dyn ImageDetector>>,
    mca: Option<(Arc<dyn Counter>, Arc<dyn Spectrometer>)>,
    i0: Option<Arc<dyn Counter>>,
    shutter: Option<Arc<dyn Shutter>>,
    beam_monitor: Option<Arc<dyn BeamMonitor>>,
}

impl BeamlineBuilder {
    /// Empty builder for the beamline called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            energy: None,
            distance: None,
            goniometer: None,
            detector: None,
            mca: None,
            i0: None,
            shutter: None,
            beam_monitor: None,
        }
    }

    /// Energy positioner (required)
    pub fn energy(mut self, device: Arc<dyn Positioner>) -> Self {
        self.energy = Some(device);
        self
    }

    /// Detector distance positioner (required)
    pub fn distance(mut self, device: Arc<dyn Positioner>) -> Self {
        self.distance = Some(device);
        self
    }

    /// Oscillation axis (required)
    pub fn goniometer(mut self, device: Arc<dyn Goniometer>) -> Self {
        self.goniometer = Some(device);
        self
    }

    /// Area detector (required)
    pub fn detector(mut self, device: Arc<dyn ImageDetector>) -> Self {
        self.detector = Some(device);
        self
    }

    /// Fluorescence detector, used both as a counter and a spectrometer
    pub fn mca<M: Mca + 'static>(mut self, device: Arc<M>) -> Self {
        let counter: Arc<dyn Counter> = device.clone();
        let spectrometer: Arc<dyn Spectrometer> = device;
        self.mca = Some((counter, spectrometer));
        self
    }

    /// Incident-flux reference counter
    pub fn i0(mut self, device: Arc<dyn Counter>) -> Self {
        self.i0 = Some(device);
        self
    }

    /// Experiment shutter
    pub fn shutter(mut self, device: Arc<dyn Shutter>) -> Self {
        self.shutter = Some(device);
        self
    }

    /// Ring current monitor (required)
    pub fn beam_monitor(mut self, device: Arc<dyn BeamMonitor>) -> Self {
        self.beam_monitor = Some(device);
        self
    }

    /// Assemble the beamline
    pub fn build(self) -> Result<Beamline> {
        fn missing(role: &str) -> MxdcError {
            MxdcError::Configuration(format!("beamline has no {role} device"))
        }
        let energy = self.energy.ok_or_else(|| missing("energy"))?;
        let distance = self.distance.ok_or_else(|| missing("distance"))?;
        let goniometer = self.goniometer.ok_or_else(|| missing("goniometer"))?;
        let detector = self.detector.ok_or_else(|| missing("detector"))?;
        let (mca, spectrometer) = self.mca.ok_or_else(|| missing("mca"))?;
        Ok(Beamline {
            energy,
            distance,
            goniometer,
            detector,
            mca,
            spectrometer,
            beam_monitor: self.beam_monitor.ok_or_else(|| missing("ring current"))?,
            i0: self.i0,
            shutter: self.shutter,
            name: self.name,
            lock: Arc::new(Mutex::new(())),
        })
    }
}
