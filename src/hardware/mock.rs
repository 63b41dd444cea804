//! Simulated Hardware
//!
//! Devices that behave like their beamline counterparts closely enough to run
//! every engine end-to-end without a beamline. All waiting uses
//! `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Available Simulations
//!
//! - `SimMotor` - positioner with finite speed and position notifications
//! - `SimCounter` - scalar counter (ion chamber) with settable level
//! - `SimMca` - fluorescence detector producing an absorption-edge response
//! - `SimGoniometer` - oscillation axis, records every sweep
//! - `SimDetector` - area detector recording its exposure cycle
//! - `SimShutter`, `SimBeamMonitor`

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{
    BeamMonitor, Counter, Goniometer, ImageDetector, ImageHeader, Positioner, Shutter, Spectrometer,
    Spectrum,
};

// =============================================================================
// SimMotor
// =============================================================================

/// Simulated motor
///
/// Moves at `speed` units per second; a speed of 0 moves instantly.
pub struct SimMotor {
    name: String,
    position: watch::Sender<f64>,
    speed: f64,
    moving: AtomicBool,
    moves: AtomicUsize,
}

impl SimMotor {
    /// Create a motor at `initial` moving at `speed` units/s
    pub fn new(name: impl Into<String>, initial: f64, speed: f64) -> Self {
        let (position, _) = watch::channel(initial);
        Self {
            name: name.into(),
            position,
            speed,
            moving: AtomicBool::new(false),
            moves: AtomicUsize::new(0),
        }
    }

    /// Motor that reaches its target immediately
    pub fn instant(name: impl Into<String>, initial: f64) -> Self {
        Self::new(name, initial, 0.0)
    }

    /// Number of moves commanded so far
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Positioner for SimMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn position(&self) -> Result<f64> {
        Ok(*self.position.borrow())
    }

    async fn move_to(&self, target: f64, wait: bool) -> Result<()> {
        if !target.is_finite() {
            bail!("{}: invalid target {}", self.name, target);
        }
        self.moves.fetch_add(1, Ordering::SeqCst);
        let current = *self.position.borrow();
        if self.speed > 0.0 && wait {
            let secs = (target - current).abs() / self.speed;
            self.moving.store(true, Ordering::SeqCst);
            sleep(Duration::from_secs_f64(secs)).await;
            self.moving.store(false, Ordering::SeqCst);
        }
        debug!(motor = %self.name, from = current, to = target, "move complete");
        self.position.send_replace(target);
        Ok(())
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(self.moving.load(Ordering::SeqCst))
    }

    async fn stop(&self) -> Result<()> {
        self.moving.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn watch_position(&self) -> Option<watch::Receiver<f64>> {
        Some(self.position.subscribe())
    }
}

// =============================================================================
// SimCounter
// =============================================================================

/// Simulated scalar counter
///
/// `count(t)` returns `level * t` with 1% noise and takes `t * time_scale`
/// seconds of wall time.
pub struct SimCounter {
    name: String,
    level: RwLock<f64>,
    time_scale: f64,
    failures: AtomicU32,
}

impl SimCounter {
    /// Counter reading `level` counts per second
    pub fn new(name: impl Into<String>, level: f64) -> Self {
        Self {
            name: name.into(),
            level: RwLock::new(level),
            time_scale: 0.0,
            failures: AtomicU32::new(0),
        }
    }

    /// Spend `time_scale` seconds of wall time per second of count time
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    /// Change the signal level
    pub async fn set_level(&self, level: f64) {
        *self.level.write().await = level;
    }

    /// Make the next `count` calls to `count()` fail
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Counter for SimCounter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, time: f64) -> Result<f64> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            bail!("{} did not start counting", self.name);
        }
        if self.time_scale > 0.0 {
            sleep(Duration::from_secs_f64(time * self.time_scale)).await;
        }
        let level = *self.level.read().await;
        let noise = rand::thread_rng().gen_range(-0.01..=0.01);
        Ok(level * time * (1.0 + noise))
    }

    async fn value(&self) -> Result<f64> {
        Ok(*self.level.read().await)
    }
}

// =============================================================================
// SimMca
// =============================================================================

/// Simulated fluorescence detector
///
/// The ROI signal follows an absorption edge at `edge` keV, read against the
/// energy of the attached positioner: a flat background below the edge, a
/// white-line peak at the edge and a higher plateau above it.
pub struct SimMca {
    name: String,
    energy: Arc<dyn Positioner>,
    edge: f64,
    channels: usize,
}

impl SimMca {
    /// MCA looking at an edge at `edge` keV, with energy read from `energy`
    pub fn new(name: impl Into<String>, energy: Arc<dyn Positioner>, edge: f64) -> Self {
        Self {
            name: name.into(),
            energy,
            edge,
            channels: 4096,
        }
    }

    fn edge_response(&self, energy: f64) -> f64 {
        let width = 0.002;
        let x = (energy - self.edge) / width;
        let step = 1.0 / (1.0 + (-x).exp());
        let white_line = 0.6 * (-(x - 1.0).powi(2) / 2.0).exp();
        100.0 + 400.0 * step + 400.0 * white_line
    }
}

#[async_trait]
impl Counter for SimMca {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count(&self, time: f64) -> Result<f64> {
        let energy = self.energy.position().await?;
        Ok(self.edge_response(energy) * time)
    }

    async fn value(&self) -> Result<f64> {
        let energy = self.energy.position().await?;
        Ok(self.edge_response(energy))
    }
}

#[async_trait]
impl Spectrometer for SimMca {
    async fn acquire(&self, time: f64) -> Result<Spectrum> {
        if time <= 0.0 {
            bail!("{}: count time must be positive", self.name);
        }
        // 10 eV per channel; a single emission line near the configured edge
        let line = self.edge * 0.88;
        let energy: Vec<f64> = (0..self.channels).map(|ch| ch as f64 * 0.01).collect();
        let counts = energy
            .iter()
            .map(|e| time * (5.0 + 1000.0 * (-((e - line) / 0.08).powi(2)).exp()))
            .collect();
        Ok(Spectrum { energy, counts })
    }
}

// =============================================================================
// SimGoniometer
// =============================================================================

type ScanHook = Box<dyn Fn(usize) + Send + Sync>;

/// Simulated oscillation axis
///
/// Records each sweep as `(start_angle, delta, time)`. A sweep takes
/// `time * time_scale` seconds (default 0). An optional hook runs after each
/// sweep with the number of sweeps completed.
pub struct SimGoniometer {
    sweeps: Mutex<Vec<(f64, f64, f64)>>,
    time_scale: f64,
    hook: Mutex<Option<ScanHook>>,
}

impl SimGoniometer {
    /// Goniometer with zero wall-time sweeps
    pub fn new() -> Self {
        Self {
            sweeps: Mutex::new(Vec::new()),
            time_scale: 0.0,
            hook: Mutex::new(None),
        }
    }

    /// Spend `time_scale` seconds of wall time per second of exposure
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale;
        self
    }

    /// Install a hook called after every sweep
    pub fn set_hook(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.hook.lock() {
            *slot = Some(Box::new(hook));
        }
    }

    /// Sweeps performed so far
    pub fn sweeps(&self) -> Vec<(f64, f64, f64)> {
        self.sweeps.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Default for SimGoniometer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Goniometer for SimGoniometer {
    async fn scan(&self, start_angle: f64, delta: f64, time: f64) -> Result<()> {
        if self.time_scale > 0.0 {
            sleep(Duration::from_secs_f64(time * self.time_scale)).await;
        } else {
            tokio::task::yield_now().await;
        }
        let count = {
            let mut sweeps = self
                .sweeps
                .lock()
                .map_err(|_| anyhow!("goniometer state poisoned"))?;
            sweeps.push((start_angle, delta, time));
            sweeps.len()
        };
        if let Ok(hook) = self.hook.lock() {
            if let Some(hook) = hook.as_ref() {
                hook(count);
            }
        }
        Ok(())
    }
}

// =============================================================================
// SimDetector
// =============================================================================

/// Operation recorded by [`SimDetector`]
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOp {
    /// Header pushed for this file name
    Header(String),
    /// Acquisition started
    Start,
    /// Image saved
    Save,
}

/// Simulated area detector that records its exposure cycle
pub struct SimDetector {
    name: String,
    ops: Mutex<Vec<DetectorOp>>,
    failures: AtomicU32,
}

impl SimDetector {
    /// New detector with an empty log
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ops: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
        }
    }

    /// Make the next `count` calls to `start()` fail
    pub fn fail_starts(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Operations performed so far
    pub fn ops(&self) -> Vec<DetectorOp> {
        self.ops.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// File names of saved images, in order
    pub fn saved_files(&self) -> Vec<String> {
        let mut current = None;
        let mut saved = Vec::new();
        for op in self.ops() {
            match op {
                DetectorOp::Header(name) => current = Some(name),
                DetectorOp::Save => {
                    if let Some(name) = current.take() {
                        saved.push(name);
                    }
                }
                DetectorOp::Start => {}
            }
        }
        saved
    }

    fn record(&self, op: DetectorOp) -> Result<()> {
        self.ops
            .lock()
            .map_err(|_| anyhow!("detector log poisoned"))?
            .push(op);
        Ok(())
    }
}

#[async_trait]
impl ImageDetector for SimDetector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_header(&self, header: &ImageHeader) -> Result<()> {
        self.record(DetectorOp::Header(header.filename.clone()))
    }

    async fn start(&self) -> Result<()> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            bail!("{}: acquisition did not start", self.name);
        }
        self.record(DetectorOp::Start)
    }

    async fn save(&self) -> Result<()> {
        self.record(DetectorOp::Save)
    }
}

// =============================================================================
// SimShutter / SimBeamMonitor
// =============================================================================

/// Simulated shutter
#[derive(Default)]
pub struct SimShutter {
    open: AtomicBool,
    cycles: AtomicUsize,
}

impl SimShutter {
    /// Closed shutter
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the shutter was opened
    pub fn open_count(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Shutter for SimShutter {
    async fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::SeqCst);
        self.cycles.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn is_open(&self) -> Result<bool> {
        Ok(self.open.load(Ordering::SeqCst))
    }
}

/// Simulated storage ring with a settable current
///
/// The current is stored as raw `f64` bits so tests can change it from
/// synchronous device hooks.
pub struct SimBeamMonitor {
    current: AtomicU64,
}

impl SimBeamMonitor {
    /// Ring at `current` mA
    pub fn new(current: f64) -> Self {
        Self {
            current: AtomicU64::new(current.to_bits()),
        }
    }

    /// Change the stored current
    pub fn set_current(&self, current: f64) {
        self.current.store(current.to_bits(), Ordering::SeqCst);
    }
}

#[async_trait]
impl BeamMonitor for SimBeamMonitor {
    async fn ring_current(&self) -> Result<f64> {
        Ok(f64::from_bits(self.current.load(Ordering::SeqCst)))
    }
}
