//! Scanner - step scans of a positioner against a counter
//!
//! A scan moves its positioner through a precomputed target list, counting the
//! detector at every point for that point's count time. Counts are optionally
//! corrected by the [`Normalizer`] running alongside. The scan holds the
//! beamline lock and keeps the shutter open for its whole duration.
//!
//! Control mirrors the collector, checked before every point:
//!
//! - `pause` / `resume`; a lost or falling ring current pauses the scan the
//!   same way it pauses a collection
//! - `stop` ends early; the points so far are still written
//! - `abort` ends early and writes nothing
//!
//! # Usage
//!
//! ```rust,ignore
//! let plan = ScanPlan::mad(&beamline, 12.658, 1.0).with_output(dir.join("se.raw"));
//! let mut handle = Scanner::new(beamline.clone(), config.scan.clone()).start(plan)?;
//! while let Some(event) = handle.events().recv().await {
//!     if let ScanEvent::NewPoint { x, y, .. } = event {
//!         println!("{x:.4} {y:.0}");
//!     }
//! }
//! let report = handle.join().await?;
//! ```

use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::error::{MxdcError, Result};
use crate::events::{Command, EngineState, Outcome, ScanEvent};
use crate::hardware::retry::with_retries;
use crate::collector::BeamWatch;
use crate::hardware::{BeamMonitor, Beamline, Counter, Positioner, Shutter};
use crate::scan::normalizer::Normalizer;
use crate::scan::output::{ScanData, ScanPoint};
use crate::scan::targets::{
    energy_to_k, exafs_targets, exafs_time_func, linear_targets, mad_targets,
};

/// A position and how long to count there
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanTarget {
    /// Positioner target
    pub position: f64,
    /// Seconds to count at `position`
    pub count_time: f64,
}

/// Everything a scan needs
pub struct ScanPlan {
    /// Device stepped through the targets
    pub positioner: Arc<dyn Positioner>,
    /// Device counted at every target
    pub detector: Arc<dyn Counter>,
    /// Points in scan order
    pub targets: Vec<ScanTarget>,
    /// Base count time, recorded in the file header
    pub count_time: f64,
    /// Correct counts with the beamline's incident-flux reference
    pub normalize: bool,
    /// Data file written when the scan finishes or is stopped
    pub output: Option<PathBuf>,
    /// Position to return to once the scan ends
    pub return_to: Option<f64>,
}

impl ScanPlan {
    /// Fixed count time at every position
    pub fn new(
        positioner: Arc<dyn Positioner>,
        detector: Arc<dyn Counter>,
        positions: impl IntoIterator<Item = f64>,
        count_time: f64,
    ) -> Self {
        Self {
            positioner,
            detector,
            targets: positions
                .into_iter()
                .map(|position| ScanTarget {
                    position,
                    count_time,
                })
                .collect(),
            count_time,
            normalize: false,
            output: None,
            return_to: None,
        }
    }

    /// `steps` points from `start` towards `end`
    pub fn linear(
        positioner: Arc<dyn Positioner>,
        detector: Arc<dyn Counter>,
        start: f64,
        end: f64,
        steps: usize,
        count_time: f64,
    ) -> Self {
        Self::new(positioner, detector, linear_targets(start, end, steps), count_time)
    }

    /// MAD edge scan of the fluorescence detector around `edge` keV
    ///
    /// Normalised, and returns the energy to the edge afterwards.
    pub fn mad(beamline: &Beamline, edge: f64, count_time: f64) -> Self {
        let mut plan = Self::new(
            beamline.energy().clone(),
            beamline.mca().clone(),
            mad_targets(edge),
            count_time,
        );
        plan.normalize = true;
        plan.return_to = Some(edge);
        plan
    }

    /// EXAFS scan out to `kmax`, counting longer at high `k`
    pub fn exafs(beamline: &Beamline, edge: f64, kmax: f64, count_time: f64) -> Self {
        let targets = exafs_targets(edge, kmax)
            .into_iter()
            .map(|position| ScanTarget {
                position,
                count_time: exafs_time_func(count_time, energy_to_k(position - edge), kmax),
            })
            .collect();
        Self {
            positioner: beamline.energy().clone(),
            detector: beamline.mca().clone(),
            targets,
            count_time,
            normalize: true,
            output: None,
            return_to: Some(edge),
        }
    }

    /// Write the data file to `path` when the scan ends
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Turn flux normalisation on or off
    pub fn with_normalization(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        self
    }

    /// Total count time over all targets
    pub fn total_time(&self) -> f64 {
        self.targets.iter().map(|t| t.count_time).sum()
    }
}

/// Result of a finished scan
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// How the scan ended
    pub outcome: Outcome,
    /// Points counted, kept even when the scan was stopped early
    pub points: Vec<ScanPoint>,
    /// Data file, if one was written
    pub output: Option<PathBuf>,
}

/// Sends control requests to a running scan
#[derive(Debug, Clone)]
pub struct ScanControl {
    commands: mpsc::UnboundedSender<Command>,
}

impl ScanControl {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MxdcError::ChannelClosed)
    }

    /// Pause before the next point
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Continue a paused scan
    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    /// Finish early and save the points collected so far
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// Finish early without saving
    pub fn abort(&self) -> Result<()> {
        self.send(Command::Abort)
    }
}

/// Handle to a running scan
pub struct ScanHandle {
    control: ScanControl,
    state: watch::Receiver<EngineState>,
    events: mpsc::UnboundedReceiver<ScanEvent>,
    task: JoinHandle<ScanReport>,
}

impl ScanHandle {
    /// Control endpoint that can be moved to other tasks
    pub fn control(&self) -> ScanControl {
        self.control.clone()
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Event stream of this scan
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<ScanEvent> {
        &mut self.events
    }

    /// Wait for the scan to end
    pub async fn join(self) -> Result<ScanReport> {
        self.task
            .await
            .map_err(|e| MxdcError::Task(format!("scanner: {e}")))
    }
}

/// Runs scans on the beamline
pub struct Scanner {
    beamline: Arc<Beamline>,
    settings: ScanSettings,
}

impl Scanner {
    /// Scanner using `beamline` for the lock, shutter, flux reference and ring current
    pub fn new(beamline: Arc<Beamline>, settings: ScanSettings) -> Self {
        Self { beamline, settings }
    }

    /// Start `plan` on a new task
    ///
    /// Fails with [`MxdcError::Busy`] if another activity holds the beamline.
    pub fn start(&self, plan: ScanPlan) -> Result<ScanHandle> {
        if plan.targets.is_empty() {
            return Err(MxdcError::Configuration("scan has no targets".to_string()));
        }
        if let Some(bad) = plan
            .targets
            .iter()
            .find(|t| !t.count_time.is_finite() || t.count_time <= 0.0)
        {
            return Err(MxdcError::Configuration(format!(
                "count time {} at {} is not positive",
                bad.count_time, bad.position
            )));
        }
        let guard = self.beamline.try_lock()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);

        let scan_id = Uuid::new_v4();
        info!(
            scan = %scan_id,
            positioner = %plan.positioner.name(),
            detector = %plan.detector.name(),
            points = plan.targets.len(),
            "Starting scan"
        );

        let reference = if plan.normalize {
            self.beamline.i0().cloned()
        } else {
            None
        };
        let run = ScanRun {
            plan,
            reference,
            shutter: self.beamline.shutter().cloned(),
            ring: self.beamline.beam_monitor().clone(),
            beam: BeamWatch::default(),
            settings: self.settings.clone(),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            _guard: guard,
        };
        let span = info_span!("scan", scan = %scan_id);
        let task = tokio::spawn(run.run().instrument(span));

        Ok(ScanHandle {
            control: ScanControl {
                commands: command_tx,
            },
            state: state_rx,
            events: event_rx,
            task,
        })
    }
}

enum Flow {
    Continue,
    Stop,
    Abort,
}

struct ScanRun {
    plan: ScanPlan,
    reference: Option<Arc<dyn Counter>>,
    shutter: Option<Arc<dyn Shutter>>,
    ring: Arc<dyn BeamMonitor>,
    beam: BeamWatch,
    settings: ScanSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ScanEvent>,
    state: watch::Sender<EngineState>,
    _guard: OwnedMutexGuard<()>,
}

impl ScanRun {
    async fn run(mut self) -> ScanReport {
        let total = self.plan.targets.len();
        self.emit(ScanEvent::Started { total });
        self.set_state(EngineState::Running);

        let normalizer = Normalizer::start(
            self.reference.clone(),
            Duration::from_millis(self.settings.normalizer_interval_ms),
            Duration::from_secs_f64(self.settings.normalizer_window_secs),
        );

        let mut points = Vec::with_capacity(total);
        let outcome = match self.open_shutter().await {
            Err(e) => Outcome::Failed(e.to_string()),
            Ok(()) => self.scan_points(&normalizer, &mut points).await,
        };
        normalizer.stop().await;
        self.finish_devices().await;

        let output = match &outcome {
            Outcome::Completed | Outcome::Stopped => self.save(&points),
            Outcome::Aborted | Outcome::Failed(_) => None,
        };

        self.set_state(EngineState::Idle);
        match &outcome {
            Outcome::Completed | Outcome::Stopped => {
                info!(points = points.len(), "Scan finished");
                self.emit(ScanEvent::Done);
            }
            Outcome::Aborted => {
                warn!(points = points.len(), "Scan aborted");
                self.emit(ScanEvent::Aborted);
            }
            Outcome::Failed(message) => self.emit(ScanEvent::Error(message.clone())),
        }

        ScanReport {
            outcome,
            points,
            output,
        }
    }

    async fn scan_points(&mut self, normalizer: &Normalizer, points: &mut Vec<ScanPoint>) -> Outcome {
        let total = self.plan.targets.len();
        for i in 0..total {
            match self.check_commands().await {
                Flow::Continue => {}
                Flow::Stop => return Outcome::Stopped,
                Flow::Abort => return Outcome::Aborted,
            }
            match self.wait_for_beam().await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return Outcome::Stopped,
                Ok(Flow::Abort) => return Outcome::Aborted,
                Err(e) => {
                    error!(error = %e, "Cannot read ring current");
                    return Outcome::Failed(e.to_string());
                }
            }
            let target = self.plan.targets[i];
            match self.count_at(target).await {
                Ok(y) => {
                    let point = ScanPoint {
                        x: target.position,
                        y,
                        normalized: y * normalizer.factor(),
                        count_time: target.count_time,
                    };
                    points.push(point);
                    self.emit(ScanEvent::NewPoint {
                        x: point.x,
                        y: point.y,
                        normalized: point.normalized,
                    });
                    self.emit(ScanEvent::Log(format!("Point {} of {}", i + 1, total)));
                    self.emit(ScanEvent::Progress((i + 1) as f64 / total as f64));
                }
                Err(e) => {
                    error!(position = target.position, error = %e, "Scan failed");
                    return Outcome::Failed(e.to_string());
                }
            }
        }
        Outcome::Completed
    }

    async fn count_at(&self, target: ScanTarget) -> Result<f64> {
        let positioner = self.plan.positioner.as_ref();
        positioner
            .move_to(target.position, true)
            .await
            .map_err(|e| MxdcError::device(positioner.name(), e))?;
        let detector: &dyn Counter = self.plan.detector.as_ref();
        with_retries(detector.name(), "count", self.settings.count_retries, move || {
            detector.count(target.count_time)
        })
        .await
    }

    /// Pause while the beam is lost; the point is counted after resume
    async fn wait_for_beam(&mut self) -> Result<Flow> {
        loop {
            let current = self
                .ring
                .ring_current()
                .await
                .map_err(|e| MxdcError::device("ring current", e))?;
            if !self.beam.lost(current) {
                return Ok(Flow::Continue);
            }
            warn!(current, "Beam lost, pausing scan");
            self.emit(ScanEvent::BeamLost { current });
            match self.wait_while_paused().await {
                Flow::Continue => {}
                flow => return Ok(flow),
            }
        }
    }

    async fn check_commands(&mut self) -> Flow {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Stop => return Flow::Stop,
                Command::Abort => return Flow::Abort,
                Command::Pause => return self.wait_while_paused().await,
                Command::Resume | Command::Seek(_) => {}
            }
        }
        Flow::Continue
    }

    async fn wait_while_paused(&mut self) -> Flow {
        self.set_state(EngineState::Paused);
        self.emit(ScanEvent::Paused);
        warn!("Scan paused");
        loop {
            match self.commands.recv().await {
                Some(Command::Resume) => {
                    info!("Scan resumed");
                    self.set_state(EngineState::Running);
                    self.emit(ScanEvent::Resumed);
                    return Flow::Continue;
                }
                Some(Command::Stop) => return Flow::Stop,
                Some(Command::Abort) | None => return Flow::Abort,
                Some(Command::Pause | Command::Seek(_)) => {}
            }
        }
    }

    async fn open_shutter(&self) -> Result<()> {
        if let Some(shutter) = &self.shutter {
            shutter
                .open()
                .await
                .map_err(|e| MxdcError::device("shutter", e))?;
        }
        Ok(())
    }

    /// Close the shutter and park the positioner; failures are only logged
    async fn finish_devices(&self) {
        if let Some(shutter) = &self.shutter {
            if let Err(e) = shutter.close().await {
                error!(error = %e, "Cannot close shutter");
            }
        }
        if let Some(position) = self.plan.return_to {
            if let Err(e) = self.plan.positioner.move_to(position, false).await {
                warn!(position, error = %e, "Cannot return positioner");
            }
        }
    }

    fn save(&self, points: &[ScanPoint]) -> Option<PathBuf> {
        let path = self.plan.output.as_ref()?;
        let data = ScanData {
            positioner: self.plan.positioner.name(),
            detector: self.plan.detector.name(),
            count_time: self.plan.count_time,
            timestamp: Local::now(),
            normalized: self.plan.normalize,
            points,
        };
        match data.write(path) {
            Ok(()) => {
                info!(path = %path.display(), "Scan data saved");
                Some(path.clone())
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "Cannot save scan data");
                self.emit(ScanEvent::Log(format!("Cannot save scan data: {e}")));
                None
            }
        }
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{SimCounter, SimMotor};

    fn parts() -> (Arc<SimMotor>, Arc<SimCounter>) {
        (
            Arc::new(SimMotor::instant("slit", 0.0)),
            Arc::new(SimCounter::new("diode", 100.0)),
        )
    }

    #[test]
    fn exafs_plan_counts_longer_at_high_k() {
        let beamline = Beamline::simulated(&crate::config::BeamlineConfig::default()).unwrap();
        let plan = ScanPlan::exafs(&beamline, 12.658, 10.0, 1.0);
        let first = plan.targets.first().unwrap();
        let last = plan.targets.last().unwrap();
        assert_eq!(first.count_time, 1.0);
        assert!(last.count_time > 9.0);
        assert!(plan.total_time() > plan.targets.len() as f64);
        assert_eq!(plan.return_to, Some(12.658));
    }

    #[test]
    fn linear_plan_has_fixed_time() {
        let (motor, counter) = parts();
        let plan = ScanPlan::linear(motor, counter, 0.0, 1.0, 4, 0.5);
        assert_eq!(plan.targets.len(), 4);
        assert!(plan.targets.iter().all(|t| t.count_time == 0.5));
        assert!(!plan.normalize);
    }

    #[tokio::test]
    async fn empty_plan_is_rejected() {
        let beamline = Arc::new(Beamline::simulated(&crate::config::BeamlineConfig::default()).unwrap());
        let (motor, counter) = parts();
        let scanner = Scanner::new(beamline.clone(), ScanSettings::default());
        let plan = ScanPlan::new(motor, counter, Vec::new(), 1.0);
        assert!(matches!(scanner.start(plan), Err(MxdcError::Configuration(_))));
        assert!(!beamline.is_busy());
    }
}
