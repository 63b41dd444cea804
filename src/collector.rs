//! Collector - acquisition sequencer for diffraction runs
//!
//! The collector walks a [`RunList`] once, exposing every frame that is not
//! already saved. Each frame goes through:
//!
//! 1. control check (stop ends the session, pause waits for resume)
//! 2. skip if already saved and `skip_collected` is set
//! 3. beam check; a ring current below [`BEAM_LOST_THRESHOLD`], or one that
//!    fell below [`BEAM_DROP_FRACTION`] of the previous reading, pauses the
//!    collector and the frame is retried after resume
//! 4. distance and energy moves, only when off by more than the tolerance
//! 5. detector header, detector start (retried), goniometer sweep, save
//! 6. `NewImage` and `Progress` events; progress is the share of the list
//!    walked so far, whatever the `saved` flags said at start
//!
//! Control requests are honoured at frame boundaries; an exposure in flight
//! always completes. The beamline lock is held from `start` until the session
//! task ends.
//!
//! # Usage
//!
//! ```rust,ignore
//! let collector = Collector::new(beamline.clone(), config.collector.clone());
//! let mut handle = collector.start(run_list, true)?;
//! let control = handle.control();
//!
//! while let Some(event) = handle.events().recv().await {
//!     if let CollectEvent::NewImage { file_name, .. } = &event {
//!         println!("wrote {file_name}");
//!     }
//! }
//! let report = handle.join().await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::CollectorSettings;
use crate::error::{MxdcError, Result};
use crate::events::{CollectEvent, Command, EngineState, Outcome};
use crate::hardware::retry::with_retries;
use crate::hardware::{Beamline, ImageDetector, ImageHeader, Positioner};
use crate::run::{Frame, RunList};
use crate::units::kev_to_angstrom;

/// Ring current (mA) below which the beam counts as lost
///
/// Facility-specific; deliberately not configurable.
pub const BEAM_LOST_THRESHOLD: f64 = 5.0;

/// A reading below this fraction of the previous one counts as a beam dump
pub const BEAM_DROP_FRACTION: f64 = 0.5;

/// Tracks ring-current readings between frames or scan points
#[derive(Debug, Default)]
pub(crate) struct BeamWatch {
    last: Option<f64>,
}

impl BeamWatch {
    /// Record `current`, returning true if the beam is lost or dropping
    pub(crate) fn lost(&mut self, current: f64) -> bool {
        let dropped = self
            .last
            .is_some_and(|last| current < last * BEAM_DROP_FRACTION);
        self.last = Some(current);
        current < BEAM_LOST_THRESHOLD || dropped
    }
}

/// Summary of a finished collection
#[derive(Debug, Clone)]
pub struct CollectReport {
    /// The run list with `saved` flags as left by the session
    pub run_list: RunList,
    /// How the session ended
    pub outcome: Outcome,
    /// Frames exposed in this session
    pub collected: usize,
    /// Frames skipped because they were already saved
    pub skipped: usize,
}

/// Sends control requests to a running collection
///
/// Cheap to clone; every method fails with [`MxdcError::ChannelClosed`] once
/// the session has ended.
#[derive(Debug, Clone)]
pub struct CollectorControl {
    commands: mpsc::UnboundedSender<Command>,
}

impl CollectorControl {
    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MxdcError::ChannelClosed)
    }

    /// Pause before the next frame
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Leave the paused state, including an automatic beam-loss pause
    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    /// End the session before the next frame; later frames stay unsaved
    pub fn stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    /// While paused, continue from `pos`: earlier frames are marked saved
    /// and the rest pending
    pub fn seek(&self, pos: usize) -> Result<()> {
        self.send(Command::Seek(pos))
    }
}

/// Handle to a running collection
pub struct CollectorHandle {
    control: CollectorControl,
    state: watch::Receiver<EngineState>,
    events: mpsc::UnboundedReceiver<CollectEvent>,
    task: JoinHandle<CollectReport>,
}

impl CollectorHandle {
    /// Control endpoint that can be moved to other tasks
    pub fn control(&self) -> CollectorControl {
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

    /// Event stream of this session
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<CollectEvent> {
        &mut self.events
    }

    /// Wait for the session to end
    pub async fn join(self) -> Result<CollectReport> {
        self.task
            .await
            .map_err(|e| MxdcError::Task(format!("collector: {e}")))
    }
}

/// Acquisition sequencer
pub struct Collector {
    beamline: Arc<Beamline>,
    settings: CollectorSettings,
}

impl Collector {
    /// Collector driving `beamline` with the given tolerances and retries
    pub fn new(beamline: Arc<Beamline>, settings: CollectorSettings) -> Self {
        Self { beamline, settings }
    }

    /// Start collecting `run_list` on a new task
    ///
    /// Fails with [`MxdcError::Busy`] if another activity holds the beamline.
    pub fn start(&self, run_list: RunList, skip_collected: bool) -> Result<CollectorHandle> {
        let guard = self.beamline.try_lock()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(EngineState::Idle);

        let session_id = Uuid::new_v4();
        info!(
            session = %session_id,
            frames = run_list.len(),
            skip_collected,
            "Starting collection"
        );

        let session = Session {
            beamline: self.beamline.clone(),
            settings: self.settings.clone(),
            run_list,
            skip_collected,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            pos: 0,
            beam: BeamWatch::default(),
            collected: 0,
            skipped: 0,
            _guard: guard,
        };
        let span = info_span!("collect", session = %session_id);
        let task = tokio::spawn(session.run().instrument(span));

        Ok(CollectorHandle {
            control: CollectorControl {
                commands: command_tx,
            },
            state: state_rx,
            events: event_rx,
            task,
        })
    }
}

/// What the loop does after looking at pending commands
enum Flow {
    Continue,
    Stop,
}

struct Session {
    beamline: Arc<Beamline>,
    settings: CollectorSettings,
    run_list: RunList,
    skip_collected: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<CollectEvent>,
    state: watch::Sender<EngineState>,
    pos: usize,
    beam: BeamWatch,
    collected: usize,
    skipped: usize,
    _guard: OwnedMutexGuard<()>,
}

impl Session {
    async fn run(mut self) -> CollectReport {
        self.emit(CollectEvent::Started {
            total: self.run_list.len(),
        });
        self.set_state(EngineState::Running);

        let outcome = loop {
            if let Flow::Stop = self.check_commands().await {
                break Outcome::Stopped;
            }
            let Some(frame) = self.run_list.get(self.pos).cloned() else {
                break Outcome::Completed;
            };

            if frame.saved && self.skip_collected {
                debug!(frame = %frame.frame_name, "Skipping saved frame");
                self.skipped += 1;
                self.pos += 1;
                self.emit(CollectEvent::Skipped { index: frame.index });
                self.emit(CollectEvent::Progress(self.fraction_done()));
                continue;
            }

            match self.beamline.beam_monitor().ring_current().await {
                Ok(current) if self.beam.lost(current) => {
                    warn!(current, frame = %frame.frame_name, "Beam lost, pausing collection");
                    self.emit(CollectEvent::BeamLost { current });
                    if let Flow::Stop = self.wait_while_paused().await {
                        break Outcome::Stopped;
                    }
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    let err = MxdcError::device("ring current", e);
                    error!(error = %err, "Cannot read ring current");
                    break Outcome::Failed(err.to_string());
                }
            }

            match self.expose(&frame).await {
                Ok(()) => {
                    if let Err(e) = self.run_list.set_saved(frame.index, true) {
                        break Outcome::Failed(e.to_string());
                    }
                    self.collected += 1;
                    self.pos += 1;
                    info!(frame = %frame.frame_name, index = frame.index, "Image collected");
                    self.emit(CollectEvent::NewImage {
                        index: frame.index,
                        file_name: frame.file_name.clone(),
                    });
                    self.emit(CollectEvent::Progress(self.fraction_done()));
                }
                Err(e) => {
                    error!(frame = %frame.frame_name, error = %e, "Collection failed");
                    break Outcome::Failed(e.to_string());
                }
            }
        };

        self.set_state(EngineState::Idle);
        match &outcome {
            Outcome::Completed => {
                info!(collected = self.collected, skipped = self.skipped, "Collection complete");
                self.emit(CollectEvent::Done);
            }
            Outcome::Stopped | Outcome::Aborted => {
                info!(position = self.pos, "Collection stopped");
                self.emit(CollectEvent::Stopped);
            }
            Outcome::Failed(message) => self.emit(CollectEvent::Error(message.clone())),
        }

        CollectReport {
            run_list: self.run_list,
            outcome,
            collected: self.collected,
            skipped: self.skipped,
        }
    }

    /// Drain pending commands without blocking
    async fn check_commands(&mut self) -> Flow {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Stop | Command::Abort => return Flow::Stop,
                Command::Pause => return self.wait_while_paused().await,
                Command::Resume => {}
                Command::Seek(pos) => warn!(pos, "Ignoring seek while running"),
            }
        }
        Flow::Continue
    }

    /// Block until resume or stop
    async fn wait_while_paused(&mut self) -> Flow {
        self.set_state(EngineState::Paused);
        info!(position = self.pos, "Collection paused");
        loop {
            match self.commands.recv().await {
                Some(Command::Resume) => {
                    info!(position = self.pos, "Collection resumed");
                    self.set_state(EngineState::Running);
                    return Flow::Continue;
                }
                Some(Command::Stop | Command::Abort) | None => return Flow::Stop,
                Some(Command::Seek(pos)) => match self.run_list.rewind_to(pos) {
                    Ok(()) => {
                        info!(position = pos, "Collection repositioned");
                        self.pos = pos;
                        self.emit(CollectEvent::Progress(self.fraction_done()));
                    }
                    Err(e) => warn!(error = %e, "Ignoring seek"),
                },
                Some(Command::Pause) => {}
            }
        }
    }

    async fn expose(&self, frame: &Frame) -> Result<()> {
        let beamline = &self.beamline;
        move_if_needed(beamline.distance().as_ref(), frame.distance, self.settings.distance_tolerance)
            .await?;
        move_if_needed(beamline.energy().as_ref(), frame.energy, self.settings.energy_tolerance)
            .await?;

        let path = Path::new(&frame.file_name);
        let header = ImageHeader {
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| frame.frame_name.clone()),
            directory: path
                .parent()
                .map(|dir| dir.to_string_lossy().into_owned())
                .unwrap_or_default(),
            distance: frame.distance,
            wavelength: kev_to_angstrom(frame.energy),
            start_angle: frame.start_angle,
            delta: frame.delta,
            exposure_time: frame.time,
            beam_x: self.settings.beam_x,
            beam_y: self.settings.beam_y,
        };

        let detector: &dyn ImageDetector = beamline.detector().as_ref();
        detector
            .set_header(&header)
            .await
            .map_err(|e| MxdcError::device(detector.name(), e))?;
        with_retries(detector.name(), "start", self.settings.detector_retries, move || {
            detector.start()
        })
        .await?;
        beamline
            .goniometer()
            .scan(frame.start_angle, frame.delta, frame.time)
            .await
            .map_err(|e| MxdcError::device("goniometer", e))?;
        detector
            .save()
            .await
            .map_err(|e| MxdcError::device(detector.name(), e))?;
        Ok(())
    }

    fn fraction_done(&self) -> f64 {
        if self.run_list.is_empty() {
            1.0
        } else {
            self.pos as f64 / self.run_list.len() as f64
        }
    }

    fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        self.emit(CollectEvent::StateChanged(state));
    }

    fn emit(&self, event: CollectEvent) {
        // nobody listening is fine
        let _ = self.events.send(event);
    }
}

/// Move `device` to `target` unless it is already within `tolerance`
async fn move_if_needed(device: &dyn Positioner, target: f64, tolerance: f64) -> Result<()> {
    let current = device
        .position()
        .await
        .map_err(|e| MxdcError::device(device.name(), e))?;
    if (target - current).abs() > tolerance {
        debug!(device = %device.name(), from = current, to = target, "Moving");
        device
            .move_to(target, true)
            .await
            .map_err(|e| MxdcError::device(device.name(), e))?;
    }
    Ok(())
}
