//! CCD detector status decoding and exposure driver.
//!
//! The detector controller reports a 32-bit status word made of eight 4-bit
//! task fields. From the most significant nibble down they are: two unused
//! fields, `dezinger`, `write`, `correct`, `read`, `acquire` and the overall
//! `state`. Each nibble is a flag set: bit 0 queued, bit 1 executing, bit 2
//! error, bit 3 busy.
//!
//! [`CcdState::decode`] turns the word into a structured value;
//! [`CcdDetector`] drives a controller through the exposure cycle by waiting
//! on decoded states.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, trace};

use super::capabilities::{ImageDetector, ImageHeader};

/// Detector task reported in the status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcdTask {
    /// Overall controller state
    State,
    /// Integration
    Acquire,
    /// Readout
    Read,
    /// Image correction
    Correct,
    /// File write
    Write,
    /// Background dezingering
    Dezinger,
}

impl CcdTask {
    const ALL: [CcdTask; 6] = [
        CcdTask::Dezinger,
        CcdTask::Write,
        CcdTask::Correct,
        CcdTask::Read,
        CcdTask::Acquire,
        CcdTask::State,
    ];

    fn shift(self) -> u32 {
        match self {
            CcdTask::State => 0,
            CcdTask::Acquire => 4,
            CcdTask::Read => 8,
            CcdTask::Correct => 12,
            CcdTask::Write => 16,
            CcdTask::Dezinger => 20,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CcdTask::State => "state",
            CcdTask::Acquire => "acquire",
            CcdTask::Read => "read",
            CcdTask::Correct => "correct",
            CcdTask::Write => "write",
            CcdTask::Dezinger => "dezinger",
        }
    }
}

/// Flag set carried by one task nibble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStatus(u8);

impl TaskStatus {
    const QUEUED: u8 = 0b0001;
    const EXECUTING: u8 = 0b0010;
    const ERROR: u8 = 0b0100;
    const BUSY: u8 = 0b1000;

    /// Build from a raw nibble (upper bits are ignored)
    pub fn from_nibble(nibble: u8) -> Self {
        Self(nibble & 0x0f)
    }

    /// Raw nibble value
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Task is waiting in the queue
    pub fn queued(self) -> bool {
        self.0 & Self::QUEUED != 0
    }

    /// Task is running
    pub fn executing(self) -> bool {
        self.0 & Self::EXECUTING != 0
    }

    /// Task reported an error
    pub fn error(self) -> bool {
        self.0 & Self::ERROR != 0
    }

    /// Controller is busy with this task
    pub fn busy(self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Queued, executing or busy
    pub fn is_active(self) -> bool {
        self.queued() || self.executing() || self.busy()
    }

    fn describe(self) -> String {
        let mut parts = Vec::new();
        if self.queued() {
            parts.push("queue");
        }
        if self.executing() {
            parts.push("exec");
        }
        if self.error() {
            parts.push("err");
        }
        if self.busy() {
            parts.push("busy");
        }
        parts.join("+")
    }
}

/// Decoded detector status word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcdState {
    raw: u32,
}

impl CcdState {
    /// Decode a raw status word
    pub fn decode(raw: u32) -> Self {
        Self { raw }
    }

    /// The raw word
    pub fn raw(self) -> u32 {
        self.raw
    }

    /// Status of a single task
    pub fn task(self, task: CcdTask) -> TaskStatus {
        TaskStatus::from_nibble(((self.raw >> task.shift()) & 0x0f) as u8)
    }

    /// No task has any flag set (the two unused nibbles are ignored)
    pub fn is_idle(self) -> bool {
        self.raw & 0x00ff_ffff == 0
    }

    /// Any task reports an error
    pub fn has_error(self) -> bool {
        CcdTask::ALL.iter().any(|t| self.task(*t).error())
    }

    /// Labels in the controller's own vocabulary, e.g. `["acquire:exec"]`,
    /// or `["idle"]` when nothing is active
    pub fn labels(self) -> Vec<String> {
        let labels: Vec<String> = CcdTask::ALL
            .iter()
            .filter_map(|task| {
                let status = self.task(*task);
                (status.bits() != 0).then(|| format!("{}:{}", task.label(), status.describe()))
            })
            .collect();
        if labels.is_empty() {
            vec!["idle".to_string()]
        } else {
            labels
        }
    }

    /// Word with `task` set to `status`; used by controllers building states
    pub fn with_task(self, task: CcdTask, status: u8) -> Self {
        let mask = 0x0f << task.shift();
        Self {
            raw: (self.raw & !mask) | ((u32::from(status) & 0x0f) << task.shift()),
        }
    }
}

impl fmt::Display for CcdState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.labels().join(", "))
    }
}

/// Commands understood by the detector controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcdCommand {
    /// Start integrating
    Start,
    /// Abort the current operation
    Abort,
    /// Read out and write the frame
    Readout,
    /// Acquire a background (dark) frame
    Background,
}

/// Transport to a CCD controller
#[async_trait]
pub trait CcdController: Send + Sync {
    /// Read the raw status word
    async fn raw_state(&self) -> Result<u32>;

    /// Issue a command
    async fn command(&self, command: CcdCommand) -> Result<()>;

    /// Write image header fields
    async fn write_header(&self, header: &ImageHeader) -> Result<()>;
}

/// Area detector driven through status-word waits
pub struct CcdDetector<C: CcdController> {
    name: String,
    controller: C,
    timeout: Duration,
    poll: Duration,
}

impl<C: CcdController> CcdDetector<C> {
    /// Wrap a controller with default timings (10 s timeout, 10 ms poll)
    pub fn new(name: impl Into<String>, controller: C) -> Self {
        Self {
            name: name.into(),
            controller,
            timeout: Duration::from_secs(10),
            poll: Duration::from_millis(10),
        }
    }

    /// Override the state-wait timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Current decoded state
    pub async fn state(&self) -> Result<CcdState> {
        Ok(CcdState::decode(self.controller.raw_state().await?))
    }

    /// Wait until `predicate` holds; `false` on timeout
    async fn wait_until<F>(&self, predicate: F) -> Result<bool>
    where
        F: Fn(CcdState) -> bool + Send,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            let state = self.state().await?;
            trace!(detector = %self.name, state = %state, "status");
            if predicate(state) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(self.poll).await;
        }
    }

    /// Take a background frame, optionally waiting for it to finish
    pub async fn acquire_background(&self, wait: bool) -> Result<()> {
        if !self.wait_until(CcdState::is_idle).await? {
            bail!("{} not idle, cannot take background", self.name);
        }
        self.controller.command(CcdCommand::Background).await?;
        if wait {
            self.wait_until(|s| s.task(CcdTask::Acquire).executing()).await?;
            self.wait_until(CcdState::is_idle).await?;
        }
        Ok(())
    }

    /// Abort whatever the controller is doing
    pub async fn abort(&self) -> Result<()> {
        self.controller.command(CcdCommand::Abort).await
    }
}

#[async_trait]
impl<C: CcdController> ImageDetector for CcdDetector<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_header(&self, header: &ImageHeader) -> Result<()> {
        self.controller.write_header(header).await
    }

    async fn start(&self) -> Result<()> {
        let settled = self
            .wait_until(|s| !s.task(CcdTask::Acquire).is_active())
            .await?;
        if !settled {
            bail!("{}: previous acquisition still in progress", self.name);
        }
        self.controller.command(CcdCommand::Start).await?;
        if !self
            .wait_until(|s| s.task(CcdTask::Acquire).executing())
            .await?
        {
            bail!("{}: acquisition did not start within {:?}", self.name, self.timeout);
        }
        debug!(detector = %self.name, "acquiring");
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        self.controller.command(CcdCommand::Readout).await?;
        let written = self
            .wait_until(|s| s.task(CcdTask::Write).is_active() || s.is_idle())
            .await?;
        if !written {
            bail!("{}: readout did not reach the write stage", self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SimPhase {
    Idle,
    Acquiring,
    Reading(Instant),
    Background(Instant),
}

/// Simulated CCD controller producing realistic status words
///
/// Readout takes `readout` time: first the read task executes, then the
/// write task, then the controller returns to idle.
pub struct SimCcdController {
    phase: Mutex<SimPhase>,
    readout: Duration,
    ignored_starts: AtomicU32,
    headers: Mutex<Vec<ImageHeader>>,
}

impl SimCcdController {
    /// Controller with a 20 ms readout
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(SimPhase::Idle),
            readout: Duration::from_millis(20),
            ignored_starts: AtomicU32::new(0),
            headers: Mutex::new(Vec::new()),
        }
    }

    /// Ignore the next `count` start commands, simulating a stuck controller
    pub fn ignore_starts(&self, count: u32) {
        self.ignored_starts.store(count, Ordering::SeqCst);
    }

    /// Headers written so far
    pub async fn headers(&self) -> Vec<ImageHeader> {
        self.headers.lock().await.clone()
    }
}

impl Default for SimCcdController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CcdController for SimCcdController {
    async fn raw_state(&self) -> Result<u32> {
        let mut phase = self.phase.lock().await;
        let idle = CcdState::decode(0);
        let current = *phase;
        let state = match current {
            SimPhase::Idle => idle,
            SimPhase::Acquiring => idle
                .with_task(CcdTask::Acquire, TaskStatus::EXECUTING)
                .with_task(CcdTask::State, TaskStatus::BUSY),
            SimPhase::Background(since) => {
                if since.elapsed() < self.readout {
                    idle.with_task(CcdTask::Acquire, TaskStatus::EXECUTING)
                        .with_task(CcdTask::State, TaskStatus::BUSY)
                } else {
                    *phase = SimPhase::Idle;
                    idle
                }
            }
            SimPhase::Reading(since) => {
                let elapsed = since.elapsed();
                if elapsed < self.readout / 2 {
                    idle.with_task(CcdTask::Read, TaskStatus::EXECUTING)
                        .with_task(CcdTask::State, TaskStatus::BUSY)
                } else if elapsed < self.readout {
                    idle.with_task(CcdTask::Write, TaskStatus::EXECUTING)
                        .with_task(CcdTask::State, TaskStatus::BUSY)
                } else {
                    *phase = SimPhase::Idle;
                    idle
                }
            }
        };
        Ok(state.raw())
    }

    async fn command(&self, command: CcdCommand) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match command {
            CcdCommand::Start => {
                let ignored = self.ignored_starts.load(Ordering::SeqCst);
                if ignored > 0 {
                    self.ignored_starts.store(ignored - 1, Ordering::SeqCst);
                } else {
                    *phase = SimPhase::Acquiring;
                }
            }
            CcdCommand::Readout => {
                if *phase != SimPhase::Acquiring {
                    bail!("readout requested while not acquiring");
                }
                *phase = SimPhase::Reading(Instant::now());
            }
            CcdCommand::Background => *phase = SimPhase::Background(Instant::now()),
            CcdCommand::Abort => *phase = SimPhase::Idle,
        }
        Ok(())
    }

    async fn write_header(&self, header: &ImageHeader) -> Result<()> {
        self.headers.lock().await.push(header.clone());
        Ok(())
    }
}

#[async_trait]
impl<C: CcdController> CcdController for Arc<C> {
    async fn raw_state(&self) -> Result<u32> {
        self.as_ref().raw_state().await
    }

    async fn command(&self, command: CcdCommand) -> Result<()> {
        self.as_ref().command(command).await
    }

    async fn write_header(&self, header: &ImageHeader) -> Result<()> {
        self.as_ref().write_header(header).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_idle_word() {
        let state = CcdState::decode(0);
        assert!(state.is_idle());
        assert_eq!(state.labels(), vec!["idle".to_string()]);
    }

    #[test]
    fn decode_acquire_executing() {
        // acquire nibble = 2 (exec), state nibble = 8 (busy)
        let state = CcdState::decode(0x0000_0028);
        assert!(state.task(CcdTask::Acquire).executing());
        assert!(!state.task(CcdTask::Acquire).queued());
        assert!(state.task(CcdTask::State).busy());
        assert_eq!(
            state.labels(),
            vec!["acquire:exec".to_string(), "state:busy".to_string()]
        );
    }

    #[test]
    fn decode_queued_write_with_error() {
        // write nibble = 5 (queue + err)
        let state = CcdState::decode(0x0005_0000);
        let write = state.task(CcdTask::Write);
        assert!(write.queued());
        assert!(write.error());
        assert!(!write.executing());
        assert!(state.has_error());
        assert_eq!(state.labels(), vec!["write:queue+err".to_string()]);
    }

    #[test]
    fn unused_nibbles_do_not_report_tasks() {
        let state = CcdState::decode(0xff00_0000);
        assert!(state.is_idle());
        assert_eq!(state.labels(), vec!["idle".to_string()]);
    }

    #[test]
    fn with_task_replaces_nibble() {
        let state = CcdState::decode(0)
            .with_task(CcdTask::Read, 0b0011)
            .with_task(CcdTask::Read, 0b0010);
        assert_eq!(state.raw(), 0x0000_0200);
    }

    #[tokio::test]
    async fn exposure_cycle_on_simulated_controller() {
        let controller = Arc::new(SimCcdController::new());
        let detector = CcdDetector::new("ccd", controller.clone());
        let header = ImageHeader {
            filename: "test_1_0001.img".into(),
            directory: "/tmp".into(),
            distance: 150.0,
            wavelength: 0.98,
            start_angle: 0.0,
            delta: 1.0,
            exposure_time: 1.0,
            beam_x: 1024.0,
            beam_y: 1024.0,
        };
        detector.set_header(&header).await.unwrap();
        detector.start().await.unwrap();
        assert!(detector.state().await.unwrap().task(CcdTask::Acquire).executing());
        detector.save().await.unwrap();
        assert_eq!(controller.headers().await, vec![header]);
    }

    #[tokio::test]
    async fn start_times_out_when_controller_ignores_command() {
        let controller = Arc::new(SimCcdController::new());
        controller.ignore_starts(1);
        let detector = CcdDetector::new("ccd", controller.clone())
            .with_timeout(Duration::from_millis(50));
        let err = detector.start().await.unwrap_err();
        assert!(err.to_string().contains("did not start"));
        // the next attempt goes through
        detector.start().await.unwrap();
    }

    #[tokio::test]
    async fn background_returns_to_idle() {
        let detector = CcdDetector::new("ccd", SimCcdController::new());
        detector.acquire_background(true).await.unwrap();
        assert!(detector.state().await.unwrap().is_idle());
    }
}
