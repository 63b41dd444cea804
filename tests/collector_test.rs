//! Integration tests for the collector.
//!
//! Drives full collections against simulated devices and checks pause, stop,
//! restart and skip behaviour through the public handle API.

use anyhow::Result;
use mxdc::config::CollectorSettings;
use mxdc::events::{CollectEvent, EngineState, Outcome};
use mxdc::hardware::mock::{
    SimBeamMonitor, SimDetector, SimGoniometer, SimMca, SimMotor, SimShutter,
};
use mxdc::hardware::Beamline;
use mxdc::{Collector, CollectorControl, Run, RunList};
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tempfile::tempdir;

struct TestBeamline {
    beamline: Arc<Beamline>,
    goniometer: Arc<SimGoniometer>,
    detector: Arc<SimDetector>,
    distance: Arc<SimMotor>,
}

fn test_beamline() -> Result<TestBeamline> {
    let energy = Arc::new(SimMotor::instant("energy", 12.658));
    let distance = Arc::new(SimMotor::instant("detector_z", 150.0));
    let goniometer = Arc::new(SimGoniometer::new());
    let detector = Arc::new(SimDetector::new("ccd"));
    let beamline = Beamline::builder("test")
        .energy(energy.clone())
        .distance(distance.clone())
        .goniometer(goniometer.clone())
        .detector(detector.clone())
        .mca(Arc::new(SimMca::new("mca", energy, 12.658)))
        .shutter(Arc::new(SimShutter::new()))
        .beam_monitor(Arc::new(SimBeamMonitor::new(250.0)))
        .build()?;
    Ok(TestBeamline {
        beamline: Arc::new(beamline),
        goniometer,
        detector,
        distance,
    })
}

fn run(directory: &Path, frames: f64) -> Run {
    Run {
        number: 1,
        prefix: "insulin".into(),
        directory: directory.display().to_string(),
        distance: 200.0,
        delta: 1.0,
        time: 0.5,
        end_angle: frames,
        ..Run::default()
    }
}

/// Run `action` on the collector once the goniometer has finished `sweeps`
fn after_sweeps(
    goniometer: &SimGoniometer,
    sweeps: usize,
    action: fn(&CollectorControl),
) -> Arc<OnceLock<CollectorControl>> {
    let slot: Arc<OnceLock<CollectorControl>> = Arc::new(OnceLock::new());
    let hook_slot = slot.clone();
    goniometer.set_hook(move |done| {
        if done == sweeps {
            if let Some(control) = hook_slot.get() {
                action(control);
            }
        }
    });
    slot
}

#[tokio::test]
async fn distance_moves_once_for_the_run() -> Result<()> {
    let bl = test_beamline()?;
    let dir = tempdir()?;
    let run_list = RunList::expand([&run(dir.path(), 4.0)])?;

    let collector = Collector::new(bl.beamline.clone(), CollectorSettings::default());
    let report = collector.start(run_list, true)?.join().await?;

    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(bl.distance.move_count(), 1);
    let sweeps = bl.goniometer.sweeps();
    assert_eq!(sweeps.len(), 4);
    assert_eq!(sweeps[3], (3.0, 1.0, 0.5));
    Ok(())
}

#[tokio::test]
async fn pause_holds_until_resume() -> Result<()> {
    let bl = test_beamline()?;
    let dir = tempdir()?;
    let run_list = RunList::expand([&run(dir.path(), 5.0)])?;

    let slot = after_sweeps(&bl.goniometer, 2, |control| {
        let _ = control.pause();
    });
    let collector = Collector::new(bl.beamline.clone(), CollectorSettings::default());
    let mut handle = collector.start(run_list, true)?;
    let _ = slot.set(handle.control());

    let mut state = handle.watch_state();
    state.wait_for(|s| *s == EngineState::Paused).await?;
    // the frame in flight when pause arrived is still saved
    assert_eq!(bl.detector.saved_files().len(), 2);

    handle.control().resume()?;
    let mut images = 0;
    while let Some(event) = handle.events().recv().await {
        if let CollectEvent::NewImage { .. } = event {
            images += 1;
        }
    }
    let report = handle.join().await?;
    assert_eq!(images, 5);
    assert_eq!(report.outcome, Outcome::Completed);
    assert_eq!(report.collected, 5);

    // nothing skipped or repeated across the pause
    let expected: Vec<String> = (1..=5).map(|n| format!("insulin_1_{n:04}.img")).collect();
    assert_eq!(bl.detector.saved_files(), expected);
    let starts: Vec<f64> = bl.goniometer.sweeps().iter().map(|s| s.0).collect();
    assert_eq!(starts, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[tokio::test]
async fn stopped_collection_resumes_where_it_left_off() -> Result<()> {
    let bl = test_beamline()?;
    let dir = tempdir()?;
    let run_list = RunList::expand([&run(dir.path(), 5.0)])?;

    let slot = after_sweeps(&bl.goniometer, 2, |control| {
        let _ = control.stop();
    });
    let collector = Collector::new(bl.beamline.clone(), CollectorSettings::default());
    let mut handle = collector.start(run_list, true)?;
    let _ = slot.set(handle.control());

    let mut stopped = false;
    while let Some(event) = handle.events().recv().await {
        stopped |= event == CollectEvent::Stopped;
    }
    let report = handle.join().await?;
    assert!(stopped);
    assert_eq!(report.outcome, Outcome::Stopped);
    assert_eq!(report.collected, 2);
    assert_eq!(report.run_list.saved_count(), 2);
    assert!(!bl.beamline.is_busy());

    // restart with the returned list; saved frames are skipped
    let second = collector.start(report.run_list, true)?.join().await?;
    assert_eq!(second.outcome, Outcome::Completed);
    assert_eq!(second.skipped, 2);
    assert_eq!(second.collected, 3);
    assert_eq!(second.run_list.progress(), 1.0);
    assert_eq!(bl.detector.saved_files().len(), 5);
    Ok(())
}

#[tokio::test]
async fn existing_images_are_skipped_unless_recollecting() -> Result<()> {
    let bl = test_beamline()?;
    let dir = tempdir()?;
    let mut run_list = RunList::expand([&run(dir.path(), 4.0)])?;
    for frame in run_list.iter().take(2) {
        fs::write(&frame.file_name, b"")?;
    }
    assert_eq!(run_list.mark_existing(), 2);

    let collector = Collector::new(bl.beamline.clone(), CollectorSettings::default());
    let skipping = collector.start(run_list.clone(), true)?.join().await?;
    assert_eq!(skipping.skipped, 2);
    assert_eq!(skipping.collected, 2);
    assert_eq!(bl.detector.saved_files(), vec!["insulin_1_0003.img", "insulin_1_0004.img"]);

    let recollecting = collector.start(run_list, false)?.join().await?;
    assert_eq!(recollecting.skipped, 0);
    assert_eq!(recollecting.collected, 4);
    Ok(())
}

#[tokio::test]
async fn inverse_beam_interleaves_wedges() -> Result<()> {
    let bl = test_beamline()?;
    let dir = tempdir()?;
    let mut inverse = run(dir.path(), 4.0);
    inverse.wedge = 2.0;
    inverse.inverse_beam = true;
    let run_list = RunList::expand([&inverse])?;
    assert_eq!(run_list.len(), 8);

    let collector = Collector::new(bl.beamline.clone(), CollectorSettings::default());
    collector.start(run_list, true)?.join().await?;

    let starts: Vec<f64> = bl.goniometer.sweeps().iter().map(|s| s.0).collect();
    assert_eq!(starts, vec![0.0, 1.0, 180.0, 181.0, 2.0, 3.0, 182.0, 183.0]);
    Ok(())
}
