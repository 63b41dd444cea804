//! Fluorescence excitation scan
//!
//! A single spectrometer acquisition at a fixed excitation energy, used to
//! identify the elements present in a sample before choosing an edge.

use chrono::Local;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::{MxdcError, Result};
use crate::hardware::{Beamline, Spectrum};
use crate::scan::output::{ScanData, ScanPoint};

/// Acquire one spectrum at `energy` keV for `time` seconds
///
/// Holds the beamline lock for the duration. The shutter, if any, is open only
/// while the spectrometer counts. With `output` set, the spectrum is written
/// as a two-column file of channel energy and counts.
pub async fn excitation_scan(
    beamline: &Arc<Beamline>,
    energy: f64,
    time: f64,
    output: Option<&Path>,
) -> Result<Spectrum> {
    if !time.is_finite() || time <= 0.0 {
        return Err(MxdcError::Configuration(format!(
            "count time {time} is not positive"
        )));
    }
    let _guard = beamline.try_lock()?;
    info!(energy, time, "Starting excitation scan");

    let positioner = beamline.energy();
    positioner
        .move_to(energy, true)
        .await
        .map_err(|e| MxdcError::device(positioner.name(), e))?;

    if let Some(shutter) = beamline.shutter() {
        shutter
            .open()
            .await
            .map_err(|e| MxdcError::device("shutter", e))?;
    }
    let spectrum = beamline.spectrometer().acquire(time).await;
    if let Some(shutter) = beamline.shutter() {
        if let Err(e) = shutter.close().await {
            error!(error = %e, "Cannot close shutter");
        }
    }
    let spectrum = spectrum.map_err(|e| MxdcError::device(beamline.mca().name(), e))?;

    if spectrum.energy.len() != spectrum.counts.len() {
        warn!(
            energies = spectrum.energy.len(),
            counts = spectrum.counts.len(),
            "Spectrum columns differ in length"
        );
    }

    if let Some(path) = output {
        let points: Vec<ScanPoint> = spectrum
            .energy
            .iter()
            .zip(&spectrum.counts)
            .map(|(&x, &y)| ScanPoint {
                x,
                y,
                normalized: y,
                count_time: time,
            })
            .collect();
        ScanData {
            positioner: "energy",
            detector: beamline.mca().name(),
            count_time: time,
            timestamp: Local::now(),
            normalized: false,
            points: &points,
        }
        .write(path)?;
        info!(path = %path.display(), channels = points.len(), "Excitation spectrum saved");
    }
    Ok(spectrum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BeamlineConfig;
    use crate::scan::output::read_table;

    #[tokio::test]
    async fn spectrum_is_written_as_two_columns() {
        let beamline = Arc::new(Beamline::simulated(&BeamlineConfig::default()).unwrap());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xrf.raw");

        let spectrum = excitation_scan(&beamline, 13.0, 0.5, Some(&path)).await.unwrap();
        assert!(!spectrum.counts.is_empty());
        assert!(!beamline.is_busy());

        let table = read_table(&path).unwrap();
        assert_eq!(table.len(), spectrum.counts.len());
        assert!(table.iter().all(|row| row.len() == 2));
    }

    #[tokio::test]
    async fn refused_while_busy() {
        let beamline = Arc::new(Beamline::simulated(&BeamlineConfig::default()).unwrap());
        let _held = beamline.try_lock().unwrap();
        let err = excitation_scan(&beamline, 13.0, 0.5, None).await.unwrap_err();
        assert!(matches!(err, MxdcError::Busy));
    }
}
