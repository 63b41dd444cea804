//! Runs, frames and run-list expansion.
//!
//! A [`Run`] is the operator's template for a data set. Expanding it yields
//! the [`Frame`]s to expose, in acquisition order: the angular range is cut
//! into wedges, and each wedge is repeated for every energy and, with inverse
//! beam, at 180° from the first sweep.
//!
//! A [`RunList`] concatenates the frames of several runs in ascending run
//! number. It is always regenerated from scratch when a run changes.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{MxdcError, Result};

/// Acquisition template for one data set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Run {
    /// Run number; run 0 is the single-sweep test run
    pub number: u32,
    /// File name prefix
    pub prefix: String,
    /// Output directory
    pub directory: String,
    /// Detector distance in mm
    pub distance: f64,
    /// Oscillation width per frame in degrees
    pub delta: f64,
    /// Exposure time per frame in seconds
    pub time: f64,
    /// Goniometer angle of the first frame in degrees
    pub start_angle: f64,
    /// No frame is exposed past this angle, except that a run always has one frame
    pub end_angle: f64,
    /// Angular size of one wedge in degrees
    pub wedge: f64,
    /// Repeat every wedge 180° away
    pub inverse_beam: bool,
    /// Energies in keV
    pub energies: Vec<f64>,
    /// One label per energy, used in file names
    pub energy_labels: Vec<String>,
}

impl Default for Run {
    fn default() -> Self {
        Self {
            number: 0,
            prefix: "test".to_string(),
            directory: "/data".to_string(),
            distance: 150.0,
            delta: 0.5,
            time: 5.0,
            start_angle: 0.0,
            end_angle: 0.5,
            wedge: 180.0,
            inverse_beam: false,
            energies: vec![12.658],
            energy_labels: vec!["E0".to_string()],
        }
    }
}

/// One image to expose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Position in the run list, contiguous from 0
    pub index: usize,
    /// Run the frame was expanded from
    pub run_number: u32,
    /// Frame number within the run, 1-based
    pub frame_number: u32,
    /// Image name without directory or extension
    pub frame_name: String,
    /// Full path of the image file
    pub file_name: String,
    /// Oscillation start in degrees
    pub start_angle: f64,
    /// Oscillation width in degrees
    pub delta: f64,
    /// Exposure time in seconds
    pub time: f64,
    /// Beam energy in keV
    pub energy: f64,
    /// Detector distance in mm
    pub distance: f64,
    /// Written by a collection, or found on disk
    pub saved: bool,
}

impl Run {
    /// Angular range covered by one sweep
    pub fn angle_range(&self) -> f64 {
        self.end_angle - self.start_angle
    }

    /// Check parameters before expansion
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| MxdcError::InvalidRun {
            run: self.number,
            reason: reason.to_string(),
        };
        if self.prefix.trim().is_empty() {
            return Err(invalid("prefix is empty"));
        }
        if !self.delta.is_finite() || self.delta <= 0.0 {
            return Err(invalid("delta must be positive"));
        }
        if !self.time.is_finite() || self.time <= 0.0 {
            return Err(invalid("exposure time must be positive"));
        }
        if !self.angle_range().is_finite() || self.angle_range() <= 0.0 {
            return Err(invalid("end angle must be greater than start angle"));
        }
        if self.energies.is_empty() {
            return Err(invalid("no energies configured"));
        }
        if self.energies.len() != self.energy_labels.len() {
            return Err(invalid("energies and energy labels differ in length"));
        }
        Ok(())
    }

    /// Wedge clamped to the angle range; non-positive means the whole range
    pub fn effective_wedge(&self) -> f64 {
        let range = self.angle_range();
        if self.wedge <= 0.0 || self.wedge > range {
            range
        } else {
            self.wedge
        }
    }

    /// Whole frames that fit in the range, at least one
    fn frames_per_sweep(&self) -> usize {
        let frames = self.angle_range() / self.delta;
        if !frames.is_finite() || frames <= 0.0 {
            return 0;
        }
        ((frames + 1e-9).floor() as usize).max(1)
    }

    fn is_test_run(&self) -> bool {
        self.number == 0
    }

    fn wedge_frames(&self, frames: usize) -> usize {
        if self.is_test_run() {
            return frames;
        }
        let wedge = (self.effective_wedge() / self.delta + 1e-9).floor() as usize;
        wedge.clamp(1, frames.max(1))
    }

    fn offsets(&self) -> &'static [f64] {
        if self.inverse_beam && !self.is_test_run() {
            &[0.0, 180.0]
        } else {
            &[0.0]
        }
    }

    fn energy_count(&self) -> usize {
        if self.is_test_run() {
            1
        } else {
            self.energies.len()
        }
    }

    /// Number of frames this run expands to
    pub fn frame_count(&self) -> usize {
        self.frames_per_sweep() * self.energy_count() * self.offsets().len()
    }

    /// Expand into frames numbered from `first_index`
    pub fn expand(&self, first_index: usize) -> Result<Vec<Frame>> {
        self.validate()?;

        let frames = self.frames_per_sweep();
        let wedge_frames = self.wedge_frames(frames);
        let passes = frames.div_ceil(wedge_frames);
        let energies: Vec<(f64, &str)> = self
            .energies
            .iter()
            .copied()
            .zip(self.energy_labels.iter().map(String::as_str))
            .take(self.energy_count())
            .collect();
        let labelled = energies.len() > 1;

        let mut expanded = Vec::with_capacity(self.frame_count());
        let mut index = first_index;
        for pass in 0..passes {
            let first = pass * wedge_frames;
            let size = wedge_frames.min(frames - first);
            for &(energy, label) in &energies {
                for &offset in self.offsets() {
                    let offset_frames = (offset / self.delta).round() as usize;
                    for j in 0..size {
                        let step = first + j;
                        let frame_number = (step + offset_frames + 1) as u32;
                        let frame_name = if labelled {
                            format!("{}_{}_{}_{:04}", self.prefix, self.number, label, frame_number)
                        } else {
                            format!("{}_{}_{:04}", self.prefix, self.number, frame_number)
                        };
                        let file_name = Path::new(&self.directory)
                            .join(format!("{frame_name}.img"))
                            .to_string_lossy()
                            .into_owned();
                        expanded.push(Frame {
                            index,
                            run_number: self.number,
                            frame_number,
                            frame_name,
                            file_name,
                            start_angle: self.start_angle + step as f64 * self.delta + offset,
                            delta: self.delta,
                            time: self.time,
                            energy,
                            distance: self.distance,
                            saved: false,
                        });
                        index += 1;
                    }
                }
            }
        }
        Ok(expanded)
    }
}

/// Ordered frames across all runs of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunList {
    frames: Vec<Frame>,
}

impl RunList {
    /// Expand `runs` in ascending run number
    pub fn expand<'a>(runs: impl IntoIterator<Item = &'a Run>) -> Result<Self> {
        let mut runs: Vec<&Run> = runs.into_iter().collect();
        runs.sort_by_key(|run| run.number);
        if let Some(pair) = runs.windows(2).find(|w| w[0].number == w[1].number) {
            return Err(MxdcError::InvalidRun {
                run: pair[0].number,
                reason: "run number used twice".to_string(),
            });
        }

        let mut frames = Vec::new();
        for run in runs {
            let expanded = run.expand(frames.len())?;
            frames.extend(expanded);
        }
        Ok(Self { frames })
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when no run produced any frame
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames in acquisition order
    pub fn iter(&self) -> std::slice::Iter<'_, Frame> {
        self.frames.iter()
    }

    /// Frame at list position `index`
    pub fn get(&self, index: usize) -> Option<&Frame> {
        self.frames.get(index)
    }

    /// All frames as a slice
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Mark frames whose image file already exists; returns how many were found
    pub fn mark_existing(&mut self) -> usize {
        let mut found = 0;
        for frame in &mut self.frames {
            if Path::new(&frame.file_name).exists() {
                frame.saved = true;
                found += 1;
            }
        }
        found
    }

    /// Restart from `pos`: earlier frames count as saved, the rest are pending
    pub fn rewind_to(&mut self, pos: usize) -> Result<()> {
        if pos > self.frames.len() {
            return Err(MxdcError::PositionOutOfRange {
                pos,
                len: self.frames.len(),
            });
        }
        for (i, frame) in self.frames.iter_mut().enumerate() {
            frame.saved = i < pos;
        }
        Ok(())
    }

    /// Flip the saved flag of one frame, returning the new value
    pub fn toggle_saved(&mut self, index: usize) -> Result<bool> {
        let len = self.frames.len();
        let frame = self
            .frames
            .get_mut(index)
            .ok_or(MxdcError::PositionOutOfRange { pos: index, len })?;
        frame.saved = !frame.saved;
        Ok(frame.saved)
    }

    /// Set the saved flag of one frame
    pub fn set_saved(&mut self, index: usize, saved: bool) -> Result<()> {
        let len = self.frames.len();
        let frame = self
            .frames
            .get_mut(index)
            .ok_or(MxdcError::PositionOutOfRange { pos: index, len })?;
        frame.saved = saved;
        Ok(())
    }

    /// Frames currently marked saved
    pub fn saved_count(&self) -> usize {
        self.frames.iter().filter(|f| f.saved).count()
    }

    /// Fraction of frames saved, 0.0 for an empty list
    pub fn progress(&self) -> f64 {
        if self.frames.is_empty() {
            0.0
        } else {
            self.saved_count() as f64 / self.frames.len() as f64
        }
    }
}

impl<'a> IntoIterator for &'a RunList {
    type Item = &'a Frame;
    type IntoIter = std::slice::Iter<'a, Frame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep(number: u32) -> Run {
        Run {
            number,
            prefix: "lyso".to_string(),
            directory: "/data/lyso".to_string(),
            delta: 1.0,
            time: 1.0,
            start_angle: 0.0,
            end_angle: 180.0,
            wedge: 180.0,
            ..Run::default()
        }
    }

    #[test]
    fn expansion_is_repeatable() {
        let mut run = sweep(1);
        run.inverse_beam = true;
        run.wedge = 30.0;
        assert_eq!(run.expand(0).unwrap(), run.expand(0).unwrap());
    }

    #[test]
    fn single_sweep_covers_range() {
        let frames = sweep(1).expand(0).unwrap();
        assert_eq!(frames.len(), 180);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.start_angle, i as f64);
            assert_eq!(frame.frame_number, i as u32 + 1);
        }
        assert_eq!(frames[0].frame_name, "lyso_1_0001");
        assert_eq!(frames[0].file_name, "/data/lyso/lyso_1_0001.img");
    }

    #[test]
    fn oversized_wedge_is_clamped() {
        let mut wide = sweep(1);
        wide.wedge = 500.0;
        assert_eq!(wide.effective_wedge(), 180.0);
        assert_eq!(wide.expand(0).unwrap(), sweep(1).expand(0).unwrap());

        let mut unset = sweep(1);
        unset.wedge = 0.0;
        assert_eq!(unset.expand(0).unwrap(), sweep(1).expand(0).unwrap());
    }

    #[test]
    fn inverse_beam_doubles_frames() {
        let mut inverse = sweep(1);
        inverse.inverse_beam = true;
        let frames = inverse.expand(0).unwrap();
        assert_eq!(frames.len(), 2 * sweep(1).frame_count());
        assert_eq!(frames.len(), inverse.frame_count());
        assert_eq!(frames[180].start_angle, 180.0);
        assert_eq!(frames[180].frame_number, 181);
    }

    #[test]
    fn wedges_interleave_energies_and_offsets() {
        let run = Run {
            number: 2,
            prefix: "se".to_string(),
            directory: "/data".to_string(),
            delta: 1.0,
            time: 1.0,
            start_angle: 0.0,
            end_angle: 10.0,
            wedge: 4.0,
            inverse_beam: true,
            energies: vec![12.66, 12.85],
            energy_labels: vec!["peak".to_string(), "remo".to_string()],
            ..Run::default()
        };
        let frames = run.expand(0).unwrap();
        assert_eq!(frames.len(), 40);

        // first pass: peak 0..3, peak 180..183, remo 0..3, remo 180..183
        assert_eq!(frames[0].frame_name, "se_2_peak_0001");
        assert_eq!(frames[4].frame_name, "se_2_peak_0181");
        assert_eq!(frames[4].start_angle, 180.0);
        assert_eq!(frames[8].frame_name, "se_2_remo_0001");
        assert_eq!(frames[8].energy, 12.85);

        // the final pass holds the two remaining frames
        let last = frames.last().unwrap();
        assert_eq!(last.frame_name, "se_2_remo_0190");
        assert_eq!(last.start_angle, 189.0);
        let final_pass: Vec<_> = frames[32..].iter().map(|f| f.start_angle).collect();
        assert_eq!(final_pass, vec![8.0, 9.0, 188.0, 189.0, 8.0, 9.0, 188.0, 189.0]);
    }

    #[test]
    fn test_run_is_one_sweep_at_first_energy() {
        let run = Run {
            number: 0,
            end_angle: 2.0,
            wedge: 0.5,
            inverse_beam: true,
            energies: vec![12.66, 12.85],
            energy_labels: vec!["peak".to_string(), "remo".to_string()],
            ..Run::default()
        };
        let frames = run.expand(0).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.energy == 12.66));
        assert_eq!(frames[3].frame_name, "test_0_0004");
        assert_eq!(frames[3].start_angle, 1.5);
    }

    #[test]
    fn run_list_indices_are_contiguous() {
        let mut second = sweep(3);
        second.end_angle = 20.0;
        second.inverse_beam = true;
        // given out of order; expanded in run order
        let list = RunList::expand([&second, &sweep(1)]).unwrap();
        assert_eq!(list.len(), 180 + 40);
        for (i, frame) in list.iter().enumerate() {
            assert_eq!(frame.index, i);
        }
        assert_eq!(list.get(0).unwrap().run_number, 1);
        assert_eq!(list.get(180).unwrap().run_number, 3);
    }

    #[test]
    fn invalid_runs_rejected() {
        let mut run = sweep(4);
        run.delta = 0.0;
        assert!(matches!(run.validate(), Err(MxdcError::InvalidRun { run: 4, .. })));

        let mut run = sweep(4);
        run.energy_labels.push("extra".to_string());
        assert!(run.expand(0).is_err());

        let mut run = sweep(4);
        run.end_angle = run.start_angle;
        assert!(run.validate().is_err());

        assert!(RunList::expand([&sweep(1), &sweep(1)]).is_err());
    }

    #[test]
    fn partial_frame_is_not_exposed() {
        let run = Run {
            number: 1,
            delta: 4.0,
            end_angle: 10.0,
            ..Run::default()
        };
        let frames = run.expand(0).unwrap();
        let starts: Vec<f64> = frames.iter().map(|f| f.start_angle).collect();
        assert_eq!(starts, vec![0.0, 4.0]);
        let last = frames.last().unwrap();
        assert!(last.start_angle + last.delta <= run.end_angle);
    }

    #[test]
    fn range_shorter_than_delta_gives_one_frame() {
        let run = Run {
            number: 1,
            delta: 1.0,
            end_angle: 0.3,
            ..Run::default()
        };
        assert!(run.validate().is_ok());
        assert_eq!(run.frame_count(), 1);
        assert_eq!(run.expand(0).unwrap()[0].start_angle, 0.0);
    }

    #[test]
    fn mark_existing_finds_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let run = Run {
            number: 1,
            directory: dir.path().to_string_lossy().into_owned(),
            delta: 1.0,
            end_angle: 5.0,
            ..Run::default()
        };
        let mut list = RunList::expand([&run]).unwrap();
        std::fs::write(&list.get(1).unwrap().file_name, b"").unwrap();
        std::fs::write(&list.get(3).unwrap().file_name, b"").unwrap();

        assert_eq!(list.mark_existing(), 2);
        let saved: Vec<bool> = list.iter().map(|f| f.saved).collect();
        assert_eq!(saved, vec![false, true, false, true, false]);
        assert!((list.progress() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn rewind_marks_prefix_saved() {
        let mut list = RunList::expand([&sweep(1)]).unwrap();
        list.toggle_saved(100).unwrap();
        list.rewind_to(10).unwrap();
        assert_eq!(list.saved_count(), 10);
        assert!(list.get(9).unwrap().saved);
        assert!(!list.get(10).unwrap().saved);
        assert!(!list.get(100).unwrap().saved);
        assert!(list.rewind_to(181).is_err());
        assert!(list.rewind_to(180).is_ok());
        assert_eq!(list.progress(), 1.0);
    }

    #[test]
    fn empty_list_has_no_progress() {
        let list = RunList::default();
        assert!(list.is_empty());
        assert_eq!(list.progress(), 0.0);
    }
}
