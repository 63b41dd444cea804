//! Plain-text scan data files.
//!
//! ```text
//! # Positioner: energy
//! # Detector: mca
//! # Detector count time: 1.0000 sec
//! # Date: 2026-10-19T14:03:11+00:00
//! #
//! # Columns: (energy)	(mca)	(mca normalized)
//!     12.45800000     1023.00000000     1021.77000000
//! ```

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{MxdcError, Result};

/// One counted scan point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Positioner value
    pub x: f64,
    /// Raw counts
    pub y: f64,
    /// Counts multiplied by the normalisation factor
    pub normalized: f64,
    /// Count time used for this point
    pub count_time: f64,
}

/// A finished scan ready to be written
#[derive(Debug, Clone)]
pub struct ScanData<'a> {
    /// Name of the scanned positioner
    pub positioner: &'a str,
    /// Name of the counted detector
    pub detector: &'a str,
    /// Base count time in seconds
    pub count_time: f64,
    /// When the scan finished
    pub timestamp: DateTime<Local>,
    /// Add a third column of normalised counts
    pub normalized: bool,
    /// Rows in scan order
    pub points: &'a [ScanPoint],
}

impl ScanData<'_> {
    /// Render header and columns
    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "# Positioner: {}", self.positioner);
        let _ = writeln!(text, "# Detector: {}", self.detector);
        let _ = writeln!(text, "# Detector count time: {:0.4} sec", self.count_time);
        let _ = writeln!(text, "# Date: {}", self.timestamp.to_rfc3339());
        let _ = writeln!(text, "#");
        if self.normalized {
            let _ = writeln!(
                text,
                "# Columns: ({})\t({})\t({} normalized)",
                self.positioner, self.detector, self.detector
            );
        } else {
            let _ = writeln!(text, "# Columns: ({})\t({})", self.positioner, self.detector);
        }
        for point in self.points {
            if self.normalized {
                let _ = writeln!(text, "{:>15.8} {:>15.8} {:>15.8}", point.x, point.y, point.normalized);
            } else {
                let _ = writeln!(text, "{:>15.8} {:>15.8}", point.x, point.y);
            }
        }
        text
    }

    /// Write to `path`, creating parent directories
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render())?;
        Ok(())
    }
}

/// Read a whitespace-separated numeric table, skipping `#` comments and
/// blank lines
pub fn read_table(path: &Path) -> Result<Vec<Vec<f64>>> {
    let text = fs::read_to_string(path)?;
    parse_table(&text).map_err(|reason| MxdcError::Parse {
        path: path.to_path_buf(),
        reason,
    })
}

/// Parse a numeric table from text; errors name the offending line
pub fn parse_table(text: &str) -> std::result::Result<Vec<Vec<f64>>, String> {
    text.lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            line.split_whitespace()
                .map(|field| {
                    field
                        .parse::<f64>()
                        .map_err(|_| format!("line {n}: '{field}' is not a number"))
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points() -> Vec<ScanPoint> {
        vec![
            ScanPoint {
                x: 12.458,
                y: 1000.0,
                normalized: 1010.0,
                count_time: 1.0,
            },
            ScanPoint {
                x: 12.459,
                y: 1200.0,
                normalized: 1190.0,
                count_time: 1.0,
            },
        ]
    }

    #[test]
    fn header_and_three_columns() {
        let points = points();
        let data = ScanData {
            positioner: "energy",
            detector: "mca",
            count_time: 0.5,
            timestamp: Local::now(),
            normalized: true,
            points: &points,
        };
        let text = data.render();
        assert!(text.starts_with("# Positioner: energy\n# Detector: mca\n"));
        assert!(text.contains("# Detector count time: 0.5000 sec"));
        assert!(text.contains("# Columns: (energy)\t(mca)\t(mca normalized)"));

        let table = parse_table(&text).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[1], vec![12.459, 1200.0, 1190.0]);
    }

    #[test]
    fn two_column_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scans").join("se.raw");
        let points = points();
        ScanData {
            positioner: "energy",
            detector: "mca",
            count_time: 1.0,
            timestamp: Local::now(),
            normalized: false,
            points: &points,
        }
        .write(&path)
        .unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table, vec![vec![12.458, 1000.0], vec![12.459, 1200.0]]);
    }

    #[test]
    fn bad_number_reports_line() {
        let err = parse_table("# header\n1 2\n3 x\n").unwrap_err();
        assert_eq!(err, "line 3: 'x' is not a number");
    }
}
