//! CHOOCH analysis of MAD edge scans
//!
//! The external `chooch` program turns a normalised fluorescence scan into
//! anomalous scattering factors f' and f'' and suggests the peak and inflection
//! energies for a MAD experiment. [`AutoChooch`] writes the input file, runs the
//! program, saves its report and parses the results. A remote energy is then
//! picked from the f'/f'' curve, between 50 and 200 eV above the peak, where
//! f' + f'' is largest.
//!
//! Files, all in the configured directory:
//!
//! | file          | contents                                  |
//! |---------------|-------------------------------------------|
//! | `{name}.dat`  | scan points, energy in eV                 |
//! | `{name}.esf`  | f'/f'' curve written by `chooch`          |
//! | `{name}.out`  | `chooch` report (its standard output)     |
//! | `{name}.mad`  | selected energies as JSON                 |
//!
//! The program is never retried; a non-zero exit is a [`MxdcError::Chooch`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;
use tracing::{debug, error, info};

use crate::error::{MxdcError, Result};
use crate::scan::output::{parse_table, ScanPoint};

/// Lower bound of the remote-energy window above the peak, in eV
const REMOTE_MIN_OFFSET_EV: f64 = 50.0;
/// Upper bound of the remote-energy window above the peak, in eV
const REMOTE_MAX_OFFSET_EV: f64 = 200.0;

/// One suggested energy with its scattering factors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyChoice {
    /// `peak`, `infl` or `remo`
    pub label: String,
    /// Energy in keV
    pub energy: f64,
    /// f'' in electrons
    pub fpp: f64,
    /// f' in electrons
    pub fp: f64,
}

/// A point of the f'/f'' curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EsfPoint {
    /// Energy in keV
    pub energy: f64,
    /// f'' in electrons
    pub fpp: f64,
    /// f' in electrons
    pub fp: f64,
}

/// Everything CHOOCH reported for one scan
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChoochResults {
    /// Peak, inflection and remote energies
    pub choices: Vec<EnergyChoice>,
    /// Full f'/f'' curve
    pub esf: Vec<EsfPoint>,
}

impl ChoochResults {
    /// Choice with the given label
    pub fn choice(&self, label: &str) -> Option<&EnergyChoice> {
        self.choices.iter().find(|c| c.label == label)
    }
}

/// Runs `chooch` on a MAD scan
#[derive(Debug, Clone)]
pub struct AutoChooch {
    command: String,
    directory: PathBuf,
    name: String,
    element: String,
    edge: String,
}

impl AutoChooch {
    /// Analysis of the scan `name` of an edge written as `"Se-K"`
    ///
    /// `command` is the program to run, optionally followed by fixed leading
    /// arguments.
    pub fn new(
        command: impl Into<String>,
        directory: impl Into<PathBuf>,
        name: impl Into<String>,
        edge: &str,
    ) -> Result<Self> {
        let (element, shell) = edge
            .split_once('-')
            .filter(|(e, s)| !e.is_empty() && !s.is_empty())
            .ok_or_else(|| MxdcError::Configuration(format!("edge '{edge}' is not ELEMENT-EDGE")))?;
        let command = command.into();
        if command.trim().is_empty() {
            return Err(MxdcError::Configuration("chooch command is empty".to_string()));
        }
        Ok(Self {
            command,
            directory: directory.into(),
            name: name.into(),
            element: element.to_string(),
            edge: shell.to_string(),
        })
    }

    /// Raw scan written for CHOOCH
    pub fn input_file(&self) -> PathBuf {
        self.file("dat")
    }

    /// f'/f'' curve written by CHOOCH
    pub fn esf_file(&self) -> PathBuf {
        self.file("esf")
    }

    /// Captured CHOOCH stdout
    pub fn output_file(&self) -> PathBuf {
        self.file("out")
    }

    /// Selected energies as JSON
    pub fn results_file(&self) -> PathBuf {
        self.file("mad")
    }

    fn file(&self, extension: &str) -> PathBuf {
        self.directory.join(format!("{}.{extension}", self.name))
    }

    /// Analyse normalised scan points (energies in keV)
    pub async fn run(&self, points: &[ScanPoint]) -> Result<ChoochResults> {
        if points.is_empty() {
            return Err(MxdcError::Chooch("no scan points to analyse".to_string()));
        }
        fs::create_dir_all(&self.directory)?;
        fs::write(self.input_file(), chooch_input(points))?;

        let mut parts = self.command.split_whitespace();
        let program = parts.next().unwrap_or("chooch");
        let input = self.input_file();
        let esf = self.esf_file();
        info!(element = %self.element, edge = %self.edge, input = %input.display(), "Running CHOOCH");

        let output = Command::new(program)
            .args(parts)
            .arg("-e")
            .arg(&self.element)
            .arg("-a")
            .arg(&self.edge)
            .arg(&input)
            .arg("-o")
            .arg(&esf)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MxdcError::Chooch(format!("cannot run {program}: {e}")))?;

        let report = String::from_utf8_lossy(&output.stdout).into_owned();
        fs::write(self.output_file(), &report)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(status = %output.status, stderr = %stderr.trim(), "CHOOCH failed");
            return Err(MxdcError::Chooch(format!("{program} exited with {}", output.status)));
        }

        let esf_text = fs::read_to_string(&esf)
            .map_err(|e| MxdcError::Chooch(format!("cannot read {}: {e}", esf.display())))?;
        let esf = parse_esf(&esf_text).map_err(|reason| MxdcError::Parse {
            path: esf.clone(),
            reason,
        })?;
        let mut choices = parse_choices(&report);
        if choices.is_empty() {
            return Err(MxdcError::Chooch("report lists no energies".to_string()));
        }
        if let Some(remote) = select_remote(&choices, &esf) {
            choices.push(remote);
        }
        let results = ChoochResults { choices, esf };
        for choice in &results.choices {
            debug!(label = %choice.label, energy = choice.energy, fp = choice.fp, fpp = choice.fpp, "MAD energy");
        }

        let json = serde_json::to_string_pretty(&results)
            .map_err(|e| MxdcError::Chooch(format!("cannot encode results: {e}")))?;
        fs::write(self.results_file(), json)?;
        info!(choices = results.choices.len(), "CHOOCH analysis complete");
        Ok(results)
    }
}

/// Input file contents: a header, the point count, then `energy(eV) counts`
pub fn chooch_input(points: &[ScanPoint]) -> String {
    let mut text = format!("#CHOOCH INPUT DATA\n{}\n", points.len());
    for point in points {
        let _ = writeln!(text, "{:0.2} {:0.2}", point.x * 1000.0, point.normalized);
    }
    text
}

fn choice_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"\|\s+([a-z]+)\s+\|\s+([^|]+?)\s+\|\s+([^|]+?)\s+\|\s+([^|]+?)\s+\|").ok()
        })
        .as_ref()
}

/// Energies from the `chooch` report table
///
/// Rows read `| label | energy (eV) | f'' | f' |`; rows whose cells are not
/// numbers are ignored. Energies are returned in keV.
pub fn parse_choices(report: &str) -> Vec<EnergyChoice> {
    let Some(pattern) = choice_pattern() else {
        return Vec::new();
    };
    report
        .lines()
        .filter_map(|line| pattern.captures(line))
        .filter_map(|caps| {
            let number = |i: usize| caps[i].trim().parse::<f64>().ok();
            Some(EnergyChoice {
                label: caps[1].to_string(),
                energy: number(2)? * 1e-3,
                fpp: number(3)?,
                fp: number(4)?,
            })
        })
        .collect()
}

/// The f'/f'' curve: columns energy (eV), f'', f'; energies returned in keV
pub fn parse_esf(text: &str) -> std::result::Result<Vec<EsfPoint>, String> {
    parse_table(text)?
        .into_iter()
        .enumerate()
        .map(|(i, row)| match row[..] {
            [energy, fpp, fp, ..] => Ok(EsfPoint {
                energy: energy * 1e-3,
                fpp,
                fp,
            }),
            _ => Err(format!("row {}: expected 3 columns, found {}", i + 1, row.len())),
        })
        .collect()
}

/// Remote energy: 50-200 eV above the peak, maximising f' + f''
pub fn select_remote(choices: &[EnergyChoice], esf: &[EsfPoint]) -> Option<EnergyChoice> {
    let peak = choices.iter().find(|c| c.label == "peak")?.energy;
    let low = peak + REMOTE_MIN_OFFSET_EV * 1e-3;
    let high = peak + REMOTE_MAX_OFFSET_EV * 1e-3;
    esf.iter()
        .filter(|p| p.energy > low && p.energy < high)
        .max_by(|a, b| (a.fp + a.fpp).total_cmp(&(b.fp + b.fpp)))
        .map(|p| EnergyChoice {
            label: "remo".to_string(),
            energy: p.energy,
            fpp: p.fpp,
            fp: p.fp,
        })
}

/// Load results written by an earlier run
pub fn load_results(path: &Path) -> Result<ChoochResults> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| MxdcError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "\
 Selected Energies for 3-Wavelength MAD data
 and corresponding anomalous scattering factors.
 +------+------------+----------+--------+
 |      |   energy   |   f''    |   f'   |
 | peak |  12660.50  |   5.12   |  -8.31 |
 | infl |  12658.20  |   2.84   | -10.62 |
 +------+------------+----------+--------+
";

    fn esf_text() -> String {
        let mut text = String::from("# energy fpp fp\n");
        for i in 0..40 {
            let e = 12600.0 + i as f64 * 10.0;
            // f' + f'' peaks at 12800 eV
            let fp = -2.0 - ((e - 12800.0) / 50.0).powi(2);
            let _ = writeln!(text, "{e:.2} 4.00 {fp:.4}");
        }
        text
    }

    #[test]
    fn report_rows_become_choices() {
        let choices = parse_choices(REPORT);
        assert_eq!(choices.len(), 2);
        assert_eq!(choices[0].label, "peak");
        assert!((choices[0].energy - 12.6605).abs() < 1e-9);
        assert_eq!(choices[0].fpp, 5.12);
        assert_eq!(choices[1].fp, -10.62);
    }

    #[test]
    fn remote_maximises_sum_above_peak() {
        let choices = parse_choices(REPORT);
        let esf = parse_esf(&esf_text()).unwrap();
        assert_eq!(esf.len(), 40);
        let remote = select_remote(&choices, &esf).unwrap();
        assert_eq!(remote.label, "remo");
        assert!((remote.energy - 12.8).abs() < 1e-9, "got {}", remote.energy);
    }

    #[test]
    fn remote_needs_a_peak() {
        let esf = parse_esf(&esf_text()).unwrap();
        assert!(select_remote(&[], &esf).is_none());
    }

    #[test]
    fn esf_rows_need_three_columns() {
        let err = parse_esf("12600.0 4.0\n").unwrap_err();
        assert!(err.contains("expected 3 columns"), "{err}");
    }

    #[test]
    fn input_file_lists_points_in_ev() {
        let points = [ScanPoint {
            x: 12.658,
            y: 100.0,
            normalized: 101.256,
            count_time: 1.0,
        }];
        assert_eq!(chooch_input(&points), "#CHOOCH INPUT DATA\n1\n12658.00 101.26\n");
    }

    #[test]
    fn edge_must_name_element_and_shell() {
        assert!(AutoChooch::new("chooch", "/tmp", "se", "Se").is_err());
        assert!(AutoChooch::new("chooch", "/tmp", "se", "Se-K").is_ok());
    }

    #[cfg(unix)]
    mod external {
        use super::*;

        fn points() -> Vec<ScanPoint> {
            (0..5)
                .map(|i| ScanPoint {
                    x: 12.65 + i as f64 * 0.002,
                    y: 100.0,
                    normalized: 100.0,
                    count_time: 1.0,
                })
                .collect()
        }

        /// A stand-in for `chooch`: writes the curve to the `-o` argument and
        /// prints the report
        fn fake_chooch(dir: &Path, exit_code: i32) -> String {
            let esf = dir.join("curve.txt");
            fs::write(&esf, esf_text()).unwrap();
            let report = dir.join("report.txt");
            fs::write(&report, REPORT).unwrap();
            let script = dir.join("chooch.sh");
            let body = format!(
                "while [ \"$#\" -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then cp '{}' \"$2\"; fi\n  shift\ndone\ncat '{}'\nexit {exit_code}\n",
                esf.display(),
                report.display()
            );
            fs::write(&script, body).unwrap();
            format!("sh {}", script.display())
        }

        #[tokio::test]
        async fn successful_run_writes_results() {
            let dir = tempfile::tempdir().unwrap();
            let command = fake_chooch(dir.path(), 0);
            let chooch = AutoChooch::new(command, dir.path().join("mad"), "se_scan", "Se-K").unwrap();

            let results = chooch.run(&points()).await.unwrap();
            assert_eq!(results.choices.len(), 3);
            assert!(results.choice("infl").is_some());
            assert!((results.choice("remo").unwrap().energy - 12.8).abs() < 1e-9);

            let input = fs::read_to_string(chooch.input_file()).unwrap();
            assert!(input.starts_with("#CHOOCH INPUT DATA\n5\n"));
            assert!(fs::read_to_string(chooch.output_file()).unwrap().contains("| peak |"));
            let saved = load_results(&chooch.results_file()).unwrap();
            assert_eq!(saved.choices, results.choices);
        }

        #[tokio::test]
        async fn non_zero_exit_is_a_chooch_error() {
            let dir = tempfile::tempdir().unwrap();
            let command = fake_chooch(dir.path(), 3);
            let chooch = AutoChooch::new(command, dir.path(), "se_scan", "Se-K").unwrap();

            let err = chooch.run(&points()).await.unwrap_err();
            assert!(matches!(err, MxdcError::Chooch(_)), "{err}");
            assert!(!chooch.results_file().exists());
        }
    }
}
