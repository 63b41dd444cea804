//! Spectroscopy scans
//!
//! - [`targets`]: energy target lists for MAD and EXAFS scans
//! - [`scanner`]: the step-scan engine
//! - [`normalizer`]: incident-flux correction running beside a scan
//! - [`output`]: the plain-text data files scans write
//! - [`xrf`]: single-shot fluorescence excitation spectra
//! - [`chooch`]: MAD energy selection with the external `chooch` program

pub mod chooch;
pub mod normalizer;
pub mod output;
pub mod scanner;
pub mod targets;
pub mod xrf;

pub use chooch::{AutoChooch, ChoochResults, EnergyChoice};
pub use normalizer::Normalizer;
pub use output::{ScanData, ScanPoint};
pub use scanner::{ScanControl, ScanHandle, ScanPlan, ScanReport, ScanTarget, Scanner};
pub use xrf::excitation_scan;
