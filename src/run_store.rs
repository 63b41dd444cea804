//! Run parameter persistence.
//!
//! Runs are kept in `~/.mxdc/run_config.toml` as one table per run number:
//!
//! ```toml
//! [1]
//! prefix = "lyso"
//! directory = "/data/lyso"
//! delta = 1.0
//! ...
//! ```
//!
//! The file is read at startup and rewritten whenever a run is applied.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{MxdcError, Result};
use crate::run::Run;

/// File name under the user's `~/.mxdc` directory
pub const RUN_CONFIG_FILE: &str = "run_config.toml";

/// TOML-backed store of run parameters keyed by run number
#[derive(Debug, Clone)]
pub struct RunStore {
    path: PathBuf,
}

impl RunStore {
    /// Store at an explicit path
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.mxdc/run_config.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| MxdcError::RunStore("cannot determine home directory".to_string()))?;
        Ok(home.join(".mxdc").join(RUN_CONFIG_FILE))
    }

    /// Store at the default path
    pub fn open_default() -> Result<Self> {
        Ok(Self::open(Self::default_path()?))
    }

    /// File backing the store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all runs; a missing file yields no runs
    ///
    /// A run's number is taken from its table key.
    pub fn load(&self) -> Result<BTreeMap<u32, Run>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No saved runs");
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&self.path)?;
        let tables: BTreeMap<String, Run> = toml::from_str(&text).map_err(|e| MxdcError::Parse {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut runs = BTreeMap::new();
        for (key, mut run) in tables {
            let number: u32 = key.trim().parse().map_err(|_| MxdcError::Parse {
                path: self.path.clone(),
                reason: format!("'{key}' is not a run number"),
            })?;
            run.number = number;
            runs.insert(number, run);
        }
        debug!(path = %self.path.display(), count = runs.len(), "Loaded runs");
        Ok(runs)
    }

    /// Replace the stored runs
    pub fn save(&self, runs: &BTreeMap<u32, Run>) -> Result<()> {
        let tables: BTreeMap<String, &Run> =
            runs.iter().map(|(n, run)| (n.to_string(), run)).collect();
        let text = toml::to_string_pretty(&tables)
            .map_err(|e| MxdcError::RunStore(format!("cannot serialize runs: {e}")))?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Validate `run`, insert or replace it and write the store
    pub fn apply(&self, run: Run) -> Result<BTreeMap<u32, Run>> {
        run.validate()?;
        let mut runs = self.load()?;
        info!(run = run.number, prefix = %run.prefix, "Applying run");
        runs.insert(run.number, run);
        self.save(&runs)?;
        Ok(runs)
    }

    /// Delete a run; returns whether it existed
    pub fn remove(&self, number: u32) -> Result<bool> {
        let mut runs = self.load()?;
        let existed = runs.remove(&number).is_some();
        if existed {
            self.save(&runs)?;
            info!(run = number, "Removed run");
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(number: u32, prefix: &str) -> Run {
        Run {
            number,
            prefix: prefix.to_string(),
            end_angle: 90.0,
            delta: 1.0,
            ..Run::default()
        }
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join("nothing.toml"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn apply_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join(".mxdc").join(RUN_CONFIG_FILE));
        store.apply(run(2, "ins")).unwrap();
        store.apply(run(1, "lyso")).unwrap();
        store.apply(run(2, "thau")).unwrap();

        let runs = store.load().unwrap();
        assert_eq!(runs.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(runs[&2].prefix, "thau");
        assert_eq!(runs[&1], run(1, "lyso"));
    }

    #[test]
    fn apply_rejects_invalid_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.toml"));
        let mut bad = run(1, "lyso");
        bad.delta = -1.0;
        assert!(store.apply(bad).is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn remove_rewrites_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.toml"));
        store.apply(run(1, "a")).unwrap();
        store.apply(run(3, "b")).unwrap();
        assert!(store.remove(1).unwrap());
        assert!(!store.remove(1).unwrap());
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn key_sets_run_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.toml");
        fs::write(
            &path,
            r#"
[4]
prefix = "ins"
number = 9
end_angle = 45.0
delta = 1.0
energies = [12.66, 12.68]
energy_labels = ["peak", "infl"]
"#,
        )
        .unwrap();
        let runs = RunStore::open(&path).load().unwrap();
        let run = &runs[&4];
        assert_eq!(run.number, 4);
        assert_eq!(run.energy_labels, vec!["peak", "infl"]);
        // unspecified fields take their defaults
        assert_eq!(run.distance, 150.0);
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.toml");
        fs::write(&path, "[one]\nprefix = \"x\"\n").unwrap();
        let err = RunStore::open(&path).load().unwrap_err();
        assert!(matches!(err, MxdcError::Parse { .. }));
    }
}
