//! CLI Entry Point for mxdc
//!
//! Drives the acquisition engines against a simulated beamline:
//! - `runs`: expand the stored run definitions and print the frame list
//! - `collect`: collect the stored runs (Ctrl-C stops after the current frame)
//! - `scan mad|exafs|xrf`: energy scans, optionally analysed with CHOOCH
//!
//! # Usage
//!
//! ```bash
//! mxdc runs --json
//! mxdc collect --config config/beamline.toml
//! mxdc scan mad --edge Se-K --energy 12.658 --output /tmp/scans --chooch
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mxdc::config::BeamlineConfig;
use mxdc::events::{CollectEvent, Outcome, ScanEvent};
use mxdc::hardware::Beamline;
use mxdc::run_store::RunStore;
use mxdc::scan::{excitation_scan, AutoChooch, ScanHandle, ScanPlan, Scanner};
use mxdc::{logging, Collector, Run, RunList};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mxdc")]
#[command(about = "Beamline acquisition sequencer (simulated hardware)", long_about = None)]
struct Cli {
    /// Beamline configuration file
    #[arg(long, global = true, default_value = "config/beamline.toml")]
    config: PathBuf,

    /// Run definition store (defaults to ~/.mxdc/run_config.toml)
    #[arg(long, global = true)]
    runs: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand the stored runs and print the frame list
    Runs {
        /// Print frames as JSON
        #[arg(long)]
        json: bool,
    },

    /// Collect the stored runs
    Collect {
        /// Expose frames even if their image file already exists, overriding
        /// `collector.skip_collected`
        #[arg(long)]
        recollect: bool,
    },

    /// Energy scans
    Scan {
        #[command(subcommand)]
        kind: ScanKind,
    },
}

#[derive(Subcommand)]
enum ScanKind {
    /// MAD edge scan around an absorption edge
    Mad {
        /// Edge as ELEMENT-EDGE
        #[arg(long, default_value = "Se-K")]
        edge: String,
        /// Edge energy in keV
        #[arg(long, default_value_t = 12.658)]
        energy: f64,
        /// Count time per point in seconds (defaults to the configured time)
        #[arg(long)]
        time: Option<f64>,
        /// Output directory
        #[arg(long, default_value = ".")]
        output: PathBuf,
        /// Analyse the scan with CHOOCH afterwards
        #[arg(long)]
        chooch: bool,
    },
    /// EXAFS scan out to a maximum wavenumber
    Exafs {
        #[arg(long, default_value = "Se-K")]
        edge: String,
        #[arg(long, default_value_t = 12.658)]
        energy: f64,
        /// Maximum k in inverse Angstroms
        #[arg(long, default_value_t = 12.0)]
        kmax: f64,
        #[arg(long)]
        time: Option<f64>,
        #[arg(long, default_value = ".")]
        output: PathBuf,
    },
    /// Fluorescence excitation spectrum at a single energy
    Xrf {
        /// Excitation energy in keV
        #[arg(long, default_value_t = 13.0)]
        energy: f64,
        #[arg(long, default_value_t = 1.0)]
        time: f64,
        #[arg(long, default_value = ".")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = BeamlineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let store = match &cli.runs {
        Some(path) => RunStore::open(path),
        None => RunStore::open_default()?,
    };

    match cli.command {
        Commands::Runs { json } => print_runs(&store, json),
        Commands::Collect { recollect } => {
            let skip_collected = config.collector.skips_saved_frames(recollect);
            collect(&config, &store, skip_collected).await
        }
        Commands::Scan { kind } => scan(&config, kind).await,
    }
}

fn load_run_list(store: &RunStore) -> Result<RunList> {
    let runs = store.load()?;
    let run_list = if runs.is_empty() {
        warn!(path = %store.path().display(), "No stored runs, using a default run");
        RunList::expand([&Run::default()])?
    } else {
        RunList::expand(runs.values())?
    };
    Ok(run_list)
}

fn print_runs(store: &RunStore, json: bool) -> Result<()> {
    let run_list = load_run_list(store)?;
    if json {
        println!("{}", serde_json::to_string_pretty(run_list.frames())?);
        return Ok(());
    }
    for frame in &run_list {
        println!(
            "{:>5} {:<28} {:>9.2} {:>6.2} {:>8.4} {}",
            frame.index,
            frame.frame_name,
            frame.start_angle,
            frame.delta,
            frame.energy,
            if frame.saved { "saved" } else { "" }
        );
    }
    println!("{} frames", run_list.len());
    Ok(())
}

async fn collect(config: &BeamlineConfig, store: &RunStore, skip_collected: bool) -> Result<()> {
    let beamline = Arc::new(Beamline::simulated(config)?);
    let mut run_list = load_run_list(store)?;
    let existing = run_list.mark_existing();
    info!(frames = run_list.len(), existing, "Run list ready");

    let collector = Collector::new(beamline, config.collector.clone());
    let mut handle = collector.start(run_list, skip_collected)?;
    let control = handle.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current frame");
            let _ = control.stop();
        }
    });

    while let Some(event) = handle.events().recv().await {
        match event {
            CollectEvent::NewImage { file_name, .. } => println!("{file_name}"),
            CollectEvent::BeamLost { current } => println!("beam lost ({current:.1} mA), paused"),
            CollectEvent::Error(message) => eprintln!("error: {message}"),
            _ => {}
        }
    }

    let report = handle.join().await?;
    println!(
        "{:?}: {} collected, {} skipped, {:.0}% complete",
        report.outcome,
        report.collected,
        report.skipped,
        report.run_list.progress() * 100.0
    );
    if let Outcome::Failed(message) = report.outcome {
        anyhow::bail!(message);
    }
    Ok(())
}

async fn scan(config: &BeamlineConfig, kind: ScanKind) -> Result<()> {
    let beamline = Arc::new(Beamline::simulated(config)?);
    let scanner = Scanner::new(beamline.clone(), config.scan.clone());
    let default_time = config.scan.count_time;

    match kind {
        ScanKind::Mad {
            edge,
            energy,
            time,
            output,
            chooch,
        } => {
            let name = format!("{}_mad", edge.replace('-', "_"));
            let plan = ScanPlan::mad(&beamline, energy, time.unwrap_or(default_time))
                .with_output(output.join(format!("{name}.raw")));
            let report = run_scan(&scanner, plan).await?;
            if chooch && report.outcome == Outcome::Completed {
                let analysis = AutoChooch::new(&config.scan.chooch_command, &output, name, &edge)?;
                let results = analysis.run(&report.points).await?;
                for choice in &results.choices {
                    println!(
                        "{:<5} {:>9.5} keV  f'' {:>6.2}  f' {:>6.2}",
                        choice.label, choice.energy, choice.fpp, choice.fp
                    );
                }
            }
        }
        ScanKind::Exafs {
            edge,
            energy,
            kmax,
            time,
            output,
        } => {
            let name = format!("{}_exafs", edge.replace('-', "_"));
            let plan = ScanPlan::exafs(&beamline, energy, kmax, time.unwrap_or(default_time))
                .with_output(output.join(format!("{name}.raw")));
            run_scan(&scanner, plan).await?;
        }
        ScanKind::Xrf {
            energy,
            time,
            output,
        } => {
            let path = output.join(format!("xrf_{energy:.3}.raw"));
            let spectrum = excitation_scan(&beamline, energy, time, Some(Path::new(&path))).await?;
            println!("{} channels written to {}", spectrum.counts.len(), path.display());
        }
    }
    Ok(())
}

async fn run_scan(scanner: &Scanner, plan: ScanPlan) -> Result<mxdc::scan::ScanReport> {
    let mut handle: ScanHandle = scanner.start(plan)?;
    let control = handle.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping scan");
            let _ = control.stop();
        }
    });

    while let Some(event) = handle.events().recv().await {
        match event {
            ScanEvent::NewPoint { x, y, normalized } => {
                println!("{x:>12.5} {y:>12.1} {normalized:>12.1}")
            }
            ScanEvent::Error(message) => eprintln!("error: {message}"),
            _ => {}
        }
    }

    let report = handle.join().await?;
    match &report.output {
        Some(path) => println!(
            "{:?}: {} points written to {}",
            report.outcome,
            report.points.len(),
            path.display()
        ),
        None => println!("{:?}: {} points", report.outcome, report.points.len()),
    }
    if let Outcome::Failed(message) = &report.outcome {
        anyhow::bail!(message.clone());
    }
    Ok(report)
}
