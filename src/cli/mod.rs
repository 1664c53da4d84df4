//! Command-line parsing for the pulse template tools.
//!
//! Argument parsing stays separate from dispatch (`app`) and from the
//! processing code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::domain::Polarity;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "pulsefit", version, about = "Pulse template builder and waveform fitter")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Build a pulse template for one detector from single-pulse calibration events.
    BuildTemplate(BuildTemplateArgs),
    /// Fit every configured detector in every event and write a CSV summary.
    Analyze(AnalyzeArgs),
    /// Write seeded synthetic events (JSON lines).
    Simulate(SimulateArgs),
}

#[derive(Debug, Args, Clone)]
pub struct BuildTemplateArgs {
    /// Fit configuration (detector geometry, polarity, digitizer).
    #[arg(long, value_name = "JSON")]
    pub config: PathBuf,

    /// Template builder configuration (binning, gates).
    #[arg(long, value_name = "JSON")]
    pub template_config: PathBuf,

    /// Calibration events (JSON lines).
    #[arg(long, value_name = "JSONL")]
    pub events: PathBuf,

    /// Detector to build the template for.
    #[arg(long)]
    pub detector: String,

    /// Output template file; defaults to the detector's configured template path.
    #[arg(long, value_name = "JSON")]
    pub out: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct AnalyzeArgs {
    /// Fit configuration.
    #[arg(long, value_name = "JSON")]
    pub config: PathBuf,

    /// Events to analyze (JSON lines).
    #[arg(long, value_name = "JSONL")]
    pub events: PathBuf,

    /// Output summary CSV.
    #[arg(long, value_name = "CSV")]
    pub out: PathBuf,

    /// Stop after this many events.
    #[arg(long)]
    pub max_events: Option<usize>,
}

/// Analytic pulse shape used for synthetic traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ShapeKind {
    Gaussian,
    /// Different widths before and after the peak.
    Split,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Output events file (JSON lines).
    #[arg(long, value_name = "JSONL")]
    pub out: PathBuf,

    #[arg(short = 'n', long, default_value_t = 1000)]
    pub events: usize,

    /// Entry number of the first event.
    #[arg(long, default_value_t = 0)]
    pub start_entry: u64,

    #[arg(long, default_value = "caen_0")]
    pub branch: String,

    #[arg(long, default_value_t = 32)]
    pub channels: usize,

    #[arg(long, default_value_t = 1024)]
    pub trace_length: usize,

    #[arg(long, default_value_t = 200.0)]
    pub baseline: f64,

    #[arg(long, default_value_t = 500.0)]
    pub amplitude_min: f64,

    #[arg(long, default_value_t = 3000.0)]
    pub amplitude_max: f64,

    /// Gaussian noise sigma in ADC counts.
    #[arg(long, default_value_t = 2.0)]
    pub noise: f64,

    /// Nominal peak sample.
    #[arg(long, default_value_t = 400.0)]
    pub peak_position: f64,

    /// Probability of a second, later pulse per channel (0 for calibration data).
    #[arg(long, default_value_t = 0.0)]
    pub pileup: f64,

    /// Direction of the pulses relative to the baseline.
    #[arg(long, value_enum, default_value_t = Polarity::Positive)]
    pub polarity: Polarity,

    #[arg(long, value_enum, default_value_t = ShapeKind::Split)]
    pub shape: ShapeKind,

    /// Rise width (samples); the Gaussian shape uses it as sigma.
    #[arg(long, default_value_t = 1.2)]
    pub rise: f64,

    /// Fall width (samples) of the split shape.
    #[arg(long, default_value_t = 3.0)]
    pub fall: f64,

    /// Device clock ticks between events.
    #[arg(long, default_value_t = 1000)]
    pub clock_period: u64,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}
