//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the real main:
//! - installs the log subscriber
//! - parses CLI arguments
//! - runs the requested subcommand and prints its report

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{AnalyzeArgs, BuildTemplateArgs, Cli, Command, ShapeKind, SimulateArgs};
use crate::config::{RunConfig, TemplateConfigFile};
use crate::data::{PulseShape, SimulationSpec, simulate_events};
use crate::error::AppError;
use crate::io::{CsvSummaryWriter, EventReader, write_events, write_template_json};

pub mod pipeline;

/// Entry point for the `pulsefit` binary.
pub fn run() -> Result<(), AppError> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::BuildTemplate(args) => handle_build_template(args),
        Command::Analyze(args) => handle_analyze(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

/// Logs go to stderr so stdout only carries reports. `RUST_LOG` overrides `info`.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignored when a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_build_template(args: BuildTemplateArgs) -> Result<(), AppError> {
    let run = RunConfig::load(&args.config)?;
    let template_config = TemplateConfigFile::load(&args.template_config)?;

    let built = pipeline::build_detector_template(&run, &template_config, &args.detector, &args.events)?;

    let out = match args.out {
        Some(path) => path,
        None => run
            .detector(&args.detector)
            .map(|(_, det)| det.template_path.clone())
            .ok_or_else(|| AppError::config(format!("detector '{}' disappeared", args.detector)))?,
    };
    write_template_json(&out, &built.file)?;
    tracing::info!(detector = %args.detector, path = %out.display(), "template written");

    println!(
        "{}",
        crate::report::format_build_summary(&args.detector, &built.build.diagnostics, &out)
    );
    Ok(())
}

fn handle_analyze(args: AnalyzeArgs) -> Result<(), AppError> {
    let run = RunConfig::load(&args.config)?;
    let processors = pipeline::load_processors(&run)?;
    tracing::info!(
        detectors = run.detectors().count(),
        start_entry = run.start_entry,
        "templates loaded"
    );

    let reader = EventReader::open(&args.events)?.starting_at(run.start_entry);
    let mut sink = CsvSummaryWriter::create(&args.out)?;
    let stats = match args.max_events {
        Some(n) => pipeline::analyze_events(&processors, reader.take(n), &mut sink)?,
        None => pipeline::analyze_events(&processors, reader, &mut sink)?,
    };

    println!("{}", crate::report::format_run_summary(&stats, &args.out));
    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<(), AppError> {
    let shape = match args.shape {
        ShapeKind::Gaussian => PulseShape::Gaussian { sigma: args.rise },
        ShapeKind::Split => PulseShape::SplitGaussian {
            rise: args.rise,
            fall: args.fall,
        },
    };
    let spec = SimulationSpec {
        n_events: args.events,
        start_entry: args.start_entry,
        branch_name: args.branch,
        channels: args.channels,
        trace_length: args.trace_length,
        baseline: args.baseline,
        amplitude_min: args.amplitude_min,
        amplitude_max: args.amplitude_max,
        noise_sigma: args.noise,
        peak_position: args.peak_position,
        pileup_probability: args.pileup,
        polarity: args.polarity,
        clock_period: args.clock_period,
    };

    let events = simulate_events(&shape, &spec, args.seed)?;
    let n = write_events(&args.out, events.iter().map(|(record, _)| record))?;
    tracing::info!(events = n, path = %args.out.display(), seed = args.seed, "synthetic events written");
    Ok(())
}
