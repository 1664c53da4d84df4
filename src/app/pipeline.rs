//! Shared pipeline logic behind the subcommands.
//!
//! - template build: calibration events -> one channel's traces -> template file
//! - analysis: events -> per-detector processors -> summary sink + run stats
//!
//! The handlers in `app` only deal with paths and printing.

use std::path::Path;
use std::sync::Arc;

use crate::config::{DigitizerKind, ResolvedDetector, RunConfig, TemplateConfigFile};
use crate::domain::PulseSummary;
use crate::error::AppError;
use crate::io::{EventRecord, SummarySink, TemplateFile, TraceSource, read_channel_traces, read_template_json};
use crate::pulse::PulseProcessor;
use crate::report::RunStats;
use crate::template::{Template, TemplateBuild, TemplateBuilderConfig, build_template};

/// Output of a template build for one detector.
#[derive(Debug, Clone)]
pub struct BuiltTemplate {
    pub config: TemplateBuilderConfig,
    pub build: TemplateBuild,
    pub file: TemplateFile,
}

/// Build the template of `detector` from the calibration events in `events`.
pub fn build_detector_template(
    run: &RunConfig,
    template_config: &TemplateConfigFile,
    detector: &str,
    events: &Path,
) -> Result<BuiltTemplate, AppError> {
    let (digitizer, det) = run
        .detector(detector)
        .ok_or_else(|| AppError::config(format!("detector '{detector}' is not in the fit configuration")))?;
    let config = template_config.builder_config(&det.config)?;

    let traces = read_channel_traces(events, &digitizer.branch_name, config.channel, run.start_entry)?;
    tracing::info!(
        detector,
        branch = %digitizer.branch_name,
        channel = config.channel,
        traces = traces.len(),
        "calibration traces loaded"
    );

    let build = build_template(&traces, &config)?;
    let file = TemplateFile::from_build(detector, &config, &build);
    Ok(BuiltTemplate { config, build, file })
}

/// Load a detector's template, warning when it was built for another geometry.
pub fn load_template(detector: &ResolvedDetector) -> Result<Arc<Template>, AppError> {
    let file = read_template_json(&detector.template_path)?;
    let c = &detector.config;
    let p = &file.parameters;
    if p.template_buffer != c.template_buffer || p.template_length != c.template_length {
        tracing::warn!(
            detector = %c.name,
            file_buffer = p.template_buffer,
            file_length = p.template_length,
            config_buffer = c.template_buffer,
            config_length = c.template_length,
            "template was built with a different buffer/length"
        );
    }
    if p.polarity != c.polarity {
        tracing::warn!(detector = %c.name, "template was built for the opposite polarity");
    }
    Ok(Arc::new(file.template()?))
}

/// Processors for the detectors of one digitizer.
#[derive(Debug, Clone)]
pub struct DigitizerProcessors {
    pub branch_name: String,
    pub kind: DigitizerKind,
    pub processors: Vec<PulseProcessor>,
}

/// Load every template and set up one processor per configured detector.
pub fn load_processors(run: &RunConfig) -> Result<Vec<DigitizerProcessors>, AppError> {
    run.digitizers
        .iter()
        .map(|d| {
            let processors = d
                .detectors
                .iter()
                .map(|det| PulseProcessor::new(det.config.clone(), load_template(det)?, run.tuning))
                .collect::<Result<Vec<_>, AppError>>()?;
            Ok(DigitizerProcessors {
                branch_name: d.branch_name.clone(),
                kind: d.kind,
                processors,
            })
        })
        .collect()
}

/// Run every processor over every event, one summary row per detector per event.
///
/// A channel skipped by the peak gate still gets a row, with all fields zero.
pub fn analyze_events<I, S>(digitizers: &[DigitizerProcessors], events: I, sink: &mut S) -> Result<RunStats, AppError>
where
    I: IntoIterator<Item = Result<EventRecord, AppError>>,
    S: SummarySink + ?Sized,
{
    let mut stats = RunStats::default();

    for record in events {
        let record = record?;
        stats.record_event(record.entry);

        for digitizer in digitizers {
            let event = record.digitizers.get(&digitizer.branch_name).ok_or_else(|| {
                AppError::format(
                    "event",
                    format!("entry {} has no '{}' digitizer", record.entry, digitizer.branch_name),
                )
            })?;
            event.check_shape(digitizer.kind.channels(), digitizer.kind.trace_len())?;

            for processor in &digitizer.processors {
                let name = processor.config().name.as_str();
                let trace = event.trace(processor.config().channel).ok_or_else(|| {
                    AppError::format("event", format!("entry {} lacks the channel of '{name}'", record.entry))
                })?;

                match processor.process_detailed(trace)? {
                    Some(outcome) => {
                        stats.record_outcome(name, &outcome);
                        sink.write(record.entry, name, &outcome.summary)?;
                    }
                    None => {
                        stats.record_skip(name);
                        sink.write(record.entry, name, &PulseSummary::default())?;
                    }
                }
            }
        }

        if stats.events % 10_000 == 0 {
            tracing::info!(events = stats.events, entry = record.entry, "progress");
        }
    }

    sink.finish()?;

    let totals = stats.totals();
    tracing::info!(
        events = stats.events,
        processed = totals.processed,
        skipped = totals.skipped,
        converged = totals.converged,
        successful = totals.successful,
        escalated = totals.escalated,
        "analysis finished"
    );
    Ok(stats)
}
