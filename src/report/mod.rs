//! Run statistics and formatted terminal output.
//!
//! Formatting lives here so the processing code only counts.

use std::collections::BTreeMap;
use std::path::Path;

use crate::pulse::ProcessOutcome;
use crate::template::BuildDiagnostics;

/// Per-detector tallies over an analysis run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorStats {
    pub processed: usize,
    /// Channels the peak gate skipped.
    pub skipped: usize,
    pub converged: usize,
    /// Single-pulse ladder accepted a fit.
    pub successful: usize,
    pub first_try: usize,
    pub escalated: usize,
    /// Summaries taken from a two-pulse fit.
    pub two_pulse: usize,
}

impl DetectorStats {
    fn merge(&mut self, other: &DetectorStats) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.converged += other.converged;
        self.successful += other.successful;
        self.first_try += other.first_try;
        self.escalated += other.escalated;
        self.two_pulse += other.two_pulse;
    }
}

/// Totals of an analysis run, keyed by detector name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub events: usize,
    pub first_entry: Option<u64>,
    pub last_entry: Option<u64>,
    pub detectors: BTreeMap<String, DetectorStats>,
}

impl RunStats {
    pub fn record_event(&mut self, entry: u64) {
        self.events += 1;
        self.first_entry.get_or_insert(entry);
        self.last_entry = Some(entry);
    }

    pub fn record_outcome(&mut self, detector: &str, outcome: &ProcessOutcome) {
        let s = self.detectors.entry(detector.to_string()).or_default();
        let summary = &outcome.summary;
        s.processed += 1;
        s.converged += usize::from(summary.fit_converged);
        s.successful += usize::from(summary.successful_fit);
        s.first_try += usize::from(summary.first_try());
        s.escalated += usize::from(outcome.escalated);
        s.two_pulse += usize::from(summary.n_pulses == 2);
    }

    pub fn record_skip(&mut self, detector: &str) {
        self.detectors.entry(detector.to_string()).or_default().skipped += 1;
    }

    pub fn totals(&self) -> DetectorStats {
        let mut total = DetectorStats::default();
        for s in self.detectors.values() {
            total.merge(s);
        }
        total
    }
}

fn pct(n: usize, of: usize) -> f64 {
    if of == 0 { 0.0 } else { 100.0 * n as f64 / of as f64 }
}

/// Format the analysis summary table.
pub fn format_run_summary(stats: &RunStats, output: &Path) -> String {
    let mut out = String::new();

    out.push_str("=== pulsefit - analysis ===\n");
    match (stats.first_entry, stats.last_entry) {
        (Some(first), Some(last)) => {
            out.push_str(&format!("Events: n={} | entries=[{first}, {last}]\n", stats.events));
        }
        _ => out.push_str("Events: n=0\n"),
    }
    out.push_str(&format!("Summary: {}\n\n", output.display()));

    out.push_str(
        format!(
            "{:<16} {:>9} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8}\n",
            "detector", "processed", "skipped", "converged", "successful", "first_try", "escalated", "2-pulse"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:-<16} {:-<9} {:-<8} {:-<10} {:-<10} {:-<10} {:-<10} {:-<8}\n",
            "", "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    let row = |name: &str, s: &DetectorStats| {
        format!(
            "{:<16} {:>9} {:>8} {:>9.1}% {:>9.1}% {:>9.1}% {:>10} {:>8}\n",
            name,
            s.processed,
            s.skipped,
            pct(s.converged, s.processed),
            pct(s.successful, s.processed),
            pct(s.first_try, s.processed),
            s.escalated,
            s.two_pulse
        )
    };
    for (name, s) in &stats.detectors {
        out.push_str(&row(name, s));
    }
    if stats.detectors.len() > 1 {
        out.push_str(&row("total", &stats.totals()));
    }

    out
}

/// Format the outcome of a template build.
pub fn format_build_summary(detector: &str, diagnostics: &BuildDiagnostics, output: &Path) -> String {
    let mut out = String::new();

    out.push_str("=== pulsefit - template build ===\n");
    out.push_str(&format!("Detector: {detector}\n"));
    out.push_str(&format!(
        "Traces: seen={} | used={} ({:.1}%)\n",
        diagnostics.traces_seen,
        diagnostics.traces_used,
        pct(diagnostics.traces_used, diagnostics.traces_seen)
    ));
    for (reason, n) in &diagnostics.rejected {
        out.push_str(&format!("  rejected {reason:?}: {n}\n"));
    }
    out.push_str(&format!("Amplitude axis: [0, {:.4}]\n", diagnostics.amplitude_range_max));
    if !diagnostics.low_count_offsets.is_empty() {
        out.push_str(&format!(
            "Low-count columns: {} (first at offset {:.3})\n",
            diagnostics.low_count_offsets.len(),
            diagnostics.low_count_offsets[0]
        ));
    }
    out.push_str(&format!("Template: {}\n", output.display()));

    out
}
