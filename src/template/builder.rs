//! Template construction from single-pulse calibration traces.
//!
//! Pipeline:
//!
//! 1. summarize every trace (peak, pseudo-time, baseline, integral) in parallel
//! 2. histogram the pseudo-times of the good traces and invert the empirical
//!    CDF into a pseudo-time -> real-time map
//! 3. realign every good trace by its real sub-sample phase and stack the
//!    normalized samples into a fine (offset, amplitude) histogram, the
//!    "fuzzy template"
//! 4. fit each offset column with a Gaussian inside ±3 RMS of its raw moments
//! 5. interpolate the per-column means and widths with cubic splines
//!
//! The arctangent pseudo-time is a biased phase estimator; mapping it through
//! its own CDF makes the phase uniform on `[0, 1]`, which is what a pulse
//! arriving at a random time relative to the sampling clock produces.

use std::collections::BTreeMap;
use std::f64::consts::FRAC_2_PI;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::domain::{Polarity, extreme_index};
use crate::error::AppError;
use crate::math::{BinAxis, CubicSpline, Histogram1D, Histogram2D, LinearInterpolant, fit_gaussian};
use crate::template::Template;

/// Fewest good traces we are willing to build a template from.
const MIN_GOOD_TRACES: usize = 10;
/// Fewest populated offset columns that still make a usable spline.
const MIN_TEMPLATE_KNOTS: usize = 4;
/// Bins in the normalized-amplitude histogram used to size the fuzzy template.
const AMPLITUDE_SURVEY_BINS: usize = 100;

/// Immutable calibration parameters for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateBuilderConfig {
    pub channel: usize,
    /// Samples covered by the template.
    pub template_length: usize,
    /// Samples before the peak included in the template.
    pub buffer_zone: usize,
    pub n_bins_pseudo_time: usize,
    /// Sub-sample bins per sample in the output template.
    pub n_time_bins: usize,
    pub baseline_fit_length: usize,
    /// Raw peak value a trace must reach (exceed downwards for negative polarity).
    pub min_peak: u16,
    pub polarity: Polarity,
    pub amplitude_bins: usize,
    /// Offset columns with fewer entries are reported as low-count.
    pub min_bin_entries: usize,
}

impl TemplateBuilderConfig {
    /// Offset domain covered by the output template.
    pub fn domain(&self) -> (f64, f64) {
        let buffer = self.buffer_zone as f64;
        (-0.5 - buffer, self.template_length as f64 - 0.5 - buffer)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.template_length < 2 {
            return Err(AppError::config("templateLength must be at least 2"));
        }
        if self.buffer_zone >= self.template_length {
            return Err(AppError::config(format!(
                "templateBuffer ({}) must be smaller than templateLength ({})",
                self.buffer_zone, self.template_length
            )));
        }
        if self.n_bins_pseudo_time == 0 || self.n_time_bins == 0 {
            return Err(AppError::config("nBinsPseudoTime and nTimeBins must be positive"));
        }
        if self.baseline_fit_length == 0 {
            return Err(AppError::config("baselineFitLength must be positive"));
        }
        if self.amplitude_bins < 10 {
            return Err(AppError::config("amplitudeBins must be at least 10"));
        }
        Ok(())
    }
}

/// Why a calibration trace was left out of the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    /// The extreme sample has no neighbour on one side.
    PeakAtEdge,
    BelowMinimumPeak,
    /// The baseline window would start before the trace.
    BaselineOffStart,
    /// The normalization window would run past the trace end.
    NormalizationOffEnd,
    ZeroIntegral,
}

/// Per-trace intermediate record.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSummary {
    pub peak_index: usize,
    pub pseudo_time: f64,
    pub baseline: f64,
    pub integral: f64,
    pub normalized_ampl: f64,
    pub bad: Option<RejectReason>,
}

impl TraceSummary {
    fn rejected(peak_index: usize, pseudo_time: f64, reason: RejectReason) -> Self {
        Self {
            peak_index,
            pseudo_time,
            baseline: 0.0,
            integral: 0.0,
            normalized_ampl: 0.0,
            bad: Some(reason),
        }
    }

    pub fn is_bad(&self) -> bool {
        self.bad.is_some()
    }
}

/// Arctangent phase estimate from the samples around the peak, in `[0, 1]`.
///
/// Equal peak and right-neighbour samples are defined as `1`.
pub fn pseudo_time(before: f64, peak: f64, after: f64) -> f64 {
    if peak == after {
        return 1.0;
    }
    let p = FRAC_2_PI * ((before - peak) / (after - peak)).atan();
    p.clamp(0.0, 1.0)
}

/// Steps 1-3: peak, pseudo-time, gates, baseline and normalization of one trace.
pub fn summarize_trace(trace: &[u16], config: &TemplateBuilderConfig) -> TraceSummary {
    let Some(peak) = extreme_index(trace, config.polarity) else {
        return TraceSummary::rejected(0, 0.0, RejectReason::PeakAtEdge);
    };
    if peak == 0 || peak + 1 >= trace.len() {
        return TraceSummary::rejected(peak, 0.0, RejectReason::PeakAtEdge);
    }

    let peak_value = trace[peak];
    let pseudo = pseudo_time(
        f64::from(trace[peak - 1]),
        f64::from(peak_value),
        f64::from(trace[peak + 1]),
    );

    let below_gate = match config.polarity {
        Polarity::Negative => peak_value > config.min_peak,
        Polarity::Positive => peak_value < config.min_peak,
    };
    if below_gate {
        return TraceSummary::rejected(peak, pseudo, RejectReason::BelowMinimumPeak);
    }

    let Some(window_start) = peak.checked_sub(config.buffer_zone) else {
        return TraceSummary::rejected(peak, pseudo, RejectReason::BaselineOffStart);
    };
    let Some(baseline_start) = window_start.checked_sub(config.baseline_fit_length) else {
        return TraceSummary::rejected(peak, pseudo, RejectReason::BaselineOffStart);
    };
    let baseline = trace[baseline_start..window_start]
        .iter()
        .map(|&v| f64::from(v))
        .sum::<f64>()
        / config.baseline_fit_length as f64;

    let window_end = window_start + config.template_length;
    if window_end > trace.len() {
        return TraceSummary::rejected(peak, pseudo, RejectReason::NormalizationOffEnd);
    }
    let integral: f64 = trace[window_start..window_end]
        .iter()
        .map(|&v| f64::from(v) - baseline)
        .sum();
    if integral == 0.0 || !integral.is_finite() {
        return TraceSummary::rejected(peak, pseudo, RejectReason::ZeroIntegral);
    }

    TraceSummary {
        peak_index: peak,
        pseudo_time: pseudo,
        baseline,
        integral,
        normalized_ampl: (f64::from(peak_value) - baseline) / integral,
        bad: None,
    }
}

/// Build statistics worth keeping next to the template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildDiagnostics {
    pub traces_seen: usize,
    pub traces_used: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    /// Offsets of template columns with fewer than `min_bin_entries` entries.
    pub low_count_offsets: Vec<f64>,
    /// Upper edge of the amplitude axis of the fuzzy template.
    pub amplitude_range_max: f64,
}

/// Everything produced by a template build.
#[derive(Debug, Clone)]
pub struct TemplateBuild {
    pub template: Template,
    pub real_time: LinearInterpolant,
    pub diagnostics: BuildDiagnostics,
}

/// Build a template from single-pulse calibration traces.
pub fn build_template<T>(traces: &[T], config: &TemplateBuilderConfig) -> Result<TemplateBuild, AppError>
where
    T: AsRef<[u16]> + Sync,
{
    config.validate()?;

    let summaries: Vec<TraceSummary> = traces
        .par_iter()
        .map(|t| summarize_trace(t.as_ref(), config))
        .collect();

    let mut diagnostics = BuildDiagnostics {
        traces_seen: traces.len(),
        ..Default::default()
    };
    for (index, s) in summaries.iter().enumerate() {
        if let Some(reason) = s.bad {
            tracing::debug!(index, peak = s.peak_index, ?reason, "calibration trace rejected");
            *diagnostics.rejected.entry(reason).or_default() += 1;
        }
    }

    let good: Vec<(&[u16], &TraceSummary)> = traces
        .iter()
        .map(AsRef::as_ref)
        .zip(&summaries)
        .filter(|(_, s)| !s.is_bad())
        .collect();
    diagnostics.traces_used = good.len();
    tracing::info!(
        channel = config.channel,
        seen = diagnostics.traces_seen,
        used = diagnostics.traces_used,
        rejected = ?diagnostics.rejected,
        "summarized calibration traces"
    );
    if good.len() < MIN_GOOD_TRACES {
        return Err(AppError::InsufficientData(format!(
            "{} good calibration traces, need at least {MIN_GOOD_TRACES}",
            good.len()
        )));
    }

    let real_time = real_time_map(good.iter().map(|(_, s)| s.pseudo_time), config.n_bins_pseudo_time)?;

    let amplitudes: Vec<f64> = good.iter().map(|(_, s)| s.normalized_ampl).collect();
    let range_max = amplitude_range_max(&amplitudes)?;
    diagnostics.amplitude_range_max = range_max;

    let fuzzy = fill_fuzzy_template(&good, &real_time, range_max, config);
    let (template, low_count_offsets) = extract_template(&fuzzy, config)?;
    diagnostics.low_count_offsets = low_count_offsets;

    Ok(TemplateBuild {
        template,
        real_time,
        diagnostics,
    })
}

/// Empirical CDF of the pseudo-times as a monotone map onto `[0, 1]`.
pub fn real_time_map(
    pseudo_times: impl Iterator<Item = f64>,
    n_bins: usize,
) -> Result<LinearInterpolant, AppError> {
    let mut hist = Histogram1D::new(BinAxis::new(0.0, 1.0, n_bins));
    // `pseudo_time` returns exactly 1.0 for flat tops; keep those in the last bin.
    let top = 1.0 - f64::EPSILON;
    for p in pseudo_times {
        hist.fill(p.clamp(0.0, top), 1.0);
    }
    if hist.integral() <= 0.0 {
        return Err(AppError::InsufficientData("no pseudo-times to build the real-time map".into()));
    }
    hist.normalize();

    let axis = hist.axis();
    let mut x = Vec::with_capacity(n_bins + 1);
    let mut y = Vec::with_capacity(n_bins + 1);
    x.push(0.0);
    y.push(0.0);
    for (i, c) in hist.cumulative().into_iter().enumerate() {
        x.push(axis.low_edge(i + 1));
        y.push(c.min(1.0));
    }
    LinearInterpolant::new(x, y)
}

/// Upper amplitude edge for the fuzzy template: Gaussian mean + 5σ of the peak amplitudes.
fn amplitude_range_max(amplitudes: &[f64]) -> Result<f64, AppError> {
    let hist = Histogram1D::auto_range(amplitudes, AMPLITUDE_SURVEY_BINS)
        .ok_or_else(|| AppError::InsufficientData("no finite peak amplitudes".into()))?;
    let axis = hist.axis();
    let fitted = fit_gaussian(&hist, axis.lo, axis.hi).map(|g| g.mean + 5.0 * g.sigma);
    let largest = amplitudes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    // Never cut into the observed peaks, whatever the fit says.
    let range_max = match fitted {
        Some(v) if v.is_finite() && v > 0.0 => v.max(largest * 1.05),
        _ => largest * 1.05,
    };
    if !(range_max.is_finite() && range_max > 0.0) {
        return Err(AppError::Numerical(format!(
            "normalized peak amplitudes give an unusable range ({range_max})"
        )));
    }
    Ok(range_max)
}

fn fill_fuzzy_template(
    good: &[(&[u16], &TraceSummary)],
    real_time: &LinearInterpolant,
    range_max: f64,
    config: &TemplateBuilderConfig,
) -> Histogram2D {
    let (lo, hi) = config.domain();
    let x_axis = BinAxis::new(lo, hi, config.template_length * config.n_time_bins);
    let y_axis = BinAxis::new(-0.2 * range_max, range_max, config.amplitude_bins);
    let mut fuzzy = Histogram2D::new(x_axis, y_axis);

    let buffer = config.buffer_zone as f64;
    for (trace, summary) in good {
        let phase = real_time.eval(summary.pseudo_time).clamp(0.0, 1.0);
        let start = summary.peak_index - config.buffer_zone;
        for (j, &raw) in trace[start..start + config.template_length].iter().enumerate() {
            let offset = j as f64 - phase + 0.5 - buffer;
            let value = (f64::from(raw) - summary.baseline) / summary.integral;
            fuzzy.fill(offset, value);
        }
    }
    fuzzy
}

/// Steps 6-7: robust (mean, sigma) per offset column, then splines.
fn extract_template(
    fuzzy: &Histogram2D,
    config: &TemplateBuilderConfig,
) -> Result<(Template, Vec<f64>), AppError> {
    let x_axis = fuzzy.x_axis();
    let mut xs = Vec::with_capacity(x_axis.n_bins);
    let mut means = Vec::with_capacity(x_axis.n_bins);
    let mut sigmas = Vec::with_capacity(x_axis.n_bins);
    let mut low_count = Vec::new();

    for bin in 0..x_axis.n_bins {
        let offset = x_axis.center(bin);
        let entries = fuzzy.column_entries(bin);
        if entries < config.min_bin_entries as f64 {
            tracing::warn!(offset, entries, "template bin below minimum entry count");
            low_count.push(offset);
        }
        let column = fuzzy.projection_y(bin);
        let (Some(raw_mean), Some(raw_rms)) = (column.mean(), column.rms()) else {
            continue;
        };

        let spread = raw_rms.max(column.axis().width());
        let fitted = if entries >= config.min_bin_entries as f64 {
            fit_gaussian(&column, raw_mean - 3.0 * spread, raw_mean + 3.0 * spread)
        } else {
            None
        };
        let (mean, sigma) = match fitted {
            Some(g) if (g.mean - raw_mean).abs() <= 3.0 * spread => (g.mean, g.sigma),
            // A single populated amplitude bin: quantization width.
            _ if raw_rms == 0.0 => (raw_mean, column.axis().width() / 12f64.sqrt()),
            _ => (raw_mean, raw_rms),
        };
        xs.push(offset);
        means.push(mean);
        sigmas.push(sigma);
    }

    if !low_count.is_empty() {
        tracing::warn!(
            bins = low_count.len(),
            min_entries = config.min_bin_entries,
            "template has low-count bins"
        );
    }
    if xs.len() < MIN_TEMPLATE_KNOTS {
        return Err(AppError::InsufficientData(format!(
            "only {} populated template bins",
            xs.len()
        )));
    }

    let (lo, hi) = config.domain();
    let template = Template::new(
        lo,
        hi,
        CubicSpline::new(xs.clone(), means)?,
        CubicSpline::new(xs, sigmas)?,
    )?;
    Ok((template, low_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{CalibrationSpec, PulseShape, calibration_traces};
    use assert_approx_eq::assert_approx_eq;

    fn config() -> TemplateBuilderConfig {
        TemplateBuilderConfig {
            channel: 0,
            template_length: 20,
            buffer_zone: 8,
            n_bins_pseudo_time: 100,
            n_time_bins: 10,
            baseline_fit_length: 20,
            min_peak: 600,
            polarity: Polarity::Positive,
            amplitude_bins: 1000,
            min_bin_entries: 10,
        }
    }

    #[test]
    fn pseudo_time_special_cases() {
        assert_eq!(pseudo_time(5.0, 10.0, 10.0), 1.0);
        assert_approx_eq!(pseudo_time(5.0, 10.0, 5.0), 0.5);
        assert_eq!(pseudo_time(10.0, 10.0, 5.0), 0.0);
        // Negative pulses give the same ratio.
        assert_approx_eq!(pseudo_time(15.0, 10.0, 15.0), 0.5);
    }

    #[test]
    fn summary_of_clean_trace() {
        let mut trace = vec![100u16; 64];
        trace[40] = 300;
        trace[41] = 500;
        trace[42] = 300;
        let mut cfg = config();
        cfg.min_peak = 400;
        let s = summarize_trace(&trace, &cfg);
        assert!(!s.is_bad());
        assert_eq!(s.peak_index, 41);
        assert_approx_eq!(s.baseline, 100.0);
        assert_approx_eq!(s.integral, 800.0);
        assert_approx_eq!(s.normalized_ampl, 0.5);
        assert_approx_eq!(s.pseudo_time, 0.5);
    }

    #[test]
    fn peak_too_close_to_start_is_rejected() {
        let cfg = config();
        let mut trace = vec![100u16; 128];
        // Needs baseline_fit_length + buffer_zone = 28 samples before the peak.
        trace[27] = 1000;
        let s = summarize_trace(&trace, &cfg);
        assert_eq!(s.bad, Some(RejectReason::BaselineOffStart));

        trace[27] = 100;
        trace[28] = 1000;
        assert!(!summarize_trace(&trace, &cfg).is_bad());
    }

    #[test]
    fn other_gates_reject() {
        let cfg = config();
        let mut trace = vec![100u16; 128];
        trace[60] = 500;
        assert_eq!(summarize_trace(&trace, &cfg).bad, Some(RejectReason::BelowMinimumPeak));

        let mut trace = vec![100u16; 128];
        trace[120] = 1000;
        assert_eq!(summarize_trace(&trace, &cfg).bad, Some(RejectReason::NormalizationOffEnd));

        let mut trace = vec![100u16; 128];
        trace[127] = 1000;
        assert_eq!(summarize_trace(&trace, &cfg).bad, Some(RejectReason::PeakAtEdge));
    }

    #[test]
    fn negative_polarity_summary() {
        let mut cfg = config();
        cfg.polarity = Polarity::Negative;
        cfg.min_peak = 3200;
        let mut trace = vec![3500u16; 64];
        trace[40] = 3300;
        trace[41] = 3100;
        trace[42] = 3300;
        let s = summarize_trace(&trace, &cfg);
        assert!(!s.is_bad());
        assert_eq!(s.peak_index, 41);
        assert_approx_eq!(s.integral, -800.0);
        assert_approx_eq!(s.normalized_ampl, 0.5);
    }

    #[test]
    fn real_time_map_flattens_biased_estimator() {
        // Pseudo-times crowded towards 0 still map onto a uniform phase.
        let pseudo: Vec<f64> = (0..10_000).map(|i| (i as f64 / 10_000.0).powi(2)).collect();
        let map = real_time_map(pseudo.into_iter(), 200).unwrap();
        assert_approx_eq!(map.eval(0.0), 0.0);
        assert_approx_eq!(map.eval(1.0), 1.0);
        assert!((map.eval(0.25) - 0.5).abs() < 0.01);
        assert!((map.eval(0.64) - 0.8).abs() < 0.01);
    }

    #[test]
    fn recovers_known_pulse_shape() {
        let cfg = config();
        let shape = PulseShape::Gaussian { sigma: 1.5 };
        let spec = CalibrationSpec {
            n_traces: 4000,
            trace_length: 128,
            baseline: 200.0,
            amplitude: 1000.0,
            noise_sigma: 5.0,
            peak_position: 60.0,
            polarity: Polarity::Positive,
        };
        let traces = calibration_traces(&shape, &spec, 2024).unwrap();
        // One trace starts too early to have a baseline window.
        let mut traces = traces;
        traces.push({
            let mut t = vec![200u16; 128];
            t[10] = 1200;
            t
        });

        let build = build_template(&traces, &cfg).unwrap();
        assert_eq!(build.diagnostics.traces_seen, 4001);
        assert_eq!(build.diagnostics.traces_used, 4000);
        assert_eq!(build.diagnostics.rejected.get(&RejectReason::BaselineOffStart), Some(&1));
        assert!(build.diagnostics.low_count_offsets.is_empty());

        let tpl = &build.template;
        assert_eq!(tpl.domain(), (-8.5, 11.5));
        let norm = shape.area();
        for k in -30..=30 {
            let t = k as f64 * 0.1;
            let truth = shape.eval(t) / norm;
            assert!(
                (tpl.mean(t) - truth).abs() < 0.01 * shape.eval(0.0) / norm,
                "t={t}: {} vs {truth}",
                tpl.mean(t)
            );
        }

        // Far from the pulse the spread is pure noise (plus baseline error).
        let noise = spec.noise_sigma / (spec.amplitude * norm);
        for &t in &[-7.0, -6.0, 9.0, 10.0] {
            let ratio = tpl.sigma(t) / noise;
            assert!((0.6..1.6).contains(&ratio), "t={t}: ratio {ratio}");
        }
    }

    #[test]
    fn too_few_good_traces_is_an_error() {
        let traces = vec![vec![100u16; 64]; 5];
        assert!(matches!(
            build_template(&traces, &config()),
            Err(AppError::InsufficientData(_))
        ));
    }
}
