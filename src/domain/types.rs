//! Shared domain types.
//!
//! These types are intentionally kept small so they can be:
//!
//! - borrowed per event without copying sample buffers (`RawTrace`)
//! - resolved once from configuration and then shared read-only (`FitConfiguration`)
//! - produced fresh per fit / per event (`FitResult`, `PulseSummary`)

use clap::ValueEnum;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Direction in which pulses move away from the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
}

impl Polarity {
    pub fn from_negative_flag(negative: bool) -> Self {
        if negative {
            Self::Negative
        } else {
            Self::Positive
        }
    }

    /// `+1.0` for positive pulses, `-1.0` for negative pulses.
    pub fn sign(self) -> f64 {
        match self {
            Self::Positive => 1.0,
            Self::Negative => -1.0,
        }
    }

    /// True when `candidate` lies strictly further in the pulse direction than `current`.
    pub fn is_more_extreme<T: PartialOrd>(self, candidate: T, current: T) -> bool {
        match self {
            Self::Positive => candidate > current,
            Self::Negative => candidate < current,
        }
    }

    /// True when a fitted scale points in the pulse direction.
    pub fn matches_scale(self, scale: f64) -> bool {
        match self {
            Self::Positive => scale > 0.0,
            Self::Negative => scale < 0.0,
        }
    }
}

/// Index of the first most-extreme value in `values`.
///
/// Ties resolve to the earliest index. Returns `None` for an empty slice.
pub fn extreme_index<T: PartialOrd + Copy>(values: &[T], polarity: Polarity) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, current)) if !polarity.is_more_extreme(v, current) => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// One digitized trace for one channel in one event.
///
/// The samples are borrowed from the raw-trace source, which owns them for
/// the duration of the event.
#[derive(Debug, Clone, Copy)]
pub struct RawTrace<'a> {
    samples: &'a [u16],
    device_clock: u64,
}

impl<'a> RawTrace<'a> {
    pub fn new(samples: &'a [u16], device_clock: u64) -> Self {
        Self {
            samples,
            device_clock,
        }
    }

    pub fn samples(&self) -> &'a [u16] {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn device_clock(&self) -> u64 {
        self.device_clock
    }
}

/// Resolved per-channel fit settings.
///
/// Built by the configuration loader after default inheritance and
/// validation; read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FitConfiguration {
    pub name: String,
    pub channel: usize,
    /// Samples before the peak that the template covers.
    pub template_buffer: usize,
    /// Number of samples covered by the template.
    pub template_length: usize,
    /// Number of samples handed to the fitter.
    pub fit_length: usize,
    /// Expected position of the peak sample inside the fit window.
    pub peak_index: usize,
    /// Largest accepted |fitted time - peak_index| (exclusive).
    pub wiggle_room: u32,
    pub polarity: Polarity,
    /// Carried for display front-ends; has no effect on fitting.
    pub draw: bool,
}

/// Numerical controls for the template fitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FitterTuning {
    pub max_iterations: usize,
    /// Stop once the time step falls below this many samples.
    pub tolerance: f64,
    /// Largest time step (samples) taken in a single iteration.
    pub max_step: f64,
}

impl Default for FitterTuning {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            max_step: 1.0,
        }
    }
}

/// Chi-square thresholds driving the two-pulse escalation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EscalationTuning {
    /// One-pulse chi2 above which a two-pulse fit is attempted.
    pub chi2_threshold: f64,
    /// Two-pulse chi2 above which the offset-pair ladder is walked.
    pub two_pulse_chi2_threshold: f64,
}

impl Default for EscalationTuning {
    fn default() -> Self {
        Self {
            chi2_threshold: 500.0,
            two_pulse_chi2_threshold: 1000.0,
        }
    }
}

/// Plausible raw value range for the peak sample (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeakGate {
    pub min: u16,
    pub max: u16,
}

impl Default for PeakGate {
    fn default() -> Self {
        // 12-bit digitizer rails are treated as saturated.
        Self { min: 1, max: 4094 }
    }
}

impl PeakGate {
    pub fn contains(&self, value: u16) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Engine tuning shared by every channel of a run.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tuning {
    pub fitter: FitterTuning,
    pub escalation: EscalationTuning,
    pub peak_gate: PeakGate,
}

/// Output of one template fit with `N` pulses.
///
/// Covariance indices follow `[time_0..time_{N-1}, scale_0..scale_{N-1}, pedestal]`.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub times: Vec<f64>,
    pub scales: Vec<f64>,
    pub pedestal: f64,
    pub covariance: DMatrix<f64>,
    pub chi2: f64,
    pub converged: bool,
}

impl FitResult {
    /// Result reported when no linear sub-solve succeeded at all.
    pub fn failed(times: &[f64]) -> Self {
        let n = times.len();
        Self {
            times: times.to_vec(),
            scales: vec![0.0; n],
            pedestal: 0.0,
            covariance: DMatrix::zeros(2 * n + 1, 2 * n + 1),
            chi2: f64::INFINITY,
            converged: false,
        }
    }

    pub fn n_pulses(&self) -> usize {
        self.times.len()
    }

    pub fn time_error(&self, pulse: usize) -> f64 {
        self.covariance[(pulse, pulse)].max(0.0).sqrt()
    }

    pub fn scale_error(&self, pulse: usize) -> f64 {
        let i = self.n_pulses() + pulse;
        self.covariance[(i, i)].max(0.0).sqrt()
    }

    pub fn pedestal_error(&self) -> f64 {
        let i = 2 * self.n_pulses();
        self.covariance[(i, i)].max(0.0).sqrt()
    }
}

/// Final per-channel, per-event record handed to the summary sink.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseSummary {
    /// Leading pulse scale, polarity-corrected.
    pub energy: f64,
    /// Fitted pedestal.
    pub baseline: f64,
    /// Three-sample amplitude above the pedestal, polarity-corrected.
    pub three_sample_ampl: f64,
    /// Leading pulse time in samples from the start of the full trace.
    pub time: f64,
    pub three_sample_time: f64,
    pub chi2: f64,
    pub fit_converged: bool,
    /// The single-pulse ladder accepted one of its attempts.
    pub successful_fit: bool,
    /// Single-pulse attempts made (1 means the first try was accepted).
    pub attempts: usize,
    /// Pulses in the fit the summary was taken from.
    pub n_pulses: usize,
}

impl PulseSummary {
    /// The ladder accepted the fit at the configured peak index.
    pub fn first_try(&self) -> bool {
        self.successful_fit && self.attempts == 1
    }
}
