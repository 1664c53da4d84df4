//! Per-channel, per-event pulse processing.
//!
//! Steps for one trace:
//!
//! 1. find the peak sample (polarity-aware) in the full trace
//! 2. skip the channel if the raw peak value is outside the plausible range
//! 3. cut the fit window, anchored `peak_index` samples before the peak;
//!    a peak too close to either end skips the channel
//! 4. single-pulse ladder at offsets `0, +1, -1` from the configured peak index
//! 5. two-pulse escalation when the one-pulse chi2 is too large
//! 6. three-sample estimators straight from the raw samples
//! 7. assemble the `PulseSummary`

use std::sync::Arc;

use crate::domain::{
    EscalationTuning, FitConfiguration, FitResult, PeakGate, PulseSummary, RawTrace, Tuning, extreme_index,
};
use crate::error::AppError;
use crate::fit::{TemplateFitter, single_pulse_guesses, two_pulse_guesses};
use crate::pulse::estimators::three_sample;
use crate::template::Template;

/// What the processor did for one trace, beyond the summary itself.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub summary: PulseSummary,
    /// The fit the summary was taken from.
    pub fit: FitResult,
    /// First sample of the fit window in the full trace.
    pub window_start: usize,
    pub escalated: bool,
}

/// Drives the template fitter for one detector channel.
#[derive(Debug, Clone)]
pub struct PulseProcessor {
    config: FitConfiguration,
    fitter: TemplateFitter,
    escalation: EscalationTuning,
    peak_gate: PeakGate,
}

impl PulseProcessor {
    pub fn new(config: FitConfiguration, template: Arc<Template>, tuning: Tuning) -> Result<Self, AppError> {
        if config.peak_index == 0 || config.peak_index + 2 > config.fit_length {
            return Err(AppError::config(format!(
                "{}: peakIndex {} must leave a sample on each side inside fitLength {}",
                config.name, config.peak_index, config.fit_length
            )));
        }
        Ok(Self {
            config,
            fitter: TemplateFitter::new(template, tuning.fitter),
            escalation: tuning.escalation,
            peak_gate: tuning.peak_gate,
        })
    }

    pub fn config(&self) -> &FitConfiguration {
        &self.config
    }

    pub fn fitter(&self) -> &TemplateFitter {
        &self.fitter
    }

    /// Summary for one trace, or `None` when the peak gate skips the channel.
    pub fn process(&self, trace: RawTrace<'_>) -> Result<Option<PulseSummary>, AppError> {
        Ok(self.process_detailed(trace)?.map(|o| o.summary))
    }

    pub fn process_detailed(&self, trace: RawTrace<'_>) -> Result<Option<ProcessOutcome>, AppError> {
        let samples = trace.samples();
        let peak = self.find_peak(trace)?;
        let peak_value = samples[peak];
        if !self.peak_gate.contains(peak_value) {
            tracing::debug!(
                detector = %self.config.name,
                peak,
                peak_value,
                "peak outside plausible range, channel skipped"
            );
            return Ok(None);
        }

        let Some((window_start, window)) = self.window(samples, peak) else {
            tracing::warn!(
                detector = %self.config.name,
                peak,
                trace_len = samples.len(),
                "fit window around the peak runs off the trace, channel skipped"
            );
            return Ok(None);
        };
        let y: Vec<f64> = window.iter().map(|&v| f64::from(v)).collect();

        let (single, attempts, successful) = self.single_pulse_ladder(&y)?;
        let (fit, escalated) = if single.chi2 > self.escalation.chi2_threshold {
            self.escalate(&y, single)?
        } else {
            (single, false)
        };

        let polarity = self.config.polarity;
        let sign = polarity.sign();
        let pi = self.config.peak_index;
        let estimate = three_sample(y[pi - 1], y[pi], y[pi + 1], peak as f64);
        let lead = self.leading_pulse(&fit);

        let summary = PulseSummary {
            energy: fit.scales[lead] * sign,
            baseline: fit.pedestal,
            three_sample_ampl: (estimate.amplitude - fit.pedestal) * sign,
            time: fit.times[lead] + window_start as f64,
            three_sample_time: estimate.time,
            chi2: fit.chi2,
            fit_converged: fit.converged,
            successful_fit: successful,
            attempts,
            n_pulses: fit.n_pulses(),
        };
        Ok(Some(ProcessOutcome {
            summary,
            fit,
            window_start,
            escalated,
        }))
    }

    /// Extreme sample of the whole trace. A trace shorter than the fit
    /// window is a configuration error.
    fn find_peak(&self, trace: RawTrace<'_>) -> Result<usize, AppError> {
        let len = trace.len();
        let fit_length = self.config.fit_length;
        if len < fit_length {
            return Err(AppError::WindowOverrun {
                start: 0,
                end: fit_length as isize,
                trace_len: len,
            });
        }
        extreme_index(trace.samples(), self.config.polarity).ok_or_else(|| AppError::Numerical("empty trace".into()))
    }

    /// Fit window anchored `peak_index` samples before `peak`, if it fits.
    fn window<'a>(&self, samples: &'a [u16], peak: usize) -> Option<(usize, &'a [u16])> {
        let start = peak.checked_sub(self.config.peak_index)?;
        let window = samples.get(start..start + self.config.fit_length)?;
        Some((start, window))
    }

    fn accept(&self, fit: &FitResult) -> bool {
        let deviation = (fit.times[0] - self.config.peak_index as f64).abs();
        deviation < f64::from(self.config.wiggle_room)
            && fit.converged
            && self.config.polarity.matches_scale(fit.scales[0])
    }

    /// Returns the retained fit, the attempts made and whether one was accepted.
    fn single_pulse_ladder(&self, y: &[f64]) -> Result<(FitResult, usize, bool), AppError> {
        let mut guesses = single_pulse_guesses(self.config.peak_index as f64);
        let first = guesses.next().unwrap_or(self.config.peak_index as f64);
        let mut fit = self.fitter.fit(y, &[first])?;
        let mut attempts = 1;
        if self.accept(&fit) {
            return Ok((fit, attempts, true));
        }
        for guess in guesses {
            attempts += 1;
            fit = self.fitter.fit(y, &[guess])?;
            if self.accept(&fit) {
                return Ok((fit, attempts, true));
            }
        }
        tracing::debug!(
            detector = %self.config.name,
            attempts,
            time = fit.times[0],
            "single-pulse ladder exhausted"
        );
        Ok((fit, attempts, false))
    }

    /// Second-pulse search on the one-pulse residuals; keeps the one-pulse fit
    /// unless a converged two-pulse fit has lower chi2.
    fn escalate(&self, y: &[f64], single: FitResult) -> Result<(FitResult, bool), AppError> {
        let model = self.fitter.predict_window(&single, y.len());
        let residuals: Vec<f64> = y.iter().zip(&model).map(|(s, m)| s - m).collect();
        let Some(candidate) = extreme_index(&residuals, self.config.polarity) else {
            return Ok((single, false));
        };

        let best = self.two_pulse_search(candidate as f64, |times| self.fitter.fit(y, times))?;

        tracing::debug!(
            detector = %self.config.name,
            one_pulse_chi2 = single.chi2,
            two_pulse_chi2 = best.chi2,
            candidate,
            "two-pulse escalation"
        );
        if best.converged && best.chi2 < single.chi2 {
            Ok((best, true))
        } else {
            Ok((single, false))
        }
    }

    /// Two-pulse fit at `(peak_index, candidate)`; above the two-pulse threshold,
    /// walks the offset-pair ladder until a fit gets below it. Returns the
    /// lowest-chi2 fit seen.
    fn two_pulse_search<F>(&self, candidate: f64, mut fit: F) -> Result<FitResult, AppError>
    where
        F: FnMut(&[f64]) -> Result<FitResult, AppError>,
    {
        let pi = self.config.peak_index as f64;
        let threshold = self.escalation.two_pulse_chi2_threshold;
        let mut best = fit(&[pi, candidate])?;
        if best.chi2 <= threshold {
            return Ok(best);
        }
        for guesses in two_pulse_guesses(pi) {
            let trial = fit(&guesses)?;
            let below = trial.chi2 <= threshold;
            if trial.chi2 < best.chi2 {
                best = trial;
            }
            if below {
                break;
            }
        }
        Ok(best)
    }

    /// Index of the pulse closest to the configured peak index.
    fn leading_pulse(&self, fit: &FitResult) -> usize {
        let pi = self.config.peak_index as f64;
        fit.times
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - pi).abs().total_cmp(&(b.1 - pi).abs()))
            .map_or(0, |(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic::{InjectedPulse, PulseShape, render_trace};
    use crate::domain::Polarity;
    use assert_approx_eq::assert_approx_eq;

    const SIGMA: f64 = 1.5;

    fn template() -> Arc<Template> {
        Arc::new(
            Template::tabulate(
                -8.5,
                11.5,
                401,
                |t| (-0.5 * (t / SIGMA) * (t / SIGMA)).exp(),
                |_| 0.01,
            )
            .unwrap(),
        )
    }

    fn config(polarity: Polarity) -> FitConfiguration {
        FitConfiguration {
            name: "calo_0".into(),
            channel: 0,
            template_buffer: 8,
            template_length: 20,
            fit_length: 30,
            peak_index: 10,
            wiggle_room: 2,
            polarity,
            draw: false,
        }
    }

    fn processor(cfg: FitConfiguration) -> PulseProcessor {
        PulseProcessor::new(cfg, template(), Tuning::default()).unwrap()
    }

    fn trace(pulses: &[InjectedPulse], baseline: f64, polarity: Polarity) -> Vec<u16> {
        render_trace(&PulseShape::Gaussian { sigma: SIGMA }, 128, baseline, pulses, 0.0, polarity, 0).unwrap()
    }

    #[test]
    fn single_pulse_first_try() {
        let samples = trace(&[InjectedPulse { time: 60.3, amplitude: 3000.0 }], 200.0, Polarity::Positive);
        let p = processor(config(Polarity::Positive));
        let s = p.process(RawTrace::new(&samples, 0)).unwrap().unwrap();

        assert!(s.first_try());
        assert!(s.fit_converged);
        assert_eq!(s.n_pulses, 1);
        assert_approx_eq!(s.time, 60.3, 0.01);
        assert_approx_eq!(s.energy, 3000.0, 5.0);
        assert_approx_eq!(s.baseline, 200.0, 1.0);
        assert!((s.three_sample_time - 60.3).abs() < 0.2);
        assert!(s.three_sample_ampl > 2900.0);
        assert!(s.chi2 < 500.0);
    }

    #[test]
    fn mirrored_trace_gives_same_energy_and_time() {
        let pos = trace(&[InjectedPulse { time: 55.7, amplitude: 2500.0 }], 300.0, Polarity::Positive);
        let neg: Vec<u16> = pos.iter().map(|&v| 4000 - v).collect();

        let a = processor(config(Polarity::Positive))
            .process(RawTrace::new(&pos, 0))
            .unwrap()
            .unwrap();
        let b = processor(config(Polarity::Negative))
            .process(RawTrace::new(&neg, 0))
            .unwrap()
            .unwrap();

        assert_approx_eq!(a.time, b.time, 1e-4);
        assert_approx_eq!(a.energy, b.energy, 1e-3);
        assert_approx_eq!(a.baseline, 4000.0 - b.baseline, 1e-3);
        assert_approx_eq!(a.three_sample_ampl, b.three_sample_ampl, 1e-6);
        assert!(a.energy > 0.0);
        assert_eq!(a.successful_fit, b.successful_fit);
    }

    #[test]
    fn ladder_exhaustion_still_reports_a_fit() {
        let samples = trace(&[InjectedPulse { time: 60.3, amplitude: 3000.0 }], 200.0, Polarity::Positive);
        let mut cfg = config(Polarity::Positive);
        cfg.wiggle_room = 0;
        let s = processor(cfg).process(RawTrace::new(&samples, 0)).unwrap().unwrap();

        assert!(!s.successful_fit);
        assert!(!s.first_try());
        assert_eq!(s.attempts, 3);
        assert!(s.fit_converged);
        assert_approx_eq!(s.time, 60.3, 0.01);
    }

    #[test]
    fn opposite_sign_scale_is_never_accepted() {
        // A positive pulse fitted as if the detector were negative; the dip
        // inside it becomes the "peak".
        let mut samples = trace(&[InjectedPulse { time: 60.0, amplitude: 1000.0 }], 2000.0, Polarity::Positive);
        samples[58] = 1990;
        let mut cfg = config(Polarity::Negative);
        cfg.wiggle_room = 30;
        let s = processor(cfg).process(RawTrace::new(&samples, 0)).unwrap().unwrap();
        assert!(!s.successful_fit);
        assert_eq!(s.attempts, 3);
    }

    #[test]
    fn pileup_escalates_to_two_pulses() {
        let pulses = [
            InjectedPulse { time: 60.0, amplitude: 3000.0 },
            InjectedPulse { time: 65.5, amplitude: 2000.0 },
        ];
        let samples = trace(&pulses, 200.0, Polarity::Positive);
        let p = processor(config(Polarity::Positive));
        let out = p.process_detailed(RawTrace::new(&samples, 0)).unwrap().unwrap();

        assert!(out.escalated);
        assert_eq!(out.summary.n_pulses, 2);
        assert!(out.summary.chi2 < Tuning::default().escalation.chi2_threshold);
        let mut times: Vec<f64> = out.fit.times.iter().map(|t| t + out.window_start as f64).collect();
        let mut scales = out.fit.scales.clone();
        if times[0] > times[1] {
            times.swap(0, 1);
            scales.swap(0, 1);
        }
        assert_approx_eq!(times[0], 60.0, 0.02);
        assert_approx_eq!(times[1], 65.5, 0.02);
        assert_approx_eq!(scales[0], 3000.0, 10.0);
        assert_approx_eq!(scales[1], 2000.0, 10.0);
        assert_approx_eq!(out.summary.time, 60.0, 0.02);
        assert_approx_eq!(out.summary.energy, 3000.0, 10.0);
    }

    fn scripted(times: &[f64], chi2: f64) -> FitResult {
        FitResult {
            chi2,
            converged: true,
            ..FitResult::failed(times)
        }
    }

    #[test]
    fn pair_ladder_stops_at_first_pair_below_threshold() {
        let p = processor(config(Polarity::Positive));
        let threshold = Tuning::default().escalation.two_pulse_chi2_threshold;
        let chi2s = [5000.0, 4000.0, 6000.0, threshold - 1.0, 10.0];
        let mut tried: Vec<Vec<f64>> = Vec::new();

        let best = p
            .two_pulse_search(22.0, |times| {
                let chi2 = chi2s[tried.len()];
                tried.push(times.to_vec());
                Ok(scripted(times, chi2))
            })
            .unwrap();

        assert_eq!(tried, vec![vec![10.0, 22.0], vec![8.0, 11.0], vec![9.0, 11.0], vec![8.0, 12.0]]);
        assert_eq!(best.times, vec![8.0, 12.0]);
        assert_eq!(best.chi2, threshold - 1.0);
    }

    #[test]
    fn pair_ladder_keeps_lowest_chi2_when_exhausted() {
        let p = processor(config(Polarity::Positive));
        let chi2s = [9000.0, 8000.0, 7000.0, 2500.0, 7500.0, 3000.0, 8500.0, 9500.0];
        let mut calls = 0;

        let best = p
            .two_pulse_search(22.0, |times| {
                calls += 1;
                Ok(scripted(times, chi2s[calls - 1]))
            })
            .unwrap();

        assert_eq!(calls, 8);
        assert_eq!(best.times, vec![8.0, 12.0]);
        assert_eq!(best.chi2, 2500.0);
    }

    #[test]
    fn good_candidate_fit_skips_pair_ladder() {
        let p = processor(config(Polarity::Positive));
        let mut calls = 0;
        let best = p
            .two_pulse_search(15.0, |times| {
                calls += 1;
                Ok(scripted(times, 40.0))
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(best.times, vec![10.0, 15.0]);
    }

    #[test]
    fn pair_ladder_recovers_pileup_after_a_failed_candidate_fit() {
        let pulses = [
            InjectedPulse { time: 60.0, amplitude: 3000.0 },
            InjectedPulse { time: 65.5, amplitude: 2000.0 },
        ];
        let samples = trace(&pulses, 200.0, Polarity::Positive);
        let y: Vec<f64> = samples[50..80].iter().map(|&v| f64::from(v)).collect();

        let mut tuning = Tuning::default();
        tuning.escalation.chi2_threshold = 50.0;
        tuning.escalation.two_pulse_chi2_threshold = 50.0;
        let p = PulseProcessor::new(config(Polarity::Positive), template(), tuning).unwrap();

        // A candidate outside the window leaves its template column empty.
        let mut fits = 0;
        let best = p
            .two_pulse_search(60.0, |times| {
                fits += 1;
                p.fitter().fit(&y, times)
            })
            .unwrap();

        assert!(fits > 1);
        assert!(best.converged);
        assert!(best.chi2 <= 50.0, "chi2 {}", best.chi2);
        let (mut times, mut scales) = (best.times.clone(), best.scales.clone());
        if times[0] > times[1] {
            times.swap(0, 1);
            scales.swap(0, 1);
        }
        assert_approx_eq!(times[0], 10.0, 0.02);
        assert_approx_eq!(times[1], 15.5, 0.02);
        assert_approx_eq!(scales[0], 3000.0, 10.0);
        assert_approx_eq!(scales[1], 2000.0, 10.0);
    }

    #[test]
    fn saturated_peak_is_skipped() {
        let samples = trace(&[InjectedPulse { time: 60.0, amplitude: 5000.0 }], 200.0, Polarity::Positive);
        assert!(samples[60] > Tuning::default().peak_gate.max);
        let p = processor(config(Polarity::Positive));
        assert!(p.process(RawTrace::new(&samples, 0)).unwrap().is_none());
    }

    #[test]
    fn short_trace_is_a_window_overrun() {
        let samples = vec![100u16; 20];
        let p = processor(config(Polarity::Positive));
        assert!(matches!(
            p.process(RawTrace::new(&samples, 0)),
            Err(AppError::WindowOverrun { .. })
        ));
    }

    #[test]
    fn saturated_spike_near_trace_start_gates_the_channel() {
        let mut samples = trace(&[InjectedPulse { time: 60.0, amplitude: 300.0 }], 200.0, Polarity::Positive);
        samples[3] = 4095;
        let p = processor(config(Polarity::Positive));
        assert!(p.process(RawTrace::new(&samples, 0)).unwrap().is_none());
    }

    #[test]
    fn peak_without_room_for_a_window_skips_the_channel() {
        let p = processor(config(Polarity::Positive));

        // In range, but index 2 cannot host a window with peak_index 10.
        let mut early = trace(&[InjectedPulse { time: 60.0, amplitude: 1000.0 }], 200.0, Polarity::Positive);
        early[2] = 3000;
        assert!(p.process(RawTrace::new(&early, 0)).unwrap().is_none());

        // Window would need 20 samples after index 120 of a 128-sample trace.
        let late = trace(&[InjectedPulse { time: 120.0, amplitude: 1000.0 }], 200.0, Polarity::Positive);
        assert!(p.process(RawTrace::new(&late, 0)).unwrap().is_none());
    }

    #[test]
    fn invalid_peak_index_is_rejected() {
        let mut cfg = config(Polarity::Positive);
        cfg.peak_index = 29;
        assert!(matches!(
            PulseProcessor::new(cfg, template(), Tuning::default()),
            Err(AppError::Config(_))
        ));
    }
}
