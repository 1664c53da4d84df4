//! Separable template fit for one or more overlapping pulses.
//!
//! Model for sample `i` of the window:
//!
//! ```text
//! y_i = pedestal + Σ_k scale_k * T(i - time_k)
//! ```
//!
//! where `T` is the template mean (zero outside its domain).
//!
//! The model is linear in `(scales, pedestal)` once the times are fixed, so:
//! - for a trial time vector we solve the scales/pedestal by least squares and
//!   read off the residual sum of squares
//! - the outer search runs Gauss-Newton over the times only, using the full
//!   `2N+1` Jacobian to get a joint step and keeping its time part
//! - every accepted step must not increase chi2 (step halving line search)
//!
//! Chi2 is the plain residual sum of squares (unit variance per sample), and
//! the covariance is `(JᵀJ)⁻¹` at the final point.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::domain::{FitResult, FitterTuning};
use crate::error::AppError;
use crate::math::{covariance_from_jacobian, solve_least_squares};
use crate::template::Template;

/// Linear sub-solve outcome for a fixed time vector.
#[derive(Debug, Clone)]
struct LinearSolution {
    scales: Vec<f64>,
    pedestal: f64,
    chi2: f64,
}

/// Stateless-per-call fitter bound to one channel's template.
#[derive(Debug, Clone)]
pub struct TemplateFitter {
    template: Arc<Template>,
    tuning: FitterTuning,
}

impl TemplateFitter {
    pub fn new(template: Arc<Template>, tuning: FitterTuning) -> Self {
        Self { template, tuning }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn tuning(&self) -> FitterTuning {
        self.tuning
    }

    /// Fit `guesses.len()` pulses to `samples`.
    ///
    /// Only malformed input is an error. A singular sub-solve or an exhausted
    /// iteration budget is reported through `FitResult::converged`.
    pub fn fit(&self, samples: &[f64], guesses: &[f64]) -> Result<FitResult, AppError> {
        let n_pulses = guesses.len();
        if n_pulses == 0 {
            return Err(AppError::Numerical("template fit needs at least one pulse time".into()));
        }
        if samples.len() < 2 * n_pulses + 1 {
            return Err(AppError::InsufficientData(format!(
                "{} samples cannot constrain {} parameters",
                samples.len(),
                2 * n_pulses + 1
            )));
        }
        if samples.iter().chain(guesses).any(|v| !v.is_finite()) {
            return Err(AppError::Numerical("non-finite sample or time guess".into()));
        }

        let y = DVector::from_column_slice(samples);
        let mut times = guesses.to_vec();
        let Some(mut current) = self.solve_linear(&y, &times) else {
            tracing::trace!(?times, "singular design at the initial guess");
            return Ok(FitResult::failed(&times));
        };

        let mut converged = false;
        for _ in 0..self.tuning.max_iterations {
            let jacobian = self.jacobian(samples.len(), &times, &current.scales);
            let residual = &y - self.model_vector(samples.len(), &times, &current.scales, current.pedestal);
            let Some(step) = solve_least_squares(&jacobian, &residual) else {
                break;
            };

            let dt: Vec<f64> = step
                .rows(0, n_pulses)
                .iter()
                .map(|d| d.clamp(-self.tuning.max_step, self.tuning.max_step))
                .collect();
            let step_len = dt.iter().fold(0.0_f64, |m, d| m.max(d.abs()));
            if step_len < self.tuning.tolerance {
                converged = true;
                break;
            }

            match self.line_search(&y, &times, &dt, step_len, current.chi2) {
                Some((trial_times, solution, taken)) => {
                    times = trial_times;
                    current = solution;
                    if taken < self.tuning.tolerance {
                        converged = true;
                        break;
                    }
                }
                // No downhill point above the tolerance scale: already at the minimum.
                None => {
                    converged = true;
                    break;
                }
            }
        }

        let jacobian = self.jacobian(samples.len(), &times, &current.scales);
        let covariance = match covariance_from_jacobian(&jacobian) {
            Some(c) => c,
            None => {
                converged = false;
                DMatrix::zeros(2 * n_pulses + 1, 2 * n_pulses + 1)
            }
        };

        Ok(FitResult {
            times,
            scales: current.scales,
            pedestal: current.pedestal,
            covariance,
            chi2: current.chi2,
            converged,
        })
    }

    /// Model value at (fractional) sample index `i`.
    pub fn predict(&self, fit: &FitResult, i: f64) -> f64 {
        fit.pedestal
            + fit
                .times
                .iter()
                .zip(&fit.scales)
                .map(|(&t, &s)| s * self.template.mean(i - t))
                .sum::<f64>()
    }

    /// Model values over a window of `len` samples.
    pub fn predict_window(&self, fit: &FitResult, len: usize) -> Vec<f64> {
        (0..len).map(|i| self.predict(fit, i as f64)).collect()
    }

    /// Halve the time step until chi2 does not increase.
    fn line_search(
        &self,
        y: &DVector<f64>,
        times: &[f64],
        dt: &[f64],
        step_len: f64,
        chi2: f64,
    ) -> Option<(Vec<f64>, LinearSolution, f64)> {
        let mut lambda = 1.0;
        while lambda * step_len >= self.tuning.tolerance {
            let trial: Vec<f64> = times.iter().zip(dt).map(|(t, d)| t + lambda * d).collect();
            if let Some(solution) = self.solve_linear(y, &trial) {
                if solution.chi2 <= chi2 {
                    return Some((trial, solution, lambda * step_len));
                }
            }
            lambda *= 0.5;
        }
        None
    }

    fn solve_linear(&self, y: &DVector<f64>, times: &[f64]) -> Option<LinearSolution> {
        let n = y.len();
        let k = times.len();
        let mut x = DMatrix::<f64>::zeros(n, k + 1);
        for i in 0..n {
            for (col, &t) in times.iter().enumerate() {
                x[(i, col)] = self.template.mean(i as f64 - t);
            }
            x[(i, k)] = 1.0;
        }

        let beta = solve_least_squares(&x, y)?;
        let chi2 = (y - &x * &beta).norm_squared();
        if !chi2.is_finite() {
            return None;
        }
        Some(LinearSolution {
            scales: beta.rows(0, k).iter().copied().collect(),
            pedestal: beta[k],
            chi2,
        })
    }

    fn model_vector(&self, n: usize, times: &[f64], scales: &[f64], pedestal: f64) -> DVector<f64> {
        DVector::from_fn(n, |i, _| {
            pedestal
                + times
                    .iter()
                    .zip(scales)
                    .map(|(&t, &s)| s * self.template.mean(i as f64 - t))
                    .sum::<f64>()
        })
    }

    /// Columns ordered `[times, scales, pedestal]`.
    fn jacobian(&self, n: usize, times: &[f64], scales: &[f64]) -> DMatrix<f64> {
        let k = times.len();
        let mut j = DMatrix::<f64>::zeros(n, 2 * k + 1);
        for i in 0..n {
            for (p, (&t, &s)) in times.iter().zip(scales).enumerate() {
                let u = i as f64 - t;
                j[(i, p)] = -s * self.template.mean_derivative(u);
                j[(i, k + p)] = self.template.mean(u);
            }
            j[(i, 2 * k)] = 1.0;
        }
        j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn gaussian_template() -> Arc<Template> {
        let sigma = 1.5;
        Arc::new(
            Template::tabulate(
                -8.5,
                11.5,
                401,
                |t| (-0.5 * (t / sigma) * (t / sigma)).exp(),
                |_| 0.01,
            )
            .unwrap(),
        )
    }

    fn synth(tpl: &Template, n: usize, pulses: &[(f64, f64)], pedestal: f64) -> Vec<f64> {
        (0..n)
            .map(|i| {
                pedestal
                    + pulses
                        .iter()
                        .map(|&(t, s)| s * tpl.mean(i as f64 - t))
                        .sum::<f64>()
            })
            .collect()
    }

    #[test]
    fn recovers_noiseless_single_pulse() {
        let tpl = gaussian_template();
        let samples = synth(&tpl, 30, &[(10.3, 5000.0)], 200.0);
        let fitter = TemplateFitter::new(tpl, FitterTuning::default());

        let fit = fitter.fit(&samples, &[10.0]).unwrap();
        assert!(fit.converged);
        assert_approx_eq!(fit.times[0], 10.3, 1e-5);
        assert_approx_eq!(fit.scales[0], 5000.0, 1e-3);
        assert_approx_eq!(fit.pedestal, 200.0, 1e-3);
        assert!(fit.chi2 < 1e-3, "chi2 {}", fit.chi2);
        assert_eq!(fit.covariance.shape(), (3, 3));
        assert!(fit.time_error(0) > 0.0);
        assert!(fit.scale_error(0) > 0.0);
        assert!(fit.pedestal_error() > 0.0);
    }

    #[test]
    fn recovers_two_overlapping_pulses() {
        let tpl = gaussian_template();
        let samples = synth(&tpl, 40, &[(10.2, 4000.0), (16.7, 2500.0)], 150.0);
        let fitter = TemplateFitter::new(tpl, FitterTuning::default());

        let fit = fitter.fit(&samples, &[10.0, 17.0]).unwrap();
        assert!(fit.converged);
        assert_approx_eq!(fit.times[0], 10.2, 1e-5);
        assert_approx_eq!(fit.times[1], 16.7, 1e-5);
        assert_approx_eq!(fit.scales[0], 4000.0, 1e-2);
        assert_approx_eq!(fit.scales[1], 2500.0, 1e-2);
        assert_eq!(fit.covariance.shape(), (5, 5));
        let model = fitter.predict_window(&fit, samples.len());
        for (m, s) in model.iter().zip(&samples) {
            assert_approx_eq!(*m, *s, 1e-3);
        }
    }

    #[test]
    fn coincident_guesses_are_singular() {
        let tpl = gaussian_template();
        let samples = synth(&tpl, 30, &[(10.0, 1000.0)], 0.0);
        let fitter = TemplateFitter::new(tpl, FitterTuning::default());

        let fit = fitter.fit(&samples, &[10.0, 10.0]).unwrap();
        assert!(!fit.converged);
        assert!(fit.chi2.is_infinite());
        assert_eq!(fit.n_pulses(), 2);
    }

    #[test]
    fn iteration_cap_reports_no_convergence() {
        let tpl = gaussian_template();
        let samples = synth(&tpl, 30, &[(11.0, 1000.0)], 0.0);
        let tuning = FitterTuning {
            max_iterations: 1,
            max_step: 0.25,
            ..FitterTuning::default()
        };
        let fitter = TemplateFitter::new(tpl, tuning);

        let fit = fitter.fit(&samples, &[10.0]).unwrap();
        assert!(!fit.converged);
        assert!(fit.chi2.is_finite());
    }

    #[test]
    fn rejects_malformed_input() {
        let fitter = TemplateFitter::new(gaussian_template(), FitterTuning::default());
        assert!(fitter.fit(&[1.0, 2.0, 3.0], &[]).is_err());
        assert!(fitter.fit(&[1.0, 2.0], &[0.5]).is_err());
        assert!(fitter.fit(&[1.0, f64::NAN, 3.0, 4.0], &[1.0]).is_err());
    }
}
