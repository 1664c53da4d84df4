//! The calibrated pulse-shape template.
//!
//! A `Template` is two interpolants over the same bounded offset domain:
//!
//! - `mean(t)`: expected normalized pulse amplitude `t` samples after the pulse peak
//! - `sigma(t)`: expected spread of that amplitude across calibration pulses
//!
//! Templates are built once, then shared read-only (usually behind an `Arc`)
//! by every fit that references the channel's calibration.

use crate::error::AppError;
use crate::math::CubicSpline;

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    lo: f64,
    hi: f64,
    mean: CubicSpline,
    sigma: CubicSpline,
}

impl Template {
    pub fn new(lo: f64, hi: f64, mean: CubicSpline, sigma: CubicSpline) -> Result<Self, AppError> {
        if !(lo.is_finite() && hi.is_finite() && hi > lo) {
            return Err(AppError::format(
                "template",
                format!("invalid domain [{lo}, {hi}]"),
            ));
        }
        Ok(Self {
            lo,
            hi,
            mean,
            sigma,
        })
    }

    /// Tabulate analytic shape functions on `n_knots` evenly spaced offsets.
    pub fn tabulate(
        lo: f64,
        hi: f64,
        n_knots: usize,
        mean: impl Fn(f64) -> f64,
        sigma: impl Fn(f64) -> f64,
    ) -> Result<Self, AppError> {
        if n_knots < 2 {
            return Err(AppError::format("template", "need at least two knots"));
        }
        let step = (hi - lo) / (n_knots as f64 - 1.0);
        let x: Vec<f64> = (0..n_knots).map(|i| lo + step * i as f64).collect();
        let m = x.iter().map(|&t| mean(t)).collect();
        let s = x.iter().map(|&t| sigma(t)).collect();
        Self::new(
            lo,
            hi,
            CubicSpline::new(x.clone(), m)?,
            CubicSpline::new(x, s)?,
        )
    }

    pub fn domain(&self) -> (f64, f64) {
        (self.lo, self.hi)
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.lo && t <= self.hi
    }

    /// Expected normalized amplitude at offset `t`; zero outside the domain.
    pub fn mean(&self, t: f64) -> f64 {
        if self.contains(t) { self.mean.eval(t) } else { 0.0 }
    }

    /// `d mean / dt`; zero outside the domain.
    pub fn mean_derivative(&self, t: f64) -> f64 {
        if self.contains(t) {
            self.mean.derivative(t)
        } else {
            0.0
        }
    }

    /// Expected amplitude spread at offset `t`; zero outside the domain.
    pub fn sigma(&self, t: f64) -> f64 {
        if self.contains(t) {
            self.sigma.eval(t)
        } else {
            0.0
        }
    }

    pub fn mean_spline(&self) -> &CubicSpline {
        &self.mean
    }

    pub fn sigma_spline(&self) -> &CubicSpline {
        &self.sigma
    }
}
