//! Interpolants over tabulated knots.
//!
//! - `CubicSpline`: natural cubic spline (zero second derivative at both ends),
//!   used for the template mean/sigma curves. Outside the knot range it
//!   continues linearly with the end slope, which keeps value and slope
//!   continuous at the ends.
//! - `LinearInterpolant`: monotone piecewise-linear map, used for the
//!   pseudo-time -> real-time correction where a cubic could overshoot.

use serde::{Deserialize, Serialize};

use crate::error::AppError;

fn validate_knots(x: &[f64], y: &[f64]) -> Result<(), AppError> {
    if x.is_empty() {
        return Err(AppError::format("interpolant", "no knots"));
    }
    if x.len() != y.len() {
        return Err(AppError::format(
            "interpolant",
            format!("{} x values but {} y values", x.len(), y.len()),
        ));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(AppError::format("interpolant", "non-finite knot"));
    }
    if x.windows(2).any(|w| w[1] <= w[0]) {
        return Err(AppError::format("interpolant", "knot x values must be strictly increasing"));
    }
    Ok(())
}

/// Locate the segment `j` with `x[j] <= t < x[j+1]`, clamped to valid segments.
fn segment(x: &[f64], t: f64) -> usize {
    let upper = x.partition_point(|&k| k <= t);
    upper.saturating_sub(1).min(x.len().saturating_sub(2))
}

#[derive(Debug, Clone, PartialEq)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    /// Second derivatives at the knots.
    m: Vec<f64>,
}

impl CubicSpline {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, AppError> {
        validate_knots(&x, &y)?;
        let m = natural_second_derivatives(&x, &y);
        Ok(Self { x, y, m })
    }

    pub fn knots_x(&self) -> &[f64] {
        &self.x
    }

    pub fn knots_y(&self) -> &[f64] {
        &self.y
    }

    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        if n == 1 {
            return self.y[0];
        }
        if t < self.x[0] {
            return self.y[0] + (t - self.x[0]) * self.derivative(self.x[0]);
        }
        if t > self.x[n - 1] {
            return self.y[n - 1] + (t - self.x[n - 1]) * self.derivative(self.x[n - 1]);
        }

        let j = segment(&self.x, t);
        let h = self.x[j + 1] - self.x[j];
        let a = (self.x[j + 1] - t) / h;
        let b = (t - self.x[j]) / h;
        a * self.y[j]
            + b * self.y[j + 1]
            + ((a * a * a - a) * self.m[j] + (b * b * b - b) * self.m[j + 1]) * h * h / 6.0
    }

    pub fn derivative(&self, t: f64) -> f64 {
        let n = self.x.len();
        if n == 1 {
            return 0.0;
        }
        let t = t.clamp(self.x[0], self.x[n - 1]);
        let j = segment(&self.x, t);
        let h = self.x[j + 1] - self.x[j];
        let a = (self.x[j + 1] - t) / h;
        let b = (t - self.x[j]) / h;
        (self.y[j + 1] - self.y[j]) / h - (3.0 * a * a - 1.0) / 6.0 * h * self.m[j]
            + (3.0 * b * b - 1.0) / 6.0 * h * self.m[j + 1]
    }
}

/// Solve the natural-spline tridiagonal system (Thomas algorithm).
fn natural_second_derivatives(x: &[f64], y: &[f64]) -> Vec<f64> {
    let n = x.len();
    let mut m = vec![0.0; n];
    if n < 3 {
        return m;
    }

    let inner = n - 2;
    let mut diag = vec![0.0; inner];
    let mut upper = vec![0.0; inner];
    let mut rhs = vec![0.0; inner];
    for k in 0..inner {
        let i = k + 1;
        let h0 = x[i] - x[i - 1];
        let h1 = x[i + 1] - x[i];
        diag[k] = 2.0 * (h0 + h1);
        upper[k] = h1;
        rhs[k] = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
    }

    // Forward sweep; the sub-diagonal entry for row k is h_{k} = x[k+1] - x[k].
    for k in 1..inner {
        let lower = x[k + 1] - x[k];
        let w = lower / diag[k - 1];
        diag[k] -= w * upper[k - 1];
        rhs[k] -= w * rhs[k - 1];
    }

    m[inner] = rhs[inner - 1] / diag[inner - 1];
    for k in (0..inner - 1).rev() {
        m[k + 1] = (rhs[k] - upper[k] * m[k + 2]) / diag[k];
    }
    m
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearInterpolant {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LinearInterpolant {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self, AppError> {
        validate_knots(&x, &y)?;
        Ok(Self { x, y })
    }

    pub fn knots_x(&self) -> &[f64] {
        &self.x
    }

    pub fn knots_y(&self) -> &[f64] {
        &self.y
    }

    /// Evaluate, holding the end values outside the knot range.
    pub fn eval(&self, t: f64) -> f64 {
        let n = self.x.len();
        if n == 1 || t <= self.x[0] {
            return self.y[0];
        }
        if t >= self.x[n - 1] {
            return self.y[n - 1];
        }
        let j = segment(&self.x, t);
        let u = (t - self.x[j]) / (self.x[j + 1] - self.x[j]);
        self.y[j] + u * (self.y[j + 1] - self.y[j])
    }
}

/// Knot table as persisted on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Knots {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl From<&CubicSpline> for Knots {
    fn from(s: &CubicSpline) -> Self {
        Self {
            x: s.x.clone(),
            y: s.y.clone(),
        }
    }
}

impl From<&LinearInterpolant> for Knots {
    fn from(s: &LinearInterpolant) -> Self {
        Self {
            x: s.x.clone(),
            y: s.y.clone(),
        }
    }
}
