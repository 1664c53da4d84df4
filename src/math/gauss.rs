//! Gaussian fit to histogram content.
//!
//! Fits `A * exp(-(x - μ)² / (2σ²))` to the non-empty bins inside a range
//! by Levenberg–Marquardt, weighting each bin by `1 / count` (Poisson
//! variance). Starting values come from the moments of the bins in range,
//! so the fit only has to refine a close guess.

use nalgebra::{Matrix3, Vector3};

use crate::math::histogram::Histogram1D;

const MAX_ITERATIONS: usize = 100;
const REL_TOL: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussFit {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
}

fn gauss(p: &Vector3<f64>, x: f64) -> f64 {
    let z = (x - p[1]) / p[2];
    p[0] * (-0.5 * z * z).exp()
}

fn weighted_sse(p: &Vector3<f64>, points: &[(f64, f64, f64)]) -> f64 {
    points
        .iter()
        .map(|&(x, y, w)| {
            let r = y - gauss(p, x);
            w * r * r
        })
        .sum()
}

/// Moments of the bins whose centres lie inside `[lo, hi]`.
fn moments_in_range(points: &[(f64, f64, f64)]) -> Option<(f64, f64)> {
    let total: f64 = points.iter().map(|p| p.1).sum();
    if total <= 0.0 {
        return None;
    }
    let mean = points.iter().map(|p| p.0 * p.1).sum::<f64>() / total;
    let var = points.iter().map(|p| (p.0 - mean).powi(2) * p.1).sum::<f64>() / total;
    Some((mean, var.max(0.0).sqrt()))
}

/// Fit a Gaussian to the histogram bins whose centres lie in `[lo, hi]`.
///
/// Returns `None` when fewer than three bins are populated or the fit does
/// not produce a finite, positive width.
pub fn fit_gaussian(hist: &Histogram1D, lo: f64, hi: f64) -> Option<GaussFit> {
    let axis = hist.axis();
    let points: Vec<(f64, f64, f64)> = hist
        .counts()
        .iter()
        .enumerate()
        .map(|(i, &c)| (axis.center(i), c))
        .filter(|&(x, c)| c > 0.0 && x >= lo && x <= hi)
        .map(|(x, c)| (x, c, 1.0 / c.max(1.0)))
        .collect();
    if points.len() < 3 {
        return None;
    }

    let (mean0, sigma0) = moments_in_range(&points)?;
    let sigma0 = sigma0.max(axis.width() * 0.5);
    let peak0 = points.iter().map(|p| p.1).fold(0.0, f64::max);
    let mut p = Vector3::new(peak0, mean0, sigma0);
    let mut sse = weighted_sse(&p, &points);
    let mut lambda = 1e-3;

    for _ in 0..MAX_ITERATIONS {
        let mut jtj = Matrix3::<f64>::zeros();
        let mut jtr = Vector3::<f64>::zeros();
        for &(x, y, w) in &points {
            let z = (x - p[1]) / p[2];
            let e = (-0.5 * z * z).exp();
            let g = Vector3::new(e, p[0] * e * z / p[2], p[0] * e * z * z / p[2]);
            let r = y - p[0] * e;
            jtj += w * g * g.transpose();
            jtr += w * r * g;
        }

        let mut improved = false;
        while lambda < 1e12 {
            let mut damped = jtj;
            for k in 0..3 {
                damped[(k, k)] *= 1.0 + lambda;
            }
            let Some(step) = damped.try_inverse().map(|inv| inv * jtr) else {
                lambda *= 10.0;
                continue;
            };
            let trial = p + step;
            let trial_sse = weighted_sse(&trial, &points);
            if trial[2] > 0.0 && trial_sse.is_finite() && trial_sse <= sse {
                let rel = (sse - trial_sse) / sse.max(f64::MIN_POSITIVE);
                p = trial;
                sse = trial_sse;
                lambda = (lambda * 0.1).max(1e-12);
                improved = rel > REL_TOL;
                break;
            }
            lambda *= 10.0;
        }
        if !improved {
            break;
        }
    }

    let fit = GaussFit {
        amplitude: p[0],
        mean: p[1],
        sigma: p[2].abs(),
    };
    if fit.mean.is_finite() && fit.sigma.is_finite() && fit.sigma > 0.0 {
        Some(fit)
    } else {
        None
    }
}
