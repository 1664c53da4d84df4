//! Closed-form estimators from the peak sample and its two neighbours.
//!
//! With `pm`, `p0`, `p1` the samples before, at and after the peak:
//!
//! ```text
//! amplitude = p0 + (p1 - pm)² / (16 p0 - 8 (p1 + pm))
//! time      = peak + (p1 - pm) / (4 p0 - 2 (p1 + pm))
//! ```
//!
//! A vanishing denominator (flat top) falls back to `p0` and `peak`.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreeSample {
    pub amplitude: f64,
    /// Sample index of the vertex, in the same frame as `peak`.
    pub time: f64,
}

pub fn three_sample(before: f64, peak_value: f64, after: f64, peak: f64) -> ThreeSample {
    let diff = after - before;
    let curvature = 2.0 * peak_value - (after + before);

    if curvature == 0.0 {
        return ThreeSample {
            amplitude: peak_value,
            time: peak,
        };
    }

    let amplitude = peak_value + diff * diff / (8.0 * curvature);
    let time = peak + diff / (2.0 * curvature);
    if amplitude.is_finite() && time.is_finite() {
        ThreeSample { amplitude, time }
    } else {
        ThreeSample {
            amplitude: peak_value,
            time: peak,
        }
    }
}
