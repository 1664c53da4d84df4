//! Fixed-binning 1-D and 2-D histograms.
//!
//! Entries outside the axis range are counted as overflow and otherwise
//! ignored; statistics (`mean`, `rms`) are computed from bin centres of the
//! in-range bins only.

use nalgebra::DMatrix;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinAxis {
    pub lo: f64,
    pub hi: f64,
    pub n_bins: usize,
}

impl BinAxis {
    pub fn new(lo: f64, hi: f64, n_bins: usize) -> Self {
        Self { lo, hi, n_bins }
    }

    pub fn width(&self) -> f64 {
        (self.hi - self.lo) / self.n_bins as f64
    }

    pub fn low_edge(&self, bin: usize) -> f64 {
        self.lo + bin as f64 * self.width()
    }

    pub fn center(&self, bin: usize) -> f64 {
        self.low_edge(bin) + 0.5 * self.width()
    }

    /// Bin holding `x`, half-open on the right.
    pub fn find(&self, x: f64) -> Option<usize> {
        if !(x.is_finite() && x >= self.lo && x < self.hi) || self.n_bins == 0 {
            return None;
        }
        let bin = ((x - self.lo) / self.width()) as usize;
        Some(bin.min(self.n_bins - 1))
    }
}

#[derive(Debug, Clone)]
pub struct Histogram1D {
    axis: BinAxis,
    counts: Vec<f64>,
    overflow: f64,
}

impl Histogram1D {
    pub fn new(axis: BinAxis) -> Self {
        Self {
            axis,
            counts: vec![0.0; axis.n_bins],
            overflow: 0.0,
        }
    }

    /// Histogram whose axis spans the finite values (slightly widened so the maximum lands inside).
    pub fn auto_range(values: &[f64], n_bins: usize) -> Option<Self> {
        let finite = values.iter().copied().filter(|v| v.is_finite());
        let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
        if !(lo.is_finite() && hi.is_finite()) || n_bins == 0 {
            return None;
        }
        let pad = if hi > lo { (hi - lo) * 1e-3 } else { lo.abs().max(1.0) * 1e-3 };
        let mut hist = Self::new(BinAxis::new(lo - pad, hi + pad, n_bins));
        for &v in values {
            hist.fill(v, 1.0);
        }
        Some(hist)
    }

    pub fn axis(&self) -> BinAxis {
        self.axis
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn fill(&mut self, x: f64, weight: f64) {
        match self.axis.find(x) {
            Some(bin) => self.counts[bin] += weight,
            None => self.overflow += weight,
        }
    }

    pub fn integral(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn overflow(&self) -> f64 {
        self.overflow
    }

    /// Rescale so the in-range content sums to one. No-op on an empty histogram.
    pub fn normalize(&mut self) {
        let total = self.integral();
        if total > 0.0 {
            for c in &mut self.counts {
                *c /= total;
            }
        }
    }

    /// Running sums; element `i` holds the content of bins `0..=i`.
    pub fn cumulative(&self) -> Vec<f64> {
        self.counts
            .iter()
            .scan(0.0, |acc, &c| {
                *acc += c;
                Some(*acc)
            })
            .collect()
    }

    pub fn mean(&self) -> Option<f64> {
        let total = self.integral();
        if total <= 0.0 {
            return None;
        }
        let sum: f64 = self
            .counts
            .iter()
            .enumerate()
            .map(|(i, &c)| c * self.axis.center(i))
            .sum();
        Some(sum / total)
    }

    pub fn rms(&self) -> Option<f64> {
        let mean = self.mean()?;
        let total = self.integral();
        let var: f64 = self
            .counts
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let d = self.axis.center(i) - mean;
                c * d * d
            })
            .sum::<f64>()
            / total;
        Some(var.max(0.0).sqrt())
    }
}

/// 2-D histogram indexed by (x bin, y bin).
#[derive(Debug, Clone)]
pub struct Histogram2D {
    x_axis: BinAxis,
    y_axis: BinAxis,
    counts: DMatrix<f64>,
}

impl Histogram2D {
    pub fn new(x_axis: BinAxis, y_axis: BinAxis) -> Self {
        Self {
            x_axis,
            y_axis,
            counts: DMatrix::zeros(x_axis.n_bins, y_axis.n_bins),
        }
    }

    pub fn x_axis(&self) -> BinAxis {
        self.x_axis
    }

    pub fn y_axis(&self) -> BinAxis {
        self.y_axis
    }

    /// Returns `false` if the entry fell outside either axis.
    pub fn fill(&mut self, x: f64, y: f64) -> bool {
        match (self.x_axis.find(x), self.y_axis.find(y)) {
            (Some(ix), Some(iy)) => {
                self.counts[(ix, iy)] += 1.0;
                true
            }
            _ => false,
        }
    }

    pub fn column_entries(&self, x_bin: usize) -> f64 {
        self.counts.row(x_bin).sum()
    }

    /// Distribution of y values inside one x bin.
    pub fn projection_y(&self, x_bin: usize) -> Histogram1D {
        let mut hist = Histogram1D::new(self.y_axis);
        for (iy, c) in self.counts.row(x_bin).iter().enumerate() {
            hist.counts[iy] = *c;
        }
        hist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_find_is_half_open() {
        let axis = BinAxis::new(0.0, 1.0, 4);
        assert_eq!(axis.find(0.0), Some(0));
        assert_eq!(axis.find(0.25), Some(1));
        assert_eq!(axis.find(0.999), Some(3));
        assert_eq!(axis.find(1.0), None);
        assert_eq!(axis.find(-0.1), None);
        assert!((axis.center(1) - 0.375).abs() < 1e-12);
    }

    #[test]
    fn normalized_cumulative_ends_at_one() {
        let mut h = Histogram1D::new(BinAxis::new(0.0, 1.0, 10));
        for i in 0..100 {
            h.fill(i as f64 / 100.0, 1.0);
        }
        h.fill(1.5, 1.0);
        assert_eq!(h.overflow(), 1.0);
        h.normalize();
        let cdf = h.cumulative();
        assert!((cdf[9] - 1.0).abs() < 1e-12);
        assert!((cdf[4] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn mean_and_rms_of_symmetric_fill() {
        let mut h = Histogram1D::new(BinAxis::new(-2.0, 2.0, 4));
        h.fill(-1.5, 1.0);
        h.fill(1.5, 1.0);
        assert!(h.mean().unwrap().abs() < 1e-12);
        assert!((h.rms().unwrap() - 1.5).abs() < 1e-12);
    }

    #[test]
    fn projection_collects_one_column() {
        let mut h = Histogram2D::new(BinAxis::new(0.0, 2.0, 2), BinAxis::new(0.0, 10.0, 10));
        assert!(h.fill(0.5, 3.2));
        assert!(h.fill(0.5, 3.7));
        assert!(h.fill(1.5, 8.0));
        assert!(!h.fill(2.5, 1.0));
        let p = h.projection_y(0);
        assert_eq!(p.integral(), 2.0);
        assert_eq!(p.counts()[3], 2.0);
        assert_eq!(h.column_entries(1), 1.0);
    }
}
