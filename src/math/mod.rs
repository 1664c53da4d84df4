//! Mathematical utilities: least squares, interpolation, histogramming.

pub mod gauss;
pub mod histogram;
pub mod ols;
pub mod spline;

pub use gauss::*;
pub use histogram::*;
pub use ols::*;
pub use spline::*;
