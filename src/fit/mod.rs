//! Template fitting.
//!
//! Responsibilities:
//!
//! - fit one or more pulses against a channel template (separable least squares)
//! - provide the fixed guess ladders used by the pulse processor

pub mod fitter;
pub mod ladder;

pub use fitter::*;
pub use ladder::*;
