//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - raw inputs (`RawTrace`, `Polarity`)
//! - resolved per-channel configuration and engine tuning (`FitConfiguration`, `Tuning`)
//! - fit outputs (`FitResult`, `PulseSummary`)

pub mod types;

pub use types::*;
