//! `pulse-fit` library crate.
//!
//! The binary (`pulsefit`) is a thin wrapper around this library so that:
//!
//! - template building and pulse fitting are testable without spawning processes
//! - the processing core can be embedded by other readout front-ends

pub mod app;
pub mod cli;
pub mod config;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod pulse;
pub mod report;
pub mod template;
