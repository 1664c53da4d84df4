//! Per-event pulse processing: peak finding, fit ladders, auxiliary estimators.

pub mod estimators;
pub mod processor;

pub use estimators::*;
pub use processor::*;
