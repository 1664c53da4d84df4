//! Data sources that do not come from a digitizer.

pub mod synthetic;

pub use synthetic::*;
