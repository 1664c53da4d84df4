//! Pulse templates: the shape model and its construction from calibration data.

pub mod builder;
pub mod shape;

pub use builder::*;
pub use shape::*;
