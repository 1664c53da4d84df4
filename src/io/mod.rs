//! Input/output helpers.
//!
//! - digitizer events as JSON lines (`events`)
//! - per-detector pulse summaries as CSV (`summary`)
//! - template JSON read/write (`template`)

pub mod events;
pub mod summary;
pub mod template;

pub use events::*;
pub use summary::*;
pub use template::*;
