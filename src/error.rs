use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide error type.
///
/// Every variant maps onto a process exit code so the binary can report
/// failures the same way regardless of where they originate:
///
/// - `2`: configuration, input files, output files
/// - `3`: not enough usable data to produce a result
/// - `4`: numerical or internal failures
#[derive(Debug, Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("fit window [{start}, {end}) runs off a trace of length {trace_len}")]
    WindowOverrun {
        start: isize,
        end: isize,
        trace_len: usize,
    },

    #[error("failed to access '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {what}: {message}")]
    Format { what: &'static str, message: String },

    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("numerical failure: {0}")]
    Numerical(String),
}

impl AppError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn format(what: &'static str, message: impl ToString) -> Self {
        Self::Format {
            what,
            message: message.to_string(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::WindowOverrun { .. } | Self::Io { .. } | Self::Format { .. } => 2,
            Self::InsufficientData(_) => 3,
            Self::Numerical(_) => 4,
        }
    }
}
