//! Error types for the sequencer.
//!
//! Classification outcomes (`immediate`, `queued`, `late`) are never errors.
//! The variants here cover construction-time configuration problems and the
//! one runtime condition a caller can observe: a completion whose settle side
//! went away before it produced a value.

use std::path::PathBuf;

/// Crate result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration value was present but unusable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration document could not be decoded.
    #[error("Invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settle side of a completion was dropped before settling.
    #[error("Completion abandoned before it was settled")]
    Abandoned,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error came from configuration loading or validation.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Json(_) | Self::Io { .. })
    }
}
