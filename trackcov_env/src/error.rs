//! Error types for the TrackCov environment abstraction.

use thiserror::Error;

/// Errors that can occur while loading detector tables and configuration.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Grid nodes or table contents are inconsistent
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),

    /// Table or configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Table or configuration content could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}

impl EnvError {
    /// Creates an invalid-grid error.
    pub fn invalid_grid(msg: impl Into<String>) -> Self {
        Self::InvalidGrid(msg.into())
    }

    /// Creates a parse error from anything displayable.
    pub fn parse(err: impl std::fmt::Display) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for EnvError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err)
    }
}
