//! Error types for the validation harness.

use thiserror::Error;
use trackcov_core::VertexError;
use trackcov_env::EnvError;

/// Errors that abort a harness run.
///
/// A single event whose fit fails is not an error here: it is counted in
/// the pull report and the run continues.
#[derive(Debug, Error)]
pub enum SimError {
    /// Detector model could not be built or loaded
    #[error("detector model: {0}")]
    Detector(#[from] EnvError),

    /// Fitter rejected a configuration
    #[error("vertex fit: {0}")]
    Vertex(#[from] VertexError),

    /// Harness configuration is unusable
    #[error("invalid harness configuration: {0}")]
    InvalidConfig(String),

    /// Truth generation gave up (acceptance too tight)
    #[error("no accepted tracks after {attempts} attempts")]
    GenerationFailed { attempts: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        SimError::InvalidConfig(msg.into())
    }
}
