//! Errors raised by the fitting API.
//!
//! Numerical trouble (singular matrices, failed Cholesky, non-convergence)
//! is never an error here; it is repaired and reported to a
//! `NumericsObserver`. Misuse of the API surfaces as a `VertexError`, and so
//! does a fit whose vertex never becomes finite.

use thiserror::Error;

/// Vertex fit and post-processing errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VertexError {
    #[error("Insufficient tracks: {found} present, {required} required")]
    InsufficientTracks { found: usize, required: usize },

    #[error("Invalid track index {index} (fit holds {count} tracks)")]
    InvalidTrackIndex { index: usize, count: usize },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Fit result unavailable")]
    NotFitted,

    #[error("Vertex not finite after {iterations} iterations")]
    NonFiniteVertex { iterations: usize },
}

impl VertexError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        VertexError::UnsupportedOperation(msg.into())
    }
}
