//! Common types for the TrackCov environment abstraction.

use serde::{Deserialize, Serialize};

/// What kind of local recovery the numerical core performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryKind {
    /// A closed-form inverse hit an exactly zero determinant
    ZeroDeterminant,

    /// Cholesky decomposition failed; the block recursion was used instead
    CholeskyFailed,

    /// Eigenvalues were clipped to restore positive-definiteness
    PositiveDefiniteRepair,

    /// A lookup was queried outside its grid and clamped to the edge
    GridClamped,

    /// An iterative fit reached its iteration cap
    NonConvergence,
}

impl RecoveryKind {
    /// Returns a short, stable name for counters and logs.
    pub fn name(&self) -> &'static str {
        match self {
            RecoveryKind::ZeroDeterminant => "zero_determinant",
            RecoveryKind::CholeskyFailed => "cholesky_failed",
            RecoveryKind::PositiveDefiniteRepair => "positive_definite_repair",
            RecoveryKind::GridClamped => "grid_clamped",
            RecoveryKind::NonConvergence => "non_convergence",
        }
    }
}

impl std::fmt::Display for RecoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A single recovery reported by the numerical core.
///
/// Frequent recoveries usually point at a modeling problem upstream
/// (degenerate track sets, badly scaled covariances), so they are
/// reported rather than swallowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEvent {
    /// Kind of recovery
    pub kind: RecoveryKind,

    /// Where it happened (e.g. "vertex_fit.hessian", "covariance_grid")
    pub context: String,

    /// Matrix dimension involved (0 when not applicable)
    pub dimension: usize,

    /// Free-form detail for logs
    pub detail: String,
}

impl RecoveryEvent {
    /// Creates a new event without detail text.
    pub fn new(kind: RecoveryKind, context: impl Into<String>, dimension: usize) -> Self {
        Self {
            kind,
            context: context.into(),
            dimension,
            detail: String::new(),
        }
    }

    /// Attaches detail text.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}
