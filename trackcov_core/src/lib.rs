//! TrackCov Core - Vertex Fitting with Track-Parameter Steering
//!
//! This library fits the common origin of a set of charged and neutral
//! tracks and propagates every error to the derived physics quantities:
//! 1. **Helix Algebra**: conversions, trajectories and closed-form Jacobians
//!    of the `(D, phi0, C, z0, cotTheta)` parameterization
//! 2. **Regularized Linear Algebra**: symmetric inversion that repairs
//!    near-singular matrices instead of failing
//! 3. **Vertex Fit**: iterative re-linearized least squares with an optional
//!    Gaussian vertex constraint
//! 4. **Post-Processing**: momenta at the vertex, composite track and
//!    mass-constrained refits
//!
//! Detector response (resolution grids, acceptance, cluster counting) and
//! pull validation support the Monte-Carlo harness in `trackcov_sim`.

pub mod error;
pub mod trackcov_clusters;
pub mod trackcov_formats;
pub mod trackcov_grid;
pub mod trackcov_helix;
pub mod trackcov_linalg;
pub mod trackcov_more;
pub mod trackcov_vertex;
pub mod validation;

// Re-export key types for convenience
pub use error::VertexError;
pub use trackcov_clusters::{track_length_in_volume, ChamberConfig, ClusterCounter, GasMixture};
pub use trackcov_formats::LengthUnit;
pub use trackcov_grid::{smear_parameters, AcceptanceGrid, CovarianceGrid};
pub use trackcov_helix::{HelixParameters, TrackState};
pub use trackcov_linalg::{check_positive_definite, make_positive_definite, regularized_inverse};
pub use trackcov_more::{MassConstraint, MassFitConfig, MassFitReport, VertexMore, VertexMoreConfig};
pub use trackcov_vertex::{FitResult, FitStage, VertexConstraint, VertexFit, VertexFitConfig};
pub use validation::{PassCriteria, ValidationReport, ValidationSession};
