//! Detector lookup contracts.
//!
//! The resolution model and the acceptance model live outside the vertex
//! fitter. Anything that can answer these two questions can drive the
//! Monte-Carlo front end.

use nalgebra::Matrix5;

/// Supplies the 5×5 helix-parameter covariance of a charged track.
pub trait CovarianceLookup {
    /// Covariance of `(D, phi0, C, z0, cotTheta)` for a track of transverse
    /// momentum `pt` (GeV) at polar angle `angle_deg` (degrees).
    ///
    /// Must not fail for out-of-grid inputs: implementations clamp to the
    /// nearest grid edge and report it. The result is symmetric and
    /// positive-definite.
    fn covariance(&self, pt: f64, angle_deg: f64) -> Matrix5<f64>;
}

/// Supplies the number of measurement layers crossed by a track.
pub trait AcceptanceLookup {
    /// Number of layers hit at transverse momentum `pt` (GeV) and polar
    /// angle `angle_deg` (degrees). Out-of-grid inputs are clamped.
    fn hit_count(&self, pt: f64, angle_deg: f64) -> i32;
}
