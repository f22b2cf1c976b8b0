//! Interchange formats for track parameters.
//!
//! - meters ↔ millimeters (`D`, `z0` scale by 10³, `C` by 10⁻³)
//! - ACTS-style `(D, z0, phi0, theta, q/p, time)` in mm and GeV
//! - ILC-style `(d0, phi0, omega, z0, tanLambda)` in mm
//!
//! Covariances are transported with the Jacobian of each map,
//! `Cov' = J Cov Jᵀ`.

use crate::trackcov_helix::{HelixParameters, C_LIGHT};
use nalgebra::{Matrix5, Matrix6, Vector5, Vector6};
use serde::{Deserialize, Serialize};

/// Variance assigned to the undefined ACTS time parameter.
pub const ACTS_TIME_VARIANCE: f64 = 0.1;

/// Length unit of a parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LengthUnit {
    #[default]
    Meters,
    Millimeters,
}

impl LengthUnit {
    /// Multiply a length in this unit by this to get meters.
    pub fn to_meters(&self) -> f64 {
        match self {
            LengthUnit::Meters => 1.0,
            LengthUnit::Millimeters => 1.0e-3,
        }
    }
}

fn mm_scale() -> Vector5<f64> {
    Vector5::new(1.0e3, 1.0, 1.0e-3, 1.0e3, 1.0)
}

/// Parameters in meters → millimeters.
pub fn params_to_mm(par: &HelixParameters) -> HelixParameters {
    par.component_mul(&mm_scale())
}

/// Parameters in millimeters → meters.
pub fn params_from_mm(par: &HelixParameters) -> HelixParameters {
    par.component_div(&mm_scale())
}

/// Covariance in meters → millimeters.
pub fn covariance_to_mm(cov: &Matrix5<f64>) -> Matrix5<f64> {
    let j = Matrix5::from_diagonal(&mm_scale());
    j * cov * j
}

/// Covariance in millimeters → meters.
pub fn covariance_from_mm(cov: &Matrix5<f64>) -> Matrix5<f64> {
    let j = Matrix5::from_diagonal(&mm_scale().map(|v| 1.0 / v));
    j * cov * j
}

/// Parameters → ACTS `(D, z0, phi0, theta, q/p, time)`.
///
/// Time is not measured and is set to zero.
pub fn params_to_acts(par: &HelixParameters, bz: f64) -> Vector6<f64> {
    let b = -C_LIGHT * bz / 2.0;
    let ct = par[4];
    Vector6::new(
        1.0e3 * par[0],
        1.0e3 * par[3],
        par[1],
        1.0f64.atan2(ct),
        par[2] / (b * (1.0 + ct * ct).sqrt()),
        0.0,
    )
}

/// Jacobian of [`params_to_acts`] restricted to its first five outputs.
pub fn acts_jacobian(par: &HelixParameters, bz: f64) -> Matrix5<f64> {
    let b = -C_LIGHT * bz / 2.0;
    let (c, ct) = (par[2], par[4]);
    let norm = 1.0 + ct * ct;
    let mut j = Matrix5::zeros();
    j[(0, 0)] = 1.0e3;
    j[(1, 3)] = 1.0e3;
    j[(2, 1)] = 1.0;
    j[(3, 4)] = -1.0 / norm;
    j[(4, 2)] = 1.0 / (b * norm.sqrt());
    j[(4, 4)] = -c * ct / (b * norm.powf(1.5));
    j
}

/// Covariance → ACTS 6×6 covariance.
pub fn covariance_to_acts(par: &HelixParameters, cov: &Matrix5<f64>, bz: f64) -> Matrix6<f64> {
    let j = acts_jacobian(par, bz);
    let transported = j * cov * j.transpose();
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<5, 5>(0, 0).copy_from(&transported);
    out[(5, 5)] = ACTS_TIME_VARIANCE;
    out
}

fn ilc_scale() -> Vector5<f64> {
    Vector5::new(1.0e3, 1.0, -2.0e-3, 1.0e3, 1.0)
}

/// Parameters → ILC `(d0, phi0, omega, z0, tanLambda)`.
pub fn params_to_ilc(par: &HelixParameters) -> Vector5<f64> {
    par.component_mul(&ilc_scale())
}

/// Covariance → ILC covariance.
pub fn covariance_to_ilc(cov: &Matrix5<f64>) -> Matrix5<f64> {
    let j = Matrix5::from_diagonal(&ilc_scale());
    j * cov * j
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> (HelixParameters, Matrix5<f64>) {
        let par = Vector5::new(1.0e-4, 0.5, -0.003, 2.0e-4, 0.7);
        let mut cov = Matrix5::from_diagonal(&Vector5::new(1e-10, 1e-8, 1e-12, 1e-10, 1e-8));
        cov[(0, 1)] = 2e-10;
        cov[(1, 0)] = 2e-10;
        (par, cov)
    }

    #[test]
    fn test_mm_round_trip() {
        let (par, cov) = sample();
        assert_relative_eq!(params_from_mm(&params_to_mm(&par)), par, epsilon = 1e-15);
        assert_relative_eq!(covariance_from_mm(&covariance_to_mm(&cov)), cov, epsilon = 1e-20);
        assert_relative_eq!(covariance_to_mm(&cov)[(0, 0)], 1e-4, epsilon = 1e-16);
    }

    #[test]
    fn test_acts_jacobian_matches_numeric() {
        let (par, _) = sample();
        let bz = 2.0;
        let j = acts_jacobian(&par, bz);
        for k in 0..5 {
            let h = 1.0e-6 * par[k].abs().max(1.0e-3);
            let mut plus = par;
            let mut minus = par;
            plus[k] += h;
            minus[k] -= h;
            let diff = (params_to_acts(&plus, bz) - params_to_acts(&minus, bz)) / (2.0 * h);
            for row in 0..5 {
                assert_relative_eq!(j[(row, k)], diff[row], epsilon = 1e-4, max_relative = 1e-6);
            }
        }
    }

    #[test]
    fn test_acts_q_over_p() {
        let (par, cov) = sample();
        let bz = 2.0;
        let acts = params_to_acts(&par, bz);
        // C < 0 with Bz > 0 is a positive track
        let p = crate::trackcov_helix::momentum_from_params(&par, bz).norm();
        assert_relative_eq!(acts[4], 1.0 / p, epsilon = 1e-12);
        let cov6 = covariance_to_acts(&par, &cov, bz);
        assert_relative_eq!(cov6[(5, 5)], ACTS_TIME_VARIANCE);
        assert_relative_eq!(cov6, cov6.transpose(), epsilon = 1e-20);
    }

    #[test]
    fn test_ilc_sign_of_omega() {
        let (par, cov) = sample();
        let ilc = params_to_ilc(&par);
        assert_relative_eq!(ilc[2], 6.0e-6, epsilon = 1e-18);
        assert_relative_eq!(covariance_to_ilc(&cov)[(2, 2)], 4.0e-18, epsilon = 1e-30);
    }
}
