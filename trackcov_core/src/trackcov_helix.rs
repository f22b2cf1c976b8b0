//! The "HELIX" Engine - Track Parameter Algebra
//!
//! Stateless conversions between (position, momentum, charge) and the
//! 5-parameter track representation, plus the closed-form Jacobians the
//! vertex fitter and the post-processor are built on.
//!
//! Charged tracks use `(D, phi0, C, z0, cotTheta)`:
//! - `D`: signed transverse impact parameter
//! - `phi0`: azimuth of the momentum at the point of closest approach
//! - `C`: signed half-curvature, `C = -Q·Bz·c / (2·pt)`
//! - `z0`: longitudinal position at closest approach
//! - `cotTheta`: cotangent of the polar angle
//!
//! Neutral tracks replace `C` with `pt` and move along straight lines.
//! The phase `s` is the turning angle for charged tracks (`s/(2C)` is the
//! transverse arc length) and the transverse path length for neutrals.
//! Units are meters, GeV and Tesla.

use nalgebra::{Matrix3x5, Matrix5, Matrix5x6, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Speed of light in GeV/(T·m) per unit charge.
pub const C_LIGHT: f64 = 0.299792458;

/// Minimum magnitude of `cos(s/2)` (or of the equivalent neutral term)
/// when dividing near tangency to a cylinder.
pub const TANGENCY_FLOOR: f64 = 0.01;

/// Minimum magnitude of `cotTheta` when solving for a z-plane crossing.
pub const LONGITUDINAL_FLOOR: f64 = 0.01;

/// Below this pt (GeV) the impact parameter uses the direct form.
const DIRECT_D_PT_LIMIT: f64 = 10.0;

/// The 5-parameter track representation.
pub type HelixParameters = Vector5<f64>;

// ============================================================================
// TRACK STATE
// ============================================================================

/// Track parameters with their covariance and a charged/neutral tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    /// `(D, phi0, C, z0, cotTheta)` or `(D, phi0, pt, z0, cotTheta)`
    pub params: HelixParameters,

    /// Symmetric 5×5 covariance of `params`
    pub covariance: Matrix5<f64>,

    /// Helix (true) or straight line (false)
    pub charged: bool,
}

impl TrackState {
    /// Creates a charged track.
    pub fn charged(params: HelixParameters, covariance: Matrix5<f64>) -> Self {
        Self { params, covariance, charged: true }
    }

    /// Creates a neutral (straight-line) track.
    pub fn neutral(params: HelixParameters, covariance: Matrix5<f64>) -> Self {
        Self { params, covariance, charged: false }
    }

    /// Point of closest approach to the z axis.
    pub fn reference_point(&self) -> Vector3<f64> {
        position_from_params(&self.params)
    }

    /// Position at phase `s`.
    pub fn position_at(&self, s: f64) -> Vector3<f64> {
        if self.charged {
            trajectory_position(&self.params, s)
        } else {
            trajectory_position_neutral(&self.params, s)
        }
    }

    /// Tangent `dx/ds` at phase `s`.
    pub fn direction_at(&self, s: f64) -> Vector3<f64> {
        if self.charged {
            d_position_d_phase(&self.params, s)
        } else {
            d_position_d_phase_neutral(&self.params, s)
        }
    }

    /// Jacobian `dx/dparams` at fixed phase `s`.
    pub fn d_position_d_params(&self, s: f64) -> Matrix3x5<f64> {
        if self.charged {
            d_position_d_params(&self.params, s)
        } else {
            d_position_d_params_neutral(&self.params, s)
        }
    }

    /// Phase where the track crosses the cylinder of radius `r`.
    pub fn phase_at_radius(&self, r: f64) -> f64 {
        if self.charged {
            phase_at_radius(&self.params, r)
        } else {
            phase_at_radius_neutral(&self.params, r)
        }
    }

    /// True when a cylinder of radius `r` is crossed on the way out.
    pub fn reaches_radius(&self, r: f64) -> bool {
        let d = self.params[0].abs();
        if self.charged {
            d < r && r < max_radius(&self.params)
        } else {
            d < r
        }
    }

    /// Momentum at phase `s` in a field `bz`.
    pub fn momentum_at(&self, s: f64, bz: f64) -> Vector3<f64> {
        if self.charged {
            momentum_at_phase(&self.params, s, bz)
        } else {
            momentum_from_params_neutral(&self.params)
        }
    }
}

// ============================================================================
// PHASE HELPERS
// ============================================================================

/// Wraps an angle into `(-π, π]`.
pub fn wrap_phase(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(TAU) - PI;
    if wrapped <= -PI {
        wrapped + TAU
    } else {
        wrapped
    }
}

fn floor_magnitude(value: f64, floor: f64) -> f64 {
    if value.abs() < floor {
        if value < 0.0 {
            -floor
        } else {
            floor
        }
    } else {
        value
    }
}

// ============================================================================
// CONVERSIONS (CHARGED)
// ============================================================================

/// Helix parameters of a particle at `x` with momentum `p`.
///
/// Uses the direct impact-parameter form below 10 GeV and the rearranged
/// form above it, and derives `z0` from the turning angle rather than from
/// an arcsine; both choices avoid cancellation.
pub fn params_from_position_momentum(
    x: &Vector3<f64>,
    p: &Vector3<f64>,
    charge: f64,
    bz: f64,
) -> HelixParameters {
    let a = -charge * bz * C_LIGHT;
    let pt = p.x.hypot(p.y);
    let r2 = x.x * x.x + x.y * x.y;
    let cross = x.x * p.y - x.y * p.x;
    let t = (pt * pt - 2.0 * a * cross + a * a * r2).sqrt();

    let c = a / (2.0 * pt);
    let phi0 = (p.y - a * x.x).atan2(p.x + a * x.y);
    let d = if pt < DIRECT_D_PT_LIMIT {
        (t - pt) / a
    } else {
        (-2.0 * cross + a * r2) / (t + pt)
    };
    let cot_theta = p.z / pt;
    let s = wrap_phase(p.y.atan2(p.x) - phi0);
    let z0 = x.z - cot_theta * s / (2.0 * c);

    Vector5::new(d, phi0, c, z0, cot_theta)
}

/// Point of closest approach to the z axis (charged or neutral).
pub fn position_from_params(par: &HelixParameters) -> Vector3<f64> {
    let (d, phi0, z0) = (par[0], par[1], par[3]);
    Vector3::new(-d * phi0.sin(), d * phi0.cos(), z0)
}

/// Momentum at the point of closest approach.
pub fn momentum_from_params(par: &HelixParameters, bz: f64) -> Vector3<f64> {
    momentum_at_phase(par, 0.0, bz)
}

/// Momentum at phase `s` along the helix.
pub fn momentum_at_phase(par: &HelixParameters, s: f64, bz: f64) -> Vector3<f64> {
    let pt = transverse_momentum(par, bz);
    let phi = par[1] + s;
    Vector3::new(pt * phi.cos(), pt * phi.sin(), pt * par[4])
}

/// Transverse momentum `|Bz·c / (2C)|`.
pub fn transverse_momentum(par: &HelixParameters, bz: f64) -> f64 {
    (bz * C_LIGHT / (2.0 * par[2])).abs()
}

/// Charge sign, `sign(-C·Bz)`.
pub fn charge_from_params(par: &HelixParameters, bz: f64) -> f64 {
    if -par[2] * bz >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

/// Largest transverse radius the helix reaches, `|D + 1/C|`.
pub fn max_radius(par: &HelixParameters) -> f64 {
    (par[0] + 1.0 / par[2]).abs()
}

// ============================================================================
// CONVERSIONS (NEUTRAL)
// ============================================================================

/// Straight-line parameters `(D, phi0, pt, z0, cotTheta)`.
pub fn params_from_position_momentum_neutral(x: &Vector3<f64>, p: &Vector3<f64>) -> HelixParameters {
    let pt = p.x.hypot(p.y);
    let phi0 = p.y.atan2(p.x);
    let (sin, cos) = phi0.sin_cos();
    let cot_theta = p.z / pt;
    let d = -x.x * sin + x.y * cos;
    let s = x.x * cos + x.y * sin;
    let z0 = x.z - cot_theta * s;
    Vector5::new(d, phi0, pt, z0, cot_theta)
}

/// Momentum of a neutral track.
pub fn momentum_from_params_neutral(par: &HelixParameters) -> Vector3<f64> {
    let (pt, phi0) = (par[2], par[1]);
    Vector3::new(pt * phi0.cos(), pt * phi0.sin(), pt * par[4])
}

// ============================================================================
// TRAJECTORIES
// ============================================================================

/// Point on the helix at phase `s`.
pub fn trajectory_position(par: &HelixParameters, s: f64) -> Vector3<f64> {
    let (d, phi0, c, z0, ct) = (par[0], par[1], par[2], par[3], par[4]);
    let (sin0, cos0) = phi0.sin_cos();
    let (sin1, cos1) = (phi0 + s).sin_cos();
    Vector3::new(
        -d * sin0 + (sin1 - sin0) / (2.0 * c),
        d * cos0 - (cos1 - cos0) / (2.0 * c),
        z0 + ct * s / (2.0 * c),
    )
}

/// Point on a neutral line at transverse path length `s`.
pub fn trajectory_position_neutral(par: &HelixParameters, s: f64) -> Vector3<f64> {
    let (d, phi0, z0, ct) = (par[0], par[1], par[3], par[4]);
    let (sin, cos) = phi0.sin_cos();
    Vector3::new(-d * sin + s * cos, d * cos + s * sin, z0 + ct * s)
}

// ============================================================================
// DERIVATIVES
// ============================================================================

/// `dx/dparams` at fixed phase (3×5).
pub fn d_position_d_params(par: &HelixParameters, s: f64) -> Matrix3x5<f64> {
    let (d, phi0, c, ct) = (par[0], par[1], par[2], par[4]);
    let (sin0, cos0) = phi0.sin_cos();
    let (sin1, cos1) = (phi0 + s).sin_cos();
    let c2 = 2.0 * c;

    let mut a = Matrix3x5::zeros();
    // D
    a[(0, 0)] = -sin0;
    a[(1, 0)] = cos0;
    // phi0
    a[(0, 1)] = -d * cos0 + (cos1 - cos0) / c2;
    a[(1, 1)] = -d * sin0 + (sin1 - sin0) / c2;
    // C
    a[(0, 2)] = -(sin1 - sin0) / (c2 * c);
    a[(1, 2)] = (cos1 - cos0) / (c2 * c);
    a[(2, 2)] = -ct * s / (c2 * c);
    // z0
    a[(2, 3)] = 1.0;
    // cotTheta
    a[(2, 4)] = s / c2;
    a
}

/// `dx/ds` along the helix.
pub fn d_position_d_phase(par: &HelixParameters, s: f64) -> Vector3<f64> {
    let (phi0, c, ct) = (par[1], par[2], par[4]);
    let (sin1, cos1) = (phi0 + s).sin_cos();
    Vector3::new(cos1, sin1, ct) / (2.0 * c)
}

/// `dx/dparams` of a neutral line at fixed path length (3×5).
pub fn d_position_d_params_neutral(par: &HelixParameters, s: f64) -> Matrix3x5<f64> {
    let (d, phi0) = (par[0], par[1]);
    let (sin, cos) = phi0.sin_cos();
    let mut a = Matrix3x5::zeros();
    a[(0, 0)] = -sin;
    a[(1, 0)] = cos;
    a[(0, 1)] = -d * cos - s * sin;
    a[(1, 1)] = -d * sin + s * cos;
    a[(2, 3)] = 1.0;
    a[(2, 4)] = s;
    a
}

/// `dx/ds` along a neutral line.
pub fn d_position_d_phase_neutral(par: &HelixParameters, _s: f64) -> Vector3<f64> {
    let (sin, cos) = par[1].sin_cos();
    Vector3::new(cos, sin, par[4])
}

/// Phase at which the helix crosses the cylinder of radius `r`.
///
/// `s = 2·asin(C·sqrt((r² - D²)/(1 + 2CD)))`, with the argument clamped
/// to the reachable range.
pub fn phase_at_radius(par: &HelixParameters, r: f64) -> f64 {
    let (d, c) = (par[0], par[2]);
    let g = (r * r - d * d).max(0.0) / (1.0 + 2.0 * c * d);
    let u = (c * g.max(0.0).sqrt()).clamp(-1.0, 1.0);
    2.0 * u.asin()
}

/// Path length at which a neutral line crosses the cylinder of radius `r`.
pub fn phase_at_radius_neutral(par: &HelixParameters, r: f64) -> f64 {
    (r * r - par[0] * par[0]).max(0.0).sqrt()
}

/// Phase at which the helix crosses the plane `z`.
pub fn phase_at_z(par: &HelixParameters, z: f64) -> f64 {
    let ct = floor_magnitude(par[4], LONGITUDINAL_FLOOR);
    2.0 * par[2] * (z - par[3]) / ct
}

/// Path length at which a neutral line crosses the plane `z`.
pub fn phase_at_z_neutral(par: &HelixParameters, z: f64) -> f64 {
    let ct = floor_magnitude(par[4], LONGITUDINAL_FLOOR);
    (z - par[3]) / ct
}

/// Phase of the helix point whose transverse projection is closest to `x`.
pub fn phase_of_point(par: &HelixParameters, x: &Vector3<f64>) -> f64 {
    let (d, phi0, c) = (par[0], par[1], par[2]);
    let rc = d + 1.0 / (2.0 * c);
    let xc = -rc * phi0.sin();
    let yc = rc * phi0.cos();
    let angle = (2.0 * c * (x.x - xc)).atan2(-2.0 * c * (x.y - yc));
    wrap_phase(angle - phi0)
}

/// `ds/dparams` at fixed radius `r`.
///
/// The `cos(s/2)` factor is floored at [`TANGENCY_FLOOR`] so tracks
/// tangent to the cylinder do not blow up.
pub fn d_phase_d_params_at_radius(par: &HelixParameters, r: f64) -> Vector5<f64> {
    let (d, c) = (par[0], par[2]);
    let den = 1.0 + 2.0 * c * d;
    let g = (r * r - d * d).max(0.0) / den;
    let sg = g.max(0.0).sqrt().max(1.0e-12);
    let u = (c * sg).clamp(-1.0, 1.0);

    let dg_dd = -2.0 * (d + c * d * d + c * r * r) / (den * den);
    let dg_dc = -2.0 * d * (r * r - d * d) / (den * den);
    let du_dd = c / (2.0 * sg) * dg_dd;
    let du_dc = sg + c / (2.0 * sg) * dg_dc;

    let cos_half = (1.0 - u * u).max(0.0).sqrt().max(TANGENCY_FLOOR);
    let k = 2.0 / cos_half;
    Vector5::new(k * du_dd, 0.0, k * du_dc, 0.0, 0.0)
}

/// `ds/dparams` at fixed plane `z`.
pub fn d_phase_d_params_at_z(par: &HelixParameters, z: f64) -> Vector5<f64> {
    let (c, z0) = (par[2], par[3]);
    let ct = floor_magnitude(par[4], LONGITUDINAL_FLOOR);
    let s = 2.0 * c * (z - z0) / ct;
    Vector5::new(0.0, 0.0, 2.0 * (z - z0) / ct, -2.0 * c / ct, -s / ct)
}

/// `ds/dparams` of a neutral line at fixed radius `r`.
pub fn d_phase_d_params_at_radius_neutral(par: &HelixParameters, r: f64) -> Vector5<f64> {
    let d = par[0];
    let root = (r * r - d * d).max(0.0).sqrt().max(TANGENCY_FLOOR * r.abs());
    Vector5::new(-d / root, 0.0, 0.0, 0.0, 0.0)
}

/// `ds/dparams` of a neutral line at fixed plane `z`.
pub fn d_phase_d_params_at_z_neutral(par: &HelixParameters, z: f64) -> Vector5<f64> {
    let ct = floor_magnitude(par[4], LONGITUDINAL_FLOOR);
    let s = (z - par[3]) / ct;
    Vector5::new(0.0, 0.0, 0.0, -1.0 / ct, -s / ct)
}

/// Total derivative of the crossing point with a surface, `A + t·(ds/dpar)ᵀ`.
fn crossing_jacobian(par: &HelixParameters, s: f64, ds: &Vector5<f64>) -> (Vector3<f64>, Matrix3x5<f64>) {
    let x = trajectory_position(par, s);
    let j = d_position_d_params(par, s) + d_position_d_phase(par, s) * ds.transpose();
    (x, j)
}

/// `d(r·phi)/dparams` of the crossing with the cylinder of radius `r`.
pub fn d_rphi_d_params_at_radius(par: &HelixParameters, r: f64) -> Vector5<f64> {
    let s = phase_at_radius(par, r);
    let ds = d_phase_d_params_at_radius(par, r);
    let (x, j) = crossing_jacobian(par, s, &ds);
    let rho = x.x.hypot(x.y).max(f64::MIN_POSITIVE);
    ((j.row(1) * x.x - j.row(0) * x.y) / rho).transpose()
}

/// `dz/dparams` of the crossing with the cylinder of radius `r`.
pub fn d_z_d_params_at_radius(par: &HelixParameters, r: f64) -> Vector5<f64> {
    let s = phase_at_radius(par, r);
    let ds = d_phase_d_params_at_radius(par, r);
    let (_, j) = crossing_jacobian(par, s, &ds);
    j.row(2).transpose()
}

/// `d(r·phi)/dparams` of the crossing with the plane `z`.
pub fn d_rphi_d_params_at_z(par: &HelixParameters, z: f64) -> Vector5<f64> {
    let s = phase_at_z(par, z);
    let ds = d_phase_d_params_at_z(par, z);
    let (x, j) = crossing_jacobian(par, s, &ds);
    let rho = x.x.hypot(x.y).max(f64::MIN_POSITIVE);
    ((j.row(1) * x.x - j.row(0) * x.y) / rho).transpose()
}

/// `dr/dparams` of the crossing with the plane `z`.
pub fn d_r_d_params_at_z(par: &HelixParameters, z: f64) -> Vector5<f64> {
    let s = phase_at_z(par, z);
    let ds = d_phase_d_params_at_z(par, z);
    let (x, j) = crossing_jacobian(par, s, &ds);
    let rho = x.x.hypot(x.y).max(f64::MIN_POSITIVE);
    ((j.row(0) * x.x + j.row(1) * x.y) / rho).transpose()
}

/// Jacobian of [`params_from_position_momentum`] w.r.t. `(x, y, z, px, py, pz)`.
pub fn d_params_d_position_momentum(
    x: &Vector3<f64>,
    p: &Vector3<f64>,
    charge: f64,
    bz: f64,
) -> Matrix5x6<f64> {
    let a = -charge * bz * C_LIGHT;
    let pt = p.x.hypot(p.y);
    let pt3 = pt * pt * pt;
    let r2 = x.x * x.x + x.y * x.y;
    let cross = x.x * p.y - x.y * p.x;
    let t = (pt * pt - 2.0 * a * cross + a * a * r2).sqrt();
    let t2 = t * t;
    let u = p.x + a * x.y;
    let v = p.y - a * x.x;

    let par = params_from_position_momentum(x, p, charge, bz);
    let (c, ct) = (par[2], par[4]);
    let s = wrap_phase(p.y.atan2(p.x) - par[1]);

    // Intermediate gradients over (x, y, z, px, py, pz)
    let dt = [
        a * (-p.y + a * x.x) / t,
        a * (p.x + a * x.y) / t,
        0.0,
        u / t,
        v / t,
        0.0,
    ];
    let dpt = [0.0, 0.0, 0.0, p.x / pt, p.y / pt, 0.0];
    let dphi0 = [-a * u / t2, -a * v / t2, 0.0, -v / t2, u / t2, 0.0];
    let dc = [0.0, 0.0, 0.0, -a * p.x / (2.0 * pt3), -a * p.y / (2.0 * pt3), 0.0];
    let dct = [0.0, 0.0, 0.0, -p.z * p.x / pt3, -p.z * p.y / pt3, 1.0 / pt];
    let dpsi = [0.0, 0.0, 0.0, -p.y / (pt * pt), p.x / (pt * pt), 0.0];
    let dz = [0.0, 0.0, 1.0, 0.0, 0.0, 0.0];

    let mut jac = Matrix5x6::zeros();
    for k in 0..6 {
        let ds = dpsi[k] - dphi0[k];
        jac[(0, k)] = (dt[k] - dpt[k]) / a;
        jac[(1, k)] = dphi0[k];
        jac[(2, k)] = dc[k];
        jac[(3, k)] = dz[k] - s / (2.0 * c) * dct[k] - ct / (2.0 * c) * ds
            + ct * s / (2.0 * c * c) * dc[k];
        jac[(4, k)] = dct[k];
    }
    jac
}

// ============================================================================
// LINE DISTANCE
// ============================================================================

/// Closest approach between two straight lines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineApproach {
    /// Parameter along the first line
    pub sx: f64,
    /// Parameter along the second line
    pub sy: f64,
    /// Distance between the two closest points
    pub distance: f64,
}

/// Closest approach of `x0 + sx·dirx` and `y0 + sy·diry`.
///
/// Parallel lines return `sx = 0` and the matching foot on the second line.
pub fn line_distance(
    x0: &Vector3<f64>,
    y0: &Vector3<f64>,
    dirx: &Vector3<f64>,
    diry: &Vector3<f64>,
) -> LineApproach {
    let w = x0 - y0;
    let a = dirx.dot(dirx);
    let b = dirx.dot(diry);
    let c = diry.dot(diry);
    let d = dirx.dot(&w);
    let e = diry.dot(&w);
    let den = a * c - b * b;

    let (sx, sy) = if den.abs() > 1.0e-14 * a * c {
        ((b * e - c * d) / den, (a * e - b * d) / den)
    } else {
        (0.0, if c > 0.0 { e / c } else { 0.0 })
    };
    let distance = (w + dirx * sx - diry * sy).norm();
    LineApproach { sx, sy, distance }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    const BZ: f64 = 2.0;

    fn numeric_jacobian<F: Fn(&HelixParameters) -> Vector3<f64>>(par: &HelixParameters, f: F) -> Matrix3x5<f64> {
        let mut jac = Matrix3x5::zeros();
        for k in 0..5 {
            let h = 1.0e-6 * par[k].abs().max(1.0e-2);
            let mut plus = *par;
            let mut minus = *par;
            plus[k] += h;
            minus[k] -= h;
            let col = (f(&plus) - f(&minus)) / (2.0 * h);
            jac.set_column(k, &col);
        }
        jac
    }

    #[test]
    fn test_round_trip_point_on_helix() {
        let x = Vector3::new(0.012, -0.034, 0.05);
        let p = Vector3::new(1.2, 0.7, 0.4);
        let par = params_from_position_momentum(&x, &p, 1.0, BZ);

        let s = phase_of_point(&par, &x);
        assert_relative_eq!(trajectory_position(&par, s), x, epsilon = 1e-10);
        assert_relative_eq!(momentum_at_phase(&par, s, BZ), p, epsilon = 1e-10);
        assert_relative_eq!(position_from_params(&par), trajectory_position(&par, 0.0), epsilon = 1e-14);
        assert_eq!(charge_from_params(&par, BZ), 1.0);
    }

    #[test]
    fn test_round_trip_at_closest_approach() {
        let par = Vector5::new(0.001, 0.3, -0.002, 0.01, 0.5);
        let x = position_from_params(&par);
        let p = momentum_from_params(&par, BZ);
        let back = params_from_position_momentum(&x, &p, charge_from_params(&par, BZ), BZ);
        assert_relative_eq!(back, par, epsilon = 1e-10);
    }

    #[test]
    fn test_high_pt_branch_matches_direct_form() {
        let x = Vector3::new(0.002, 0.003, 0.0);
        let p = Vector3::new(30.0, 20.0, 5.0);
        let par = params_from_position_momentum(&x, &p, -1.0, BZ);
        // Direct form evaluated by hand
        let a = BZ * C_LIGHT;
        let pt = p.x.hypot(p.y);
        let cross = x.x * p.y - x.y * p.x;
        let t = (pt * pt - 2.0 * a * cross + a * a * (x.x * x.x + x.y * x.y)).sqrt();
        assert_relative_eq!(par[0], (t - pt) / a, epsilon = 1e-9);
    }

    #[test]
    fn test_neutral_round_trip() {
        let x = Vector3::new(0.1, 0.2, 0.3);
        let p = Vector3::new(-0.5, 1.5, 2.0);
        let par = params_from_position_momentum_neutral(&x, &p);
        let s = x.x * par[1].cos() + x.y * par[1].sin();
        assert_relative_eq!(trajectory_position_neutral(&par, s), x, epsilon = 1e-12);
        assert_relative_eq!(momentum_from_params_neutral(&par), p, epsilon = 1e-12);
    }

    #[test]
    fn test_position_jacobian_matches_numeric() {
        let par = Vector5::new(0.002, 0.7, 0.05, -0.01, 0.8);
        let s = 0.4;
        let analytic = d_position_d_params(&par, s);
        let numeric = numeric_jacobian(&par, |p| trajectory_position(p, s));
        assert_relative_eq!(analytic, numeric, epsilon = 1e-5);
        let neutral = d_position_d_params_neutral(&par, s);
        let numeric_n = numeric_jacobian(&par, |p| trajectory_position_neutral(p, s));
        assert_relative_eq!(neutral, numeric_n, epsilon = 1e-5);
    }

    #[test]
    fn test_phase_derivative_matches_numeric() {
        let par = Vector5::new(0.002, 0.7, 0.3, -0.01, 0.8);
        let s = 0.2;
        let h = 1.0e-7;
        let numeric = (trajectory_position(&par, s + h) - trajectory_position(&par, s - h)) / (2.0 * h);
        assert_relative_eq!(d_position_d_phase(&par, s), numeric, epsilon = 1e-6);
    }

    #[test]
    fn test_phase_at_radius_and_derivative() {
        let par = Vector5::new(0.001, 0.2, 0.2, 0.0, 1.0);
        let r = 0.5;
        let s = phase_at_radius(&par, r);
        let x = trajectory_position(&par, s);
        assert_relative_eq!(x.x.hypot(x.y), r, epsilon = 1e-10);

        let grad = d_phase_d_params_at_radius(&par, r);
        for k in [0usize, 2] {
            let h = 1.0e-7;
            let mut plus = par;
            let mut minus = par;
            plus[k] += h;
            minus[k] -= h;
            let numeric = (phase_at_radius(&plus, r) - phase_at_radius(&minus, r)) / (2.0 * h);
            assert_relative_eq!(grad[k], numeric, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_phase_at_z_round_trip() {
        let par = Vector5::new(0.0, 0.1, -0.1, 0.02, 1.5);
        let s = phase_at_z(&par, 0.8);
        assert_relative_eq!(trajectory_position(&par, s).z, 0.8, epsilon = 1e-12);
        let sn = phase_at_z_neutral(&par, 0.8);
        assert_relative_eq!(trajectory_position_neutral(&par, sn).z, 0.8, epsilon = 1e-12);
    }

    #[test]
    fn test_tangency_clamp_is_finite() {
        let par = Vector5::new(0.0, 0.0, 0.5, 0.0, 1.0);
        // Maximum radius of this helix is 2 m: ask exactly there
        let grad = d_phase_d_params_at_radius(&par, max_radius(&par));
        assert!(grad.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_measurement_derivatives_match_numeric() {
        let par = Vector5::new(0.001, 0.4, 0.1, 0.005, 0.6);
        let r = 0.8;
        let rphi = |p: &HelixParameters| {
            let x = trajectory_position(p, phase_at_radius(p, r));
            r * x.y.atan2(x.x)
        };
        let z_at_r = |p: &HelixParameters| trajectory_position(p, phase_at_radius(p, r)).z;
        let analytic = d_rphi_d_params_at_radius(&par, r);
        let analytic_z = d_z_d_params_at_radius(&par, r);
        for k in 0..5 {
            let h = 1.0e-7;
            let mut plus = par;
            let mut minus = par;
            plus[k] += h;
            minus[k] -= h;
            assert_relative_eq!(analytic[k], (rphi(&plus) - rphi(&minus)) / (2.0 * h), epsilon = 1e-4);
            assert_relative_eq!(analytic_z[k], (z_at_r(&plus) - z_at_r(&minus)) / (2.0 * h), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_params_jacobian_matches_numeric() {
        let x = Vector3::new(0.01, -0.02, 0.03);
        let p = Vector3::new(0.8, 1.1, -0.3);
        let q = -1.0;
        let analytic = d_params_d_position_momentum(&x, &p, q, BZ);
        for k in 0..6 {
            let h = 1.0e-7;
            let mut xp = x;
            let mut xm = x;
            let mut pp = p;
            let mut pm = p;
            if k < 3 {
                xp[k] += h;
                xm[k] -= h;
            } else {
                pp[k - 3] += h;
                pm[k - 3] -= h;
            }
            let numeric = (params_from_position_momentum(&xp, &pp, q, BZ)
                - params_from_position_momentum(&xm, &pm, q, BZ))
                / (2.0 * h);
            for row in 0..5 {
                assert_relative_eq!(analytic[(row, k)], numeric[row], epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_line_distance_skew_lines() {
        let approach = line_distance(
            &Vector3::new(0.0, 0.0, 0.0),
            &Vector3::new(0.0, 0.0, 1.0),
            &Vector3::new(1.0, 0.0, 0.0),
            &Vector3::new(0.0, 1.0, 0.0),
        );
        assert_relative_eq!(approach.distance, 1.0, epsilon = 1e-12);
        assert_relative_eq!(approach.sx, 0.0, epsilon = 1e-12);
        assert_relative_eq!(approach.sy, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_wrap_phase_range() {
        assert_relative_eq!(wrap_phase(TAU + 0.5), 0.5, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(-PI), PI, epsilon = 1e-12);
        assert_relative_eq!(wrap_phase(0.5), 0.5, epsilon = 1e-15);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            x in -0.05f64..0.05,
            y in -0.05f64..0.05,
            z in -0.1f64..0.1,
            pt in 0.3f64..50.0,
            phi in -3.0f64..3.0,
            ct in -2.0f64..2.0,
            positive in proptest::bool::ANY,
        ) {
            let q = if positive { 1.0 } else { -1.0 };
            let pos = Vector3::new(x, y, z);
            let mom = Vector3::new(pt * phi.cos(), pt * phi.sin(), pt * ct);
            let par = params_from_position_momentum(&pos, &mom, q, BZ);
            let s = phase_of_point(&par, &pos);
            let back = trajectory_position(&par, s);
            let p_back = momentum_at_phase(&par, s, BZ);
            prop_assert!((back - pos).norm() < 1e-9);
            prop_assert!((p_back - mom).norm() < 1e-9 * pt.max(1.0));
        }
    }
}
