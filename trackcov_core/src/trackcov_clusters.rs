//! Ionization cluster counting in a gaseous tracking chamber.
//!
//! The number of primary ionization clusters per meter is tabulated against
//! `βγ` for a few standard gas mixtures and interpolated with a natural cubic
//! spline in `ln βγ`. Outside the tabulated range the count is zero. The
//! expected number of clusters of a track is that density times the 3D path
//! length inside the chamber volume.

use crate::trackcov_helix::{phase_at_radius, phase_at_radius_neutral, HelixParameters, C_LIGHT};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// `βγ` nodes shared by all mixtures.
const BETA_GAMMA: [f64; 16] = [
    0.5, 0.7, 1.0, 1.5, 2.0, 3.0, 4.0, 6.0, 10.0, 20.0, 50.0, 100.0, 300.0, 1000.0, 3000.0, 10000.0,
];

/// Cluster density relative to the minimum-ionizing value.
const RELATIVE_DENSITY: [f64; 16] = [
    4.20, 2.60, 1.75, 1.30, 1.13, 1.01, 1.00, 1.02, 1.08, 1.18, 1.31, 1.40, 1.50, 1.56, 1.58, 1.59,
];

/// Drift-chamber gas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GasMixture {
    /// He / iC4H10 90/10
    #[default]
    HeliumIsobutane,
    /// Pure He
    Helium,
    /// Ar / C2H6 50/50
    ArgonEthane,
    /// Pure Ar
    Argon,
}

impl GasMixture {
    pub fn name(&self) -> &'static str {
        match self {
            GasMixture::HeliumIsobutane => "He-iC4H10",
            GasMixture::Helium => "He",
            GasMixture::ArgonEthane => "Ar-C2H6",
            GasMixture::Argon => "Ar",
        }
    }

    /// Clusters per meter for a minimum-ionizing particle.
    pub fn minimum_density(&self) -> f64 {
        match self {
            GasMixture::HeliumIsobutane => 1250.0,
            GasMixture::Helium => 500.0,
            GasMixture::ArgonEthane => 2700.0,
            GasMixture::Argon => 2500.0,
        }
    }
}

/// Cylindrical sensitive volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberConfig {
    pub r_min: f64,
    pub r_max: f64,
    pub z_min: f64,
    pub z_max: f64,
}

impl Default for ChamberConfig {
    fn default() -> Self {
        Self { r_min: 0.345, r_max: 2.02, z_min: -2.0, z_max: 2.0 }
    }
}

// ============================================================================
// SPLINE
// ============================================================================

/// Natural cubic spline (zero second derivative at both ends).
#[derive(Debug, Clone)]
pub struct CubicSpline {
    x: Vec<f64>,
    y: Vec<f64>,
    m: Vec<f64>,
}

impl CubicSpline {
    /// Builds the spline through `(x, y)`; `x` must be strictly increasing
    /// with at least two nodes.
    pub fn natural(x: &[f64], y: &[f64]) -> Self {
        let n = x.len();
        let mut m = vec![0.0; n];
        if n > 2 {
            // Thomas algorithm on the interior second derivatives
            let mut diag = vec![0.0; n];
            let mut rhs = vec![0.0; n];
            for i in 1..n - 1 {
                let h0 = x[i] - x[i - 1];
                let h1 = x[i + 1] - x[i];
                diag[i] = 2.0 * (h0 + h1);
                rhs[i] = 6.0 * ((y[i + 1] - y[i]) / h1 - (y[i] - y[i - 1]) / h0);
            }
            for i in 2..n - 1 {
                let h = x[i] - x[i - 1];
                let w = h / diag[i - 1];
                diag[i] -= w * h;
                rhs[i] -= w * rhs[i - 1];
            }
            for i in (1..n - 1).rev() {
                let h1 = x[i + 1] - x[i];
                m[i] = (rhs[i] - h1 * m[i + 1]) / diag[i];
            }
        }
        Self { x: x.to_vec(), y: y.to_vec(), m }
    }

    /// Value at `x`, or `None` outside the node range.
    pub fn eval(&self, x: f64) -> Option<f64> {
        let n = self.x.len();
        if n < 2 || !(x >= self.x[0] && x <= self.x[n - 1]) {
            return None;
        }
        let i = self.x.partition_point(|&v| v <= x).clamp(1, n - 1) - 1;
        let (x0, x1) = (self.x[i], self.x[i + 1]);
        let h = x1 - x0;
        let (a, b) = (x1 - x, x - x0);
        Some(
            self.m[i] * a * a * a / (6.0 * h)
                + self.m[i + 1] * b * b * b / (6.0 * h)
                + (self.y[i] / h - self.m[i] * h / 6.0) * a
                + (self.y[i + 1] / h - self.m[i + 1] * h / 6.0) * b,
        )
    }
}

// ============================================================================
// CLUSTER COUNTER
// ============================================================================

/// Cluster density lookup for one gas mixture.
#[derive(Debug, Clone)]
pub struct ClusterCounter {
    gas: GasMixture,
    spline: CubicSpline,
}

impl ClusterCounter {
    pub fn new(gas: GasMixture) -> Self {
        let ln_bg: Vec<f64> = BETA_GAMMA.iter().map(|v| v.ln()).collect();
        let density: Vec<f64> = RELATIVE_DENSITY.iter().map(|r| r * gas.minimum_density()).collect();
        Self { gas, spline: CubicSpline::natural(&ln_bg, &density) }
    }

    pub fn gas(&self) -> GasMixture {
        self.gas
    }

    /// Clusters per meter at `βγ`; zero outside the table.
    pub fn clusters_per_meter(&self, beta_gamma: f64) -> f64 {
        if beta_gamma <= 0.0 {
            return 0.0;
        }
        self.spline.eval(beta_gamma.ln()).unwrap_or(0.0)
    }

    /// Expected clusters of a charged track of mass `mass` in `chamber`.
    pub fn ionization_clusters(&self, mass: f64, par: &HelixParameters, bz: f64, chamber: &ChamberConfig) -> f64 {
        if mass <= 0.0 || par[2] == 0.0 {
            return 0.0;
        }
        let pt = (bz * C_LIGHT / (2.0 * par[2])).abs();
        let p = pt * (1.0 + par[4] * par[4]).sqrt();
        self.clusters_per_meter(p / mass) * track_length_in_volume(par, true, chamber)
    }
}

// ============================================================================
// PATH LENGTH
// ============================================================================

/// 3D path length of a track inside `chamber`, outgoing branch only.
///
/// Charged tracks stop at the first of the outer radius, an end plate or
/// half a turn; neutral lines at the outer radius or an end plate.
pub fn track_length_in_volume(par: &HelixParameters, charged: bool, chamber: &ChamberConfig) -> f64 {
    let (d, c, z0, ct) = (par[0], par[2], par[3], par[4]);
    if charged && c == 0.0 {
        return 0.0;
    }

    // Transverse path length at radius r, None when never reached
    let reach = |r: f64| -> Option<f64> {
        if r <= d.abs() {
            return Some(0.0);
        }
        if charged {
            if r >= (d + 1.0 / c).abs() {
                None
            } else {
                Some(phase_at_radius(par, r) / (2.0 * c))
            }
        } else {
            Some(phase_at_radius_neutral(par, r))
        }
    };

    let l_in = match reach(chamber.r_min) {
        Some(l) => l,
        None => return 0.0,
    };
    let l_radial = match reach(chamber.r_max) {
        Some(l) => l,
        None if charged => PI / (2.0 * c.abs()),
        None => return 0.0,
    };

    let (z_lo, z_hi) = if ct > 0.0 {
        ((chamber.z_min - z0) / ct, (chamber.z_max - z0) / ct)
    } else if ct < 0.0 {
        ((chamber.z_max - z0) / ct, (chamber.z_min - z0) / ct)
    } else if z0 >= chamber.z_min && z0 <= chamber.z_max {
        (f64::NEG_INFINITY, f64::INFINITY)
    } else {
        return 0.0;
    };

    let start = l_in.max(z_lo).max(0.0);
    let end = l_radial.min(z_hi);
    (end - start).max(0.0) * (1.0 + ct * ct).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackcov_helix::params_from_position_momentum;
    use approx::assert_relative_eq;
    use nalgebra::{Vector3, Vector5};

    #[test]
    fn test_spline_through_nodes_and_linear_data() {
        let x = [0.0, 1.0, 2.5, 4.0];
        let linear = [1.0, 3.0, 6.0, 9.0];
        let spline = CubicSpline::natural(&x, &linear);
        for (&xi, &yi) in x.iter().zip(&linear) {
            assert_relative_eq!(spline.eval(xi).unwrap(), yi, epsilon = 1e-12);
        }
        assert_relative_eq!(spline.eval(3.3).unwrap(), 7.6, epsilon = 1e-12);
        assert!(spline.eval(-0.1).is_none());
        assert!(spline.eval(4.1).is_none());
    }

    #[test]
    fn test_cluster_density_table() {
        let counter = ClusterCounter::new(GasMixture::HeliumIsobutane);
        assert_relative_eq!(counter.clusters_per_meter(4.0), 1250.0, epsilon = 1e-9);
        assert_relative_eq!(counter.clusters_per_meter(0.5), 4.2 * 1250.0, epsilon = 1e-9);
        assert!(counter.clusters_per_meter(1.2) > counter.clusters_per_meter(3.5));
        assert_eq!(counter.clusters_per_meter(0.3), 0.0);
        assert_eq!(counter.clusters_per_meter(2.0e4), 0.0);

        let argon = ClusterCounter::new(GasMixture::Argon);
        assert!(argon.clusters_per_meter(4.0) > counter.clusters_per_meter(4.0));
    }

    #[test]
    fn test_straight_radial_length() {
        let chamber = ChamberConfig::default();
        let par = Vector5::new(0.0, 0.3, 1.0, 0.0, 0.0);
        let length = track_length_in_volume(&par, false, &chamber);
        assert_relative_eq!(length, chamber.r_max - chamber.r_min, epsilon = 1e-12);
    }

    #[test]
    fn test_end_plate_cuts_length() {
        let chamber = ChamberConfig::default();
        // Exits through z_max at transverse length 2.0 / 2.0 = 1.0
        let par = Vector5::new(0.0, 0.0, 1.0, 0.0, 2.0);
        let length = track_length_in_volume(&par, false, &chamber);
        assert_relative_eq!(length, (1.0 - chamber.r_min) * 5.0f64.sqrt(), epsilon = 1e-12);

        let outside = Vector5::new(0.0, 0.0, 1.0, 3.0, 0.0);
        assert_eq!(track_length_in_volume(&outside, false, &chamber), 0.0);
    }

    #[test]
    fn test_curler_stops_at_half_turn() {
        let chamber = ChamberConfig::default();
        // 0.3 GeV in 2 T: diameter ~1 m, never reaches r_max
        let par = params_from_position_momentum(&Vector3::zeros(), &Vector3::new(0.3, 0.0, 0.0), 1.0, 2.0);
        let length = track_length_in_volume(&par, true, &chamber);
        let l_in = phase_at_radius(&par, chamber.r_min) / (2.0 * par[2]);
        assert_relative_eq!(length, PI / (2.0 * par[2].abs()) - l_in, epsilon = 1e-9);
    }

    #[test]
    fn test_stiff_track_close_to_straight() {
        let chamber = ChamberConfig::default();
        let par = params_from_position_momentum(&Vector3::zeros(), &Vector3::new(50.0, 0.0, 0.0), -1.0, 2.0);
        let length = track_length_in_volume(&par, true, &chamber);
        assert_relative_eq!(length, chamber.r_max - chamber.r_min, max_relative = 1e-3);
    }

    #[test]
    fn test_ionization_clusters() {
        let chamber = ChamberConfig::default();
        let counter = ClusterCounter::new(GasMixture::HeliumIsobutane);
        let par = params_from_position_momentum(&Vector3::zeros(), &Vector3::new(0.56, 0.0, 0.0), 1.0, 2.0);
        // pion at betagamma = 4
        let n = counter.ionization_clusters(0.14, &par, 2.0, &chamber);
        let expected = 1250.0 * track_length_in_volume(&par, true, &chamber);
        assert_relative_eq!(n, expected, max_relative = 1e-6);
    }
}
