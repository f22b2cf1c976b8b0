//! Synthetic detector model.
//!
//! Turns truth particles into measured tracks:
//! 1. **Acceptance**: layer count from an [`AcceptanceGrid`], cut at
//!    `min_hits` (neutrals are always accepted)
//! 2. **Resolution**: helix covariance from a [`CovarianceGrid`]
//! 3. **Smearing**: measured parameters drawn around the true ones with
//!    exactly that covariance
//!
//! The grids are either tabulated from a parametric resolution model or
//! loaded from JSON tables.

use crate::error::SimError;
use crate::oracle::{Oracle, TruthParticle};
use nalgebra::Matrix5;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use trackcov_core::trackcov_grid::{is_accepted, DEFAULT_ANGLE_NODES, DEFAULT_PT_NODES};
use trackcov_core::trackcov_helix::C_LIGHT;
use trackcov_core::{smear_parameters, AcceptanceGrid, CovarianceGrid, HelixParameters, TrackState};
use trackcov_env::{CovarianceLookup, NumericsObserver};

/// Parametric resolution and acceptance model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Number of measurement layers (default: 12)
    pub layers: f64,

    /// Minimum layers for a track to be reconstructed (default: 6)
    pub min_hits: i32,

    /// Asymptotic impact-parameter resolution in m (default: 1e-5)
    pub point_resolution: f64,

    /// Multiple-scattering term in m·GeV (default: 3e-5)
    pub scattering: f64,

    /// Curvature resolution slope, σpt/pt per GeV (default: 2e-3)
    pub momentum_resolution: f64,

    /// Curvature resolution floor from scattering (default: 5e-3)
    pub momentum_scattering: f64,

    /// Neutral direction resolution in rad (default: 1e-3)
    pub neutral_angle_resolution: f64,

    /// Neutral relative pt resolution (default: 0.05)
    pub neutral_momentum_resolution: f64,

    /// Optional JSON resolution table replacing the parametric model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_table: Option<String>,

    /// Optional JSON acceptance table replacing the parametric model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acceptance_table: Option<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            layers: 12.0,
            min_hits: 6,
            point_resolution: 1.0e-5,
            scattering: 3.0e-5,
            momentum_resolution: 2.0e-3,
            momentum_scattering: 5.0e-3,
            neutral_angle_resolution: 1.0e-3,
            neutral_momentum_resolution: 0.05,
            resolution_table: None,
            acceptance_table: None,
        }
    }
}

impl DetectorConfig {
    /// Helix covariance of a charged track at `(pt, θ)` in field `bz`.
    pub fn charged_covariance(&self, pt: f64, angle_deg: f64, bz: f64) -> Matrix5<f64> {
        let s = angle_deg.to_radians().sin().abs().max(0.05);
        let p = pt / s;
        let ms = self.scattering / (p * s.sqrt());
        let sigma_d = self.point_resolution.hypot(ms);
        let sigma_phi = 30.0 * sigma_d;
        let curvature = C_LIGHT * bz / (2.0 * pt);
        let sigma_c = curvature * (self.momentum_resolution * pt).hypot(self.momentum_scattering / s.sqrt());
        let sigma_z = sigma_d / s;
        let sigma_ct = 30.0 * sigma_d / (s * s);

        let sigma = [sigma_d, sigma_phi, sigma_c, sigma_z, sigma_ct];
        let mut cov = Matrix5::from_fn(|i, j| if i == j { sigma[i] * sigma[i] } else { 0.0 });
        for (i, j, rho) in [(0, 1, 0.5), (1, 2, 0.3), (3, 4, 0.5)] {
            let c = rho * sigma[i] * sigma[j];
            cov[(i, j)] = c;
            cov[(j, i)] = c;
        }
        cov
    }

    /// Line-parameter covariance of a neutral track.
    pub fn neutral_covariance(&self, pt: f64, angle_deg: f64) -> Matrix5<f64> {
        let s = angle_deg.to_radians().sin().abs().max(0.05);
        let sigma_d = 10.0 * self.point_resolution / s.sqrt();
        let sigma_phi = self.neutral_angle_resolution;
        let sigma_pt = self.neutral_momentum_resolution * pt;
        let sigma_z = sigma_d / s;
        let sigma_ct = self.neutral_angle_resolution / (s * s);
        Matrix5::from_diagonal(&nalgebra::Vector5::new(
            sigma_d * sigma_d,
            sigma_phi * sigma_phi,
            sigma_pt * sigma_pt,
            sigma_z * sigma_z,
            sigma_ct * sigma_ct,
        ))
    }

    /// Layers crossed: fewer in the forward region and for curlers.
    pub fn hit_count(&self, pt: f64, angle_deg: f64) -> f64 {
        let polar = ((angle_deg - 8.0) / 20.0).clamp(0.0, 1.0);
        let curl = (pt / 0.3).clamp(0.0, 1.0);
        self.layers * polar * curl
    }
}

/// A smeared track together with the truth it came from.
#[derive(Debug, Clone)]
pub struct Measurement {
    pub truth: HelixParameters,
    pub track: TrackState,
}

/// Acceptance, resolution and smearing for one run.
pub struct Detector {
    config: DetectorConfig,
    bz: f64,
    resolution: CovarianceGrid,
    acceptance: AcceptanceGrid,
}

impl Detector {
    /// Builds the grids from JSON tables when configured, otherwise from the
    /// parametric model on the default nodes.
    pub fn new(config: DetectorConfig, bz: f64, observer: Arc<dyn NumericsObserver>) -> Result<Self, SimError> {
        if !(bz > 0.0) {
            return Err(SimError::invalid_config("bz must be positive"));
        }
        let resolution = match &config.resolution_table {
            Some(path) => CovarianceGrid::from_json_str(&read_table(path)?)?,
            None => CovarianceGrid::from_fn(&DEFAULT_PT_NODES, &DEFAULT_ANGLE_NODES, |pt, a| {
                config.charged_covariance(pt, a, bz)
            })?,
        };
        let acceptance = match &config.acceptance_table {
            Some(path) => AcceptanceGrid::from_json_str(&read_table(path)?)?,
            None => AcceptanceGrid::from_fn(&DEFAULT_PT_NODES, &DEFAULT_ANGLE_NODES, |pt, a| {
                config.hit_count(pt, a)
            })?,
        };
        Ok(Self {
            config,
            bz,
            resolution: resolution.with_observer(observer.clone()),
            acceptance: acceptance.with_observer(observer),
        })
    }

    pub fn bz(&self) -> f64 {
        self.bz
    }

    pub fn accepts(&self, particle: &TruthParticle) -> bool {
        !particle.is_charged()
            || is_accepted(&self.acceptance, particle.pt(), particle.polar_angle_deg(), self.config.min_hits)
    }

    /// Measurement covariance for `particle`.
    pub fn covariance(&self, particle: &TruthParticle) -> Matrix5<f64> {
        let (pt, angle) = (particle.pt(), particle.polar_angle_deg());
        if particle.is_charged() {
            self.resolution.covariance(pt, angle)
        } else {
            self.config.neutral_covariance(pt, angle)
        }
    }

    /// Smeared track, or `None` when the particle is outside acceptance.
    pub fn measure(&self, particle: &TruthParticle, oracle: &mut Oracle) -> Option<Measurement> {
        if !self.accepts(particle) {
            return None;
        }
        let truth = particle.parameters(self.bz);
        let covariance = self.covariance(particle);
        let measured = smear_parameters(&truth, &covariance, &oracle.normals5());
        let track = if particle.is_charged() {
            TrackState::charged(measured, covariance)
        } else {
            TrackState::neutral(measured, covariance)
        };
        Some(Measurement { truth, track })
    }
}

fn read_table(path: &str) -> Result<String, SimError> {
    Ok(std::fs::read_to_string(Path::new(path))?)
}

// ============================================================================
// TESTS
// ============================================================================
