//! Validation Module - Pull Statistics Against Monte-Carlo Truth
//! ==============================================================
//!
//! Compares fitted quantities with the truth they were generated from.
//! For a correct fit with correct errors every pull `(fitted - true) / σ`
//! is standard normal and `χ²/ndof` averages to one.
//!
//! Key metrics:
//! - Vertex pulls (x, y, z)
//! - Updated track parameter pulls (D, phi0, C, z0, cotTheta)
//! - Momentum pulls at the vertex (px, py, pz)
//! - Mean χ²/ndof, non-converged fits and failed fits
//!
//! Usage:
//! ```ignore
//! use trackcov_core::validation::ValidationSession;
//!
//! let mut session = ValidationSession::new();
//! session.record_vertex(&fitted, &covariance, &truth);
//! session.record_fit(chi_square, ndof, converged);
//! let report = session.generate_report();
//! ```

use crate::trackcov_helix::{wrap_phase, HelixParameters, TrackState};
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

/// Parameter names in helix order.
pub const PARAMETER_NAMES: [&str; 5] = ["D", "phi0", "C", "z0", "cotTheta"];

// =============================================================================
// PULL STATISTICS
// =============================================================================

/// Running mean and RMS of one pull quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PullStatistics {
    pub count: usize,
    pub sum: f64,
    pub sum_squared: f64,
}

impl PullStatistics {
    /// Adds one sample; non-finite samples are dropped.
    pub fn record(&mut self, pull: f64) {
        if pull.is_finite() {
            self.count += 1;
            self.sum += pull;
            self.sum_squared += pull * pull;
        }
    }

    pub fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    /// Standard deviation around the mean.
    pub fn rms(&self) -> f64 {
        if self.count > 1 {
            let n = self.count as f64;
            ((self.sum_squared - self.sum * self.sum / n) / (n - 1.0)).max(0.0).sqrt()
        } else {
            0.0
        }
    }

    pub fn summary(&self, name: &str) -> PullSummary {
        PullSummary {
            name: name.to_string(),
            count: self.count,
            mean: self.mean(),
            rms: self.rms(),
        }
    }
}

/// Reported form of a [`PullStatistics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullSummary {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub rms: f64,
}

/// Acceptance window for a validation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassCriteria {
    /// Largest allowed `|mean|` of any pull
    pub max_abs_mean: f64,
    /// Allowed RMS range of any pull
    pub rms_range: (f64, f64),
    /// Allowed range of the mean χ²/ndof
    pub chi_square_range: (f64, f64),
    /// Largest allowed fraction of non-converged fits
    pub max_non_converged_fraction: f64,
}

impl Default for PassCriteria {
    fn default() -> Self {
        Self {
            max_abs_mean: 0.2,
            rms_range: (0.8, 1.2),
            chi_square_range: (0.7, 1.3),
            max_non_converged_fraction: 0.01,
        }
    }
}

// =============================================================================
// VALIDATION SESSION
// =============================================================================

/// Accumulates pulls over many fitted events
#[derive(Debug, Clone, Default)]
pub struct ValidationSession {
    vertex_pulls: [PullStatistics; 3],
    parameter_pulls: [PullStatistics; 5],
    momentum_pulls: [PullStatistics; 3],
    chi_square_per_dof: PullStatistics,
    fits: usize,
    non_converged: usize,
    failed_fits: usize,
}

impl ValidationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Vertex pulls from a fitted position and its covariance.
    pub fn record_vertex(&mut self, fitted: &Vector3<f64>, covariance: &Matrix3<f64>, truth: &Vector3<f64>) {
        for k in 0..3 {
            self.vertex_pulls[k].record((fitted[k] - truth[k]) / covariance[(k, k)].sqrt());
        }
    }

    /// Parameter pulls of an updated track against its true parameters.
    pub fn record_track(&mut self, updated: &TrackState, truth: &HelixParameters) {
        for k in 0..5 {
            let mut diff = updated.params[k] - truth[k];
            if k == 1 {
                diff = wrap_phase(diff);
            }
            self.parameter_pulls[k].record(diff / updated.covariance[(k, k)].sqrt());
        }
    }

    /// Momentum pulls at the vertex.
    pub fn record_momentum(&mut self, fitted: &Vector3<f64>, covariance: &Matrix3<f64>, truth: &Vector3<f64>) {
        for k in 0..3 {
            self.momentum_pulls[k].record((fitted[k] - truth[k]) / covariance[(k, k)].sqrt());
        }
    }

    /// Fit quality of one event.
    pub fn record_fit(&mut self, chi_square: f64, ndof: usize, converged: bool) {
        self.fits += 1;
        if !converged {
            self.non_converged += 1;
        }
        if ndof > 0 {
            self.chi_square_per_dof.record(chi_square / ndof as f64);
        }
    }

    /// A fit that returned an error.
    pub fn record_failure(&mut self) {
        self.failed_fits += 1;
    }

    pub fn generate_report(&self) -> ValidationReport {
        let axes = ["x", "y", "z"];
        let momenta = ["px", "py", "pz"];
        ValidationReport {
            fits: self.fits,
            failed_fits: self.failed_fits,
            non_converged: self.non_converged,
            mean_chi_square_per_dof: self.chi_square_per_dof.mean(),
            vertex_pulls: axes
                .iter()
                .zip(&self.vertex_pulls)
                .map(|(n, p)| p.summary(n))
                .collect(),
            parameter_pulls: PARAMETER_NAMES
                .iter()
                .zip(&self.parameter_pulls)
                .map(|(n, p)| p.summary(n))
                .collect(),
            momentum_pulls: momenta
                .iter()
                .zip(&self.momentum_pulls)
                .map(|(n, p)| p.summary(n))
                .collect(),
        }
    }
}

// =============================================================================
// VALIDATION REPORT
// =============================================================================

/// Final pull report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub fits: usize,
    pub failed_fits: usize,
    pub non_converged: usize,
    pub mean_chi_square_per_dof: f64,
    pub vertex_pulls: Vec<PullSummary>,
    pub parameter_pulls: Vec<PullSummary>,
    pub momentum_pulls: Vec<PullSummary>,
}

impl ValidationReport {
    /// All summaries that hold samples.
    pub fn populated_pulls(&self) -> impl Iterator<Item = &PullSummary> {
        self.vertex_pulls
            .iter()
            .chain(&self.parameter_pulls)
            .chain(&self.momentum_pulls)
            .filter(|p| p.count > 0)
    }

    /// Print formatted report to console
    pub fn print(&self) {
        println!();
        println!("╔══════════════════════════════════════════════════════════════╗");
        println!("║               TRACKCOV PULL REPORT                           ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║ Fits:                  {:>10}                            ║", self.fits);
        println!("║ Failed Fits:           {:>10}                            ║", self.failed_fits);
        println!("║ Not Converged:         {:>10}                            ║", self.non_converged);
        println!("║ Mean χ²/ndof:          {:>10.3}                            ║", self.mean_chi_square_per_dof);
        println!("╠══════════════════════════════════════════════════════════════╣");
        println!("║   Pull          Samples        Mean         RMS              ║");
        println!("╠══════════════════════════════════════════════════════════════╣");
        for p in self.populated_pulls() {
            println!("║   {:<10} {:>10} {:>11.3} {:>11.3}              ║", p.name, p.count, p.mean, p.rms);
        }
        println!("╚══════════════════════════════════════════════════════════════╝");
    }

    /// Check if validation passes acceptance criteria
    pub fn passes_criteria(&self, criteria: &PassCriteria) -> bool {
        if self.fits == 0 {
            return false;
        }
        let pulls_ok = self.populated_pulls().all(|p| {
            p.mean.abs() <= criteria.max_abs_mean
                && p.rms >= criteria.rms_range.0
                && p.rms <= criteria.rms_range.1
        });
        let chi_ok = self.mean_chi_square_per_dof >= criteria.chi_square_range.0
            && self.mean_chi_square_per_dof <= criteria.chi_square_range.1;
        let converged_ok =
            (self.non_converged as f64 / self.fits as f64) <= criteria.max_non_converged_fraction;
        pulls_ok && chi_ok && converged_ok
    }
}

// =============================================================================
// TESTS
// =============================================================================
