//! The "MORE" Engine - Vertex Post-Processing
//!
//! Turns a fitted vertex into physics quantities with propagated errors:
//! - Track momenta at the vertex and their joint covariance with the vertex
//!   position (the "big" state `[x, p_1, ..., p_N]`)
//! - Total momentum, total charge and the composite vertex track
//! - Invariant masses and mass-constrained refits
//!
//! The big covariance is built from first principles: every big-state
//! component is differentiated w.r.t. the fit inputs (the input track
//! parameters and the constraint mean) through the fitter's derivative
//! queries, then `S = G Σ Gᵀ`.

use crate::error::VertexError;
use crate::trackcov_formats::{covariance_to_mm, params_to_mm, LengthUnit};
use crate::trackcov_helix::{
    charge_from_params, d_params_d_position_momentum, params_from_position_momentum, TrackState,
};
use crate::trackcov_linalg::{regularized_inverse_with, symmetrize, symmetrize_dyn, to_fixed};
use crate::trackcov_vertex::VertexFit;
use nalgebra::{DMatrix, DVector, Matrix3, Matrix3x5, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trackcov_env::{NumericsObserver, RecoveryEvent, RecoveryKind};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Mass-constraint fit knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassFitConfig {
    /// Iteration cap (default: 100)
    pub max_iterations: usize,

    /// Convergence threshold on the step in the prior inverse-covariance
    /// metric (default: 1e-6)
    pub tolerance: f64,
}

impl Default for MassFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1.0e-6,
        }
    }
}

/// Configuration for the VertexMore post-processor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexMoreConfig {
    /// Magnetic field in Tesla (default: 2.0)
    pub bz: f64,

    /// Length unit of the fitted tracks (default: meters)
    pub units: LengthUnit,

    /// Mass-constraint fit knobs
    pub mass_fit: MassFitConfig,
}

impl Default for VertexMoreConfig {
    fn default() -> Self {
        Self {
            bz: 2.0,
            units: LengthUnit::Meters,
            mass_fit: MassFitConfig::default(),
        }
    }
}

impl VertexMoreConfig {
    pub fn with_bz(mut self, bz: f64) -> Self {
        self.bz = bz;
        self
    }

    pub fn with_units(mut self, units: LengthUnit) -> Self {
        self.units = units;
        self
    }

    pub fn with_mass_fit(mut self, mass_fit: MassFitConfig) -> Self {
        self.mass_fit = mass_fit;
        self
    }
}

// ============================================================================
// MASS CONSTRAINTS
// ============================================================================

/// Invariant-mass constraint on a subset of the vertex tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassConstraint {
    /// Target invariant mass (GeV)
    pub mass: f64,

    /// Tracks entering the mass
    pub track_indices: Vec<usize>,

    /// Mass hypothesis for each listed track (GeV)
    pub masses: Vec<f64>,
}

/// Outcome of [`VertexMore::apply_mass_constraint_fit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MassFitReport {
    pub iterations: usize,
    pub converged: bool,
    /// `(y - y0)ᵀ S0⁻¹ (y - y0)`
    pub chi_square: f64,
    /// Invariant mass of every constraint after the fit
    pub masses: Vec<f64>,
}

// ============================================================================
// VERTEX MORE
// ============================================================================

/// Post-processor over a fitted vertex.
pub struct VertexMore {
    config: VertexMoreConfig,
    observer: Arc<dyn NumericsObserver>,
    tracks: Vec<TrackState>,
    phases: Vec<f64>,
    fit_chi_square: f64,
    prior_state: DVector<f64>,
    prior_covariance: DMatrix<f64>,
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    constraints: Vec<MassConstraint>,
}

impl std::fmt::Debug for VertexMore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexMore")
            .field("config", &self.config)
            .field("tracks", &self.tracks.len())
            .field("constraints", &self.constraints.len())
            .finish()
    }
}

impl VertexMore {
    /// Build the big state from `fit`, running the fit if needed.
    pub fn new(fit: &mut VertexFit, config: VertexMoreConfig) -> Result<Self, VertexError> {
        let result = fit.fit()?.clone();
        let n = result.updated_tracks.len();
        let constraint_cov = fit.constraint().map(|c| c.covariance);
        let n_inputs = 5 * n + if constraint_cov.is_some() { 3 } else { 0 };
        let dim = 3 + 3 * n;
        let bz = config.bz * config.units.to_meters();

        let mut sigma = DMatrix::zeros(n_inputs, n_inputs);
        for k in 0..n {
            if let Some(track) = fit.input_track(k) {
                sigma.view_mut((5 * k, 5 * k), (5, 5)).copy_from(&track.covariance);
            }
        }
        if let Some(cov) = constraint_cov {
            sigma.view_mut((5 * n, 5 * n), (3, 3)).copy_from(&cov);
        }

        let mut jac = DMatrix::zeros(dim, n_inputs);
        for k in 0..n {
            jac.view_mut((0, 5 * k), (3, 5)).copy_from(&fit.d_vertex_d_params(k)?);
        }
        if constraint_cov.is_some() {
            jac.view_mut((0, 5 * n), (3, 3)).copy_from(&fit.d_vertex_d_constraint()?);
        }

        let mut state = DVector::zeros(dim);
        state.fixed_rows_mut::<3>(0).copy_from(&result.vertex);
        for i in 0..n {
            let (p, dp_dpar, dp_ds) =
                momentum_jacobians(&result.updated_tracks[i], result.phases[i], bz);
            state.fixed_rows_mut::<3>(3 + 3 * i).copy_from(&p);
            for k in 0..n {
                let block: Matrix3x5<f64> = dp_dpar * fit.d_params_d_initial(i, k)?
                    + dp_ds * fit.d_phase_d_initial(i, k)?;
                jac.view_mut((3 + 3 * i, 5 * k), (3, 5)).copy_from(&block);
            }
            if constraint_cov.is_some() {
                let block: Matrix3<f64> = dp_dpar * fit.d_params_d_constraint(i)?
                    + dp_ds * fit.d_phase_d_constraint(i)?;
                jac.view_mut((3 + 3 * i, 5 * n), (3, 3)).copy_from(&block);
            }
        }

        let covariance = symmetrize_dyn(&(&jac * &sigma * jac.transpose()));

        Ok(Self {
            config,
            observer: fit.observer(),
            tracks: result.updated_tracks,
            phases: result.phases,
            fit_chi_square: result.chi_square,
            prior_state: state.clone(),
            prior_covariance: covariance.clone(),
            state,
            covariance,
            constraints: Vec::new(),
        })
    }

    /// Post-processor configuration.
    pub fn config(&self) -> &VertexMoreConfig {
        &self.config
    }

    /// Number of tracks at the vertex.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// χ² of the underlying vertex fit.
    pub fn fit_chi_square(&self) -> f64 {
        self.fit_chi_square
    }

    /// Phase of track `i` at the vertex.
    pub fn phase(&self, i: usize) -> Result<f64, VertexError> {
        self.check_index(i)?;
        Ok(self.phases[i])
    }

    fn check_index(&self, index: usize) -> Result<(), VertexError> {
        if index < self.tracks.len() {
            Ok(())
        } else {
            Err(VertexError::InvalidTrackIndex { index, count: self.tracks.len() })
        }
    }

    // ------------------------------------------------------------------------
    // Big state accessors
    // ------------------------------------------------------------------------

    /// Big state `[x, p_1, ..., p_N]`.
    pub fn big_state(&self) -> &DVector<f64> {
        &self.state
    }

    /// Joint covariance of the big state.
    pub fn big_covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// Vertex position.
    pub fn vertex(&self) -> Vector3<f64> {
        self.state.fixed_rows::<3>(0).into_owned()
    }

    /// Vertex covariance.
    pub fn vertex_covariance(&self) -> Matrix3<f64> {
        self.covariance.fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Momentum of track `i` at the vertex.
    pub fn momentum(&self, i: usize) -> Result<Vector3<f64>, VertexError> {
        self.check_index(i)?;
        Ok(momentum_in(&self.state, i))
    }

    /// Covariance of the momentum of track `i`.
    pub fn momentum_covariance(&self, i: usize) -> Result<Matrix3<f64>, VertexError> {
        self.check_index(i)?;
        let o = 3 + 3 * i;
        Ok(self.covariance.fixed_view::<3, 3>(o, o).into_owned())
    }

    /// Sum of all track momenta.
    pub fn total_momentum(&self) -> Vector3<f64> {
        (0..self.tracks.len()).map(|i| momentum_in(&self.state, i)).sum()
    }

    /// Covariance of the total momentum, cross-terms included.
    pub fn total_momentum_covariance(&self) -> Matrix3<f64> {
        let selector = self.position_momentum_selector();
        let cov = &selector * &self.covariance * selector.transpose();
        symmetrize(&to_fixed::<6>(&cov).fixed_view::<3, 3>(3, 3).into_owned())
    }

    /// Charge of track `i` in units of e; zero for a neutral track.
    pub fn charge(&self, i: usize) -> Result<f64, VertexError> {
        self.check_index(i)?;
        Ok(self.track_charge(i))
    }

    fn track_charge(&self, i: usize) -> f64 {
        let track = &self.tracks[i];
        if track.charged {
            charge_from_params(&track.params, self.config.bz)
        } else {
            0.0
        }
    }

    /// Sum of the charges of the charged tracks.
    pub fn total_charge(&self) -> f64 {
        (0..self.tracks.len()).map(|i| self.track_charge(i)).sum()
    }

    /// Maps the big state onto `(x, Σp)`.
    fn position_momentum_selector(&self) -> DMatrix<f64> {
        let mut t = DMatrix::zeros(6, self.state.len());
        t.view_mut((0, 0), (3, 3)).fill_with_identity();
        for i in 0..self.tracks.len() {
            t.view_mut((3, 3 + 3 * i), (3, 3)).fill_with_identity();
        }
        t
    }

    /// The vertex as a single charged helix.
    ///
    /// Fails with `UnsupportedOperation` for a neutral vertex.
    pub fn composite_track(&self) -> Result<TrackState, VertexError> {
        let charge = self.total_charge();
        if charge == 0.0 {
            return Err(VertexError::unsupported(
                "composite track requires a non-zero total charge",
            ));
        }

        let scale = self.config.units.to_meters();
        let selector = self.position_momentum_selector();
        let mut cov6 = to_fixed::<6>(&(&selector * &self.covariance * selector.transpose()));
        for r in 0..6 {
            for c in 0..6 {
                let sr = if r < 3 { scale } else { 1.0 };
                let sc = if c < 3 { scale } else { 1.0 };
                cov6[(r, c)] *= sr * sc;
            }
        }

        let x = self.vertex() * scale;
        let p = self.total_momentum();
        let params = params_from_position_momentum(&x, &p, charge, self.config.bz);
        let jac = d_params_d_position_momentum(&x, &p, charge, self.config.bz);
        let covariance = symmetrize(&(jac * cov6 * jac.transpose()));

        Ok(match self.config.units {
            LengthUnit::Meters => TrackState::charged(params, covariance),
            LengthUnit::Millimeters => {
                TrackState::charged(params_to_mm(&params), symmetrize(&covariance_to_mm(&covariance)))
            }
        })
    }

    // ------------------------------------------------------------------------
    // Masses
    // ------------------------------------------------------------------------

    fn validate_selection(&self, indices: &[usize], masses: &[f64]) -> Result<(), VertexError> {
        if indices.is_empty() || indices.len() != masses.len() {
            return Err(VertexError::unsupported(format!(
                "{} track indices with {} mass hypotheses",
                indices.len(),
                masses.len()
            )));
        }
        for &i in indices {
            self.check_index(i)?;
        }
        Ok(())
    }

    /// Invariant mass of the selected tracks and its error.
    pub fn invariant_mass(&self, indices: &[usize], masses: &[f64]) -> Result<(f64, f64), VertexError> {
        self.validate_selection(indices, masses)?;
        let (mass, grad) = mass_and_gradient(&self.state, indices, masses);
        let variance = grad.dot(&(&self.covariance * &grad));
        Ok((mass, variance.max(0.0).sqrt()))
    }

    /// Register a mass constraint; it takes effect on the next
    /// [`apply_mass_constraint_fit`](Self::apply_mass_constraint_fit).
    pub fn add_mass_constraint(
        &mut self,
        mass: f64,
        track_indices: &[usize],
        masses: &[f64],
    ) -> Result<(), VertexError> {
        self.validate_selection(track_indices, masses)?;
        self.constraints.push(MassConstraint {
            mass,
            track_indices: track_indices.to_vec(),
            masses: masses.to_vec(),
        });
        Ok(())
    }

    /// Registered mass constraints.
    pub fn mass_constraints(&self) -> &[MassConstraint] {
        &self.constraints
    }

    /// Constraint residuals `f` and Jacobian `B` at `state`.
    fn constraint_system(&self, state: &DVector<f64>) -> (DVector<f64>, DMatrix<f64>) {
        let nc = self.constraints.len();
        let mut f = DVector::zeros(nc);
        let mut b = DMatrix::zeros(nc, state.len());
        for (row, c) in self.constraints.iter().enumerate() {
            let (mass, grad) = mass_and_gradient(state, &c.track_indices, &c.masses);
            f[row] = mass - c.mass;
            b.set_row(row, &grad.transpose());
        }
        (f, b)
    }

    /// Refit the big state under all registered mass constraints.
    ///
    /// Always starts from the unconstrained state, so repeated calls with
    /// the same constraint set are idempotent. Updates the big state and its
    /// covariance in place.
    pub fn apply_mass_constraint_fit(&mut self) -> MassFitReport {
        if self.constraints.is_empty() {
            return MassFitReport { iterations: 0, converged: true, chi_square: 0.0, masses: Vec::new() };
        }

        let observer = self.observer.as_ref();
        let y0 = &self.prior_state;
        let s0 = &self.prior_covariance;
        let s0_inv = regularized_inverse_with(s0, observer, "vertex_more.prior");
        let cfg = &self.config.mass_fit;

        let mut y = y0.clone();
        let mut converged = false;
        let mut iterations = 0;
        while iterations < cfg.max_iterations {
            iterations += 1;
            let (f, b) = self.constraint_system(&y);
            let sbt = s0 * b.transpose();
            let w = regularized_inverse_with(&symmetrize_dyn(&(&b * &sbt)), observer, "vertex_more.mass");
            let residual = f + &b * (y0 - &y);
            let next = y0 - &sbt * (&w * residual);
            let dy = &next - &y;
            let step = dy.dot(&(&s0_inv * &dy));
            y = next;
            if step < cfg.tolerance {
                converged = true;
                break;
            }
        }

        let (_, b) = self.constraint_system(&y);
        let sbt = s0 * b.transpose();
        let w = regularized_inverse_with(&symmetrize_dyn(&(&b * &sbt)), observer, "vertex_more.mass");
        let covariance = symmetrize_dyn(&(s0 - &sbt * &w * sbt.transpose()));
        let pull = &y - y0;
        let chi_square = pull.dot(&(&s0_inv * &pull));

        if !converged {
            observer.on_recovery(
                &RecoveryEvent::new(RecoveryKind::NonConvergence, "vertex_more.mass_fit", y.len())
                    .with_detail(format!("stopped after {} iterations", iterations)),
            );
        }

        let masses = self
            .constraints
            .iter()
            .map(|c| mass_and_gradient(&y, &c.track_indices, &c.masses).0)
            .collect();

        self.state = y;
        self.covariance = covariance;

        MassFitReport { iterations, converged, chi_square, masses }
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn momentum_in(state: &DVector<f64>, i: usize) -> Vector3<f64> {
    state.fixed_rows::<3>(3 + 3 * i).into_owned()
}

/// Momentum at phase `s` with `dp/dparams` and `dp/ds`.
fn momentum_jacobians(track: &TrackState, s: f64, bz: f64) -> (Vector3<f64>, Matrix3x5<f64>, Vector3<f64>) {
    let p = track.momentum_at(s, bz);
    let turn = Vector3::new(-p.y, p.x, 0.0);
    let mut dp = Matrix3x5::zeros();
    dp.set_column(1, &turn);
    dp.set_column(4, &Vector3::new(0.0, 0.0, p.x.hypot(p.y)));
    if track.charged {
        // pt ∝ 1/C
        dp.set_column(2, &(-p / track.params[2]));
        (p, dp, turn)
    } else {
        dp.set_column(2, &(p / track.params[2]));
        (p, dp, Vector3::zeros())
    }
}

/// Invariant mass of the selected momenta and its gradient over the state.
fn mass_and_gradient(state: &DVector<f64>, indices: &[usize], masses: &[f64]) -> (f64, DVector<f64>) {
    let mut e_tot = 0.0;
    let mut p_tot = Vector3::zeros();
    let mut energies = Vec::with_capacity(indices.len());
    for (&i, &m) in indices.iter().zip(masses) {
        let p = momentum_in(state, i);
        let e = (p.norm_squared() + m * m).sqrt();
        energies.push(e);
        e_tot += e;
        p_tot += p;
    }
    let mass = (e_tot * e_tot - p_tot.norm_squared()).max(0.0).sqrt();

    let mut grad = DVector::zeros(state.len());
    if mass > 0.0 {
        for (&i, &e) in indices.iter().zip(&energies) {
            let g = (momentum_in(state, i) * (e_tot / e) - p_tot) / mass;
            let o = 3 + 3 * i;
            for r in 0..3 {
                grad[o + r] += g[r];
            }
        }
    }
    (mass, grad)
}

// ============================================================================
// TESTS
// ============================================================================
