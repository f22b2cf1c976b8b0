//! The "VERTEX" Engine - Iterative Linear Vertex Fitting
//!
//! Finds the common origin of N tracks (charged helices and neutral lines),
//! optionally pulled towards a Gaussian external constraint such as the
//! beam spot. Each track is re-linearized around its current "updated"
//! parameters every iteration, so the fit also returns the track parameters
//! steered to the vertex together with their covariance.
//!
//! Pipeline:
//! 1. **Fast estimate**: linearize every track at its start phase with
//!    unmodified parameters and solve the weighted least-squares system once
//! 2. **Re-linearization**: iterate until the vertex shift, measured in the
//!    Hessian metric, drops below tolerance
//! 3. **Error propagation**: vertex covariance, updated track covariances and
//!    the derivative queries the post-processor needs
//!
//! Results are computed lazily and cached; every mutation of the track list
//! or of the constraint clears the cache and the per-track work arrays.

use crate::error::VertexError;
use crate::trackcov_helix::{line_distance, max_radius, TrackState};
use crate::trackcov_linalg::{regularized_inverse_fixed, symmetrize};
use nalgebra::{Matrix3, Matrix3x5, Matrix5, Matrix5x3, RowVector3, RowVector5, Vector3, Vector5};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trackcov_env::{NumericsObserver, RecoveryEvent, RecoveryKind, SilentObserver};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the VertexFit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexFitConfig {
    /// Maximum re-linearization iterations (default: 100)
    pub max_iterations: usize,

    /// Convergence threshold on `dxᵀ H dx` (default: 1e-12)
    pub tolerance: f64,
}

impl Default for VertexFitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1.0e-12,
        }
    }
}

/// Gaussian prior on the vertex position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexConstraint {
    /// Mean position
    pub mean: Vector3<f64>,

    /// 3×3 covariance
    pub covariance: Matrix3<f64>,
}

// ============================================================================
// FIT RESULT
// ============================================================================

/// Everything a converged (or capped) fit produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Fitted vertex position
    pub vertex: Vector3<f64>,

    /// Vertex covariance (3×3, symmetric)
    pub covariance: Matrix3<f64>,

    /// Total χ², constraint term included
    pub chi_square: f64,

    /// Per-track χ² contributions
    pub chi_square_list: Vec<f64>,

    /// Tracks re-linearized at the vertex
    pub updated_tracks: Vec<TrackState>,

    /// Phase of each track at the vertex
    pub phases: Vec<f64>,

    /// Re-linearization iterations performed
    pub iterations: usize,

    /// False when the iteration cap was hit
    pub converged: bool,

    /// Degrees of freedom, `2N - 3` (+3 with a constraint)
    pub ndof: usize,
}

impl FitResult {
    /// χ² per degree of freedom.
    pub fn chi_square_per_dof(&self) -> f64 {
        if self.ndof > 0 {
            self.chi_square / self.ndof as f64
        } else {
            0.0
        }
    }
}

/// Lifecycle of a [`VertexFit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStage {
    /// No tracks and no constraint
    Empty,
    /// Inputs present, no valid cached result
    TracksLoaded,
    /// Cached result is valid
    Converged,
}

// ============================================================================
// WORK ARRAYS
// ============================================================================

/// Per-track arrays, indexed by track position.
///
/// Rebuilt from scratch at the start of every fit and cleared whenever the
/// track list changes.
#[derive(Debug, Clone, Default)]
struct FitWorkspace {
    phases: Vec<f64>,
    params: Vec<Vector5<f64>>,
    positions: Vec<Vector3<f64>>,
    offsets: Vec<Vector3<f64>>,
    jacobians: Vec<Matrix3x5<f64>>,
    tangents: Vec<Vector3<f64>>,
    weights: Vec<Matrix3<f64>>,
    weight_inverses: Vec<Matrix3<f64>>,
    d_matrices: Vec<Matrix3<f64>>,
    tangent_norms: Vec<f64>,
    hessian_inverse: Matrix3<f64>,
    constraint_weight: Option<Matrix3<f64>>,
}

impl FitWorkspace {
    fn clear(&mut self) {
        *self = Self::default();
    }

    fn reset(&mut self, n: usize) {
        self.clear();
        self.phases = vec![0.0; n];
        self.params = vec![Vector5::zeros(); n];
        self.positions = vec![Vector3::zeros(); n];
        self.offsets = vec![Vector3::zeros(); n];
        self.jacobians = vec![Matrix3x5::zeros(); n];
        self.tangents = vec![Vector3::zeros(); n];
        self.weights = vec![Matrix3::zeros(); n];
        self.weight_inverses = vec![Matrix3::zeros(); n];
        self.d_matrices = vec![Matrix3::zeros(); n];
        self.tangent_norms = vec![0.0; n];
    }
}

// ============================================================================
// VERTEX FIT
// ============================================================================

/// Iterative linear vertex fitter with track-parameter steering.
pub struct VertexFit {
    config: VertexFitConfig,
    tracks: Vec<TrackState>,
    constraint: Option<VertexConstraint>,
    start_radius: Option<f64>,
    observer: Arc<dyn NumericsObserver>,
    workspace: FitWorkspace,
    result: Option<FitResult>,
}

impl std::fmt::Debug for VertexFit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VertexFit")
            .field("config", &self.config)
            .field("tracks", &self.tracks.len())
            .field("constraint", &self.constraint.is_some())
            .field("start_radius", &self.start_radius)
            .field("stage", &self.stage())
            .finish()
    }
}

impl VertexFit {
    /// Create an empty fitter with the given configuration.
    pub fn new(config: VertexFitConfig) -> Self {
        Self {
            config,
            tracks: Vec::new(),
            constraint: None,
            start_radius: None,
            observer: Arc::new(SilentObserver),
            workspace: FitWorkspace::default(),
            result: None,
        }
    }

    /// Create an empty fitter with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(VertexFitConfig::default())
    }

    /// Route numerical recoveries to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn NumericsObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Fit configuration.
    pub fn config(&self) -> &VertexFitConfig {
        &self.config
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> FitStage {
        if self.result.is_some() {
            FitStage::Converged
        } else if self.tracks.is_empty() && self.constraint.is_none() {
            FitStage::Empty
        } else {
            FitStage::TracksLoaded
        }
    }

    fn invalidate(&mut self) {
        self.result = None;
        self.workspace.clear();
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Add a charged track `(D, phi0, C, z0, cotTheta)`.
    pub fn add_track(&mut self, params: Vector5<f64>, covariance: Matrix5<f64>) {
        self.add_state(TrackState::charged(params, covariance));
    }

    /// Add a neutral track `(D, phi0, pt, z0, cotTheta)`.
    pub fn add_neutral(&mut self, params: Vector5<f64>, covariance: Matrix5<f64>) {
        self.add_state(TrackState::neutral(params, covariance));
    }

    /// Add a track state as-is.
    pub fn add_state(&mut self, track: TrackState) {
        self.tracks.push(track);
        self.invalidate();
    }

    /// Add charged tracks from parallel parameter and covariance lists.
    pub fn add_tracks(
        &mut self,
        params: &[Vector5<f64>],
        covariances: &[Matrix5<f64>],
    ) -> Result<(), VertexError> {
        if params.len() != covariances.len() {
            return Err(VertexError::unsupported(format!(
                "{} parameter vectors but {} covariance matrices",
                params.len(),
                covariances.len()
            )));
        }
        for (par, cov) in params.iter().zip(covariances) {
            self.tracks.push(TrackState::charged(*par, *cov));
        }
        self.invalidate();
        Ok(())
    }

    /// Remove and return track `index`.
    pub fn remove_track(&mut self, index: usize) -> Result<TrackState, VertexError> {
        self.check_index(index)?;
        let removed = self.tracks.remove(index);
        self.invalidate();
        Ok(removed)
    }

    /// Attach a Gaussian vertex constraint; its mean also seeds the fit.
    pub fn add_vertex_constraint(&mut self, mean: Vector3<f64>, covariance: Matrix3<f64>) {
        self.constraint = Some(VertexConstraint { mean, covariance: symmetrize(&covariance) });
        self.invalidate();
    }

    /// Start the fast estimate at the crossing with radius `radius`.
    ///
    /// Only tracks that actually reach `radius` use it; the others start at
    /// their point of closest approach. Takes precedence over the radius of
    /// a constraint mean.
    pub fn set_start_radius(&mut self, radius: f64) {
        self.start_radius = Some(radius);
        self.invalidate();
    }

    /// Start radius hint, if any.
    pub fn start_radius(&self) -> Option<f64> {
        self.start_radius
    }

    /// Number of input tracks.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Input track `index`.
    pub fn input_track(&self, index: usize) -> Option<&TrackState> {
        self.tracks.get(index)
    }

    /// Vertex constraint, if any.
    pub fn constraint(&self) -> Option<&VertexConstraint> {
        self.constraint.as_ref()
    }

    fn check_index(&self, index: usize) -> Result<(), VertexError> {
        if index < self.tracks.len() {
            Ok(())
        } else {
            Err(VertexError::InvalidTrackIndex { index, count: self.tracks.len() })
        }
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    /// Run the fit if needed and return the cached result.
    pub fn fit(&mut self) -> Result<&FitResult, VertexError> {
        if self.result.is_none() {
            let result = self.run_fit()?;
            self.result = Some(result);
        }
        self.result.as_ref().ok_or(VertexError::NotFitted)
    }

    /// Fitted vertex position.
    pub fn vertex(&mut self) -> Result<Vector3<f64>, VertexError> {
        Ok(self.fit()?.vertex)
    }

    /// Vertex covariance.
    pub fn vertex_covariance(&mut self) -> Result<Matrix3<f64>, VertexError> {
        Ok(self.fit()?.covariance)
    }

    /// Total χ².
    pub fn chi_square(&mut self) -> Result<f64, VertexError> {
        Ok(self.fit()?.chi_square)
    }

    /// Per-track χ² contributions.
    pub fn chi_square_list(&mut self) -> Result<Vec<f64>, VertexError> {
        Ok(self.fit()?.chi_square_list.clone())
    }

    /// Track `index` re-linearized at the vertex.
    pub fn updated_track(&mut self, index: usize) -> Result<TrackState, VertexError> {
        self.check_index(index)?;
        Ok(self.fit()?.updated_tracks[index].clone())
    }

    /// Phase of track `index` at the vertex.
    pub fn phase(&mut self, index: usize) -> Result<f64, VertexError> {
        self.check_index(index)?;
        Ok(self.fit()?.phases[index])
    }

    // ------------------------------------------------------------------------
    // Derivative queries
    // ------------------------------------------------------------------------

    /// `d vertex / d initial params of track k` (3×5).
    pub fn d_vertex_d_params(&mut self, k: usize) -> Result<Matrix3x5<f64>, VertexError> {
        self.check_index(k)?;
        self.fit()?;
        Ok(self.dx_dpar(k))
    }

    /// `d vertex / d constraint mean` (3×3); zero without a constraint.
    pub fn d_vertex_d_constraint(&mut self) -> Result<Matrix3<f64>, VertexError> {
        self.fit()?;
        Ok(self.dx_dconstraint().unwrap_or_else(Matrix3::zeros))
    }

    /// `d updated params of track i / d initial params of track k` (5×5).
    pub fn d_params_d_initial(&mut self, i: usize, k: usize) -> Result<Matrix5<f64>, VertexError> {
        self.check_index(i)?;
        self.check_index(k)?;
        self.fit()?;
        Ok(self.dpar_dpar(i, k))
    }

    /// `d updated params of track i / d constraint mean` (5×3).
    pub fn d_params_d_constraint(&mut self, i: usize) -> Result<Matrix5x3<f64>, VertexError> {
        self.check_index(i)?;
        self.fit()?;
        Ok(self.dpar_dconstraint(i).unwrap_or_else(Matrix5x3::zeros))
    }

    /// `d phase of track i / d initial params of track k` (1×5).
    pub fn d_phase_d_initial(&mut self, i: usize, k: usize) -> Result<RowVector5<f64>, VertexError> {
        self.check_index(i)?;
        self.check_index(k)?;
        self.fit()?;
        Ok(self.dphase_dpar(i, k))
    }

    /// `d phase of track i / d constraint mean` (1×3).
    pub fn d_phase_d_constraint(&mut self, i: usize) -> Result<RowVector3<f64>, VertexError> {
        self.check_index(i)?;
        self.fit()?;
        Ok(self.dphase_dconstraint(i))
    }

    /// Covariance between the updated parameters of tracks `i` and `j`.
    pub fn updated_cross_covariance(&mut self, i: usize, j: usize) -> Result<Matrix5<f64>, VertexError> {
        self.check_index(i)?;
        self.check_index(j)?;
        self.fit()?;
        Ok(self.cross_covariance(i, j))
    }

    /// Covariance between the vertex and the updated parameters of track `i`.
    pub fn vertex_track_covariance(&mut self, i: usize) -> Result<Matrix3x5<f64>, VertexError> {
        self.check_index(i)?;
        self.fit()?;
        let mut cov = Matrix3x5::zeros();
        for k in 0..self.tracks.len() {
            cov += self.dx_dpar(k) * self.tracks[k].covariance * self.dpar_dpar(i, k).transpose();
        }
        if let (Some(dx), Some(da), Some(c)) =
            (self.dx_dconstraint(), self.dpar_dconstraint(i), self.constraint.as_ref())
        {
            cov += dx * c.covariance * da.transpose();
        }
        Ok(cov)
    }

    /// Radius estimate for [`set_start_radius`](Self::set_start_radius).
    ///
    /// Takes the track pair closest to orthogonal in `phi0`, intersects their
    /// tangent lines at closest approach with a second-order curvature
    /// correction and damps the result towards the largest `|D|`. Never
    /// applied automatically.
    pub fn estimate_start_radius(&self) -> Option<f64> {
        let n = self.tracks.len();
        if n < 2 {
            return None;
        }
        let max_d = self.tracks.iter().map(|t| t.params[0].abs()).fold(0.0, f64::max);

        let mut best: Option<(usize, usize)> = None;
        let mut best_sin = 0.0;
        for i in 0..n - 1 {
            for j in (i + 1)..n {
                let dphi = self.tracks[j].params[1] - self.tracks[i].params[1];
                let sin = dphi.sin().abs();
                if sin > best_sin {
                    best_sin = sin;
                    best = Some((i, j));
                }
            }
        }
        let (i, j) = best?;
        let (t1, t2) = (&self.tracks[i], &self.tracks[j]);
        let dir = |t: &TrackState| {
            let (sin, cos) = t.params[1].sin_cos();
            Vector3::new(cos, sin, t.params[4])
        };
        let approach = line_distance(&t1.reference_point(), &t2.reference_point(), &dir(t1), &dir(t2));

        let bend = |t: &TrackState, l: f64| {
            let mut x = t.reference_point() + dir(t) * l;
            if t.charged {
                let (sin, cos) = t.params[1].sin_cos();
                let c = t.params[2];
                x.x -= c * l * l * sin;
                x.y += c * l * l * cos;
            }
            x
        };
        let mid = (bend(t1, approach.sx) + bend(t2, approach.sy)) * 0.5;
        let radius = mid.x.hypot(mid.y);
        Some(0.9 * radius + 0.1 * max_d)
    }

    /// `count` start radii spread evenly between the largest `|D|` and the
    /// smallest radius every charged track still reaches.
    ///
    /// Meant for a retry scan when neither the default start nor
    /// [`estimate_start_radius`](Self::estimate_start_radius) finds the
    /// right crossing. Empty without charged tracks or when that band is
    /// empty.
    pub fn start_radius_candidates(&self, count: usize) -> Vec<f64> {
        let lo = self.tracks.iter().map(|t| t.params[0].abs()).fold(0.0, f64::max);
        let hi = self
            .tracks
            .iter()
            .filter(|t| t.charged)
            .map(|t| max_radius(&t.params))
            .fold(f64::INFINITY, f64::min);
        if count == 0 || !hi.is_finite() || hi <= lo {
            return Vec::new();
        }
        let step = (hi - lo) / count as f64;
        (0..count).map(|k| lo + step * (k as f64 + 0.5)).collect()
    }

    // ------------------------------------------------------------------------
    // Fit engine
    // ------------------------------------------------------------------------

    fn required_tracks(&self) -> usize {
        if self.constraint.is_some() {
            1
        } else {
            2
        }
    }

    /// The explicit start radius, else the transverse radius of the
    /// constraint mean.
    fn seed_radius(&self) -> Option<f64> {
        self.start_radius.or_else(|| {
            self.constraint
                .as_ref()
                .map(|c| c.mean.x.hypot(c.mean.y))
                .filter(|r| *r > 0.0)
        })
    }

    fn start_phase(&self, track: &TrackState, seed: Option<f64>) -> f64 {
        match seed {
            Some(r) if track.reaches_radius(r) => track.phase_at_radius(r),
            _ => 0.0,
        }
    }

    /// Linearize track `i` at its current parameters and phase.
    fn update_track_arrays(&mut self, i: usize) {
        let track = &self.tracks[i];
        let observer = self.observer.as_ref();
        let ws = &mut self.workspace;

        let par = ws.params[i];
        let s = ws.phases[i];
        let moved = TrackState { params: par, covariance: track.covariance, charged: track.charged };
        let x0 = moved.position_at(s);
        let a_mat = moved.d_position_d_params(s);
        let tangent = moved.direction_at(s);

        let offset = a_mat * (par - track.params);
        let weight_inv = symmetrize(&(a_mat * track.covariance * a_mat.transpose()));
        let weight = regularized_inverse_fixed(&weight_inv, observer, "vertex_fit.track_weight");
        let wa = weight * tangent;
        let a2 = tangent.dot(&wa);
        let d_matrix = if a2 > 0.0 {
            symmetrize(&(weight - wa * wa.transpose() / a2))
        } else {
            weight
        };

        ws.positions[i] = x0;
        ws.offsets[i] = offset;
        ws.jacobians[i] = a_mat;
        ws.tangents[i] = tangent;
        ws.weights[i] = weight;
        ws.weight_inverses[i] = weight_inv;
        ws.d_matrices[i] = d_matrix;
        ws.tangent_norms[i] = a2;
    }

    /// `H = Σ D_i (+ Cc⁻¹)`, `c = Σ D_i (x0_i - d_i) (+ Cc⁻¹ xc)`.
    fn normal_equations(&self) -> (Matrix3<f64>, Vector3<f64>) {
        let ws = &self.workspace;
        let mut hessian = Matrix3::zeros();
        let mut rhs = Vector3::zeros();
        for i in 0..self.tracks.len() {
            hessian += ws.d_matrices[i];
            rhs += ws.d_matrices[i] * (ws.positions[i] - ws.offsets[i]);
        }
        if let (Some(cw), Some(c)) = (ws.constraint_weight, self.constraint.as_ref()) {
            hessian += cw;
            rhs += cw * c.mean;
        }
        (symmetrize(&hessian), rhs)
    }

    fn phase_step(&self, i: usize, vertex: &Vector3<f64>) -> f64 {
        let ws = &self.workspace;
        if ws.tangent_norms[i] > 0.0 {
            (ws.weights[i] * ws.tangents[i]).dot(&(vertex - ws.positions[i])) / ws.tangent_norms[i]
        } else {
            0.0
        }
    }

    fn run_fit(&mut self) -> Result<FitResult, VertexError> {
        let n = self.tracks.len();
        let required = self.required_tracks();
        if n < required {
            return Err(VertexError::InsufficientTracks { found: n, required });
        }

        self.workspace.reset(n);
        self.workspace.constraint_weight = self.constraint.as_ref().map(|c| {
            regularized_inverse_fixed(&c.covariance, self.observer.as_ref(), "vertex_fit.constraint")
        });

        // Stage 1: fast estimate at the start phases with input parameters
        let seed = self.seed_radius();
        for i in 0..n {
            let phase = self.start_phase(&self.tracks[i], seed);
            self.workspace.phases[i] = phase;
            self.workspace.params[i] = self.tracks[i].params;
        }
        for i in 0..n {
            self.update_track_arrays(i);
        }
        let (hessian, rhs) = self.normal_equations();
        let h_inv = regularized_inverse_fixed(&hessian, self.observer.as_ref(), "vertex_fit.hessian");
        let mut vertex = h_inv * rhs;
        if !vertex.iter().all(|v| v.is_finite()) {
            vertex = self.constraint.as_ref().map(|c| c.mean).unwrap_or_else(Vector3::zeros);
        }
        for i in 0..n {
            let step = self.phase_step(i, &vertex);
            self.workspace.phases[i] += step;
        }

        // Stage 2: re-linearize
        let mut converged = false;
        let mut iterations = 0;
        let mut chi_square_list = vec![0.0; n];
        let mut chi_square = 0.0;
        let mut inverted = false;

        while iterations < self.config.max_iterations {
            iterations += 1;
            for i in 0..n {
                self.update_track_arrays(i);
            }
            let (hessian, rhs) = self.normal_equations();
            let h_inv = regularized_inverse_fixed(&hessian, self.observer.as_ref(), "vertex_fit.hessian");
            let new_vertex = h_inv * rhs;
            if !new_vertex.iter().all(|v| v.is_finite()) {
                break;
            }
            self.workspace.hessian_inverse = h_inv;
            inverted = true;

            chi_square = 0.0;
            for i in 0..n {
                let ws = &self.workspace;
                let lambda = ws.d_matrices[i] * (ws.positions[i] - new_vertex - ws.offsets[i]);
                chi_square_list[i] = lambda.dot(&(ws.weight_inverses[i] * lambda));
                chi_square += chi_square_list[i];

                let step = self.phase_step(i, &new_vertex);
                let track = &self.tracks[i];
                let steered = track.params
                    - track.covariance * self.workspace.jacobians[i].transpose() * lambda;
                self.workspace.phases[i] += step;
                self.workspace.params[i] = steered;
            }
            if let (Some(cw), Some(c)) = (self.workspace.constraint_weight, self.constraint.as_ref()) {
                let r = new_vertex - c.mean;
                chi_square += r.dot(&(cw * r));
            }

            let dx = new_vertex - vertex;
            let shift = dx.dot(&(hessian * dx));
            vertex = new_vertex;
            if shift < self.config.tolerance {
                converged = true;
                break;
            }
        }

        if !inverted {
            return Err(VertexError::NonFiniteVertex { iterations });
        }
        if !converged {
            self.observer.on_recovery(
                &RecoveryEvent::new(RecoveryKind::NonConvergence, "vertex_fit", n)
                    .with_detail(format!("stopped after {} iterations", iterations)),
            );
        }

        let updated_tracks = (0..n)
            .map(|i| TrackState {
                params: self.workspace.params[i],
                covariance: symmetrize(&self.cross_covariance(i, i)),
                charged: self.tracks[i].charged,
            })
            .collect();

        let ndof = if self.constraint.is_some() { 2 * n } else { 2 * n - 3 };

        Ok(FitResult {
            vertex,
            covariance: symmetrize(&self.workspace.hessian_inverse),
            chi_square,
            chi_square_list,
            updated_tracks,
            phases: self.workspace.phases.clone(),
            iterations,
            converged,
            ndof,
        })
    }

    // ------------------------------------------------------------------------
    // Derivatives from the cached work arrays
    // ------------------------------------------------------------------------

    /// `Cov_i A_iᵀ D_i` (5×3).
    fn gain(&self, i: usize) -> Matrix5x3<f64> {
        let ws = &self.workspace;
        self.tracks[i].covariance * ws.jacobians[i].transpose() * ws.d_matrices[i]
    }

    fn dx_dpar(&self, k: usize) -> Matrix3x5<f64> {
        let ws = &self.workspace;
        ws.hessian_inverse * ws.d_matrices[k] * ws.jacobians[k]
    }

    fn dx_dconstraint(&self) -> Option<Matrix3<f64>> {
        let ws = &self.workspace;
        ws.constraint_weight.map(|cw| ws.hessian_inverse * cw)
    }

    fn dpar_dpar(&self, i: usize, k: usize) -> Matrix5<f64> {
        let gain = self.gain(i);
        let mut jac = gain * self.dx_dpar(k);
        if i == k {
            jac += Matrix5::identity() - gain * self.workspace.jacobians[i];
        }
        jac
    }

    fn dpar_dconstraint(&self, i: usize) -> Option<Matrix5x3<f64>> {
        self.dx_dconstraint().map(|dx| self.gain(i) * dx)
    }

    fn phase_projector(&self, i: usize) -> RowVector3<f64> {
        let ws = &self.workspace;
        if ws.tangent_norms[i] > 0.0 {
            (ws.weights[i] * ws.tangents[i]).transpose() / ws.tangent_norms[i]
        } else {
            RowVector3::zeros()
        }
    }

    fn dphase_dpar(&self, i: usize, k: usize) -> RowVector5<f64> {
        let a_mat = self.workspace.jacobians[i];
        self.phase_projector(i) * (self.dx_dpar(k) - a_mat * self.dpar_dpar(i, k))
    }

    fn dphase_dconstraint(&self, i: usize) -> RowVector3<f64> {
        match (self.dx_dconstraint(), self.dpar_dconstraint(i)) {
            (Some(dx), Some(da)) => self.phase_projector(i) * (dx - self.workspace.jacobians[i] * da),
            _ => RowVector3::zeros(),
        }
    }

    fn cross_covariance(&self, i: usize, j: usize) -> Matrix5<f64> {
        let mut cov = Matrix5::zeros();
        for k in 0..self.tracks.len() {
            cov += self.dpar_dpar(i, k) * self.tracks[k].covariance * self.dpar_dpar(j, k).transpose();
        }
        if let (Some(di), Some(dj), Some(c)) =
            (self.dpar_dconstraint(i), self.dpar_dconstraint(j), self.constraint.as_ref())
        {
            cov += di * c.covariance * dj.transpose();
        }
        cov
    }

    // ------------------------------------------------------------------------
    // Crate-internal accessors for the post-processor
    // ------------------------------------------------------------------------

    pub(crate) fn observer(&self) -> Arc<dyn NumericsObserver> {
        Arc::clone(&self.observer)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackcov_helix::{params_from_position_momentum, params_from_position_momentum_neutral};
    use crate::trackcov_linalg::check_positive_definite_fixed;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BZ: f64 = 2.0;

    fn resolution() -> Matrix5<f64> {
        Matrix5::from_diagonal(&Vector5::new(1.0e-10, 1.0e-8, 1.0e-12, 1.0e-10, 1.0e-8))
    }

    fn track_through(vertex: &Vector3<f64>, p: Vector3<f64>, q: f64) -> TrackState {
        TrackState::charged(params_from_position_momentum(vertex, &p, q, BZ), resolution())
    }

    fn three_prong(vertex: &Vector3<f64>) -> VertexFit {
        let mut fit = VertexFit::with_defaults();
        fit.add_state(track_through(vertex, Vector3::new(1.0, 0.2, 0.3), 1.0));
        fit.add_state(track_through(vertex, Vector3::new(-0.4, 1.5, -0.2), -1.0));
        fit.add_state(track_through(vertex, Vector3::new(-0.3, -0.9, 0.6), 1.0));
        fit
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl NumericsObserver for Counter {
        fn on_recovery(&self, _event: &RecoveryEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_insufficient_tracks() {
        let mut fit = VertexFit::with_defaults();
        assert_eq!(fit.stage(), FitStage::Empty);
        assert_eq!(
            fit.vertex().unwrap_err(),
            VertexError::InsufficientTracks { found: 0, required: 2 }
        );
        fit.add_state(track_through(&Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), 1.0));
        assert!(matches!(fit.chi_square(), Err(VertexError::InsufficientTracks { found: 1, .. })));

        // A constraint lowers the floor to one track
        fit.add_vertex_constraint(Vector3::zeros(), Matrix3::identity() * 1.0e-8);
        assert!(fit.vertex().is_ok());
    }

    #[test]
    fn test_two_track_exact_vertex() {
        let v = Vector3::new(0.002, -0.001, 0.004);
        let mut fit = VertexFit::with_defaults();
        fit.add_state(track_through(&v, Vector3::new(2.0, 1.0, 0.5), 1.0));
        fit.add_state(track_through(&v, Vector3::new(-0.5, 1.8, -0.3), -1.0));

        let result = fit.fit().unwrap().clone();
        assert!(result.converged);
        assert_relative_eq!(result.vertex, v, epsilon = 1e-9);
        assert!(result.chi_square.abs() < 1e-8);
        assert_eq!(result.ndof, 1);
        assert_eq!(fit.stage(), FitStage::Converged);
    }

    #[test]
    fn test_three_track_end_to_end() {
        let cov = Matrix5::identity() * 1.0e-4;
        let mut fit = VertexFit::with_defaults();
        let inputs: Vec<Vector5<f64>> = [0.0, 2.0 * PI / 3.0, 4.0 * PI / 3.0]
            .iter()
            .zip([0.01, -0.01, 0.01])
            .map(|(&phi, c)| Vector5::new(0.0, phi, c, 0.0, 1.0))
            .collect();
        for par in &inputs {
            fit.add_track(*par, cov);
        }

        let result = fit.fit().unwrap().clone();
        assert!(result.vertex.norm() < 1e-6);
        assert!(result.chi_square_per_dof() < 1e-10);
        assert_eq!(result.ndof, 3);
        for (updated, input) in result.updated_tracks.iter().zip(&inputs) {
            for k in 0..5 {
                assert!((updated.params[k] - input[k]).abs() <= cov[(k, k)].sqrt());
            }
        }
    }

    #[test]
    fn test_covariances_positive_definite_and_symmetric() {
        let mut fit = three_prong(&Vector3::new(0.001, 0.002, -0.003));
        let result = fit.fit().unwrap().clone();
        assert!(check_positive_definite_fixed(&result.covariance));
        assert_relative_eq!(result.covariance, result.covariance.transpose(), epsilon = 0.0);
        for track in &result.updated_tracks {
            assert!(check_positive_definite_fixed(&track.covariance));
            assert_relative_eq!(track.covariance, track.covariance.transpose(), epsilon = 0.0);
        }
    }

    #[test]
    fn test_loose_constraint_does_not_move_vertex() {
        let v = Vector3::new(0.001, 0.002, -0.003);
        let mut free = three_prong(&v);
        // Displace one track slightly so the fit has a residual
        let mut shifted = free.input_track(0).cloned().unwrap();
        shifted.params[0] += 2.0e-5;
        free.remove_track(0).unwrap();
        free.add_state(shifted);

        let free_result = free.fit().unwrap().clone();

        let mut constrained = VertexFit::with_defaults();
        for i in 0..free.track_count() {
            constrained.add_state(free.input_track(i).cloned().unwrap());
        }
        constrained.add_vertex_constraint(Vector3::zeros(), Matrix3::identity() * 1.0e6);
        let constrained_result = constrained.fit().unwrap().clone();

        let sigma = free_result.covariance.diagonal().map(f64::sqrt);
        let diff = constrained_result.vertex - free_result.vertex;
        for k in 0..3 {
            assert!(diff[k].abs() < 1.0e-3 * sigma[k]);
        }
    }

    #[test]
    fn test_mutations_invalidate_cache() {
        let mut fit = three_prong(&Vector3::zeros());
        fit.fit().unwrap();
        assert_eq!(fit.stage(), FitStage::Converged);
        fit.remove_track(2).unwrap();
        assert_eq!(fit.stage(), FitStage::TracksLoaded);
        assert_eq!(fit.chi_square_list().unwrap().len(), 2);
        fit.set_start_radius(0.01);
        assert_eq!(fit.stage(), FitStage::TracksLoaded);
    }

    #[test]
    fn test_invalid_index() {
        let mut fit = three_prong(&Vector3::zeros());
        assert_eq!(
            fit.updated_track(3).unwrap_err(),
            VertexError::InvalidTrackIndex { index: 3, count: 3 }
        );
        assert!(fit.remove_track(7).is_err());
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let mut fit = VertexFit::with_defaults();
        let err = fit.add_tracks(&[Vector5::zeros(), Vector5::zeros()], &[resolution()]);
        assert!(matches!(err, Err(VertexError::UnsupportedOperation(_))));
        assert_eq!(fit.track_count(), 0);
    }

    #[test]
    fn test_neutral_track_joins_vertex() {
        let v = Vector3::new(0.003, 0.001, 0.002);
        let mut fit = VertexFit::with_defaults();
        fit.add_state(track_through(&v, Vector3::new(1.0, 0.5, 0.2), 1.0));
        fit.add_state(track_through(&v, Vector3::new(-0.8, 1.0, 0.1), -1.0));
        let neutral = params_from_position_momentum_neutral(&v, &Vector3::new(0.3, -1.2, 0.4));
        fit.add_neutral(neutral, resolution());

        let result = fit.fit().unwrap().clone();
        assert!(result.converged);
        assert_relative_eq!(result.vertex, v, epsilon = 1e-9);
        assert!(!result.updated_tracks[2].charged);
    }

    #[test]
    fn test_displaced_vertex_with_start_radius() {
        let v = Vector3::new(0.20, 0.12, 0.05);
        let mut fit = VertexFit::with_defaults();
        fit.add_state(track_through(&v, Vector3::new(0.6, 0.5, 0.1), 1.0));
        fit.add_state(track_through(&v, Vector3::new(0.7, -0.1, 0.2), -1.0));

        let estimate = fit.estimate_start_radius().unwrap();
        let r = v.x.hypot(v.y);
        assert!(estimate > 0.5 * r && estimate < 1.1 * r);

        fit.set_start_radius(estimate);
        let result = fit.fit().unwrap().clone();
        assert!(result.converged);
        assert_relative_eq!(result.vertex, v, epsilon = 1e-8);
    }

    #[test]
    fn test_vertex_derivative_matches_refit() {
        let v = Vector3::new(0.001, 0.002, -0.003);
        let mut base = three_prong(&v);
        let mut track0 = base.input_track(0).cloned().unwrap();
        track0.params[0] += 1.0e-5;
        track0.params[3] -= 2.0e-5;
        base.remove_track(0).unwrap();
        base.add_state(track0);

        let analytic = base.d_vertex_d_params(1).unwrap();
        let x0 = base.vertex().unwrap();
        for m in [0usize, 1, 3] {
            let h = 1.0e-5;
            let mut plus = VertexFit::with_defaults();
            let mut minus = VertexFit::with_defaults();
            for i in 0..base.track_count() {
                let mut tp = base.input_track(i).cloned().unwrap();
                let mut tm = tp.clone();
                if i == 1 {
                    tp.params[m] += h;
                    tm.params[m] -= h;
                }
                plus.add_state(tp);
                minus.add_state(tm);
            }
            let numeric = (plus.vertex().unwrap() - minus.vertex().unwrap()) / (2.0 * h);
            let scale = analytic.column(m).norm().max(1e-6);
            assert!((analytic.column(m) - numeric).norm() < 1e-3 * scale + 1e-7);
        }
        assert!(x0.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_updated_covariance_matches_cross_covariance() {
        let mut fit = three_prong(&Vector3::new(0.0, 0.001, 0.0));
        let updated = fit.updated_track(1).unwrap();
        let cross = fit.updated_cross_covariance(1, 1).unwrap();
        assert_relative_eq!(updated.covariance, symmetrize(&cross), epsilon = 1e-20);
        let c01 = fit.updated_cross_covariance(0, 1).unwrap();
        let c10 = fit.updated_cross_covariance(1, 0).unwrap();
        assert_relative_eq!(c01, c10.transpose(), epsilon = 1e-20);
    }

    #[test]
    fn test_vertex_covariance_equals_propagated_inputs() {
        let mut fit = three_prong(&Vector3::new(0.0, 0.001, 0.0));
        let cov = fit.vertex_covariance().unwrap();
        let mut propagated = Matrix3::zeros();
        for k in 0..fit.track_count() {
            let j = fit.d_vertex_d_params(k).unwrap();
            propagated += j * fit.input_track(k).unwrap().covariance * j.transpose();
        }
        assert_relative_eq!(cov, propagated, max_relative = 1e-6, epsilon = 1e-20);
    }

    #[test]
    fn test_non_convergence_is_flagged() {
        let counter = Arc::new(Counter::default());
        let config = VertexFitConfig { max_iterations: 2, tolerance: 0.0 };
        let mut fit = VertexFit::new(config).with_observer(counter.clone());
        fit.add_state(track_through(&Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), 1.0));
        fit.add_state(track_through(&Vector3::zeros(), Vector3::new(0.0, 1.0, 0.0), -1.0));
        let result = fit.fit().unwrap().clone();
        assert!(!result.converged);
        assert_eq!(result.iterations, 2);
        assert!(counter.0.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_non_finite_input_is_an_error() {
        let mut fit = three_prong(&Vector3::zeros());
        let mut broken = fit.input_track(0).cloned().unwrap();
        broken.params[0] = f64::NAN;
        fit.remove_track(0).unwrap();
        fit.add_state(broken);

        assert_eq!(fit.fit().unwrap_err(), VertexError::NonFiniteVertex { iterations: 1 });
        assert_eq!(fit.stage(), FitStage::TracksLoaded);
        assert!(fit.vertex_covariance().is_err());
    }

    #[test]
    fn test_constraint_mean_seeds_start_radius() {
        let v = Vector3::new(0.25, 0.15, 0.05);
        let track = track_through(&v, Vector3::new(0.5, 0.3, 0.1), 1.0);
        let r = v.x.hypot(v.y);
        assert!(track.reaches_radius(r));

        let mut fit = VertexFit::with_defaults();
        fit.add_state(track.clone());
        fit.add_vertex_constraint(v, Matrix3::identity() * 1.0e-10);
        assert_eq!(fit.start_radius(), None);
        assert_relative_eq!(fit.seed_radius().unwrap(), r, epsilon = 1e-15);

        let result = fit.fit().unwrap().clone();
        assert!(result.converged);
        assert_eq!(result.ndof, 2);
        assert_relative_eq!(result.vertex, v, epsilon = 1e-6);
        assert_relative_eq!(result.phases[0], track.phase_at_radius(r), epsilon = 1e-4);
        assert!(result.chi_square < 1e-6);
        assert!(check_positive_definite_fixed(&result.covariance));

        // An explicit hint wins over the constraint
        fit.set_start_radius(0.1);
        assert_eq!(fit.seed_radius(), Some(0.1));
    }

    #[test]
    fn test_centered_constraint_does_not_seed() {
        let mut fit = three_prong(&Vector3::zeros());
        fit.add_vertex_constraint(Vector3::new(0.0, 0.0, 0.02), Matrix3::identity() * 1.0e-6);
        assert_eq!(fit.seed_radius(), None);
    }

    #[test]
    fn test_start_radius_candidates_span_reachable_band() {
        let v = Vector3::new(0.20, 0.12, 0.05);
        let mut fit = VertexFit::with_defaults();
        fit.add_state(track_through(&v, Vector3::new(0.6, 0.5, 0.1), 1.0));
        fit.add_state(track_through(&v, Vector3::new(0.7, -0.1, 0.2), -1.0));

        let candidates = fit.start_radius_candidates(16);
        assert_eq!(candidates.len(), 16);
        assert!(candidates.windows(2).all(|w| w[0] < w[1]));
        for i in 0..2 {
            let track = fit.input_track(i).unwrap();
            assert!(candidates.iter().all(|&r| track.reaches_radius(r)));
        }
        let r = v.x.hypot(v.y);
        assert!(candidates[0] < r && r < candidates[15]);
        assert!(fit.start_radius_candidates(0).is_empty());
    }

    #[test]
    fn test_constraint_derivatives_shapes() {
        let mut fit = three_prong(&Vector3::zeros());
        assert_eq!(fit.d_vertex_d_constraint().unwrap(), Matrix3::zeros());
        fit.add_vertex_constraint(Vector3::zeros(), Matrix3::identity() * 1.0e-6);
        let dx = fit.d_vertex_d_constraint().unwrap();
        assert!(dx.norm() > 0.0);
        let ds = fit.d_phase_d_constraint(0).unwrap();
        assert!(ds.iter().all(|v| v.is_finite()));
        assert_eq!(fit.fit().unwrap().ndof, 6);
    }
}
