//! Scenario runner - generates, measures and fits events, then judges pulls.

use crate::context::CountingObserver;
use crate::detector::{Detector, DetectorConfig, Measurement};
use crate::error::SimError;
use crate::exporter::{EventRecord, SimExport};
use crate::oracle::{Kinematics, Oracle, TruthParticle, KAON_MASS, PION_MASS};
use crate::scenarios::ScenarioId;

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use trackcov_core::{
    FitResult, MassFitConfig, PassCriteria, ValidationReport, ValidationSession, VertexFit,
    VertexFitConfig, VertexMore, VertexMoreConfig,
};
use trackcov_env::NumericsObserver;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Everything that shapes a harness run besides the seed and the scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Events per scenario (default: 500)
    pub events: usize,

    /// Tracks per prompt vertex (default: 4)
    pub tracks_per_vertex: usize,

    /// Magnetic field in Tesla (default: 2.0)
    pub bz: f64,

    /// Beam-spot width in x, y, z (m)
    pub beam_spot_sigma: [f64; 3],

    /// Prompt particle kinematics
    pub kinematics: Kinematics,

    /// Transverse decay radius range of V0s (m)
    pub v0_radius_range: (f64, f64),

    /// Transverse momentum range of V0 parents (GeV)
    pub v0_pt_range: (f64, f64),

    /// Largest allowed |m - m_K0| after the mass-constrained refit (GeV)
    pub mass_tolerance: f64,

    /// Generation attempts per particle before giving up
    pub max_attempts: usize,

    /// χ²/ndof above which a displaced fit is retried over a start-radius
    /// scan (default: 10)
    pub rescan_chi_square_per_dof: f64,

    /// Start radii tried by the scan (default: 32)
    pub rescan_steps: usize,

    /// Largest allowed fraction of non-converged fits in stress scenarios
    /// (default: 0.1)
    pub stress_non_converged_fraction: f64,

    pub detector: DetectorConfig,
    pub fit: VertexFitConfig,
    pub mass_fit: MassFitConfig,
    pub criteria: PassCriteria,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            events: 500,
            tracks_per_vertex: 4,
            bz: 2.0,
            beam_spot_sigma: [2.0e-5, 2.0e-5, 5.0e-3],
            kinematics: Kinematics::default(),
            v0_radius_range: (0.02, 0.4),
            v0_pt_range: (1.0, 5.0),
            mass_tolerance: 1.0e-4,
            max_attempts: 1000,
            rescan_chi_square_per_dof: 10.0,
            rescan_steps: 32,
            stress_non_converged_fraction: 0.1,
            detector: DetectorConfig::default(),
            fit: VertexFitConfig::default(),
            mass_fit: MassFitConfig::default(),
            criteria: PassCriteria::default(),
        }
    }
}

impl HarnessConfig {
    /// Loads a configuration; missing fields take their defaults.
    pub fn from_json_file(path: &str) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        let config: HarnessConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SimError> {
        if self.events == 0 {
            return Err(SimError::invalid_config("events must be at least 1"));
        }
        if self.tracks_per_vertex < 2 {
            return Err(SimError::invalid_config("tracks_per_vertex must be at least 2"));
        }
        if !(self.bz > 0.0) {
            return Err(SimError::invalid_config("bz must be positive"));
        }
        if !(self.rescan_chi_square_per_dof > 0.0) {
            return Err(SimError::invalid_config("rescan_chi_square_per_dof must be positive"));
        }
        if !(0.0..=1.0).contains(&self.stress_non_converged_fraction) {
            return Err(SimError::invalid_config("stress_non_converged_fraction must lie in [0, 1]"));
        }
        if self.beam_spot_sigma.iter().any(|s| !(*s > 0.0)) {
            return Err(SimError::invalid_config("beam_spot_sigma must be positive"));
        }
        let ranges = [
            ("pt_range", self.kinematics.pt_range),
            ("v0_radius_range", self.v0_radius_range),
            ("v0_pt_range", self.v0_pt_range),
        ];
        for (name, (lo, hi)) in ranges {
            if !(lo > 0.0 && hi >= lo) {
                return Err(SimError::invalid_config(format!("{} must satisfy 0 < lo <= hi", name)));
            }
        }
        let (t_lo, t_hi) = self.kinematics.theta_range_deg;
        if !(t_lo > 0.0 && t_hi < 180.0 && t_hi >= t_lo) {
            return Err(SimError::invalid_config("theta_range_deg must lie inside (0, 180)"));
        }
        Ok(())
    }

    fn beam_spot(&self) -> Vector3<f64> {
        Vector3::from(self.beam_spot_sigma)
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether the run met its pass criteria
    pub passed: bool,

    /// Events generated
    pub events: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Counters collected during the run
    pub metrics: ScenarioMetrics,

    /// Pull statistics
    pub report: ValidationReport,

    /// Per-event records, when export was requested
    #[serde(skip)]
    pub export: Option<SimExport>,
}

/// Counters collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Measured tracks handed to the fitter
    pub accepted_tracks: usize,

    /// Charged particles lost to acceptance
    pub rejected_particles: usize,

    /// Fits that returned an error or a non-finite vertex
    pub failed_fits: usize,

    /// Fits that hit the iteration cap
    pub non_converged: usize,

    /// Events whose best fit started from the estimated start radius
    pub start_radius_used: usize,

    /// Events retried over a start-radius scan after a poor fit
    pub radius_scans: usize,

    /// Mass-constrained refits performed
    pub mass_fits: usize,

    /// Mass-constrained refits that hit their iteration cap
    pub mass_fit_failures: usize,

    /// Largest |m - target| after a mass-constrained refit (GeV)
    pub max_mass_residual: f64,

    /// Numerical recoveries by kind
    pub recoveries: BTreeMap<String, u64>,
}

/// Truth and measurements of one event.
struct TruthEvent {
    vertex: Vector3<f64>,
    particles: Vec<TruthParticle>,
    measurements: Vec<Measurement>,
}

// ============================================================================
// RUNNER
// ============================================================================

/// Runs validation scenarios.
pub struct ScenarioRunner {
    /// Master seed
    seed: u64,

    config: HarnessConfig,

    /// Keep per-event records
    export: bool,
}

impl ScenarioRunner {
    /// Creates a runner with default configuration.
    pub fn new(seed: u64, events: usize) -> Self {
        Self {
            seed,
            config: HarnessConfig { events, ..Default::default() },
            export: false,
        }
    }

    /// Replaces the whole configuration.
    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tracks(mut self, tracks: usize) -> Self {
        self.config.tracks_per_vertex = tracks;
        self
    }

    /// Keeps per-event records in [`ScenarioResult::export`].
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs a scenario.
    pub fn run(&self, scenario: ScenarioId) -> Result<ScenarioResult, SimError> {
        self.config.validate()?;
        info!(
            "Running scenario {} (seed {}, {} events)",
            scenario, self.seed, self.config.events
        );

        let counter = CountingObserver::shared();
        let observer: Arc<dyn NumericsObserver> = counter.clone();
        let detector = Detector::new(self.config.detector.clone(), self.config.bz, observer.clone())?;
        let mut oracle = Oracle::new(self.seed);
        let mut session = ValidationSession::new();
        let mut metrics = ScenarioMetrics::default();
        let mut export = SimExport::new(scenario.name(), self.seed);

        for index in 0..self.config.events {
            let event = self.generate(scenario, &mut oracle, &detector, &mut metrics)?;
            metrics.accepted_tracks += event.measurements.len();
            let record = self.fit_event(scenario, index, &event, &observer, &mut session, &mut metrics);
            if self.export {
                export.add_event(record);
            }
        }

        metrics.recoveries = counter.snapshot();
        let report = session.generate_report();
        let failure_reason = self.judge(scenario, &report, &metrics);
        let passed = failure_reason.is_none();
        match &failure_reason {
            None => info!("Scenario {} passed", scenario),
            Some(reason) => warn!("Scenario {} failed: {}", scenario, reason),
        }

        let export = if self.export {
            export.finalize(passed, report.clone());
            Some(export)
        } else {
            None
        };

        Ok(ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            events: self.config.events,
            failure_reason,
            metrics,
            report,
            export,
        })
    }

    // ------------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------------

    fn generate(
        &self,
        scenario: ScenarioId,
        oracle: &mut Oracle,
        detector: &Detector,
        metrics: &mut ScenarioMetrics,
    ) -> Result<TruthEvent, SimError> {
        let primary = oracle.beam_spot_vertex(&self.config.beam_spot());
        let n = self.config.tracks_per_vertex;
        let kin = &self.config.kinematics;
        let mut event = TruthEvent {
            vertex: primary,
            particles: Vec::with_capacity(n),
            measurements: Vec::with_capacity(n),
        };

        match scenario {
            ScenarioId::Primary | ScenarioId::BeamSpot => {
                for _ in 0..n {
                    self.accept_one(&mut event, detector, oracle, metrics, |o| {
                        o.charged_particle(&primary, kin)
                    })?;
                }
            }
            ScenarioId::WithNeutral => {
                for _ in 0..n - 1 {
                    self.accept_one(&mut event, detector, oracle, metrics, |o| {
                        o.charged_particle(&primary, kin)
                    })?;
                }
                self.accept_one(&mut event, detector, oracle, metrics, |o| {
                    o.neutral_particle(&primary, kin)
                })?;
            }
            ScenarioId::DisplacedV0 => self.generate_v0(&mut event, detector, oracle, metrics)?,
            ScenarioId::Collinear => self.generate_collinear(&mut event, detector, oracle, metrics)?,
        }
        Ok(event)
    }

    /// Draws particles until one is accepted.
    fn accept_one<F>(
        &self,
        event: &mut TruthEvent,
        detector: &Detector,
        oracle: &mut Oracle,
        metrics: &mut ScenarioMetrics,
        mut draw: F,
    ) -> Result<(), SimError>
    where
        F: FnMut(&mut Oracle) -> TruthParticle,
    {
        for _ in 0..self.config.max_attempts {
            let particle = draw(oracle);
            if let Some(m) = detector.measure(&particle, oracle) {
                event.particles.push(particle);
                event.measurements.push(m);
                return Ok(());
            }
            metrics.rejected_particles += 1;
        }
        Err(SimError::GenerationFailed { attempts: self.config.max_attempts })
    }

    fn generate_v0(
        &self,
        event: &mut TruthEvent,
        detector: &Detector,
        oracle: &mut Oracle,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), SimError> {
        let parent_kin = Kinematics {
            pt_range: self.config.v0_pt_range,
            theta_range_deg: self.config.kinematics.theta_range_deg,
        };
        let (r_lo, r_hi) = self.config.v0_radius_range;

        for _ in 0..self.config.max_attempts {
            let parent = oracle.momentum(&parent_kin);
            let radius = oracle.uniform(r_lo, r_hi);
            let pt = parent.x.hypot(parent.y);
            let decay = event.vertex + parent * (radius / pt);
            let daughters = oracle.two_body_decay(&decay, &parent, KAON_MASS, PION_MASS);

            if daughters.iter().all(|d| detector.accepts(d)) {
                for d in daughters {
                    if let Some(m) = detector.measure(&d, oracle) {
                        event.particles.push(d);
                        event.measurements.push(m);
                    }
                }
                event.vertex = decay;
                return Ok(());
            }
            metrics.rejected_particles += daughters.iter().filter(|d| !detector.accepts(d)).count();
        }
        Err(SimError::GenerationFailed { attempts: self.config.max_attempts })
    }

    /// A stiff track and a partner rotated by 0.1 mrad in phi.
    fn generate_collinear(
        &self,
        event: &mut TruthEvent,
        detector: &Detector,
        oracle: &mut Oracle,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), SimError> {
        let stiff = Kinematics {
            pt_range: (40.0, 100.0),
            theta_range_deg: self.config.kinematics.theta_range_deg,
        };
        let origin = event.vertex;
        self.accept_one(event, detector, oracle, metrics, |o| o.charged_particle(&origin, &stiff))?;

        let first = &event.particles[0];
        let (sin, cos) = 1.0e-4f64.sin_cos();
        let p = first.momentum;
        let partner = TruthParticle {
            momentum: Vector3::new(p.x * cos - p.y * sin, p.x * sin + p.y * cos, p.z),
            ..first.clone()
        };
        self.accept_one(event, detector, oracle, metrics, |_| partner.clone())
    }

    // ------------------------------------------------------------------------
    // Fitting
    // ------------------------------------------------------------------------

    fn build_fit(
        &self,
        scenario: ScenarioId,
        event: &TruthEvent,
        observer: &Arc<dyn NumericsObserver>,
    ) -> VertexFit {
        let mut fit = VertexFit::new(self.config.fit.clone()).with_observer(observer.clone());
        for m in &event.measurements {
            fit.add_state(m.track.clone());
        }
        if scenario == ScenarioId::BeamSpot {
            let sigma = self.config.beam_spot();
            fit.add_vertex_constraint(Vector3::zeros(), Matrix3::from_diagonal(&sigma.component_mul(&sigma)));
        }
        fit
    }

    /// Fits the event. Displaced topologies are also fitted from the
    /// estimated start radius, and from a scan of start radii when the best
    /// χ²/ndof is still poor; the lowest χ² wins.
    fn fit_best(
        &self,
        scenario: ScenarioId,
        event: &TruthEvent,
        observer: &Arc<dyn NumericsObserver>,
        metrics: &mut ScenarioMetrics,
    ) -> Option<(VertexFit, FitResult)> {
        let mut plain = self.build_fit(scenario, event, observer);
        let plain_result = plain.fit().ok().cloned().filter(is_finite_fit);
        let mut best = plain_result.map(|r| (plain, r));
        if scenario != ScenarioId::DisplacedV0 {
            return best;
        }

        let template = self.build_fit(scenario, event, observer);
        if let Some(radius) = template.estimate_start_radius() {
            if self.refit_from(radius, scenario, event, observer, &mut best) {
                metrics.start_radius_used += 1;
            }
        }

        let poor = match &best {
            Some((_, r)) => r.chi_square_per_dof() > self.config.rescan_chi_square_per_dof,
            None => true,
        };
        if poor {
            metrics.radius_scans += 1;
            for radius in template.start_radius_candidates(self.config.rescan_steps) {
                self.refit_from(radius, scenario, event, observer, &mut best);
            }
            if let Some((fit, r)) = &best {
                debug!(
                    chi2 = r.chi_square,
                    start_radius = ?fit.start_radius(),
                    "start-radius scan done"
                );
            }
        }
        best
    }

    /// Fits from `radius` and keeps the result if it beats `best`.
    fn refit_from(
        &self,
        radius: f64,
        scenario: ScenarioId,
        event: &TruthEvent,
        observer: &Arc<dyn NumericsObserver>,
        best: &mut Option<(VertexFit, FitResult)>,
    ) -> bool {
        let mut fit = self.build_fit(scenario, event, observer);
        fit.set_start_radius(radius);
        let Some(result) = fit.fit().ok().cloned().filter(is_finite_fit) else {
            return false;
        };
        let better = match best {
            Some((_, current)) => result.chi_square < current.chi_square,
            None => true,
        };
        if better {
            *best = Some((fit, result));
        }
        better
    }

    fn fit_event(
        &self,
        scenario: ScenarioId,
        index: usize,
        event: &TruthEvent,
        observer: &Arc<dyn NumericsObserver>,
        session: &mut ValidationSession,
        metrics: &mut ScenarioMetrics,
    ) -> EventRecord {
        let mut record = EventRecord {
            index,
            true_vertex: event.vertex.into(),
            tracks: event.measurements.len(),
            fitted_vertex: None,
            vertex_sigma: None,
            chi_square: 0.0,
            ndof: 0,
            converged: false,
            iterations: 0,
            constrained_mass: None,
        };

        let Some((mut fit, result)) = self.fit_best(scenario, event, observer, metrics) else {
            warn!(event = index, "vertex fit failed");
            metrics.failed_fits += 1;
            session.record_failure();
            return record;
        };

        debug!(
            event = index,
            chi2 = result.chi_square,
            ndof = result.ndof,
            iterations = result.iterations,
            "fitted"
        );
        if !result.converged {
            metrics.non_converged += 1;
        }
        session.record_fit(result.chi_square, result.ndof, result.converged);
        session.record_vertex(&result.vertex, &result.covariance, &event.vertex);
        for (updated, m) in result.updated_tracks.iter().zip(&event.measurements) {
            session.record_track(updated, &m.truth);
        }

        record.fitted_vertex = Some(result.vertex.into());
        record.vertex_sigma = Some(result.covariance.diagonal().map(f64::sqrt).into());
        record.chi_square = result.chi_square;
        record.ndof = result.ndof;
        record.converged = result.converged;
        record.iterations = result.iterations;

        if !scenario.is_stress() {
            record.constrained_mass = self.post_process(scenario, &mut fit, event, session, metrics);
        }
        record
    }

    /// Momentum pulls at the vertex and, for V0s, the mass-constrained refit.
    fn post_process(
        &self,
        scenario: ScenarioId,
        fit: &mut VertexFit,
        event: &TruthEvent,
        session: &mut ValidationSession,
        metrics: &mut ScenarioMetrics,
    ) -> Option<f64> {
        let config = VertexMoreConfig::default()
            .with_bz(self.config.bz)
            .with_mass_fit(self.config.mass_fit.clone());
        let mut more = match VertexMore::new(fit, config) {
            Ok(more) => more,
            Err(e) => {
                warn!("post-processing failed: {}", e);
                return None;
            }
        };

        for (i, particle) in event.particles.iter().enumerate() {
            if let (Ok(p), Ok(cov)) = (more.momentum(i), more.momentum_covariance(i)) {
                session.record_momentum(&p, &cov, &particle.momentum);
            }
        }

        if scenario != ScenarioId::DisplacedV0 {
            return None;
        }
        if let Err(e) = more.add_mass_constraint(KAON_MASS, &[0, 1], &[PION_MASS, PION_MASS]) {
            warn!("mass constraint rejected: {}", e);
            return None;
        }
        let report = more.apply_mass_constraint_fit();
        metrics.mass_fits += 1;
        if !report.converged {
            metrics.mass_fit_failures += 1;
        }
        let mass = report.masses.first().copied()?;
        metrics.max_mass_residual = metrics.max_mass_residual.max((mass - KAON_MASS).abs());
        Some(mass)
    }

    // ------------------------------------------------------------------------
    // Verdict
    // ------------------------------------------------------------------------

    fn judge(&self, scenario: ScenarioId, report: &ValidationReport, metrics: &ScenarioMetrics) -> Option<String> {
        let criteria = &self.config.criteria;
        let events = self.config.events as f64;

        if scenario.is_stress() {
            if metrics.failed_fits > 0 {
                return Some(format!("{} of {} fits failed", metrics.failed_fits, self.config.events));
            }
            let fraction = metrics.non_converged as f64 / events;
            return (fraction > self.config.stress_non_converged_fraction).then(|| {
                format!(
                    "{} of {} fits did not converge (limit {})",
                    metrics.non_converged, self.config.events, self.config.stress_non_converged_fraction
                )
            });
        }
        if metrics.failed_fits as f64 / events > criteria.max_non_converged_fraction {
            return Some(format!("{} of {} fits failed", metrics.failed_fits, self.config.events));
        }
        if !report.passes_criteria(criteria) {
            return Some(describe_failure(report, criteria));
        }
        if scenario == ScenarioId::DisplacedV0 {
            if metrics.mass_fit_failures as f64 / events > criteria.max_non_converged_fraction {
                return Some(format!("{} mass fits did not converge", metrics.mass_fit_failures));
            }
            if metrics.max_mass_residual > self.config.mass_tolerance {
                return Some(format!(
                    "constrained mass off by {:.3e} GeV",
                    metrics.max_mass_residual
                ));
            }
        }
        None
    }
}

fn is_finite_fit(result: &FitResult) -> bool {
    result.vertex.iter().all(|v| v.is_finite()) && result.chi_square.is_finite()
}

fn describe_failure(report: &ValidationReport, criteria: &PassCriteria) -> String {
    if report.fits == 0 {
        return "no successful fits".to_string();
    }
    for p in report.populated_pulls() {
        if p.mean.abs() > criteria.max_abs_mean {
            return format!("{} pull mean {:.3} outside ±{}", p.name, p.mean, criteria.max_abs_mean);
        }
        if p.rms < criteria.rms_range.0 || p.rms > criteria.rms_range.1 {
            return format!(
                "{} pull RMS {:.3} outside [{}, {}]",
                p.name, p.rms, criteria.rms_range.0, criteria.rms_range.1
            );
        }
    }
    let (lo, hi) = criteria.chi_square_range;
    if report.mean_chi_square_per_dof < lo || report.mean_chi_square_per_dof > hi {
        return format!("mean χ²/ndof {:.3} outside [{}, {}]", report.mean_chi_square_per_dof, lo, hi);
    }
    format!("{} of {} fits did not converge", report.non_converged, report.fits)
}

// ============================================================================
// TESTS
// ============================================================================
