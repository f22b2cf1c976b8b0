//! Resolution and acceptance grids.
//!
//! Detector response tabulated on a `(pt, polar angle)` grid:
//! - [`CovarianceGrid`]: 5×5 track covariance, bilinearly interpolated and
//!   repaired to positive-definite
//! - [`AcceptanceGrid`]: number of measurement layers crossed
//!
//! Queries outside the grid never fail; they are clamped to the nearest edge
//! and the clamp is reported to the observer. Polar angles above 90° are
//! folded onto `180° - θ` (the detector is forward/backward symmetric).
//!
//! [`smear_parameters`] draws a measured track from a true one with a given
//! covariance, through the Cholesky factor of the normalized covariance.

use crate::trackcov_helix::HelixParameters;
use crate::trackcov_linalg::{make_positive_definite, normalize_diagonal, repair_covariance, to_dynamic, to_fixed};
use nalgebra::{Matrix5, Vector5};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use trackcov_env::{
    AcceptanceLookup, CovarianceLookup, EnvError, NumericsObserver, RecoveryEvent, RecoveryKind,
    SilentObserver,
};

/// Transverse momentum nodes (GeV).
pub const DEFAULT_PT_NODES: [f64; 22] = [
    0.1, 0.2, 0.5, 0.7, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 10.0, 15.0, 20.0, 25.0, 30.0, 40.0, 50.0,
    60.0, 80.0, 100.0, 150.0, 200.0,
];

/// Polar angle nodes (degrees).
pub const DEFAULT_ANGLE_NODES: [f64; 17] = [
    10.0, 15.0, 20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 55.0, 60.0, 65.0, 70.0, 75.0, 80.0,
    85.0, 90.0,
];

// ============================================================================
// GRID AXES
// ============================================================================

/// Position of a value between two nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cell {
    index: usize,
    fraction: f64,
    clamped: bool,
}

fn locate(nodes: &[f64], value: f64) -> Cell {
    let last = nodes.len() - 1;
    if !(value > nodes[0]) {
        // also catches NaN
        return Cell { index: 0, fraction: 0.0, clamped: value != nodes[0] };
    }
    if value >= nodes[last] {
        return Cell { index: last - 1, fraction: 1.0, clamped: value > nodes[last] };
    }
    let index = nodes.partition_point(|&n| n <= value) - 1;
    let fraction = (value - nodes[index]) / (nodes[index + 1] - nodes[index]);
    Cell { index, fraction, clamped: false }
}

fn fold_angle(angle_deg: f64) -> f64 {
    if angle_deg > 90.0 {
        180.0 - angle_deg
    } else {
        angle_deg
    }
}

fn validate_axis(name: &str, nodes: &[f64]) -> Result<(), EnvError> {
    if nodes.len() < 2 {
        return Err(EnvError::invalid_grid(format!("{} axis needs at least 2 nodes", name)));
    }
    if nodes.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(EnvError::invalid_grid(format!("{} nodes must be strictly increasing", name)));
    }
    Ok(())
}

/// Bilinear weights for the four corners `(i, j), (i+1, j), (i, j+1), (i+1, j+1)`.
fn corners(pt: &Cell, angle: &Cell) -> [(usize, usize, f64); 4] {
    let (u, v) = (pt.fraction, angle.fraction);
    [
        (pt.index, angle.index, (1.0 - u) * (1.0 - v)),
        (pt.index + 1, angle.index, u * (1.0 - v)),
        (pt.index, angle.index + 1, (1.0 - u) * v),
        (pt.index + 1, angle.index + 1, u * v),
    ]
}

fn report_clamp(observer: &dyn NumericsObserver, context: &str, pt: f64, angle: f64) {
    observer.on_recovery(
        &RecoveryEvent::new(RecoveryKind::GridClamped, context, 0)
            .with_detail(format!("pt={:.4} GeV, theta={:.2} deg clamped to grid edge", pt, angle)),
    );
}

// ============================================================================
// COVARIANCE GRID
// ============================================================================

/// Serializable covariance table, `covariances[i_pt * n_angle + i_angle]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovarianceTable {
    pub pt_nodes: Vec<f64>,
    pub angle_nodes: Vec<f64>,
    pub covariances: Vec<Matrix5<f64>>,
}

impl CovarianceTable {
    pub fn validate(&self) -> Result<(), EnvError> {
        validate_axis("pt", &self.pt_nodes)?;
        validate_axis("angle", &self.angle_nodes)?;
        let expected = self.pt_nodes.len() * self.angle_nodes.len();
        if self.covariances.len() != expected {
            return Err(EnvError::invalid_grid(format!(
                "expected {} covariance matrices, found {}",
                expected,
                self.covariances.len()
            )));
        }
        Ok(())
    }
}

/// Track resolution as a function of `(pt, θ)`.
pub struct CovarianceGrid {
    table: CovarianceTable,
    observer: Arc<dyn NumericsObserver>,
}

impl CovarianceGrid {
    pub fn new(table: CovarianceTable) -> Result<Self, EnvError> {
        table.validate()?;
        Ok(Self { table, observer: Arc::new(SilentObserver) })
    }

    /// Tabulate `f(pt, angle_deg)` on the given nodes.
    pub fn from_fn<F>(pt_nodes: &[f64], angle_nodes: &[f64], f: F) -> Result<Self, EnvError>
    where
        F: Fn(f64, f64) -> Matrix5<f64>,
    {
        let covariances = pt_nodes
            .iter()
            .flat_map(|&pt| angle_nodes.iter().map(move |&a| (pt, a)))
            .map(|(pt, a)| f(pt, a))
            .collect();
        Self::new(CovarianceTable {
            pt_nodes: pt_nodes.to_vec(),
            angle_nodes: angle_nodes.to_vec(),
            covariances,
        })
    }

    /// Load a table serialized as JSON.
    pub fn from_json_str(json: &str) -> Result<Self, EnvError> {
        let table: CovarianceTable = serde_json::from_str(json)?;
        Self::new(table)
    }

    pub fn with_observer(mut self, observer: Arc<dyn NumericsObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn table(&self) -> &CovarianceTable {
        &self.table
    }

    fn node(&self, i_pt: usize, i_angle: usize) -> &Matrix5<f64> {
        &self.table.covariances[i_pt * self.table.angle_nodes.len() + i_angle]
    }
}

impl CovarianceLookup for CovarianceGrid {
    fn covariance(&self, pt: f64, angle_deg: f64) -> Matrix5<f64> {
        let angle = fold_angle(angle_deg);
        let pt_cell = locate(&self.table.pt_nodes, pt);
        let angle_cell = locate(&self.table.angle_nodes, angle);
        if pt_cell.clamped || angle_cell.clamped {
            report_clamp(self.observer.as_ref(), "covariance_grid", pt, angle_deg);
        }

        let mut cov = Matrix5::zeros();
        for (i, j, w) in corners(&pt_cell, &angle_cell) {
            if w != 0.0 {
                cov += self.node(i, j) * w;
            }
        }
        let repaired = repair_covariance(&to_dynamic(&cov), self.observer.as_ref(), "covariance_grid");
        to_fixed(&repaired)
    }
}

// ============================================================================
// ACCEPTANCE GRID
// ============================================================================

/// Serializable hit-count table, `hits[i_pt * n_angle + i_angle]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceTable {
    pub pt_nodes: Vec<f64>,
    pub angle_nodes: Vec<f64>,
    pub hits: Vec<f64>,
}

impl AcceptanceTable {
    pub fn validate(&self) -> Result<(), EnvError> {
        validate_axis("pt", &self.pt_nodes)?;
        validate_axis("angle", &self.angle_nodes)?;
        if self.hits.len() != self.pt_nodes.len() * self.angle_nodes.len() {
            return Err(EnvError::invalid_grid("hit table size does not match its axes"));
        }
        Ok(())
    }
}

/// Number of measurement layers crossed as a function of `(pt, θ)`.
pub struct AcceptanceGrid {
    table: AcceptanceTable,
    observer: Arc<dyn NumericsObserver>,
}

impl AcceptanceGrid {
    pub fn new(table: AcceptanceTable) -> Result<Self, EnvError> {
        table.validate()?;
        Ok(Self { table, observer: Arc::new(SilentObserver) })
    }

    pub fn from_fn<F>(pt_nodes: &[f64], angle_nodes: &[f64], f: F) -> Result<Self, EnvError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let hits = pt_nodes
            .iter()
            .flat_map(|&pt| angle_nodes.iter().map(move |&a| (pt, a)))
            .map(|(pt, a)| f(pt, a))
            .collect();
        Self::new(AcceptanceTable {
            pt_nodes: pt_nodes.to_vec(),
            angle_nodes: angle_nodes.to_vec(),
            hits,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self, EnvError> {
        let table: AcceptanceTable = serde_json::from_str(json)?;
        Self::new(table)
    }

    pub fn with_observer(mut self, observer: Arc<dyn NumericsObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Interpolated number of layers hit, rounded to the nearest integer.
    pub fn hit_number(&self, pt: f64, angle_deg: f64) -> i32 {
        let angle = fold_angle(angle_deg);
        let pt_cell = locate(&self.table.pt_nodes, pt);
        let angle_cell = locate(&self.table.angle_nodes, angle);
        if pt_cell.clamped || angle_cell.clamped {
            report_clamp(self.observer.as_ref(), "acceptance_grid", pt, angle_deg);
        }
        let n_angle = self.table.angle_nodes.len();
        let hits: f64 = corners(&pt_cell, &angle_cell)
            .iter()
            .map(|&(i, j, w)| w * self.table.hits[i * n_angle + j])
            .sum();
        hits.round() as i32
    }
}

impl AcceptanceLookup for AcceptanceGrid {
    fn hit_count(&self, pt: f64, angle_deg: f64) -> i32 {
        self.hit_number(pt, angle_deg)
    }
}

/// True when a track crosses at least `min_hits` layers.
pub fn is_accepted<A: AcceptanceLookup + ?Sized>(lookup: &A, pt: f64, angle_deg: f64, min_hits: i32) -> bool {
    lookup.hit_count(pt, angle_deg) >= min_hits
}

// ============================================================================
// SMEARING
// ============================================================================

/// `par + S⁻¹ L z` with `L Lᵀ` the normalized covariance and `z` standard
/// normal draws.
pub fn smear_parameters(par: &HelixParameters, cov: &Matrix5<f64>, normals: &Vector5<f64>) -> HelixParameters {
    let (normalized, scale) = normalize_diagonal(&to_dynamic(cov));
    let lower = match normalized.clone().cholesky() {
        Some(chol) => chol.l(),
        None => match make_positive_definite(&normalized).cholesky() {
            Some(chol) => chol.l(),
            None => return *par,
        },
    };
    let correlated = to_fixed::<5>(&lower) * normals;
    par + correlated.component_div(&Vector5::from_column_slice(scale.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolution(pt: f64, angle: f64) -> Matrix5<f64> {
        let s = 1.0e-5 * (1.0 + 1.0 / pt) * (1.0 + angle / 90.0);
        let mut cov = Matrix5::from_diagonal(&Vector5::new(s * s, s * s, 1e-2 * s * s, s * s, s * s));
        cov[(0, 3)] = 0.3 * s * s;
        cov[(3, 0)] = 0.3 * s * s;
        cov
    }

    fn grid() -> CovarianceGrid {
        CovarianceGrid::from_fn(&DEFAULT_PT_NODES, &DEFAULT_ANGLE_NODES, resolution).unwrap()
    }

    #[derive(Default)]
    struct Clamps(AtomicUsize);

    impl NumericsObserver for Clamps {
        fn on_recovery(&self, event: &RecoveryEvent) {
            if event.kind == RecoveryKind::GridClamped {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_exact_at_nodes() {
        let g = grid();
        assert_relative_eq!(g.covariance(2.0, 45.0), resolution(2.0, 45.0), max_relative = 1e-12);
        assert_relative_eq!(g.covariance(200.0, 90.0), resolution(200.0, 90.0), max_relative = 1e-12);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let g = grid();
        let mid = g.covariance(1.5, 42.5);
        let expected = (resolution(1.0, 40.0) + resolution(2.0, 40.0) + resolution(1.0, 45.0)
            + resolution(2.0, 45.0))
            / 4.0;
        assert_relative_eq!(mid, expected, max_relative = 1e-12);
    }

    #[test]
    fn test_angle_folding() {
        let g = grid();
        assert_relative_eq!(g.covariance(5.0, 120.0), g.covariance(5.0, 60.0), max_relative = 1e-12);
    }

    #[test]
    fn test_out_of_grid_clamps_and_reports() {
        let clamps = Arc::new(Clamps::default());
        let g = grid().with_observer(clamps.clone());
        let low = g.covariance(0.01, 45.0);
        assert_relative_eq!(low, resolution(0.1, 45.0), max_relative = 1e-12);
        let high = g.covariance(1000.0, 5.0);
        assert_relative_eq!(high, resolution(200.0, 10.0), max_relative = 1e-12);
        assert_eq!(clamps.0.load(Ordering::SeqCst), 2);
        g.covariance(1.0, 45.0);
        assert_eq!(clamps.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_interpolated_covariance_is_repaired() {
        // Correlation above one at every node
        let bad = |_: f64, _: f64| {
            let mut m = Matrix5::identity();
            m[(0, 1)] = 1.5;
            m[(1, 0)] = 1.5;
            m
        };
        let g = CovarianceGrid::from_fn(&[1.0, 2.0], &[10.0, 90.0], bad).unwrap();
        let cov = g.covariance(1.5, 45.0);
        assert!(crate::trackcov_linalg::check_positive_definite_fixed(&cov));
    }

    #[test]
    fn test_table_validation() {
        let table = CovarianceTable {
            pt_nodes: vec![1.0, 2.0],
            angle_nodes: vec![10.0],
            covariances: vec![Matrix5::identity(); 2],
        };
        assert!(matches!(CovarianceGrid::new(table), Err(EnvError::InvalidGrid(_))));
        let unsorted = AcceptanceTable {
            pt_nodes: vec![2.0, 1.0],
            angle_nodes: vec![10.0, 20.0],
            hits: vec![0.0; 4],
        };
        assert!(AcceptanceGrid::new(unsorted).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let g = grid();
        let json = serde_json::to_string(g.table()).unwrap();
        let loaded = CovarianceGrid::from_json_str(&json).unwrap();
        assert_relative_eq!(loaded.covariance(3.3, 33.0), g.covariance(3.3, 33.0), max_relative = 1e-12);
        assert!(matches!(CovarianceGrid::from_json_str("{"), Err(EnvError::Parse(_))));
    }

    #[test]
    fn test_acceptance_hits() {
        let acc = AcceptanceGrid::from_fn(&[0.1, 1.0, 10.0], &[10.0, 50.0, 90.0], |pt, angle| {
            if pt < 0.5 {
                2.0
            } else {
                (angle / 10.0).floor()
            }
        })
        .unwrap();
        assert_eq!(acc.hit_number(10.0, 90.0), 9);
        assert_eq!(acc.hit_number(10.0, 70.0), 7);
        assert_eq!(acc.hit_number(0.1, 90.0), 2);
        assert!(is_accepted(&acc, 10.0, 90.0, 5));
        assert!(!is_accepted(&acc, 0.05, 90.0, 5));
    }

    #[test]
    fn test_smearing_with_zero_draws_is_identity() {
        let par = Vector5::new(0.0, 0.3, -0.01, 0.0, 0.5);
        let cov = resolution(1.0, 45.0);
        assert_eq!(smear_parameters(&par, &cov, &Vector5::zeros()), par);
    }

    #[test]
    fn test_smearing_follows_cholesky_factor() {
        let par = Vector5::zeros();
        let cov = resolution(1.0, 45.0);
        // A unit draw on the first component moves D by sigma_D and z0 by
        // its correlated share
        let shifted = smear_parameters(&par, &cov, &Vector5::new(1.0, 0.0, 0.0, 0.0, 0.0));
        assert_relative_eq!(shifted[0], cov[(0, 0)].sqrt(), max_relative = 1e-12);
        assert_relative_eq!(shifted[3], cov[(0, 3)] / cov[(0, 0)].sqrt(), max_relative = 1e-12);
        assert_eq!(shifted[1], 0.0);
    }
}
