//! JSON exporter for per-event fit records.
//!
//! Writes every fitted event of a run next to its truth, for offline pull
//! plots.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use trackcov_core::ValidationReport;

/// A position as plain coordinates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl From<Vector3<f64>> for Point {
    fn from(v: Vector3<f64>) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }
}

/// One fitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub index: usize,
    pub true_vertex: Point,
    pub tracks: usize,

    /// `None` when the fit returned an error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fitted_vertex: Option<Point>,

    /// Diagonal vertex errors (m)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertex_sigma: Option<Point>,

    pub chi_square: f64,
    pub ndof: usize,
    pub converged: bool,
    pub iterations: usize,

    /// Mass after the constrained refit, when one was applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constrained_mass: Option<f64>,
}

/// Complete run export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,
    pub events: Vec<EventRecord>,
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ValidationReport>,
}

impl SimExport {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            events: Vec::new(),
            passed: false,
            report: None,
        }
    }

    pub fn add_event(&mut self, event: EventRecord) {
        self.events.push(event);
    }

    pub fn finalize(&mut self, passed: bool, report: ValidationReport) {
        self.passed = passed;
        self.report = Some(report);
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_serializes_events() {
        let mut export = SimExport::new("primary", 42);
        export.add_event(EventRecord {
            index: 0,
            true_vertex: Vector3::new(1e-5, 0.0, 2e-3).into(),
            tracks: 4,
            fitted_vertex: None,
            vertex_sigma: None,
            chi_square: 0.0,
            ndof: 0,
            converged: false,
            iterations: 0,
            constrained_mass: None,
        });
        let json = serde_json::to_string(&export).unwrap();
        assert!(json.contains("\"scenario\":\"primary\""));
        assert!(!json.contains("fitted_vertex"));

        let back: SimExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.events.len(), 1);
        assert_eq!(back.seed, 42);
    }
}
