//! TrackCov Deterministic Validation Harness
//!
//! Drives the vertex fitter with seeded Monte-Carlo events and checks its
//! error estimates against truth.
//!
//! # Core Principle: Replayable Truth
//!
//! All randomness comes from one 64-bit seed:
//! - **Truth**: vertices, momenta and charges from the [`Oracle`]
//! - **Detector**: acceptance cuts and resolution from grids, then smearing
//!   with exactly the covariance handed to the fitter
//! - **Verdict**: pulls `(fitted - true) / σ` must be standard normal and
//!   `χ²/ndof` must average to one
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  truth   ┌──────────┐ tracks ┌───────────┐ results ┌──────────────┐
//! │  Oracle  │ ───────► │ Detector │ ─────► │ VertexFit │ ──────► │ Validation-  │
//! │ (seeded) │          │ (grids)  │        │ + More    │         │ Session      │
//! └──────────┘          └──────────┘        └───────────┘         └──────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use trackcov_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 500).run(ScenarioId::Primary)?;
//! assert!(result.passed);
//! ```

mod context;
mod detector;
mod error;
mod exporter;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::CountingObserver;
pub use detector::{Detector, DetectorConfig, Measurement};
pub use error::SimError;
pub use exporter::{EventRecord, Point, SimExport};
pub use oracle::{Kinematics, Oracle, TruthParticle, KAON_MASS, PION_MASS};
pub use runner::{HarnessConfig, ScenarioMetrics, ScenarioResult, ScenarioRunner};
