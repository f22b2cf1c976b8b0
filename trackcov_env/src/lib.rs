//! TrackCov Environment Abstraction Layer
//!
//! This crate provides the seams between the numerical core and the
//! world around it, so the vertex fitter stays side-effect-free:
//!
//! - **Numerics observers**: near-singular matrices are repaired locally,
//!   and every repair is reported through [`NumericsObserver`]. The default
//!   [`SilentObserver`] does nothing; [`TracingObserver`] forwards to
//!   `tracing`.
//! - **Detector lookups**: the resolution grid and the acceptance table are
//!   consumed through [`CovarianceLookup`] and [`AcceptanceLookup`], so a
//!   real detector model and a synthetic Monte-Carlo one are interchangeable.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trackcov_env::{NumericsObserver, TracingObserver};
//!
//! let observer: Arc<dyn NumericsObserver> = Arc::new(TracingObserver::default());
//! let mut fit = VertexFit::new(VertexFitConfig::default()).with_observer(observer);
//! ```

mod error;
mod lookup;
mod observer;
mod tracing_impl;
mod types;

pub use error::EnvError;
pub use lookup::{AcceptanceLookup, CovarianceLookup};
pub use observer::{NumericsObserver, SilentObserver};
pub use tracing_impl::TracingObserver;
pub use types::{RecoveryEvent, RecoveryKind};
