//! Observer trait for local numerical recoveries.

use crate::types::RecoveryEvent;

/// The sink for numerical recovery events.
///
/// The fitter, the post-processor and the lookup grids never print or
/// panic when they meet a near-singular matrix. They repair it and hand a
/// [`RecoveryEvent`] to the observer they were built with.
///
/// # Implementations
///
/// - **Default**: [`SilentObserver`] - drops every event
/// - **Production**: `TracingObserver` - emits `tracing::warn!`
/// - **Validation**: the harness counts events per kind
pub trait NumericsObserver: Send + Sync {
    /// Called once per recovery.
    fn on_recovery(&self, event: &RecoveryEvent);
}

/// Observer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentObserver;

impl NumericsObserver for SilentObserver {
    fn on_recovery(&self, _event: &RecoveryEvent) {}
}
