//! Production observer backed by `tracing`.

use crate::observer::NumericsObserver;
use crate::types::{RecoveryEvent, RecoveryKind};
use tracing::{debug, warn};

/// Forwards recovery events to `tracing`.
///
/// Grid clamping is routine for tracks at the edge of the tables and is
/// logged at debug level unless `warn_on_clamp` is set.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver {
    warn_on_clamp: bool,
}

impl TracingObserver {
    /// Creates an observer that also warns on grid clamping.
    pub fn verbose() -> Self {
        Self { warn_on_clamp: true }
    }
}

impl NumericsObserver for TracingObserver {
    fn on_recovery(&self, event: &RecoveryEvent) {
        if event.kind == RecoveryKind::GridClamped && !self.warn_on_clamp {
            debug!(
                kind = %event.kind,
                context = %event.context,
                "{}", event.detail
            );
            return;
        }
        warn!(
            kind = %event.kind,
            context = %event.context,
            dimension = event.dimension,
            "numerical recovery: {}", event.detail
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_observer_accepts_all_kinds() {
        let observer = TracingObserver::verbose();
        for kind in [
            RecoveryKind::ZeroDeterminant,
            RecoveryKind::CholeskyFailed,
            RecoveryKind::PositiveDefiniteRepair,
            RecoveryKind::GridClamped,
            RecoveryKind::NonConvergence,
        ] {
            observer.on_recovery(&RecoveryEvent::new(kind, "test", 3).with_detail("ok"));
        }
    }
}
