//! Recovery bookkeeping for harness runs.
//!
//! Every numerical recovery the fitter or the detector grids perform is
//! counted per kind and forwarded to `tracing`, so a run can report how
//! often the core had to repair its inputs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use trackcov_env::{NumericsObserver, RecoveryEvent, RecoveryKind, TracingObserver};

const KINDS: [RecoveryKind; 5] = [
    RecoveryKind::ZeroDeterminant,
    RecoveryKind::CholeskyFailed,
    RecoveryKind::PositiveDefiniteRepair,
    RecoveryKind::GridClamped,
    RecoveryKind::NonConvergence,
];

fn slot(kind: RecoveryKind) -> usize {
    match kind {
        RecoveryKind::ZeroDeterminant => 0,
        RecoveryKind::CholeskyFailed => 1,
        RecoveryKind::PositiveDefiniteRepair => 2,
        RecoveryKind::GridClamped => 3,
        RecoveryKind::NonConvergence => 4,
    }
}

/// Observer that counts recoveries and logs them.
#[derive(Debug, Default)]
pub struct CountingObserver {
    counts: [AtomicU64; 5],
    log: TracingObserver,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped observer for sharing with fitters and grids.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn count(&self, kind: RecoveryKind) -> u64 {
        self.counts[slot(kind)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Non-zero counts keyed by recovery name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        KINDS
            .iter()
            .map(|k| (k.name().to_string(), self.count(*k)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

impl NumericsObserver for CountingObserver {
    fn on_recovery(&self, event: &RecoveryEvent) {
        self.counts[slot(event.kind)].fetch_add(1, Ordering::Relaxed);
        self.log.on_recovery(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_kind() {
        let observer = CountingObserver::new();
        observer.on_recovery(&RecoveryEvent::new(RecoveryKind::GridClamped, "grid", 0));
        observer.on_recovery(&RecoveryEvent::new(RecoveryKind::GridClamped, "grid", 0));
        observer.on_recovery(&RecoveryEvent::new(RecoveryKind::CholeskyFailed, "fit", 3));

        assert_eq!(observer.count(RecoveryKind::GridClamped), 2);
        assert_eq!(observer.count(RecoveryKind::NonConvergence), 0);
        assert_eq!(observer.total(), 3);

        let snapshot = observer.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["grid_clamped"], 2);
    }
}
