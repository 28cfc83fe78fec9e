use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Protocol outcome counters shared by a client and all of its handles.
#[derive(Clone, Default)]
pub struct LockMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    acquisitions: AtomicU64,
    acquire_conflicts: AtomicU64,
    heartbeats_ok: AtomicU64,
    heartbeats_ambiguous: AtomicU64,
    heartbeats_rejected: AtomicU64,
    heartbeats_late: AtomicU64,
    resyncs: AtomicU64,
    leases_lost: AtomicU64,
    releases_ok: AtomicU64,
    releases_stale: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub acquisitions: u64,
    pub acquire_conflicts: u64,
    pub heartbeats_ok: u64,
    pub heartbeats_ambiguous: u64,
    pub heartbeats_rejected: u64,
    pub heartbeats_late: u64,
    pub resyncs: u64,
    pub leases_lost: u64,
    pub releases_ok: u64,
    pub releases_stale: u64,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_acquisition(&self) {
        self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acquire_conflict(&self) {
        self.inner.acquire_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_ok(&self) {
        self.inner.heartbeats_ok.fetch_add(1, Ordering::Relaxed);
    }

    /// Heartbeat whose server-side effect is unknown.
    pub(crate) fn record_heartbeat_ambiguous(&self) {
        self.inner.heartbeats_ambiguous.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat_rejected(&self) {
        self.inner.heartbeats_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Heartbeat that succeeded after its handle was closed.
    pub(crate) fn record_heartbeat_late(&self) {
        self.inner.heartbeats_late.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resync(&self) {
        self.inner.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lease_lost(&self) {
        self.inner.leases_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release_ok(&self) {
        self.inner.releases_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release_stale(&self) {
        self.inner.releases_stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            acquisitions: load(&self.inner.acquisitions),
            acquire_conflicts: load(&self.inner.acquire_conflicts),
            heartbeats_ok: load(&self.inner.heartbeats_ok),
            heartbeats_ambiguous: load(&self.inner.heartbeats_ambiguous),
            heartbeats_rejected: load(&self.inner.heartbeats_rejected),
            heartbeats_late: load(&self.inner.heartbeats_late),
            resyncs: load(&self.inner.resyncs),
            leases_lost: load(&self.inner.leases_lost),
            releases_ok: load(&self.inner.releases_ok),
            releases_stale: load(&self.inner.releases_stale),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_counters() {
        let metrics = LockMetrics::new();
        let clone = metrics.clone();
        clone.record_acquisition();
        clone.record_heartbeat_ambiguous();
        metrics.record_release_stale();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquisitions, 1);
        assert_eq!(snapshot.heartbeats_ambiguous, 1);
        assert_eq!(snapshot.releases_stale, 1);
        assert_eq!(snapshot.releases_ok, 0);
    }

    #[test]
    fn snapshot_serializes_as_flat_json() -> serde_json::Result<()> {
        let metrics = LockMetrics::new();
        metrics.record_heartbeat_ok();
        let json = serde_json::to_value(metrics.snapshot())?;
        assert_eq!(json["heartbeats_ok"], 1);
        assert_eq!(json["leases_lost"], 0);
        Ok(())
    }
}
