use crate::condition::Code;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges maintained by the reconcilers and the patroller.
/// Everything is cheap to bump from any worker; the report loop samples a
/// snapshot per interval.
#[derive(Debug, Default)]
pub struct Metrics {
    hierarchy_reconciles: AtomicU64,
    object_reconciles: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    overwrites: AtomicU64,
    requeues: AtomicU64,
    drift: AtomicU64,
    current: AtomicU64,
    peak: AtomicU64,
    conditions: Mutex<BTreeMap<Code, u64>>,
}

impl Metrics {
    /// Counts one hierarchy reconciliation.
    pub fn hierarchy_reconcile(&self) {
        self.hierarchy_reconciles.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one object reconciliation.
    pub fn object_reconcile(&self) {
        self.object_reconciles.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one API write (create or update).
    pub fn write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one API delete.
    pub fn delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one propagated copy overwritten back to its source form.
    pub fn overwrite(&self) {
        self.overwrites.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts one work item requeued after a transient failure.
    pub fn requeue(&self) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds drift found by a patrol pass.
    pub fn add_drift(&self, count: u64) {
        self.drift.fetch_add(count, Ordering::Relaxed);
    }

    /// Marks a reconciliation as running until the guard drops, tracking
    /// the concurrency peak.
    pub fn inflight(&self) -> Inflight<'_> {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        Inflight(self)
    }

    /// Reconciliations running right now.
    pub fn in_flight(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    /// Returns the concurrency peak since the last sample and restarts it
    /// from the current level.
    pub fn sample_peak(&self) -> u64 {
        self.peak
            .swap(self.current.load(Ordering::Relaxed), Ordering::Relaxed)
    }

    /// Replaces the namespace-condition gauge with a fresh census.
    pub fn record_conditions(&self, census: BTreeMap<Code, u64>) {
        *self.conditions.lock() = census;
    }

    /// Copies out all counters.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            hierarchy_reconciles: self.hierarchy_reconciles.load(Ordering::Relaxed),
            object_reconciles: self.object_reconciles.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            overwrites: self.overwrites.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            drift: self.drift.load(Ordering::Relaxed),
            in_flight: self.current.load(Ordering::Relaxed),
            conditions: self.conditions.lock().clone(),
        }
    }
}

/// Guard marking one running reconciliation.
pub struct Inflight<'a>(&'a Metrics);

impl Drop for Inflight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    /// Hierarchy reconciliations performed.
    pub hierarchy_reconciles: u64,
    /// Object reconciliations performed.
    pub object_reconciles: u64,
    /// API writes issued.
    pub writes: u64,
    /// API deletes issued.
    pub deletes: u64,
    /// Propagated copies overwritten.
    pub overwrites: u64,
    /// Work items requeued after transient failures.
    pub requeues: u64,
    /// Drift counted by the patroller.
    pub drift: u64,
    /// Reconciliations running at snapshot time.
    pub in_flight: u64,
    /// Namespaces per condition code at the last census.
    pub conditions: BTreeMap<Code, u64>,
}
