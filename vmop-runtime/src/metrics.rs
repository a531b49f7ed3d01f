//! Counters recorded by the dispatchers
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Default, Debug)]
struct KindCounters {
    reconciles: AtomicU64,
    throttled: AtomicU64,
}

/// Point-in-time values of the counters of one kind
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct KindStats {
    /// Reconcile attempts for objects that existed when fetched
    pub reconciles: u64,
    /// Attempts skipped by the admission gate
    pub throttled: u64,
}

/// Per-kind reconcile counters
///
/// Cheap to clone; clones share the same counters. Recording never fails.
#[derive(Clone, Default, Debug)]
pub struct ObjectStats {
    kinds: Arc<RwLock<BTreeMap<String, Arc<KindCounters>>>>,
}

impl ObjectStats {
    fn counters(&self, kind: &str) -> Arc<KindCounters> {
        if let Some(counters) = self.kinds.read().get(kind) {
            return counters.clone();
        }
        self.kinds.write().entry(kind.to_string()).or_default().clone()
    }

    /// Count a reconcile attempt of an object of `kind`
    pub fn record_reconcile(&self, kind: &str) {
        self.counters(kind).reconciles.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an attempt of `kind` skipped by the admission gate
    pub fn record_throttled(&self, kind: &str) {
        self.counters(kind).throttled.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter values of every kind seen so far
    pub fn snapshot(&self) -> BTreeMap<String, KindStats> {
        self.kinds
            .read()
            .iter()
            .map(|(kind, counters)| {
                (kind.clone(), KindStats {
                    reconciles: counters.reconciles.load(Ordering::Relaxed),
                    throttled: counters.throttled.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    /// Counter values of a single kind
    pub fn get(&self, kind: &str) -> KindStats {
        self.snapshot().remove(kind).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::{KindStats, ObjectStats};

    #[test]
    fn clones_share_counters() {
        let stats = ObjectStats::default();
        let handle = stats.clone();
        stats.record_reconcile("VMRule");
        handle.record_reconcile("VMRule");
        handle.record_throttled("VMRule");
        stats.record_reconcile("VMUser");

        assert_eq!(stats.get("VMRule"), KindStats {
            reconciles: 2,
            throttled: 1
        });
        assert_eq!(stats.snapshot().len(), 2);
        assert_eq!(stats.get("VMProbe"), KindStats::default());
    }
}
