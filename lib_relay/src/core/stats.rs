//! # Stats Aggregator
//!
//! Running delivery tally for one source: events received, deliveries that
//! succeeded, deliveries that were given up on, and events received per type.
//!
//! ## Concurrency model
//!
//! Every in-flight delivery writes here, and fan-out width is unbounded, so
//! writers must never serialize behind one another:
//!
//! - The counters are `AtomicU64`s and the per-type map is a sharded
//!   [`DashMap`] of atomics. Writers only ever `fetch_add`.
//! - A `RwLock<()>` acts as a gate, not as a data lock. Writers take the
//!   *shared* side, so any number of them proceed in parallel. `snapshot` and
//!   `reset` take the *exclusive* side, so each recorded update lands entirely
//!   before or entirely after them. A snapshot never shows half an update and
//!   a reset never drops or double-counts one.
//!
//! Recording never fails: a poisoned gate is recovered because the guarded
//! value is `()` and carries no state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use serde::Serialize;

/// Point-in-time copy of one source's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Events received, filtered ones included.
    pub total_events: u64,
    /// Deliveries that reached an endpoint.
    pub successful_forwards: u64,
    /// Deliveries abandoned after the last retry.
    pub failed_forwards: u64,
    /// Events received per event type.
    pub by_event_type: BTreeMap<String, u64>,
    /// `successful / total` as a percentage with two decimals, `"0%"` when empty.
    pub success_rate: String,
}

/// Sum of every source's snapshot, computed on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    /// Number of sources that contributed.
    pub total_sources: usize,
    /// Events received across all sources.
    pub total_events: u64,
    /// Successful deliveries across all sources.
    pub successful_forwards: u64,
    /// Failed deliveries across all sources.
    pub failed_forwards: u64,
    /// Events received per event type across all sources.
    pub by_event_type: BTreeMap<String, u64>,
    /// Global success rate, same formula as per source.
    pub success_rate: String,
}

impl GlobalStats {
    /// Folds per-source snapshots into one global view.
    pub fn aggregate<'a, I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = &'a StatsSnapshot>,
    {
        let mut global = GlobalStats::default();

        for snapshot in snapshots {
            global.total_sources += 1;
            global.total_events += snapshot.total_events;
            global.successful_forwards += snapshot.successful_forwards;
            global.failed_forwards += snapshot.failed_forwards;
            for (event_type, count) in &snapshot.by_event_type {
                *global.by_event_type.entry(event_type.clone()).or_insert(0) += count;
            }
        }

        global.success_rate = success_rate(global.successful_forwards, global.total_events);
        global
    }
}

/// Formats `successful / total` the way the control plane reports it.
pub fn success_rate(successful: u64, total: u64) -> String {
    if total == 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", successful as f64 / total as f64 * 100.0)
}

/// Concurrency-safe per-source counters. See the module docs for the model.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    gate: RwLock<()>,
    total_events: AtomicU64,
    successful_forwards: AtomicU64,
    failed_forwards: AtomicU64,
    by_event_type: DashMap<String, AtomicU64>,
}

impl StatsAggregator {
    /// Creates an aggregator with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one received event of `event_type`, before any filtering.
    pub fn record_received(&self, event_type: &str) {
        let _gate = self.shared();
        self.bump_received(event_type);
    }

    /// Counts the final outcome of one (event, endpoint) delivery.
    pub fn record_delivery(&self, success: bool) {
        let _gate = self.shared();
        self.bump_delivery(success);
    }

    /// Counts a received event and its delivery outcome as one indivisible update.
    pub fn record_attempt(&self, event_type: &str, success: bool) {
        let _gate = self.shared();
        self.bump_received(event_type);
        self.bump_delivery(success);
    }

    /// Consistent copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let _gate = self.exclusive();

        // The exclusive gate orders these loads after every completed writer.
        let total_events = self.total_events.load(Ordering::Relaxed);
        let successful_forwards = self.successful_forwards.load(Ordering::Relaxed);
        let failed_forwards = self.failed_forwards.load(Ordering::Relaxed);
        let by_event_type = self
            .by_event_type
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();

        StatsSnapshot {
            total_events,
            successful_forwards,
            failed_forwards,
            by_event_type,
            success_rate: success_rate(successful_forwards, total_events),
        }
    }

    /// Zeroes every counter. The aggregator keeps its identity.
    pub fn reset(&self) {
        let _gate = self.exclusive();

        self.total_events.store(0, Ordering::Relaxed);
        self.successful_forwards.store(0, Ordering::Relaxed);
        self.failed_forwards.store(0, Ordering::Relaxed);
        self.by_event_type.clear();
    }

    fn bump_received(&self, event_type: &str) {
        self.total_events.fetch_add(1, Ordering::Relaxed);

        // Fast path: the type has been seen before, only a shard read lock is taken.
        if let Some(counter) = self.by_event_type.get(event_type) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.by_event_type
            .entry(event_type.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn bump_delivery(&self, success: bool) {
        let counter = if success {
            &self.successful_forwards
        } else {
            &self.failed_forwards
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_snapshot() {
        let stats = StatsAggregator::new();
        let snapshot = stats.snapshot();

        assert_eq!(snapshot.total_events, 0);
        assert_eq!(snapshot.successful_forwards, 0);
        assert_eq!(snapshot.failed_forwards, 0);
        assert!(snapshot.by_event_type.is_empty());
        assert_eq!(snapshot.success_rate, "0%");
    }

    #[test]
    fn test_received_and_delivery_counters() {
        let stats = StatsAggregator::new();
        stats.record_received("messages.upsert");
        stats.record_received("messages.upsert");
        stats.record_received("connection.update");
        stats.record_delivery(true);
        stats.record_delivery(false);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_events, 3);
        assert_eq!(snapshot.successful_forwards, 1);
        assert_eq!(snapshot.failed_forwards, 1);
        assert_eq!(snapshot.by_event_type.get("messages.upsert"), Some(&2));
        assert_eq!(snapshot.by_event_type.get("connection.update"), Some(&1));
        assert_eq!(snapshot.success_rate, "33.33%");
    }

    #[test]
    fn test_success_rate_format() {
        assert_eq!(success_rate(0, 0), "0%");
        assert_eq!(success_rate(1, 1), "100.00%");
        assert_eq!(success_rate(1, 3), "33.33%");
        // Fan-out to several endpoints can push it past 100%.
        assert_eq!(success_rate(2, 1), "200.00%");
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = StatsAggregator::new();
        stats.record_attempt("messages.upsert", true);
        stats.record_attempt("messages.upsert", false);
        stats.reset();

        assert_eq!(stats.snapshot(), StatsAggregator::new().snapshot());

        // Still usable after a reset.
        stats.record_attempt("send.message", true);
        assert_eq!(stats.snapshot().total_events, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_record_attempt_loses_nothing() {
        let stats = Arc::new(StatsAggregator::new());

        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let stats = Arc::clone(&stats);
                tokio::spawn(async move { stats.record_attempt("messages.upsert", true) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_events, 1000);
        assert_eq!(snapshot.successful_forwards, 1000);
        assert_eq!(snapshot.failed_forwards, 0);
        assert_eq!(snapshot.by_event_type.get("messages.upsert"), Some(&1000));
    }

    #[test]
    fn test_snapshots_stay_consistent_under_writers() {
        let stats = Arc::new(StatsAggregator::new());

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..5_000 {
                        stats.record_attempt("messages.upsert", true);
                    }
                })
            })
            .collect();

        // Each record_attempt bumps total and successful together, so no
        // snapshot may ever observe them apart.
        for _ in 0..200 {
            let snapshot = stats.snapshot();
            assert_eq!(snapshot.total_events, snapshot.successful_forwards);
            assert_eq!(
                snapshot.by_event_type.get("messages.upsert").copied().unwrap_or(0),
                snapshot.total_events
            );
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(stats.snapshot().total_events, 20_000);
    }

    #[test]
    fn test_global_aggregation() {
        let a = StatsAggregator::new();
        a.record_attempt("messages.upsert", true);
        let b = StatsAggregator::new();
        b.record_attempt("messages.upsert", false);
        b.record_received("connection.update");

        let snapshots = [a.snapshot(), b.snapshot()];
        let global = GlobalStats::aggregate(&snapshots);

        assert_eq!(global.total_sources, 2);
        assert_eq!(global.total_events, 3);
        assert_eq!(global.successful_forwards, 1);
        assert_eq!(global.failed_forwards, 1);
        assert_eq!(global.by_event_type.get("messages.upsert"), Some(&2));
        assert_eq!(global.by_event_type.get("connection.update"), Some(&1));
        assert_eq!(global.success_rate, "33.33%");
    }
}
