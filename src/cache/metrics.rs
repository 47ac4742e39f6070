//! Hit/miss, latency, and payload-size accounting.
//!
//! Counters live in memory behind a short-lived lock. Every hit or miss also
//! schedules a detached write of the whole snapshot to the backing store under
//! [`METRICS_STORE_KEY`], which is where the TTL policy reads aggregates from.
//! That write is best-effort: failures are logged and never reach the caller.
//!
//! Snapshots are numbered as they are taken and a write older than the last
//! one stored is dropped, so detached writes finishing out of order never
//! replace newer counters with older ones.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::CacheResult;
use super::store::CacheStore;

/// Store key holding the latest persisted [`MetricsSnapshot`].
pub const METRICS_STORE_KEY: &str = "cache:metrics:current";

const METRICS_STORE_TTL: u64 = 7 * 24 * 60 * 60;

/// `numerator / denominator`, or 0 when the denominator is 0.
pub(crate) fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Counters for one concrete resource key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyMetrics {
    pub hits: u64,
    pub misses: u64,
    pub last_access: Option<DateTime<Utc>>,
}

/// Aggregate counters for one resource type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub hits: u64,
    pub misses: u64,
    /// Milliseconds.
    pub total_latency: f64,
    pub avg_latency: f64,
    /// Bytes.
    pub total_size: u64,
    pub avg_size: f64,
    pub keys: BTreeMap<String, KeyMetrics>,
}

impl ResourceMetrics {
    pub fn requests(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        ratio(self.hits as f64, self.requests() as f64)
    }

    fn record_hit(&mut self, key: &str, latency_ms: f64, size_bytes: u64, now: DateTime<Utc>) {
        self.hits += 1;
        self.total_latency += latency_ms.max(0.0);
        self.total_size += size_bytes;
        let requests = self.requests() as f64;
        self.avg_latency = ratio(self.total_latency, requests);
        self.avg_size = ratio(self.total_size as f64, requests);

        let entry = self.keys.entry(key.to_owned()).or_default();
        entry.hits += 1;
        entry.last_access = Some(now);
    }

    fn record_miss(&mut self, key: &str, now: DateTime<Utc>) {
        self.misses += 1;
        let entry = self.keys.entry(key.to_owned()).or_default();
        entry.misses += 1;
        entry.last_access = Some(now);
    }
}

/// Overall counters across every resource type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// One resource type's metrics together with its derived hit rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    #[serde(flatten)]
    pub metrics: ResourceMetrics,
    pub hit_rate: f64,
}

/// Immutable point-in-time copy of all metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub overall: Totals,
    pub resources: BTreeMap<String, ResourceReport>,
}

impl MetricsSnapshot {
    /// Mean latency over every typed request, in milliseconds.
    pub fn avg_latency(&self) -> f64 {
        let (latency, requests) = self
            .resources
            .values()
            .fold((0.0, 0u64), |(l, r), report| {
                (l + report.metrics.total_latency, r + report.metrics.requests())
            });
        ratio(latency, requests as f64)
    }

    /// Fraction of observed resource keys that were served from cache at
    /// least once.
    pub fn resource_coverage(&self) -> f64 {
        let (covered, total) = self
            .resources
            .values()
            .flat_map(|report| report.metrics.keys.values())
            .fold((0u64, 0u64), |(c, t), key| {
                (c + u64::from(key.hits > 0), t + 1)
            });
        ratio(covered as f64, total as f64)
    }

    pub fn resource(&self, resource_type: &str) -> Option<&ResourceMetrics> {
        self.resources.get(resource_type).map(|r| &r.metrics)
    }
}

#[derive(Default)]
struct MetricsState {
    hits: u64,
    misses: u64,
    resources: BTreeMap<String, ResourceMetrics>,
}

impl MetricsState {
    fn snapshot(&self, timestamp: DateTime<Utc>) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp,
            overall: Totals {
                hits: self.hits,
                misses: self.misses,
                hit_rate: ratio(self.hits as f64, (self.hits + self.misses) as f64),
            },
            resources: self
                .resources
                .iter()
                .map(|(name, metrics)| {
                    let report = ResourceReport {
                        hit_rate: metrics.hit_rate(),
                        metrics: metrics.clone(),
                    };
                    (name.clone(), report)
                })
                .collect(),
        }
    }
}

/// Records cache hits and misses and keeps a bounded snapshot history.
pub struct MetricsRecorder {
    state: Mutex<MetricsState>,
    history: Mutex<VecDeque<MetricsSnapshot>>,
    store: Option<Arc<dyn CacheStore>>,
    retention: chrono::Duration,
    max_history: usize,
    /// Number of the latest snapshot handed out for persistence.
    generation: AtomicU64,
    /// Number of the latest snapshot written to the store.
    written: Arc<tokio::sync::Mutex<u64>>,
}

impl MetricsRecorder {
    /// A recorder that persists to `store` after every observation.
    pub fn new(
        store: Arc<dyn CacheStore>,
        retention: chrono::Duration,
        max_history: usize,
    ) -> Self {
        Self {
            store: Some(store),
            ..Self::in_memory(retention, max_history)
        }
    }

    /// A recorder that never persists.
    pub fn in_memory(retention: chrono::Duration, max_history: usize) -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
            history: Mutex::new(VecDeque::new()),
            store: None,
            retention,
            max_history: max_history.max(1),
            generation: AtomicU64::new(0),
            written: Arc::new(tokio::sync::Mutex::new(0)),
        }
    }

    /// Records a cache hit. `resource_type = None` only bumps the global counters.
    pub fn record_hit(
        &self,
        resource_type: Option<&str>,
        resource_key: &str,
        latency_ms: f64,
        size_bytes: u64,
    ) {
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state.hits += 1;
            if let Some(resource_type) = resource_type {
                state
                    .resources
                    .entry(resource_type.to_owned())
                    .or_default()
                    .record_hit(resource_key, latency_ms, size_bytes, now);
            }
        }
        self.persist_detached();
    }

    /// Records a cache miss. `resource_type = None` only bumps the global counters.
    pub fn record_miss(&self, resource_type: Option<&str>, resource_key: &str) {
        let now = Utc::now();
        {
            let mut state = self.state.lock();
            state.misses += 1;
            if let Some(resource_type) = resource_type {
                state
                    .resources
                    .entry(resource_type.to_owned())
                    .or_default()
                    .record_miss(resource_key, now);
            }
        }
        self.persist_detached();
    }

    /// Current metrics as an immutable snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.state.lock().snapshot(Utc::now())
    }

    /// Appends the current metrics to history and prunes entries older than
    /// the retention window.
    pub fn take_snapshot(&self) -> MetricsSnapshot {
        self.take_snapshot_at(Utc::now())
    }

    pub fn take_snapshot_at(&self, now: DateTime<Utc>) -> MetricsSnapshot {
        let snapshot = self.state.lock().snapshot(now);
        let cutoff = now - self.retention;

        let mut history = self.history.lock();
        history.push_back(snapshot.clone());
        while history.front().is_some_and(|s| s.timestamp < cutoff) {
            history.pop_front();
        }
        while history.len() > self.max_history {
            history.pop_front();
        }
        debug!(retained = history.len(), "metrics snapshot taken");
        snapshot
    }

    /// The newest `limit` snapshots, oldest first.
    pub fn history(&self, limit: usize) -> Vec<MetricsSnapshot> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// The oldest retained snapshot, used as the tuning baseline.
    pub fn baseline(&self) -> Option<MetricsSnapshot> {
        self.history.lock().front().cloned()
    }

    /// Zeroes every counter. History is kept.
    pub fn reset_metrics(&self) {
        *self.state.lock() = MetricsState::default();
        self.persist_detached();
    }

    /// Writes the current snapshot to the store and waits for the write.
    /// Does nothing if a newer snapshot has already been written.
    pub async fn persist(&self) -> CacheResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let (generation, json) = self.numbered_json()?;
        write_in_order(store.as_ref(), &self.written, generation, json).await?;
        Ok(())
    }

    fn persist_detached(&self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let (generation, json) = match self.numbered_json() {
            Ok(numbered) => numbered,
            Err(e) => {
                warn!(error = %e, "failed to serialize metrics");
                return;
            }
        };
        let written = Arc::clone(&self.written);
        handle.spawn(async move {
            if let Err(e) = write_in_order(store.as_ref(), &written, generation, json).await {
                warn!(error = %e, "failed to persist metrics");
            }
        });
    }

    /// The current snapshot as JSON, numbered in the order snapshots are taken.
    fn numbered_json(&self) -> serde_json::Result<(u64, String)> {
        let (generation, snapshot) = {
            let state = self.state.lock();
            let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
            (generation, state.snapshot(Utc::now()))
        };
        Ok((generation, serde_json::to_string(&snapshot)?))
    }
}

/// Stores `json` unless a snapshot numbered `generation` or later is already
/// stored. Returns whether the write happened.
async fn write_in_order(
    store: &dyn CacheStore,
    written: &tokio::sync::Mutex<u64>,
    generation: u64,
    json: String,
) -> CacheResult<bool> {
    let mut last = written.lock().await;
    if generation <= *last {
        debug!(generation, last = *last, "skipping stale metrics write");
        return Ok(false);
    }
    store.set(METRICS_STORE_KEY, json, METRICS_STORE_TTL).await?;
    *last = generation;
    Ok(true)
}

/// Reads the snapshot last persisted by a [`MetricsRecorder`].
pub async fn load_persisted(store: &dyn CacheStore) -> CacheResult<Option<MetricsSnapshot>> {
    match store.get(METRICS_STORE_KEY).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;
    use crate::cache::testing::FailingStore;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::in_memory(chrono::Duration::hours(1), 10)
    }

    #[test]
    fn hit_miss_accounting() {
        let metrics = recorder();
        for _ in 0..3 {
            metrics.record_hit(Some("widgets"), "42", 10.0, 100);
        }
        metrics.record_miss(Some("widgets"), "42");

        let snapshot = metrics.metrics();
        assert_eq!(snapshot.overall.hits, 3);
        assert_eq!(snapshot.overall.misses, 1);
        assert!((snapshot.overall.hit_rate - 0.75).abs() < f64::EPSILON);

        let widgets = snapshot.resource("widgets").unwrap();
        assert_eq!(widgets.keys["42"].hits, 3);
        assert_eq!(widgets.keys["42"].misses, 1);
        assert!(widgets.keys["42"].last_access.is_some());
    }

    #[test]
    fn averages_divide_by_all_requests() {
        let metrics = recorder();
        metrics.record_miss(Some("widgets"), "1");
        metrics.record_hit(Some("widgets"), "1", 30.0, 400);

        let snapshot = metrics.metrics();
        let widgets = snapshot.resource("widgets").unwrap();
        assert!((widgets.avg_latency - 15.0).abs() < f64::EPSILON);
        assert!((widgets.avg_size - 200.0).abs() < f64::EPSILON);
        assert!((snapshot.avg_latency() - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn untyped_observations_only_touch_totals() {
        let metrics = recorder();
        metrics.record_hit(None, "x", 5.0, 10);
        metrics.record_miss(None, "x");
        let snapshot = metrics.metrics();
        assert_eq!(snapshot.overall.hits, 1);
        assert_eq!(snapshot.overall.misses, 1);
        assert!(snapshot.resources.is_empty());
    }

    #[test]
    fn zero_traffic_hit_rate_is_zero() {
        let snapshot = recorder().metrics();
        assert_eq!(snapshot.overall.hit_rate, 0.0);
        assert_eq!(snapshot.avg_latency(), 0.0);
        assert_eq!(snapshot.resource_coverage(), 0.0);
    }

    #[test]
    fn coverage_counts_keys_with_hits() {
        let metrics = recorder();
        metrics.record_hit(Some("widgets"), "1", 1.0, 1);
        metrics.record_miss(Some("widgets"), "2");
        metrics.record_miss(Some("gadgets"), "3");
        metrics.record_hit(Some("gadgets"), "4", 1.0, 1);
        assert!((metrics.metrics().resource_coverage() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn reset_keeps_history() {
        let metrics = recorder();
        metrics.record_hit(Some("widgets"), "1", 1.0, 1);
        metrics.take_snapshot();
        metrics.reset_metrics();

        assert_eq!(metrics.metrics().overall.hits, 0);
        assert!(metrics.metrics().resources.is_empty());
        let history = metrics.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].overall.hits, 1);
    }

    #[test]
    fn history_is_pruned_by_retention_and_length() {
        let metrics = MetricsRecorder::in_memory(chrono::Duration::minutes(30), 3);
        let start = Utc::now();
        metrics.take_snapshot_at(start);
        metrics.take_snapshot_at(start + chrono::Duration::minutes(10));
        metrics.take_snapshot_at(start + chrono::Duration::minutes(40));
        // the first snapshot is now older than the retention window
        assert_eq!(metrics.history(10).len(), 2);

        for minute in 41..45 {
            metrics.take_snapshot_at(start + chrono::Duration::minutes(minute));
        }
        let history = metrics.history(10);
        assert_eq!(history.len(), 3);
        assert!(history[0].timestamp < history[2].timestamp);
        assert_eq!(metrics.history(1)[0].timestamp, history[2].timestamp);
    }

    #[tokio::test]
    async fn persisted_snapshot_round_trips() {
        let store = Arc::new(MemoryStore::new());
        let metrics = MetricsRecorder::new(store.clone(), chrono::Duration::hours(1), 10);
        metrics.record_hit(Some("widgets"), "42", 12.0, 64);
        metrics.persist().await.unwrap();

        let loaded = load_persisted(store.as_ref()).await.unwrap().unwrap();
        assert_eq!(loaded.overall.hits, 1);
        assert_eq!(loaded.resource("widgets").unwrap().keys["42"].hits, 1);
    }

    #[tokio::test]
    async fn failing_store_never_reaches_the_caller() {
        let store = Arc::new(FailingStore);
        let metrics = MetricsRecorder::new(store, chrono::Duration::hours(1), 10);
        metrics.record_hit(Some("widgets"), "42", 12.0, 64);
        metrics.record_miss(Some("widgets"), "42");
        tokio::task::yield_now().await;
        assert_eq!(metrics.metrics().overall.hits, 1);
        assert!(metrics.persist().await.is_err());
    }

    #[tokio::test]
    async fn stale_snapshots_never_overwrite_newer_ones() {
        let store = Arc::new(MemoryStore::new());
        let metrics = MetricsRecorder::new(store.clone(), chrono::Duration::hours(1), 10);
        metrics.record_miss(Some("widgets"), "1");
        let (older, older_json) = metrics.numbered_json().unwrap();
        metrics.record_miss(Some("widgets"), "2");
        let (newer, newer_json) = metrics.numbered_json().unwrap();
        assert!(older < newer);

        let written = &metrics.written;
        assert!(write_in_order(store.as_ref(), written, newer, newer_json).await.unwrap());
        assert!(!write_in_order(store.as_ref(), written, older, older_json).await.unwrap());

        // Let the detached writes queued by `record_miss` finish.
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        let persisted = load_persisted(store.as_ref()).await.unwrap().unwrap();
        assert_eq!(persisted.overall.misses, 2);
        assert_eq!(persisted.resource("widgets").unwrap().keys.len(), 2);
    }
}
