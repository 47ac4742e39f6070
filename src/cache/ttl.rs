//! Adaptive TTL policy.
//!
//! A resource's TTL is `MIN_TTL + floor(score * (MAX_TTL - MIN_TTL))`, where
//! `score` is a weighted sum of three factors in `[0, 1]`:
//!
//! | factor             | meaning                                                   |
//! |--------------------|-----------------------------------------------------------|
//! | `access_frequency` | key's access count relative to the busiest key of its type |
//! | `miss_rate`        | `1 - misses / requests` for the resource type             |
//! | `latency`          | average latency, capped at 100 ms, scaled to `[0, 1]`     |
//!
//! The weights always sum to 1 and stay within `[MIN_WEIGHT, MAX_WEIGHT]`;
//! [`TtlPolicy::auto_tune_weights`] nudges them from observed traffic.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::access::AccessTracker;
use super::error::CacheResult;
use super::metrics::{self, MetricsRecorder, MetricsSnapshot, ratio};
use super::store::CacheStore;

pub const MIN_TTL: u64 = 300;
pub const MAX_TTL: u64 = 86_400;
pub const DEFAULT_TTL: u64 = 3_600;

pub const MIN_WEIGHT: f64 = 0.1;
pub const MAX_WEIGHT: f64 = 0.7;

const LATENCY_CAP_MS: f64 = 100.0;

const TARGET_HIT_RATE: f64 = 0.75;
const TARGET_LATENCY_IMPROVEMENT: f64 = 0.10;
const TARGET_COVERAGE: f64 = 0.6;

/// Relative importance of each TTL factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TtlWeights {
    pub access_frequency: f64,
    pub miss_rate: f64,
    pub latency: f64,
}

impl Default for TtlWeights {
    fn default() -> Self {
        Self {
            access_frequency: 0.5,
            miss_rate: 0.3,
            latency: 0.2,
        }
    }
}

impl TtlWeights {
    pub fn sum(&self) -> f64 {
        self.access_frequency + self.miss_rate + self.latency
    }

    fn to_array(self) -> [f64; 3] {
        [self.access_frequency, self.miss_rate, self.latency]
    }

    fn from_array([access_frequency, miss_rate, latency]: [f64; 3]) -> Self {
        Self {
            access_frequency,
            miss_rate,
            latency,
        }
    }

    /// Clamps every weight to `[MIN_WEIGHT, MAX_WEIGHT]` and redistributes the
    /// difference so they sum to 1. Leftover floating-point error goes to the
    /// largest weight.
    pub fn rebalanced(self) -> Self {
        let mut w = self.to_array().map(|v| {
            if v.is_finite() {
                v.clamp(MIN_WEIGHT, MAX_WEIGHT)
            } else {
                MIN_WEIGHT
            }
        });

        // Each pass either balances exactly or pins at least one weight to a
        // bound, so len + 1 passes always suffice.
        for _ in 0..=w.len() {
            let diff = 1.0 - w.iter().sum::<f64>();
            if diff.abs() <= f64::EPSILON {
                break;
            }
            let movable: Vec<usize> = (0..w.len())
                .filter(|&i| {
                    if diff > 0.0 {
                        w[i] < MAX_WEIGHT
                    } else {
                        w[i] > MIN_WEIGHT
                    }
                })
                .collect();
            let base: f64 = movable.iter().map(|&i| w[i]).sum();
            for &i in &movable {
                let share = if base > 0.0 {
                    w[i] / base
                } else {
                    1.0 / movable.len() as f64
                };
                w[i] = (w[i] + diff * share).clamp(MIN_WEIGHT, MAX_WEIGHT);
            }
        }

        let largest = (0..w.len())
            .max_by(|&a, &b| w[a].total_cmp(&w[b]))
            .unwrap_or(0);
        w[largest] += 1.0 - w.iter().sum::<f64>();
        Self::from_array(w)
    }
}

/// Process-wide weights shared between the policy and whoever tunes it.
///
/// Cloning shares the same underlying weights.
#[derive(Debug, Clone, Default)]
pub struct SharedWeights(Arc<RwLock<TtlWeights>>);

impl SharedWeights {
    pub fn new(weights: TtlWeights) -> Self {
        Self(Arc::new(RwLock::new(weights.rebalanced())))
    }

    pub fn get(&self) -> TtlWeights {
        *self.0.read()
    }

    /// Applies `f` to the current weights under the write lock and returns
    /// `(before, after)`.
    pub fn update<F>(&self, f: F) -> (TtlWeights, TtlWeights)
    where
        F: FnOnce(TtlWeights) -> TtlWeights,
    {
        let mut guard = self.0.write();
        let before = *guard;
        *guard = f(before).rebalanced();
        (before, *guard)
    }

    pub fn reset(&self) -> TtlWeights {
        self.update(|_| TtlWeights::default()).1
    }
}

/// The three normalized inputs to a TTL score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TtlFactors {
    pub access_frequency: f64,
    pub miss_rate: f64,
    pub latency: f64,
}

impl TtlFactors {
    pub fn new(
        access_count: u64,
        max_access_count: u64,
        hits: u64,
        misses: u64,
        avg_latency_ms: f64,
    ) -> Self {
        let miss_ratio = ratio(misses as f64, (hits + misses) as f64);
        Self {
            access_frequency: ratio(access_count as f64, max_access_count as f64).clamp(0.0, 1.0),
            // no traffic means no evidence of stability
            miss_rate: if hits + misses == 0 { 0.0 } else { 1.0 - miss_ratio },
            latency: avg_latency_ms.clamp(0.0, LATENCY_CAP_MS) / LATENCY_CAP_MS,
        }
    }

    pub fn score(&self, weights: &TtlWeights) -> f64 {
        let score = weights.access_frequency * self.access_frequency
            + weights.miss_rate * self.miss_rate
            + weights.latency * self.latency;
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Maps a score in `[0, 1]` onto `[MIN_TTL, MAX_TTL]`.
pub fn ttl_for_score(score: f64) -> u64 {
    let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
    let span = (MAX_TTL - MIN_TTL) as f64;
    (MIN_TTL + (score * span).floor() as u64).min(MAX_TTL)
}

/// Baseline-versus-current comparison consumed by auto-tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub baseline_latency_ms: f64,
    pub current_latency_ms: f64,
    pub baseline_hit_rate: f64,
    pub current_hit_rate: f64,
}

impl ComparisonReport {
    /// Compares `current` against `baseline`; without a baseline the current
    /// snapshot is its own baseline (no improvement).
    pub fn from_snapshots(baseline: Option<&MetricsSnapshot>, current: &MetricsSnapshot) -> Self {
        let baseline = baseline.unwrap_or(current);
        Self {
            baseline_latency_ms: baseline.avg_latency(),
            current_latency_ms: current.avg_latency(),
            baseline_hit_rate: baseline.overall.hit_rate,
            current_hit_rate: current.overall.hit_rate,
        }
    }

    /// Relative latency reduction, `(baseline - current) / baseline`.
    pub fn latency_improvement(&self) -> f64 {
        ratio(
            self.baseline_latency_ms - self.current_latency_ms,
            self.baseline_latency_ms,
        )
    }
}

/// What an auto-tune pass observed and changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TuneReport {
    pub hit_rate: f64,
    pub latency_improvement: f64,
    pub resource_coverage: f64,
    pub adjustments: Vec<&'static str>,
    pub previous: TtlWeights,
    pub weights: TtlWeights,
}

/// Computes adaptive TTLs from persisted metrics and access counts.
pub struct TtlPolicy {
    store: Arc<dyn CacheStore>,
    access: Arc<AccessTracker>,
    weights: SharedWeights,
    enabled: bool,
}

impl TtlPolicy {
    pub fn new(
        store: Arc<dyn CacheStore>,
        access: Arc<AccessTracker>,
        weights: SharedWeights,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            access,
            weights,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn weights(&self) -> TtlWeights {
        self.weights.get()
    }

    /// TTL in seconds for a resource. Never fails: disabled policy, missing
    /// data, and errors all yield [`DEFAULT_TTL`].
    pub async fn compute_ttl(&self, resource_type: &str, resource_key: &str) -> u64 {
        if !self.enabled {
            return DEFAULT_TTL;
        }
        match self.try_compute_ttl(resource_type, resource_key).await {
            Ok(ttl) => ttl,
            Err(e) => {
                error!(resource_type, resource_key, error = %e, "TTL computation failed");
                DEFAULT_TTL
            }
        }
    }

    /// Like [`compute_ttl`](Self::compute_ttl) but surfaces store and
    /// decoding errors so the caller can choose its own fallback.
    pub async fn try_compute_ttl(
        &self,
        resource_type: &str,
        resource_key: &str,
    ) -> CacheResult<u64> {
        let Some(factors) = self.factors(resource_type, resource_key).await? else {
            return Ok(DEFAULT_TTL);
        };
        // Weights are read only after every await so a concurrent tune is seen.
        let weights = self.weights.get();
        let ttl = ttl_for_score(factors.score(&weights));
        debug!(resource_type, resource_key, ttl, ?factors, "adaptive TTL computed");
        Ok(ttl)
    }

    /// Factors for a resource, or `None` when metrics or access data are absent.
    pub async fn factors(
        &self,
        resource_type: &str,
        resource_key: &str,
    ) -> CacheResult<Option<TtlFactors>> {
        let Some(snapshot) = metrics::load_persisted(self.store.as_ref()).await? else {
            return Ok(None);
        };
        let Some(resource) = snapshot.resource(resource_type) else {
            return Ok(None);
        };
        let Some(count) = self.access.access_count(resource_type, resource_key).await? else {
            return Ok(None);
        };
        let max = self.access.max_access_count(resource_type).await?;

        Ok(Some(TtlFactors::new(
            count,
            max.max(count),
            resource.hits,
            resource.misses,
            resource.avg_latency,
        )))
    }

    /// Adjusts the weights from current traffic and a baseline comparison.
    pub fn auto_tune_weights(
        &self,
        current: &MetricsSnapshot,
        report: &ComparisonReport,
    ) -> TuneReport {
        let hit_rate = current.overall.hit_rate;
        let latency_improvement = report.latency_improvement();
        let resource_coverage = current.resource_coverage();

        let mut adjustments = Vec::new();
        let (previous, weights) = self.weights.update(|mut w| {
            if hit_rate < TARGET_HIT_RATE {
                w.access_frequency += 0.05;
                w.miss_rate -= 0.03;
                adjustments.push("low hit rate");
            }
            if latency_improvement < TARGET_LATENCY_IMPROVEMENT {
                w.latency += 0.04;
                w.access_frequency -= 0.02;
                adjustments.push("low latency improvement");
            }
            if resource_coverage < TARGET_COVERAGE {
                w.miss_rate += 0.03;
                w.access_frequency -= 0.01;
                w.latency -= 0.02;
                adjustments.push("low resource coverage");
            }
            w
        });

        info!(
            hit_rate,
            latency_improvement,
            resource_coverage,
            ?previous,
            ?weights,
            "TTL weights tuned"
        );
        TuneReport {
            hit_rate,
            latency_improvement,
            resource_coverage,
            adjustments,
            previous,
            weights,
        }
    }

    /// Tunes against the recorder's current metrics and oldest retained snapshot.
    pub fn auto_tune(&self, recorder: &MetricsRecorder) -> TuneReport {
        let current = recorder.metrics();
        let baseline = recorder.baseline();
        let report = ComparisonReport::from_snapshots(baseline.as_ref(), &current);
        self.auto_tune_weights(&current, &report)
    }

    /// Restores the default weights.
    pub fn reset_weights(&self) -> TtlWeights {
        let weights = self.weights.reset();
        info!(?weights, "TTL weights reset");
        weights
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::metrics::MetricsRecorder;
    use crate::cache::store::MemoryStore;
    use crate::cache::testing::FailingStore;

    fn assert_valid(w: TtlWeights) {
        assert!((w.sum() - 1.0).abs() < 1e-9, "sum {} for {w:?}", w.sum());
        for v in [w.access_frequency, w.miss_rate, w.latency] {
            assert!((MIN_WEIGHT - 1e-9..=MAX_WEIGHT + 1e-9).contains(&v), "{w:?}");
        }
    }

    fn policy(store: Arc<dyn CacheStore>, enabled: bool) -> (Arc<AccessTracker>, TtlPolicy) {
        let access = Arc::new(AccessTracker::new(store.clone()));
        let policy = TtlPolicy::new(store, access.clone(), SharedWeights::default(), enabled);
        (access, policy)
    }

    fn snapshot_with(
        hits: u64,
        misses: u64,
        latency_ms: f64,
        keys_hit: usize,
        keys_total: usize,
    ) -> MetricsSnapshot {
        let recorder = MetricsRecorder::in_memory(chrono::Duration::hours(1), 10);
        for i in 0..keys_total {
            let key = i.to_string();
            if i < keys_hit {
                recorder.record_hit(Some("widgets"), &key, latency_ms, 10);
            } else {
                recorder.record_miss(Some("widgets"), &key);
            }
        }
        let mut snapshot = recorder.metrics();
        snapshot.overall.hits = hits;
        snapshot.overall.misses = misses;
        snapshot.overall.hit_rate = ratio(hits as f64, (hits + misses) as f64);
        snapshot
    }

    #[test]
    fn ttl_stays_within_bounds() {
        let grid = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        let mut seed: u64 = 0x9e37_79b9;
        for _ in 0..500 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let pick = |shift: u32| grid[((seed >> shift) % grid.len() as u64) as usize];
            let weights = TtlWeights {
                access_frequency: pick(1),
                miss_rate: pick(9),
                latency: pick(17),
            }
            .rebalanced();
            let factors = TtlFactors::new(
                seed % 100,
                (seed >> 8) % 100,
                seed % 7,
                (seed >> 4) % 7,
                (seed % 500) as f64,
            );
            let ttl = ttl_for_score(factors.score(&weights));
            assert!((MIN_TTL..=MAX_TTL).contains(&ttl), "ttl {ttl}");
        }
        assert_eq!(ttl_for_score(f64::NAN), MIN_TTL);
        assert_eq!(ttl_for_score(2.0), MAX_TTL);
        assert_eq!(ttl_for_score(0.0), MIN_TTL);
    }

    #[test]
    fn factors_guard_zero_denominators() {
        let f = TtlFactors::new(0, 0, 0, 0, 0.0);
        assert_eq!(f, TtlFactors { access_frequency: 0.0, miss_rate: 0.0, latency: 0.0 });

        let f = TtlFactors::new(5, 10, 3, 1, 250.0);
        assert!((f.access_frequency - 0.5).abs() < f64::EPSILON);
        assert!((f.miss_rate - 0.75).abs() < f64::EPSILON);
        assert!((f.latency - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rebalance_holds_invariants() {
        let cases = [
            TtlWeights { access_frequency: 0.9, miss_rate: 0.05, latency: 0.05 },
            TtlWeights { access_frequency: 0.0, miss_rate: 0.0, latency: 0.0 },
            TtlWeights { access_frequency: 3.0, miss_rate: 2.0, latency: 1.0 },
            TtlWeights { access_frequency: f64::NAN, miss_rate: 0.5, latency: 0.5 },
            TtlWeights { access_frequency: 0.55, miss_rate: 0.27, latency: 0.22 },
        ];
        for case in cases {
            assert_valid(case.rebalanced());
        }
        assert_eq!(TtlWeights::default().rebalanced(), TtlWeights::default());
    }

    #[test]
    fn auto_tune_keeps_invariants_under_repeated_pressure() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let (_, policy) = policy(store, true);
        let poor = snapshot_with(1, 9, 50.0, 1, 10);
        let report = ComparisonReport::default();

        for _ in 0..50 {
            let tuned = policy.auto_tune_weights(&poor, &report);
            assert_eq!(tuned.adjustments.len(), 3);
            assert_valid(tuned.weights);
        }
        assert_valid(policy.reset_weights());
        assert_eq!(policy.weights(), TtlWeights::default());
    }

    #[test]
    fn low_hit_rate_shifts_weight_to_access_frequency() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let (_, policy) = policy(store, true);
        let current = snapshot_with(1, 9, 50.0, 10, 10);
        let report = ComparisonReport {
            baseline_latency_ms: 100.0,
            current_latency_ms: 50.0,
            ..ComparisonReport::default()
        };

        let tuned = policy.auto_tune_weights(&current, &report);
        assert_eq!(tuned.adjustments, vec!["low hit rate"]);
        assert!(tuned.weights.access_frequency > tuned.previous.access_frequency);
        assert!(tuned.weights.miss_rate < tuned.previous.miss_rate);
        assert_valid(tuned.weights);
    }

    #[test]
    fn healthy_traffic_leaves_weights_alone() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let (_, policy) = policy(store, true);
        let current = snapshot_with(9, 1, 20.0, 10, 10);
        let report = ComparisonReport {
            baseline_latency_ms: 100.0,
            current_latency_ms: 20.0,
            ..ComparisonReport::default()
        };
        let tuned = policy.auto_tune_weights(&current, &report);
        assert!(tuned.adjustments.is_empty());
        assert_eq!(tuned.weights, TtlWeights::default());
    }

    #[test]
    fn latency_improvement_without_baseline_is_zero() {
        let current = snapshot_with(1, 1, 40.0, 1, 2);
        let report = ComparisonReport::from_snapshots(None, &current);
        assert_eq!(report.latency_improvement(), 0.0);
        assert_eq!(ComparisonReport::default().latency_improvement(), 0.0);
    }

    #[tokio::test]
    async fn disabled_or_missing_data_defaults() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let (access, disabled) = policy(store.clone(), false);
        access.track_access("widgets", "42").await.unwrap();
        assert_eq!(disabled.compute_ttl("widgets", "42").await, DEFAULT_TTL);

        let (_, enabled) = policy(store, true);
        // no persisted metrics yet
        assert_eq!(enabled.compute_ttl("widgets", "42").await, DEFAULT_TTL);
    }

    #[tokio::test]
    async fn store_failure_defaults() {
        let (_, policy) = policy(Arc::new(FailingStore), true);
        assert!(policy.try_compute_ttl("widgets", "42").await.is_err());
        assert_eq!(policy.compute_ttl("widgets", "42").await, DEFAULT_TTL);
    }

    #[tokio::test]
    async fn malformed_metrics_blob_defaults() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        store
            .set(metrics::METRICS_STORE_KEY, "{not json".into(), 60)
            .await
            .unwrap();
        let (access, policy) = policy(store, true);
        access.track_access("widgets", "42").await.unwrap();
        assert!(policy.try_compute_ttl("widgets", "42").await.is_err());
        assert_eq!(policy.compute_ttl("widgets", "42").await, DEFAULT_TTL);
    }

    #[tokio::test]
    async fn frequently_accessed_keys_live_longer() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let recorder = MetricsRecorder::new(store.clone(), chrono::Duration::hours(1), 10);
        recorder.record_miss(Some("widgets"), "42");
        recorder.record_hit(Some("widgets"), "42", 20.0, 128);
        recorder.persist().await.unwrap();

        let (access, policy) = policy(store, true);
        for _ in 0..50 {
            access.track_access("widgets", "42").await.unwrap();
        }
        for _ in 0..5 {
            access.track_access("widgets", "7").await.unwrap();
        }

        let hot = policy.compute_ttl("widgets", "42").await;
        let cold = policy.compute_ttl("widgets", "7").await;
        assert!(hot > cold, "hot {hot} cold {cold}");
        assert!((MIN_TTL..=MAX_TTL).contains(&hot));
        assert!((MIN_TTL..=MAX_TTL).contains(&cold));

        // 0.5 * 1.0 + 0.3 * 0.5 + 0.2 * 0.1 = 0.67
        let expected = ttl_for_score(0.67);
        assert!(hot.abs_diff(expected) <= 1, "hot {hot} expected {expected}");
    }
}
