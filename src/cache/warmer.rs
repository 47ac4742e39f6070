//! Proactive refresh of popular cache entries.
//!
//! The warmer keeps an in-memory tally of accessed resources along with a
//! fetch function able to regenerate each one. A warm cycle re-fetches the
//! most popular candidates concurrently and writes the results back with a
//! flat [`WARM_TTL`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::error::{CacheError, CacheResult};
use super::store::CacheStore;

/// TTL for warmed entries, independent of the adaptive policy.
pub const WARM_TTL: u64 = 3_600;

/// Regenerates the stored value for one candidate. `Ok(None)` means there is
/// nothing worth caching right now.
pub type FetchFn = Arc<dyn Fn() -> BoxFuture<'static, CacheResult<Option<String>>> + Send + Sync>;

/// Wraps an async closure as a [`FetchFn`].
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::warmer::fetch_fn;
///
/// let fetch = fetch_fn(|| async { Ok(Some(r#"{"id":42}"#.to_string())) });
/// ```
pub fn fetch_fn<F, Fut>(f: F) -> FetchFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<Option<String>>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

#[derive(Clone)]
struct WarmCandidate {
    resource_type: String,
    key: String,
    fetch: FetchFn,
    hits: u64,
    last_accessed: DateTime<Utc>,
}

/// Read-only view of a tracked candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WarmCandidateSummary {
    pub resource_type: String,
    pub key: String,
    pub hits: u64,
    pub last_accessed: DateTime<Utc>,
}

impl From<&WarmCandidate> for WarmCandidateSummary {
    fn from(c: &WarmCandidate) -> Self {
        Self {
            resource_type: c.resource_type.clone(),
            key: c.key.clone(),
            hits: c.hits,
            last_accessed: c.last_accessed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmResult {
    pub warmed: usize,
    pub total: usize,
    pub duration_ms: u64,
}

pub struct CacheWarmer {
    store: Arc<dyn CacheStore>,
    candidates: Mutex<HashMap<String, WarmCandidate>>,
    max_items: usize,
    min_hits: u64,
}

impl CacheWarmer {
    pub fn new(store: Arc<dyn CacheStore>, max_items: usize, min_hits: u64) -> Self {
        Self {
            store,
            candidates: Mutex::new(HashMap::new()),
            max_items,
            min_hits,
        }
    }

    /// Counts one access to `key`, replacing its fetch function with `fetch`.
    pub fn track_access(&self, resource_type: &str, key: &str, fetch: FetchFn) {
        let now = Utc::now();
        let mut candidates = self.candidates.lock();
        candidates
            .entry(format!("{resource_type}:{key}"))
            .and_modify(|c| {
                c.hits += 1;
                c.last_accessed = now;
                c.fetch = Arc::clone(&fetch);
            })
            .or_insert_with(|| WarmCandidate {
                resource_type: resource_type.to_owned(),
                key: key.to_owned(),
                fetch: Arc::clone(&fetch),
                hits: 1,
                last_accessed: now,
            });
    }

    /// Most-hit candidates with at least `min_hits`, busiest first.
    pub fn top_resources(&self, limit: usize, min_hits: u64) -> Vec<WarmCandidateSummary> {
        self.select(limit, min_hits)
            .iter()
            .map(WarmCandidateSummary::from)
            .collect()
    }

    pub fn reset_tracker(&self) {
        self.candidates.lock().clear();
    }

    pub fn tracked(&self) -> usize {
        self.candidates.lock().len()
    }

    /// Re-fetches the top candidates and writes them to the store.
    ///
    /// Fetches run concurrently. A failing or empty fetch only affects its own
    /// candidate.
    pub async fn warm_cache(&self) -> WarmResult {
        let started = Instant::now();
        // Cloned out so the lock is released before any fetch runs.
        let selected = self.select(self.max_items, self.min_hits);
        let total = selected.len();

        let outcomes = join_all(selected.into_iter().map(|candidate| async move {
            let key = candidate.key.clone();
            match self.warm_one(candidate).await {
                Ok(warmed) => warmed,
                Err(e) => {
                    warn!(key = %key, error = %e, "cache warming failed");
                    false
                }
            }
        }))
        .await;

        let warmed = outcomes.into_iter().filter(|ok| *ok).count();
        let result = WarmResult {
            warmed,
            total,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(warmed, total, duration_ms = result.duration_ms, "cache warm cycle finished");
        result
    }

    async fn warm_one(&self, candidate: WarmCandidate) -> CacheResult<bool> {
        let value = (candidate.fetch)().await?;
        let Some(value) = value else {
            debug!(key = %candidate.key, "fetch returned nothing to warm");
            return Ok(false);
        };
        self.store
            .set(&candidate.key, value, WARM_TTL)
            .await
            .map_err(CacheError::from)?;
        Ok(true)
    }

    fn select(&self, limit: usize, min_hits: u64) -> Vec<WarmCandidate> {
        let mut selected: Vec<WarmCandidate> = self
            .candidates
            .lock()
            .values()
            .filter(|c| c.hits >= min_hits)
            .cloned()
            .collect();
        selected.sort_by(|a, b| {
            b.hits
                .cmp(&a.hits)
                .then_with(|| b.last_accessed.cmp(&a.last_accessed))
        });
        selected.truncate(limit);
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryStore;

    fn constant(value: &'static str) -> FetchFn {
        fetch_fn(move || async move { Ok(Some(value.to_string())) })
    }

    #[test]
    fn tracking_counts_hits_per_key() {
        let warmer = CacheWarmer::new(Arc::new(MemoryStore::new()), 10, 1);
        for _ in 0..3 {
            warmer.track_access("widgets", "cache:a", constant("a"));
        }
        warmer.track_access("widgets", "cache:b", constant("b"));

        let top = warmer.top_resources(10, 1);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key, "cache:a");
        assert_eq!(top[0].hits, 3);
        assert_eq!(warmer.top_resources(10, 2).len(), 1);
        assert_eq!(warmer.top_resources(1, 0).len(), 1);

        warmer.reset_tracker();
        assert_eq!(warmer.tracked(), 0);
    }

    #[tokio::test]
    async fn one_failing_fetch_does_not_stop_the_cycle() {
        let store = Arc::new(MemoryStore::new());
        let warmer = CacheWarmer::new(store.clone(), 10, 1);
        warmer.track_access("widgets", "cache:ok", constant(r#"{"status":200}"#));
        warmer.track_access(
            "widgets",
            "cache:broken",
            fetch_fn(|| async {
                Err(CacheError::Fetch {
                    key: "cache:broken".into(),
                    reason: "upstream timeout".into(),
                })
            }),
        );

        let result = warmer.warm_cache().await;
        assert_eq!(result.warmed, 1);
        assert_eq!(result.total, 2);
        assert!(store.get("cache:ok").await.unwrap().is_some());
        assert!(store.get("cache:broken").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn selection_respects_limits() {
        let store = Arc::new(MemoryStore::new());
        let warmer = CacheWarmer::new(store.clone(), 1, 2);
        warmer.track_access("widgets", "cache:cold", constant("cold"));
        for _ in 0..2 {
            warmer.track_access("widgets", "cache:warm", constant("warm"));
        }
        for _ in 0..5 {
            warmer.track_access("widgets", "cache:hot", constant("hot"));
        }

        let result = warmer.warm_cache().await;
        assert_eq!(result.total, 1);
        assert_eq!(store.get("cache:hot").await.unwrap().as_deref(), Some("hot"));
        assert!(store.get("cache:warm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_fetch_is_not_warmed() {
        let store = Arc::new(MemoryStore::new());
        let warmer = CacheWarmer::new(store.clone(), 10, 1);
        warmer.track_access("widgets", "cache:gone", fetch_fn(|| async { Ok(None) }));
        let result = warmer.warm_cache().await;
        assert_eq!((result.warmed, result.total), (0, 1));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_run_concurrently() {
        let store = Arc::new(MemoryStore::new());
        let warmer = CacheWarmer::new(store.clone(), 10, 1);
        for key in ["cache:1", "cache:2", "cache:3"] {
            warmer.track_access(
                "widgets",
                key,
                fetch_fn(|| async {
                    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                    Ok(Some("v".to_string()))
                }),
            );
        }

        let started = tokio::time::Instant::now();
        let result = warmer.warm_cache().await;
        assert_eq!(result.warmed, 3);
        assert!(started.elapsed() < std::time::Duration::from_secs(20));
    }
}
