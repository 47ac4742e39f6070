//! Adaptive response caching.
//!
//! [`CacheEngine`] owns the shared state: a pluggable [`CacheStore`], hit/miss
//! metrics, per-resource access counters, the adaptive TTL policy, and the
//! cache warmer. [`CachingMiddleware`] serves and stores responses through
//! it, [`management::mount`] exposes it over HTTP, and
//! [`CacheEngine::start_background_jobs`] drives its periodic maintenance.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::Router;
//! use rttp_cache::cache::{CacheConfig, CacheEngine, CachingMiddleware, MemoryStore, management};
//! use rttp_cache::middleware::Pipeline;
//!
//! # async fn demo() {
//! let engine = Arc::new(CacheEngine::new(CacheConfig::from_env(), Arc::new(MemoryStore::new())));
//! let _jobs = engine.start_background_jobs();
//!
//! let mut router = Router::new();
//! management::mount(&mut router, "/cache", Arc::clone(&engine));
//! let pipeline = Pipeline::new(router).layer(CachingMiddleware::new(engine));
//! # }
//! ```

pub mod access;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod management;
pub mod metrics;
pub mod middleware;
pub mod store;
pub mod ttl;
pub mod warmer;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

pub use access::AccessTracker;
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult, StoreError};
pub use metrics::{MetricsRecorder, MetricsSnapshot};
pub use middleware::{CacheEntry, CachingMiddleware, ResourceId};
pub use store::{CacheStore, MemoryStore};
pub use ttl::{SharedWeights, TtlPolicy, TtlWeights};
pub use warmer::{CacheWarmer, WarmResult};

use crate::background::Scheduler;

/// Shared state behind the caching middleware and its management routes.
pub struct CacheEngine {
    config: CacheConfig,
    store: Arc<dyn CacheStore>,
    metrics: Arc<MetricsRecorder>,
    access: Arc<AccessTracker>,
    ttl: Arc<TtlPolicy>,
    warmer: Arc<CacheWarmer>,
    /// Path prefixes the middleware never caches, e.g. management routes.
    excluded_prefixes: RwLock<Vec<String>>,
}

impl CacheEngine {
    /// Builds an engine with the default TTL weights.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self::with_weights(config, store, SharedWeights::default())
    }

    /// Builds an engine whose TTL policy reads `weights`. Clones of `weights`
    /// held elsewhere observe every tune and reset.
    pub fn with_weights(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        weights: SharedWeights,
    ) -> Self {
        let metrics = Arc::new(MetricsRecorder::new(
            Arc::clone(&store),
            config.history_retention(),
            config.history_max_entries,
        ));
        let access = Arc::new(AccessTracker::new(Arc::clone(&store)));
        let ttl = Arc::new(TtlPolicy::new(
            Arc::clone(&store),
            Arc::clone(&access),
            weights,
            config.adaptive_ttl,
        ));
        let warmer = Arc::new(CacheWarmer::new(
            Arc::clone(&store),
            config.warm_max_items,
            config.warm_min_hits,
        ));

        Self {
            config,
            store,
            metrics,
            access,
            ttl,
            warmer,
            excluded_prefixes: RwLock::new(Vec::new()),
        }
    }

    /// Stops the middleware from caching, counting or tagging any request
    /// under `prefix`. `"/"` excludes every path. [`management::mount`]
    /// registers its routes here.
    pub fn exclude_path_prefix(&self, prefix: &str) {
        let prefix = prefix.trim_end_matches('/');
        let prefix = if prefix.is_empty() { "/" } else { prefix };
        let mut excluded = self.excluded_prefixes.write();
        if !excluded.iter().any(|p| p == prefix) {
            debug!(prefix, "path prefix excluded from caching");
            excluded.push(prefix.to_owned());
        }
    }

    /// Whether `path` sits under a prefix passed to
    /// [`exclude_path_prefix`](Self::exclude_path_prefix).
    pub fn is_excluded_path(&self, path: &str) -> bool {
        self.excluded_prefixes.read().iter().any(|prefix| {
            prefix == "/"
                || path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn access(&self) -> &Arc<AccessTracker> {
        &self.access
    }

    pub fn ttl(&self) -> &Arc<TtlPolicy> {
        &self.ttl
    }

    pub fn warmer(&self) -> &Arc<CacheWarmer> {
        &self.warmer
    }

    /// TTL for a freshly stored response. Falls back to the configured
    /// default when adaptive TTL is off or cannot be computed.
    pub async fn ttl_for(&self, resource: &ResourceId) -> u64 {
        if !self.ttl.is_enabled() {
            return self.config.default_ttl_secs;
        }
        match self
            .ttl
            .try_compute_ttl(&resource.resource_type, &resource.resource_key)
            .await
        {
            Ok(ttl) => ttl,
            Err(e) => {
                error!(
                    resource_type = %resource.resource_type,
                    resource_key = %resource.resource_key,
                    error = %e,
                    "TTL computation failed, using default"
                );
                self.config.default_ttl_secs
            }
        }
    }

    /// Deletes every stored key matching the glob `pattern` and returns how
    /// many were removed. The persisted metrics blob is never deleted.
    pub async fn invalidate(&self, pattern: &str) -> CacheResult<usize> {
        let keys: Vec<String> = self
            .store
            .keys(pattern)
            .await?
            .into_iter()
            .filter(|key| key != metrics::METRICS_STORE_KEY)
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.del(&keys).await?;
        info!(pattern, removed, "cache entries invalidated");
        Ok(removed)
    }

    /// Deletes every cached response of one resource type.
    pub async fn invalidate_resource_type(&self, resource_type: &str) -> CacheResult<usize> {
        let resource_type = resource_type.replace(['*', '?', '[', ']'], "_");
        self.invalidate(&format!("{}:{resource_type}:*", self.config.key_prefix))
            .await
    }

    /// Spawns the periodic jobs the config enables and returns their
    /// scheduler. Dropping the scheduler stops the jobs.
    ///
    /// - decay of access counters, always;
    /// - metrics snapshots, when monitoring is on;
    /// - warm cycles, when warming is on;
    /// - weight auto-tuning, when adaptive TTL is on and an interval is set.
    pub fn start_background_jobs(self: &Arc<Self>) -> Scheduler {
        let mut scheduler = Scheduler::new();

        let engine = Arc::clone(self);
        scheduler.every("access-decay", self.config.decay_interval(), move || {
            let engine = Arc::clone(&engine);
            async move {
                if let Err(e) = engine.access.decay().await {
                    warn!(error = %e, "access decay failed");
                }
            }
        });

        if self.config.monitoring {
            let engine = Arc::clone(self);
            scheduler.every("metrics-snapshot", self.config.snapshot_interval(), move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.metrics.take_snapshot();
                }
            });
        }

        if self.config.warming {
            let engine = Arc::clone(self);
            scheduler.every("cache-warm", self.config.warm_interval(), move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.warmer.warm_cache().await;
                }
            });
        }

        if self.config.adaptive_ttl && self.config.auto_tune_interval_secs > 0 {
            let engine = Arc::clone(self);
            let period = std::time::Duration::from_secs(self.config.auto_tune_interval_secs);
            scheduler.every("ttl-auto-tune", period, move || {
                let engine = Arc::clone(&engine);
                async move {
                    engine.ttl.auto_tune(&engine.metrics);
                }
            });
        }

        info!(jobs = ?scheduler.names(), "cache background jobs started");
        scheduler
    }
}
