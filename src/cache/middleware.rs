//! The response caching middleware.
//!
//! Per request:
//!
//! ```text
//! START → BYPASS_CHECK ─┬─ bypass ─→ PASSTHROUGH
//!                       └─ KEY_LOOKUP ─┬─ hit ──→ SERVE_CACHED
//!                                      └─ miss ─→ INVOKE_HANDLER → CAPTURE_RESPONSE
//!                                                 → COMPUTE_TTL → STORE
//! ```
//!
//! Nothing here can fail the request: store and TTL problems are logged and
//! the downstream response is returned as-is.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::CacheEngine;
use super::config::{CacheConfig, is_truthy};
use super::error::CacheResult;
use super::fingerprint::{RequestDescriptor, generate_key};
use super::warmer::{FetchFn, fetch_fn};
use crate::context::Context;
use crate::http::{Request, Response, StatusCode};
use crate::middleware::{Middleware, Next};

pub const CACHE_STATUS_HEADER: &str = "X-Cache";
pub const CACHE_TTL_HEADER: &str = "X-Cache-TTL";

/// Resource type used when a path has no segments to derive one from.
pub const DEFAULT_RESOURCE_TYPE: &str = "default";
/// Resource key used for a bare collection path such as `/widgets`.
pub const COLLECTION_KEY: &str = "collection";

/// A captured response as stored in the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

impl CacheEntry {
    /// Captures a response. Bodies that are not UTF-8 are not cacheable.
    pub fn capture(response: &Response) -> Option<Self> {
        let body = std::str::from_utf8(response.body_slice()).ok()?;
        Some(Self {
            status: response.status().as_u16(),
            body: body.to_owned(),
            content_type: response.headers().get("content-type").map(str::to_owned),
        })
    }

    /// Rebuilds the response, or `None` for a status this server cannot emit.
    pub fn to_response(&self) -> Option<Response> {
        let status = StatusCode::from_u16(self.status)?;
        let mut response = Response::new(status).body(self.body.clone());
        if let Some(content_type) = &self.content_type {
            response.add_header("Content-Type", content_type.clone());
        }
        Some(response)
    }

    pub fn to_json(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// The `(resource_type, resource_key)` pair metrics and access counts group by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceId {
    pub resource_type: String,
    pub resource_key: String,
}

impl ResourceId {
    /// Derives the pair from `path` below the mount `prefix`: the first segment
    /// is the type, the rest is the key. `/api/widgets/42` under `/api` gives
    /// `("widgets", "42")`.
    pub fn from_path(path: &str, prefix: &str) -> Self {
        let rest = path.strip_prefix(prefix).unwrap_or(path);
        let mut segments = rest.split('/').filter(|s| !s.is_empty());

        match segments.next() {
            Some(resource_type) => {
                let key = segments.collect::<Vec<_>>().join("/");
                Self {
                    resource_type: resource_type.to_owned(),
                    resource_key: if key.is_empty() {
                        COLLECTION_KEY.to_owned()
                    } else {
                        key
                    },
                }
            }
            None => Self {
                resource_type: DEFAULT_RESOURCE_TYPE.to_owned(),
                resource_key: if path.is_empty() { "/".to_owned() } else { path.to_owned() },
            },
        }
    }
}

fn bypass_requested(config: &CacheConfig, request: &Request) -> bool {
    request
        .headers()
        .get(&config.bypass_header)
        .is_some_and(is_truthy)
        || request
            .query_param(&config.bypass_query_param)
            .is_some_and(is_truthy)
}

/// Middleware serving and storing responses through a [`CacheEngine`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_cache::Router;
/// use rttp_cache::cache::{CacheConfig, CacheEngine, CachingMiddleware, MemoryStore};
/// use rttp_cache::middleware::Pipeline;
///
/// let config = CacheConfig::from_env().route_prefix("/api");
/// let engine = Arc::new(CacheEngine::new(config, Arc::new(MemoryStore::new())));
/// let pipeline = Pipeline::new(Router::new()).layer(CachingMiddleware::new(engine));
/// ```
pub struct CachingMiddleware {
    engine: Arc<CacheEngine>,
}

impl CachingMiddleware {
    pub fn new(engine: Arc<CacheEngine>) -> Self {
        Self { engine }
    }
}

impl Middleware for CachingMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let engine = Arc::clone(&self.engine);
        Box::pin(async move { serve(engine, ctx, next).await })
    }
}

async fn serve(engine: Arc<CacheEngine>, ctx: Context, next: Next) -> Response {
    let config = engine.config();
    let request = ctx.request();

    if engine.is_excluded_path(request.path()) {
        return next.run(ctx).await;
    }
    let prefix = match config.matching_prefix(request.path()) {
        Some(prefix) if config.is_cacheable_method(request.method()) => prefix,
        _ => return next.run(ctx).await,
    };

    if bypass_requested(config, request) {
        debug!(path = %request.path(), "cache bypass requested");
        let mut response = next.run(ctx).await;
        response.set_header(CACHE_STATUS_HEADER, "BYPASS");
        return response;
    }

    let resource = ResourceId::from_path(request.path(), prefix);
    let descriptor =
        RequestDescriptor::from_context(&ctx, &[config.bypass_query_param.as_str()]);
    let namespace = format!("{}:{}", config.key_prefix, resource.resource_type);
    let key = generate_key(&descriptor, &namespace);

    let started = Instant::now();
    if let Some(entry) = lookup(&engine, &key).await {
        if let Some(mut response) = entry.to_response() {
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            engine.metrics().record_hit(
                Some(&resource.resource_type),
                &resource.resource_key,
                latency_ms,
                entry.body.len() as u64,
            );
            debug!(key = %key, "cache hit");
            response.set_header(CACHE_STATUS_HEADER, "HIT");
            return response;
        }
        warn!(
            key = %key,
            status = entry.status,
            "cached entry has an unknown status, refetching"
        );
    }

    let replay = engine
        .config()
        .warming
        .then(|| (next.clone(), ctx.clone()));
    let mut response = next.run(ctx).await;

    // Errors are neither stored nor counted.
    if !response.status().is_success() {
        return response;
    }
    let Some(entry) = CacheEntry::capture(&response) else {
        debug!(key = %key, "response body is not UTF-8, not caching");
        return response;
    };

    engine
        .metrics()
        .record_miss(Some(&resource.resource_type), &resource.resource_key);
    let ttl = engine.ttl_for(&resource).await;
    store(&engine, &key, &entry, ttl).await;

    if let Err(e) = engine
        .access()
        .track_access(&resource.resource_type, &resource.resource_key)
        .await
    {
        warn!(key = %key, error = %e, "failed to record access");
    }
    if let Some((next, ctx)) = replay {
        engine
            .warmer()
            .track_access(&resource.resource_type, &key, replay_fetch(next, ctx));
    }

    debug!(key = %key, ttl, "cache miss stored");
    response.set_header(CACHE_STATUS_HEADER, "MISS");
    response.set_header(CACHE_TTL_HEADER, ttl.to_string());
    response
}

async fn lookup(engine: &CacheEngine, key: &str) -> Option<CacheEntry> {
    match engine.store().get(key).await {
        Ok(Some(json)) => match serde_json::from_str(&json) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(key = %key, error = %e, "discarding malformed cache entry");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(key = %key, error = %e, "cache read failed, treating as miss");
            None
        }
    }
}

async fn store(engine: &CacheEngine, key: &str, entry: &CacheEntry, ttl: u64) {
    let json = match entry.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(key = %key, error = %e, "failed to encode cache entry");
            return;
        }
    };
    if let Err(e) = engine.store().set(key, json, ttl).await {
        warn!(key = %key, error = %e, "cache write failed");
    }
}

/// A fetch function that replays the request through the downstream chain.
fn replay_fetch(next: Next, ctx: Context) -> FetchFn {
    fetch_fn(move || {
        let next = next.clone();
        let ctx = ctx.clone();
        async move {
            let response = next.run(ctx).await;
            if !response.status().is_success() {
                return Ok(None);
            }
            CacheEntry::capture(&response)
                .map(|entry| entry.to_json())
                .transpose()
        }
    })
}
