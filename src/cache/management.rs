//! HTTP management surface for a [`CacheEngine`].
//!
//! [`mount`] registers these routes below a base path:
//!
//! | Method | Path                | Privileged | Requires    |
//! |--------|---------------------|------------|-------------|
//! | GET    | `/metrics`          |            | monitoring  |
//! | GET    | `/metrics/history`  |            | monitoring  |
//! | POST   | `/metrics/reset`    | yes        | monitoring  |
//! | POST   | `/warm`             | yes        | warming     |
//! | GET    | `/warm/top`         |            | warming     |
//! | GET    | `/ttl/weights`      |            |             |
//! | POST   | `/ttl/tune`         | yes        |             |
//! | POST   | `/ttl/reset`        | yes        |             |
//! | POST   | `/invalidate`       | yes        |             |
//!
//! Privileged routes need an admin [`Principal`](crate::context::Principal)
//! on the context, attached by whatever authentication middleware runs first.
//! Every route is excluded from caching on the engine, so they can share a
//! router with [`CachingMiddleware`](super::CachingMiddleware).

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use super::CacheEngine;
use super::error::{CacheError, StoreError};
use super::ttl::ComparisonReport;
use crate::context::Context;
use crate::http::{Response, StatusCode};
use crate::router::{IntoHandler, Router};

const DEFAULT_HISTORY_LIMIT: usize = 10;
const DEFAULT_TOP_LIMIT: usize = 10;

#[derive(Debug, Error)]
enum ManagementError {
    #[error("admin privileges required")]
    Forbidden,

    #[error("cache monitoring is disabled")]
    MonitoringDisabled,

    #[error("cache warming is disabled")]
    WarmingDisabled,

    #[error("missing query parameter `{0}`")]
    MissingParameter(&'static str),

    #[error("invalid value `{value}` for `{name}`")]
    InvalidParameter { name: &'static str, value: String },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl ManagementError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Forbidden => StatusCode::Forbidden,
            Self::MonitoringDisabled => StatusCode::NotFound,
            Self::Cache(CacheError::Store(StoreError::InvalidPattern { .. })) => {
                StatusCode::BadRequest
            }
            Self::WarmingDisabled | Self::Cache(_) => StatusCode::ServiceUnavailable,
            Self::MissingParameter(_) | Self::InvalidParameter { .. } => StatusCode::BadRequest,
        }
    }

    fn into_response(self) -> Response {
        Response::json(self.status(), &json!({ "error": self.to_string() }))
    }
}

type ManagementResult = Result<Response, ManagementError>;

/// Registers the management routes under `base` (e.g. `"/cache"`) and
/// excludes them from caching.
pub fn mount(router: &mut Router, base: &str, engine: Arc<CacheEngine>) {
    let base = base.trim_end_matches('/');
    let path = |suffix: &str| {
        let path = format!("{base}{suffix}");
        engine.exclude_path_prefix(&path);
        path
    };

    router.get(&path("/metrics"), handler(&engine, metrics));
    router.get(&path("/metrics/history"), handler(&engine, history));
    router.post(&path("/metrics/reset"), handler(&engine, reset_metrics));
    router.post(&path("/warm"), handler(&engine, warm));
    router.get(&path("/warm/top"), handler(&engine, top_resources));
    router.get(&path("/ttl/weights"), handler(&engine, weights));
    router.post(&path("/ttl/tune"), handler(&engine, tune));
    router.post(&path("/ttl/reset"), handler(&engine, reset_weights));
    router.post(&path("/invalidate"), handler(&engine, invalidate));
}

fn handler<F, Fut>(engine: &Arc<CacheEngine>, f: F) -> impl IntoHandler
where
    F: Fn(Arc<CacheEngine>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ManagementResult> + Send + 'static,
{
    let engine = Arc::clone(engine);
    move |ctx: Context| {
        let fut = f(Arc::clone(&engine), ctx);
        async move { fut.await.unwrap_or_else(ManagementError::into_response) }
    }
}

fn ok<T: Serialize>(value: &T) -> ManagementResult {
    Ok(Response::json(StatusCode::Ok, value))
}

fn require_admin(ctx: &Context) -> Result<(), ManagementError> {
    match ctx.principal() {
        Some(principal) if principal.is_admin() => Ok(()),
        _ => Err(ManagementError::Forbidden),
    }
}

fn require_monitoring(engine: &CacheEngine) -> Result<(), ManagementError> {
    if engine.config().monitoring {
        Ok(())
    } else {
        Err(ManagementError::MonitoringDisabled)
    }
}

fn require_warming(engine: &CacheEngine) -> Result<(), ManagementError> {
    if engine.config().warming {
        Ok(())
    } else {
        Err(ManagementError::WarmingDisabled)
    }
}

fn query<T: FromStr>(ctx: &Context, name: &'static str, default: T) -> Result<T, ManagementError> {
    match ctx.request().query_param(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| ManagementError::InvalidParameter {
                name,
                value: value.to_owned(),
            }),
    }
}

async fn metrics(engine: Arc<CacheEngine>, _ctx: Context) -> ManagementResult {
    require_monitoring(&engine)?;
    ok(&engine.metrics().metrics())
}

async fn history(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_monitoring(&engine)?;
    let limit = query(&ctx, "limit", DEFAULT_HISTORY_LIMIT)?;
    ok(&engine.metrics().history(limit))
}

async fn reset_metrics(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_admin(&ctx)?;
    require_monitoring(&engine)?;
    engine.metrics().reset_metrics();
    info!("cache metrics reset");
    ok(&json!({ "reset": true }))
}

async fn warm(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_admin(&ctx)?;
    require_warming(&engine)?;
    ok(&engine.warmer().warm_cache().await)
}

async fn top_resources(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_warming(&engine)?;
    let limit = query(&ctx, "limit", DEFAULT_TOP_LIMIT)?;
    let min_hits = query(&ctx, "min_hits", engine.config().warm_min_hits)?;
    ok(&engine.warmer().top_resources(limit, min_hits))
}

async fn weights(engine: Arc<CacheEngine>, _ctx: Context) -> ManagementResult {
    ok(&json!({
        "enabled": engine.ttl().is_enabled(),
        "weights": engine.ttl().weights(),
    }))
}

async fn tune(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_admin(&ctx)?;
    let current = engine.metrics().metrics();
    let baseline = engine.metrics().baseline();
    let comparison = ComparisonReport::from_snapshots(baseline.as_ref(), &current);
    let report = engine.ttl().auto_tune_weights(&current, &comparison);
    ok(&json!({ "comparison": comparison, "tune": report }))
}

async fn reset_weights(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_admin(&ctx)?;
    ok(&json!({ "weights": engine.ttl().reset_weights() }))
}

async fn invalidate(engine: Arc<CacheEngine>, ctx: Context) -> ManagementResult {
    require_admin(&ctx)?;
    let request = ctx.request();
    let removed = match (
        request.query_param("pattern"),
        request.query_param("resource_type"),
    ) {
        (Some(pattern), _) if !pattern.is_empty() => engine.invalidate(pattern).await?,
        (_, Some(resource_type)) if !resource_type.is_empty() => {
            engine.invalidate_resource_type(resource_type).await?
        }
        _ => return Err(ManagementError::MissingParameter("pattern")),
    };
    ok(&json!({ "removed": removed }))
}
