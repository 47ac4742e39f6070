//! A small widget API served through the caching middleware.
//!
//! ```text
//! CACHE_ADAPTIVE_TTL=true CACHE_WARMING=true RUST_LOG=rttp_cache=debug \
//!     cargo run --example widgets
//!
//! curl -i localhost:8080/api/widgets/42             # X-Cache: MISS
//! curl -i localhost:8080/api/widgets/42             # X-Cache: HIT
//! curl -i 'localhost:8080/api/widgets/42?nocache=1' # X-Cache: BYPASS
//! curl localhost:8080/cache/metrics
//! curl -X POST -H 'X-User: ops' -H 'X-Admin-Token: letmein' localhost:8080/cache/warm
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rttp_cache::cache::{CacheConfig, CacheEngine, CachingMiddleware, MemoryStore, management};
use rttp_cache::context::{Context, Principal};
use rttp_cache::middleware::{Middleware, Next, Pipeline};
use rttp_cache::{Response, Router, Server, StatusCode};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// Attaches a principal from `X-User`; `X-Admin-Token` matching the configured
/// token makes it an admin.
struct HeaderAuth {
    admin_token: String,
}

impl Middleware for HeaderAuth {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let headers = ctx.request().headers();
        let principal = headers.get("x-user").map(|user| {
            if headers.get("x-admin-token") == Some(self.admin_token.as_str()) {
                Principal::admin(user)
            } else {
                Principal::user(user)
            }
        });
        let ctx = match principal {
            Some(principal) => ctx.with_principal(principal),
            None => ctx,
        };
        Box::pin(next.run(ctx))
    }
}

fn widget_routes(router: &mut Router) {
    router.get("/api/widgets", |_ctx: Context| async {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Response::json(StatusCode::Ok, &json!([{"id": "1"}, {"id": "42"}]))
    });

    router.get("/api/widgets/:id", |ctx: Context| async move {
        let id = ctx.params().get("id").unwrap_or_default().to_owned();
        // Simulated slow backend.
        tokio::time::sleep(Duration::from_millis(50)).await;
        if id.parse::<u32>().is_err() {
            return Response::json(StatusCode::NotFound, &json!({"error": "no such widget"}));
        }
        Response::json(StatusCode::Ok, &json!({"id": id, "name": format!("widget #{id}")}))
    });

    router.post("/api/widgets/search", |ctx: Context| async move {
        let filters: serde_json::Value = ctx.json().unwrap_or(serde_json::Value::Null);
        tokio::time::sleep(Duration::from_millis(120)).await;
        Response::json(StatusCode::Ok, &json!({"filters": filters, "results": []}))
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rttp_cache=info")),
        )
        .init();

    let config = CacheConfig::from_env().route_prefix("/api");
    let engine = Arc::new(CacheEngine::new(config, Arc::new(MemoryStore::new())));
    let mut jobs = engine.start_background_jobs();

    let mut router = Router::new();
    widget_routes(&mut router);
    management::mount(&mut router, "/cache", Arc::clone(&engine));

    let admin_token = std::env::var("ADMIN_TOKEN").unwrap_or_else(|_| "letmein".to_string());
    let pipeline = Pipeline::new(router)
        .layer(HeaderAuth { admin_token })
        .layer(CachingMiddleware::new(engine));

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let server = Server::bind(&addr).await?;
    tracing::info!(address = %server.local_addr(), "widgets demo ready");

    server
        .serve(pipeline, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    jobs.shutdown();
    Ok(())
}
