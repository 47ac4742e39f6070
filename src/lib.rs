//! # rttp-cache
//!
//! Adaptive HTTP response caching on top of a small async HTTP/1.1 framework.
//!
//! Responses to cacheable requests are stored under a fingerprint of the
//! request. Hits and misses feed per-resource metrics, which together with
//! decaying access counters drive a TTL for each stored entry. Popular
//! entries can be re-fetched in the background before they expire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rttp_cache::{Response, Router, Server, StatusCode};
//! use rttp_cache::cache::{CacheConfig, CacheEngine, CachingMiddleware, MemoryStore};
//! use rttp_cache::context::Context;
//! use rttp_cache::middleware::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(MemoryStore::new());
//!     let engine = Arc::new(CacheEngine::new(CacheConfig::from_env(), store));
//!     let _jobs = engine.start_background_jobs();
//!
//!     let mut router = Router::new();
//!     router.get("/widgets/:id", |ctx: Context| async move {
//!         let id = ctx.params().get("id").unwrap_or_default().to_owned();
//!         Response::new(StatusCode::Ok).body(id)
//!     });
//!
//!     let pipeline = Pipeline::new(router).layer(CachingMiddleware::new(engine));
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.serve(pipeline, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod router;
pub mod server;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use router::Router;
pub use server::{Server, ServerError};
