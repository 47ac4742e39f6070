//! Middleware pipeline: composable before/after request handler logic.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`Pipeline`]: an ordered middleware stack terminated by a [`Router`].

use std::{future::Future, pin::Pin, sync::Arc};

use crate::{Request, Response, StatusCode, context::Context, router::Router};

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use rttp_cache::cache::{CacheConfig, CacheEngine, CachingMiddleware, MemoryStore};
/// use rttp_cache::middleware::from_middleware;
///
/// let engine = Arc::new(CacheEngine::new(CacheConfig::default(), Arc::new(MemoryStore::new())));
/// let handler = from_middleware(Arc::new(CachingMiddleware::new(engine)));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed on each call to [`run`](Self::run). It is `Clone` so a
/// middleware can keep a copy of the downstream chain and replay a request
/// through it later (the cache warmer does this to refresh entries).
#[derive(Clone)]
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares: middlewares.into(),
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// If no handler remains, a `500 Internal Server Error` response is
    /// returned as a safe fallback.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// Implementations **should not** hold locks on shared state across an
/// `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack whose last layer dispatches through a [`Router`].
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_cache::context::Context;
/// use rttp_cache::{Method, Request, Response, Router, StatusCode};
/// use rttp_cache::middleware::Pipeline;
///
/// # async fn demo() {
/// let mut router = Router::new();
/// router.get("/ping", |_ctx: Context| async { Response::new(StatusCode::Ok) });
///
/// let pipeline = Pipeline::new(router);
/// let response = pipeline.handle(Request::new(Method::Get, "/ping")).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
pub struct Pipeline {
    layers: Vec<MiddlewareHandler>,
    router: Arc<Router>,
}

impl Pipeline {
    pub fn new(router: Router) -> Self {
        Self {
            layers: Vec::new(),
            router: Arc::new(router),
        }
    }

    /// Appends a middleware. Layers run in the order they are added.
    #[must_use]
    pub fn layer<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.layers.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Runs `request` through every layer and finally the router.
    pub async fn handle(&self, request: Request) -> Response {
        self.handle_context(Context::new(request)).await
    }

    /// Like [`handle`](Self::handle) for a pre-built context.
    pub async fn handle_context(&self, ctx: Context) -> Response {
        let router = Arc::clone(&self.router);
        let terminal: MiddlewareHandler = Arc::new(move |ctx: Context, _next: Next| {
            let router = Arc::clone(&router);
            Box::pin(async move { router.dispatch(ctx).await })
        });

        let mut chain = self.layers.clone();
        chain.push(terminal);
        Next::new(chain).run(ctx).await
    }
}
