use thiserror::Error;

/// Errors raised by a [`CacheStore`](super::CacheStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key pattern: {pattern}")]
    InvalidPattern { pattern: String },
}

/// Errors surfaced by the caching engine's fallible internals.
///
/// None of these reach the business request: the middleware and
/// [`TtlPolicy::compute_ttl`](super::TtlPolicy::compute_ttl) log them and
/// fall back.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("malformed cached value: {0}")]
    Json(#[from] serde_json::Error),

    #[error("fetch for {key} failed: {reason}")]
    Fetch { key: String, reason: String },
}

pub type CacheResult<T> = Result<T, CacheError>;
