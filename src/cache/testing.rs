//! Test doubles shared by the cache module's unit tests.

use async_trait::async_trait;

use super::error::StoreError;
use super::store::CacheStore;

/// A store whose every operation fails, standing in for an unreachable backend.
pub(crate) struct FailingStore;

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: String, _ttl_secs: u64) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn keys(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn del(&self, _keys: &[String]) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
