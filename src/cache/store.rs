//! Backing key-value store interface and the bundled in-memory implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use glob::Pattern;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::error::StoreError;

/// A key-value store with per-entry expiry, such as Redis.
///
/// Values are opaque JSON text. `keys` takes a glob pattern where `*` matches
/// any run of characters, `?` matches exactly one, and `[...]` matches one
/// character from a class.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StoreError>;

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes the given keys and returns how many existed.
    async fn del(&self, keys: &[String]) -> Result<usize, StoreError>;
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// In-process [`CacheStore`] backed by a `HashMap`.
///
/// Expired entries are dropped lazily on access and on `keys` scans. Expiry
/// follows the Tokio clock, so paused-time tests can advance it.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), StoreError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .insert(key.to_string(), StoredValue { value, expires_at });
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let invalid = || StoreError::InvalidPattern {
            pattern: pattern.to_owned(),
        };
        if pattern.is_empty() {
            return Err(invalid());
        }
        let matcher = Pattern::new(pattern).map_err(|_| invalid())?;

        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, v| v.expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let removed = keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .filter(|v| v.expires_at > now)
            .count();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(keys: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        for key in keys {
            store.set(key, "v".into(), 60).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn glob_patterns() {
        let store = store_with(&[
            "access:widgets:42",
            "access:gadgets:articles/7",
            "cache:a",
            "cache:ab",
        ])
        .await;

        assert_eq!(store.keys("access:*").await.unwrap().len(), 2);
        assert_eq!(
            store.keys("access:widgets:*").await.unwrap(),
            vec!["access:widgets:42"]
        );
        assert_eq!(
            store.keys("access:*:articles*").await.unwrap(),
            vec!["access:gadgets:articles/7"]
        );
        assert_eq!(store.keys("cache:?").await.unwrap(), vec!["cache:a"]);
        assert!(store.keys("nothing:*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_get_del() {
        let store = MemoryStore::new();
        store.set("cache:a", "1".into(), 60).await.unwrap();
        store.set("cache:b", "2".into(), 60).await.unwrap();
        store.set("other", "3".into(), 60).await.unwrap();

        assert_eq!(store.get("cache:a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys("cache:*").await.unwrap(), vec!["cache:a", "cache:b"]);

        let removed = store
            .del(&["cache:a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.get("cache:a").await.unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn character_classes_match_and_malformed_patterns_are_rejected() {
        let store = store_with(&["cache:a", "cache:b", "cache:c"]).await;
        assert_eq!(store.keys("cache:[ab]").await.unwrap(), vec!["cache:a", "cache:b"]);
        assert_eq!(store.keys("cache:[!ab]").await.unwrap(), vec!["cache:c"]);

        let err = store.keys("cache:[").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidPattern { pattern } if pattern == "cache:["));
        assert!(store.keys("").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = MemoryStore::new();
        store.set("k", "v".into(), 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.keys("*").await.unwrap().is_empty());
    }
}
