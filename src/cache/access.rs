//! Store-persisted access counters with daily decay.
//!
//! Each `(resource_type, resource_key)` pair owns one [`AccessRecord`] under
//! `access:{type}:{key}`. Every write refreshes a seven-day expiry, so a record
//! nobody touches disappears from the store on its own even if decay never runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{CacheError, CacheResult};
use super::store::CacheStore;

pub const ACCESS_KEY_PREFIX: &str = "access";
/// Multiplier applied per whole day of inactivity.
pub const DECAY_FACTOR: f64 = 0.75;

const SECS_PER_DAY: i64 = 24 * 60 * 60;
const RETENTION_DAYS: i64 = 7;
const RECORD_TTL: u64 = (RETENTION_DAYS * SECS_PER_DAY) as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub count: u64,
    pub last_access: DateTime<Utc>,
}

/// Outcome of one [`AccessTracker::decay`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecayReport {
    pub scanned: usize,
    pub decayed: usize,
    pub removed: usize,
}

// Glob metacharacters would turn a resource name into a pattern.
fn sanitize(part: &str) -> String {
    part.replace(['*', '?', '[', ']'], "_")
}

fn record_key(resource_type: &str, resource_key: &str) -> String {
    format!(
        "{ACCESS_KEY_PREFIX}:{}:{}",
        sanitize(resource_type),
        sanitize(resource_key)
    )
}

/// Applies the decay rule to one record. `None` means the record expired.
fn decayed(record: AccessRecord, now: DateTime<Utc>) -> Option<AccessRecord> {
    let elapsed = now - record.last_access;
    if elapsed > chrono::Duration::days(RETENTION_DAYS) {
        return None;
    }
    if elapsed <= chrono::Duration::days(1) {
        return Some(record);
    }

    let days = i32::try_from(elapsed.num_days()).unwrap_or(i32::MAX);
    let scaled = (record.count as f64 * DECAY_FACTOR.powi(days)).floor() as u64;
    Some(AccessRecord {
        count: scaled.max(1).min(record.count),
        ..record
    })
}

pub struct AccessTracker {
    store: Arc<dyn CacheStore>,
}

impl AccessTracker {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Increments the counter for a resource and refreshes its expiry.
    /// Returns the new count.
    pub async fn track_access(&self, resource_type: &str, resource_key: &str) -> CacheResult<u64> {
        self.track_access_at(resource_type, resource_key, Utc::now()).await
    }

    pub async fn track_access_at(
        &self,
        resource_type: &str,
        resource_key: &str,
        now: DateTime<Utc>,
    ) -> CacheResult<u64> {
        let key = record_key(resource_type, resource_key);
        let count = match self.load(&key).await {
            Ok(Some(record)) => record.count + 1,
            Ok(None) => 1,
            Err(CacheError::Json(e)) => {
                warn!(key = %key, error = %e, "discarding unreadable access record");
                1
            }
            Err(e) => return Err(e),
        };

        let record = AccessRecord {
            count,
            last_access: now,
        };
        self.store
            .set(&key, serde_json::to_string(&record)?, RECORD_TTL)
            .await?;
        Ok(count)
    }

    pub async fn record(
        &self,
        resource_type: &str,
        resource_key: &str,
    ) -> CacheResult<Option<AccessRecord>> {
        self.load(&record_key(resource_type, resource_key)).await
    }

    pub async fn access_count(
        &self,
        resource_type: &str,
        resource_key: &str,
    ) -> CacheResult<Option<u64>> {
        Ok(self
            .record(resource_type, resource_key)
            .await?
            .map(|r| r.count))
    }

    /// Highest count among all keys of `resource_type`, 0 when none are tracked.
    pub async fn max_access_count(&self, resource_type: &str) -> CacheResult<u64> {
        let pattern = format!("{ACCESS_KEY_PREFIX}:{}:*", sanitize(resource_type));
        let mut max = 0;
        for key in self.store.keys(&pattern).await? {
            if let Some(record) = self.load(&key).await? {
                max = max.max(record.count);
            }
        }
        Ok(max)
    }

    /// Decays every record; intended to run once a day.
    pub async fn decay(&self) -> CacheResult<DecayReport> {
        self.decay_at(Utc::now()).await
    }

    pub async fn decay_at(&self, now: DateTime<Utc>) -> CacheResult<DecayReport> {
        let pattern = format!("{ACCESS_KEY_PREFIX}:*");
        let keys = self.store.keys(&pattern).await?;
        let mut report = DecayReport {
            scanned: keys.len(),
            ..DecayReport::default()
        };
        let mut expired = Vec::new();

        for key in keys {
            let record = match self.load(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key, error = %e, "removing unreadable access record");
                    expired.push(key);
                    continue;
                }
            };

            match decayed(record, now) {
                None => expired.push(key),
                Some(next) if next != record => {
                    let remaining =
                        chrono::Duration::days(RETENTION_DAYS) - (now - record.last_access);
                    let ttl = remaining.num_seconds().max(1) as u64;
                    self.store
                        .set(&key, serde_json::to_string(&next)?, ttl)
                        .await?;
                    report.decayed += 1;
                }
                Some(_) => {}
            }
        }

        if !expired.is_empty() {
            report.removed = self.store.del(&expired).await?;
        }
        debug!(
            scanned = report.scanned,
            decayed = report.decayed,
            removed = report.removed,
            "access counters decayed"
        );
        Ok(report)
    }

    async fn load(&self, key: &str) -> CacheResult<Option<AccessRecord>> {
        match self.store.get(key).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
