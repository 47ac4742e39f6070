//! Engine configuration.
//!
//! [`CacheConfig`] deserializes from any serde format with every field
//! optional, offers builder-style setters, and overlays the three feature
//! toggles from the environment with [`CacheConfig::from_env`].

use std::time::Duration;

use serde::Deserialize;

use crate::Method;

/// Environment variable toggling adaptive TTL computation.
pub const ENV_ADAPTIVE_TTL: &str = "CACHE_ADAPTIVE_TTL";
/// Environment variable toggling monitoring (snapshots and metrics routes).
pub const ENV_MONITORING: &str = "CACHE_MONITORING";
/// Environment variable toggling background cache warming.
pub const ENV_WARMING: &str = "CACHE_WARMING";

/// Settings shared by every component of a [`CacheEngine`](super::CacheEngine).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Namespace prepended to every response cache key.
    pub key_prefix: String,
    /// Path prefixes the middleware is installed on. Empty means every path.
    pub route_prefixes: Vec<String>,
    /// Methods eligible for caching, upper-case.
    pub cacheable_methods: Vec<String>,
    pub bypass_header: String,
    pub bypass_query_param: String,
    /// TTL used when adaptive TTL is off or fails.
    pub default_ttl_secs: u64,
    pub adaptive_ttl: bool,
    pub monitoring: bool,
    pub warming: bool,
    pub warm_interval_secs: u64,
    pub warm_max_items: usize,
    pub warm_min_hits: u64,
    pub snapshot_interval_secs: u64,
    pub history_retention_secs: u64,
    pub history_max_entries: usize,
    pub decay_interval_secs: u64,
    /// Interval of the weight auto-tuning job; 0 disables it.
    pub auto_tune_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache".to_string(),
            route_prefixes: Vec::new(),
            cacheable_methods: vec!["GET".to_string(), "POST".to_string()],
            bypass_header: "x-cache-bypass".to_string(),
            bypass_query_param: "nocache".to_string(),
            default_ttl_secs: super::ttl::DEFAULT_TTL,
            adaptive_ttl: false,
            monitoring: true,
            warming: false,
            warm_interval_secs: 300,
            warm_max_items: 50,
            warm_min_hits: 5,
            snapshot_interval_secs: 300,
            history_retention_secs: 24 * 60 * 60,
            history_max_entries: 288,
            decay_interval_secs: 24 * 60 * 60,
            auto_tune_interval_secs: 0,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with the `CACHE_*` toggles from the process environment.
    pub fn from_env() -> Self {
        Self::default().with_env(|name| std::env::var(name).ok())
    }

    /// Overlays the feature toggles using `lookup` to read variables. Unset or
    /// unparseable values leave the current setting alone.
    #[must_use]
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_ADAPTIVE_TTL).and_then(|v| parse_flag(&v)) {
            self.adaptive_ttl = v;
        }
        if let Some(v) = lookup(ENV_MONITORING).and_then(|v| parse_flag(&v)) {
            self.monitoring = v;
        }
        if let Some(v) = lookup(ENV_WARMING).and_then(|v| parse_flag(&v)) {
            self.warming = v;
        }
        self
    }

    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_prefixes.push(prefix.into());
        self
    }

    #[must_use]
    pub fn default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl_secs = secs;
        self
    }

    #[must_use]
    pub fn adaptive_ttl(mut self, enabled: bool) -> Self {
        self.adaptive_ttl = enabled;
        self
    }

    #[must_use]
    pub fn monitoring(mut self, enabled: bool) -> Self {
        self.monitoring = enabled;
        self
    }

    #[must_use]
    pub fn warming(mut self, enabled: bool) -> Self {
        self.warming = enabled;
        self
    }

    #[must_use]
    pub fn warm_limits(mut self, max_items: usize, min_hits: u64) -> Self {
        self.warm_max_items = max_items;
        self.warm_min_hits = min_hits;
        self
    }

    pub fn is_cacheable_method(&self, method: &Method) -> bool {
        self.cacheable_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    /// Returns the configured route prefix `path` falls under, `Some("")`
    /// when no prefixes are configured, or `None` when the path is outside
    /// every prefix.
    pub fn matching_prefix<'a>(&'a self, path: &str) -> Option<&'a str> {
        if self.route_prefixes.is_empty() {
            return Some("");
        }
        self.route_prefixes
            .iter()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| {
                path.strip_prefix(p)
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|p| p.len())
    }

    pub fn warm_interval(&self) -> Duration {
        Duration::from_secs(self.warm_interval_secs.max(1))
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs.max(1))
    }

    pub fn decay_interval(&self) -> Duration {
        Duration::from_secs(self.decay_interval_secs.max(1))
    }

    pub fn history_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.history_retention_secs).unwrap_or(i64::MAX))
    }
}

/// Interprets a flag value the way the bypass signal does: anything except
/// empty, `0`, `false`, `no`, `off` is true.
pub(crate) fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn deserialize_partial_uses_defaults() {
        let json = r#"{"key_prefix": "api", "adaptive_ttl": true, "route_prefixes": ["/api"]}"#;
        let config: CacheConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.key_prefix, "api");
        assert!(config.adaptive_ttl);
        assert_eq!(config.default_ttl_secs, 3600);
        assert_eq!(config.bypass_query_param, "nocache");
    }

    #[test]
    fn env_overlay() {
        let vars: HashMap<&str, &str> = [
            (ENV_ADAPTIVE_TTL, "true"),
            (ENV_MONITORING, "off"),
            (ENV_WARMING, "maybe"),
        ]
        .into_iter()
        .collect();
        let config = CacheConfig::default()
            .warming(true)
            .with_env(|name| vars.get(name).map(|v| v.to_string()));
        assert!(config.adaptive_ttl);
        assert!(!config.monitoring);
        // unparseable value leaves the builder setting in place
        assert!(config.warming);
    }

    #[test]
    fn prefix_matching_respects_segment_boundaries() {
        let config = CacheConfig::default().route_prefix("/api").route_prefix("/api/v2/");
        assert_eq!(config.matching_prefix("/api/widgets"), Some("/api"));
        assert_eq!(config.matching_prefix("/api/v2/widgets"), Some("/api/v2"));
        assert_eq!(config.matching_prefix("/apix/widgets"), None);
        assert_eq!(CacheConfig::default().matching_prefix("/anything"), Some(""));
    }

    #[test]
    fn truthiness() {
        assert!(is_truthy("1"));
        assert!(is_truthy("yes please"));
        assert!(!is_truthy("False"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn cacheable_methods() {
        let config = CacheConfig::default();
        assert!(config.is_cacheable_method(&Method::Get));
        assert!(config.is_cacheable_method(&Method::Post));
        assert!(!config.is_cacheable_method(&Method::Delete));
    }
}
