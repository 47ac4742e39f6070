//! Request fingerprinting.
//!
//! A [`RequestDescriptor`] captures the semantically relevant parts of a
//! request; [`generate_key`] turns it into a namespaced cache key. Params are
//! a `BTreeMap` and query pairs are sorted, so serialization order never
//! depends on the order a client wrote them in.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::context::Context;

/// Caller id used for unauthenticated requests.
pub const ANONYMOUS: &str = "anonymous";

/// A request body as it takes part in the key. The variant tags keep a JSON
/// string, the same bytes as plain text, and a binary body apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestBody {
    Empty,
    /// Parsed JSON, so formatting differences do not split the cache.
    Json(Value),
    Text(String),
    /// SHA-256 hex of a body that is not UTF-8.
    Binary(String),
}

impl RequestBody {
    pub fn from_bytes(raw: &[u8]) -> Self {
        if raw.is_empty() {
            return Self::Empty;
        }
        if let Ok(value) = serde_json::from_slice::<Value>(raw) {
            return Self::Json(value);
        }
        match std::str::from_utf8(raw) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Binary(hex::encode(Sha256::digest(raw))),
        }
    }
}

/// Everything about a request that can change its response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub body: RequestBody,
    pub params: BTreeMap<String, String>,
    /// Query pairs sorted by key then value; repeated keys are kept.
    pub query: Vec<(String, String)>,
    pub caller: String,
}

impl RequestDescriptor {
    /// Builds a descriptor from a request context. `exclude_query` names
    /// query parameters that must not take part in the key (the bypass flag).
    pub fn from_context(ctx: &Context, exclude_query: &[&str]) -> Self {
        let request = ctx.request();
        let mut query: Vec<(String, String)> = request
            .query_pairs()
            .filter(|(k, _)| !exclude_query.contains(&k.as_str()))
            .collect();
        query.sort();

        Self {
            method: request.method().as_str().to_owned(),
            path: request.path().to_owned(),
            body: RequestBody::from_bytes(request.body()),
            params: ctx
                .params()
                .iter()
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .collect(),
            query,
            caller: ctx
                .principal()
                .map_or_else(|| ANONYMOUS.to_owned(), |p| p.id().to_owned()),
        }
    }
}

/// Derives `prefix:<sha256 hex>` from a descriptor. Pure and deterministic.
///
/// # Examples
///
/// ```
/// use rttp_cache::cache::fingerprint::{generate_key, RequestBody, RequestDescriptor};
///
/// let d = RequestDescriptor {
///     method: "GET".into(),
///     path: "/widgets/42".into(),
///     body: RequestBody::Empty,
///     params: Default::default(),
///     query: vec![("color".into(), "red".into())],
///     caller: "anonymous".into(),
/// };
/// let key = generate_key(&d, "cache");
/// assert!(key.starts_with("cache:"));
/// assert_eq!(key, generate_key(&d, "cache"));
/// ```
pub fn generate_key(descriptor: &RequestDescriptor, prefix: &str) -> String {
    // Serializing strings, maps and JSON values cannot fail; the Debug
    // fallback keeps the function total regardless.
    let canonical =
        serde_json::to_vec(descriptor).unwrap_or_else(|_| format!("{descriptor:?}").into_bytes());
    let digest = Sha256::digest(&canonical);
    format!("{prefix}:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{PathParams, Principal};
    use crate::{Method, Request};

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor {
            method: "GET".into(),
            path: "/widgets/42".into(),
            body: RequestBody::Empty,
            params: BTreeMap::new(),
            query: vec![("color".into(), "red".into())],
            caller: ANONYMOUS.into(),
        }
    }

    fn key_for(request: Request) -> String {
        let ctx = Context::new(request);
        generate_key(&RequestDescriptor::from_context(&ctx, &["nocache"]), "c")
    }

    fn post(body: impl Into<bytes::Bytes>) -> Request {
        Request::new(Method::Post, "/search").with_body(body)
    }

    #[test]
    fn identical_descriptors_share_a_key() {
        assert_eq!(generate_key(&descriptor(), "cache"), generate_key(&descriptor(), "cache"));
    }

    #[test]
    fn key_has_prefix_and_256_bit_digest() {
        let key = generate_key(&descriptor(), "api");
        let (prefix, digest) = key.split_once(':').unwrap();
        assert_eq!(prefix, "api");
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn every_field_changes_the_key() {
        let base = generate_key(&descriptor(), "cache");
        let variants: Vec<Box<dyn Fn(&mut RequestDescriptor)>> = vec![
            Box::new(|d| d.method = "POST".into()),
            Box::new(|d| d.path = "/widgets/43".into()),
            Box::new(|d| d.body = RequestBody::Json(serde_json::json!({"filter": "x"}))),
            Box::new(|d| {
                d.params.insert("id".into(), "42".into());
            }),
            Box::new(|d| d.query[0].1 = "blue".into()),
            Box::new(|d| d.caller = "user-1".into()),
        ];
        for mutate in variants {
            let mut d = descriptor();
            mutate(&mut d);
            assert_ne!(generate_key(&d, "cache"), base);
        }
        assert_ne!(generate_key(&descriptor(), "other"), base);
    }

    #[test]
    fn query_order_does_not_matter() {
        assert_eq!(
            key_for(Request::new(Method::Get, "/w?a=1&b=2&a=0")),
            key_for(Request::new(Method::Get, "/w?b=2&a=0&a=1&nocache=0"))
        );
    }

    #[test]
    fn repeated_query_keys_are_all_kept() {
        let both = key_for(Request::new(Method::Get, "/w?tag=a&tag=b"));
        assert_ne!(both, key_for(Request::new(Method::Get, "/w?tag=b")));
        assert_ne!(both, key_for(Request::new(Method::Get, "/w?tag=a")));
    }

    #[test]
    fn body_kinds_do_not_collide() {
        let keys = [
            key_for(post("")),
            key_for(post(r#""bolt""#)),
            key_for(post("bolt")),
            key_for(post(vec![0xff, 0xfe])),
            key_for(post(vec![0xff, 0xfd])),
        ];
        for (i, a) in keys.iter().enumerate() {
            for b in &keys[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert_eq!(key_for(post(r#"{ "q" : 1 }"#)), key_for(post(r#"{"q":1}"#)));
    }

    #[test]
    fn from_context_captures_caller_and_body() {
        let req = Request::new(Method::Post, "/search?nocache=0").with_body(r#"{ "q" : "bolt" }"#);
        let mut params = PathParams::new();
        params.insert("tenant".into(), "acme".into());
        let ctx = Context::with_params(req, params).with_principal(Principal::user("u-7"));

        let d = RequestDescriptor::from_context(&ctx, &["nocache"]);
        assert_eq!(d.caller, "u-7");
        assert_eq!(d.body, RequestBody::Json(serde_json::json!({"q": "bolt"})));
        assert_eq!(d.params.get("tenant").map(String::as_str), Some("acme"));
        assert!(d.query.is_empty());
    }

    #[test]
    fn body_is_tagged_by_kind() {
        assert_eq!(RequestBody::from_bytes(b""), RequestBody::Empty);
        let text = RequestBody::from_bytes(b"plain words");
        assert_eq!(text, RequestBody::Text("plain words".into()));
        let binary = RequestBody::from_bytes(&[0xff]);
        assert!(matches!(binary, RequestBody::Binary(digest) if digest.len() == 64));

        let ctx = Context::new(post("plain words"));
        assert_eq!(RequestDescriptor::from_context(&ctx, &[]).caller, ANONYMOUS);
    }
}
