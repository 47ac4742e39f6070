//! Per-request context: the request, its matched route parameters, and the
//! authenticated caller (if any).
//!
//! Authentication itself happens upstream; whatever layer verifies the caller
//! attaches a [`Principal`] with [`Context::with_principal`]. The caching
//! middleware uses the principal's id as part of the request fingerprint, and
//! the management routes use [`Principal::is_admin`] as the privilege check.

use std::collections::BTreeMap;

use crate::Request;

/// Path parameters extracted from the matched route.
///
/// Backed by a `BTreeMap` so iteration order is stable, which keeps request
/// fingerprints deterministic.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PathParams {
    map: BTreeMap<String, String>,
}

impl PathParams {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the parameters map
    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Iterate parameters in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    id: String,
    admin: bool,
}

impl Principal {
    /// A regular, unprivileged caller.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            admin: false,
        }
    }

    /// A caller allowed to use privileged management routes.
    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            admin: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_admin(&self) -> bool {
        self.admin
    }
}

/// Per-request context handed to middleware and handlers.
#[derive(Debug, Clone)]
pub struct Context {
    request: Request,
    params: PathParams,
    principal: Option<Principal>,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            params: PathParams::new(),
            principal: None,
        }
    }

    /// Create a context carrying already-extracted route parameters
    pub fn with_params(request: Request, params: PathParams) -> Self {
        Self {
            request,
            params,
            principal: None,
        }
    }

    /// Attach the authenticated caller
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub(crate) fn set_params(&mut self, params: PathParams) {
        self.params = params;
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    /// Deserialize the request body as JSON
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}
