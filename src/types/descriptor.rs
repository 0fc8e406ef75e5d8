//! Request descriptors and cache-key derivation.

use std::fmt::Write as _;
use std::time::Duration;

use super::EndpointClass;
use crate::{HeimdallError, Result};

/// Ordered key/value parameters of an upstream call.
///
/// Insertion order is preserved for display; [`normalized()`](Self::normalized)
/// gives the canonical form used for cache keys and upstream queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters(Vec<(String, String)>);

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter. A later value for the same key replaces the earlier one.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Trimmed values, sorted by key.
    pub fn normalized(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .0
            .iter()
            .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
            .collect();
        pairs.sort();
        pairs
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Parameters::new(), |params, (k, v)| params.with(k, v))
    }
}

/// A fully specified upstream call.
///
/// Built by the executor from configured per-endpoint policy, or by hand
/// for callers that need to override TTL, retries or timeout.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub endpoint: EndpointClass,
    pub parameters: Parameters,
    /// How long a successful payload stays cached.
    pub ttl: Duration,
    /// Retries after the first attempt on transient failure.
    pub max_retries: u32,
    /// Deadline of one attempt, and of the pool borrow before it.
    pub timeout: Duration,
}

impl RequestDescriptor {
    /// Create a descriptor with the built-in defaults (300s TTL, 3 retries, 30s timeout).
    pub fn new(endpoint: EndpointClass, parameters: Parameters) -> Self {
        Self {
            endpoint,
            parameters,
            ttl: Duration::from_secs(300),
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check parameters against the endpoint's declaration.
    ///
    /// Rejects unknown keys, missing required keys and malformed values.
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(HeimdallError::InvalidInput("timeout must be non-zero".into()));
        }
        let specs = self.endpoint.params();
        let pairs = self.parameters.normalized();
        for (key, value) in &pairs {
            let spec = specs.iter().find(|s| s.name == key).ok_or_else(|| {
                HeimdallError::InvalidInput(format!(
                    "unknown parameter '{key}' for endpoint {}",
                    self.endpoint
                ))
            })?;
            spec.kind.check(key, value)?;
        }
        for spec in specs.iter().filter(|s| s.required) {
            if !pairs.iter().any(|(key, _)| key == spec.name) {
                return Err(HeimdallError::InvalidInput(format!(
                    "missing parameter '{}' for endpoint {}",
                    spec.name, self.endpoint
                )));
            }
        }
        Ok(())
    }

    /// Cache key: endpoint name followed by the normalized query string.
    pub fn cache_key(&self) -> String {
        let mut key = String::from(self.endpoint.as_str());
        for (i, (k, v)) in self.parameters.normalized().iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            let _ = write!(key, "{sep}{k}={v}");
        }
        key
    }

    /// The call as the transport sees it: caller parameters plus fixed ones.
    pub fn upstream_request(&self) -> UpstreamRequest {
        let mut query = self.parameters.normalized();
        query.extend(
            self.endpoint
                .fixed_query()
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned())),
        );
        UpstreamRequest {
            endpoint: self.endpoint,
            query,
        }
    }
}

/// Transport-level request: endpoint plus final query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamRequest {
    pub endpoint: EndpointClass,
    pub query: Vec<(String, String)>,
}
