//! Builder for configuring executor instances

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::executor::{EndpointPolicy, RequestExecutor};
use super::retry::RetryPolicy;
use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::cache::{CacheConfig, ResponseCache};
use crate::config::{Config, Secrets};
use crate::pool::{ConnectionPool, Connector, HttpConnector, PoolConfig, UpstreamConfig};
use crate::rate_limit::{RateLimitConfig, RateLimitScope, RateLimiter};
use crate::types::EndpointClass;
use crate::{HeimdallError, Result};

/// Main entry point for creating executor instances.
pub struct Heimdall;

impl Heimdall {
    /// Create a new builder for configuring the executor.
    pub fn builder() -> HeimdallBuilder {
        HeimdallBuilder::new()
    }
}

/// Builder for configuring executor instances.
pub struct HeimdallBuilder {
    cache: CacheConfig,
    rate_limit: RateLimitConfig,
    breaker: BreakerConfig,
    pool: PoolConfig,
    retry: RetryPolicy,
    request_timeout: Duration,
    max_retries: u32,
    default_ttl: Duration,
    ttls: HashMap<EndpointClass, Duration>,
    scopes: HashMap<EndpointClass, RateLimitScope>,
    connector: Option<Arc<dyn Connector>>,
    api_key: Option<String>,
    upstream: UpstreamConfig,
}

impl HeimdallBuilder {
    pub fn new() -> Self {
        Self {
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            breaker: BreakerConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            default_ttl: Duration::from_secs(300),
            ttls: HashMap::new(),
            scopes: HashMap::new(),
            connector: None,
            api_key: None,
            upstream: UpstreamConfig::default(),
        }
    }

    /// Start from a loaded config file and secrets.
    pub fn from_config(config: &Config, secrets: &Secrets) -> Self {
        let mut builder = Self::new()
            .cache(config.cache_config())
            .rate_limit(config.rate_limit_config())
            .breaker(config.breaker_config())
            .pool(config.pool_config())
            .retry(config.retry_policy())
            .request_timeout(config.request_timeout())
            .max_retries(config.request.max_retries)
            .default_ttl(Duration::from_secs(config.cache.default_ttl_secs))
            .upstream(config.upstream_config());
        for endpoint in EndpointClass::ALL {
            let policy = config.endpoint_policy(endpoint);
            builder = builder.ttl(endpoint, policy.ttl).scope(endpoint, policy.scope);
        }
        match secrets.steam_api_key() {
            Some(key) => builder.api_key(key),
            None => builder,
        }
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Default per-attempt timeout (default: 30s).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Default retries after the first attempt (default: 3).
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// TTL for endpoint classes without their own (default: 300s).
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn ttl(mut self, endpoint: EndpointClass, ttl: Duration) -> Self {
        self.ttls.insert(endpoint, ttl);
        self
    }

    /// Whose rate-limit budget `endpoint` draws from (default: per caller).
    pub fn scope(mut self, endpoint: EndpointClass, scope: RateLimitScope) -> Self {
        self.scopes.insert(endpoint, scope);
        self
    }

    /// Replace the HTTP transport (for tests and alternative transports).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn upstream(mut self, upstream: UpstreamConfig) -> Self {
        self.upstream = upstream;
        self
    }

    /// Point both Steam hosts at one base URL (for testing with wiremock).
    pub fn base_url(self, url: impl Into<String>) -> Self {
        let user_agent = self.upstream.user_agent.clone();
        self.upstream(UpstreamConfig {
            user_agent,
            ..UpstreamConfig::with_base_url(url)
        })
    }

    pub fn build(self) -> Result<RequestExecutor> {
        if self.request_timeout.is_zero() {
            return Err(HeimdallError::Configuration(
                "request timeout must be non-zero".into(),
            ));
        }
        if self.rate_limit.window.is_zero() {
            return Err(HeimdallError::Configuration(
                "rate limit window must be non-zero".into(),
            ));
        }

        let connector = match self.connector {
            Some(connector) => connector,
            None => {
                if self.api_key.is_none() {
                    warn!("no Steam API key configured; only keyless endpoints will succeed");
                }
                Arc::new(HttpConnector::new(self.upstream, self.api_key)) as Arc<dyn Connector>
            }
        };

        let default_policy = EndpointPolicy {
            ttl: self.default_ttl,
            scope: RateLimitScope::default(),
        };
        let policies = EndpointClass::ALL
            .into_iter()
            .map(|endpoint| {
                let policy = EndpointPolicy {
                    ttl: self.ttls.get(&endpoint).copied().unwrap_or(default_policy.ttl),
                    scope: self.scopes.get(&endpoint).copied().unwrap_or_default(),
                };
                (endpoint, policy)
            })
            .collect();

        Ok(RequestExecutor::from_parts(
            ResponseCache::new(&self.cache),
            RateLimiter::new(self.rate_limit),
            CircuitBreaker::new(self.breaker),
            ConnectionPool::new(connector, self.pool),
            self.retry,
            policies,
            default_policy,
            self.request_timeout,
            self.max_retries,
        ))
    }
}

impl Default for HeimdallBuilder {
    fn default() -> Self {
        Self::new()
    }
}
