//! Read/reset access to the executor's internal state.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::executor::{Inner, RequestExecutor};
use crate::breaker::{BreakerSnapshot, CircuitState};
use crate::cache::CacheStats;
use crate::pool::PoolStatus;
use crate::rate_limit::WindowSnapshot;
use crate::types::EndpointClass;

/// Operator handle onto a running [`RequestExecutor`].
///
/// Inspects and resets cache, breaker and limiter state. It cannot issue
/// requests or change configuration.
#[derive(Clone)]
pub struct AdminHandle {
    inner: Arc<Inner>,
}

impl RequestExecutor {
    pub fn admin(&self) -> AdminHandle {
        AdminHandle {
            inner: self.inner.clone(),
        }
    }
}

impl AdminHandle {
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        info!("response cache cleared");
    }

    /// Drop one cached entry by cache key. Returns whether it was present.
    pub fn invalidate(&self, cache_key: &str) -> bool {
        self.inner.cache.invalidate(cache_key)
    }

    /// Drop expired cache entries now instead of on their next read.
    pub fn purge_expired(&self) -> usize {
        self.inner.cache.purge_expired()
    }

    pub fn breaker_state(&self, endpoint: EndpointClass) -> CircuitState {
        self.inner.breaker.state(endpoint)
    }

    pub fn breaker_states(&self) -> Vec<BreakerSnapshot> {
        self.inner.breaker.snapshot()
    }

    pub fn reset_breaker(&self, endpoint: EndpointClass) {
        self.inner.breaker.reset(endpoint);
    }

    pub fn rate_limit_windows(&self) -> Vec<WindowSnapshot> {
        self.inner.limiter.snapshot()
    }

    pub fn rate_limit_occupancy(&self, identity: &str) -> usize {
        self.inner.limiter.occupancy(identity)
    }

    pub fn rate_limit_wait(&self, identity: &str) -> Duration {
        self.inner.limiter.time_until_next_slot(identity)
    }

    /// Forget an identity's rate-limit window. Returns whether one existed.
    pub fn reset_rate_limit(&self, identity: &str) -> bool {
        let existed = self.inner.limiter.reset(identity);
        if existed {
            info!(identity, "rate limit window reset");
        }
        existed
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    /// Close parked connections past their idle timeout.
    pub fn evict_idle_connections(&self) -> usize {
        self.inner.pool.evict_idle()
    }
}
