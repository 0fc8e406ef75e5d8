//! The request executor: cache, single-flight, breaker, limiter, pool, retry.
//!
//! # Fetch pipeline
//!
//! ```text
//! validate ─▶ cache hit? ──yes──▶ return
//!                 │ no
//!                 ▼
//!        in-flight fetch for key? ──yes──▶ wait for its result
//!                 │ no
//!                 ▼
//!   spawn leader: breaker ─▶ limiter ─▶ [pool ─▶ send] × retries ─▶ cache
//!                 │
//!                 ▼
//!        broadcast result to every waiter
//! ```
//!
//! The leader runs in its own task, so a caller that gives up (drops its
//! future or hits a [`fetch_within`](RequestExecutor::fetch_within)
//! deadline) never strands the other waiters. Only the leader consumes a
//! rate-limit slot; joiners ride along for free.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::{RetryPolicy, with_retry};
use crate::breaker::CircuitBreaker;
use crate::cache::ResponseCache;
use crate::pool::ConnectionPool;
use crate::rate_limit::{GLOBAL_IDENTITY, RateLimitScope, RateLimiter};
use crate::telemetry;
use crate::types::{EndpointClass, Parameters, Payload, RequestDescriptor, UpstreamRequest};
use crate::{HeimdallError, Result};

/// Per-endpoint-class knobs applied by [`RequestExecutor::request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPolicy {
    pub ttl: Duration,
    pub scope: RateLimitScope,
}

/// Counters since the executor was built.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExecutorStats {
    /// Calls to `fetch`, including cache hits.
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Callers that waited on another caller's in-flight fetch.
    pub single_flight_joins: u64,
    /// Fetches that went through admission (one per single-flight group).
    pub upstream_fetches: u64,
    /// Fetches that ended in an error, admission rejections included.
    pub errors: u64,
    /// Mean time spent upstream per fetch that reached the pool, retries included.
    pub average_latency: Duration,
}

impl ExecutorStats {
    pub fn error_rate(&self) -> f64 {
        if self.upstream_fetches == 0 {
            0.0
        } else {
            self.errors as f64 / self.upstream_fetches as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    joins: AtomicU64,
    upstream_fetches: AtomicU64,
    errors: AtomicU64,
    timed_fetches: AtomicU64,
    latency_micros: AtomicU64,
}

type FlightResult = Option<Result<Payload>>;

pub(crate) struct Inner {
    pub(crate) cache: ResponseCache,
    pub(crate) limiter: RateLimiter,
    pub(crate) breaker: CircuitBreaker,
    pub(crate) pool: ConnectionPool,
    pub(crate) retry: RetryPolicy,
    pub(crate) policies: HashMap<EndpointClass, EndpointPolicy>,
    pub(crate) default_policy: EndpointPolicy,
    pub(crate) request_timeout: Duration,
    pub(crate) max_retries: u32,
    flights: Mutex<HashMap<String, watch::Receiver<FlightResult>>>,
    counters: Counters,
}

/// Removes the flight entry when the leader finishes, panics included.
struct FlightGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.inner.flights.lock().remove(&self.key);
    }
}

/// Executes Steam API requests behind the cache and admission controls.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RequestExecutor {
    pub(crate) inner: Arc<Inner>,
}

impl RequestExecutor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        cache: ResponseCache,
        limiter: RateLimiter,
        breaker: CircuitBreaker,
        pool: ConnectionPool,
        retry: RetryPolicy,
        policies: HashMap<EndpointClass, EndpointPolicy>,
        default_policy: EndpointPolicy,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                limiter,
                breaker,
                pool,
                retry,
                policies,
                default_policy,
                request_timeout,
                max_retries,
                flights: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Fetch the payload `descriptor` describes on behalf of `caller`.
    ///
    /// Served from cache when fresh. Otherwise at most one upstream fetch
    /// per cache key is in flight; concurrent callers for the same key all
    /// receive its result.
    pub async fn fetch(&self, descriptor: &RequestDescriptor, caller: &str) -> Result<Payload> {
        descriptor.validate()?;
        let inner = &self.inner;
        let endpoint = descriptor.endpoint;
        if endpoint.requires_key() && !inner.pool.has_api_key() {
            return Err(HeimdallError::UpstreamError {
                status: None,
                message: format!("endpoint {endpoint} requires an API key, none is configured"),
            });
        }
        let key = descriptor.cache_key();
        inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        if let Some(payload) = inner.cache_lookup(&key, endpoint) {
            return Ok(payload);
        }

        let mut rx = {
            let mut flights = inner.flights.lock();
            match flights.get(&key) {
                Some(rx) => {
                    inner.counters.joins.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(telemetry::SINGLE_FLIGHT_JOINS_TOTAL,
                        "endpoint" => endpoint.as_str(),
                    )
                    .increment(1);
                    debug!(endpoint = endpoint.as_str(), caller, "joining in-flight fetch");
                    rx.clone()
                }
                None => {
                    // A leader may have cached and left between our lookup
                    // and taking the lock.
                    if let Some(payload) = inner.cache.get(&key) {
                        return Ok(payload);
                    }
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.clone(), rx.clone());
                    self.spawn_leader(tx, descriptor.clone(), caller.to_owned(), key);
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(result) => (*result).clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            Err(HeimdallError::UpstreamError {
                status: None,
                message: "in-flight fetch was abandoned".into(),
            })
        })
    }

    /// [`fetch`](Self::fetch), giving up at `deadline`.
    ///
    /// Expiry yields [`HeimdallError::Timeout`] for this caller only; the
    /// fetch itself carries on and still populates the cache.
    pub async fn fetch_within(
        &self,
        descriptor: &RequestDescriptor,
        caller: &str,
        deadline: Instant,
    ) -> Result<Payload> {
        tokio::time::timeout_at(deadline, self.fetch(descriptor, caller))
            .await
            .unwrap_or(Err(HeimdallError::Timeout { attempts: 0 }))
    }

    /// Build a descriptor from the configured policy for `endpoint` and fetch it.
    pub async fn request(
        &self,
        endpoint: EndpointClass,
        parameters: Parameters,
        caller: &str,
    ) -> Result<Payload> {
        self.fetch(&self.descriptor(endpoint, parameters), caller).await
    }

    /// A descriptor carrying the configured TTL, timeout and retries for `endpoint`.
    pub fn descriptor(&self, endpoint: EndpointClass, parameters: Parameters) -> RequestDescriptor {
        let policy = self.inner.policy(endpoint);
        RequestDescriptor::new(endpoint, parameters)
            .ttl(policy.ttl)
            .timeout(self.inner.request_timeout)
            .max_retries(self.inner.max_retries)
    }

    /// The effective policy for `endpoint`.
    pub fn policy(&self, endpoint: EndpointClass) -> EndpointPolicy {
        self.inner.policy(endpoint)
    }

    /// Player summary, or `None` if Steam knows no such player.
    pub async fn profile(&self, steam_id: &str, caller: &str) -> Result<Option<Value>> {
        let payload = self
            .request(EndpointClass::Profile, Parameters::new().with("steamids", steam_id), caller)
            .await?;
        let mut body: Value = payload.json()?;
        Ok(body.pointer_mut("/response/players/0").map(Value::take))
    }

    pub async fn owned_games(&self, steam_id: &str, caller: &str) -> Result<Payload> {
        self.request(EndpointClass::OwnedGames, Parameters::new().with("steamid", steam_id), caller)
            .await
    }

    pub async fn recent_games(
        &self,
        steam_id: &str,
        count: Option<u32>,
        caller: &str,
    ) -> Result<Payload> {
        let mut params = Parameters::new().with("steamid", steam_id);
        if let Some(count) = count {
            params = params.with("count", count.to_string());
        }
        self.request(EndpointClass::RecentGames, params, caller).await
    }

    /// A player's achievement progress in one game (`playerstats`).
    pub async fn achievements(
        &self,
        steam_id: &str,
        app_id: u32,
        caller: &str,
    ) -> Result<Option<Value>> {
        let params = Parameters::new()
            .with("steamid", steam_id)
            .with("appid", app_id.to_string());
        let payload = self.request(EndpointClass::Achievements, params, caller).await?;
        let mut body: Value = payload.json()?;
        Ok(body.get_mut("playerstats").map(Value::take))
    }

    pub async fn game_schema(&self, app_id: u32, caller: &str) -> Result<Payload> {
        self.request(
            EndpointClass::GameSchema,
            Parameters::new().with("appid", app_id.to_string()),
            caller,
        )
        .await
    }

    /// Players currently in-game, or `None` if the app reports no count.
    pub async fn player_count(&self, app_id: u32, caller: &str) -> Result<Option<u64>> {
        let payload = self
            .request(
                EndpointClass::PlayerCount,
                Parameters::new().with("appid", app_id.to_string()),
                caller,
            )
            .await?;
        let body: Value = payload.json()?;
        Ok(body.pointer("/response/player_count").and_then(Value::as_u64))
    }

    pub async fn news(&self, app_id: u32, count: Option<u32>, caller: &str) -> Result<Payload> {
        let mut params = Parameters::new().with("appid", app_id.to_string());
        if let Some(count) = count {
            params = params.with("count", count.to_string());
        }
        self.request(EndpointClass::News, params, caller).await
    }

    pub async fn friends(&self, steam_id: &str, caller: &str) -> Result<Payload> {
        self.request(EndpointClass::Friends, Parameters::new().with("steamid", steam_id), caller)
            .await
    }

    pub async fn badges(&self, steam_id: &str, caller: &str) -> Result<Payload> {
        self.request(EndpointClass::Badges, Parameters::new().with("steamid", steam_id), caller)
            .await
    }

    pub async fn player_level(&self, steam_id: &str, caller: &str) -> Result<Option<u64>> {
        let payload = self
            .request(EndpointClass::PlayerLevel, Parameters::new().with("steamid", steam_id), caller)
            .await?;
        let body: Value = payload.json()?;
        Ok(body.pointer("/response/player_level").and_then(Value::as_u64))
    }

    /// Store page data, or `None` if the store reports no such app.
    pub async fn game_details(&self, app_id: u32, caller: &str) -> Result<Option<Value>> {
        let app = app_id.to_string();
        let payload = self
            .request(EndpointClass::GameDetails, Parameters::new().with("appids", &app), caller)
            .await?;
        let mut body: Value = payload.json()?;
        let Some(entry) = body.get_mut(&app) else {
            return Ok(None);
        };
        if entry.get("success").and_then(Value::as_bool) != Some(true) {
            return Ok(None);
        }
        Ok(entry.get_mut("data").map(Value::take))
    }

    pub async fn featured(&self, caller: &str) -> Result<Payload> {
        self.request(EndpointClass::Featured, Parameters::new(), caller).await
    }

    pub fn stats(&self) -> ExecutorStats {
        let c = &self.inner.counters;
        let timed = c.timed_fetches.load(Ordering::Relaxed);
        let average_latency = match timed {
            0 => Duration::ZERO,
            n => Duration::from_micros(c.latency_micros.load(Ordering::Relaxed) / n),
        };
        ExecutorStats {
            requests: c.requests.load(Ordering::Relaxed),
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            single_flight_joins: c.joins.load(Ordering::Relaxed),
            upstream_fetches: c.upstream_fetches.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            average_latency,
        }
    }

    /// Fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.lock().len()
    }

    fn spawn_leader(
        &self,
        tx: watch::Sender<FlightResult>,
        descriptor: RequestDescriptor,
        caller: String,
        key: String,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let guard = FlightGuard {
                inner: inner.clone(),
                key: key.clone(),
            };
            let result = inner.lead(&descriptor, &caller, key).await;
            if result.is_err() {
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
            // Leave the table before broadcasting, so a late caller either
            // joins this flight or sees the cache it just filled.
            drop(guard);
            let _ = tx.send(Some(result));
        });
    }
}

impl Inner {
    pub(crate) fn policy(&self, endpoint: EndpointClass) -> EndpointPolicy {
        self.policies
            .get(&endpoint)
            .copied()
            .unwrap_or(self.default_policy)
    }

    fn cache_lookup(&self, key: &str, endpoint: EndpointClass) -> Option<Payload> {
        match self.cache.get(key) {
            Some(payload) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "endpoint" => endpoint.as_str())
                    .increment(1);
                Some(payload)
            }
            None => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "endpoint" => endpoint.as_str())
                    .increment(1);
                None
            }
        }
    }

    async fn lead(&self, descriptor: &RequestDescriptor, caller: &str, key: String) -> Result<Payload> {
        let endpoint = descriptor.endpoint;
        self.counters.upstream_fetches.fetch_add(1, Ordering::Relaxed);

        let permit = match self.breaker.try_acquire(endpoint) {
            Ok(permit) => permit,
            Err(e) => {
                metrics::counter!(telemetry::BREAKER_REJECTIONS_TOTAL,
                    "endpoint" => endpoint.as_str(),
                )
                .increment(1);
                debug!(endpoint = endpoint.as_str(), caller, "circuit open, failing fast");
                return Err(e);
            }
        };

        let identity = match self.policy(endpoint).scope {
            RateLimitScope::PerCaller => caller,
            RateLimitScope::Global => GLOBAL_IDENTITY,
        };
        if !self.limiter.allow(identity) {
            permit.release();
            metrics::counter!(telemetry::RATE_LIMITED_TOTAL, "endpoint" => endpoint.as_str())
                .increment(1);
            info!(endpoint = endpoint.as_str(), caller, "rate limited");
            return Err(HeimdallError::RateLimited {
                retry_after: self.limiter.time_until_next_slot(identity),
            });
        }

        let request = descriptor.upstream_request();
        let timeout = descriptor.timeout;
        let started = Instant::now();
        let outcome = {
            let request = &request;
            with_retry(&self.retry, descriptor.max_retries, endpoint, move |_| {
                self.attempt(request, timeout)
            })
            .await
        };
        let elapsed = started.elapsed();
        self.counters.timed_fetches.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS, "endpoint" => endpoint.as_str())
            .record(elapsed.as_secs_f64());

        match outcome {
            Ok(payload) => {
                permit.success();
                self.cache.put(key, payload.clone(), descriptor.ttl);
                metrics::counter!(telemetry::REQUESTS_TOTAL,
                    "endpoint" => endpoint.as_str(),
                    "status" => "ok",
                )
                .increment(1);
                debug!(
                    endpoint = endpoint.as_str(),
                    caller,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "fetched from upstream"
                );
                Ok(payload)
            }
            Err(exhausted) => {
                if exhausted.last.counts_against_breaker() {
                    permit.failure();
                } else {
                    permit.release();
                }
                metrics::counter!(telemetry::REQUESTS_TOTAL,
                    "endpoint" => endpoint.as_str(),
                    "status" => "error",
                )
                .increment(1);
                let err = exhausted.into_error();
                warn!(endpoint = endpoint.as_str(), caller, error = %err, "upstream fetch failed");
                Err(err)
            }
        }
    }

    /// One attempt: borrow a connection and send, both within `timeout`.
    async fn attempt(&self, request: &UpstreamRequest, timeout: Duration) -> Result<Payload> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.pool.acquire_until(deadline).await?;
        let sent = tokio::time::timeout_at(deadline, conn.send(request)).await;
        match sent {
            Ok(result) => result,
            Err(_) => {
                conn.discard();
                Err(HeimdallError::AttemptTimedOut(timeout))
            }
        }
    }
}
