//! Telemetry metric name constants.
//!
//! Centralised metric names for heimdall operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `heimdall_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `endpoint`: endpoint class (e.g. "profile", "player_count")
//! - `status`: outcome: "ok" or "error"
//! - `state`: breaker state entered: "open", "half_open" or "closed"

/// Upstream fetches that reached the transport (one per fetch, not per attempt).
///
/// Labels: `endpoint`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "heimdall_requests_total";

/// Upstream fetch duration in seconds, retries included.
///
/// Labels: `endpoint`.
pub const REQUEST_DURATION_SECONDS: &str = "heimdall_request_duration_seconds";

/// Retry attempts (not counting the initial attempt).
///
/// Labels: `endpoint`.
pub const RETRIES_TOTAL: &str = "heimdall_retries_total";

/// Labels: `endpoint`.
pub const CACHE_HITS_TOTAL: &str = "heimdall_cache_hits_total";

/// Labels: `endpoint`.
pub const CACHE_MISSES_TOTAL: &str = "heimdall_cache_misses_total";

/// Entries evicted to respect the capacity bound.
pub const CACHE_EVICTIONS_TOTAL: &str = "heimdall_cache_evictions_total";

/// Callers that joined an in-flight fetch instead of issuing their own.
///
/// Labels: `endpoint`.
pub const SINGLE_FLIGHT_JOINS_TOTAL: &str = "heimdall_single_flight_joins_total";

/// Fetches rejected by the caller rate limiter.
///
/// Labels: `endpoint`.
pub const RATE_LIMITED_TOTAL: &str = "heimdall_rate_limited_total";

/// Fetches rejected because the endpoint's breaker was open.
///
/// Labels: `endpoint`.
pub const BREAKER_REJECTIONS_TOTAL: &str = "heimdall_breaker_rejections_total";

/// Breaker state transitions.
///
/// Labels: `endpoint`, `state`.
pub const BREAKER_TRANSITIONS_TOTAL: &str = "heimdall_breaker_transitions_total";

/// Transport connections opened by the pool.
pub const POOL_CONNECTIONS_OPENED_TOTAL: &str = "heimdall_pool_connections_opened_total";
