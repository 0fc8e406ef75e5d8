//! Per-endpoint-class circuit breaker.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: upstream assumed unhealthy, requests fail fast
//! - Half-Open: one probe request tests whether the upstream recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open:      consecutive failures reach the threshold
//! Open → Half-Open:   cooldown elapsed since opened_at (on next admission)
//! Half-Open → Closed: probe succeeds
//! Half-Open → Open:   probe fails; cooldown grows by the multiplier, capped
//! ```
//!
//! Admission hands out a [`BreakerPermit`]. The permit is settled with
//! [`success`](BreakerPermit::success), [`failure`](BreakerPermit::failure)
//! or [`release`](BreakerPermit::release); a probe permit dropped without
//! being settled frees the probe slot so the endpoint cannot wedge in
//! Half-Open.
//!
//! Every transition for one endpoint happens under that endpoint's mutex,
//! so check-then-increment sequences never interleave.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::telemetry;
use crate::types::EndpointClass;
use crate::{HeimdallError, Result};

/// Wait hint given to callers turned away while a probe is in flight.
const PROBE_IN_FLIGHT_HINT: Duration = Duration::from_secs(1);

/// Configuration for the circuit breaker.
///
/// ```rust
/// # use heimdall::BreakerConfig;
/// # use std::time::Duration;
/// let config = BreakerConfig::new()
///     .failure_threshold(5)
///     .cooldown(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker. Default: 5.
    pub failure_threshold: u32,
    /// Time spent Open before a probe is admitted. Default: 60s.
    pub cooldown: Duration,
    /// Cap for the cooldown after repeated probe failures. Default: 10min.
    pub max_cooldown: Duration,
    /// Cooldown growth factor per failed probe. 1 keeps it constant. Default: 2.
    pub cooldown_multiplier: u32,
    /// If set, a failure more than this long after the previous one
    /// restarts the consecutive count. Default: none.
    pub failure_window: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
            cooldown_multiplier: 2,
            failure_window: None,
        }
    }
}

impl BreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    pub fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn max_cooldown(mut self, cap: Duration) -> Self {
        self.max_cooldown = cap;
        self
    }

    pub fn cooldown_multiplier(mut self, factor: u32) -> Self {
        self.cooldown_multiplier = factor;
        self
    }

    pub fn failure_window(mut self, window: Duration) -> Self {
        self.failure_window = Some(window);
        self
    }

    fn next_cooldown(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.cooldown_multiplier.max(1))
            .min(self.max_cooldown.max(self.cooldown))
    }
}

/// Breaker state of one endpoint class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerCell {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    cooldown: Duration,
    last_failure_at: Option<Instant>,
    total_opens: u64,
}

impl BreakerCell {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
            cooldown: config.cooldown,
            last_failure_at: None,
            total_opens: 0,
        }
    }

    fn transition(&mut self, endpoint: EndpointClass, to: CircuitState) {
        self.state = to;
        metrics::counter!(telemetry::BREAKER_TRANSITIONS_TOTAL,
            "endpoint" => endpoint.as_str(),
            "state" => to.label(),
        )
        .increment(1);
    }

    fn open(&mut self, endpoint: EndpointClass, now: Instant) {
        self.transition(endpoint, CircuitState::Open);
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.total_opens += 1;
        warn!(
            endpoint = endpoint.as_str(),
            failures = self.consecutive_failures,
            cooldown_ms = self.cooldown.as_millis() as u64,
            "circuit breaker opened"
        );
    }
}

/// Point-in-time view of one endpoint's breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub endpoint: EndpointClass,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub probe_in_flight: bool,
    /// Remaining cooldown while Open.
    pub retry_after: Option<Duration>,
    pub total_opens: u64,
}

/// Circuit breakers for all endpoint classes, created lazily on first use.
pub struct CircuitBreaker {
    cells: DashMap<EndpointClass, Arc<Mutex<BreakerCell>>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            cells: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn cell(&self, endpoint: EndpointClass) -> Arc<Mutex<BreakerCell>> {
        self.cells
            .entry(endpoint)
            .or_insert_with(|| Arc::new(Mutex::new(BreakerCell::new(&self.config))))
            .clone()
    }

    /// Ask to call `endpoint`.
    ///
    /// Fails with [`HeimdallError::UpstreamUnavailable`] while Open, and
    /// while Half-Open with a probe already in flight.
    pub fn try_acquire(&self, endpoint: EndpointClass) -> Result<BreakerPermit> {
        let cell = self.cell(endpoint);
        let now = Instant::now();
        let probe = {
            let mut c = cell.lock();
            match c.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let opened_at = c.opened_at.unwrap_or(now);
                    let elapsed = now.saturating_duration_since(opened_at);
                    if elapsed < c.cooldown {
                        return Err(HeimdallError::UpstreamUnavailable {
                            endpoint,
                            retry_after: c.cooldown - elapsed,
                        });
                    }
                    c.transition(endpoint, CircuitState::HalfOpen);
                    c.probe_in_flight = true;
                    info!(endpoint = endpoint.as_str(), "circuit breaker half-open, probing");
                    true
                }
                CircuitState::HalfOpen => {
                    if c.probe_in_flight {
                        return Err(HeimdallError::UpstreamUnavailable {
                            endpoint,
                            retry_after: PROBE_IN_FLIGHT_HINT,
                        });
                    }
                    c.probe_in_flight = true;
                    true
                }
            }
        };
        Ok(BreakerPermit {
            cell,
            endpoint,
            probe,
            settled: false,
            config: self.config.clone(),
        })
    }

    /// Current state, without creating a breaker or advancing Open → Half-Open.
    pub fn state(&self, endpoint: EndpointClass) -> CircuitState {
        self.cells
            .get(&endpoint)
            .map(|c| c.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive failures recorded for `endpoint`.
    pub fn consecutive_failures(&self, endpoint: EndpointClass) -> u32 {
        self.cells
            .get(&endpoint)
            .map(|c| c.lock().consecutive_failures)
            .unwrap_or(0)
    }

    /// Snapshots of every breaker created so far, in endpoint order.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .cells
            .iter()
            .map(|entry| {
                let c = entry.value().lock();
                let retry_after = match (c.state, c.opened_at) {
                    (CircuitState::Open, Some(at)) => {
                        Some(c.cooldown.saturating_sub(now.saturating_duration_since(at)))
                    }
                    _ => None,
                };
                BreakerSnapshot {
                    endpoint: *entry.key(),
                    state: c.state,
                    consecutive_failures: c.consecutive_failures,
                    probe_in_flight: c.probe_in_flight,
                    retry_after,
                    total_opens: c.total_opens,
                }
            })
            .collect();
        snapshots.sort_by_key(|s| s.endpoint);
        snapshots
    }

    /// Force `endpoint` back to Closed with counters cleared.
    pub fn reset(&self, endpoint: EndpointClass) {
        if let Some(cell) = self.cells.get(&endpoint) {
            let mut c = cell.lock();
            let total_opens = c.total_opens;
            *c = BreakerCell::new(&self.config);
            c.total_opens = total_opens;
            info!(endpoint = endpoint.as_str(), "circuit breaker reset");
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
#[must_use = "settle the permit with success(), failure() or release()"]
pub struct BreakerPermit {
    cell: Arc<Mutex<BreakerCell>>,
    endpoint: EndpointClass,
    probe: bool,
    settled: bool,
    config: BreakerConfig,
}

impl BreakerPermit {
    /// Whether this permit is the Half-Open trial request.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The upstream answered successfully.
    pub fn success(mut self) {
        self.settled = true;
        let mut c = self.cell.lock();
        match c.state {
            CircuitState::Closed => c.consecutive_failures = 0,
            CircuitState::HalfOpen if self.probe => {
                c.transition(self.endpoint, CircuitState::Closed);
                c.consecutive_failures = 0;
                c.probe_in_flight = false;
                c.opened_at = None;
                c.last_failure_at = None;
                c.cooldown = self.config.cooldown;
                info!(endpoint = self.endpoint.as_str(), "circuit breaker closed");
            }
            // A request admitted before the breaker opened says nothing
            // about the current probe.
            _ => {}
        }
    }

    /// The upstream failed (timeout, connection error, 5xx).
    pub fn failure(mut self) {
        self.settled = true;
        let now = Instant::now();
        let mut c = self.cell.lock();
        match c.state {
            CircuitState::Closed => {
                let stale = match (self.config.failure_window, c.last_failure_at) {
                    (Some(window), Some(last)) => now.saturating_duration_since(last) > window,
                    _ => false,
                };
                c.consecutive_failures = if stale { 1 } else { c.consecutive_failures + 1 };
                c.last_failure_at = Some(now);
                if c.consecutive_failures >= self.config.failure_threshold {
                    c.cooldown = self.config.cooldown;
                    c.open(self.endpoint, now);
                }
            }
            CircuitState::HalfOpen if self.probe => {
                c.consecutive_failures += 1;
                c.last_failure_at = Some(now);
                c.cooldown = self.config.next_cooldown(c.cooldown);
                c.open(self.endpoint, now);
            }
            _ => {}
        }
    }

    /// The call ended without telling us anything about upstream health.
    pub fn release(mut self) {
        self.settled = true;
        self.free_probe();
    }

    fn free_probe(&self) {
        if self.probe {
            let mut c = self.cell.lock();
            if c.state == CircuitState::HalfOpen {
                c.probe_in_flight = false;
            }
        }
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.free_probe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_endpoint_reads_closed() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state(EndpointClass::News), CircuitState::Closed);
        assert!(breaker.snapshot().is_empty());
    }

    #[test]
    fn cooldown_growth_is_capped() {
        let config = BreakerConfig::new()
            .cooldown(Duration::from_secs(10))
            .max_cooldown(Duration::from_secs(25))
            .cooldown_multiplier(2);
        assert_eq!(config.next_cooldown(Duration::from_secs(10)), Duration::from_secs(20));
        assert_eq!(config.next_cooldown(Duration::from_secs(20)), Duration::from_secs(25));
    }

    #[test]
    fn multiplier_of_one_keeps_cooldown() {
        let config = BreakerConfig::new().cooldown_multiplier(1);
        assert_eq!(config.next_cooldown(config.cooldown), config.cooldown);
    }

    #[test]
    fn success_in_closed_clears_failures() {
        let breaker = CircuitBreaker::new(BreakerConfig::new().failure_threshold(3));
        breaker.try_acquire(EndpointClass::Profile).unwrap().failure();
        breaker.try_acquire(EndpointClass::Profile).unwrap().failure();
        assert_eq!(breaker.consecutive_failures(EndpointClass::Profile), 2);
        breaker.try_acquire(EndpointClass::Profile).unwrap().success();
        assert_eq!(breaker.consecutive_failures(EndpointClass::Profile), 0);
    }
}
