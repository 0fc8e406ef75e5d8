//! Sliding-window admission control keyed by caller identity.
//!
//! Each identity owns an ordered window of admission timestamps. A call is
//! admitted iff fewer than `max_requests` timestamps fall within the
//! trailing `window`; rejected calls are not recorded and never wait.
//!
//! Windows live in a sharded map, so the prune-check-record sequence for
//! one identity is atomic while unrelated identities proceed in parallel.
//! Windows that empty out are dropped, and every few hundred admissions a
//! sweep drops windows whose timestamps have all aged out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Identity shared by every caller of a globally limited endpoint class.
pub const GLOBAL_IDENTITY: &str = "*";

/// Admission decisions between opportunistic sweeps of idle windows.
const SWEEP_INTERVAL: u64 = 256;

/// Smallest step past the window edge at which a timestamp has aged out.
const WINDOW_TICK: Duration = Duration::from_millis(1);

/// Whose budget an endpoint class draws from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// Each caller has an independent window.
    #[default]
    PerCaller,
    /// All callers share [`GLOBAL_IDENTITY`]'s window.
    Global,
}

/// Configuration for the rate limiter.
///
/// ```rust
/// # use heimdall::RateLimitConfig;
/// # use std::time::Duration;
/// let config = RateLimitConfig::new()
///     .max_requests(15)
///     .window(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Admissions allowed per window. Default: 15.
    pub max_requests: usize,
    /// Length of the trailing window. Default: 60s.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 15,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }
}

/// Occupancy of one identity's window, for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub identity: String,
    pub occupancy: usize,
    pub next_slot_in: Duration,
}

/// Per-identity sliding-window rate limiter.
pub struct RateLimiter {
    windows: DashMap<String, VecDeque<Instant>>,
    config: RateLimitConfig,
    decisions: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
            decisions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit and record a call for `identity`, or reject it without recording.
    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        let admitted = {
            let mut window = self.windows.entry(identity.to_owned()).or_default();
            self.prune(&mut window, now);
            if window.len() < self.config.max_requests {
                window.push_back(now);
                true
            } else {
                false
            }
        };
        if !admitted {
            debug!(identity, "rate limit exhausted");
        }
        self.windows.remove_if(identity, |_, w| w.is_empty());

        if self.decisions.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge_idle();
        }
        admitted
    }

    /// How long until `identity` would be admitted again. Zero if it would be now.
    pub fn time_until_next_slot(&self, identity: &str) -> Duration {
        let now = Instant::now();
        let Some(mut window) = self.windows.get_mut(identity) else {
            return Duration::ZERO;
        };
        self.prune(&mut window, now);
        self.wait_time(&window, now)
    }

    /// Admissions left for `identity` in the current window.
    pub fn remaining(&self, identity: &str) -> usize {
        self.config.max_requests.saturating_sub(self.occupancy(identity))
    }

    /// Admissions recorded for `identity` within the current window.
    pub fn occupancy(&self, identity: &str) -> usize {
        let now = Instant::now();
        match self.windows.get_mut(identity) {
            Some(mut window) => {
                self.prune(&mut window, now);
                window.len()
            }
            None => 0,
        }
    }

    /// Forget an identity's window. Returns whether one existed.
    pub fn reset(&self, identity: &str) -> bool {
        self.windows.remove(identity).is_some()
    }

    /// Drop windows with no admissions left inside the trailing window.
    pub fn purge_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            self.prune(window, now);
            !window.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Occupancy of every tracked identity, sorted by identity.
    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        let now = Instant::now();
        let mut snapshots: Vec<_> = self
            .windows
            .iter_mut()
            .map(|mut entry| {
                self.prune(entry.value_mut(), now);
                WindowSnapshot {
                    identity: entry.key().clone(),
                    occupancy: entry.value().len(),
                    next_slot_in: self.wait_time(entry.value(), now),
                }
            })
            .filter(|s| s.occupancy > 0)
            .collect();
        snapshots.sort_by(|a, b| a.identity.cmp(&b.identity));
        snapshots
    }

    /// Number of identities currently holding a window.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    // The window is closed at both ends: a timestamp exactly `window` old
    // still counts against the budget.
    fn prune(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.config.window)
        {
            window.pop_front();
        }
    }

    fn wait_time(&self, window: &VecDeque<Instant>, now: Instant) -> Duration {
        if window.len() < self.config.max_requests {
            return Duration::ZERO;
        }
        // The slot frees when the oldest admission that keeps us at the
        // limit ages out.
        let blocking = window.len() - self.config.max_requests;
        window
            .get(blocking)
            .map(|t| (*t + self.config.window + WINDOW_TICK).saturating_duration_since(now))
            .unwrap_or(self.config.window + WINDOW_TICK)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
