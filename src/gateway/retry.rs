//! Retry policy and the shared retry loop.
//!
//! Transient failures (as classified by [`HeimdallError::is_transient()`])
//! are retried with exponential backoff; an upstream `Retry-After` hint
//! replaces the computed delay. Permanent failures end the loop at once.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::telemetry;
use crate::types::EndpointClass;
use crate::HeimdallError;

/// Backoff settings for retrying transient upstream failures.
///
/// How many retries a fetch gets is a property of the request
/// ([`RequestDescriptor::max_retries`](crate::RequestDescriptor)); the
/// policy only shapes the delays between them.
///
/// ```rust
/// # use heimdall::RetryPolicy;
/// # use std::time::Duration;
/// let policy = RetryPolicy::new()
///     .base_delay(Duration::from_millis(200))
///     .jitter(false);
/// assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(800));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry. Default: 1s.
    pub base_delay: Duration,
    /// Cap on exponential growth. Default: 30s.
    pub max_delay: Duration,
    /// Add up to 10% random delay on top of the backoff. Default: true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Backoff before retry number `attempt + 1` (0-indexed), without jitter.
    ///
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }

    /// The delay actually slept: the upstream hint if there is one,
    /// otherwise backoff plus jitter. Never more than `max_delay`.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let delay = self.delay_for_attempt(attempt);
        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=0.1);
            delay + delay.mul_f64(extra)
        } else {
            delay
        }
    }
}

/// The last error of a fetch that gave up, and how many attempts it made.
#[derive(Debug)]
pub(crate) struct Exhausted {
    pub last: HeimdallError,
    pub attempts: u32,
}

impl Exhausted {
    /// The caller-facing error.
    pub fn into_error(self) -> HeimdallError {
        self.last.into_terminal(self.attempts)
    }
}

/// Run `f` up to `max_retries + 1` times.
pub(crate) async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    max_retries: u32,
    endpoint: EndpointClass,
    mut f: F,
) -> std::result::Result<T, Exhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = crate::Result<T>>,
{
    let max_attempts = max_retries.saturating_add(1);
    let mut attempt = 0;
    loop {
        let err = match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        attempt += 1;
        if !err.is_transient() || attempt >= max_attempts {
            return Err(Exhausted {
                last: err,
                attempts: attempt,
            });
        }

        let delay = policy.effective_delay(attempt - 1, err.retry_after());
        metrics::counter!(telemetry::RETRIES_TOTAL, "endpoint" => endpoint.as_str()).increment(1);
        warn!(
            endpoint = endpoint.as_str(),
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        tokio::time::sleep(delay).await;
    }
}
