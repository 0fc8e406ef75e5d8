//! Caching subsystem.
//!
//! [`ResponseCache`] holds raw upstream payloads for the
//! [`RequestExecutor`](crate::RequestExecutor). A hit bypasses the circuit
//! breaker, the rate limiter and the connection pool entirely, so cached
//! answers never consume a caller's request budget.

pub mod response;

pub use response::{CacheConfig, CacheStats, ResponseCache};
