//! Heimdall - cached, rate-limited, circuit-broken access to the Steam Web API
//!
//! Every call goes through one [`RequestExecutor`], which composes:
//!
//! - a bounded LRU response cache with per-entry TTL,
//! - single-flight deduplication of concurrent identical requests,
//! - a per-endpoint-class circuit breaker,
//! - a sliding-window rate limiter per caller (or global, per endpoint),
//! - a bounded connection pool and retry with exponential backoff.
//!
//! Cache hits bypass admission control entirely and cost no budget.
//!
//! # Example
//!
//! ```rust,no_run
//! use heimdall::Heimdall;
//!
//! #[tokio::main]
//! async fn main() -> heimdall::Result<()> {
//!     let steam = Heimdall::builder()
//!         .api_key("YOUR-STEAM-WEB-API-KEY")
//!         .build()?;
//!
//!     let players = steam.player_count(440, "discord:1234").await?;
//!     println!("TF2 players online: {players:?}");
//!     Ok(())
//! }
//! ```
//!
//! # Configuration file
//!
//! ```rust,no_run
//! use heimdall::{Config, HeimdallBuilder, Secrets};
//!
//! # fn main() -> heimdall::Result<()> {
//! let config = Config::load(None)?;
//! let secrets = Secrets::load()?;
//! let steam = HeimdallBuilder::from_config(&config, &secrets).build()?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod rate_limit;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use breaker::{BreakerConfig, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use cache::{CacheConfig, CacheStats, ResponseCache};
pub use config::{Config, Secrets};
pub use error::{HeimdallError, Result};
pub use gateway::{
    AdminHandle, EndpointPolicy, ExecutorStats, Heimdall, HeimdallBuilder, RequestExecutor,
    RetryPolicy,
};
pub use pool::{
    Connection, ConnectionPool, Connector, HttpConnector, PoolConfig, PoolStatus,
    PooledConnection, UpstreamConfig,
};
pub use rate_limit::{GLOBAL_IDENTITY, RateLimitConfig, RateLimitScope, RateLimiter, WindowSnapshot};

// Re-export all types
pub use types::{
    EndpointClass, Host, ParamKind, ParamSpec, Parameters, Payload, RequestDescriptor,
    UpstreamRequest,
};
