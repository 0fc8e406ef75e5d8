//! Bounded pool of reusable upstream connections.
//!
//! At most `max_connections` connections are checked out at once. Borrowers
//! beyond that wait in FIFO order (tokio's semaphore is fair) until one is
//! returned or their deadline passes. Returned connections are parked and
//! handed to the next borrower; parked connections idle for longer than
//! `idle_timeout` are closed instead of reused.
//!
//! The transport itself sits behind the [`Connector`] / [`Connection`]
//! traits. [`HttpConnector`] talks to the Steam Web API; tests plug in
//! scripted connectors.

mod http;

pub use http::{HttpConnector, UpstreamConfig};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::telemetry;
use crate::types::{Payload, UpstreamRequest};
use crate::{HeimdallError, Result};

/// A live transport connection able to carry one request at a time.
#[async_trait]
pub trait Connection: Send {
    /// Perform one upstream call.
    async fn send(&mut self, request: &UpstreamRequest) -> Result<Payload>;
}

/// Opens new [`Connection`]s for the pool.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Whether connections can authenticate to endpoints that need a key.
    fn has_api_key(&self) -> bool {
        true
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections checked out at once. Default: 10.
    pub max_connections: usize,
    /// Parked connections older than this are closed. Default: 90s.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    parked_at: Instant,
}

type IdleQueue = Arc<Mutex<VecDeque<IdleConnection>>>;

/// Pool occupancy for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_connections: usize,
    pub in_use: usize,
    pub idle: usize,
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: IdleQueue,
    config: PoolConfig,
}

impl ConnectionPool {
    /// A capacity of zero is raised to one.
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig) -> Self {
        let max_connections = config.max_connections.max(1);
        Self {
            connector,
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Arc::new(Mutex::new(VecDeque::new())),
            config: PoolConfig {
                max_connections,
                ..config
            },
        }
    }

    /// Borrow a connection, waiting at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        self.acquire_until(Instant::now() + timeout).await
    }

    /// Borrow a connection, waiting until `deadline` at the latest.
    ///
    /// Fails with [`HeimdallError::PoolTimeout`] if no slot frees in time.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<PooledConnection> {
        let started = Instant::now();
        let permit = tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| HeimdallError::PoolTimeout(started.elapsed()))?
            .map_err(|_| HeimdallError::Configuration("connection pool closed".into()))?;

        let reused = {
            let mut idle = self.idle.lock();
            Self::evict_expired(&mut idle, self.config.idle_timeout);
            idle.pop_back()
        };
        let conn = match reused {
            Some(parked) => parked.conn,
            None => {
                let conn = tokio::time::timeout_at(deadline, self.connector.connect())
                    .await
                    .map_err(|_| HeimdallError::AttemptTimedOut(started.elapsed()))??;
                metrics::counter!(telemetry::POOL_CONNECTIONS_OPENED_TOTAL).increment(1);
                debug!("opened upstream connection");
                conn
            }
        };

        Ok(PooledConnection {
            conn: Some(conn),
            idle: self.idle.clone(),
            discard: false,
            _permit: permit,
        })
    }

    /// Close parked connections that sat idle past the timeout.
    pub fn evict_idle(&self) -> usize {
        Self::evict_expired(&mut self.idle.lock(), self.config.idle_timeout)
    }

    fn evict_expired(idle: &mut VecDeque<IdleConnection>, timeout: Duration) -> usize {
        let before = idle.len();
        idle.retain(|c| c.parked_at.elapsed() <= timeout);
        before - idle.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn in_use(&self) -> usize {
        self.config.max_connections - self.permits.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.config.max_connections
    }

    pub fn has_api_key(&self) -> bool {
        self.connector.has_api_key()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: self.max_connections(),
            in_use: self.in_use(),
            idle: self.idle_count(),
        }
    }
}

/// A borrowed connection. Dropping it returns the connection to the pool
/// unless it was discarded.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    idle: IdleQueue,
    discard: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Send one request. A transport-level failure poisons the connection.
    pub async fn send(&mut self, request: &UpstreamRequest) -> Result<Payload> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(HeimdallError::Http("connection already released".into()));
        };
        let result = conn.send(request).await;
        if matches!(
            result,
            Err(HeimdallError::Http(_) | HeimdallError::AttemptTimedOut(_))
        ) {
            self.discard = true;
        }
        result
    }

    /// Close the connection instead of returning it.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("released", &self.conn.is_none())
            .field("discard", &self.discard)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take()
            && !self.discard
        {
            self.idle.lock().push_back(IdleConnection {
                conn,
                parked_at: Instant::now(),
            });
        }
        // The permit drops after this, so a waiter never sees a free slot
        // before the connection is parked.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Connection for Echo {
        async fn send(&mut self, _request: &UpstreamRequest) -> Result<Payload> {
            Ok(Payload::from("{}"))
        }
    }

    struct EchoConnector;

    #[async_trait]
    impl Connector for EchoConnector {
        async fn connect(&self) -> Result<Box<dyn Connection>> {
            Ok(Box::new(Echo))
        }
    }

    #[tokio::test]
    async fn zero_capacity_is_raised_to_one() {
        let pool = ConnectionPool::new(Arc::new(EchoConnector), PoolConfig::new().max_connections(0));
        assert_eq!(pool.max_connections(), 1);
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.in_use(), 1);
        drop(conn);
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn debug_shows_connection_state() {
        let pool = ConnectionPool::new(Arc::new(EchoConnector), PoolConfig::default());
        let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        conn.discard();
        let rendered = format!("{conn:?}");
        assert!(rendered.contains("released: false"));
        assert!(rendered.contains("discard: true"));
    }

    #[tokio::test]
    async fn discarded_connection_is_not_parked() {
        let pool = ConnectionPool::new(Arc::new(EchoConnector), PoolConfig::default());
        let mut conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.idle_count(), 0);
    }
}
