//! Tests for [`RequestExecutor`]: caching, single-flight, admission control
//! and retry, against a scripted in-memory upstream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use heimdall::{
    BreakerConfig, CircuitState, Connection, Connector, EndpointClass, Heimdall, HeimdallBuilder,
    HeimdallError, Parameters, Payload, RateLimitConfig, RateLimitScope, RequestDescriptor,
    Result, RetryPolicy, UpstreamRequest,
};

const STEAM_ID: &str = "76561197960435530";

// ============================================================================
// Scripted upstream
// ============================================================================

type Behaviour = Box<dyn FnMut(u32, &UpstreamRequest) -> Result<Payload> + Send>;

/// Upstream that counts calls and answers from a closure.
struct Upstream {
    calls: AtomicU32,
    delay: Duration,
    behaviour: Mutex<Behaviour>,
}

impl Upstream {
    fn new(behaviour: impl FnMut(u32, &UpstreamRequest) -> Result<Payload> + Send + 'static) -> Arc<Self> {
        Self::with_delay(Duration::ZERO, behaviour)
    }

    fn with_delay(
        delay: Duration,
        behaviour: impl FnMut(u32, &UpstreamRequest) -> Result<Payload> + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
            behaviour: Mutex::new(Box::new(behaviour)),
        })
    }

    fn ok(body: &'static str) -> Arc<Self> {
        Self::new(move |_, _| Ok(Payload::from(body)))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn set(&self, behaviour: impl FnMut(u32, &UpstreamRequest) -> Result<Payload> + Send + 'static) {
        *self.behaviour.lock() = Box::new(behaviour);
    }
}

struct ScriptedConnection(Arc<Upstream>);

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&mut self, request: &UpstreamRequest) -> Result<Payload> {
        let n = self.0.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.0.delay.is_zero() {
            tokio::time::sleep(self.0.delay).await;
        }
        let mut behaviour = self.0.behaviour.lock();
        (*behaviour)(n, request)
    }
}

struct ScriptedConnector(Arc<Upstream>);

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(ScriptedConnection(self.0.clone())))
    }
}

fn builder(upstream: &Arc<Upstream>) -> HeimdallBuilder {
    Heimdall::builder()
        .connector(Arc::new(ScriptedConnector(upstream.clone())))
        .retry(RetryPolicy::new().base_delay(Duration::from_millis(100)).jitter(false))
}

fn api_error(status: u16) -> HeimdallError {
    HeimdallError::Api {
        status,
        message: "upstream said no".into(),
        retry_after: None,
    }
}

fn player_count(app_id: u32) -> Parameters {
    Parameters::new().with("appid", app_id.to_string())
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn profile_ttl_scenario() {
    let upstream = Upstream::ok(r#"{"response":{"players":[{"personaname":"gabe"}]}}"#);
    let steam = builder(&upstream)
        .ttl(EndpointClass::Profile, Duration::from_secs(300))
        .build()
        .unwrap();

    // t = 0: miss
    let first = steam.profile(STEAM_ID, "u1").await.unwrap();
    assert_eq!(first.unwrap()["personaname"], "gabe");
    assert_eq!(upstream.calls(), 1);

    // t = 100: hit
    tokio::time::advance(Duration::from_secs(100)).await;
    steam.profile(STEAM_ID, "u1").await.unwrap();
    assert_eq!(upstream.calls(), 1);

    // t = 301: expired
    tokio::time::advance(Duration::from_secs(201)).await;
    steam.profile(STEAM_ID, "u1").await.unwrap();
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn repeated_fetches_are_byte_identical() {
    let upstream = Upstream::new(|n, _| Ok(Payload::from(format!(r#"{{"call":{n}}}"#).into_bytes())));
    let steam = builder(&upstream).build().unwrap();
    let descriptor = steam.descriptor(EndpointClass::News, player_count(440));

    let a = steam.fetch(&descriptor, "u1").await.unwrap();
    let b = steam.fetch(&descriptor, "u2").await.unwrap();
    assert_eq!(a.as_bytes(), b.as_bytes());
    assert_eq!(upstream.calls(), 1);

    let stats = steam.stats();
    assert_eq!(stats.requests, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
}

#[tokio::test(start_paused = true)]
async fn cache_hit_does_not_consume_rate_limit() {
    let upstream = Upstream::ok(r#"{"response":{"player_count":7}}"#);
    let steam = builder(&upstream)
        .rate_limit(RateLimitConfig::new().max_requests(1))
        .build()
        .unwrap();

    for _ in 0..5 {
        assert_eq!(steam.player_count(440, "u1").await.unwrap(), Some(7));
    }
    assert_eq!(upstream.calls(), 1);
    assert_eq!(steam.admin().rate_limit_occupancy("u1"), 1);
}

// ============================================================================
// Single-flight
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_share_one_upstream_call() {
    let upstream = Upstream::with_delay(Duration::from_millis(50), |_, _| {
        Ok(Payload::from(r#"{"response":{"player_count":42}}"#))
    });
    let steam = builder(&upstream).build().unwrap();
    let descriptor = steam.descriptor(EndpointClass::PlayerCount, player_count(570));

    let fetches = (0..10).map(|i| {
        let steam = steam.clone();
        let descriptor = descriptor.clone();
        async move { steam.fetch(&descriptor, &format!("user-{i}")).await }
    });
    let results = futures_util::future::join_all(fetches).await;

    assert_eq!(upstream.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), first);
    }
    assert_eq!(steam.stats().single_flight_joins, 9);
    assert_eq!(steam.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn waiters_share_the_leaders_error() {
    let upstream = Upstream::with_delay(Duration::from_millis(50), |_, _| Err(api_error(404)));
    let steam = builder(&upstream).build().unwrap();
    let descriptor = steam.descriptor(EndpointClass::GameSchema, player_count(1));

    let (a, b) = tokio::join!(steam.fetch(&descriptor, "u1"), steam.fetch(&descriptor, "u2"));
    assert_eq!(upstream.calls(), 1);
    for result in [a, b] {
        assert!(matches!(
            result,
            Err(HeimdallError::UpstreamError { status: Some(404), .. })
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn caller_deadline_does_not_cancel_the_fetch() {
    let upstream = Upstream::with_delay(Duration::from_secs(5), |_, _| Ok(Payload::from("{}")));
    let steam = builder(&upstream).build().unwrap();
    let descriptor = steam.descriptor(EndpointClass::Featured, Parameters::new());

    let result = steam
        .fetch_within(&descriptor, "impatient", Instant::now() + Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(HeimdallError::Timeout { attempts: 0 })));

    // The leader keeps running and fills the cache.
    tokio::time::sleep(Duration::from_secs(5)).await;
    steam.fetch(&descriptor, "patient").await.unwrap();
    assert_eq!(upstream.calls(), 1);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalid_parameters_never_reach_upstream() {
    let upstream = Upstream::ok("{}");
    let steam = builder(&upstream).build().unwrap();

    let missing = steam.request(EndpointClass::Achievements, Parameters::new().with("steamid", STEAM_ID), "u1");
    assert!(matches!(missing.await, Err(HeimdallError::InvalidInput(_))));

    let malformed = steam.request(EndpointClass::Friends, Parameters::new().with("steamid", "gabe"), "u1");
    assert!(matches!(malformed.await, Err(HeimdallError::InvalidInput(_))));

    assert_eq!(upstream.calls(), 0);
    assert_eq!(steam.stats().requests, 0);
}

// ============================================================================
// Rate limiting
// ============================================================================

#[tokio::test(start_paused = true)]
async fn caller_over_budget_is_rate_limited() {
    let upstream = Upstream::ok("{}");
    let steam = builder(&upstream)
        .rate_limit(RateLimitConfig::new().max_requests(2).window(Duration::from_secs(60)))
        .build()
        .unwrap();

    steam.request(EndpointClass::News, player_count(1), "u1").await.unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;
    steam.request(EndpointClass::News, player_count(2), "u1").await.unwrap();

    let err = steam
        .request(EndpointClass::News, player_count(3), "u1")
        .await
        .unwrap_err();
    match err {
        HeimdallError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Duration::from_secs(50) + Duration::from_millis(1));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
    assert_eq!(upstream.calls(), 2);

    // Other callers have their own budget.
    steam.request(EndpointClass::News, player_count(3), "u2").await.unwrap();
    assert_eq!(upstream.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn global_scope_shares_one_budget() {
    let upstream = Upstream::ok("{}");
    let steam = builder(&upstream)
        .rate_limit(RateLimitConfig::new().max_requests(1))
        .scope(EndpointClass::PlayerCount, RateLimitScope::Global)
        .build()
        .unwrap();
    assert_eq!(steam.policy(EndpointClass::PlayerCount).scope, RateLimitScope::Global);

    steam.request(EndpointClass::PlayerCount, player_count(1), "u1").await.unwrap();
    let err = steam
        .request(EndpointClass::PlayerCount, player_count(2), "u2")
        .await
        .unwrap_err();
    assert!(matches!(err, HeimdallError::RateLimited { .. }));
    assert_eq!(steam.admin().rate_limit_occupancy(heimdall::GLOBAL_IDENTITY), 1);
}

// ============================================================================
// Retry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried() {
    let upstream = Upstream::new(|n, _| match n {
        1 | 2 => Err(api_error(503)),
        _ => Ok(Payload::from("{}")),
    });
    let steam = builder(&upstream).max_retries(3).build().unwrap();

    steam.featured("u1").await.unwrap();
    assert_eq!(upstream.calls(), 3);
    assert_eq!(steam.admin().breaker_state(EndpointClass::Featured), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_not_retried_or_counted() {
    let upstream = Upstream::new(|_, _| Err(api_error(403)));
    let steam = builder(&upstream).build().unwrap();

    let err = steam.friends(STEAM_ID, "u1").await.unwrap_err();
    assert!(matches!(err, HeimdallError::UpstreamError { status: Some(403), .. }));
    assert_eq!(upstream.calls(), 1);

    let snapshots = steam.admin().breaker_states();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn too_many_requests_honours_retry_after() {
    let upstream = Upstream::new(|n, _| match n {
        1 => Err(HeimdallError::Api {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(7)),
        }),
        _ => Ok(Payload::from("{}")),
    });
    let steam = builder(&upstream).build().unwrap();

    let started = Instant::now();
    steam.badges(STEAM_ID, "u1").await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(7));
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn long_retry_after_is_capped_by_policy() {
    let upstream = Upstream::new(|n, _| match n {
        1 => Err(HeimdallError::Api {
            status: 429,
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(3600)),
        }),
        _ => Ok(Payload::from("{}")),
    });
    let steam = builder(&upstream)
        .retry(
            RetryPolicy::new()
                .max_delay(Duration::from_secs(30))
                .jitter(false),
        )
        .build()
        .unwrap();

    let started = Instant::now();
    steam.badges(STEAM_ID, "u1").await.unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31), "{waited:?}");
    assert_eq!(upstream.calls(), 2);
    assert_eq!(steam.admin().breaker_state(EndpointClass::Badges), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn slow_upstream_times_out_after_every_attempt() {
    let upstream = Upstream::with_delay(Duration::from_secs(10), |_, _| Ok(Payload::from("{}")));
    let steam = builder(&upstream)
        .request_timeout(Duration::from_secs(1))
        .max_retries(1)
        .build()
        .unwrap();

    let err = steam.player_level(STEAM_ID, "u1").await.unwrap_err();
    assert!(matches!(err, HeimdallError::Timeout { attempts: 2 }));
    assert_eq!(upstream.calls(), 2);
    // Timed-out connections are not reused.
    assert_eq!(steam.admin().pool_status().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_is_not_retried() {
    let upstream = Upstream::new(|_, _| Err(HeimdallError::Malformed("expected value".into())));
    let steam = builder(&upstream).build().unwrap();

    let err = steam.owned_games(STEAM_ID, "u1").await.unwrap_err();
    assert!(matches!(err, HeimdallError::UpstreamError { status: None, .. }));
    assert_eq!(upstream.calls(), 1);
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[tokio::test(start_paused = true)]
async fn open_breaker_fails_fast_then_recovers() {
    let upstream = Upstream::new(|_, _| Err(api_error(500)));
    let steam = builder(&upstream)
        .max_retries(0)
        .breaker(
            BreakerConfig::new()
                .failure_threshold(3)
                .cooldown(Duration::from_secs(60)),
        )
        .rate_limit(RateLimitConfig::new().max_requests(100))
        .build()
        .unwrap();

    for _ in 0..3 {
        let err = steam.game_schema(440, "u1").await.unwrap_err();
        assert!(matches!(err, HeimdallError::UpstreamError { status: Some(500), .. }));
    }
    assert_eq!(steam.admin().breaker_state(EndpointClass::GameSchema), CircuitState::Open);

    let err = steam.game_schema(440, "u1").await.unwrap_err();
    match err {
        HeimdallError::UpstreamUnavailable { endpoint, retry_after } => {
            assert_eq!(endpoint, EndpointClass::GameSchema);
            assert_eq!(retry_after, Duration::from_secs(60));
        }
        other => panic!("expected UpstreamUnavailable, got {other:?}"),
    }
    assert_eq!(upstream.calls(), 3);

    // Other endpoint classes are unaffected.
    upstream.set(|_, _| Ok(Payload::from("{}")));
    steam.news(440, None, "u1").await.unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    steam.game_schema(440, "u1").await.unwrap();
    assert_eq!(steam.admin().breaker_state(EndpointClass::GameSchema), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn admin_reset_closes_breaker() {
    let upstream = Upstream::new(|_, _| Err(HeimdallError::Http("connection refused".into())));
    let steam = builder(&upstream)
        .max_retries(0)
        .breaker(BreakerConfig::new().failure_threshold(1))
        .build()
        .unwrap();

    let err = steam.recent_games(STEAM_ID, Some(3), "u1").await.unwrap_err();
    assert!(matches!(err, HeimdallError::Timeout { attempts: 1 }));
    assert_eq!(steam.admin().breaker_state(EndpointClass::RecentGames), CircuitState::Open);

    steam.admin().reset_breaker(EndpointClass::RecentGames);
    upstream.set(|_, _| Ok(Payload::from("{}")));
    steam.recent_games(STEAM_ID, Some(3), "u1").await.unwrap();
}

// ============================================================================
// Typed wrappers
// ============================================================================

#[tokio::test(start_paused = true)]
async fn typed_wrappers_extract_payload_fields() {
    let upstream = Upstream::new(|_, request| {
        let body = match request.endpoint {
            EndpointClass::PlayerCount => r#"{"response":{"player_count":1234,"result":1}}"#,
            EndpointClass::GameDetails => {
                r#"{"440":{"success":true,"data":{"name":"Team Fortress 2"}}}"#
            }
            EndpointClass::Achievements => r#"{"playerstats":{"gameName":"TF2","success":true}}"#,
            _ => r#"{"response":{}}"#,
        };
        Ok(Payload::from(body))
    });
    let steam = builder(&upstream).build().unwrap();

    assert_eq!(steam.player_count(440, "u1").await.unwrap(), Some(1234));
    let details = steam.game_details(440, "u1").await.unwrap().unwrap();
    assert_eq!(details["name"], "Team Fortress 2");
    let stats = steam.achievements(STEAM_ID, 440, "u1").await.unwrap().unwrap();
    assert_eq!(stats["gameName"], "TF2");
    assert_eq!(steam.profile(STEAM_ID, "u1").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn missing_store_app_is_none() {
    let upstream = Upstream::ok(r#"{"9999999":{"success":false}}"#);
    let steam = builder(&upstream).build().unwrap();
    assert_eq!(steam.game_details(9999999, "u1").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn descriptor_overrides_configured_policy() {
    let upstream = Upstream::ok("{}");
    let steam = builder(&upstream).build().unwrap();
    let descriptor = RequestDescriptor::new(EndpointClass::Featured, Parameters::new())
        .ttl(Duration::from_secs(5));

    steam.fetch(&descriptor, "u1").await.unwrap();
    tokio::time::advance(Duration::from_secs(6)).await;
    steam.fetch(&descriptor, "u1").await.unwrap();
    assert_eq!(upstream.calls(), 2);
}
