//! Configuration loading.
//!
//! Configuration is loaded from TOML with the following resolution order:
//! 1. `--config <path>` (CLI flag; must exist)
//! 2. `~/.heimdall/config.toml` (user)
//! 3. `/etc/heimdall/config.toml` (system)
//! 4. built-in defaults
//!
//! `HEIMDALL_*` environment variables override individual values after the
//! file is read.
//!
//! The Steam API key is loaded separately with mandatory permission checks:
//! 1. `~/.heimdall/secrets.toml` (user, must be 0600)
//! 2. `/etc/heimdall/secrets.toml` (system, must be 0600)
//! 3. `STEAM_API_KEY` environment variable

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::cache::CacheConfig;
use crate::gateway::{EndpointPolicy, RetryPolicy};
use crate::pool::{PoolConfig, UpstreamConfig};
use crate::rate_limit::{RateLimitConfig, RateLimitScope};
use crate::types::EndpointClass;
use crate::{HeimdallError, Result};

const API_KEY_ENV_VAR: &str = "STEAM_API_KEY";

/// Heimdall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub circuit_breaker: BreakerSection,
    #[serde(default)]
    pub connection_pool: PoolSection,
    #[serde(default)]
    pub request: RequestSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
}

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// Maximum number of cached responses (default: 1000).
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
    /// TTL for endpoint classes without their own (default: 300).
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: u64,
    /// Per-endpoint TTL overrides, keyed by endpoint name.
    #[serde(default)]
    pub ttl_secs: HashMap<String, u64>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: default_cache_size(),
            default_ttl_secs: default_ttl(),
            ttl_secs: HashMap::new(),
        }
    }
}

fn default_cache_size() -> usize {
    1000
}

fn default_ttl() -> u64 {
    300
}

/// Built-in TTLs for endpoints whose data ages unusually fast or slow.
fn builtin_ttl_secs(endpoint: EndpointClass) -> Option<u64> {
    match endpoint {
        EndpointClass::Profile => Some(300),
        EndpointClass::GameDetails => Some(3600),
        EndpointClass::PlayerCount => Some(120),
        _ => None,
    }
}

impl CacheSection {
    /// Effective TTL: configured override, then built-in, then default.
    pub fn ttl_for(&self, endpoint: EndpointClass) -> Duration {
        let secs = self
            .ttl_secs
            .get(endpoint.as_str())
            .copied()
            .or_else(|| builtin_ttl_secs(endpoint))
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

/// Caller rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSection {
    /// Requests admitted per window (default: 15).
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
    /// Window length in seconds (default: 60).
    #[serde(default = "default_window")]
    pub window_secs: u64,
    /// Per-endpoint budget scope; unlisted endpoints are per caller.
    #[serde(default)]
    pub scopes: HashMap<String, RateLimitScope>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window(),
            scopes: HashMap::new(),
        }
    }
}

fn default_max_requests() -> usize {
    15
}

fn default_window() -> u64 {
    60
}

impl RateLimitSection {
    pub fn scope_for(&self, endpoint: EndpointClass) -> RateLimitScope {
        self.scopes
            .get(endpoint.as_str())
            .copied()
            .unwrap_or_default()
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSection {
    /// Consecutive failures that open the breaker (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds spent open before probing (default: 60).
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Cap for the grown cooldown (default: 600).
    #[serde(default = "default_max_cooldown")]
    pub max_cooldown_secs: u64,
    /// Cooldown growth per failed probe (default: 2).
    #[serde(default = "default_cooldown_multiplier")]
    pub cooldown_multiplier: u32,
    /// Failures further apart than this restart the count.
    #[serde(default)]
    pub failure_window_secs: Option<u64>,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
            max_cooldown_secs: default_max_cooldown(),
            cooldown_multiplier: default_cooldown_multiplier(),
            failure_window_secs: None,
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    60
}

fn default_max_cooldown() -> u64 {
    600
}

fn default_cooldown_multiplier() -> u32 {
    2
}

/// Connection pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Maximum concurrent upstream connections (default: 10).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds a parked connection may idle (default: 90).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

fn default_max_connections() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    90
}

/// Per-request defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSection {
    /// Attempt timeout in seconds (default: 30).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retries after the first attempt (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
}

impl Default for RequestSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    1000
}

fn default_retry_max_delay() -> u64 {
    30_000
}

/// Upstream hosts. Unset values use the public Steam endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub store_base: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Environment variables that override single config values.
const ENV_OVERRIDES: &[&str] = &[
    "HEIMDALL_CACHE_MAX_SIZE",
    "HEIMDALL_CACHE_DEFAULT_TTL",
    "HEIMDALL_RATE_LIMIT_MAX_REQUESTS",
    "HEIMDALL_RATE_LIMIT_WINDOW",
    "HEIMDALL_REQUEST_TIMEOUT",
    "HEIMDALL_REQUEST_MAX_RETRIES",
];

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        HeimdallError::Configuration(format!("Invalid value for {name}: {value:?}"))
    })
}

impl Config {
    /// Load configuration from the standard locations, apply environment
    /// overrides and validate.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.heimdall/config.toml`
    /// 3. `/etc/heimdall/config.toml`
    /// 4. Defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match Self::resolve_config_path(explicit_path)? {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse one config file, without overrides or validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path. `None` means run on defaults.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(Some(path.to_path_buf()));
            }
            return Err(HeimdallError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".heimdall").join("config.toml");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/heimdall/config.toml");
        if system_config.exists() {
            return Ok(Some(system_config));
        }

        Ok(None)
    }

    /// Apply `HEIMDALL_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any name → value lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for &name in ENV_OVERRIDES {
            let Some(value) = lookup(name) else {
                continue;
            };
            match name {
                "HEIMDALL_CACHE_MAX_SIZE" => self.cache.max_size = parse_env(name, &value)?,
                "HEIMDALL_CACHE_DEFAULT_TTL" => {
                    self.cache.default_ttl_secs = parse_env(name, &value)?
                }
                "HEIMDALL_RATE_LIMIT_MAX_REQUESTS" => {
                    self.rate_limit.max_requests = parse_env(name, &value)?
                }
                "HEIMDALL_RATE_LIMIT_WINDOW" => {
                    self.rate_limit.window_secs = parse_env(name, &value)?
                }
                "HEIMDALL_REQUEST_TIMEOUT" => self.request.timeout_secs = parse_env(name, &value)?,
                "HEIMDALL_REQUEST_MAX_RETRIES" => {
                    self.request.max_retries = parse_env(name, &value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject values that cannot produce a working executor.
    pub fn validate(&self) -> Result<()> {
        let checks: &[(bool, &str)] = &[
            (self.cache.max_size == 0, "cache.max_size must be positive"),
            (self.rate_limit.max_requests == 0, "rate_limit.max_requests must be positive"),
            (self.rate_limit.window_secs == 0, "rate_limit.window_secs must be positive"),
            (
                self.circuit_breaker.failure_threshold == 0,
                "circuit_breaker.failure_threshold must be positive",
            ),
            (
                self.circuit_breaker.cooldown_multiplier == 0,
                "circuit_breaker.cooldown_multiplier must be positive",
            ),
            (
                self.circuit_breaker.max_cooldown_secs < self.circuit_breaker.cooldown_secs,
                "circuit_breaker.max_cooldown_secs must not be below cooldown_secs",
            ),
            (
                self.connection_pool.max_connections == 0,
                "connection_pool.max_connections must be positive",
            ),
            (self.request.timeout_secs == 0, "request.timeout_secs must be positive"),
        ];
        if let Some((_, message)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(HeimdallError::Configuration((*message).to_string()));
        }

        let endpoints = self
            .cache
            .ttl_secs
            .keys()
            .map(|k| ("cache.ttl_secs", k))
            .chain(self.rate_limit.scopes.keys().map(|k| ("rate_limit.scopes", k)));
        for (section, name) in endpoints {
            EndpointClass::from_str(name).map_err(|_| {
                HeimdallError::Configuration(format!("{section}: unknown endpoint '{name}'"))
            })?;
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new().max_entries(self.cache.max_size)
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new()
            .max_requests(self.rate_limit.max_requests)
            .window(Duration::from_secs(self.rate_limit.window_secs))
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        let section = &self.circuit_breaker;
        let config = BreakerConfig::new()
            .failure_threshold(section.failure_threshold)
            .cooldown(Duration::from_secs(section.cooldown_secs))
            .max_cooldown(Duration::from_secs(section.max_cooldown_secs))
            .cooldown_multiplier(section.cooldown_multiplier);
        match section.failure_window_secs {
            Some(secs) => config.failure_window(Duration::from_secs(secs)),
            None => config,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new()
            .max_connections(self.connection_pool.max_connections)
            .idle_timeout(Duration::from_secs(self.connection_pool.idle_timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .base_delay(Duration::from_millis(self.request.retry_base_delay_ms))
            .max_delay(Duration::from_millis(self.request.retry_max_delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request.timeout_secs)
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        let defaults = UpstreamConfig::default();
        UpstreamConfig {
            api_base: self.upstream.api_base.clone().unwrap_or(defaults.api_base),
            store_base: self.upstream.store_base.clone().unwrap_or(defaults.store_base),
            user_agent: self.upstream.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }

    /// Effective TTL and limiter scope of one endpoint class.
    pub fn endpoint_policy(&self, endpoint: EndpointClass) -> EndpointPolicy {
        EndpointPolicy {
            ttl: self.cache.ttl_for(endpoint),
            scope: self.rate_limit.scope_for(endpoint),
        }
    }
}

/// Secrets (the Steam Web API key).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Secrets {
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Secrets {
    /// Load secrets from the standard locations with permission checks.
    ///
    /// Resolution order:
    /// 1. `~/.heimdall/secrets.toml` (if exists, must be 0600)
    /// 2. `/etc/heimdall/secrets.toml` (if exists, must be 0600)
    ///
    /// Returns empty secrets if no file exists (the key may come from the
    /// environment).
    pub fn load() -> Result<Self> {
        if let Some(home) = dirs::home_dir() {
            let user_secrets = home.join(".heimdall").join("secrets.toml");
            if user_secrets.exists() {
                return Self::from_file(&user_secrets);
            }
        }

        let system_secrets = PathBuf::from("/etc/heimdall/secrets.toml");
        if system_secrets.exists() {
            return Self::from_file(&system_secrets);
        }

        Ok(Secrets::default())
    }

    /// Load one secrets file after checking its permissions.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::check_permissions(path)?;
        let content = fs::read_to_string(path).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to read secrets file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to parse secrets file {path:?}: {e}"))
        })
    }

    /// Check that the secrets file has secure permissions (0600 or 0400).
    #[cfg(unix)]
    fn check_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).map_err(|e| {
            HeimdallError::Configuration(format!("Failed to stat secrets file {path:?}: {e}"))
        })?;

        let mode = metadata.permissions().mode();
        // Reject if group or other bits are set
        if mode & 0o077 != 0 {
            return Err(HeimdallError::Configuration(format!(
                "Secrets file {path:?} has insecure permissions {:o}. Must be 0600 or 0400.",
                mode & 0o777
            )));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn check_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }

    /// The API key, falling back to `STEAM_API_KEY`.
    pub fn steam_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV_VAR).ok())
            .filter(|k| !k.trim().is_empty())
    }
}
