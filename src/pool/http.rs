//! Steam Web API transport over reqwest.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::IgnoredAny;

use super::{Connection, Connector};
use crate::types::{Host, Payload, UpstreamRequest};
use crate::{HeimdallError, Result};

/// Default base URL of the Steam Web API.
pub const DEFAULT_API_BASE: &str = "https://api.steampowered.com";

/// Default base URL of the Steam Store API.
pub const DEFAULT_STORE_BASE: &str = "https://store.steampowered.com";

const DEFAULT_USER_AGENT: &str = concat!("heimdall/", env!("CARGO_PKG_VERSION"));

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to reach the upstream hosts.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub api_base: String,
    pub store_base: String,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            store_base: DEFAULT_STORE_BASE.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl UpstreamConfig {
    /// Point both hosts at one base URL (for testing with wiremock).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            api_base: base_url.clone(),
            store_base: base_url,
            ..Self::default()
        }
    }

    fn base_for(&self, host: Host) -> &str {
        match host {
            Host::Api => &self.api_base,
            Host::Store => &self.store_base,
        }
    }
}

/// Opens [`HttpConnection`]s to the Steam hosts.
#[derive(Clone)]
pub struct HttpConnector {
    upstream: UpstreamConfig,
    api_key: Option<String>,
}

impl HttpConnector {
    pub fn new(upstream: UpstreamConfig, api_key: Option<String>) -> Self {
        Self { upstream, api_key }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let http = Client::builder()
            .user_agent(&self.upstream.user_agent)
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| HeimdallError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Box::new(HttpConnection {
            http,
            upstream: self.upstream.clone(),
            api_key: self.api_key.clone(),
        }))
    }

    fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }
}

/// One keep-alive HTTP client slot.
pub struct HttpConnection {
    http: Client,
    upstream: UpstreamConfig,
    api_key: Option<String>,
}

impl HttpConnection {
    fn url(&self, request: &UpstreamRequest) -> String {
        let base = self.upstream.base_for(request.endpoint.host());
        format!("{}/{}", base.trim_end_matches('/'), request.endpoint.path())
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(&mut self, request: &UpstreamRequest) -> Result<Payload> {
        let mut query = request.query.clone();
        if request.endpoint.requires_key() {
            let key = self.api_key.as_deref().ok_or_else(|| {
                HeimdallError::Configuration(format!(
                    "endpoint {} requires an API key",
                    request.endpoint
                ))
            })?;
            query.push(("key".to_string(), key.to_string()));
        }

        let response = self.http.get(self.url(request)).query(&query).send().await?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            let message = match body.trim() {
                "" => status.canonical_reason().unwrap_or("unknown status").to_string(),
                text => text.chars().take(200).collect(),
            };
            return Err(HeimdallError::Api {
                status: status.as_u16(),
                message,
                retry_after,
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice::<IgnoredAny>(&body)?;
        Ok(Payload::new(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointClass, Parameters, RequestDescriptor};

    #[test]
    fn url_joins_host_and_path() {
        let conn = HttpConnection {
            http: Client::new(),
            upstream: UpstreamConfig::with_base_url("http://localhost:9000/"),
            api_key: None,
        };
        let request = RequestDescriptor::new(
            EndpointClass::PlayerCount,
            Parameters::new().with("appid", "440"),
        )
        .upstream_request();
        assert_eq!(
            conn.url(&request),
            format!("http://localhost:9000/{}", EndpointClass::PlayerCount.path())
        );
    }

    #[test]
    fn default_hosts() {
        let upstream = UpstreamConfig::default();
        assert_eq!(upstream.base_for(Host::Api), DEFAULT_API_BASE);
        assert_eq!(upstream.base_for(Host::Store), DEFAULT_STORE_BASE);
    }
}
