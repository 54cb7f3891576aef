use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::types::{HttpRequest, HttpResponse, TransportFailure};
use crate::error::ConfigError;

/// Sends a single HTTP request, without retries.
///
/// The dispatcher owns retry policy; implementations only report what happened.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: &HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportFailure>> + Send;
}

/// Connection-level options for [`ReqwestTransport`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionOptions {
    #[serde(default = "default_connect_timeout_ms", alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_request_timeout_ms", alias = "requestTimeoutMs")]
    pub request_timeout_ms: u64,

    #[serde(default, alias = "userAgent")]
    pub user_agent: Option<String>,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    120_000
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            user_agent: None,
        }
    }
}

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(options: &ConnectionOptions) -> Result<Self, ConfigError> {
        let user_agent = options
            .user_agent
            .clone()
            .unwrap_or_else(|| concat!("taskq/", env!("CARGO_PKG_VERSION")).to_string());
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(options.connect_timeout_ms))
            .timeout(Duration::from_millis(options.request_timeout_ms))
            .user_agent(user_agent)
            .build()
            .map_err(ConfigError::Transport)?;
        Ok(Self { client })
    }

    /// Wraps an already configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportFailure> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            TransportFailure::from_reqwest(request.method.clone(), request.url.as_str(), e)
        })?;

        let status = response.status();
        let body = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) if status.is_success() => {
                return Err(TransportFailure::from_reqwest(
                    request.method.clone(),
                    request.url.as_str(),
                    e,
                ));
            }
            // Error bodies are only read for diagnostics.
            Err(e) => {
                debug!(status = status.as_u16(), error = %e, "discarding unreadable error body");
                Vec::new()
            }
        };

        Ok(HttpResponse {
            status: status.as_u16(),
            body,
        })
    }
}
