// src/api/upstream.rs
//! Market-data provider HTTP client.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;

use super::queue::RequestOptions;
use crate::error::GatewayError;

pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";
pub const USER_AGENT: &str = "StockApp/1.0";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum UpstreamError {
    /// HTTP 429. The only failure the gateway retries.
    #[error("upstream rate limit exceeded")]
    RateLimited,

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream body could not be decoded: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, UpstreamError::RateLimited)
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::Timeout(err.to_string())
        } else if err.is_decode() {
            UpstreamError::Decode(err.to_string())
        } else {
            UpstreamError::Transport(err.to_string())
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::RateLimited => GatewayError::RateLimited("upstream rate limit exceeded".to_string()),
            UpstreamError::Status { status, body } => GatewayError::Upstream { status, message: body },
            UpstreamError::Timeout(msg) => GatewayError::Timeout(msg),
            UpstreamError::Transport(msg) => GatewayError::Network(msg),
            UpstreamError::Decode(msg) => GatewayError::Parse(msg),
        }
    }
}

/// Seam between the gateway and the provider so tests can script responses.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// GETs `endpoint` (path plus query, no credentials) and returns the JSON body.
    async fn get(&self, endpoint: &str, options: &RequestOptions) -> Result<Value, UpstreamError>;
}

/// reqwest client for the Polygon REST API.
#[derive(Debug, Clone)]
pub struct PolygonClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PolygonClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub fn with_defaults(api_key: impl Into<String>) -> Result<Self, GatewayError> {
        Self::new(DEFAULT_BASE_URL, api_key, DEFAULT_TIMEOUT)
    }

    fn full_url(&self, endpoint: &str) -> String {
        let separator = if endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}{}apiKey={}", self.base_url, endpoint, separator, self.api_key)
    }
}

#[async_trait]
impl UpstreamClient for PolygonClient {
    async fn get(&self, endpoint: &str, options: &RequestOptions) -> Result<Value, UpstreamError> {
        debug!("📡 GET {}", endpoint.split('?').next().unwrap_or(endpoint));

        let mut request = self.http.get(self.full_url(endpoint));
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited);
        }
        if !status.is_success() {
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(response.json::<Value>().await?)
    }
}
