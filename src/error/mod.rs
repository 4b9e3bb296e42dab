// src/error/mod.rs
//! Error taxonomy for the gateway and its consumers.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Upstream answered with a non-success status other than 429
    #[error("Upstream Error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Upstream 429, or the requeue cap was exceeded
    #[error("Rate Limited: {0}")]
    RateLimited(String),

    /// Upstream call exceeded its deadline
    #[error("Timeout Error: {0}")]
    Timeout(String),

    /// Connection refused, DNS, TLS and similar transport failures
    #[error("Network Error: {0}")]
    Network(String),

    /// Key-value store errors
    #[error("Cache Error: {0}")]
    Cache(String),

    /// Payload could not be decoded or had an unexpected shape
    #[error("Parse Error: {0}")]
    Parse(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    /// The waiting caller's continuation was dropped or the service stopped
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Parse(format!("JSON serialization/deserialization error: {}", err))
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::Cache(format!("Redis error: {}", err))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            GatewayError::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            GatewayError::Parse(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Config(format!("Anyhow error: {}", err))
    }
}

impl GatewayError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            GatewayError::Upstream { status, .. } => *status >= 500,
            GatewayError::RateLimited(_) => true,
            GatewayError::Timeout(_) => true,
            GatewayError::Network(_) => true,
            GatewayError::Cache(_) => true, // Redis might recover
            GatewayError::Parse(_) => false,
            GatewayError::Config(_) => false,
            GatewayError::InvalidInput(_) => false,
            GatewayError::Cancelled(_) => false,
        }
    }

    pub fn categorize(&self) -> ErrorCategory {
        match self {
            GatewayError::Upstream { .. } | GatewayError::RateLimited(_) => ErrorCategory::Upstream,
            GatewayError::Timeout(_) | GatewayError::Network(_) => ErrorCategory::Network,
            GatewayError::Cache(_) => ErrorCategory::Infrastructure,
            GatewayError::Parse(_) => ErrorCategory::Data,
            GatewayError::Config(_) | GatewayError::InvalidInput(_) => ErrorCategory::Configuration,
            GatewayError::Cancelled(_) => ErrorCategory::Lifecycle,
        }
    }

    /// HTTP status a route handler should answer with.
    ///
    /// Upstream failures mirror the upstream status; everything the caller
    /// cannot act on collapses to 500.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Upstream { status, .. } => *status,
            GatewayError::RateLimited(_) => 429,
            GatewayError::Timeout(_) => 504,
            GatewayError::Network(_) => 502,
            GatewayError::InvalidInput(_) => 400,
            GatewayError::Cache(_)
            | GatewayError::Parse(_)
            | GatewayError::Config(_)
            | GatewayError::Cancelled(_) => 500,
        }
    }

    /// JSON error body in the shape the route layer returns.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Upstream,
    Network,
    Infrastructure,
    Data,
    Configuration,
    Lifecycle,
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_errors_mirror_status() {
        let err = GatewayError::Upstream {
            status: 404,
            message: "not found".to_string(),
        };
        assert_eq!(err.http_status(), 404);
        assert!(!err.is_recoverable());
        assert_eq!(err.categorize(), ErrorCategory::Upstream);

        let err = GatewayError::Upstream {
            status: 503,
            message: "unavailable".to_string(),
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn internal_failures_map_to_500() {
        assert_eq!(GatewayError::Cache("down".into()).http_status(), 500);
        assert_eq!(GatewayError::Parse("bad".into()).http_status(), 500);
        assert_eq!(GatewayError::Timeout("10s".into()).http_status(), 504);
        assert_eq!(GatewayError::InvalidInput("blank".into()).http_status(), 400);
    }

    #[test]
    fn json_body_carries_message() {
        let body = GatewayError::Network("connection refused".into()).to_json();
        assert_eq!(body["error"], "Network Error: connection refused");
    }

    #[test]
    fn serde_errors_become_parse_errors() {
        let err: GatewayError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, GatewayError::Parse(_)));
    }
}
