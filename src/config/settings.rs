use std::env;
use std::fmt;
use std::time::Duration;

use crate::api::{GatewayConfig, RateLimitConfig, RestoredEntryPolicy};

#[derive(Clone)]
pub struct Config {
    pub polygon_api_key: String,
    pub polygon_base_url: String,
    pub redis_url: String,
    pub max_requests_per_minute: u32,
    pub rate_window_secs: u64,
    pub queue_ttl_secs: u64,
    pub drain_cooldown_ms: u64,
    pub sweep_interval_secs: u64,
    pub upstream_timeout_secs: u64,
    pub max_requeues: Option<u32>,
    pub restored_policy: RestoredEntryPolicy,
    pub price_poll_interval_secs: u64,
    pub monitored_symbols: Vec<String>,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// `REDIS_URL`, else one assembled from `REDIS_HOST`/`REDIS_PORT`/`REDIS_PASSWORD`.
fn redis_url_from_env() -> String {
    if let Ok(url) = env::var("REDIS_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
    match env::var("REDIS_PASSWORD") {
        Ok(password) if !password.is_empty() => format!("redis://:{}@{}:{}/", password, host, port),
        _ => format!("redis://{}:{}/", host, port),
    }
}

pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            polygon_api_key: env::var("POLYGON_API_KEY").unwrap_or_default(),
            polygon_base_url: env::var("POLYGON_BASE_URL")
                .unwrap_or_else(|_| crate::api::upstream::DEFAULT_BASE_URL.to_string()),
            redis_url: redis_url_from_env(),
            max_requests_per_minute: var_or("GATEWAY_MAX_REQUESTS_PER_MINUTE", 5),
            rate_window_secs: var_or("GATEWAY_RATE_WINDOW_SECS", 60),
            queue_ttl_secs: var_or("GATEWAY_QUEUE_TTL_SECS", 3600),
            drain_cooldown_ms: var_or("GATEWAY_DRAIN_COOLDOWN_MS", 5000),
            sweep_interval_secs: var_or("GATEWAY_SWEEP_INTERVAL_SECS", 15),
            upstream_timeout_secs: var_or("GATEWAY_UPSTREAM_TIMEOUT_SECS", 10),
            max_requeues: env::var("GATEWAY_MAX_REQUEUES")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            restored_policy: env::var("GATEWAY_RESTORED_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            price_poll_interval_secs: var_or("PRICE_POLL_INTERVAL_SECS", 30),
            monitored_symbols: env::var("MONITORED_SYMBOLS")
                .map(|v| parse_symbols(&v))
                .unwrap_or_default(),
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            rate_limit: RateLimitConfig {
                max_requests_per_window: self.max_requests_per_minute,
                window_secs: self.rate_window_secs,
            },
            queue_snapshot_ttl_secs: self.queue_ttl_secs,
            drain_cooldown: Duration::from_millis(self.drain_cooldown_ms),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
            max_requeues: self.max_requeues,
            restored_policy: self.restored_policy,
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn price_poll_interval(&self) -> Duration {
        Duration::from_secs(self.price_poll_interval_secs)
    }

    /// Problems that make the configuration unusable, one message each.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.polygon_api_key.trim().is_empty() {
            problems.push("POLYGON_API_KEY cannot be empty".to_string());
        }
        if self.redis_url.trim().is_empty() {
            problems.push("REDIS_URL cannot be empty".to_string());
        }
        if self.max_requests_per_minute == 0 {
            problems.push("GATEWAY_MAX_REQUESTS_PER_MINUTE must be at least 1".to_string());
        }
        for (name, value) in [
            ("GATEWAY_RATE_WINDOW_SECS", self.rate_window_secs),
            ("GATEWAY_QUEUE_TTL_SECS", self.queue_ttl_secs),
            ("GATEWAY_DRAIN_COOLDOWN_MS", self.drain_cooldown_ms),
            ("GATEWAY_SWEEP_INTERVAL_SECS", self.sweep_interval_secs),
            ("GATEWAY_UPSTREAM_TIMEOUT_SECS", self.upstream_timeout_secs),
            ("PRICE_POLL_INTERVAL_SECS", self.price_poll_interval_secs),
        ] {
            if value == 0 {
                problems.push(format!("{} must be positive", name));
            }
        }
        problems
    }

    pub fn validate_and_log(&self) {
        log::info!("Application Configuration Loaded: {:?}", self);
        for problem in self.problems() {
            log::error!("{}", problem);
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("polygon_api_key", &"<redacted>")
            .field("polygon_base_url", &self.polygon_base_url)
            .field("redis_url", &crate::store::redis_store::redact(&self.redis_url))
            .field("max_requests_per_minute", &self.max_requests_per_minute)
            .field("rate_window_secs", &self.rate_window_secs)
            .field("queue_ttl_secs", &self.queue_ttl_secs)
            .field("drain_cooldown_ms", &self.drain_cooldown_ms)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("upstream_timeout_secs", &self.upstream_timeout_secs)
            .field("max_requeues", &self.max_requeues)
            .field("restored_policy", &self.restored_policy)
            .field("price_poll_interval_secs", &self.price_poll_interval_secs)
            .field("monitored_symbols", &self.monitored_symbols)
            .finish()
    }
}
