// src/api/rate_limiter.rs
//! Fixed-window request budget for the upstream provider.
//!
//! The budget lives in a single counter key in the shared store:
//! - created lazily at 0 with a TTL of one window
//! - incremented on every upstream call attempt
//! - re-armed to a full window after every increment
//!
//! Re-arming on each increment lets a burst postpone the reset, which errs on
//! the side of calling upstream less often than allowed. Increment and expire
//! are two separate commands, so the counter is advisory rather than exact.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::KeyValueStore;

pub const COUNTER_KEY: &str = "polygon_api_counter";

/// Fixed priorities for the typed helpers. Higher is serviced first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RequestPriority {
    News = 1,
    BulkData = 2,
    Search = 3,
    /// Powers live price polling and alerts
    PriceLookup = 5,
}

impl RequestPriority {
    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestPriority::PriceLookup => "PRICE",
            RequestPriority::Search => "SEARCH",
            RequestPriority::BulkData => "BULK",
            RequestPriority::News => "NEWS",
        }
    }
}

impl From<RequestPriority> for i64 {
    fn from(priority: RequestPriority) -> Self {
        priority.value()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests_per_window: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 5,
            window_secs: 60,
        }
    }
}

/// Handle on the shared per-window call counter.
#[derive(Clone)]
pub struct RateCounter {
    store: Arc<dyn KeyValueStore>,
    key: String,
    config: RateLimitConfig,
}

impl RateCounter {
    pub fn new(store: Arc<dyn KeyValueStore>, config: RateLimitConfig) -> Self {
        Self {
            store,
            key: COUNTER_KEY.to_string(),
            config,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Creates the counter at 0 with a one-window TTL if it is absent.
    pub async fn init(&self) -> Result<()> {
        if !self.store.exists(&self.key).await? {
            self.store
                .set(&self.key, "0", Some(self.config.window_secs))
                .await?;
            debug!("🚦 Rate counter {} initialised ({}s window)", self.key, self.config.window_secs);
        }
        Ok(())
    }

    /// Calls made in the current window. Absent, expired or unreadable counts as 0.
    pub async fn current(&self) -> u32 {
        match self.store.get(&self.key).await {
            Ok(Some(raw)) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                warn!("Rate counter {} holds non-numeric value '{}', treating as 0", self.key, raw);
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!("Failed to read rate counter {}: {}", self.key, e);
                0
            }
        }
    }

    pub async fn has_budget(&self) -> bool {
        self.current().await < self.config.max_requests_per_window
    }

    /// Counts one upstream call and re-arms the window. Store failures are logged and swallowed.
    pub async fn record_call(&self) {
        match self.store.increment(&self.key).await {
            Ok(count) => debug!(
                "🚦 Upstream calls this window: {}/{}",
                count, self.config.max_requests_per_window
            ),
            Err(e) => {
                warn!("Failed to increment rate counter {}: {}", self.key, e);
                return;
            }
        }
        if let Err(e) = self.store.expire(&self.key, self.config.window_secs).await {
            warn!("Failed to re-arm rate counter {}: {}", self.key, e);
        }
    }

    pub async fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            used: self.current().await,
            limit: self.config.max_requests_per_window,
            window_secs: self.config.window_secs,
        }
    }
}

/// Rate limiting statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub used: u32,
    pub limit: u32,
    pub window_secs: u64,
}

impl RateLimitStats {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

impl fmt::Display for RateLimitStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} per {}s", self.used, self.limit, self.window_secs)
    }
}
