// src/api/mod.rs
//! Upstream access layer:
//! - response cache keyed per endpoint with per-family TTLs
//! - persisted priority queue of pending requests
//! - shared per-window call budget
//! - the gateway that ties them to the provider client

pub mod cache_policy;
pub mod manager;
pub mod queue;
pub mod rate_limiter;
pub mod scheduler;
pub mod upstream;

pub use cache_policy::{cache_key_for, cache_ttl_for_endpoint, EndpointFamily};
pub use manager::{DrainOutcome, GatewayConfig, GatewayStats, MarketDataGateway, RestoredEntryPolicy};
pub use queue::{QueuedRequest, RequestOptions, RequestQueue, QUEUE_KEY};
pub use rate_limiter::{RateCounter, RateLimitConfig, RateLimitStats, RequestPriority, COUNTER_KEY};
pub use scheduler::ScheduledTask;
pub use upstream::{PolygonClient, UpstreamClient, UpstreamError};
