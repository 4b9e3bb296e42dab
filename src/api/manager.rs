// src/api/manager.rs
//! Market-data gateway.
//!
//! Every call to the provider goes through here:
//! - cache lookup first; a live entry is returned without queueing
//! - misses become queue entries whose callers wait on a oneshot
//! - a single-flight drain services at most one entry per run under the
//!   per-window budget, caches the body with the endpoint's TTL and wakes the caller
//! - a 429 puts the entry back with priority + 1; any other failure is final
//! - after each drain a cooldown drain is scheduled while work remains, and a
//!   sweep task drains periodically regardless of traffic

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::cache_policy::{cache_key_for, cache_ttl_for_endpoint};
use super::queue::{QueuedRequest, RequestOptions, RequestQueue, QUEUE_SNAPSHOT_TTL_SECS};
use super::rate_limiter::{RateCounter, RateLimitConfig, RateLimitStats, RequestPriority};
use super::scheduler::ScheduledTask;
use super::upstream::{UpstreamClient, UpstreamError};
use crate::clock::Clock;
use crate::error::{GatewayError, Result};
use crate::store::KeyValueStore;

/// Characters left bare in a query value, matching `encodeURIComponent`.
/// A space becomes `%20`, so `"a b"` and `"a_b"` keep distinct cache keys.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// What happens to queue records restored from a snapshot. Their original
/// callers belonged to the previous process and cannot be woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoredEntryPolicy {
    /// Service them under the budget so the response lands in the cache; completion is a no-op.
    #[default]
    ServiceAndDiscard,
    /// Discard them at startup with a warning.
    Drop,
}

impl std::str::FromStr for RestoredEntryPolicy {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "service" | "service_and_discard" => Ok(RestoredEntryPolicy::ServiceAndDiscard),
            "drop" => Ok(RestoredEntryPolicy::Drop),
            other => Err(GatewayError::Config(format!("unknown restored entry policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub rate_limit: RateLimitConfig,
    pub queue_snapshot_ttl_secs: u64,
    /// Delay before the follow-up drain while the queue is non-empty
    pub drain_cooldown: Duration,
    /// Period of the background sweep drain
    pub sweep_interval: Duration,
    pub upstream_timeout: Duration,
    /// `None` keeps requeueing throttled entries forever
    pub max_requeues: Option<u32>,
    pub restored_policy: RestoredEntryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            queue_snapshot_ttl_secs: QUEUE_SNAPSHOT_TTL_SECS,
            drain_cooldown: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(15),
            upstream_timeout: Duration::from_secs(10),
            max_requeues: None,
            restored_policy: RestoredEntryPolicy::ServiceAndDiscard,
        }
    }
}

/// Result of one drain run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Queue was empty
    Idle,
    /// Another drain was already running
    Busy,
    /// Window budget used up; the head entry stays queued
    BudgetExhausted,
    Serviced { id: Uuid },
    Requeued { id: Uuid, priority: i64 },
    Rejected { id: Uuid },
}

#[derive(Debug, Default)]
struct GatewayCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    upstream_calls: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub requeued: u64,
    pub rejected: u64,
    /// Results for restored entries that had no waiting caller
    pub discarded: u64,
    pub queue_len: usize,
    pub waiting_callers: usize,
    pub rate_limit: RateLimitStats,
}

impl fmt::Display for GatewayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits:{} misses:{} upstream:{} requeued:{} rejected:{} discarded:{} queue:{} waiting:{} budget:{}",
            self.cache_hits,
            self.cache_misses,
            self.upstream_calls,
            self.requeued,
            self.rejected,
            self.discarded,
            self.queue_len,
            self.waiting_callers,
            self.rate_limit
        )
    }
}

type Continuation = oneshot::Sender<Result<Value>>;

struct GatewayInner {
    config: GatewayConfig,
    store: Arc<dyn KeyValueStore>,
    upstream: Arc<dyn UpstreamClient>,
    clock: Arc<dyn Clock>,
    queue: RequestQueue,
    counter: RateCounter,
    waiting: DashMap<Uuid, Continuation>,
    draining: AtomicBool,
    stopped: AtomicBool,
    sweep: Mutex<Option<ScheduledTask>>,
    cooldown: Mutex<Option<ScheduledTask>>,
    counters: GatewayCounters,
}

/// Cheap to clone; clones share one queue and one budget.
#[derive(Clone)]
pub struct MarketDataGateway {
    inner: Arc<GatewayInner>,
}

/// Clears the single-flight flag even if the drain unwinds.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn take_slot(slot: &Mutex<Option<ScheduledTask>>) -> Option<ScheduledTask> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

impl MarketDataGateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn KeyValueStore>,
        upstream: Arc<dyn UpstreamClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = RequestQueue::new(store.clone()).with_snapshot_ttl(config.queue_snapshot_ttl_secs);
        let counter = RateCounter::new(store.clone(), config.rate_limit.clone());
        Self {
            inner: Arc::new(GatewayInner {
                config,
                store,
                upstream,
                clock,
                queue,
                counter,
                waiting: DashMap::new(),
                draining: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                sweep: Mutex::new(None),
                cooldown: Mutex::new(None),
                counters: GatewayCounters::default(),
            }),
        }
    }

    fn from_weak(weak: &Weak<GatewayInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.inner.store.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.inner.clock.clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restores the persisted queue, initialises the rate counter, starts the
    /// sweep task and kicks a first drain.
    pub async fn start(&self) {
        self.inner.stopped.store(false, Ordering::Release);

        match self.inner.config.restored_policy {
            RestoredEntryPolicy::ServiceAndDiscard => {
                let restored = self.inner.queue.restore().await;
                if !restored.is_empty() {
                    info!(
                        "♻️ {} restored requests will be serviced; their results only warm the cache",
                        restored.len()
                    );
                }
            }
            RestoredEntryPolicy::Drop => {
                for record in self.inner.queue.load_snapshot().await {
                    warn!(
                        "Dropping restored request {} for {} (priority {})",
                        record.id, record.endpoint, record.priority
                    );
                }
                self.inner.queue.persist().await;
            }
        }

        if let Err(e) = self.inner.counter.init().await {
            warn!("Failed to initialise rate counter: {}", e);
        }

        let weak = Arc::downgrade(&self.inner);
        let sweep = ScheduledTask::every("queue-sweep", self.inner.config.sweep_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(gateway) = MarketDataGateway::from_weak(&weak) {
                    gateway.process_queue().await;
                }
            }
        });
        let previous = self.inner.sweep.lock().unwrap_or_else(|e| e.into_inner()).replace(sweep);
        if let Some(previous) = previous {
            previous.stop().await;
        }

        info!(
            "🚦 Gateway started: {} requests per {}s, sweep every {:?}",
            self.inner.config.rate_limit.max_requests_per_window,
            self.inner.config.rate_limit.window_secs,
            self.inner.config.sweep_interval
        );
        self.kick();
    }

    /// Stops background drains, persists the queue and fails every waiting caller.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);

        if let Some(task) = take_slot(&self.inner.sweep) {
            task.stop().await;
        }
        if let Some(task) = take_slot(&self.inner.cooldown) {
            task.stop().await;
        }

        self.inner.queue.persist().await;

        let ids: Vec<Uuid> = self.inner.waiting.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.complete(id, Err(GatewayError::Cancelled("gateway stopped".to_string())));
        }
        info!("⏹️ Gateway stopped with {} requests left in queue", self.inner.queue.len().await);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    // =========================================================================
    // Fetch
    // =========================================================================

    /// Returns the cached body for `endpoint` or queues an upstream fetch and
    /// waits for it to be serviced.
    pub async fn fetch(&self, endpoint: &str, options: RequestOptions, priority: impl Into<i64>) -> Result<Value> {
        if let Some(cached) = self.cached(endpoint).await {
            return Ok(cached);
        }
        self.inner.counters.cache_misses.fetch_add(1, Ordering::Relaxed);

        if self.is_stopped() {
            return Err(GatewayError::Cancelled("gateway is stopped".to_string()));
        }

        let request = QueuedRequest::new(endpoint, options, priority.into(), self.inner.clock.utc_now());
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.inner.waiting.insert(id, tx);
        self.inner.queue.enqueue(request).await;
        self.kick();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Cancelled(format!("request {} was dropped", id))),
        }
    }

    /// Live cached body for `endpoint`. Unreadable entries are deleted and count as a miss.
    pub async fn cached(&self, endpoint: &str) -> Option<Value> {
        let key = cache_key_for(endpoint);
        let raw = match self.inner.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache read failed for {}, treating as miss: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                debug!("🔵 Cache hit for: {}", endpoint);
                self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Err(e) => {
                warn!("Corrupt cache entry {} ({}), deleting", key, e);
                if let Err(e) = self.inner.store.delete(&key).await {
                    warn!("Failed to delete corrupt cache entry {}: {}", key, e);
                }
                None
            }
        }
    }

    pub async fn fetch_previous_day_data(&self, ticker: &str) -> Result<Value> {
        let ticker = validate_ticker(ticker)?;
        self.fetch(
            &format!("/v2/aggs/ticker/{}/prev", ticker),
            RequestOptions::default(),
            RequestPriority::PriceLookup,
        )
        .await
    }

    pub async fn search_tickers(&self, query: &str) -> Result<Value> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GatewayError::InvalidInput("search query is required".to_string()));
        }
        self.fetch(
            &format!(
                "/v3/reference/tickers?search={}&active=true",
                utf8_percent_encode(query, QUERY_VALUE)
            ),
            RequestOptions::default(),
            RequestPriority::Search,
        )
        .await
    }

    pub async fn fetch_grouped_daily_data(&self, date: NaiveDate) -> Result<Value> {
        self.fetch(
            &format!("/v2/aggs/grouped/locale/us/market/stocks/{}", date.format("%Y-%m-%d")),
            RequestOptions::default(),
            RequestPriority::BulkData,
        )
        .await
    }

    pub async fn fetch_news(&self, ticker: &str) -> Result<Value> {
        let ticker = validate_ticker(ticker)?;
        self.fetch(
            &format!("/v2/reference/news?ticker={}", ticker),
            RequestOptions::default(),
            RequestPriority::News,
        )
        .await
    }

    // =========================================================================
    // Drain
    // =========================================================================

    fn kick(&self) {
        if self.inner.draining.load(Ordering::Acquire) {
            return;
        }
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.process_queue().await;
        });
    }

    /// Services at most one queued request. No-op if a drain is already
    /// running or the queue is empty.
    pub async fn process_queue(&self) -> DrainOutcome {
        if self.inner.queue.is_empty().await {
            return DrainOutcome::Idle;
        }
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return DrainOutcome::Busy;
        }

        let outcome = {
            let _guard = DrainGuard(&self.inner.draining);
            self.drain_once().await
        };

        if !self.inner.queue.is_empty().await {
            self.schedule_cooldown_drain();
        }
        outcome
    }

    async fn drain_once(&self) -> DrainOutcome {
        let counter = &self.inner.counter;
        if !counter.has_budget().await {
            info!("⏳ Rate limit reached ({}). Waiting for counter reset...", counter.stats().await);
            return DrainOutcome::BudgetExhausted;
        }

        let request = match self.inner.queue.dequeue_highest().await {
            Some(request) => request,
            None => return DrainOutcome::Idle,
        };

        counter.record_call().await;
        self.inner.counters.upstream_calls.fetch_add(1, Ordering::Relaxed);
        info!("📡 Making API request to: {}", request.endpoint.split('?').next().unwrap_or(&request.endpoint));

        let timeout = self.inner.config.upstream_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.upstream.get(&request.endpoint, &request.options)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout(format!("no response within {:?}", timeout))),
        };

        match result {
            Ok(body) => {
                self.cache_response(&request.endpoint, &body).await;
                let id = request.id;
                self.complete(id, Ok(body));
                DrainOutcome::Serviced { id }
            }
            Err(e) if e.is_rate_limited() => self.handle_rate_limited(request).await,
            Err(e) => {
                error!("❌ API request failed: {}: {}", request.endpoint, e);
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                let id = request.id;
                self.complete(id, Err(e.into()));
                DrainOutcome::Rejected { id }
            }
        }
    }

    async fn handle_rate_limited(&self, request: QueuedRequest) -> DrainOutcome {
        let id = request.id;
        if let Some(max) = self.inner.config.max_requeues {
            if request.requeues >= max {
                warn!(
                    "🚫 {} still rate limited after {} requeues, giving up",
                    request.endpoint, request.requeues
                );
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.complete(
                    id,
                    Err(GatewayError::RateLimited(format!(
                        "{} still rate limited after {} requeues",
                        request.endpoint, request.requeues
                    ))),
                );
                return DrainOutcome::Rejected { id };
            }
        }

        let requeued = self.inner.queue.requeue(request).await;
        self.inner.counters.requeued.fetch_add(1, Ordering::Relaxed);
        warn!(
            "⚠️ Rate limit hit, pushed request back to queue: {} (priority {})",
            requeued.endpoint, requeued.priority
        );
        DrainOutcome::Requeued {
            id,
            priority: requeued.priority,
        }
    }

    async fn cache_response(&self, endpoint: &str, body: &Value) {
        let ttl = cache_ttl_for_endpoint(endpoint);
        if ttl == 0 || body.is_null() {
            return;
        }
        let key = cache_key_for(endpoint);
        match self.inner.store.set(&key, &body.to_string(), Some(ttl)).await {
            Ok(()) => info!("🟢 Cached response for {} ({}s)", endpoint, ttl),
            Err(e) => warn!("Failed to cache response for {}: {}", endpoint, e),
        }
    }

    /// Hands `result` to the waiting caller, if there is one.
    fn complete(&self, id: Uuid, result: Result<Value>) {
        match self.inner.waiting.remove(&id) {
            Some((_, tx)) => {
                if tx.send(result).is_err() {
                    debug!("Caller for request {} went away before completion", id);
                }
            }
            None => {
                self.inner.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!("No waiting caller for request {} (restored); result discarded", id);
            }
        }
    }

    fn schedule_cooldown_drain(&self) {
        if self.is_stopped() {
            return;
        }
        let mut slot = self.inner.cooldown.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map_or(false, |task| !task.is_finished()) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.drain_cooldown;
        *slot = Some(ScheduledTask::after("cooldown-drain", delay, async move {
            if let Some(gateway) = MarketDataGateway::from_weak(&weak) {
                // free the slot so this run can schedule its successor
                drop(take_slot(&gateway.inner.cooldown));
                gateway.process_queue().await;
            }
        }));
        debug!("Next drain in {:?}", delay);
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn queued_requests(&self) -> Vec<QueuedRequest> {
        self.inner.queue.snapshot().await
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.queue.len().await
    }

    pub fn waiting_callers(&self) -> usize {
        self.inner.waiting.len()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub async fn rate_stats(&self) -> RateLimitStats {
        self.inner.counter.stats().await
    }

    pub async fn stats(&self) -> GatewayStats {
        let counters = &self.inner.counters;
        GatewayStats {
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: counters.cache_misses.load(Ordering::Relaxed),
            upstream_calls: counters.upstream_calls.load(Ordering::Relaxed),
            requeued: counters.requeued.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
            discarded: counters.discarded.load(Ordering::Relaxed),
            queue_len: self.inner.queue.len().await,
            waiting_callers: self.inner.waiting.len(),
            rate_limit: self.inner.counter.stats().await,
        }
    }
}

/// Tickers go into URL paths, so only provider ticker characters are allowed.
fn validate_ticker(ticker: &str) -> Result<&str> {
    let ticker = ticker.trim();
    if ticker.is_empty() {
        return Err(GatewayError::InvalidInput("ticker is required".to_string()));
    }
    if !ticker
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-'))
    {
        return Err(GatewayError::InvalidInput(format!("invalid ticker '{}'", ticker)));
    }
    Ok(ticker)
}
