use std::sync::Arc;
use std::time::Duration;

use assert_approx_eq::assert_approx_eq;
use chrono::{NaiveDate, Utc};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use market_gateway::api::{
    cache_key_for, DrainOutcome, GatewayConfig, QueuedRequest, RateLimitConfig, RequestOptions, RestoredEntryPolicy,
    UpstreamError, COUNTER_KEY, QUEUE_KEY,
};
use market_gateway::market::quotes::price_key;
use market_gateway::market::search::search_key;
use market_gateway::market::trending::TRENDING_KEY;
use market_gateway::testing::{settle, wait_until, ScriptedUpstream, UnreachableStore};
use market_gateway::{
    GatewayError, KeyValueStore, ManualClock, MarketDataGateway, MemoryStore, QuoteService, StockSearch,
    TrendingService,
};

struct Harness {
    gateway: MarketDataGateway,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    upstream: Arc<ScriptedUpstream>,
}

fn fast_config() -> GatewayConfig {
    GatewayConfig {
        drain_cooldown: Duration::from_millis(20),
        sweep_interval: Duration::from_secs(3600),
        ..GatewayConfig::default()
    }
}

/// Follow-up drains only happen when a test calls `process_queue`.
fn manual_config() -> GatewayConfig {
    GatewayConfig {
        drain_cooldown: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(3600),
        ..GatewayConfig::default()
    }
}

fn harness(config: GatewayConfig) -> Harness {
    let clock = Arc::new(ManualClock::new());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let upstream = Arc::new(ScriptedUpstream::new());
    let gateway = MarketDataGateway::new(config, store.clone(), upstream.clone(), clock.clone());
    Harness {
        gateway,
        store,
        clock,
        upstream,
    }
}

impl Harness {
    async fn exhaust_budget(&self) {
        self.store.set(COUNTER_KEY, "5", Some(60)).await.unwrap();
    }

    fn spawn_fetch(&self, endpoint: &str, priority: i64) -> JoinHandle<Result<Value, GatewayError>> {
        let gateway = self.gateway.clone();
        let endpoint = endpoint.to_string();
        tokio::spawn(async move { gateway.fetch(&endpoint, RequestOptions::default(), priority).await })
    }

    async fn wait_for_queue_len(&self, len: usize) {
        let gateway = &self.gateway;
        wait_until(|| async move { gateway.queue_len().await == len }).await;
    }
}

#[tokio::test]
async fn cached_response_is_returned_without_upstream_call() {
    let h = harness(fast_config());
    let body = json!({"results": [{"T": "AAPL", "c": 189.5}]});
    h.store
        .set("polygon:_v2_aggs_ticker_AAPL_prev", &body.to_string(), Some(3600))
        .await
        .unwrap();

    let result = h.gateway.fetch_previous_day_data("AAPL").await.unwrap();

    assert_eq!(result, body);
    assert_eq!(h.upstream.call_count(), 0);
    assert_eq!(h.gateway.rate_stats().await.used, 0);
    assert_eq!(h.gateway.queue_len().await, 0);
    assert_eq!(h.gateway.stats().await.cache_hits, 1);
}

#[tokio::test]
async fn higher_priority_requests_are_served_first() {
    let h = harness(fast_config());
    h.exhaust_budget().await;

    let news = h.spawn_fetch("/v2/reference/news?ticker=AAPL", 1);
    h.wait_for_queue_len(1).await;
    let search = h.spawn_fetch("/v3/reference/tickers?search=apple&active=true", 3);
    h.wait_for_queue_len(2).await;
    let prev = h.spawn_fetch("/v2/aggs/ticker/AAPL/prev", 5);
    h.wait_for_queue_len(3).await;

    let priorities: Vec<i64> = h.gateway.queued_requests().await.iter().map(|r| r.priority).collect();
    assert_eq!(priorities, vec![5, 3, 1]);
    assert_eq!(h.upstream.call_count(), 0);

    h.clock.advance(Duration::from_secs(60));
    for handle in [news, search, prev] {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(
        h.upstream.calls(),
        vec![
            "/v2/aggs/ticker/AAPL/prev",
            "/v3/reference/tickers?search=apple&active=true",
            "/v2/reference/news?ticker=AAPL",
        ]
    );
}

#[tokio::test]
async fn equal_priorities_are_served_in_arrival_order() {
    let h = harness(fast_config());
    h.exhaust_budget().await;

    let first = h.spawn_fetch("/v2/reference/news?ticker=AAA", 1);
    h.wait_for_queue_len(1).await;
    let second = h.spawn_fetch("/v2/reference/news?ticker=BBB", 1);
    h.wait_for_queue_len(2).await;

    h.clock.advance(Duration::from_secs(60));
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(
        h.upstream.calls(),
        vec!["/v2/reference/news?ticker=AAA", "/v2/reference/news?ticker=BBB"]
    );
}

#[tokio::test]
async fn sixth_request_waits_for_the_next_window() {
    let h = harness(fast_config());
    let handles: Vec<_> = (1..=6)
        .map(|i| h.spawn_fetch(&format!("/v2/reference/news?ticker=T{}", i), 1))
        .collect();

    let upstream = &h.upstream;
    let gateway = &h.gateway;
    wait_until(|| async move { upstream.call_count() == 5 && gateway.queue_len().await == 1 }).await;

    // cooldown drains keep firing but the budget is spent
    settle(Duration::from_millis(100)).await;
    assert_eq!(h.upstream.call_count(), 5);
    assert_eq!(h.gateway.queue_len().await, 1);
    assert_eq!(h.gateway.rate_stats().await.remaining(), 0);

    h.clock.advance(Duration::from_secs(60));
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }
    assert_eq!(h.upstream.call_count(), 6);
    assert_eq!(h.gateway.rate_stats().await.used, 1);
}

#[tokio::test]
async fn rate_limited_request_is_requeued_with_higher_priority() {
    let h = harness(manual_config());
    h.upstream.push_rate_limited();

    let caller = h.spawn_fetch("/v2/aggs/ticker/AAPL/prev", 5);
    let gateway = &h.gateway;
    wait_until(|| async move { gateway.stats().await.requeued == 1 && !gateway.is_draining() }).await;

    let queued = h.gateway.queued_requests().await;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].priority, 6);
    assert_eq!(queued[0].requeues, 1);
    assert!(!caller.is_finished());

    let outcome = h.gateway.process_queue().await;
    assert_eq!(outcome, DrainOutcome::Serviced { id: queued[0].id });
    assert!(caller.await.unwrap().is_ok());
    assert_eq!(h.upstream.call_count(), 2);
    assert_eq!(h.gateway.rate_stats().await.used, 2);
}

#[tokio::test]
async fn responses_are_cached_with_endpoint_specific_ttls() {
    let h = harness(fast_config());
    let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

    h.gateway.fetch_previous_day_data("AAPL").await.unwrap();
    h.gateway.search_tickers("apple").await.unwrap();
    h.gateway.fetch_grouped_daily_data(date).await.unwrap();
    h.gateway.fetch_news("AAPL").await.unwrap();
    h.gateway
        .fetch("/v1/marketstatus/now", RequestOptions::default(), 1)
        .await
        .unwrap();

    let expected = [
        ("/v2/aggs/ticker/AAPL/prev", 3600),
        ("/v3/reference/tickers?search=apple&active=true", 86_400),
        ("/v2/aggs/grouped/locale/us/market/stocks/2024-03-01", 21_600),
        ("/v2/reference/news?ticker=AAPL", 1800),
        ("/v1/marketstatus/now", 300),
    ];
    for (endpoint, ttl) in expected {
        assert_eq!(
            h.store.ttl_remaining(&cache_key_for(endpoint)),
            Some(Duration::from_secs(ttl)),
            "ttl for {}",
            endpoint
        );
    }
    assert_eq!(h.upstream.call_count(), 5);
}

fn seed_snapshot(records: &[QueuedRequest]) -> String {
    serde_json::to_string(records).unwrap()
}

#[tokio::test]
async fn restored_requests_warm_the_cache_without_a_caller() {
    let h = harness(fast_config());
    let records = [
        QueuedRequest::new("/v2/reference/news?ticker=MSFT", RequestOptions::default(), 1, Utc::now()),
        QueuedRequest::new("/v2/aggs/ticker/MSFT/prev", RequestOptions::default(), 5, Utc::now()),
    ];
    h.store
        .set(QUEUE_KEY, &seed_snapshot(&records), Some(3600))
        .await
        .unwrap();

    h.gateway.start().await;
    let gateway = &h.gateway;
    wait_until(|| async move { gateway.stats().await.discarded == 2 }).await;

    assert_eq!(
        h.upstream.calls(),
        vec!["/v2/aggs/ticker/MSFT/prev", "/v2/reference/news?ticker=MSFT"]
    );
    assert_eq!(h.gateway.queue_len().await, 0);
    assert_eq!(h.gateway.waiting_callers(), 0);
    for endpoint in ["/v2/aggs/ticker/MSFT/prev", "/v2/reference/news?ticker=MSFT"] {
        assert!(h.store.get(&cache_key_for(endpoint)).await.unwrap().is_some());
    }
    h.gateway.stop().await;
}

#[tokio::test]
async fn unreachable_store_degrades_to_always_fetching() {
    let store = Arc::new(UnreachableStore::new());
    let upstream = Arc::new(ScriptedUpstream::new());
    let body = json!({"ticker": "AAPL", "results": [{"T": "AAPL", "c": 189.5}]});
    upstream.route("/v2/aggs/ticker/AAPL/prev", body.clone());
    let gateway = MarketDataGateway::new(
        fast_config(),
        store.clone(),
        upstream.clone(),
        Arc::new(ManualClock::new()),
    );

    gateway.start().await;
    assert_eq!(gateway.fetch_previous_day_data("AAPL").await.unwrap(), body);
    assert_eq!(upstream.call_count(), 1);
    assert_eq!(gateway.fetch_previous_day_data("AAPL").await.unwrap(), body);
    assert_eq!(upstream.call_count(), 2);

    assert_eq!(gateway.rate_stats().await.used, 0);
    assert_eq!(gateway.queue_len().await, 0);
    assert_eq!(gateway.waiting_callers(), 0);
    assert!(store.attempts() > 0);
    gateway.stop().await;
    assert!(gateway.is_stopped());
}

#[tokio::test]
async fn drop_policy_discards_restored_requests() {
    let h = harness(GatewayConfig {
        restored_policy: RestoredEntryPolicy::Drop,
        ..fast_config()
    });
    let record = QueuedRequest::new("/v2/reference/news?ticker=MSFT", RequestOptions::default(), 1, Utc::now());
    h.store
        .set(QUEUE_KEY, &seed_snapshot(&[record]), Some(3600))
        .await
        .unwrap();

    h.gateway.start().await;
    settle(Duration::from_millis(50)).await;

    assert_eq!(h.gateway.queue_len().await, 0);
    assert_eq!(h.upstream.call_count(), 0);
    assert_eq!(h.store.get(QUEUE_KEY).await.unwrap().as_deref(), Some("[]"));
    h.gateway.stop().await;
}

#[tokio::test]
async fn garbage_snapshot_starts_with_an_empty_queue() {
    let h = harness(fast_config());
    h.store.set(QUEUE_KEY, "{{definitely not json", Some(3600)).await.unwrap();

    h.gateway.start().await;

    assert_eq!(h.gateway.queue_len().await, 0);
    assert_eq!(h.store.get(QUEUE_KEY).await.unwrap().as_deref(), Some("[]"));
    assert_eq!(h.store.get(COUNTER_KEY).await.unwrap().as_deref(), Some("0"));
    h.gateway.stop().await;
}

#[tokio::test]
async fn previous_day_data_end_to_end() {
    let h = harness(fast_config());
    let body = json!({"ticker": "AAPL", "results": [{"T": "AAPL", "o": 185.0, "c": 189.5, "v": 5.1e7}]});
    h.upstream.route("/v2/aggs/ticker/AAPL/prev", body.clone());

    let result = h.gateway.fetch_previous_day_data("AAPL").await.unwrap();

    assert_eq!(result, body);
    assert_eq!(h.upstream.calls(), vec!["/v2/aggs/ticker/AAPL/prev"]);
    let cached = h.store.get("polygon:_v2_aggs_ticker_AAPL_prev").await.unwrap().unwrap();
    assert_eq!(serde_json::from_str::<Value>(&cached).unwrap(), body);
    assert_eq!(
        h.store.ttl_remaining("polygon:_v2_aggs_ticker_AAPL_prev"),
        Some(Duration::from_secs(3600))
    );
    assert_eq!(h.gateway.rate_stats().await.used, 1);

    // second call is a cache hit
    h.gateway.fetch_previous_day_data("AAPL").await.unwrap();
    assert_eq!(h.upstream.call_count(), 1);
}

#[tokio::test]
async fn upstream_errors_reach_the_caller() {
    let h = harness(fast_config());
    h.upstream.route_error(
        "/news",
        UpstreamError::Status {
            status: 403,
            body: "NOT_AUTHORIZED".into(),
        },
    );

    let err = h.gateway.fetch_news("AAPL").await.unwrap_err();
    assert_eq!(err.http_status(), 403);
    assert_eq!(h.gateway.queue_len().await, 0);
    assert!(h
        .store
        .get(&cache_key_for("/v2/reference/news?ticker=AAPL"))
        .await
        .unwrap()
        .is_none());
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

fn roomy_config() -> GatewayConfig {
    GatewayConfig {
        rate_limit: RateLimitConfig {
            max_requests_per_window: 50,
            window_secs: 60,
        },
        ..fast_config()
    }
}

#[tokio::test]
async fn latest_price_replaces_corrupt_cache_entries() {
    let h = harness(roomy_config());
    h.upstream.route(
        "/v2/aggs/ticker/TSLA/prev",
        json!({"results": [{"T": "TSLA", "o": 170.0, "c": 175.25, "v": 9.9e7}]}),
    );
    h.store.set(&price_key("TSLA"), "[object Object]", Some(3600)).await.unwrap();

    let quotes = QuoteService::new(h.gateway.clone());
    let price = quotes.latest_price("TSLA").await.unwrap();

    assert_eq!(price, Some(175.25));
    assert_eq!(h.store.get(&price_key("TSLA")).await.unwrap().as_deref(), Some("175.25"));
    assert_eq!(h.upstream.call_count(), 1);

    // plain numbers are served from the price cache
    assert_eq!(quotes.latest_price("TSLA").await.unwrap(), Some(175.25));
    assert_eq!(h.upstream.call_count(), 1);
}

#[tokio::test]
async fn search_prices_top_matches_and_tolerates_failures() {
    let h = harness(roomy_config());
    let matches: Vec<Value> = ["AAPL", "BAD", "APLE", "APPF", "APLD", "APPN"]
        .iter()
        .map(|t| json!({"ticker": t, "name": format!("{} Corp", t)}))
        .collect();
    h.upstream.route("/v3/reference/tickers", json!({ "results": matches }));
    h.upstream.route_error(
        "/ticker/BAD/prev",
        UpstreamError::Status {
            status: 404,
            body: "unknown".into(),
        },
    );
    h.upstream.route("/prev", json!({"results": [{"o": 100.0, "c": 110.0, "v": 1000.0}]}));

    let search = StockSearch::new(QuoteService::new(h.gateway.clone()));
    let results = search.search("  Apple ").await.unwrap();

    let symbols: Vec<&str> = results.iter().map(|q| q.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["AAPL", "BAD", "APLE", "APPF", "APLD"]);
    assert_eq!(results[1].price, None);
    assert_eq!(results[0].price, Some(110.0));
    assert_approx_eq!(results[0].change.unwrap(), 10.0);
    assert_eq!(results[0].change_percent.as_deref(), Some("10.00%"));
    assert_eq!(results[0].name.as_deref(), Some("AAPL Corp"));

    assert_eq!(h.store.ttl_remaining(&search_key("apple")), Some(Duration::from_secs(1800)));
    let calls = h.upstream.call_count();
    assert_eq!(search.search("APPLE").await.unwrap(), results);
    assert_eq!(h.upstream.call_count(), calls);
}

#[tokio::test]
async fn empty_search_is_cached_longer_and_blank_query_is_rejected() {
    let h = harness(roomy_config());
    h.upstream.route("/v3/reference/tickers", json!({"results": []}));
    let search = StockSearch::new(QuoteService::new(h.gateway.clone()));

    assert!(search.search("zzzz").await.unwrap().is_empty());
    assert_eq!(h.store.ttl_remaining(&search_key("zzzz")), Some(Duration::from_secs(3600)));
    assert!(matches!(
        search.search("   ").await,
        Err(GatewayError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn trending_uses_previous_trading_day_and_caches() {
    let h = harness(roomy_config());
    h.upstream.route(
        "/v2/aggs/grouped/locale/us/market/stocks/2024-03-01",
        json!({"results": [
            {"T": "NVDA", "o": 800.0, "c": 820.0, "v": 5.0e7},
            {"T": "F", "o": 12.0, "c": 12.5, "v": 9.0e7},
            {"T": "MSFT", "o": 400.0, "c": 404.0, "v": 2.0e7}
        ]}),
    );
    let trending = TrendingService::new(h.gateway.clone());
    // Monday rolls back to Friday
    let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();

    let stocks = trending.trending(monday).await.unwrap();
    let symbols: Vec<&str> = stocks.iter().map(|s| s.symbol.as_str()).collect();
    assert_eq!(symbols, vec!["NVDA", "MSFT"]);
    assert_eq!(stocks[0].change_percent, "2.50%");
    assert_eq!(h.store.ttl_remaining(TRENDING_KEY), Some(Duration::from_secs(3600)));

    assert_eq!(trending.trending(monday).await.unwrap(), stocks);
    assert_eq!(h.upstream.call_count(), 1);
}

#[tokio::test]
async fn trending_without_results_is_a_parse_error() {
    let h = harness(roomy_config());
    h.upstream.route("/grouped/", json!({"status": "ERROR"}));
    let trending = TrendingService::new(h.gateway.clone());

    let err = trending
        .trending(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Parse(_)));
    assert!(h.store.get(TRENDING_KEY).await.unwrap().is_none());
}
