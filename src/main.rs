// src/main.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use market_gateway::{
    api::PolygonClient,
    config::{load_config, settings::parse_symbols},
    utils::setup_logging,
    KeyValueStore, MarketDataGateway, MemoryStore, MonitorEvent, PriceMonitor, QuoteService, RedisStore,
    StockSearch, SystemClock, TrendingService,
};

/// Rate-limited, cache-backed market-data gateway.
#[derive(Debug, Parser)]
#[command(name = "market-gateway", version)]
struct Cli {
    /// Symbols to poll, comma separated. Overrides MONITORED_SYMBOLS.
    #[arg(long, value_delimiter = ',')]
    symbols: Vec<String>,

    /// Overrides LOG_LEVEL.
    #[arg(long)]
    log_level: Option<String>,

    /// Overrides PRICE_POLL_INTERVAL_SECS.
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Keep state in process memory instead of Redis.
    #[arg(long)]
    memory_store: bool,

    /// Run one ticker search, print the results and exit.
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,

    /// Print trending stocks and exit.
    #[arg(long)]
    trending: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level).context("failed to initialize logging")?;
    info!("🚀 Market gateway starting...");

    let config = load_config().context("invalid configuration")?;

    let store: Arc<dyn KeyValueStore> = if cli.memory_store {
        warn!("Using in-process store; queue and caches are lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(
            RedisStore::connect(&config.redis_url)
                .await
                .context("failed to connect to Redis")?,
        )
    };
    let upstream = Arc::new(
        PolygonClient::new(&config.polygon_base_url, &config.polygon_api_key, config.upstream_timeout())
            .context("failed to build HTTP client")?,
    );

    let gateway = MarketDataGateway::new(config.gateway_config(), store, upstream, Arc::new(SystemClock::new()));
    gateway.start().await;
    let quotes = QuoteService::new(gateway.clone());

    if let Some(query) = cli.search.as_deref() {
        let result = StockSearch::new(quotes).search(query).await;
        gateway.stop().await;
        let results = result.context("search failed")?;
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }
    if cli.trending {
        let result = TrendingService::new(gateway.clone()).trending(Utc::now().date_naive()).await;
        gateway.stop().await;
        let trending = result.context("trending lookup failed")?;
        println!("{}", serde_json::to_string_pretty(&trending)?);
        return Ok(());
    }

    let symbols = if cli.symbols.is_empty() {
        config.monitored_symbols.clone()
    } else {
        parse_symbols(&cli.symbols.join(","))
    };
    let poll_interval = cli
        .poll_interval_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.price_poll_interval());

    let (monitor, mut events) = PriceMonitor::new(quotes);
    let monitor = Arc::new(monitor);
    monitor.add_symbols(&symbols).await;
    monitor.start(poll_interval);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(MonitorEvent::PriceUpdate { symbol, price }) => info!("💹 {} = ${}", symbol, price),
                Ok(MonitorEvent::AlertTriggered { message, user_id, .. }) => info!("{} (user {})", message, user_id),
                Err(RecvError::Lagged(skipped)) => warn!("Event listener lagged, skipped {} events", skipped),
                Err(RecvError::Closed) => {
                    error!("Monitor event channel closed");
                    break;
                }
            },
        }
    }

    monitor.stop().await;
    gateway.stop().await;
    info!("📊 Final stats: {}", gateway.stats().await);
    Ok(())
}
