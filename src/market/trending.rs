//! Highest-volume names from the previous session's grouped aggregate.

use std::sync::Arc;

use chrono::NaiveDate;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::calendar::previous_trading_day;
use super::quotes::{format_percent, AggregateBar};
use crate::api::MarketDataGateway;
use crate::error::{GatewayError, Result};
use crate::store::KeyValueStore;

pub const TRENDING_KEY: &str = "trendingStocks";
pub const TRENDING_CACHE_TTL_SECS: u64 = 3600;
pub const TRENDING_MIN_PRICE: f64 = 100.0;
pub const TRENDING_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendingStock {
    pub symbol: String,
    pub price: f64,
    pub volume: f64,
    pub change: f64,
    pub change_percent: String,
}

impl TrendingStock {
    fn from_bar(bar: AggregateBar) -> Option<Self> {
        let close = bar.close.filter(|close| *close > TRENDING_MIN_PRICE)?;
        let change_percent = bar.change_percent().unwrap_or(0.0);
        Some(Self {
            change: bar.change().unwrap_or(0.0),
            change_percent: format_percent(change_percent),
            symbol: bar.ticker?,
            price: close,
            volume: bar.volume.unwrap_or(0.0),
        })
    }
}

/// Priced above the floor, by descending volume, capped at the limit.
pub fn rank_trending(bars: Vec<AggregateBar>) -> Vec<TrendingStock> {
    let mut trending: Vec<TrendingStock> = bars.into_iter().filter_map(TrendingStock::from_bar).collect();
    trending.sort_by(|a, b| b.volume.total_cmp(&a.volume));
    trending.truncate(TRENDING_LIMIT);
    trending
}

#[derive(Clone)]
pub struct TrendingService {
    gateway: MarketDataGateway,
    store: Arc<dyn KeyValueStore>,
}

impl TrendingService {
    pub fn new(gateway: MarketDataGateway) -> Self {
        let store = gateway.store();
        Self { gateway, store }
    }

    pub async fn trending(&self, today: NaiveDate) -> Result<Vec<TrendingStock>> {
        if let Some(cached) = self.cached().await {
            debug!("🔵 Returning cached trending stocks");
            return Ok(cached);
        }

        let date = previous_trading_day(today);
        info!("🟡 Fetching trending stocks for {}", date);
        let body = self.gateway.fetch_grouped_daily_data(date).await?;

        let results = match body.get("results").and_then(Value::as_array) {
            Some(results) => results,
            None => {
                let preview: String = body.to_string().chars().take(500).collect();
                error!("⚠️ Unexpected grouped response structure: {}", preview);
                return Err(GatewayError::Parse("grouped daily response has no results".to_string()));
            }
        };
        debug!("📊 Received {} stocks from grouped aggregate", results.len());

        let bars = results
            .iter()
            .filter_map(|bar| serde_json::from_value::<AggregateBar>(bar.clone()).ok())
            .collect();
        let trending = rank_trending(bars);
        info!("✨ Filtered to {} trending stocks", trending.len());

        match serde_json::to_string(&trending) {
            Ok(json) => {
                if let Err(e) = self.store.set(TRENDING_KEY, &json, Some(TRENDING_CACHE_TTL_SECS)).await {
                    warn!("Failed to cache trending stocks: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize trending stocks: {}", e),
        }
        Ok(trending)
    }

    async fn cached(&self) -> Option<Vec<TrendingStock>> {
        let raw = self.store.get(TRENDING_KEY).await.ok().flatten()?;
        serde_json::from_str(&raw)
            .map_err(|e| warn!("Corrupt trending cache: {}", e))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn bar(ticker: &str, open: f64, close: f64, volume: f64) -> AggregateBar {
        serde_json::from_value(json!({"T": ticker, "o": open, "c": close, "v": volume})).unwrap()
    }

    #[test]
    fn ranks_by_volume_above_price_floor() {
        let ranked = rank_trending(vec![
            bar("CHEAP", 10.0, 12.0, 9e9),
            bar("MSFT", 400.0, 410.0, 2e7),
            bar("NVDA", 800.0, 780.0, 5e7),
            bar("EDGE", 100.0, 100.0, 1e9),
        ]);
        let symbols: Vec<&str> = ranked.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["NVDA", "MSFT"]);
        assert_eq!(ranked[0].change_percent, "-2.50%");
        assert_eq!(ranked[1].change_percent, "2.50%");
    }

    #[test]
    fn caps_at_twenty() {
        let bars = (0..30).map(|i| bar(&format!("T{}", i), 150.0, 151.0, i as f64)).collect();
        let ranked = rank_trending(bars);
        assert_eq!(ranked.len(), TRENDING_LIMIT);
        assert_eq!(ranked[0].symbol, "T29");
    }

    #[test]
    fn serializes_camel_case() {
        let stock = TrendingStock {
            symbol: "NVDA".into(),
            price: 780.0,
            volume: 5e7,
            change: -20.0,
            change_percent: "-2.50%".into(),
        };
        let value = serde_json::to_value(&stock).unwrap();
        assert_eq!(value["changePercent"], json!("-2.50%"));
    }
}
