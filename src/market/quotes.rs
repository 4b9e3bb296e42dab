//! Latest-price lookups with a per-symbol price cache.
//!
//! Prices live under `stock:{SYMBOL}` next to the gateway's response cache.
//! Readers accept a bare number or an object carrying `c` or `price`;
//! anything else is treated as corrupt, deleted and refetched.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::MarketDataGateway;
use crate::error::{GatewayError, Result};
use crate::store::KeyValueStore;

pub const PRICE_KEY_PREFIX: &str = "stock:";
pub const PRICE_CACHE_TTL_SECS: u64 = 3600;

pub fn price_key(symbol: &str) -> String {
    format!("{}{}", PRICE_KEY_PREFIX, symbol)
}

/// One aggregate bar as reported by the provider.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AggregateBar {
    #[serde(rename = "T", default)]
    pub ticker: Option<String>,
    #[serde(rename = "o", default)]
    pub open: Option<f64>,
    #[serde(rename = "h", default)]
    pub high: Option<f64>,
    #[serde(rename = "l", default)]
    pub low: Option<f64>,
    #[serde(rename = "c", default)]
    pub close: Option<f64>,
    #[serde(rename = "v", default)]
    pub volume: Option<f64>,
}

impl AggregateBar {
    pub fn change(&self) -> Option<f64> {
        Some(self.close? - self.open?)
    }

    pub fn change_percent(&self) -> Option<f64> {
        let open = self.open.filter(|open| *open != 0.0)?;
        Some((self.close? - open) / open * 100.0)
    }
}

/// Two decimals and a percent sign, e.g. `"1.25%"`.
pub fn format_percent(percent: f64) -> String {
    format!("{:.2}%", percent)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockQuote {
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub price: Option<f64>,
    pub change: Option<f64>,
    pub change_percent: Option<String>,
    pub volume: Option<f64>,
}

impl StockQuote {
    /// Quote with only a symbol, used when no price could be obtained.
    pub fn unpriced(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            price: None,
            change: None,
            change_percent: None,
            volume: None,
        }
    }

    pub fn from_bar(symbol: impl Into<String>, bar: &AggregateBar) -> Self {
        Self {
            symbol: symbol.into(),
            name: None,
            price: bar.close,
            change: bar.change(),
            change_percent: bar.change_percent().map(format_percent),
            volume: bar.volume,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

/// Reads a cached price. `None` means the payload is unusable.
pub fn parse_cached_price(raw: &str) -> Option<f64> {
    let price = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Number(n)) => n.as_f64(),
        Ok(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Ok(Value::Object(map)) => map.get("c").or_else(|| map.get("price")).and_then(Value::as_f64),
        Ok(_) => None,
        Err(_) => raw.trim().parse::<f64>().ok(),
    };
    price.filter(|p| p.is_finite())
}

/// First bar of a previous-day aggregate response, if any.
pub fn first_bar(body: &Value) -> Result<Option<AggregateBar>> {
    match body.get("results").and_then(Value::as_array).and_then(|r| r.first()) {
        Some(bar) => serde_json::from_value(bar.clone())
            .map(Some)
            .map_err(|e| GatewayError::Parse(format!("malformed aggregate bar: {}", e))),
        None => Ok(None),
    }
}

#[derive(Clone)]
pub struct QuoteService {
    gateway: MarketDataGateway,
    store: Arc<dyn KeyValueStore>,
}

impl QuoteService {
    pub fn new(gateway: MarketDataGateway) -> Self {
        let store = gateway.store();
        Self { gateway, store }
    }

    pub fn gateway(&self) -> &MarketDataGateway {
        &self.gateway
    }

    /// Price from the `stock:` cache. Corrupt entries are deleted.
    pub async fn cached_price(&self, symbol: &str) -> Option<f64> {
        let key = price_key(symbol);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Price cache read failed for {}: {}", symbol, e);
                return None;
            }
        };

        match parse_cached_price(&raw) {
            Some(price) => {
                debug!("🔵 Cache Hit: {} = ${}", symbol, price);
                Some(price)
            }
            None => {
                warn!("❌ Invalid cache data for {}: {}", symbol, raw);
                if let Err(e) = self.store.delete(&key).await {
                    warn!("Failed to clear corrupt price for {}: {}", symbol, e);
                }
                None
            }
        }
    }

    /// Latest closing price, preferring the price cache.
    pub async fn latest_price(&self, symbol: &str) -> Result<Option<f64>> {
        if let Some(price) = self.cached_price(symbol).await {
            return Ok(Some(price));
        }
        debug!("🟡 Cache miss for {}, fetching from API", symbol);
        Ok(self.quote(symbol).await?.price)
    }

    /// Previous-day quote from the gateway. Caches the closing price.
    pub async fn quote(&self, symbol: &str) -> Result<StockQuote> {
        let body = self.gateway.fetch_previous_day_data(symbol).await?;
        let bar = match first_bar(&body)? {
            Some(bar) => bar,
            None => {
                warn!("No price data found for {}", symbol);
                return Ok(StockQuote::unpriced(symbol));
            }
        };

        let quote = StockQuote::from_bar(symbol, &bar);
        if let Some(price) = quote.price {
            self.store_price(symbol, price).await;
        }
        Ok(quote)
    }

    async fn store_price(&self, symbol: &str, price: f64) {
        match self
            .store
            .set(&price_key(symbol), &price.to_string(), Some(PRICE_CACHE_TTL_SECS))
            .await
        {
            Ok(()) => info!("🟢 Fetched {} = ${} & stored in cache", symbol, price),
            Err(e) => warn!("Failed to cache price for {}: {}", symbol, e),
        }
    }
}
