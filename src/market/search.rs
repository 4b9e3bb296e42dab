//! Ticker search enriched with prices for the top matches.

use std::sync::Arc;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;

use super::quotes::{QuoteService, StockQuote};
use crate::error::{GatewayError, Result};
use crate::store::KeyValueStore;

pub const SEARCH_KEY_PREFIX: &str = "search:";
pub const SEARCH_CACHE_TTL_SECS: u64 = 1800;
pub const EMPTY_SEARCH_CACHE_TTL_SECS: u64 = 3600;
/// Matches that get a price lookup
pub const PRICED_MATCHES: usize = 5;

pub fn search_key(query: &str) -> String {
    format!("{}{}", SEARCH_KEY_PREFIX, query.to_lowercase())
}

#[derive(Debug, Clone, Deserialize)]
struct TickerMatch {
    ticker: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Clone)]
pub struct StockSearch {
    quotes: QuoteService,
    store: Arc<dyn KeyValueStore>,
}

impl StockSearch {
    pub fn new(quotes: QuoteService) -> Self {
        let store = quotes.gateway().store();
        Self { quotes, store }
    }

    pub async fn search(&self, query: &str) -> Result<Vec<StockQuote>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(GatewayError::InvalidInput("search query is required".to_string()));
        }

        let key = search_key(query);
        if let Some(cached) = self.cached(&key).await {
            debug!("🔵 Cache hit for search: \"{}\"", query);
            return Ok(cached);
        }

        info!("🔎 Searching for stocks with query: \"{}\"", query);
        let body = self.quotes.gateway().search_tickers(query).await?;
        let matches = parse_matches(&body);

        if matches.is_empty() {
            self.remember(&key, &[], EMPTY_SEARCH_CACHE_TTL_SECS).await;
            return Ok(Vec::new());
        }
        debug!("📊 Found {} matching stocks", matches.len());

        let lookups = matches
            .into_iter()
            .take(PRICED_MATCHES)
            .map(|m| self.price_match(m));
        let results = join_all(lookups).await;

        self.remember(&key, &results, SEARCH_CACHE_TTL_SECS).await;
        Ok(results)
    }

    async fn price_match(&self, found: TickerMatch) -> StockQuote {
        if let Some(price) = self.quotes.cached_price(&found.ticker).await {
            let mut quote = StockQuote::unpriced(found.ticker).with_name(found.name);
            quote.price = Some(price);
            return quote;
        }

        match self.quotes.quote(&found.ticker).await {
            Ok(quote) => quote.with_name(found.name),
            Err(e) => {
                warn!("❌ Error processing {}: {}", found.ticker, e);
                StockQuote::unpriced(found.ticker).with_name(found.name)
            }
        }
    }

    async fn cached(&self, key: &str) -> Option<Vec<StockQuote>> {
        let raw = self.store.get(key).await.ok().flatten()?;
        match serde_json::from_str(&raw) {
            Ok(results) => Some(results),
            Err(e) => {
                warn!("Error parsing cached search results {}: {}", key, e);
                None
            }
        }
    }

    async fn remember(&self, key: &str, results: &[StockQuote], ttl_secs: u64) {
        let json = match serde_json::to_string(results) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize search results: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(key, &json, Some(ttl_secs)).await {
            warn!("Failed to cache search results {}: {}", key, e);
        }
    }
}

fn parse_matches(body: &Value) -> Vec<TickerMatch> {
    body.get("results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|r| serde_json::from_value(r.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
