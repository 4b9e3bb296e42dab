// src/api/cache_policy.rs
//! Cache key derivation and the per-endpoint TTL table.

/// Prefix for cached upstream response bodies.
pub const RESPONSE_KEY_PREFIX: &str = "polygon:";

/// Endpoint families with distinct data volatility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointFamily {
    /// Single-ticker prior-day aggregate (`/aggs/ticker/{T}/prev`)
    PreviousClose,
    /// Ticker reference / metadata search (`/reference/tickers`)
    TickerReference,
    /// Grouped daily bulk aggregate (`/aggs/grouped/...`)
    GroupedDaily,
    News,
    Other,
}

impl EndpointFamily {
    pub fn classify(endpoint: &str) -> Self {
        if endpoint.contains("/aggs/ticker/") && endpoint.contains("/prev") {
            EndpointFamily::PreviousClose
        } else if endpoint.contains("/reference/tickers") {
            EndpointFamily::TickerReference
        } else if endpoint.contains("/grouped/") {
            EndpointFamily::GroupedDaily
        } else if endpoint.contains("/news") {
            EndpointFamily::News
        } else {
            EndpointFamily::Other
        }
    }

    pub fn ttl_secs(self) -> u64 {
        match self {
            EndpointFamily::PreviousClose => 3600,
            EndpointFamily::TickerReference => 86_400,
            EndpointFamily::GroupedDaily => 6 * 3600,
            EndpointFamily::News => 1800,
            EndpointFamily::Other => 300,
        }
    }
}

/// TTL applied to a successful response for `endpoint`. Zero disables caching.
pub fn cache_ttl_for_endpoint(endpoint: &str) -> u64 {
    EndpointFamily::classify(endpoint).ttl_secs()
}

/// Every character outside `[A-Za-z0-9]` becomes `_`, one for one.
pub fn cache_key_for(endpoint: &str) -> String {
    let normalized: String = endpoint
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}{}", RESPONSE_KEY_PREFIX, normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_table() {
        assert_eq!(cache_ttl_for_endpoint("/v2/aggs/ticker/AAPL/prev"), 3600);
        assert_eq!(
            cache_ttl_for_endpoint("/v3/reference/tickers?search=apple&active=true"),
            86_400
        );
        assert_eq!(
            cache_ttl_for_endpoint("/v2/aggs/grouped/locale/us/market/stocks/2024-03-01"),
            21_600
        );
        assert_eq!(cache_ttl_for_endpoint("/v2/reference/news?ticker=AAPL"), 1800);
        assert_eq!(cache_ttl_for_endpoint("/v1/marketstatus/now"), 300);
    }

    #[test]
    fn ticker_range_aggregates_are_not_previous_close() {
        assert_eq!(
            EndpointFamily::classify("/v2/aggs/ticker/AAPL/range/1/day/2024-01-01/2024-02-01"),
            EndpointFamily::Other
        );
    }

    #[test]
    fn keys_replace_each_non_alphanumeric_char() {
        assert_eq!(cache_key_for("/v2/aggs/ticker/AAPL/prev"), "polygon:_v2_aggs_ticker_AAPL_prev");
        assert_eq!(
            cache_key_for("/v3/reference/tickers?search=a%20b&active=true"),
            "polygon:_v3_reference_tickers_search_a_20b_active_true"
        );
    }

    #[test]
    fn keys_are_deterministic() {
        let path = "/v2/reference/news?ticker=MSFT";
        assert_eq!(cache_key_for(path), cache_key_for(path));
        assert_ne!(cache_key_for(path), cache_key_for("/v2/reference/news?ticker=AAPL"));
    }
}
