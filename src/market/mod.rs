//! Market-data consumers built on the gateway, each with its own result cache.

pub mod calendar;
pub mod quotes;
pub mod search;
pub mod trending;

pub use calendar::previous_trading_day;
pub use quotes::{AggregateBar, QuoteService, StockQuote};
pub use search::StockSearch;
pub use trending::{TrendingService, TrendingStock};
