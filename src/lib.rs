pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod market;
pub mod monitoring;
pub mod store;
pub mod testing; // Scripted upstream and async test helpers
pub mod utils;

pub use api::{GatewayConfig, MarketDataGateway, RequestPriority, RestoredEntryPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{GatewayError, Result};
pub use market::{QuoteService, StockSearch, TrendingService};
pub use monitoring::{MonitorEvent, PriceAlert, PriceMonitor};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
