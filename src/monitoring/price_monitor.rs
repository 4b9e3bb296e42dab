// src/monitoring/price_monitor.rs
//! Polls prices for monitored symbols and fires price alerts.
//!
//! Each tick prices one batch of at most five symbols and advances a batch
//! cursor kept in the store, so the full set is covered over several ticks
//! without bursting the upstream budget. Updates and triggered alerts are
//! published on a broadcast channel.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::api::ScheduledTask;
use crate::error::{GatewayError, Result};
use crate::market::QuoteService;
use crate::store::KeyValueStore;

pub const BATCH_KEY: &str = "current_symbol_batch";
pub const BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceAlert {
    pub id: Uuid,
    pub user_id: String,
    pub symbol: String,
    pub target_price: f64,
    pub triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorEvent {
    PriceUpdate {
        symbol: String,
        price: f64,
    },
    #[serde(rename_all = "camelCase")]
    AlertTriggered {
        alert_id: Uuid,
        user_id: String,
        symbol: String,
        price: f64,
        message: String,
    },
}

pub struct PriceMonitor {
    quotes: QuoteService,
    store: Arc<dyn KeyValueStore>,
    symbols: RwLock<BTreeSet<String>>,
    alerts: RwLock<Vec<PriceAlert>>,
    events: broadcast::Sender<MonitorEvent>,
    poller: Mutex<Option<ScheduledTask>>,
}

impl PriceMonitor {
    pub fn new(quotes: QuoteService) -> (Self, broadcast::Receiver<MonitorEvent>) {
        let (events, receiver) = broadcast::channel(1024);
        let store = quotes.gateway().store();
        let monitor = Self {
            quotes,
            store,
            symbols: RwLock::new(BTreeSet::new()),
            alerts: RwLock::new(Vec::new()),
            events,
            poller: Mutex::new(None),
        };
        (monitor, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub async fn add_symbols<I, S>(&self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut monitored = self.symbols.write().await;
        for symbol in symbols {
            let symbol = symbol.as_ref().trim().to_uppercase();
            if !symbol.is_empty() {
                monitored.insert(symbol);
            }
        }
        info!("Monitoring {} symbols", monitored.len());
    }

    pub async fn remove_symbol(&self, symbol: &str) -> bool {
        self.symbols.write().await.remove(&symbol.trim().to_uppercase())
    }

    pub async fn symbols(&self) -> Vec<String> {
        self.symbols.read().await.iter().cloned().collect()
    }

    /// Registers an alert and starts monitoring its symbol.
    pub async fn add_alert(&self, user_id: &str, symbol: &str, target_price: f64) -> Result<PriceAlert> {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() || user_id.trim().is_empty() {
            return Err(GatewayError::InvalidInput("alert needs a user and a symbol".to_string()));
        }
        if !target_price.is_finite() || target_price <= 0.0 {
            return Err(GatewayError::InvalidInput(format!("invalid target price {}", target_price)));
        }

        let alert = PriceAlert {
            id: Uuid::new_v4(),
            user_id: user_id.trim().to_string(),
            symbol: symbol.clone(),
            target_price,
            triggered: false,
        };
        self.alerts.write().await.push(alert.clone());
        self.add_symbols([symbol]).await;
        Ok(alert)
    }

    pub async fn remove_alert(&self, id: Uuid) -> bool {
        let mut alerts = self.alerts.write().await;
        let before = alerts.len();
        alerts.retain(|alert| alert.id != id);
        alerts.len() != before
    }

    pub async fn alerts(&self) -> Vec<PriceAlert> {
        self.alerts.read().await.clone()
    }

    /// Prices the current batch and advances the cursor. Returns how many
    /// symbols produced a price.
    pub async fn poll_once(&self) -> usize {
        let symbols = self.symbols().await;
        if symbols.is_empty() {
            debug!("No stocks to monitor, skipping price updates");
            return 0;
        }

        let batches: Vec<&[String]> = symbols.chunks(BATCH_SIZE).collect();
        let index = self.batch_cursor().await % batches.len();
        let next = (index + 1) % batches.len();
        if let Err(e) = self.store.set(BATCH_KEY, &next.to_string(), None).await {
            warn!("Failed to store batch cursor: {}", e);
        }

        let batch = batches[index];
        debug!("Processing batch {}/{}: {}", index + 1, batches.len(), batch.join(", "));

        let mut priced = 0;
        for symbol in batch {
            match self.quotes.latest_price(symbol).await {
                Ok(Some(price)) => {
                    priced += 1;
                    self.publish(MonitorEvent::PriceUpdate {
                        symbol: symbol.clone(),
                        price,
                    });
                    self.check_alerts(symbol, price).await;
                }
                Ok(None) => debug!("No price for {}", symbol),
                Err(e) => warn!("Error updating price for {}: {}", symbol, e),
            }
        }
        priced
    }

    async fn batch_cursor(&self) -> usize {
        match self.store.get(BATCH_KEY).await {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or(0),
            Ok(None) => 0,
            Err(e) => {
                warn!("Failed to read batch cursor: {}", e);
                0
            }
        }
    }

    /// Triggers every pending alert for `symbol` whose target is at or below `price`.
    pub async fn check_alerts(&self, symbol: &str, price: f64) -> Vec<PriceAlert> {
        let mut fired = Vec::new();
        {
            let mut alerts = self.alerts.write().await;
            for alert in alerts.iter_mut() {
                if alert.symbol == symbol && !alert.triggered && price >= alert.target_price {
                    alert.triggered = true;
                    fired.push(alert.clone());
                }
            }
        }

        for alert in &fired {
            info!("🚨 Alert Triggered: {} hit ${}!", symbol, alert.target_price);
            self.publish(MonitorEvent::AlertTriggered {
                alert_id: alert.id,
                user_id: alert.user_id.clone(),
                symbol: symbol.to_string(),
                price,
                message: format!("🔔 {} has hit ${}!", symbol, alert.target_price),
            });
        }
        fired
    }

    fn publish(&self, event: MonitorEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscribers for monitor events");
        }
    }

    pub fn start(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = ScheduledTask::every("price-monitor", interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(monitor) = weak.upgrade() {
                    monitor.poll_once().await;
                }
            }
        });
        let previous = self.poller.lock().unwrap_or_else(|e| e.into_inner()).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("📈 Price monitor polling every {:?}", interval);
    }

    pub async fn stop(&self) {
        let task = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.stop().await;
            info!("Price monitor stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GatewayConfig, MarketDataGateway};
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use crate::testing::ScriptedUpstream;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn monitor() -> (PriceMonitor, broadcast::Receiver<MonitorEvent>, Arc<MemoryStore>, Arc<ScriptedUpstream>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let upstream = Arc::new(ScriptedUpstream::new());
        let gateway = MarketDataGateway::new(GatewayConfig::default(), store.clone(), upstream.clone(), clock);
        let (monitor, rx) = PriceMonitor::new(QuoteService::new(gateway));
        (monitor, rx, store, upstream)
    }

    #[tokio::test]
    async fn alerts_fire_once_at_or_above_target() {
        let (monitor, mut rx, _, _) = monitor();
        let low = monitor.add_alert("user-1", "aapl", 150.0).await.unwrap();
        monitor.add_alert("user-2", "AAPL", 250.0).await.unwrap();

        let fired = monitor.check_alerts("AAPL", 150.0).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, low.id);
        assert!(monitor.check_alerts("AAPL", 200.0).await.is_empty());

        match rx.recv().await.unwrap() {
            MonitorEvent::AlertTriggered { user_id, symbol, .. } => {
                assert_eq!(user_id, "user-1");
                assert_eq!(symbol, "AAPL");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_alerts_are_rejected() {
        let (monitor, _, _, _) = monitor();
        assert!(monitor.add_alert("", "AAPL", 1.0).await.is_err());
        assert!(monitor.add_alert("u", "AAPL", -1.0).await.is_err());
        assert!(monitor.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn symbols_and_alerts_can_be_removed() {
        let (monitor, _, _, _) = monitor();
        monitor.add_symbols(["AAPL", "MSFT"]).await;
        assert!(monitor.remove_symbol(" msft ").await);
        assert!(!monitor.remove_symbol("MSFT").await);
        assert_eq!(monitor.symbols().await, vec!["AAPL"]);

        let alert = monitor.add_alert("user-1", "NVDA", 900.0).await.unwrap();
        assert!(!monitor.remove_alert(Uuid::new_v4()).await);
        assert!(monitor.remove_alert(alert.id).await);
        assert!(monitor.alerts().await.is_empty());
        assert!(monitor.check_alerts("NVDA", 950.0).await.is_empty());
    }

    #[tokio::test]
    async fn batches_rotate_through_symbols() {
        let (monitor, _, store, upstream) = monitor();
        monitor
            .add_symbols(["A", "B", "C", "D", "E", "F", "G"])
            .await;
        for symbol in ["A", "B", "C", "D", "E", "F", "G"] {
            store.set(&format!("stock:{}", symbol), "101.5", Some(3600)).await.unwrap();
        }

        assert_eq!(monitor.poll_once().await, 5);
        assert_eq!(store.get(BATCH_KEY).await.unwrap().as_deref(), Some("1"));
        assert_eq!(monitor.poll_once().await, 2);
        assert_eq!(store.get(BATCH_KEY).await.unwrap().as_deref(), Some("0"));
        assert_eq!(upstream.call_count(), 0);
    }

    #[tokio::test]
    async fn poll_publishes_price_updates_from_upstream() {
        let (monitor, mut rx, store, upstream) = monitor();
        upstream.route("/v2/aggs/ticker/MSFT/prev", json!({"results": [{"T": "MSFT", "o": 400.0, "c": 412.5, "v": 1e6}]}));
        monitor.add_symbols(["msft"]).await;

        assert_eq!(monitor.poll_once().await, 1);
        assert_eq!(
            rx.recv().await.unwrap(),
            MonitorEvent::PriceUpdate {
                symbol: "MSFT".into(),
                price: 412.5
            }
        );
        assert_eq!(store.get("stock:MSFT").await.unwrap().as_deref(), Some("412.5"));
    }
}
