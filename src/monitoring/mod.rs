//! Monitoring Module
//!
//! Price polling for monitored symbols and in-memory price alerts.

pub mod price_monitor;

pub use price_monitor::{MonitorEvent, PriceAlert, PriceMonitor};
