//! Store double whose every operation fails, as a Redis outage looks to the gateway.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::error::{GatewayError, Result};
use crate::store::KeyValueStore;

#[derive(Debug, Default)]
pub struct UnreachableStore {
    attempts: AtomicUsize,
}

impl UnreachableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations attempted so far, all of which failed.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    fn fail<T>(&self, op: &str, key: &str) -> Result<T> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(GatewayError::Cache(format!("store unreachable during {} {}", op, key)))
    }
}

#[async_trait]
impl KeyValueStore for UnreachableStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.fail("GET", key)
    }

    async fn set(&self, key: &str, _value: &str, _ttl_secs: Option<u64>) -> Result<()> {
        self.fail("SET", key)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.fail("DEL", key)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.fail("INCR", key)
    }

    async fn expire(&self, key: &str, _ttl_secs: u64) -> Result<bool> {
        self.fail("EXPIRE", key)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.fail("EXISTS", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_operation_fails() {
        let store = UnreachableStore::new();
        assert!(matches!(store.get("k").await, Err(GatewayError::Cache(_))));
        assert!(store.set("k", "v", Some(1)).await.is_err());
        assert!(store.increment("k").await.is_err());
        assert_eq!(store.attempts(), 3);
    }
}
