// src/store/memory.rs
//! In-process [`KeyValueStore`] with the same expiry semantics as Redis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::KeyValueStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{GatewayError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Remaining lifetime of a live key; `None` if absent or without expiry.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        let mut entries = self.lock();
        Self::live(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        entries.retain(|_, entry| !Self::is_expired(entry, now));
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(entry: &Entry, now: Instant) -> bool {
        entry.expires_at.map_or(false, |at| at <= now)
    }

    /// Looks up a key, evicting it first if it has expired.
    fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
        if entries.get(key).map_or(false, |entry| Self::is_expired(entry, now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        Ok(Self::live(&mut entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let now = self.clock.now();
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl_secs.map(|ttl| now + Duration::from_secs(ttl)),
        };
        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let was_live = Self::live(&mut entries, key, now).is_some();
        entries.remove(key);
        Ok(was_live)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                let current: i64 = entry.value.trim().parse().map_err(|_| {
                    GatewayError::Cache(format!("value at {} is not an integer", key))
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match Self::live(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + Duration::from_secs(ttl_secs));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.lock();
        Ok(Self::live(&mut entries, key, now).is_some())
    }
}
