// src/store/mod.rs
//! Key-value store port with per-key expiry.
//!
//! The gateway keeps three kinds of state here: cached upstream responses,
//! the per-window rate counter and the persisted queue snapshot. Redis backs
//! it in production; [`MemoryStore`] backs tests and single-process runs.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` for absent or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes `value`, replacing any previous expiry. `None` means no expiry.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically adds one, creating the key at 0 first if absent. Keeps any existing expiry.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;
}
