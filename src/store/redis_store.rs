// src/store/redis_store.rs
//! Redis-backed [`KeyValueStore`].

use std::fmt;

use async_trait::async_trait;
use log::{debug, error, info};
use redis::{aio::ConnectionManager, AsyncCommands};

use super::KeyValueStore;
use crate::error::{GatewayError, Result};

/// Shared Redis handle.
/// Uses a `ConnectionManager` for automatic reconnection.
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
    redis_url: String,
}

// ConnectionManager is not Debug
impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("redis_url", &redact(&self.redis_url))
            .field("conn_manager", &"<ConnectionManager instance>")
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        info!("Initializing Redis connection manager for URL: {}", redact(redis_url));
        let client = redis::Client::open(redis_url)?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to create Redis ConnectionManager: {}", e);
            GatewayError::Cache(format!("Failed to create Redis ConnectionManager: {}", e))
        })?;
        info!("✅ Redis ready");
        Ok(Self {
            conn_manager,
            redis_url: redis_url.to_string(),
        })
    }
}

/// Hides the password component of `redis://:secret@host:port`.
pub fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        let value: Option<String> = conn.get(key).await.map_err(|e| {
            error!("Redis GET error for key {}: {}", key, e);
            GatewayError::from(e)
        })?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        debug!("Redis SET {} (ttl: {:?})", key, ttl_secs);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let applied: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(applied == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let present: bool = conn.exists(key).await?;
        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_hides_password() {
        assert_eq!(redact("redis://:hunter2@cache:6379"), "redis://***@cache:6379");
        assert_eq!(redact("redis://127.0.0.1/"), "redis://127.0.0.1/");
    }
}
