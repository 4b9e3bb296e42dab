// src/api/queue.rs
//! Priority-ordered queue of pending upstream requests.
//!
//! Every mutation writes a JSON snapshot of the whole queue to the store so a
//! restarted process can pick the work back up. Only durable fields are
//! persisted; the waiting callers live in the gateway's continuation table.
//! The in-memory queue stays authoritative when the store is unreachable.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::KeyValueStore;

pub const QUEUE_KEY: &str = "polygon_api_queue";

/// Snapshot lifetime. An older snapshot is presumed stale and is not replayed.
pub const QUEUE_SNAPSHOT_TTL_SECS: u64 = 3600;

/// Per-request configuration forwarded to the upstream client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Durable record of one pending upstream request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: Uuid,
    /// Upstream path with query parameters, without the API key
    pub endpoint: String,
    #[serde(default)]
    pub options: RequestOptions,
    pub priority: i64,
    /// Times this request was bounced by an upstream 429
    #[serde(default)]
    pub requeues: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedRequest {
    pub fn new(endpoint: impl Into<String>, options: RequestOptions, priority: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            endpoint: endpoint.into(),
            options,
            priority,
            requeues: 0,
            enqueued_at: now,
        }
    }
}

pub struct RequestQueue {
    entries: Mutex<Vec<QueuedRequest>>,
    store: Arc<dyn KeyValueStore>,
    key: String,
    snapshot_ttl_secs: u64,
}

impl RequestQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            store,
            key: QUEUE_KEY.to_string(),
            snapshot_ttl_secs: QUEUE_SNAPSHOT_TTL_SECS,
        }
    }

    pub fn with_snapshot_ttl(mut self, ttl_secs: u64) -> Self {
        self.snapshot_ttl_secs = ttl_secs;
        self
    }

    /// Appends and re-sorts by descending priority. The sort is stable, so
    /// equal priorities keep arrival order.
    pub async fn enqueue(&self, request: QueuedRequest) {
        let mut entries = self.entries.lock().await;
        debug!(
            "📝 Queued {} (priority {}, queue size: {})",
            request.endpoint,
            request.priority,
            entries.len() + 1
        );
        entries.push(request);
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        self.persist_locked(&entries).await;
    }

    /// Puts a throttled request back with its priority raised by one.
    pub async fn requeue(&self, mut request: QueuedRequest) -> QueuedRequest {
        request.priority += 1;
        request.requeues += 1;
        let requeued = request.clone();
        self.enqueue(request).await;
        requeued
    }

    pub async fn dequeue_highest(&self) -> Option<QueuedRequest> {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return None;
        }
        let next = entries.remove(0);
        self.persist_locked(&entries).await;
        Some(next)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of the queue in service order.
    pub async fn snapshot(&self) -> Vec<QueuedRequest> {
        self.entries.lock().await.clone()
    }

    pub async fn persist(&self) {
        let entries = self.entries.lock().await;
        self.persist_locked(&entries).await;
    }

    /// Reads the persisted snapshot without touching the in-memory queue.
    ///
    /// A missing snapshot or an unreachable store yields nothing. A snapshot
    /// that does not parse is deleted.
    pub async fn load_snapshot(&self) -> Vec<QueuedRequest> {
        let raw = match self.store.get(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(e) => {
                error!("Error loading queue from store: {}", e);
                return Vec::new();
            }
        };

        match serde_json::from_str::<Vec<QueuedRequest>>(&raw) {
            Ok(records) => records,
            Err(e) => {
                error!("Error parsing queue snapshot {}: {}", self.key, e);
                match self.store.delete(&self.key).await {
                    Ok(_) => info!("Cleared corrupted queue snapshot {}", self.key),
                    Err(e) => warn!("Failed to clear corrupted queue snapshot {}: {}", self.key, e),
                }
                Vec::new()
            }
        }
    }

    /// Merges the persisted snapshot into the in-memory queue.
    ///
    /// Records already present (same id) are skipped. Returns the records added.
    pub async fn restore(&self) -> Vec<QueuedRequest> {
        let records = self.load_snapshot().await;
        let mut entries = self.entries.lock().await;
        let known: HashSet<Uuid> = entries.iter().map(|entry| entry.id).collect();
        let restored: Vec<QueuedRequest> = records
            .into_iter()
            .filter(|record| !known.contains(&record.id))
            .collect();

        if !restored.is_empty() {
            entries.extend(restored.iter().cloned());
            entries.sort_by(|a, b| b.priority.cmp(&a.priority));
            info!("📋 Loaded {} requests from persisted queue", restored.len());
        }
        self.persist_locked(&entries).await;
        restored
    }

    async fn persist_locked(&self, entries: &[QueuedRequest]) {
        let json = match serde_json::to_string(entries) {
            Ok(json) => json,
            Err(e) => {
                error!("Error serializing queue: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .store
            .set(&self.key, &json, Some(self.snapshot_ttl_secs))
            .await
        {
            warn!("Error saving queue to store: {}", e);
        }
    }
}
