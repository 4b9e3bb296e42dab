//! Scripted upstream for exercising the gateway without network access.
//!
//! Responses are chosen in this order:
//! - the next scripted result, if any were pushed
//! - the first route whose pattern is contained in the endpoint
//! - a generic `{"status": "OK"}` body echoing the endpoint

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};

use crate::api::queue::RequestOptions;
use crate::api::upstream::{UpstreamClient, UpstreamError};

#[derive(Debug, Default)]
pub struct ScriptedUpstream {
    script: Mutex<VecDeque<Result<Value, UpstreamError>>>,
    routes: Mutex<Vec<(String, Result<Value, UpstreamError>)>>,
    calls: Mutex<Vec<String>>,
    latency: Mutex<Option<Duration>>,
}

impl ScriptedUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a one-off result for the next call.
    pub fn push_response(&self, result: Result<Value, UpstreamError>) {
        lock(&self.script).push_back(result);
    }

    pub fn push_rate_limited(&self) {
        self.push_response(Err(UpstreamError::RateLimited));
    }

    /// Answers every endpoint containing `pattern` with `body`.
    pub fn route(&self, pattern: impl Into<String>, body: Value) {
        lock(&self.routes).push((pattern.into(), Ok(body)));
    }

    pub fn route_error(&self, pattern: impl Into<String>, error: UpstreamError) {
        lock(&self.routes).push((pattern.into(), Err(error)));
    }

    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Endpoints in the order they were called.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    fn respond(&self, endpoint: &str) -> Result<Value, UpstreamError> {
        if let Some(scripted) = lock(&self.script).pop_front() {
            return scripted;
        }
        lock(&self.routes)
            .iter()
            .find(|(pattern, _)| endpoint.contains(pattern.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| Ok(json!({ "status": "OK", "endpoint": endpoint })))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl UpstreamClient for ScriptedUpstream {
    async fn get(&self, endpoint: &str, _options: &RequestOptions) -> Result<Value, UpstreamError> {
        lock(&self.calls).push(endpoint.to_string());
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let result = self.respond(endpoint);
        debug!("🧪 Scripted upstream {} -> {}", endpoint, if result.is_ok() { "ok" } else { "error" });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_takes_precedence_over_routes() {
        let upstream = ScriptedUpstream::new();
        upstream.route("/prev", json!({"results": [{"c": 1.0}]}));
        upstream.push_rate_limited();

        let options = RequestOptions::default();
        assert_eq!(
            upstream.get("/v2/aggs/ticker/AAPL/prev", &options).await,
            Err(UpstreamError::RateLimited)
        );
        assert_eq!(
            upstream.get("/v2/aggs/ticker/AAPL/prev", &options).await,
            Ok(json!({"results": [{"c": 1.0}]}))
        );
        assert_eq!(
            upstream.get("/other", &options).await,
            Ok(json!({"status": "OK", "endpoint": "/other"}))
        );
        assert_eq!(upstream.call_count(), 3);
    }
}
