//! Usage tracker - best-effort request accounting
//!
//! Every call on `UsageTracker` is best-effort: accounting must never
//! fail or slow down the request path. Store failures are logged and
//! swallowed; with no store configured every write is a no-op and every
//! read returns `None`/zero.

use crate::event::{keys, ttl, ProviderHealth, ProviderStatsMap, UsageEvent, WorkspaceUsage};
use crate::store::MeterStore;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Latency samples retained per provider
const LATENCY_WINDOW: usize = 100;

/// Best-effort usage and provider-health recorder
pub struct UsageTracker {
    store: Option<Arc<dyn MeterStore>>,
    /// Rolling latency windows, per provider, process-local
    latencies: RwLock<HashMap<String, VecDeque<u64>>>,
}

impl UsageTracker {
    /// Create a tracker over an optional store backend
    #[must_use]
    pub fn new(store: Option<Arc<dyn MeterStore>>) -> Self {
        Self {
            store,
            latencies: RwLock::new(HashMap::new()),
        }
    }

    /// Record a completed request
    ///
    /// Writes a short-TTL read-back entry and queues the event for the
    /// aggregation worker. Never fails.
    pub async fn track_usage(&self, event: &UsageEvent) {
        let Some(store) = &self.store else {
            debug!("usage tracking skipped, no store configured");
            return;
        };

        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize usage event");
                return;
            }
        };

        let key = keys::last_usage(&event.workspace_id, &event.provider, &event.model);
        if let Err(e) = store.set_ex(&key, &json, ttl::LAST_USAGE_SECS).await {
            warn!(error = %e, "failed to cache last usage entry");
        }

        if let Err(e) = store.push(keys::EVENT_QUEUE, &json).await {
            warn!(error = %e, workspace = %event.workspace_id, "failed to queue usage event");
        }
    }

    /// Read back the most recent usage entry for a routing triple
    pub async fn last_usage(
        &self,
        workspace_id: &str,
        provider: &str,
        model: &str,
    ) -> Option<UsageEvent> {
        let json = self
            .read(&keys::last_usage(workspace_id, provider, model))
            .await?;
        parse_or_warn(&json, "last usage entry")
    }

    /// Record a latency sample and return the rolling mean
    ///
    /// Keeps the last `LATENCY_WINDOW` samples per provider in process
    /// memory and recomputes the simple mean on each insert.
    pub async fn record_provider_latency(&self, provider: &str, latency_ms: u64) -> f64 {
        let mut latencies = self.latencies.write().await;
        let window = latencies.entry(provider.to_string()).or_default();

        window.push_back(latency_ms);
        if window.len() > LATENCY_WINDOW {
            window.pop_front();
        }

        window.iter().sum::<u64>() as f64 / window.len() as f64
    }

    /// Rolling mean latency for a provider, if any samples exist
    pub async fn provider_latency_mean(&self, provider: &str) -> Option<f64> {
        let latencies = self.latencies.read().await;
        let window = latencies.get(provider)?;
        if window.is_empty() {
            return None;
        }
        Some(window.iter().sum::<u64>() as f64 / window.len() as f64)
    }

    /// Increment a provider's rolling failure counter
    ///
    /// The counter expires an hour after its first increment. Returns
    /// the new count (0 when the store is unavailable).
    pub async fn record_failure(&self, provider: &str) -> u64 {
        let Some(store) = &self.store else {
            return 0;
        };

        match store
            .incr_ex(&keys::provider_failures(provider), ttl::PROVIDER_FAILURES_SECS)
            .await
        {
            Ok(count) => u64::try_from(count).unwrap_or(0),
            Err(e) => {
                warn!(error = %e, provider, "failed to record provider failure");
                0
            }
        }
    }

    /// Reset a provider's failure counter after a success
    pub async fn record_success(&self, provider: &str) {
        let Some(store) = &self.store else {
            return;
        };

        if let Err(e) = store.delete(&keys::provider_failures(provider)).await {
            warn!(error = %e, provider, "failed to reset provider failure counter");
        }
    }

    /// Current rolling failure count for a provider
    pub async fn provider_failures(&self, provider: &str) -> u64 {
        let Some(json) = self.read(&keys::provider_failures(provider)).await else {
            return 0;
        };
        json.parse().unwrap_or(0)
    }

    /// Cache a health verdict for a provider (short TTL)
    pub async fn cache_provider_health(&self, provider: &str, healthy: bool) {
        let Some(store) = &self.store else {
            return;
        };

        let health = ProviderHealth {
            healthy,
            timestamp: Utc::now(),
        };
        let json = match serde_json::to_string(&health) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize provider health");
                return;
            }
        };

        if let Err(e) = store
            .set_ex(&keys::provider_health(provider), &json, ttl::PROVIDER_HEALTH_SECS)
            .await
        {
            warn!(error = %e, provider, "failed to cache provider health");
        }
    }

    /// Cached health verdict for a provider, if fresh
    pub async fn provider_health(&self, provider: &str) -> Option<ProviderHealth> {
        let json = self.read(&keys::provider_health(provider)).await?;
        parse_or_warn(&json, "provider health entry")
    }

    /// Aggregated usage for a workspace (eventually consistent)
    pub async fn workspace_usage(&self, workspace_id: &str) -> Option<WorkspaceUsage> {
        let json = self.read(&keys::workspace_usage(workspace_id)).await?;
        parse_or_warn(&json, "workspace usage aggregate")
    }

    /// Global per-provider stats blob (eventually consistent)
    pub async fn provider_stats(&self) -> Option<ProviderStatsMap> {
        let json = self.read(keys::PROVIDER_STATS).await?;
        parse_or_warn(&json, "provider stats blob")
    }

    async fn read(&self, key: &str) -> Option<String> {
        let store = self.store.as_ref()?;
        match store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, key, "metering store read failed");
                None
            }
        }
    }
}

/// Validate-on-read: malformed cache entries are logged and dropped
fn parse_or_warn<T: serde::de::DeserializeOwned>(json: &str, what: &str) -> Option<T> {
    match serde_json::from_str(json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(error = %e, "dropping malformed {}", what);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMeterStore;
    use chrono::Utc;

    fn tracker() -> UsageTracker {
        UsageTracker::new(Some(Arc::new(MemoryMeterStore::new())))
    }

    fn event() -> UsageEvent {
        UsageEvent {
            workspace_id: "ws1".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            cost: 0.000075,
            price: 0.00009375,
            timestamp: Utc::now(),
            latency_ms: Some(420),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_track_usage_queues_and_caches() {
        let store = Arc::new(MemoryMeterStore::new());
        let tracker = UsageTracker::new(Some(store.clone() as Arc<dyn MeterStore>));

        tracker.track_usage(&event()).await;

        let cached = tracker.last_usage("ws1", "openai", "gpt-4o").await.unwrap();
        assert_eq!(cached.input_tokens, 10);

        let queued = store.pop_many(keys::EVENT_QUEUE, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
    }

    #[tokio::test]
    async fn test_track_usage_without_store_is_a_noop() {
        let tracker = UsageTracker::new(None);
        // Must not panic or error
        tracker.track_usage(&event()).await;
        assert!(tracker.last_usage("ws1", "openai", "gpt-4o").await.is_none());
    }

    #[tokio::test]
    async fn test_failure_counter_resets_on_success() {
        let tracker = tracker();

        assert_eq!(tracker.record_failure("openai").await, 1);
        assert_eq!(tracker.record_failure("openai").await, 2);
        assert_eq!(tracker.provider_failures("openai").await, 2);

        tracker.record_success("openai").await;
        assert_eq!(tracker.provider_failures("openai").await, 0);
        assert_eq!(tracker.record_failure("openai").await, 1);
    }

    #[tokio::test]
    async fn test_latency_window_is_bounded() {
        let tracker = tracker();

        for _ in 0..150 {
            tracker.record_provider_latency("openai", 100).await;
        }
        let mean = tracker.record_provider_latency("openai", 100).await;
        assert!((mean - 100.0).abs() < f64::EPSILON);

        let latencies = tracker.latencies.read().await;
        assert_eq!(latencies["openai"].len(), LATENCY_WINDOW);
    }

    #[tokio::test]
    async fn test_latency_mean_recomputed_per_insert() {
        let tracker = tracker();

        assert!((tracker.record_provider_latency("g", 100).await - 100.0).abs() < f64::EPSILON);
        assert!((tracker.record_provider_latency("g", 300).await - 200.0).abs() < f64::EPSILON);
        assert_eq!(tracker.provider_latency_mean("g").await, Some(200.0));
        assert_eq!(tracker.provider_latency_mean("unknown").await, None);
    }

    #[tokio::test]
    async fn test_health_cache_roundtrip() {
        let tracker = tracker();

        tracker.cache_provider_health("gemini", false).await;
        let health = tracker.provider_health("gemini").await.unwrap();
        assert!(!health.healthy);

        assert!(tracker.provider_health("openai").await.is_none());
    }

    #[test]
    fn test_malformed_cache_entries_are_dropped() {
        let store = Arc::new(MemoryMeterStore::new());
        let tracker = UsageTracker::new(Some(store.clone() as Arc<dyn MeterStore>));

        tokio_test::block_on(async {
            store
                .set_ex(&keys::workspace_usage("ws1"), "not json", 60)
                .await
                .unwrap();
            assert!(tracker.workspace_usage("ws1").await.is_none());
        });
    }
}
