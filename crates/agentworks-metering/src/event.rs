//! Usage events and aggregates
//!
//! A `UsageEvent` records one completed provider request. Events are
//! queued by the tracker, consumed exactly once by the aggregation
//! worker, and folded into `WorkspaceUsage` and `ProviderStatsMap`
//! aggregates. The aggregates are TTL-bounded caches, not ledgers;
//! the billing source of truth lives in the platform database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Key namespaces for every payload this crate stores
///
/// Each namespace maps to exactly one serialized type; readers validate
/// on read and drop malformed entries instead of crashing.
pub mod keys {
    /// Queue of serialized `UsageEvent`s awaiting aggregation
    pub const EVENT_QUEUE: &str = "usage:events";

    /// Global `ProviderStatsMap` blob
    pub const PROVIDER_STATS: &str = "usage:provider:stats";

    /// Immediate read-back entry for the most recent request
    #[must_use]
    pub fn last_usage(workspace_id: &str, provider: &str, model: &str) -> String {
        format!("usage:last:{workspace_id}:{provider}:{model}")
    }

    /// Per-workspace `WorkspaceUsage` aggregate
    #[must_use]
    pub fn workspace_usage(workspace_id: &str) -> String {
        format!("usage:workspace:{workspace_id}")
    }

    /// Rolling failure counter for a provider
    #[must_use]
    pub fn provider_failures(provider: &str) -> String {
        format!("provider:failures:{provider}")
    }

    /// Cached `ProviderHealth` for a provider
    #[must_use]
    pub fn provider_health(provider: &str) -> String {
        format!("provider:health:{provider}")
    }

    /// Fixed-window request counter for a workspace
    #[must_use]
    pub fn rate_limit(workspace_id: &str) -> String {
        format!("ratelimit:{workspace_id}")
    }
}

/// TTLs per key namespace, in seconds
pub mod ttl {
    /// Read-back entries are only useful immediately after the request
    pub const LAST_USAGE_SECS: u64 = 300;
    /// Workspace aggregates expire after a day of inactivity
    pub const WORKSPACE_USAGE_SECS: u64 = 24 * 3600;
    /// Provider stats are a monitoring signal, not billing
    pub const PROVIDER_STATS_SECS: u64 = 3600;
    /// Failure streaks age out after an hour
    pub const PROVIDER_FAILURES_SECS: u64 = 3600;
    /// Health verdicts go stale quickly
    pub const PROVIDER_HEALTH_SECS: u64 = 300;
}

/// One completed request's token counts and derived cost/price
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Workspace (tenant) the request was billed against
    pub workspace_id: String,
    /// Provider that served the request
    pub provider: String,
    /// Model that served the request
    pub model: String,
    /// Input tokens (0 when the provider omitted the count)
    pub input_tokens: u32,
    /// Output tokens (0 when the provider omitted the count)
    pub output_tokens: u32,
    /// Platform cost in USD, fixed at response time
    pub cost: f64,
    /// Price charged to the workspace in USD (0 for BYOA requests)
    pub price: f64,
    /// When the request completed
    pub timestamp: DateTime<Utc>,
    /// End-to-end request latency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    /// Free-form caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl UsageEvent {
    /// Total tokens for this event
    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }
}

/// Running totals for one provider or model within a workspace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    /// Total cost (USD)
    pub cost: f64,
    /// Total price (USD)
    pub price: f64,
    /// Total tokens
    pub tokens: u64,
    /// Request count
    pub requests: u64,
}

impl UsageBreakdown {
    fn apply(&mut self, event: &UsageEvent) {
        self.cost += event.cost;
        self.price += event.price;
        self.tokens += event.total_tokens();
        self.requests += 1;
    }
}

/// Per-workspace usage aggregate
///
/// Mutated incrementally by the aggregation worker; the fold is
/// associative, so batch boundaries never change the totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceUsage {
    /// Total cost (USD)
    pub total_cost: f64,
    /// Total price (USD)
    pub total_price: f64,
    /// Total tokens
    pub total_tokens: u64,
    /// Total requests
    pub total_requests: u64,
    /// Breakdown by provider
    pub by_provider: HashMap<String, UsageBreakdown>,
    /// Breakdown by model
    pub by_model: HashMap<String, UsageBreakdown>,
    /// Timestamp of the newest folded event
    pub last_updated: DateTime<Utc>,
}

impl Default for WorkspaceUsage {
    fn default() -> Self {
        Self {
            total_cost: 0.0,
            total_price: 0.0,
            total_tokens: 0,
            total_requests: 0,
            by_provider: HashMap::new(),
            by_model: HashMap::new(),
            last_updated: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl WorkspaceUsage {
    /// Fold one event into the aggregate
    pub fn apply(&mut self, event: &UsageEvent) {
        self.total_cost += event.cost;
        self.total_price += event.price;
        self.total_tokens += event.total_tokens();
        self.total_requests += 1;

        self.by_provider
            .entry(event.provider.clone())
            .or_default()
            .apply(event);
        self.by_model
            .entry(event.model.clone())
            .or_default()
            .apply(event);

        self.last_updated = self.last_updated.max(event.timestamp);
    }
}

/// Global statistics for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Provider name
    pub provider: String,
    /// Request count
    pub requests: u64,
    /// Total cost (USD)
    pub cost: f64,
    /// Total price (USD)
    pub price: f64,
    /// Mean request latency (ms) over recorded samples
    pub avg_latency_ms: f64,
    /// Latency samples behind the mean
    #[serde(default)]
    pub latency_samples: u64,
    /// Current rolling failure count
    pub errors: u64,
}

impl ProviderStats {
    fn apply(&mut self, event: &UsageEvent) {
        self.requests += 1;
        self.cost += event.cost;
        self.price += event.price;

        if let Some(latency) = event.latency_ms {
            self.latency_samples += 1;
            self.avg_latency_ms +=
                (latency as f64 - self.avg_latency_ms) / self.latency_samples as f64;
        }
    }
}

/// Per-provider stats blob, keyed by provider name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderStatsMap {
    /// Stats per provider
    pub providers: HashMap<String, ProviderStats>,
    /// When the blob was last folded into
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl ProviderStatsMap {
    /// Fold one event into the provider's stats
    pub fn apply(&mut self, event: &UsageEvent) {
        let stats = self
            .providers
            .entry(event.provider.clone())
            .or_insert_with(|| ProviderStats {
                provider: event.provider.clone(),
                ..Default::default()
            });
        stats.apply(event);
        self.last_updated = Some(
            self.last_updated
                .map_or(event.timestamp, |at| at.max(event.timestamp)),
        );
    }

    /// Overwrite a provider's error count from its failure counter
    pub fn set_errors(&mut self, provider: &str, errors: u64) {
        if let Some(stats) = self.providers.get_mut(provider) {
            stats.errors = errors;
        }
    }
}

/// Cached health verdict for a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    /// Whether the provider looked healthy at `timestamp`
    pub healthy: bool,
    /// When the verdict was recorded
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(workspace: &str, provider: &str, model: &str, cost: f64) -> UsageEvent {
        UsageEvent {
            workspace_id: workspace.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cost,
            price: cost * 1.25,
            timestamp: Utc::now(),
            latency_ms: Some(250),
            metadata: None,
        }
    }

    #[test]
    fn test_fold_is_associative() {
        let e1 = event("ws1", "openai", "gpt-4o", 0.01);
        let e2 = event("ws1", "anthropic", "claude-sonnet-4-5-20250929", 0.02);
        let e3 = event("ws1", "openai", "gpt-4o-mini", 0.005);

        // [e1, e2] then [e3]
        let mut split = WorkspaceUsage::default();
        split.apply(&e1);
        split.apply(&e2);
        split.apply(&e3);

        // [e1, e2, e3] in one pass
        let mut single = WorkspaceUsage::default();
        for e in [&e1, &e2, &e3] {
            single.apply(e);
        }

        assert_eq!(split, single);
        assert_eq!(single.total_requests, 3);
        assert_eq!(single.total_tokens, 450);
        assert_eq!(single.by_provider["openai"].requests, 2);
        assert_eq!(single.by_model["gpt-4o"].requests, 1);
    }

    #[test]
    fn test_total_preserves_token_invariant() {
        let mut e = event("ws1", "openai", "gpt-4o", 0.01);
        // A provider that omits one side reports it as zero
        e.output_tokens = 0;
        assert_eq!(e.total_tokens(), 100);
    }

    #[test]
    fn test_provider_stats_running_mean() {
        let mut stats = ProviderStatsMap::default();
        let mut e1 = event("ws1", "openai", "gpt-4o", 0.01);
        e1.latency_ms = Some(100);
        let mut e2 = event("ws1", "openai", "gpt-4o", 0.01);
        e2.latency_ms = Some(300);

        stats.apply(&e1);
        stats.apply(&e2);

        let openai = &stats.providers["openai"];
        assert_eq!(openai.requests, 2);
        assert!((openai.avg_latency_ms - 200.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_event_roundtrips_through_json() {
        let e = event("ws1", "gemini", "gemini-2.5-flash", 0.001);
        let json = serde_json::to_string(&e).unwrap();
        let back: UsageEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.workspace_id, "ws1");
        assert_eq!(back.total_tokens(), 150);
    }

    #[test]
    fn test_key_namespaces() {
        assert_eq!(
            keys::last_usage("ws1", "openai", "gpt-4o"),
            "usage:last:ws1:openai:gpt-4o"
        );
        assert_eq!(keys::workspace_usage("ws1"), "usage:workspace:ws1");
        assert_eq!(keys::provider_failures("openai"), "provider:failures:openai");
        assert_eq!(keys::rate_limit("ws1"), "ratelimit:ws1");
    }
}
