//! Background usage aggregation
//!
//! Drains the usage-event queue on a fixed interval and folds events
//! into the per-workspace and per-provider aggregates. Runs once per
//! process, independently of request handling; multiple processes can
//! share one queue because the pop is destructive and atomic.
//!
//! Aggregation is best-effort monitoring data. A tick with no events is
//! a no-op; a tick with the store unavailable is skipped and its events
//! are lost. The durable billing ledger lives elsewhere.

use crate::event::{keys, ttl, ProviderStatsMap, UsageEvent, WorkspaceUsage};
use crate::store::MeterStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default events drained per tick
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default aggregation interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

/// Periodic usage-event aggregation worker
pub struct UsageAggregator {
    store: Option<Arc<dyn MeterStore>>,
    batch_size: usize,
    interval: Duration,
}

impl UsageAggregator {
    /// Create an aggregator over an optional store backend
    #[must_use]
    pub fn new(store: Option<Arc<dyn MeterStore>>) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
        }
    }

    /// Set the maximum events drained per tick
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the aggregation interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run the aggregation loop on the current runtime
    ///
    /// At most one aggregator should run per process; the shared queue
    /// keeps multi-process draining safe.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// Drain and fold one batch; returns the number of events folded
    pub async fn tick(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let raw = match store.pop_many(keys::EVENT_QUEUE, self.batch_size).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "aggregation tick skipped, store unavailable");
                return 0;
            }
        };
        if raw.is_empty() {
            return 0;
        }

        let mut events = Vec::with_capacity(raw.len());
        for item in &raw {
            match serde_json::from_str::<UsageEvent>(item) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "dropping malformed queued usage event"),
            }
        }

        self.fold_workspaces(store, &events).await;
        self.fold_provider_stats(store, &events).await;

        debug!(count = events.len(), "aggregated usage events");
        events.len()
    }

    async fn fold_workspaces(&self, store: &Arc<dyn MeterStore>, events: &[UsageEvent]) {
        let mut by_workspace: HashMap<&str, Vec<&UsageEvent>> = HashMap::new();
        for event in events {
            by_workspace
                .entry(event.workspace_id.as_str())
                .or_default()
                .push(event);
        }

        for (workspace_id, batch) in by_workspace {
            let key = keys::workspace_usage(workspace_id);
            let mut aggregate = match store.get(&key).await {
                Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                    warn!(error = %e, workspace = workspace_id, "resetting malformed workspace aggregate");
                    WorkspaceUsage::default()
                }),
                Ok(None) => WorkspaceUsage::default(),
                Err(e) => {
                    warn!(error = %e, workspace = workspace_id, "skipping workspace fold");
                    continue;
                }
            };

            for event in batch {
                aggregate.apply(event);
            }

            match serde_json::to_string(&aggregate) {
                Ok(json) => {
                    if let Err(e) = store.set_ex(&key, &json, ttl::WORKSPACE_USAGE_SECS).await {
                        warn!(error = %e, workspace = workspace_id, "failed to write workspace aggregate");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize workspace aggregate"),
            }
        }
    }

    async fn fold_provider_stats(&self, store: &Arc<dyn MeterStore>, events: &[UsageEvent]) {
        let mut stats: ProviderStatsMap = match store.get(keys::PROVIDER_STATS).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!(error = %e, "resetting malformed provider stats blob");
                ProviderStatsMap::default()
            }),
            Ok(None) => ProviderStatsMap::default(),
            Err(e) => {
                warn!(error = %e, "skipping provider stats fold");
                return;
            }
        };

        for event in events {
            stats.apply(event);
        }

        // Refresh error counts for the providers seen in this batch
        let mut seen: Vec<&str> = events.iter().map(|e| e.provider.as_str()).collect();
        seen.sort_unstable();
        seen.dedup();
        for provider in seen {
            let errors = match store.get(&keys::provider_failures(provider)).await {
                Ok(Some(value)) => value.parse().unwrap_or(0),
                Ok(None) => 0,
                Err(_) => continue,
            };
            stats.set_errors(provider, errors);
        }

        match serde_json::to_string(&stats) {
            Ok(json) => {
                if let Err(e) = store
                    .set_ex(keys::PROVIDER_STATS, &json, ttl::PROVIDER_STATS_SECS)
                    .await
                {
                    warn!(error = %e, "failed to write provider stats blob");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize provider stats blob"),
        }
    }
}
