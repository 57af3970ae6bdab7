//! AgentWorks Metering - usage accounting and protective state
//!
//! This crate owns the accounting side of the provider gateway:
//! - Tracker: best-effort per-request usage recording and read-back
//! - Aggregator: background rollup of queued events into per-workspace
//!   and per-provider aggregates
//! - Rate limiter: fixed-window per-workspace throttling (fails open)
//! - Provider health: rolling failure counters and cached verdicts
//! - Store: cache/queue abstraction (Redis in production, in-memory
//!   for tests), injected as `Option<Arc<dyn MeterStore>>`
//!
//! Nothing here may fail a caller's request: accounting errors are
//! absorbed and logged, and the limiter degrades open under outages.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod aggregator;
pub mod error;
pub mod event;
pub mod ratelimit;
pub mod redis_store;
pub mod store;
pub mod tracker;

pub use aggregator::{UsageAggregator, DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL};
pub use error::{Result, StoreError};
pub use event::{
    keys, ttl, ProviderHealth, ProviderStats, ProviderStatsMap, UsageBreakdown, UsageEvent,
    WorkspaceUsage,
};
pub use ratelimit::{RateLimitDecision, RateLimiter};
pub use redis_store::RedisMeterStore;
pub use store::{MemoryMeterStore, MeterStore};
pub use tracker::UsageTracker;
