//! Fixed-window request rate limiting
//!
//! The first request in a window sets the expiry; every later request
//! in the same window bumps an atomic counter. Rate limiting is a
//! protective layer, not a security boundary: when the backing store is
//! absent or unreachable the limiter fails open and allows the request.

use crate::event::keys;
use crate::store::MeterStore;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;

/// Outcome of a rate-limit check
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the current window resets
    pub reset_at: DateTime<Utc>,
}

/// Per-workspace fixed-window rate limiter
pub struct RateLimiter {
    store: Option<Arc<dyn MeterStore>>,
}

impl RateLimiter {
    /// Create a limiter over an optional store backend
    #[must_use]
    pub fn new(store: Option<Arc<dyn MeterStore>>) -> Self {
        Self { store }
    }

    /// Check and consume one request slot for a workspace
    pub async fn check(
        &self,
        workspace_id: &str,
        max_requests: u32,
        window_seconds: u64,
    ) -> RateLimitDecision {
        let fail_open = || RateLimitDecision {
            allowed: true,
            remaining: max_requests,
            reset_at: Utc::now() + Duration::seconds(window_seconds as i64),
        };

        let Some(store) = &self.store else {
            return fail_open();
        };

        let key = keys::rate_limit(workspace_id);
        let count = match store.incr_ex(&key, window_seconds).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, workspace = workspace_id, "rate limit store unavailable, failing open");
                return fail_open();
            }
        };

        let reset_at = match store.ttl_seconds(&key).await {
            Ok(Some(secs)) => Utc::now() + Duration::seconds(secs as i64),
            _ => Utc::now() + Duration::seconds(window_seconds as i64),
        };

        let used = u32::try_from(count).unwrap_or(u32::MAX);
        RateLimitDecision {
            allowed: used <= max_requests,
            remaining: max_requests.saturating_sub(used),
            reset_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, StoreError};
    use crate::store::{MemoryMeterStore, MeterStore};
    use async_trait::async_trait;

    /// A store whose every command fails, simulating a cache outage
    struct DownStore;

    #[async_trait]
    impl MeterStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn set_ex(&self, _key: &str, _value: &str, _ttl: u64) -> Result<()> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn incr_ex(&self, _key: &str, _ttl: u64) -> Result<i64> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn push(&self, _key: &str, _value: &str) -> Result<u64> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn pop_many(&self, _key: &str, _count: usize) -> Result<Vec<String>> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
        async fn ttl_seconds(&self, _key: &str) -> Result<Option<u64>> {
            Err(StoreError::Backend("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_counts_down_and_blocks() {
        let limiter = RateLimiter::new(Some(Arc::new(MemoryMeterStore::new())));

        let first = limiter.check("ws1", 2, 60).await;
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        let second = limiter.check("ws1", 2, 60).await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);

        let third = limiter.check("ws1", 2, 60).await;
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn test_workspaces_are_isolated() {
        let limiter = RateLimiter::new(Some(Arc::new(MemoryMeterStore::new())));

        assert!(limiter.check("ws1", 1, 60).await.allowed);
        assert!(!limiter.check("ws1", 1, 60).await.allowed);
        assert!(limiter.check("ws2", 1, 60).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_down() {
        let limiter = RateLimiter::new(Some(Arc::new(DownStore)));

        for _ in 0..10 {
            let decision = limiter.check("ws1", 1, 60).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 1);
        }
    }

    #[tokio::test]
    async fn test_fails_open_without_store() {
        let limiter = RateLimiter::new(None);

        let decision = limiter.check("ws1", 5, 60).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 5);
        assert!(decision.reset_at > Utc::now());
    }
}
