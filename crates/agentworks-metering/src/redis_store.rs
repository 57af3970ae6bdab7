//! Redis-backed metering store (for production)
//!
//! # Security Features
//!
//! - Automatic TTL-based expiration for every written key
//! - Keys are prefixed to isolate from other Redis data
//! - Consider enabling Redis AUTH and TLS in production
//!
//! Queue atomicity: events are appended with `LPUSH` and drained with a
//! counted `RPOP`, so multiple router processes can share one queue and
//! each event is consumed at most once.

use crate::error::{Result, StoreError};
use crate::store::MeterStore;
use async_trait::async_trait;

/// Default key prefix
const DEFAULT_PREFIX: &str = "agentworks:";

/// Redis-backed implementation of `MeterStore`
pub struct RedisMeterStore {
    client: redis::Client,
    /// Key prefix for all metering keys
    prefix: String,
}

impl RedisMeterStore {
    /// Create a new Redis store
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn new(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
        })
    }

    /// Create with a custom key prefix
    ///
    /// # Errors
    ///
    /// Returns error if the Redis URL is invalid
    pub fn with_prefix(redis_url: &str, prefix: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self {
            client,
            prefix: prefix.to_string(),
        })
    }

    /// Build the full Redis key
    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Get an async connection
    async fn get_connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Backend(format!("Redis connection failed: {}", e)))
    }
}

#[async_trait]
impl MeterStore for RedisMeterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis GET failed: {}", e)))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        redis::cmd("SETEX")
            .arg(&key)
            .arg(ttl_seconds)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis SETEX failed: {}", e)))
    }

    async fn incr_ex(&self, key: &str, ttl_seconds: u64) -> Result<i64> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        let count: i64 = redis::cmd("INCR")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis INCR failed: {}", e)))?;

        // First increment in the window fixes the expiry
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(ttl_seconds)
                .query_async::<()>(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(format!("Redis EXPIRE failed: {}", e)))?;
        }

        Ok(count)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        let deleted: i64 = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis DEL failed: {}", e)))?;

        Ok(deleted > 0)
    }

    async fn push(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        redis::cmd("LPUSH")
            .arg(&key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis LPUSH failed: {}", e)))
    }

    async fn pop_many(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        let popped: Option<Vec<String>> = redis::cmd("RPOP")
            .arg(&key)
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis RPOP failed: {}", e)))?;

        Ok(popped.unwrap_or_default())
    }

    async fn ttl_seconds(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.get_connection().await?;
        let key = self.build_key(key);

        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(format!("Redis TTL failed: {}", e)))?;

        // -2 = missing key, -1 = no expiry
        if ttl >= 0 {
            Ok(Some(ttl as u64))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
// Redis tests require a running Redis instance
// Run with: cargo test --features redis-tests
#[cfg(feature = "redis-tests")]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_redis_queue_roundtrip() {
        let store = RedisMeterStore::new("redis://127.0.0.1:6379").unwrap();

        store.push("test:queue", "one").await.unwrap();
        store.push("test:queue", "two").await.unwrap();

        let popped = store.pop_many("test:queue", 10).await.unwrap();
        assert_eq!(popped, vec!["one".to_string(), "two".to_string()]);
    }
}
