//! Metering store abstraction
//!
//! Provides the `MeterStore` trait plus an in-memory implementation.
//!
//! The store exposes exactly the primitives usage accounting needs:
//! string get/set with TTL, atomic increment with TTL, list push/pop
//! (the usage-event queue) and TTL introspection. Any key-value store
//! with these atomicity guarantees can back it; production uses Redis
//! (`RedisMeterStore`), tests use `MemoryMeterStore`.
//!
//! Every consumer in this crate takes an `Option<Arc<dyn MeterStore>>`
//! and is defined over both presence and absence of a backend.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Storage backend for usage accounting state
#[async_trait]
pub trait MeterStore: Send + Sync {
    /// Get a string value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value with a TTL in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;

    /// Atomically increment a counter; the first increment in a window
    /// sets the expiry, later increments leave it untouched
    async fn incr_ex(&self, key: &str, ttl_seconds: u64) -> Result<i64>;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Push a value onto the head of a list, returning the new length
    async fn push(&self, key: &str, value: &str) -> Result<u64>;

    /// Destructively pop up to `count` values from the tail of a list
    ///
    /// Each popped value is observed exactly once across all callers.
    async fn pop_many(&self, key: &str, count: usize) -> Result<Vec<String>>;

    /// Remaining TTL for a key in seconds, `None` if absent or unexpiring
    async fn ttl_seconds(&self, key: &str) -> Result<Option<u64>>;
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store for development and tests
///
/// Data is lost on restart and not shared across processes; production
/// deployments use `RedisMeterStore` so that multiple router processes
/// can drain the same event queue safely.
#[derive(Default)]
pub struct MemoryMeterStore {
    entries: RwLock<HashMap<String, Entry>>,
    queues: RwLock<HashMap<String, VecDeque<String>>>,
}

impl MemoryMeterStore {
    /// Create an empty in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeterStore for MemoryMeterStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl_seconds: u64) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let current = entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.value.parse::<i64>().ok());

        match current {
            Some(count) => {
                let next = count + 1;
                // Window expiry was fixed by the first increment
                let expires_at = entries.get(key).and_then(|e| e.expires_at);
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: next.to_string(),
                        expires_at,
                    },
                );
                Ok(next)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds)),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn push(&self, key: &str, value: &str) -> Result<u64> {
        let mut queues = self.queues.write().await;
        let queue = queues.entry(key.to_string()).or_default();
        queue.push_front(value.to_string());
        Ok(queue.len() as u64)
    }

    async fn pop_many(&self, key: &str, count: usize) -> Result<Vec<String>> {
        let mut queues = self.queues.write().await;
        let Some(queue) = queues.get_mut(key) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::new();
        while popped.len() < count {
            match queue.pop_back() {
                Some(value) => popped.push(value),
                None => break,
            }
        }
        Ok(popped)
    }

    async fn ttl_seconds(&self, key: &str) -> Result<Option<u64>> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()).as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let store = MemoryMeterStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_counts_up() {
        let store = MemoryMeterStore::new();
        assert_eq!(store.incr_ex("c", 60).await.unwrap(), 1);
        assert_eq!(store.incr_ex("c", 60).await.unwrap(), 2);
        assert_eq!(store.incr_ex("c", 60).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_resets_counter() {
        let store = MemoryMeterStore::new();
        store.incr_ex("c", 60).await.unwrap();
        assert!(store.delete("c").await.unwrap());
        assert_eq!(store.incr_ex("c", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queue_is_fifo_and_destructive() {
        let store = MemoryMeterStore::new();
        store.push("q", "a").await.unwrap();
        store.push("q", "b").await.unwrap();
        store.push("q", "c").await.unwrap();

        let first = store.pop_many("q", 2).await.unwrap();
        assert_eq!(first, vec!["a".to_string(), "b".to_string()]);

        let rest = store.pop_many("q", 10).await.unwrap();
        assert_eq!(rest, vec!["c".to_string()]);

        assert!(store.pop_many("q", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ttl_reported_for_expiring_keys() {
        let store = MemoryMeterStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        let ttl = store.ttl_seconds("k").await.unwrap();
        assert!(ttl.is_some_and(|secs| secs <= 60));
        assert_eq!(store.ttl_seconds("missing").await.unwrap(), None);
    }
}
