use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// Keyed store with TTL semantics backing markers, counters, caches and the
/// kill-switch event log.
///
/// Implementations must treat an expired key exactly like a missing one.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Stores `value`, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()>;

    /// Returns `true` when a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Adds `delta` to a numeric key and returns the new value. The expiry is
    /// applied only when the key is created.
    async fn increment(&self, key: &str, delta: f64, ttl: Option<Duration>) -> Result<f64>;

    /// Appends to a list, dropping the oldest entries beyond `max_len`. A
    /// provided `ttl` is refreshed on every push.
    async fn push_bounded(
        &self,
        key: &str,
        value: Value,
        max_len: usize,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Returns the list stored at `key`, oldest first.
    async fn list(&self, key: &str) -> Result<Vec<Value>>;

    /// Remaining lifetime of a key, `None` when missing or without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}
