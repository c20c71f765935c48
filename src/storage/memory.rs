use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::traits::StateStore;

#[derive(Debug, Clone)]
enum Stored {
    Scalar(Value),
    List(VecDeque<Value>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local `StateStore`. State does not survive a restart.
#[derive(Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops expired keys and returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(now)) {
            Some(Entry {
                value: Stored::Scalar(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(Entry {
                value: Stored::List(items),
                ..
            }) => Ok(Some(Value::Array(items.iter().cloned().collect()))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Scalar(value),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| e.is_live(now)))
    }

    async fn increment(&self, key: &str, delta: f64, ttl: Option<Duration>) -> Result<f64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let current = match entries.get(key).filter(|e| e.is_live(now)) {
            Some(Entry {
                value: Stored::Scalar(value),
                expires_at,
            }) => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("key '{}' does not hold a number", key))?;
                Some((number, *expires_at))
            }
            Some(_) => return Err(anyhow!("key '{}' holds a list", key)),
            None => None,
        };

        let (updated, expires_at) = match current {
            Some((number, expires_at)) => (number + delta, expires_at),
            None => (delta, ttl.map(|ttl| now + ttl)),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: Stored::Scalar(Value::from(updated)),
                expires_at,
            },
        );
        Ok(updated)
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: Value,
        max_len: usize,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry {
                value: Stored::List(VecDeque::new()),
                expires_at: None,
            });
        if !entry.is_live(now) {
            entry.value = Stored::List(VecDeque::new());
        }

        let Stored::List(items) = &mut entry.value else {
            return Err(anyhow!("key '{}' does not hold a list", key));
        };
        items.push_back(value);
        while items.len() > max_len {
            items.pop_front();
        }
        entry.expires_at = ttl.map(|ttl| now + ttl);
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<Value>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(now)) {
            Some(Entry {
                value: Stored::List(items),
                ..
            }) => Ok(items.iter().cloned().collect()),
            Some(_) => Err(anyhow!("key '{}' does not hold a list", key)),
            None => Ok(Vec::new()),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_and_get() {
        let store = InMemoryStore::new();
        store.set("a", json!({"x": 1}), None).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_key_is_missing() {
        let store = InMemoryStore::new();
        store
            .set("marker", json!("blocked"), Some(Duration::from_secs(60)))
            .await
            .unwrap();
        store
            .set("stale", json!(1), Some(Duration::from_secs(30)))
            .await
            .unwrap();
        store.set("kept", json!(2), None).await.unwrap();
        assert!(store.ttl("marker").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(store.get("marker").await.unwrap(), None);
        assert!(!store.delete("marker").await.unwrap());
        // "marker" went with the delete; only "stale" is left to purge.
        assert_eq!(store.purge_expired().await, 1);
        assert_eq!(store.purge_expired().await, 0);
        assert_eq!(store.get("kept").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_original_expiry() {
        let store = InMemoryStore::new();
        let ttl = Some(Duration::from_secs(10));

        assert_eq!(store.increment("cost", 1.5, ttl).await.unwrap(), 1.5);
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.increment("cost", 1.0, ttl).await.unwrap(), 2.5);
        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.get("cost").await.unwrap(), None);
        assert_eq!(store.increment("cost", 1.0, ttl).await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_push_bounded_drops_oldest() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.push_bounded("log", json!(i), 3, None).await.unwrap();
        }

        let items = store.list("log").await.unwrap();
        assert_eq!(items, vec![json!(2), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn test_type_mismatch_is_an_error() {
        let store = InMemoryStore::new();
        store.push_bounded("log", json!(1), 3, None).await.unwrap();

        assert!(store.increment("log", 1.0, None).await.is_err());
        store.set("scalar", json!(1), None).await.unwrap();
        assert!(store.list("scalar").await.is_err());
    }
}
