//! Verdict persistence.
//!
//! The orchestrator talks to a [`VerdictStore`]; deployments plug in their own
//! database. [`MemoryVerdictStore`] is a bounded in-process implementation.

use crate::verdict::RiskVerdict;
use crate::whois::NetworkInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Error from a verdict store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Everything persisted for one origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredReputation {
    pub verdict: Option<RiskVerdict>,
    pub network: Option<NetworkInfo>,
    pub stored_at: Option<DateTime<Utc>>,
}

impl StoredReputation {
    /// Fresh verdict, if any.
    pub fn live_verdict(&self, now: DateTime<Utc>) -> Option<&RiskVerdict> {
        self.verdict.as_ref().filter(|v| !v.is_expired_at(now))
    }

    /// Fresh network record, if any.
    pub fn live_network(&self, now: DateTime<Utc>) -> Option<&NetworkInfo> {
        self.network.as_ref().filter(|n| !n.is_expired_at(now))
    }

    /// True once every stored part has expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.live_verdict(now).is_none() && self.live_network(now).is_none()
    }
}

/// Persistent store consulted before any provider fan-out.
#[async_trait]
pub trait VerdictStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<StoredReputation>, StoreError>;

    async fn put(&self, key: &str, entry: StoredReputation) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Thread-safe bounded map of stored reputations.
pub struct MemoryVerdictStore {
    entries: RwLock<HashMap<String, StoredReputation>>,
    max_entries: usize,
}

impl MemoryVerdictStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Remove expired entries.
    pub fn cleanup(&self) -> usize {
        let now = Utc::now();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, v| !v.is_expired_at(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VerdictStore for MemoryVerdictStore {
    async fn get(&self, key: &str) -> Result<Option<StoredReputation>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, mut entry: StoredReputation) -> Result<(), StoreError> {
        let now = Utc::now();
        entry.stored_at = Some(now);

        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            entries.retain(|_, v| !v.is_expired_at(now));

            // Still full: drop the oldest write.
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, v)| v.stored_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stored(score: u8, ttl: Duration) -> StoredReputation {
        let mut verdict = RiskVerdict::unknown(score);
        verdict.expires_at = Some(Utc::now() + ttl);
        StoredReputation {
            verdict: Some(verdict),
            network: None,
            stored_at: None,
        }
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryVerdictStore::new(100);
        store.put("192.0.2.1", stored(75, Duration::hours(1))).await.unwrap();

        let entry = store.get("192.0.2.1").await.unwrap().unwrap();
        assert_eq!(entry.verdict.as_ref().unwrap().score, 75);
        assert!(entry.stored_at.is_some());
        assert!(entry.live_verdict(Utc::now()).is_some());
        assert!(store.get("192.0.2.2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_not_live() {
        let store = MemoryVerdictStore::new(100);
        store.put("a", stored(10, Duration::seconds(-1))).await.unwrap();

        let entry = store.get("a").await.unwrap().unwrap();
        assert!(entry.live_verdict(Utc::now()).is_none());
        assert!(entry.is_expired_at(Utc::now()));

        assert_eq!(store.cleanup(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = MemoryVerdictStore::new(2);
        store.put("a", stored(10, Duration::hours(1))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.put("b", stored(20, Duration::hours(1))).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.put("c", stored(30, Duration::hours(1))).await.unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = MemoryVerdictStore::new(10);
        store.put("a", stored(10, Duration::hours(1))).await.unwrap();
        store.remove("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
    }
}
