//! In-process store used by tests in place of a Redis deployment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{KvError, KvStore, LockLease, ReleaseFence};

#[derive(Default)]
struct State {
    values: HashMap<String, String>,
    expirations: HashMap<String, Instant>,
}

impl State {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expirations
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.values.remove(&key);
            self.expirations.remove(&key);
        }
    }
}

/// A `KvStore` over a plain map, with the same missing-key and fenced
/// lock semantics as the Redis backend.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries, for test assertions.
    pub fn len(&self) -> usize {
        let mut state = self.state.lock();
        state.purge_expired();
        state.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let mut state = self.state.lock();
        state.purge_expired();
        state.values.get(key).cloned().ok_or(KvError::Missing)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.values.insert(key.to_string(), value.to_string());
        state.expirations.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        state.purge_expired();
        Ok(state.values.contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.values.remove(key);
        state.expirations.remove(key);
        Ok(())
    }

    async fn flush_all(&self) -> Result<(), KvError> {
        let mut state = self.state.lock();
        state.values.clear();
        state.expirations.clear();
        Ok(())
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, KvError> {
        let fence = Uuid::new_v4().to_string();
        let mut state = self.state.lock();
        state.purge_expired();
        if state.values.contains_key(key) {
            return Ok(None);
        }
        state.values.insert(key.to_string(), fence.clone());
        state
            .expirations
            .insert(key.to_string(), Instant::now() + ttl);
        drop(state);
        Ok(Some(LockLease::new(
            Arc::new(self.clone()),
            key.to_string(),
            fence,
        )))
    }
}

#[async_trait]
impl ReleaseFence for MemoryStore {
    async fn release_fenced(&self, key: &str, fence: &str) -> Result<bool, KvError> {
        let mut state = self.state.lock();
        state.purge_expired();
        if state.values.get(key).map(String::as_str) == Some(fence) {
            state.values.remove(key);
            state.expirations.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvstore::RetryPolicy;

    #[tokio::test]
    async fn get_returns_missing_sentinel() {
        let store = MemoryStore::new();
        assert!(matches!(store.get("veh-1234").await, Err(KvError::Missing)));
        store.set("veh-1234", "test.test").await.unwrap();
        assert_eq!(store.get("veh-1234").await.unwrap(), "test.test");
    }

    #[tokio::test]
    async fn delete_and_flush_remove_entries() {
        let store = MemoryStore::new();
        store.set("veh-1", "a").await.unwrap();
        store.set("veh-2", "b").await.unwrap();
        store.delete("veh-1").await.unwrap();
        assert!(!store.exists("veh-1").await.unwrap());
        store.flush_all().await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lock_is_mutually_exclusive() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(5);
        let lease = store.try_lock("lock:veh-1234", ttl).await.unwrap().unwrap();
        assert!(store.try_lock("lock:veh-1234", ttl).await.unwrap().is_none());
        assert!(lease.release().await.unwrap());
        assert!(store.try_lock("lock:veh-1234", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_expires_after_ttl() {
        let store = MemoryStore::new();
        let lease = store
            .try_lock("lock:veh-1234", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = store
            .try_lock("lock:veh-1234", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(second.is_some());
        // the expired lease lost its fence, so release is a no-op
        assert!(!lease.release().await.unwrap());
    }

    #[tokio::test]
    async fn release_with_stale_fence_keeps_new_owner() {
        let store = MemoryStore::new();
        let stale = store
            .try_lock("lock:sw-9", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let _current = store
            .try_lock("lock:sw-9", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert!(!stale.release().await.unwrap());
        assert!(store.exists("lock:sw-9").await.unwrap());
    }

    #[tokio::test]
    async fn obtain_lock_retries_then_reports_busy() {
        let store = MemoryStore::new();
        let _held = store
            .try_lock("lock:veh-1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let retry = RetryPolicy {
            attempts: 3,
            backoff: Duration::from_millis(5),
        };
        let result = store.obtain_lock("lock:veh-1", Duration::from_secs(5), retry).await;
        assert!(matches!(result, Err(KvError::LockBusy)));
    }

    #[tokio::test]
    async fn obtain_lock_succeeds_once_freed() {
        let store = MemoryStore::new();
        let held = store
            .try_lock("lock:veh-1", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let retry = RetryPolicy {
                    attempts: 10,
                    backoff: Duration::from_millis(20),
                };
                store.obtain_lock("lock:veh-1", Duration::from_secs(5), retry).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        held.release().await.unwrap();
        assert!(contender.await.unwrap().is_ok());
    }
}
