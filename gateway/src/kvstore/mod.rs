//! Key-value store surface shared by every gateway instance.
//!
//! The store is both the fast-path credential cache and the arbiter of
//! per-entity serialization: `obtain_lock` is an atomic set-if-not-exists
//! with a random fencing value, and a lease releases only while the store
//! still holds that fence.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("key not found")]
    Missing,
    #[error("lock is held by another owner")]
    LockBusy,
    #[error("store error: {0}")]
    Store(String),
}

/// Linear backoff for lock acquisition.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value for `key`, or `KvError::Missing`.
    async fn get(&self, key: &str) -> Result<String, KvError>;

    /// Unconditional write, no TTL.
    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    async fn exists(&self, key: &str) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Drops every key in the store. Reachable only through the debug
    /// flush endpoint.
    async fn flush_all(&self) -> Result<(), KvError>;

    /// One atomic set-if-not-exists attempt with a fresh fencing value.
    /// `None` means the key is currently held.
    async fn try_lock(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, KvError>;

    /// Acquires the lock, retrying per `retry`. Exhausting the retry
    /// budget yields `KvError::LockBusy`.
    async fn obtain_lock(
        &self,
        key: &str,
        ttl: Duration,
        retry: RetryPolicy,
    ) -> Result<LockLease, KvError> {
        let mut attempt = 0;
        loop {
            if let Some(lease) = self.try_lock(key, ttl).await? {
                return Ok(lease);
            }
            attempt += 1;
            if attempt >= retry.attempts {
                return Err(KvError::LockBusy);
            }
            tokio::time::sleep(retry.backoff).await;
        }
    }
}

/// Fenced delete a backend supplies so leases can release themselves.
#[async_trait]
pub trait ReleaseFence: Send + Sync {
    /// Deletes `key` only if it still holds `fence`. Returns whether the
    /// entry was deleted; `false` means the lease had already been lost.
    async fn release_fenced(&self, key: &str, fence: &str) -> Result<bool, KvError>;
}

/// A held per-entity lock. Dropping a lease without calling `release`
/// spawns a best-effort release so cancelled handlers do not leave the
/// key held for the full TTL.
pub struct LockLease {
    inner: Option<LeaseInner>,
}

struct LeaseInner {
    store: Arc<dyn ReleaseFence>,
    key: String,
    fence: String,
}

impl LockLease {
    pub fn new(store: Arc<dyn ReleaseFence>, key: String, fence: String) -> Self {
        Self {
            inner: Some(LeaseInner { store, key, fence }),
        }
    }

    pub fn key(&self) -> &str {
        self.inner.as_ref().map(|i| i.key.as_str()).unwrap_or("")
    }

    /// Releases the lock if this lease still owns it. Returns whether
    /// the store entry was deleted.
    pub async fn release(mut self) -> Result<bool, KvError> {
        let Some(inner) = self.inner.take() else {
            return Ok(false);
        };
        inner.store.release_fenced(&inner.key, &inner.fence).await
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = inner.store.release_fenced(&inner.key, &inner.fence).await {
                    tracing::warn!(key = %inner.key, error = %err, "best-effort lock release failed");
                }
            });
        }
    }
}
