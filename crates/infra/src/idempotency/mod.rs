//! Two-tier idempotency lookup.
//!
//! The fast tier (in-process or Redis) is best-effort: any failure there is
//! logged and treated as a miss. The durable store is the source of truth; a
//! durable hit backfills the fast tier for the record's remaining lifetime.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use conduit_core::IdempotencyKey;

use crate::store::{InitializeResult, SharedStore, StoreError};

pub use in_memory::InMemoryIdempotencyCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisIdempotencyCache;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),

    #[error("cache codec error: {0}")]
    Codec(String),
}

/// Fast, best-effort idempotency tier.
#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<InitializeResult>, CacheError>;

    async fn put(
        &self,
        key: &IdempotencyKey,
        result: &InitializeResult,
        ttl: Duration,
    ) -> Result<(), CacheError>;
}

/// Cache tier in front of the durable idempotency records.
#[derive(Clone)]
pub struct IdempotencyStore {
    cache: Arc<dyn IdempotencyCache>,
    durable: SharedStore,
}

impl IdempotencyStore {
    pub fn new(cache: Arc<dyn IdempotencyCache>, durable: SharedStore) -> Self {
        Self { cache, durable }
    }

    /// Previously composed result for `key`, marked `from_cache`.
    ///
    /// Only a durable-store failure is an error; the fast tier never fails
    /// the lookup.
    pub async fn check_and_return(
        &self,
        key: &IdempotencyKey,
    ) -> Result<Option<InitializeResult>, StoreError> {
        match self.cache.get(key).await {
            Ok(Some(result)) => {
                debug!(key = %key, "idempotency fast-tier hit");
                return Ok(Some(result.cached()));
            }
            Ok(None) => {}
            Err(err) => warn!(key = %key, error = %err, "idempotency cache read failed; treating as miss"),
        }

        let now = Utc::now();
        let Some(record) = self.durable.find_idempotency(key, now).await? else {
            return Ok(None);
        };

        debug!(key = %key, "idempotency durable hit; backfilling fast tier");
        let remaining = (record.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            self.store(key, &record.result, remaining).await;
        }
        Ok(Some(record.result.cached()))
    }

    /// Write `result` to the fast tier. The durable record is written by the
    /// atomic command path, so failures here only cost a later durable read.
    pub async fn store(&self, key: &IdempotencyKey, result: &InitializeResult, ttl: Duration) {
        let mut result = result.clone();
        result.from_cache = false;
        if let Err(err) = self.cache.put(key, &result, ttl).await {
            warn!(key = %key, error = %err, "idempotency cache write failed");
        }
    }
}

impl std::fmt::Debug for IdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AtomicOutcome, CommandStore, InMemoryStore, InitializeCommand};
    use conduit_core::{EntityId, InitiatedBy, Stage};

    const TTL: Duration = Duration::from_secs(600);

    async fn seeded() -> (Arc<InMemoryStore>, InitializeResult) {
        let store = Arc::new(InMemoryStore::new());
        let cmd = InitializeCommand::new(
            EntityId::new("course-1").unwrap(),
            Stage::first().init(),
            IdempotencyKey::new("key-1").unwrap(),
            InitiatedBy::Test,
        );
        let AtomicOutcome::Committed(result) = store.initialize_atomic(&cmd, TTL).await.unwrap()
        else {
            panic!("expected commit");
        };
        (store, result)
    }

    fn key() -> IdempotencyKey {
        IdempotencyKey::new("key-1").unwrap()
    }

    #[tokio::test]
    async fn durable_hit_backfills_cache() {
        let (store, result) = seeded().await;
        let cache = Arc::new(InMemoryIdempotencyCache::new());
        let idempotency = IdempotencyStore::new(cache.clone(), store);

        assert!(cache.get(&key()).await.unwrap().is_none());
        let hit = idempotency.check_and_return(&key()).await.unwrap().unwrap();

        assert!(hit.from_cache);
        assert_eq!(hit.outbox_entries, result.outbox_entries);
        assert_eq!(cache.get(&key()).await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn unavailable_cache_degrades_to_durable() {
        let (store, result) = seeded().await;
        let cache = Arc::new(InMemoryIdempotencyCache::new());
        cache.set_unavailable(true);
        let idempotency = IdempotencyStore::new(cache, store);

        let hit = idempotency.check_and_return(&key()).await.unwrap().unwrap();
        assert_eq!(hit.state, result.state);
        assert!(hit.from_cache);
    }

    #[tokio::test]
    async fn miss_everywhere_is_none() {
        let store = Arc::new(InMemoryStore::new());
        let idempotency = IdempotencyStore::new(Arc::new(InMemoryIdempotencyCache::new()), store);
        assert!(idempotency.check_and_return(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn durable_failure_is_an_error() {
        let (store, _) = seeded().await;
        store.set_unavailable(true);
        let idempotency = IdempotencyStore::new(Arc::new(InMemoryIdempotencyCache::new()), store);
        assert!(idempotency.check_and_return(&key()).await.unwrap_err().is_transient());
    }
}
