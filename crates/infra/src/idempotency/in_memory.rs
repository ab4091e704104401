use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use conduit_core::IdempotencyKey;

use super::{CacheError, IdempotencyCache};
use crate::store::InitializeResult;

/// Entry count below which expired entries are left for `get` to drop.
const SWEEP_FLOOR: usize = 64;

/// Process-local fast tier.
///
/// Intended for tests/dev and single-instance deployments. Expired entries
/// are swept on `put` whenever the map has doubled since the last sweep.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyCache {
    inner: Mutex<Entries>,
    unavailable: AtomicBool,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<IdempotencyKey, (InitializeResult, Instant)>,
    sweep_at: usize,
}

impl Entries {
    fn sweep(&mut self, now: Instant) {
        self.map.retain(|_, (_, expires)| *expires > now);
        self.sweep_at = (self.map.len() * 2).max(SWEEP_FLOOR);
    }
}

impl InMemoryIdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage of the cache backend.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of entries held, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|inner| inner.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry now.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let before = inner.map.len();
        inner.sweep(Instant::now());
        before - inner.map.len()
    }

    fn ensure_available(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("in-memory cache marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyCache for InMemoryIdempotencyCache {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<InitializeResult>, CacheError> {
        self.ensure_available()?;
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| CacheError::Unavailable("lock poisoned".to_string()))?;

        match inner.map.get(key) {
            Some((result, expires)) if *expires > Instant::now() => Ok(Some(result.clone())),
            Some(_) => {
                inner.map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: &IdempotencyKey,
        result: &InitializeResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.ensure_available()?;
        let now = Instant::now();
        let Some(expires) = now.checked_add(ttl) else {
            return Err(CacheError::Codec(format!("ttl out of range: {ttl:?}")));
        };
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| CacheError::Unavailable("lock poisoned".to_string()))?;
        if inner.map.len() >= inner.sweep_at {
            inner.sweep(now);
        }
        inner.map.insert(key.clone(), (result.clone(), expires));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::{EntityId, Stage};

    fn result() -> InitializeResult {
        InitializeResult {
            entity_id: EntityId::new("course-1").unwrap(),
            state: Stage::first().init(),
            outbox_entries: vec![],
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = InMemoryIdempotencyCache::new();
        let key = IdempotencyKey::new("k").unwrap();

        cache.put(&key, &result(), Duration::ZERO).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), None);

        cache.put(&key, &result(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(result()));
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_without_being_read() {
        let cache = InMemoryIdempotencyCache::new();
        for i in 0..(SWEEP_FLOOR * 4) {
            let key = IdempotencyKey::new(format!("old-{i}")).unwrap();
            cache.put(&key, &result(), Duration::ZERO).await.unwrap();
        }
        assert!(cache.len() <= SWEEP_FLOOR);

        let live = IdempotencyKey::new("live").unwrap();
        cache.put(&live, &result(), Duration::from_secs(60)).await.unwrap();
        cache.purge_expired();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&live).await.unwrap(), Some(result()));
    }

    #[tokio::test]
    async fn outage_is_reported() {
        let cache = InMemoryIdempotencyCache::new();
        cache.set_unavailable(true);
        let key = IdempotencyKey::new("k").unwrap();
        assert!(matches!(
            cache.get(&key).await,
            Err(CacheError::Unavailable(_))
        ));
    }
}
