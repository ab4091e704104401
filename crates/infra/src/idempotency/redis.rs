//! Redis-backed fast tier (`SET … EX`).
//!
//! Keys live under `conduit:idempotency:{key}` and carry the JSON-encoded
//! result. Redis expiry handles TTL; the durable store stays authoritative.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use conduit_core::IdempotencyKey;

use super::{CacheError, IdempotencyCache};
use crate::store::InitializeResult;

const KEY_PREFIX: &str = "conduit:idempotency";

#[derive(Debug, Clone)]
pub struct RedisIdempotencyCache {
    client: Arc<redis::Client>,
}

impl RedisIdempotencyCache {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn redis_key(key: &IdempotencyKey) -> String {
        format!("{KEY_PREFIX}:{key}")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CacheError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl IdempotencyCache for RedisIdempotencyCache {
    #[instrument(skip(self), fields(key = %key), err)]
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<InitializeResult>, CacheError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("GET failed: {e}")))?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| CacheError::Codec(e.to_string()))
        })
        .transpose()
    }

    #[instrument(skip(self, result), fields(key = %key), err)]
    async fn put(
        &self,
        key: &IdempotencyKey,
        result: &InitializeResult,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let payload = serde_json::to_string(result).map_err(|e| CacheError::Codec(e.to_string()))?;
        let mut conn = self.connection().await?;

        let _: () = redis::cmd("SET")
            .arg(Self::redis_key(key))
            .arg(payload)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(format!("SET failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let key = IdempotencyKey::new("queue-backup:summarization:42").unwrap();
        assert_eq!(
            RedisIdempotencyCache::redis_key(&key),
            "conduit:idempotency:queue-backup:summarization:42"
        );
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(RedisIdempotencyCache::new("not a url").is_err());
    }
}
