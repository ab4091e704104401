//! Redis Streams-backed job queue.
//!
//! Layout per queue `{name}`:
//!
//! - `conduit:queue:{name}:jobs`: work stream read by consumers through the
//!   `conduit-workers` consumer group
//! - `conduit:queue:{name}:job:{id}`: marker claiming a job id
//! - `conduit:queue:{name}:events`: announcement stream for subscribers
//!
//! Enqueue runs one Lua script, so claiming the id and appending to both
//! streams is atomic: a job id is appended at most once while its marker
//! lives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use conduit_events::{JobCreated, Subscription};

use super::{EnqueueOptions, EnqueueOutcome, JobHandle, JobQueue, QueueError, QueuedJob};

const KEY_PREFIX: &str = "conduit:queue";
const CONSUMER_GROUP: &str = "conduit-workers";
/// How long a job id stays claimed after creation.
const MARKER_TTL_SECS: u64 = 7 * 24 * 60 * 60;
/// Approximate cap on the announcement stream length.
const EVENTS_MAXLEN: usize = 10_000;
const SUBSCRIPTION_BUFFER: usize = 1024;
const SUBSCRIBE_BLOCK_MS: usize = 1_000;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Stream id below every real entry.
const STREAM_ORIGIN: &str = "0-0";

const ENQUEUE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], '1', 'NX', 'EX', ARGV[5]) then
  redis.call('XADD', KEYS[2], '*',
    'job_id', ARGV[1], 'payload', ARGV[2], 'options', ARGV[3], 'created_at', ARGV[4])
  redis.call('XADD', KEYS[3], 'MAXLEN', '~', ARGV[6], '*',
    'job_id', ARGV[1], 'payload', ARGV[2], 'created_at', ARGV[4])
  return 1
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisStreamsJobQueue {
    client: Arc<redis::Client>,
    script: Arc<redis::Script>,
    consumer_name: String,
}

impl RedisStreamsJobQueue {
    /// `consumer_name` identifies this process inside the consumer group.
    pub fn new(
        redis_url: impl AsRef<str>,
        consumer_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(classify)?;
        Ok(Self {
            client: Arc::new(client),
            script: Arc::new(redis::Script::new(ENQUEUE_SCRIPT)),
            consumer_name: consumer_name.into(),
        })
    }

    fn jobs_key(queue_name: &str) -> String {
        format!("{KEY_PREFIX}:{queue_name}:jobs")
    }

    fn marker_key(queue_name: &str, job_id: &str) -> String {
        format!("{KEY_PREFIX}:{queue_name}:job:{job_id}")
    }

    fn events_key(queue_name: &str) -> String {
        format!("{KEY_PREFIX}:{queue_name}:events")
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)
    }

    /// Create the consumer group for `queue_name` (idempotent).
    async fn ensure_consumer_group(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue_name: &str,
    ) -> Result<(), QueueError> {
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(Self::jobs_key(queue_name), CONSUMER_GROUP, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}

#[async_trait]
impl JobQueue for RedisStreamsJobQueue {
    #[instrument(skip(self, payload, options), fields(queue = queue_name, job_id = %options.job_id), err)]
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &JsonValue,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let payload_json = serde_json::to_string(payload)
            .map_err(|e| QueueError::Permanent(format!("unserializable payload: {e}")))?;
        let options_json = match &options.options {
            Some(opts) => serde_json::to_string(opts)
                .map_err(|e| QueueError::Permanent(format!("unserializable options: {e}")))?,
            None => String::new(),
        };

        let mut conn = self.connection().await?;
        let created: i64 = self
            .script
            .key(Self::marker_key(queue_name, &options.job_id))
            .key(Self::jobs_key(queue_name))
            .key(Self::events_key(queue_name))
            .arg(&options.job_id)
            .arg(payload_json)
            .arg(options_json)
            .arg(Utc::now().to_rfc3339())
            .arg(MARKER_TTL_SECS)
            .arg(EVENTS_MAXLEN)
            .invoke_async(&mut conn)
            .await
            .map_err(classify)?;

        let handle = JobHandle {
            queue_name: queue_name.to_string(),
            job_id: options.job_id,
        };
        if created == 1 {
            Ok(EnqueueOutcome::Created(handle))
        } else {
            Ok(EnqueueOutcome::AlreadyExists(handle))
        }
    }

    async fn subscribe(&self, queue_name: &str) -> Result<Subscription<JobCreated>, QueueError> {
        // Pin the start position now: announcements made after this call
        // returns are delivered even if the reader has not issued its first
        // XREAD yet.
        let mut conn = self.connection().await?;
        let key = Self::events_key(queue_name);
        let newest: StreamRangeReply = conn
            .xrevrange_count(&key, "+", "-", 1)
            .await
            .map_err(classify)?;
        drop(conn);

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = Arc::clone(&self.client);
        let queue_name = queue_name.to_string();
        tokio::spawn(read_announcements(client, queue_name, start_id(&newest), tx));
        Ok(Subscription::new(rx))
    }

    #[instrument(skip(self), fields(queue = queue_name), err)]
    async fn dequeue(&self, queue_name: &str) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection().await?;
        self.ensure_consumer_group(&mut conn, queue_name).await?;

        let key = Self::jobs_key(queue_name);
        let opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer_name)
            .count(1);
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&key], &[">"], &opts)
            .await
            .map_err(classify)?;

        let Some(entry) = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next()
        else {
            return Ok(None);
        };

        // Acknowledge on receipt: the job is handed over exactly when it is returned.
        let _: i64 = conn
            .xack(&key, CONSUMER_GROUP, &[&entry.id])
            .await
            .map_err(classify)?;

        decode_job(queue_name, &entry).map(Some)
    }
}

/// Id after which a new subscription starts reading.
fn start_id(newest: &StreamRangeReply) -> String {
    newest
        .ids
        .first()
        .map(|entry| entry.id.clone())
        .unwrap_or_else(|| STREAM_ORIGIN.to_string())
}

/// Follow the announcement stream of `queue_name` until the subscriber goes away.
///
/// Reads always resume from the last id seen, never from `$`, so entries
/// appended between two blocking reads or during a reconnect are not skipped.
async fn read_announcements(
    client: Arc<redis::Client>,
    queue_name: String,
    mut last_id: String,
    tx: mpsc::Sender<JobCreated>,
) {
    let key = RedisStreamsJobQueue::events_key(&queue_name);

    while !tx.is_closed() {
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(queue = %queue_name, error = %e, "announcement reader cannot connect");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        loop {
            if tx.is_closed() {
                return;
            }
            let opts = StreamReadOptions::default().block(SUBSCRIBE_BLOCK_MS).count(100);
            let reply: Result<Option<StreamReadReply>, _> =
                conn.xread_options(&[&key], &[&last_id], &opts).await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    warn!(queue = %queue_name, error = %e, "announcement read failed; reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    break;
                }
            };

            for entry in reply.into_iter().flat_map(|r| r.keys).flat_map(|k| k.ids) {
                last_id = entry.id.clone();
                match decode_announcement(&queue_name, &entry) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(queue = %queue_name, id = %entry.id, error = %e, "skipping malformed announcement"),
                }
            }
        }
    }
    debug!(queue = %queue_name, "announcement reader stopped");
}

fn field<T: redis::FromRedisValue>(entry: &StreamId, name: &str) -> Result<T, QueueError> {
    entry
        .get(name)
        .ok_or_else(|| QueueError::Permanent(format!("stream entry {} missing '{name}'", entry.id)))
}

fn decode_payload(raw: &str) -> Result<JsonValue, QueueError> {
    serde_json::from_str(raw).map_err(|e| QueueError::Permanent(format!("bad payload: {e}")))
}

fn decode_time(raw: &str) -> Result<DateTime<Utc>, QueueError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QueueError::Permanent(format!("bad created_at: {e}")))
}

fn decode_job(queue_name: &str, entry: &StreamId) -> Result<QueuedJob, QueueError> {
    let payload: String = field(entry, "payload")?;
    let options: String = field(entry, "options")?;
    let created_at: String = field(entry, "created_at")?;
    Ok(QueuedJob {
        queue_name: queue_name.to_string(),
        job_id: field(entry, "job_id")?,
        payload: decode_payload(&payload)?,
        options: if options.is_empty() {
            None
        } else {
            Some(decode_payload(&options)?)
        },
        enqueued_at: decode_time(&created_at)?,
    })
}

fn decode_announcement(queue_name: &str, entry: &StreamId) -> Result<JobCreated, QueueError> {
    let payload: String = field(entry, "payload")?;
    let created_at: String = field(entry, "created_at")?;
    Ok(JobCreated {
        queue_name: queue_name.to_string(),
        job_id: field(entry, "job_id")?,
        payload: decode_payload(&payload)?,
        created_at: decode_time(&created_at)?,
    })
}

/// Connection-level failures are transient; everything else is permanent.
fn classify(err: redis::RedisError) -> QueueError {
    let transient = err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || matches!(
            err.kind(),
            redis::ErrorKind::BusyLoadingError
                | redis::ErrorKind::TryAgain
                | redis::ErrorKind::ClusterDown
        );
    if transient {
        QueueError::Transient(err.to_string())
    } else {
        QueueError::Permanent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_per_queue() {
        assert_eq!(
            RedisStreamsJobQueue::jobs_key("analysis"),
            "conduit:queue:analysis:jobs"
        );
        assert_eq!(
            RedisStreamsJobQueue::marker_key("analysis", "0190"),
            "conduit:queue:analysis:job:0190"
        );
        assert_eq!(
            RedisStreamsJobQueue::events_key("analysis"),
            "conduit:queue:analysis:events"
        );
    }

    #[test]
    fn subscriptions_start_after_the_newest_announcement() {
        assert_eq!(start_id(&StreamRangeReply::default()), "0-0");

        let newest = StreamRangeReply {
            ids: vec![StreamId {
                id: "1718000000000-3".to_string(),
                map: Default::default(),
            }],
        };
        assert_eq!(start_id(&newest), "1718000000000-3");
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(classify(redis::RedisError::from(io)).is_transient());
    }

    #[test]
    fn type_errors_are_permanent() {
        let err = redis::RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!classify(err).is_transient());
    }
}
