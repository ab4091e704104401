//! Distributed job queue boundary.
//!
//! Queues create jobs idempotently by job id: enqueueing an id that already
//! exists reports [`EnqueueOutcome::AlreadyExists`] instead of creating a
//! second job. Every created job is announced to subscribers of its queue as
//! a [`JobCreated`] message.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conduit_events::{JobCreated, Subscription};

pub use in_memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsJobQueue;

/// Options accompanying an enqueue call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Caller-chosen job id; the queue refuses to create it twice.
    pub job_id: String,
    /// Backend-specific options passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JsonValue>,
}

impl EnqueueOptions {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            options: None,
        }
    }

    pub fn with_options(mut self, options: Option<JsonValue>) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub queue_name: String,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(JobHandle),
    /// A job with this id already exists; nothing new was created.
    AlreadyExists(JobHandle),
}

impl EnqueueOutcome {
    pub fn handle(&self) -> &JobHandle {
        match self {
            EnqueueOutcome::Created(handle) | EnqueueOutcome::AlreadyExists(handle) => handle,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::AlreadyExists(_))
    }
}

/// A job handed to a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub queue_name: String,
    pub job_id: String,
    pub payload: JsonValue,
    pub options: Option<JsonValue>,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn created_event(&self) -> JobCreated {
        JobCreated {
            queue_name: self.queue_name.clone(),
            job_id: self.job_id.clone(),
            payload: self.payload.clone(),
            created_at: self.enqueued_at,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Connection loss, timeout, overload: worth retrying later.
    #[error("transient queue error: {0}")]
    Transient(String),

    /// The queue rejected the job and will keep rejecting it.
    #[error("permanent queue error: {0}")]
    Permanent(String),
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transient(_))
    }
}

/// Distributed queue client.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Create a job unless one with `options.job_id` already exists.
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &JsonValue,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError>;

    /// Announcements for jobs created on `queue_name` from now on.
    async fn subscribe(&self, queue_name: &str) -> Result<Subscription<JobCreated>, QueueError>;

    /// Take the next job from `queue_name`, if any.
    async fn dequeue(&self, queue_name: &str) -> Result<Option<QueuedJob>, QueueError>;
}
