use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use conduit_core::{
    DomainError, EntityId, IdempotencyKey, InitiatedBy, LifecycleState, OutboxId,
};
use conduit_events::{JobDescriptor, TransitionEvent};

/// Current lifecycle state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    pub entity_id: EntityId,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One job that must be created in the distributed queue.
///
/// `outbox_id` doubles as the queue job id, so creating the job twice for the
/// same row is harmless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub outbox_id: OutboxId,
    pub entity_id: EntityId,
    pub queue_name: String,
    pub job_payload: JsonValue,
    pub job_options: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    /// Earliest time the row may be attempted (pushed forward by backoff).
    pub available_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Set on a permanent error or once attempts are exhausted.
    pub abandoned_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned_at.is_some()
    }

    /// Unprocessed, not abandoned and past its backoff.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_processed() && !self.is_abandoned() && self.available_at <= now
    }

    pub fn to_ref(&self) -> OutboxRef {
        OutboxRef {
            outbox_id: self.outbox_id,
            queue_name: self.queue_name.clone(),
        }
    }
}

/// Reference to an outbox row returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRef {
    pub outbox_id: OutboxId,
    pub queue_name: String,
}

/// Outcome of `initialize`.
///
/// Every caller using the same idempotency key sees the same `state` and
/// `outbox_entries`; only `from_cache` tells the first caller apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeResult {
    pub entity_id: EntityId,
    pub state: LifecycleState,
    pub outbox_entries: Vec<OutboxRef>,
    #[serde(default)]
    pub from_cache: bool,
}

impl InitializeResult {
    pub fn cached(mut self) -> Self {
        self.from_cache = true;
        self
    }
}

/// Idempotency key → result of the command it authorized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub entity_id: EntityId,
    pub result: InitializeResult,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Request to start or advance an entity's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct InitializeCommand {
    pub entity_id: EntityId,
    pub initial_state: LifecycleState,
    pub jobs: Vec<JobDescriptor>,
    pub idempotency_key: IdempotencyKey,
    pub initiated_by: InitiatedBy,
    /// Free-form context copied onto the transition events.
    pub metadata: JsonValue,
}

impl InitializeCommand {
    pub fn new(
        entity_id: EntityId,
        initial_state: LifecycleState,
        idempotency_key: IdempotencyKey,
        initiated_by: InitiatedBy,
    ) -> Self {
        Self {
            entity_id,
            initial_state,
            jobs: Vec::new(),
            idempotency_key,
            initiated_by,
            metadata: JsonValue::Object(Default::default()),
        }
    }

    pub fn with_jobs(mut self, jobs: impl IntoIterator<Item = JobDescriptor>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    pub fn with_job(mut self, job: JobDescriptor) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of the atomic store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicOutcome {
    /// This call performed the writes.
    Committed(InitializeResult),
    /// The key had already been used; nothing was written.
    AlreadyApplied(IdempotencyRecord),
}

/// Pagination parameters for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection, pool, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Another transaction committed the same idempotency key first.
    #[error("idempotency key already used: {0}")]
    IdempotencyConflict(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A persisted row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// The single atomic write path.
#[async_trait]
pub trait CommandStore: Send + Sync {
    /// Validate and apply `command` in one transaction.
    ///
    /// Writes the lifecycle change, its transition events, one outbox row per
    /// job and the idempotency record, or nothing at all. An unexpired record
    /// for the key short-circuits to [`AtomicOutcome::AlreadyApplied`].
    async fn initialize_atomic(
        &self,
        command: &InitializeCommand,
        ttl: Duration,
    ) -> Result<AtomicOutcome, StoreError>;

    /// Durable idempotency lookup; expired records read as absent.
    async fn find_idempotency(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;
}

/// Outbox operations used by the processor and by operators.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Due rows ordered by creation (`created_at`, then insertion order).
    ///
    /// A row whose entity has an earlier row still waiting out its backoff is
    /// not due, so one entity's rows are handed out in creation order.
    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Idempotent: marking an already processed row is a no-op.
    async fn mark_processed(&self, outbox_id: OutboxId, now: DateTime<Utc>)
    -> Result<(), StoreError>;

    /// Count a failed attempt and hold the row back until `available_at`.
    async fn record_retry(
        &self,
        outbox_id: OutboxId,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Count a failed attempt and park the row for manual inspection.
    async fn mark_abandoned(
        &self,
        outbox_id: OutboxId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Unprocessed, not abandoned rows.
    async fn backlog(&self) -> Result<u64, StoreError>;

    async fn list_abandoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Put an abandoned row back into rotation with a fresh attempt budget.
    async fn requeue(
        &self,
        outbox_id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<OutboxEntry, StoreError>;
}

/// Read-only queries for status endpoints.
#[async_trait]
pub trait LifecycleQuery: Send + Sync {
    async fn get_lifecycle(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<LifecycleRecord>, StoreError>;

    /// Oldest first.
    async fn list_transitions(
        &self,
        entity_id: &EntityId,
        pagination: Pagination,
    ) -> Result<Vec<TransitionEvent>, StoreError>;

    async fn list_outbox_for_entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<Vec<OutboxEntry>, StoreError>;
}

/// Retention purges; each returns the number of rows removed.
#[async_trait]
pub trait RetentionStore: Send + Sync {
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn purge_processed_outbox(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn purge_transition_events(&self, older_than: DateTime<Utc>)
    -> Result<u64, StoreError>;
}

/// Everything the orchestration components need from the durable store.
pub trait DurableStore: CommandStore + OutboxStore + LifecycleQuery + RetentionStore {}

impl<T> DurableStore for T where T: CommandStore + OutboxStore + LifecycleQuery + RetentionStore {}

/// Shared handle used by the components.
pub type SharedStore = Arc<dyn DurableStore>;

/// `at + duration`, saturating at the latest representable instant.
pub(crate) fn saturating_add(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `at - duration`, saturating at the earliest representable instant.
pub(crate) fn saturating_sub(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Everything `initialize_atomic` writes, computed before touching storage.
#[derive(Debug, Clone)]
pub(crate) struct StagedWrites {
    /// New or updated record; `None` when the state is unchanged.
    pub lifecycle: Option<LifecycleRecord>,
    pub created: bool,
    pub events: Vec<TransitionEvent>,
    pub outbox: Vec<OutboxEntry>,
    pub idempotency: IdempotencyRecord,
}

impl StagedWrites {
    /// Validate `command` against the current record and compose the writes.
    pub fn compose(
        command: &InitializeCommand,
        current: Option<&LifecycleRecord>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        use conduit_core::{StateMachine, TransitionPlan};

        let entity_id = &command.entity_id;
        let plan = StateMachine::plan(
            entity_id,
            current.map(|record| record.state),
            command.initial_state,
        )?;

        let event = |old: Option<LifecycleState>, new: LifecycleState| {
            TransitionEvent::new(
                entity_id.clone(),
                old,
                new,
                command.initiated_by,
                command.metadata.clone(),
                now,
            )
        };

        let (lifecycle, created, events) = match &plan {
            TransitionPlan::Create(state) => (
                Some(LifecycleRecord {
                    entity_id: entity_id.clone(),
                    state: *state,
                    created_at: now,
                    updated_at: now,
                }),
                true,
                vec![event(None, *state)],
            ),
            TransitionPlan::Unchanged(state) => (
                None,
                false,
                vec![TransitionEvent::noop(
                    entity_id.clone(),
                    *state,
                    command.initiated_by,
                    command.metadata.clone(),
                    now,
                )],
            ),
            TransitionPlan::Advance(hops) => (
                Some(LifecycleRecord {
                    entity_id: entity_id.clone(),
                    state: plan.resulting_state(),
                    created_at: current.map(|record| record.created_at).unwrap_or(now),
                    updated_at: now,
                }),
                false,
                hops.iter()
                    .map(|hop| event(Some(hop.from), hop.to))
                    .collect(),
            ),
        };

        let outbox: Vec<OutboxEntry> = command
            .jobs
            .iter()
            .map(|job| OutboxEntry {
                outbox_id: OutboxId::new(),
                entity_id: entity_id.clone(),
                queue_name: job.queue_name.clone(),
                job_payload: job.payload.clone(),
                job_options: job.options.clone(),
                created_at: now,
                available_at: now,
                processed_at: None,
                abandoned_at: None,
                attempts: 0,
                last_error: None,
            })
            .collect();

        let result = InitializeResult {
            entity_id: entity_id.clone(),
            state: plan.resulting_state(),
            outbox_entries: outbox.iter().map(OutboxEntry::to_ref).collect(),
            from_cache: false,
        };

        let idempotency = IdempotencyRecord {
            key: command.idempotency_key.clone(),
            entity_id: entity_id.clone(),
            result,
            created_at: now,
            expires_at: saturating_add(now, ttl),
        };

        Ok(Self {
            lifecycle,
            created,
            events,
            outbox,
            idempotency,
        })
    }

    pub fn result(&self) -> &InitializeResult {
        &self.idempotency.result
    }
}
