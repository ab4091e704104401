//! The sanctioned entry point for starting or advancing an entity's pipeline.
//!
//! ```text
//! InitializeCommand
//!   ↓
//! 1. Validate job descriptors (queue name, entity id in payload)
//!   ↓
//! 2. Idempotency lookup (fast tier, then durable) → hit returns `from_cache = true`
//!   ↓
//! 3. One store transaction: lifecycle upsert + transition events + outbox rows
//!    + idempotency record, all or nothing
//!   ↓
//! 4. Backfill the fast tier, return `from_cache = false`
//! ```
//!
//! The handler never talks to the job queue. Jobs reach the queue through the
//! outbox processor once the transaction has committed.
//!
//! Callers get one of three outcomes: a result, an invalid transition (do not
//! retry), or an infrastructure failure (retry with the same idempotency key).

use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use conduit_core::{DomainError, EntityId, LifecycleState};
use conduit_events::ENTITY_ID_FIELD;

use crate::idempotency::IdempotencyStore;
use crate::store::{
    AtomicOutcome, InitializeCommand, InitializeResult, LifecycleQuery, SharedStore, StoreError,
};

/// Default idempotency record lifetime.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum CommandError {
    /// The requested state change is not allowed from the entity's current state.
    ///
    /// `to` is the requested name as the caller sent it, which may not be a
    /// pipeline state at all.
    #[error("invalid transition for entity '{entity_id}': {} -> {to}", describe_from(.from))]
    InvalidTransition {
        entity_id: String,
        from: Option<LifecycleState>,
        to: String,
    },

    /// Malformed command (bad job descriptor, bad identifier).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The durable store failed; nothing was persisted.
    #[error("infrastructure failure: {0}")]
    Infrastructure(#[source] StoreError),
}

impl CommandError {
    /// Whether the caller should retry the same command (with the same key).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Infrastructure(_))
    }
}

impl From<DomainError> for CommandError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InvalidTransition {
                entity_id,
                from,
                to,
            } => CommandError::InvalidTransition {
                entity_id,
                from,
                to: to.to_string(),
            },
            other => CommandError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for CommandError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Domain(domain) => domain.into(),
            other => CommandError::Infrastructure(other),
        }
    }
}

fn describe_from(from: &Option<LifecycleState>) -> String {
    match from {
        Some(state) => state.to_string(),
        None => "<none>".to_string(),
    }
}

/// Runs [`InitializeCommand`]s against the durable store.
#[derive(Clone)]
pub struct CommandHandler {
    store: SharedStore,
    idempotency: IdempotencyStore,
    ttl: Duration,
}

impl CommandHandler {
    pub fn new(store: SharedStore, idempotency: IdempotencyStore) -> Self {
        Self {
            store,
            idempotency,
            ttl: DEFAULT_IDEMPOTENCY_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Parse the state a caller asked `entity_id` to move to.
    ///
    /// A name outside the pipeline is reachable from nowhere, so it is
    /// reported as an invalid transition from the entity's current state.
    pub async fn resolve_requested_state(
        &self,
        entity_id: &EntityId,
        requested: &str,
    ) -> Result<LifecycleState, CommandError> {
        if requested.trim().is_empty() {
            return Err(CommandError::Validation(
                "initial_state cannot be empty".to_string(),
            ));
        }
        match requested.parse::<LifecycleState>() {
            Ok(state) => Ok(state),
            Err(DomainError::UnknownState(_)) => {
                let from = self
                    .store
                    .get_lifecycle(entity_id)
                    .await?
                    .map(|record| record.state);
                debug!(%entity_id, requested, "requested state is not part of the pipeline");
                Err(CommandError::InvalidTransition {
                    entity_id: entity_id.to_string(),
                    from,
                    to: requested.to_string(),
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Start or advance the pipeline of `command.entity_id`.
    ///
    /// Concurrent calls with the same key perform the writes exactly once;
    /// the others return the committed result with `from_cache = true`.
    #[instrument(
        skip(self, command),
        fields(
            entity_id = %command.entity_id,
            key = %command.idempotency_key,
            requested = %command.initial_state,
            initiated_by = %command.initiated_by,
        )
    )]
    pub async fn initialize(
        &self,
        mut command: InitializeCommand,
    ) -> Result<InitializeResult, CommandError> {
        stamp_jobs(&mut command)?;

        if let Some(hit) = self
            .idempotency
            .check_and_return(&command.idempotency_key)
            .await?
        {
            debug!(state = %hit.state, "idempotent replay");
            return Ok(hit);
        }

        match self.store.initialize_atomic(&command, self.ttl).await {
            Ok(AtomicOutcome::Committed(result)) => {
                info!(
                    state = %result.state,
                    outbox_entries = result.outbox_entries.len(),
                    "lifecycle command committed"
                );
                self.idempotency
                    .store(&command.idempotency_key, &result, self.ttl)
                    .await;
                Ok(result)
            }
            Ok(AtomicOutcome::AlreadyApplied(record)) => {
                debug!(state = %record.result.state, "key committed by a concurrent call");
                let remaining = (record.expires_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if !remaining.is_zero() {
                    self.idempotency
                        .store(&command.idempotency_key, &record.result, remaining)
                        .await;
                }
                Ok(record.result.cached())
            }
            Err(StoreError::IdempotencyConflict(detail)) => {
                // Lost the race on the key insert; the winner's record is committed.
                debug!(%detail, "idempotency insert raced; reading winner");
                self.store
                    .find_idempotency(&command.idempotency_key, Utc::now())
                    .await?
                    .map(|record| record.result.cached())
                    .ok_or_else(|| {
                        CommandError::Infrastructure(StoreError::IdempotencyConflict(detail))
                    })
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(error = %err, "lifecycle command failed; safe to retry with the same key");
                }
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for CommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandHandler")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Check job descriptors and stamp the entity id into object payloads.
fn stamp_jobs(command: &mut InitializeCommand) -> Result<(), CommandError> {
    let entity_id: &EntityId = &command.entity_id;
    for (index, job) in command.jobs.iter_mut().enumerate() {
        if job.queue_name.trim().is_empty() {
            return Err(CommandError::Validation(format!(
                "job {index}: queue_name cannot be empty"
            )));
        }

        let JsonValue::Object(payload) = &mut job.payload else {
            continue;
        };
        match payload.get(ENTITY_ID_FIELD) {
            None => {
                payload.insert(
                    ENTITY_ID_FIELD.to_string(),
                    JsonValue::String(entity_id.as_str().to_string()),
                );
            }
            Some(JsonValue::String(named)) if named == entity_id.as_str() => {}
            Some(other) => {
                return Err(CommandError::Validation(format!(
                    "job {index}: payload {ENTITY_ID_FIELD} {other} does not match entity '{entity_id}'"
                )));
            }
        }
    }
    Ok(())
}
