use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conduit_core::{EntityId, IdempotencyKey, OutboxId};
use conduit_events::TransitionEvent;

use super::r#trait::{
    AtomicOutcome, CommandStore, IdempotencyRecord, InitializeCommand, LifecycleQuery,
    LifecycleRecord, OutboxEntry, OutboxStore, Pagination, RetentionStore, StagedWrites,
    StoreError,
};

/// Points at which a failure can be injected into [`InMemoryStore`].
///
/// The first four fire inside `initialize_atomic`, in write order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    BeforeStateWrite,
    BeforeEventWrite,
    BeforeOutboxWrite,
    BeforeIdempotencyWrite,
    /// `mark_processed`, e.g. a processor crashing after the enqueue.
    MarkProcessed,
}

#[derive(Debug, Default)]
struct Tables {
    lifecycles: HashMap<EntityId, LifecycleRecord>,
    /// Insertion order doubles as creation order.
    outbox: Vec<OutboxEntry>,
    idempotency: HashMap<IdempotencyKey, IdempotencyRecord>,
    events: Vec<TransitionEvent>,
}

impl Tables {
    fn outbox_mut(&mut self, outbox_id: OutboxId) -> Result<&mut OutboxEntry, StoreError> {
        self.outbox
            .iter_mut()
            .find(|entry| entry.outbox_id == outbox_id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox entry {outbox_id}")))
    }
}

/// In-memory durable store.
///
/// Intended for tests/dev. A single lock covers all four tables, so
/// `initialize_atomic` is serialized exactly like a transaction that locks
/// the entity row. Writes are staged and applied only after every fault
/// point has passed.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    faults: Mutex<HashSet<FaultPoint>>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next operation reaching `point` (one-shot).
    pub fn inject_fault(&self, point: FaultPoint) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert(point);
        }
    }

    /// Make every operation fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn lifecycle_count(&self) -> usize {
        self.read().map(|t| t.lifecycles.len()).unwrap_or(0)
    }

    pub fn outbox_rows(&self) -> Vec<OutboxEntry> {
        self.read().map(|t| t.outbox.clone()).unwrap_or_default()
    }

    pub fn idempotency_count(&self) -> usize {
        self.read().map(|t| t.idempotency.len()).unwrap_or(0)
    }

    pub fn event_rows(&self) -> Vec<TransitionEvent> {
        self.read().map(|t| t.events.clone()).unwrap_or_default()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn trip(&self, point: FaultPoint) -> Result<(), StoreError> {
        let fired = self
            .faults
            .lock()
            .map(|mut faults| faults.remove(&point))
            .unwrap_or(false);
        if fired {
            return Err(StoreError::Unavailable(format!(
                "injected fault at {point:?}"
            )));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StoreError> {
        self.ensure_available()?;
        self.tables
            .write()
            .map_err(|_| StoreError::Database("lock poisoned".to_string()))
    }

    fn read_checked(&self) -> Result<RwLockReadGuard<'_, Tables>, StoreError> {
        self.ensure_available()?;
        self.read()
    }
}

#[async_trait]
impl CommandStore for InMemoryStore {
    async fn initialize_atomic(
        &self,
        command: &InitializeCommand,
        ttl: Duration,
    ) -> Result<AtomicOutcome, StoreError> {
        let now = Utc::now();
        let mut tables = self.write()?;

        if let Some(existing) = tables.idempotency.get(&command.idempotency_key) {
            if !existing.is_expired(now) {
                return Ok(AtomicOutcome::AlreadyApplied(existing.clone()));
            }
        }

        let staged = StagedWrites::compose(
            command,
            tables.lifecycles.get(&command.entity_id),
            ttl,
            now,
        )?;

        self.trip(FaultPoint::BeforeStateWrite)?;
        self.trip(FaultPoint::BeforeEventWrite)?;
        self.trip(FaultPoint::BeforeOutboxWrite)?;
        self.trip(FaultPoint::BeforeIdempotencyWrite)?;

        let result = staged.result().clone();
        let StagedWrites {
            lifecycle,
            events,
            outbox,
            idempotency,
            ..
        } = staged;

        if let Some(record) = lifecycle {
            tables.lifecycles.insert(record.entity_id.clone(), record);
        }
        tables.events.extend(events);
        tables.outbox.extend(outbox);
        tables
            .idempotency
            .insert(idempotency.key.clone(), idempotency);

        Ok(AtomicOutcome::Committed(result))
    }

    async fn find_idempotency(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let tables = self.read_checked()?;
        Ok(tables
            .idempotency
            .get(key)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.read_checked()?;
        let mut waiting: HashSet<&EntityId> = HashSet::new();
        let mut due: Vec<&OutboxEntry> = Vec::new();
        for entry in &tables.outbox {
            if entry.is_processed() || entry.is_abandoned() || waiting.contains(&entry.entity_id) {
                continue;
            }
            if entry.is_due(now) {
                due.push(entry);
            } else {
                // Later rows of this entity queue behind the backed-off one.
                waiting.insert(&entry.entity_id);
            }
        }
        // Stable sort keeps insertion order for equal timestamps.
        due.sort_by_key(|e| e.created_at);
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn mark_processed(
        &self,
        outbox_id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.trip(FaultPoint::MarkProcessed)?;
        let mut tables = self.write()?;
        let entry = tables.outbox_mut(outbox_id)?;
        if entry.processed_at.is_none() {
            entry.processed_at = Some(now);
        }
        Ok(())
    }

    async fn record_retry(
        &self,
        outbox_id: OutboxId,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let entry = tables.outbox_mut(outbox_id)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.available_at = available_at;
        Ok(())
    }

    async fn mark_abandoned(
        &self,
        outbox_id: OutboxId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.write()?;
        let entry = tables.outbox_mut(outbox_id)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.abandoned_at = Some(now);
        Ok(())
    }

    async fn backlog(&self) -> Result<u64, StoreError> {
        let tables = self.read_checked()?;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| !e.is_processed() && !e.is_abandoned())
            .count() as u64)
    }

    async fn list_abandoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.read_checked()?;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| e.is_abandoned() && !e.is_processed())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue(
        &self,
        outbox_id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<OutboxEntry, StoreError> {
        let mut tables = self.write()?;
        let entry = tables.outbox_mut(outbox_id)?;
        if entry.is_processed() {
            return Err(StoreError::Conflict(format!(
                "outbox entry {outbox_id} is already processed"
            )));
        }
        if !entry.is_abandoned() {
            return Err(StoreError::Conflict(format!(
                "outbox entry {outbox_id} is not abandoned"
            )));
        }
        entry.abandoned_at = None;
        entry.attempts = 0;
        entry.last_error = None;
        entry.available_at = now;
        Ok(entry.clone())
    }
}

#[async_trait]
impl LifecycleQuery for InMemoryStore {
    async fn get_lifecycle(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<LifecycleRecord>, StoreError> {
        let tables = self.read_checked()?;
        Ok(tables.lifecycles.get(entity_id).cloned())
    }

    async fn list_transitions(
        &self,
        entity_id: &EntityId,
        pagination: Pagination,
    ) -> Result<Vec<TransitionEvent>, StoreError> {
        let tables = self.read_checked()?;
        Ok(tables
            .events
            .iter()
            .filter(|e| &e.entity_id == entity_id)
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect())
    }

    async fn list_outbox_for_entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.read_checked()?;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| &e.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RetentionStore for InMemoryStore {
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, record| !record.is_expired(now));
        Ok((before - tables.idempotency.len()) as u64)
    }

    async fn purge_processed_outbox(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let before = tables.outbox.len();
        tables
            .outbox
            .retain(|e| !matches!(e.processed_at, Some(at) if at < older_than));
        Ok((before - tables.outbox.len()) as u64)
    }

    async fn purge_transition_events(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tables = self.write()?;
        let before = tables.events.len();
        tables.events.retain(|e| e.created_at >= older_than);
        Ok((before - tables.events.len()) as u64)
    }
}
