//! Postgres-backed durable store.
//!
//! `initialize_atomic` runs in one transaction:
//!
//! 1. drop an expired idempotency record for the key, then look the key up
//! 2. lock the entity row (`SELECT … FOR UPDATE`), validate, create or update it
//! 3. insert the transition events, outbox rows and the idempotency record
//! 4. commit
//!
//! Concurrent callers on the same entity queue on the row lock. Two callers
//! creating the same entity race on `INSERT … ON CONFLICT DO NOTHING`; the
//! loser re-reads the winner's row and validates against it. Two callers with
//! the same key race on the `idempotency_keys` primary key; the loser rolls
//! back with [`StoreError::IdempotencyConflict`].
//!
//! ## Error Mapping
//!
//! | SQLx error | SQLSTATE | StoreError |
//! |------------|----------|------------|
//! | Database (unique violation) | `23505` | `IdempotencyConflict` on `idempotency_keys`, otherwise `Conflict` |
//! | Database (serialization failure / deadlock) | `40001` / `40P01` | `Unavailable` |
//! | Database (connection exception / shutdown) | `08*` / `57P*` | `Unavailable` |
//! | Database (other) | any other | `Database` |
//! | Io, Tls, PoolTimedOut, PoolClosed | n/a | `Unavailable` |
//! | Decode, ColumnDecode | n/a | `Corrupt` |
//! | RowNotFound | n/a | `NotFound` |

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{Span, field, instrument};

use conduit_core::{EntityId, EventId, IdempotencyKey, InitiatedBy, LifecycleState, OutboxId};
use conduit_events::TransitionEvent;

use super::r#trait::{
    AtomicOutcome, CommandStore, IdempotencyRecord, InitializeCommand, InitializeResult,
    LifecycleQuery, LifecycleRecord, OutboxEntry, OutboxStore, Pagination, RetentionStore,
    StagedWrites, StoreError,
};

const OUTBOX_COLUMNS: &str = "outbox_id, entity_id, queue_name, job_payload, job_options, \
     created_at, available_at, processed_at, abandoned_at, attempts, last_error";

/// Postgres-backed implementation of every store trait.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CommandStore for PostgresStore {
    #[instrument(
        skip(self, command),
        fields(
            entity_id = %command.entity_id,
            requested = %command.initial_state,
            job_count = command.jobs.len(),
            outcome = field::Empty
        ),
        err
    )]
    async fn initialize_atomic(
        &self,
        command: &InitializeCommand,
        ttl: Duration,
    ) -> Result<AtomicOutcome, StoreError> {
        let span = Span::current();
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM idempotency_keys WHERE key = $1 AND expires_at <= $2")
            .bind(command.idempotency_key.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_expired_key", e))?;

        if let Some(record) = select_idempotency(&mut tx, &command.idempotency_key, now).await? {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            span.record("outcome", "already_applied");
            return Ok(AtomicOutcome::AlreadyApplied(record));
        }

        let current = select_lifecycle_for_update(&mut tx, &command.entity_id).await?;
        let mut staged = match StagedWrites::compose(command, current.as_ref(), ttl, now) {
            Ok(staged) => staged,
            Err(err) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(err);
            }
        };

        if staged.created {
            let record = staged
                .lifecycle
                .as_ref()
                .ok_or_else(|| StoreError::Database("created without a record".to_string()))?;
            if !insert_lifecycle(&mut tx, record).await? {
                // Lost the creation race; validate against the winner's row.
                let current = select_lifecycle_for_update(&mut tx, &command.entity_id).await?;
                staged = StagedWrites::compose(command, current.as_ref(), ttl, now)?;
                if staged.created {
                    return Err(StoreError::Conflict(format!(
                        "entity {} was created concurrently",
                        command.entity_id
                    )));
                }
            }
        }

        if !staged.created {
            if let Some(record) = &staged.lifecycle {
                update_lifecycle(&mut tx, record).await?;
            }
        }

        for event in &staged.events {
            insert_event(&mut tx, event).await?;
        }
        for entry in &staged.outbox {
            insert_outbox(&mut tx, entry).await?;
        }
        insert_idempotency(&mut tx, &staged.idempotency).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        span.record("outcome", "committed");
        Ok(AtomicOutcome::Committed(staged.result().clone()))
    }

    #[instrument(skip(self), fields(key = %key), err)]
    async fn find_idempotency(
        &self,
        key: &IdempotencyKey,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, entity_id, result, created_at, expires_at
            FROM idempotency_keys
            WHERE key = $1 AND expires_at > $2
            "#,
        )
        .bind(key.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_idempotency", e))?;

        row.as_ref().map(idempotency_from_row).transpose()
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    #[instrument(skip(self), fields(fetched = field::Empty), err)]
    async fn fetch_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM job_outbox o
            WHERE o.processed_at IS NULL
              AND o.abandoned_at IS NULL
              AND o.available_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM job_outbox p
                  WHERE p.entity_id = o.entity_id
                    AND p.seq < o.seq
                    AND p.processed_at IS NULL
                    AND p.abandoned_at IS NULL
                    AND p.available_at > $1
              )
            ORDER BY o.created_at ASC, o.seq ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_due", e))?;

        let entries = rows
            .iter()
            .map(outbox_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Span::current().record("fetched", entries.len());
        Ok(entries)
    }

    #[instrument(skip(self), fields(outbox_id = %outbox_id), err)]
    async fn mark_processed(
        &self,
        outbox_id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE job_outbox SET processed_at = COALESCE(processed_at, $2) WHERE outbox_id = $1",
        )
        .bind(outbox_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_processed", e))?;

        ensure_touched(result.rows_affected(), outbox_id)
    }

    #[instrument(skip(self, error), fields(outbox_id = %outbox_id), err)]
    async fn record_retry(
        &self,
        outbox_id: OutboxId,
        error: &str,
        available_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_outbox
            SET attempts = attempts + 1, last_error = $2, available_at = $3
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id.as_uuid())
        .bind(error)
        .bind(available_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_retry", e))?;

        ensure_touched(result.rows_affected(), outbox_id)
    }

    #[instrument(skip(self, error), fields(outbox_id = %outbox_id), err)]
    async fn mark_abandoned(
        &self,
        outbox_id: OutboxId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_outbox
            SET attempts = attempts + 1, last_error = $2, abandoned_at = $3
            WHERE outbox_id = $1
            "#,
        )
        .bind(outbox_id.as_uuid())
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_abandoned", e))?;

        ensure_touched(result.rows_affected(), outbox_id)
    }

    async fn backlog(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS backlog FROM job_outbox WHERE processed_at IS NULL AND abandoned_at IS NULL",
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("backlog", e))?;

        let backlog: i64 = row
            .try_get("backlog")
            .map_err(|e| StoreError::Corrupt(format!("failed to read backlog: {e}")))?;
        Ok(backlog.max(0) as u64)
    }

    async fn list_abandoned(&self, limit: usize) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS}
            FROM job_outbox
            WHERE processed_at IS NULL AND abandoned_at IS NOT NULL
            ORDER BY seq ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_abandoned", e))?;

        rows.iter().map(outbox_from_row).collect()
    }

    #[instrument(skip(self), fields(outbox_id = %outbox_id), err)]
    async fn requeue(
        &self,
        outbox_id: OutboxId,
        now: DateTime<Utc>,
    ) -> Result<OutboxEntry, StoreError> {
        let sql = format!(
            r#"
            UPDATE job_outbox
            SET abandoned_at = NULL, attempts = 0, last_error = NULL, available_at = $2
            WHERE outbox_id = $1 AND processed_at IS NULL AND abandoned_at IS NOT NULL
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(outbox_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue", e))?;

        if let Some(row) = row {
            return outbox_from_row(&row);
        }

        let exists = sqlx::query("SELECT 1 FROM job_outbox WHERE outbox_id = $1")
            .bind(outbox_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("requeue_lookup", e))?;

        match exists {
            Some(_) => Err(StoreError::Conflict(format!(
                "outbox entry {outbox_id} is not abandoned"
            ))),
            None => Err(StoreError::NotFound(format!("outbox entry {outbox_id}"))),
        }
    }
}

#[async_trait]
impl LifecycleQuery for PostgresStore {
    #[instrument(skip(self), fields(entity_id = %entity_id), err)]
    async fn get_lifecycle(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<LifecycleRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT entity_id, state, created_at, updated_at FROM entity_lifecycle WHERE entity_id = $1",
        )
        .bind(entity_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_lifecycle", e))?;

        row.as_ref().map(lifecycle_from_row).transpose()
    }

    #[instrument(skip(self), fields(entity_id = %entity_id), err)]
    async fn list_transitions(
        &self,
        entity_id: &EntityId,
        pagination: Pagination,
    ) -> Result<Vec<TransitionEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, entity_id, old_state, new_state, created_at, initiated_by, metadata
            FROM transition_events
            WHERE entity_id = $1
            ORDER BY created_at ASC, seq ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(entity_id.as_str())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_transitions", e))?;

        rows.iter().map(event_from_row).collect()
    }

    async fn list_outbox_for_entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            "SELECT {OUTBOX_COLUMNS} FROM job_outbox WHERE entity_id = $1 ORDER BY seq ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id.as_str())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_outbox_for_entity", e))?;

        rows.iter().map(outbox_from_row).collect()
    }
}

#[async_trait]
impl RetentionStore for PostgresStore {
    async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_expired_idempotency", e))?;
        Ok(result.rows_affected())
    }

    async fn purge_processed_outbox(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM job_outbox WHERE processed_at IS NOT NULL AND processed_at < $1",
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_processed_outbox", e))?;
        Ok(result.rows_affected())
    }

    async fn purge_transition_events(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM transition_events WHERE created_at < $1")
            .bind(older_than)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_transition_events", e))?;
        Ok(result.rows_affected())
    }
}

// Transaction steps

async fn select_idempotency(
    tx: &mut Transaction<'_, Postgres>,
    key: &IdempotencyKey,
    now: DateTime<Utc>,
) -> Result<Option<IdempotencyRecord>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT key, entity_id, result, created_at, expires_at
        FROM idempotency_keys
        WHERE key = $1 AND expires_at > $2
        "#,
    )
    .bind(key.as_str())
    .bind(now)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("select_idempotency", e))?;

    row.as_ref().map(idempotency_from_row).transpose()
}

async fn select_lifecycle_for_update(
    tx: &mut Transaction<'_, Postgres>,
    entity_id: &EntityId,
) -> Result<Option<LifecycleRecord>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT entity_id, state, created_at, updated_at
        FROM entity_lifecycle
        WHERE entity_id = $1
        FOR UPDATE
        "#,
    )
    .bind(entity_id.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("select_lifecycle_for_update", e))?;

    row.as_ref().map(lifecycle_from_row).transpose()
}

/// Returns `false` when another transaction created the row first.
async fn insert_lifecycle(
    tx: &mut Transaction<'_, Postgres>,
    record: &LifecycleRecord,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO entity_lifecycle (entity_id, state, created_at, updated_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (entity_id) DO NOTHING
        "#,
    )
    .bind(record.entity_id.as_str())
    .bind(record.state.to_string())
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_lifecycle", e))?;

    Ok(result.rows_affected() == 1)
}

async fn update_lifecycle(
    tx: &mut Transaction<'_, Postgres>,
    record: &LifecycleRecord,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE entity_lifecycle SET state = $2, updated_at = $3 WHERE entity_id = $1")
        .bind(record.entity_id.as_str())
        .bind(record.state.to_string())
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("update_lifecycle", e))?;
    Ok(())
}

async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &TransitionEvent,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO transition_events (
            event_id, entity_id, old_state, new_state, created_at, initiated_by, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(event.event_id.as_uuid())
    .bind(event.entity_id.as_str())
    .bind(event.old_state.map(|s| s.to_string()))
    .bind(event.new_state.to_string())
    .bind(event.created_at)
    .bind(event.initiated_by.as_str())
    .bind(&event.metadata)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_event", e))?;
    Ok(())
}

async fn insert_outbox(
    tx: &mut Transaction<'_, Postgres>,
    entry: &OutboxEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO job_outbox (
            outbox_id, entity_id, queue_name, job_payload, job_options,
            created_at, available_at, attempts
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, 0)
        "#,
    )
    .bind(entry.outbox_id.as_uuid())
    .bind(entry.entity_id.as_str())
    .bind(&entry.queue_name)
    .bind(&entry.job_payload)
    .bind(&entry.job_options)
    .bind(entry.created_at)
    .bind(entry.available_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_outbox", e))?;
    Ok(())
}

async fn insert_idempotency(
    tx: &mut Transaction<'_, Postgres>,
    record: &IdempotencyRecord,
) -> Result<(), StoreError> {
    let result = serde_json::to_value(&record.result)
        .map_err(|e| StoreError::Corrupt(format!("failed to encode result: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO idempotency_keys (key, entity_id, result, created_at, expires_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(record.key.as_str())
    .bind(record.entity_id.as_str())
    .bind(result)
    .bind(record.created_at)
    .bind(record.expires_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::IdempotencyConflict(record.key.to_string())
        } else {
            map_sqlx_error("insert_idempotency", e)
        }
    })?;
    Ok(())
}

fn ensure_touched(rows_affected: u64, outbox_id: OutboxId) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(format!("outbox entry {outbox_id}")));
    }
    Ok(())
}

// Row decoding

fn corrupt(what: &str) -> impl Fn(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Corrupt(format!("failed to read {what}: {e}"))
}

fn parse_entity_id(raw: String) -> Result<EntityId, StoreError> {
    EntityId::new(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn parse_state(raw: &str) -> Result<LifecycleState, StoreError> {
    LifecycleState::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn lifecycle_from_row(row: &PgRow) -> Result<LifecycleRecord, StoreError> {
    let entity_id: String = row.try_get("entity_id").map_err(corrupt("entity_id"))?;
    let state: String = row.try_get("state").map_err(corrupt("state"))?;
    Ok(LifecycleRecord {
        entity_id: parse_entity_id(entity_id)?,
        state: parse_state(&state)?,
        created_at: row.try_get("created_at").map_err(corrupt("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(corrupt("updated_at"))?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEntry, StoreError> {
    let outbox_id: uuid::Uuid = row.try_get("outbox_id").map_err(corrupt("outbox_id"))?;
    let entity_id: String = row.try_get("entity_id").map_err(corrupt("entity_id"))?;
    let attempts: i32 = row.try_get("attempts").map_err(corrupt("attempts"))?;
    Ok(OutboxEntry {
        outbox_id: OutboxId::from_uuid(outbox_id),
        entity_id: parse_entity_id(entity_id)?,
        queue_name: row.try_get("queue_name").map_err(corrupt("queue_name"))?,
        job_payload: row.try_get("job_payload").map_err(corrupt("job_payload"))?,
        job_options: row.try_get("job_options").map_err(corrupt("job_options"))?,
        created_at: row.try_get("created_at").map_err(corrupt("created_at"))?,
        available_at: row.try_get("available_at").map_err(corrupt("available_at"))?,
        processed_at: row.try_get("processed_at").map_err(corrupt("processed_at"))?,
        abandoned_at: row.try_get("abandoned_at").map_err(corrupt("abandoned_at"))?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(corrupt("last_error"))?,
    })
}

fn idempotency_from_row(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let key: String = row.try_get("key").map_err(corrupt("key"))?;
    let entity_id: String = row.try_get("entity_id").map_err(corrupt("entity_id"))?;
    let result: serde_json::Value = row.try_get("result").map_err(corrupt("result"))?;
    let result: InitializeResult = serde_json::from_value(result)
        .map_err(|e| StoreError::Corrupt(format!("failed to decode result: {e}")))?;
    Ok(IdempotencyRecord {
        key: IdempotencyKey::new(key).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        entity_id: parse_entity_id(entity_id)?,
        result,
        created_at: row.try_get("created_at").map_err(corrupt("created_at"))?,
        expires_at: row.try_get("expires_at").map_err(corrupt("expires_at"))?,
    })
}

fn event_from_row(row: &PgRow) -> Result<TransitionEvent, StoreError> {
    let event_id: uuid::Uuid = row.try_get("event_id").map_err(corrupt("event_id"))?;
    let entity_id: String = row.try_get("entity_id").map_err(corrupt("entity_id"))?;
    let old_state: Option<String> = row.try_get("old_state").map_err(corrupt("old_state"))?;
    let new_state: String = row.try_get("new_state").map_err(corrupt("new_state"))?;
    let initiated_by: String = row.try_get("initiated_by").map_err(corrupt("initiated_by"))?;
    Ok(TransitionEvent {
        event_id: EventId::from_uuid(event_id),
        entity_id: parse_entity_id(entity_id)?,
        old_state: old_state.as_deref().map(parse_state).transpose()?,
        new_state: parse_state(&new_state)?,
        created_at: row.try_get("created_at").map_err(corrupt("created_at"))?,
        initiated_by: InitiatedBy::from_str(&initiated_by)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        metadata: row.try_get("metadata").map_err(corrupt("metadata"))?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                // Serialization failure and deadlock: the whole operation may be retried.
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                    StoreError::Unavailable(msg)
                }
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {operation}")),
        err @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            StoreError::Corrupt(format!("decode error in {operation}: {err}"))
        }
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("fetch_due", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("fetch_due", sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        assert!(matches!(
            map_sqlx_error("get_lifecycle", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = map_sqlx_error("insert_event", sqlx::Error::Io(io));
        assert!(err.is_transient());
        assert!(err.to_string().contains("insert_event"));
    }
}
