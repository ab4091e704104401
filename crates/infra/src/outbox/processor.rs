use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use conduit_core::EntityId;

use crate::queue::{EnqueueOptions, JobQueue};
use crate::store::{OutboxEntry, SharedStore, StoreError};
use crate::store::r#trait::saturating_add;
use crate::workers::{ShutdownSignal, TaskHandle};

use super::retry::RetryPolicy;

/// Outbox processor configuration.
#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Rows fetched per poll.
    pub batch_size: usize,
    /// Entities processed concurrently within a batch.
    pub max_concurrency: usize,
    /// Poll interval floor, used while work keeps arriving.
    pub poll_min: Duration,
    /// Poll interval cap, reached after sustained idleness.
    pub poll_max: Duration,
    pub retry: RetryPolicy,
    pub shutdown_grace: Duration,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_concurrency: 8,
            poll_min: Duration::from_millis(100),
            poll_max: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Adaptive poll interval: back to the floor when work is found, doubling
/// up to the cap while idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl PollInterval {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_work(&mut self) {
        self.current = self.min;
    }

    pub fn on_idle(&mut self) {
        self.current = self.current.saturating_mul(2).clamp(self.min, self.max);
    }
}

/// Counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub fetched: usize,
    pub enqueued: usize,
    /// The queue already had the job; counted as success.
    pub duplicates: usize,
    pub retried: usize,
    pub abandoned: usize,
    /// Rows left untouched because the store failed mid-batch.
    pub failed: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.fetched += other.fetched;
        self.enqueued += other.enqueued;
        self.duplicates += other.duplicates;
        self.retried += other.retried;
        self.abandoned += other.abandoned;
        self.failed += other.failed;
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorTotals {
    pub polls: u64,
    pub enqueued: u64,
    pub duplicates: u64,
    pub retried: u64,
    pub abandoned: u64,
}

/// Health signal published by the processor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorHealth {
    pub running: bool,
    pub last_successful_poll_at: Option<DateTime<Utc>>,
    /// Unprocessed, not abandoned rows as of the last poll.
    pub backlog: u64,
    pub last_error: Option<String>,
    pub totals: ProcessorTotals,
}

impl ProcessorHealth {
    /// Running and polled successfully within `max_age`.
    pub fn is_live(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(last) = self.last_successful_poll_at else {
            return false;
        };
        self.running && saturating_add(last, max_age) >= now
    }
}

/// Read side of the processor health, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct HealthHandle {
    inner: Arc<RwLock<ProcessorHealth>>,
}

impl HealthHandle {
    pub async fn snapshot(&self) -> ProcessorHealth {
        self.inner.read().await.clone()
    }

    async fn update(&self, f: impl FnOnce(&mut ProcessorHealth)) {
        let mut health = self.inner.write().await;
        f(&mut health);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Enqueued,
    Duplicate,
    Retried,
    Abandoned,
}

/// Drains outbox rows into the job queue.
///
/// Each row is enqueued with its `outbox_id` as the job id, so a row that is
/// enqueued but not yet marked processed (crash, store hiccup) is reported
/// as a duplicate on the next attempt and simply marked processed.
#[derive(Clone)]
pub struct OutboxProcessor {
    store: SharedStore,
    queue: Arc<dyn JobQueue>,
    config: OutboxProcessorConfig,
    health: HealthHandle,
}

impl OutboxProcessor {
    pub fn new(store: SharedStore, queue: Arc<dyn JobQueue>, config: OutboxProcessorConfig) -> Self {
        Self {
            store,
            queue,
            config,
            health: HealthHandle::default(),
        }
    }

    pub fn config(&self) -> &OutboxProcessorConfig {
        &self.config
    }

    pub fn health(&self) -> HealthHandle {
        self.health.clone()
    }

    /// Process one batch of due rows.
    ///
    /// Rows are grouped per entity; groups run concurrently (bounded by
    /// `max_concurrency`), rows inside a group run in creation order. A group
    /// stops at the first row put into backoff so later rows of that entity
    /// never overtake it.
    pub async fn run_once(&self) -> Result<BatchReport, StoreError> {
        let rows = self
            .store
            .fetch_due(self.config.batch_size.max(1), Utc::now())
            .await?;
        let mut report = BatchReport {
            fetched: rows.len(),
            ..BatchReport::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (entity_id, group) in group_by_entity(rows) {
            let processor = self.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                processor.process_group(&entity_id, group).await
            });
        }

        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((group_report, error)) => {
                    report.merge(group_report);
                    if error.is_some() {
                        last_error = error;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "outbox group task failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        if let Some(error) = last_error {
            self.health
                .update(|health| health.last_error = Some(error))
                .await;
        }

        debug!(
            fetched = report.fetched,
            enqueued = report.enqueued,
            duplicates = report.duplicates,
            retried = report.retried,
            abandoned = report.abandoned,
            failed = report.failed,
            "outbox batch processed"
        );
        Ok(report)
    }

    async fn process_group(
        &self,
        entity_id: &EntityId,
        rows: Vec<OutboxEntry>,
    ) -> (BatchReport, Option<String>) {
        let mut report = BatchReport::default();
        let total = rows.len();

        for (done, entry) in rows.into_iter().enumerate() {
            match self.process_entry(&entry).await {
                Ok(EntryOutcome::Enqueued) => report.enqueued += 1,
                Ok(EntryOutcome::Duplicate) => report.duplicates += 1,
                Ok(EntryOutcome::Abandoned) => report.abandoned += 1,
                Ok(EntryOutcome::Retried) => {
                    report.retried += 1;
                    debug!(entity_id = %entity_id, held_back = total - done - 1, "entity waiting on backoff");
                    break;
                }
                Err(e) => {
                    warn!(entity_id = %entity_id, outbox_id = %entry.outbox_id, error = %e, "outbox store update failed");
                    report.failed += total - done;
                    return (report, Some(e.to_string()));
                }
            }
        }
        (report, None)
    }

    async fn process_entry(&self, entry: &OutboxEntry) -> Result<EntryOutcome, StoreError> {
        let options = EnqueueOptions::new(entry.outbox_id.to_string())
            .with_options(entry.job_options.clone());

        match self
            .queue
            .enqueue(&entry.queue_name, &entry.job_payload, options)
            .await
        {
            Ok(outcome) => {
                self.store.mark_processed(entry.outbox_id, Utc::now()).await?;
                if outcome.is_duplicate() {
                    debug!(outbox_id = %entry.outbox_id, queue = %entry.queue_name, "job already existed; marked processed");
                    Ok(EntryOutcome::Duplicate)
                } else {
                    Ok(EntryOutcome::Enqueued)
                }
            }
            Err(e) if e.is_transient() => {
                let attempts = entry.attempts.saturating_add(1);
                let now = Utc::now();
                if self.config.retry.should_retry(attempts) {
                    let delay = self.config.retry.delay_for(entry.outbox_id, attempts);
                    warn!(outbox_id = %entry.outbox_id, attempts, ?delay, error = %e, "transient enqueue failure; backing off");
                    self.store
                        .record_retry(entry.outbox_id, &e.to_string(), saturating_add(now, delay))
                        .await?;
                    Ok(EntryOutcome::Retried)
                } else {
                    warn!(outbox_id = %entry.outbox_id, attempts, error = %e, "enqueue attempts exhausted; abandoning");
                    self.store
                        .mark_abandoned(entry.outbox_id, &e.to_string(), now)
                        .await?;
                    Ok(EntryOutcome::Abandoned)
                }
            }
            Err(e) => {
                warn!(outbox_id = %entry.outbox_id, error = %e, "permanent enqueue failure; abandoning");
                self.store
                    .mark_abandoned(entry.outbox_id, &e.to_string(), Utc::now())
                    .await?;
                Ok(EntryOutcome::Abandoned)
            }
        }
    }

    /// Poll until `shutdown` fires. The batch in flight always completes.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        self.health.update(|health| health.running = true).await;
        info!(
            batch_size = self.config.batch_size,
            max_concurrency = self.config.max_concurrency,
            "outbox processor started"
        );

        let mut interval = PollInterval::new(self.config.poll_min, self.config.poll_max);
        while !shutdown.is_shutdown() {
            match self.run_once().await {
                Ok(report) => {
                    if report.fetched > 0 {
                        interval.on_work();
                    } else {
                        interval.on_idle();
                    }
                    let backlog = match self.store.backlog().await {
                        Ok(backlog) => Some(backlog),
                        Err(e) => {
                            warn!(error = %e, "failed to read outbox backlog");
                            None
                        }
                    };
                    self.health
                        .update(|health| {
                            health.last_successful_poll_at = Some(Utc::now());
                            if let Some(backlog) = backlog {
                                health.backlog = backlog;
                            }
                            health.totals.polls += 1;
                            health.totals.enqueued += report.enqueued as u64;
                            health.totals.duplicates += report.duplicates as u64;
                            health.totals.retried += report.retried as u64;
                            health.totals.abandoned += report.abandoned as u64;
                        })
                        .await;
                }
                Err(e) => {
                    warn!(error = %e, "outbox poll failed");
                    interval.on_idle();
                    self.health
                        .update(|health| health.last_error = Some(e.to_string()))
                        .await;
                }
            }

            if shutdown.sleep(interval.current()).await {
                break;
            }
        }

        self.health.update(|health| health.running = false).await;
        info!("outbox processor stopped");
    }

    /// Run the poll loop as a background task.
    pub fn spawn(self) -> TaskHandle {
        TaskHandle::spawn("outbox-processor", move |shutdown| self.run(shutdown))
    }
}

impl std::fmt::Debug for OutboxProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Group rows by entity, keeping first-appearance order of entities and
/// creation order inside each group.
fn group_by_entity(rows: Vec<OutboxEntry>) -> Vec<(EntityId, Vec<OutboxEntry>)> {
    let mut index: HashMap<EntityId, usize> = HashMap::new();
    let mut groups: Vec<(EntityId, Vec<OutboxEntry>)> = Vec::new();
    for row in rows {
        match index.get(&row.entity_id) {
            Some(&i) => groups[i].1.push(row),
            None => {
                index.insert(row.entity_id.clone(), groups.len());
                groups.push((row.entity_id.clone(), vec![row]));
            }
        }
    }
    groups
}
