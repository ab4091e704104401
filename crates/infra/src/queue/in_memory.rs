use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::warn;

use conduit_events::{JobCreated, Subscription};

use super::{EnqueueOptions, EnqueueOutcome, JobHandle, JobQueue, QueueError, QueuedJob};

const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct QueueState {
    /// Every job id ever created, per queue (dedupe survives dequeue).
    known: HashMap<String, HashSet<String>>,
    /// Jobs waiting for a consumer, per queue, in creation order.
    ready: HashMap<String, VecDeque<QueuedJob>>,
    /// All created jobs in creation order, for inspection.
    history: Vec<QueuedJob>,
    subscribers: HashMap<String, Vec<mpsc::Sender<JobCreated>>>,
}

/// In-memory job queue.
///
/// Intended for tests/dev. Failures can be scripted with
/// [`InMemoryJobQueue::fail_next_enqueue`].
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    scripted_failures: Mutex<VecDeque<QueueError>>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next enqueue call fail with `error` (queued, one per call).
    pub fn fail_next_enqueue(&self, error: QueueError) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures.push_back(error);
        }
    }

    /// Jobs created on `queue_name`, in creation order (dequeued ones included).
    pub fn created_jobs(&self, queue_name: &str) -> Vec<QueuedJob> {
        self.state
            .lock()
            .map(|s| {
                s.history
                    .iter()
                    .filter(|j| j.queue_name == queue_name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every created job across queues, in creation order.
    pub fn all_created_jobs(&self) -> Vec<QueuedJob> {
        self.state
            .lock()
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }

    fn take_scripted_failure(&self) -> Option<QueueError> {
        self.scripted_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Transient("lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &JsonValue,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        if let Some(err) = self.take_scripted_failure() {
            return Err(err);
        }

        let handle = JobHandle {
            queue_name: queue_name.to_string(),
            job_id: options.job_id.clone(),
        };

        let mut state = self.lock()?;
        let known = state.known.entry(queue_name.to_string()).or_default();
        if !known.insert(options.job_id.clone()) {
            return Ok(EnqueueOutcome::AlreadyExists(handle));
        }

        let job = QueuedJob {
            queue_name: queue_name.to_string(),
            job_id: options.job_id,
            payload: payload.clone(),
            options: options.options,
            enqueued_at: Utc::now(),
        };
        let event = job.created_event();

        state
            .ready
            .entry(queue_name.to_string())
            .or_default()
            .push_back(job.clone());
        state.history.push(job);

        if let Some(subscribers) = state.subscribers.get_mut(queue_name) {
            subscribers.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(queue = queue_name, "subscriber lagging; dropping job-created event");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }

        Ok(EnqueueOutcome::Created(handle))
    }

    async fn subscribe(&self, queue_name: &str) -> Result<Subscription<JobCreated>, QueueError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.lock()?
            .subscribers
            .entry(queue_name.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn dequeue(&self, queue_name: &str) -> Result<Option<QueuedJob>, QueueError> {
        Ok(self
            .lock()?
            .ready
            .get_mut(queue_name)
            .and_then(VecDeque::pop_front))
    }
}
