use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use conduit_core::{EntityId, Stage};

use crate::queue::{JobQueue, QueueError, QueuedJob};
use crate::safety_net::{HealOutcome, SelfHealingCheck};

use super::{ShutdownSignal, TaskHandle};

/// Business logic for one stage's jobs.
///
/// Runs after the self-healing check; the entity is expected to be inside
/// the stage by then, but the handler must tolerate a failed heal.
#[async_trait]
pub trait StageJobHandler: Send + Sync {
    async fn handle(&self, job: &QueuedJob, entity_id: Option<&EntityId>) -> anyhow::Result<()>;
}

/// What happened on one `process_next` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The queue was empty.
    Idle,
    Processed {
        job_id: String,
        heal: Option<HealOutcome>,
    },
    /// The handler failed; the job is not redelivered.
    HandlerFailed { job_id: String, error: String },
}

/// Pulls jobs from one queue, self-heals, then runs the stage handler.
#[derive(Clone)]
pub struct JobConsumer {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    stage: Stage,
    healing: SelfHealingCheck,
    handler: Arc<dyn StageJobHandler>,
    idle_wait: Duration,
}

impl JobConsumer {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
        stage: Stage,
        healing: SelfHealingCheck,
        handler: Arc<dyn StageJobHandler>,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            stage,
            healing,
            handler,
            idle_wait: Duration::from_millis(500),
        }
    }

    /// Pause between polls of an empty queue.
    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub async fn process_next(&self) -> Result<ConsumeOutcome, QueueError> {
        let Some(job) = self.queue.dequeue(&self.queue_name).await? else {
            return Ok(ConsumeOutcome::Idle);
        };

        let entity_id = job.created_event().entity_id();
        let heal = match &entity_id {
            Some(entity_id) => Some(
                self.healing
                    .ensure_stage(entity_id, self.stage, &self.queue_name, &job.job_id)
                    .await,
            ),
            None => {
                warn!(queue = %self.queue_name, job_id = %job.job_id, "job without entity_id; skipping self-healing");
                None
            }
        };

        match self.handler.handle(&job, entity_id.as_ref()).await {
            Ok(()) => Ok(ConsumeOutcome::Processed {
                job_id: job.job_id,
                heal,
            }),
            Err(e) => {
                warn!(queue = %self.queue_name, job_id = %job.job_id, error = %e, "stage job handler failed");
                Ok(ConsumeOutcome::HandlerFailed {
                    job_id: job.job_id,
                    error: format!("{e:#}"),
                })
            }
        }
    }

    /// Consume until shutdown. The job in flight always completes.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(queue = %self.queue_name, stage = self.stage.name(), "job consumer started");
        while !shutdown.is_shutdown() {
            let wait = match self.process_next().await {
                Ok(ConsumeOutcome::Idle) => self.idle_wait,
                Ok(_) => Duration::ZERO,
                Err(e) => {
                    warn!(queue = %self.queue_name, error = %e, "dequeue failed");
                    self.idle_wait
                }
            };
            if !wait.is_zero() && shutdown.sleep(wait).await {
                break;
            }
        }
        info!(queue = %self.queue_name, "job consumer stopped");
    }

    pub fn spawn(self) -> TaskHandle {
        let name = format!("job-consumer:{}", self.queue_name);
        TaskHandle::spawn(name, move |shutdown| self.run(shutdown))
    }
}

impl std::fmt::Debug for JobConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobConsumer")
            .field("queue_name", &self.queue_name)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::command_handler::CommandHandler;
    use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyCache};
    use crate::queue::{EnqueueOptions, InMemoryJobQueue};
    use crate::store::InMemoryStore;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl StageJobHandler for Recorder {
        async fn handle(&self, job: &QueuedJob, _entity_id: Option<&EntityId>) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(job.job_id.clone());
            if self.fail {
                anyhow::bail!("model timed out");
            }
            Ok(())
        }
    }

    fn consumer(queue: &Arc<InMemoryJobQueue>, handler: Arc<Recorder>) -> JobConsumer {
        let store = Arc::new(InMemoryStore::new());
        let idempotency =
            IdempotencyStore::new(Arc::new(InMemoryIdempotencyCache::new()), store.clone());
        let healing = SelfHealingCheck::new(store.clone(), CommandHandler::new(store, idempotency));
        JobConsumer::new(
            queue.clone(),
            "document-processing",
            Stage::DocumentProcessing,
            healing,
            handler,
        )
    }

    #[tokio::test]
    async fn heals_then_runs_handler() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let recorder = Arc::new(Recorder::default());
        let consumer = consumer(&queue, recorder.clone());

        assert_eq!(consumer.process_next().await.unwrap(), ConsumeOutcome::Idle);

        queue
            .enqueue(
                "document-processing",
                &json!({"entity_id": "course-1"}),
                EnqueueOptions::new("job-1"),
            )
            .await
            .unwrap();

        let outcome = consumer.process_next().await.unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::Processed {
                job_id: "job-1".into(),
                heal: Some(HealOutcome::Healed(Stage::DocumentProcessing.init())),
            }
        );
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["job-1".to_string()]);
    }

    #[tokio::test]
    async fn handler_failure_is_reported() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let consumer = consumer(&queue, recorder);

        queue
            .enqueue("document-processing", &json!({"file": "x"}), EnqueueOptions::new("job-2"))
            .await
            .unwrap();

        let outcome = consumer.process_next().await.unwrap();
        assert_eq!(
            outcome,
            ConsumeOutcome::HandlerFailed {
                job_id: "job-2".into(),
                error: "model timed out".into(),
            }
        );
    }
}
