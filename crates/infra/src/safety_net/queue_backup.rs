use std::sync::Arc;

use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::StreamMap;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, warn};

use conduit_core::{IdempotencyKey, InitiatedBy, LifecycleState};
use conduit_events::JobCreated;

use crate::command_handler::CommandHandler;
use crate::queue::JobQueue;
use crate::routing::StageRoutes;
use crate::store::{InitializeCommand, SharedStore};
use crate::workers::{ShutdownSignal, TaskHandle};

use super::QUEUE_BACKUP_SCOPE;

/// What the listener did with one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// The entity was missing or pending and is now in this state.
    Initialized(LifecycleState),
    /// The entity already had a non-pending state; nothing to do.
    AlreadyInitialized(LifecycleState),
    /// The queue is not mapped to a pipeline stage.
    UnroutedQueue,
    /// The payload names no (valid) entity.
    MissingEntity,
    /// Initialization failed; logged and dropped.
    Failed(String),
}

/// Watches queue announcements and initializes lifecycle state for jobs
/// that reached the queue without going through the command handler.
#[derive(Clone)]
pub struct QueueBackupListener {
    store: SharedStore,
    handler: CommandHandler,
    queue: Arc<dyn JobQueue>,
    routes: StageRoutes,
}

impl QueueBackupListener {
    pub fn new(
        store: SharedStore,
        handler: CommandHandler,
        queue: Arc<dyn JobQueue>,
        routes: StageRoutes,
    ) -> Self {
        Self {
            store,
            handler,
            queue,
            routes,
        }
    }

    #[instrument(skip(self, event), fields(queue = %event.queue_name, job_id = %event.job_id))]
    pub async fn handle_job_created(&self, event: &JobCreated) -> ListenerOutcome {
        let Some(stage) = self.routes.stage_for(&event.queue_name) else {
            debug!("announcement on unrouted queue");
            return ListenerOutcome::UnroutedQueue;
        };
        let Some(entity_id) = event.entity_id() else {
            warn!("job announcement without a valid entity_id; cannot back up state");
            return ListenerOutcome::MissingEntity;
        };

        match self.store.get_lifecycle(&entity_id).await {
            Ok(Some(record)) if record.state != LifecycleState::Pending => {
                return ListenerOutcome::AlreadyInitialized(record.state);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "queue backup could not read lifecycle");
                return ListenerOutcome::Failed(e.to_string());
            }
        }

        let key = IdempotencyKey::derived(QUEUE_BACKUP_SCOPE, &event.queue_name, &event.job_id);

        let command = InitializeCommand::new(entity_id.clone(), stage.init(), key, InitiatedBy::Queue)
            .with_metadata(json!({
                "source": QUEUE_BACKUP_SCOPE,
                "queue": event.queue_name,
                "job_id": event.job_id,
            }));

        match self.handler.initialize(command).await {
            Ok(result) => {
                if !result.from_cache {
                    warn!(entity_id = %entity_id, state = %result.state, "job bypassed the command handler; lifecycle initialized from queue");
                }
                ListenerOutcome::Initialized(result.state)
            }
            Err(e) => {
                warn!(entity_id = %entity_id, error = %e, "queue backup initialization failed");
                ListenerOutcome::Failed(e.to_string())
            }
        }
    }

    /// Subscribe to every routed queue and handle announcements until shutdown.
    ///
    /// A queue whose subscription fails is skipped with a warning.
    pub async fn run(self, mut shutdown: ShutdownSignal) {
        let mut streams = StreamMap::new();
        for queue_name in self.routes.queues() {
            match self.queue.subscribe(queue_name).await {
                Ok(subscription) => {
                    streams.insert(
                        queue_name.to_string(),
                        ReceiverStream::new(subscription.into_inner()),
                    );
                }
                Err(e) => warn!(queue = queue_name, error = %e, "queue backup cannot subscribe"),
            }
        }
        info!(queues = streams.len(), "queue backup listener started");

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                next = streams.next() => match next {
                    Some((_, event)) => {
                        self.handle_job_created(&event).await;
                    }
                    None => {
                        warn!("all queue subscriptions closed");
                        break;
                    }
                },
            }
        }
        info!("queue backup listener stopped");
    }

    pub fn spawn(self) -> TaskHandle {
        TaskHandle::spawn("queue-backup-listener", move |shutdown| self.run(shutdown))
    }
}

impl std::fmt::Debug for QueueBackupListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueBackupListener")
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use conduit_core::{EntityId, Stage};

    use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyCache};
    use crate::queue::{EnqueueOptions, InMemoryJobQueue};
    use crate::store::{InMemoryStore, LifecycleQuery};

    fn listener(store: &Arc<InMemoryStore>, queue: &Arc<InMemoryJobQueue>) -> QueueBackupListener {
        let idempotency =
            IdempotencyStore::new(Arc::new(InMemoryIdempotencyCache::new()), store.clone());
        let handler = CommandHandler::new(store.clone(), idempotency);
        QueueBackupListener::new(store.clone(), handler, queue.clone(), StageRoutes::default())
    }

    fn announcement(queue: &str, entity: &str) -> JobCreated {
        JobCreated {
            queue_name: queue.to_string(),
            job_id: "job-1".to_string(),
            payload: json!({"entity_id": entity}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn initializes_missing_entity_to_job_stage() {
        let store = Arc::new(InMemoryStore::new());
        let listener = listener(&store, &Arc::new(InMemoryJobQueue::new()));

        let outcome = listener
            .handle_job_created(&announcement("document-processing", "course-1"))
            .await;
        assert_eq!(outcome, ListenerOutcome::Initialized(Stage::first().init()));

        // Repeated announcement collapses onto the same command.
        let again = listener
            .handle_job_created(&announcement("document-processing", "course-1"))
            .await;
        assert_eq!(again, ListenerOutcome::AlreadyInitialized(Stage::first().init()));

        let events = store.event_rows();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].initiated_by, InitiatedBy::Queue);
        assert!(store.outbox_rows().is_empty());
    }

    #[tokio::test]
    async fn free_form_job_ids_still_initialize() {
        let store = Arc::new(InMemoryStore::new());
        let listener = listener(&store, &Arc::new(InMemoryJobQueue::new()));
        let event = JobCreated {
            job_id: "admin retry 1".into(),
            ..announcement("document-processing", "course-1")
        };

        assert_eq!(
            listener.handle_job_created(&event).await,
            ListenerOutcome::Initialized(Stage::first().init())
        );

        let long = JobCreated {
            job_id: "retry-".repeat(100),
            ..announcement("document-processing", "course-2")
        };
        assert_eq!(
            listener.handle_job_created(&long).await,
            ListenerOutcome::Initialized(Stage::first().init())
        );
        assert_eq!(store.lifecycle_count(), 2);
    }

    #[tokio::test]
    async fn leaves_initialized_entity_alone() {
        let store = Arc::new(InMemoryStore::new());
        let listener = listener(&store, &Arc::new(InMemoryJobQueue::new()));
        listener
            .handle_job_created(&announcement("document-processing", "course-1"))
            .await;

        let outcome = listener
            .handle_job_created(&JobCreated {
                job_id: "job-2".into(),
                ..announcement("summarization", "course-1")
            })
            .await;
        assert_eq!(outcome, ListenerOutcome::AlreadyInitialized(Stage::first().init()));
    }

    #[tokio::test]
    async fn failures_are_reported_not_raised() {
        let store = Arc::new(InMemoryStore::new());
        let listener = listener(&store, &Arc::new(InMemoryJobQueue::new()));

        assert_eq!(
            listener.handle_job_created(&announcement("unknown-queue", "course-1")).await,
            ListenerOutcome::UnroutedQueue
        );
        assert_eq!(
            listener
                .handle_job_created(&JobCreated {
                    payload: json!({"file": "a.pdf"}),
                    ..announcement("analysis", "course-1")
                })
                .await,
            ListenerOutcome::MissingEntity
        );

        store.set_unavailable(true);
        assert!(matches!(
            listener.handle_job_created(&announcement("analysis", "course-1")).await,
            ListenerOutcome::Failed(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn background_listener_picks_up_bypassing_jobs() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryJobQueue::new());
        let handle = listener(&store, &queue).spawn();
        // Subscriptions are registered inside the spawned task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue
            .enqueue(
                "document-processing",
                &json!({"entity_id": "course-9"}),
                EnqueueOptions::new("direct-1"),
            )
            .await
            .unwrap();

        let entity = EntityId::new("course-9").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(record) = store.get_lifecycle(&entity).await.unwrap() {
                assert_eq!(record.state, Stage::first().init());
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "listener never initialized entity");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.shutdown(Duration::from_secs(1)).await;
    }
}
