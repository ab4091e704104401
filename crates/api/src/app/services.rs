//! Infrastructure wiring: store, idempotency tiers, queue, and the
//! background tasks that run next to the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use conduit_infra::command_handler::CommandHandler;
use conduit_infra::config::OrchestratorConfig;
use conduit_infra::idempotency::{IdempotencyCache, IdempotencyStore, InMemoryIdempotencyCache};
use conduit_infra::outbox::{HealthHandle, OutboxProcessor};
use conduit_infra::queue::{InMemoryJobQueue, JobQueue};
use conduit_infra::routing::StageRoutes;
use conduit_infra::safety_net::QueueBackupListener;
use conduit_infra::store::{InMemoryStore, PostgresStore, SharedStore};
use conduit_infra::workers::{RetentionSweeper, TaskHandle};

#[cfg(feature = "redis")]
use conduit_infra::idempotency::RedisIdempotencyCache;
#[cfg(feature = "redis")]
use conduit_infra::queue::RedisStreamsJobQueue;

const PG_MAX_CONNECTIONS: u32 = 10;

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppServices {
    pub store: SharedStore,
    pub handler: CommandHandler,
    pub health: HealthHandle,
    /// A processor that has not polled successfully for this long is unhealthy.
    pub health_max_age: Duration,
}

/// Everything the process runs: request-facing services plus the
/// background tasks that are started next to the server.
pub struct Orchestrator {
    pub services: Arc<AppServices>,
    pub queue: Arc<dyn JobQueue>,
    processor: OutboxProcessor,
    listener: QueueBackupListener,
    sweeper: RetentionSweeper,
    grace: Duration,
}

impl Orchestrator {
    /// Wire backends from configuration. Absent URLs fall back to in-memory
    /// backends, which only make sense for a single dev process.
    pub async fn from_config(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let store: SharedStore = match &config.database_url {
            Some(url) => {
                let store = PostgresStore::connect(url, PG_MAX_CONNECTIONS)
                    .await
                    .context("failed to connect to Postgres")?;
                store.migrate().await.context("failed to run migrations")?;
                info!("using Postgres store");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory store (dev only)");
                Arc::new(InMemoryStore::new())
            }
        };

        let (cache, queue) = Self::redis_backends(config)?;
        Ok(Self::assemble(store, cache, queue, config))
    }

    /// Fully in-memory wiring (dev and tests).
    pub fn in_memory(config: &OrchestratorConfig) -> Self {
        Self::assemble(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryIdempotencyCache::new()),
            Arc::new(InMemoryJobQueue::new()),
            config,
        )
    }

    #[cfg(feature = "redis")]
    fn redis_backends(
        config: &OrchestratorConfig,
    ) -> anyhow::Result<(Arc<dyn IdempotencyCache>, Arc<dyn JobQueue>)> {
        match &config.redis_url {
            Some(url) => {
                let consumer = format!("conduit-api-{}", std::process::id());
                let cache = RedisIdempotencyCache::new(url).context("invalid REDIS_URL")?;
                let queue = RedisStreamsJobQueue::new(url, consumer).context("invalid REDIS_URL")?;
                info!("using Redis idempotency cache and Redis Streams queue");
                Ok((Arc::new(cache), Arc::new(queue)))
            }
            None => Ok(Self::in_memory_backends()),
        }
    }

    #[cfg(not(feature = "redis"))]
    fn redis_backends(
        config: &OrchestratorConfig,
    ) -> anyhow::Result<(Arc<dyn IdempotencyCache>, Arc<dyn JobQueue>)> {
        if config.redis_url.is_some() {
            warn!("REDIS_URL set but the redis feature is disabled; ignoring");
        }
        Ok(Self::in_memory_backends())
    }

    fn in_memory_backends() -> (Arc<dyn IdempotencyCache>, Arc<dyn JobQueue>) {
        warn!("REDIS_URL not set; using in-memory cache and queue (dev only)");
        (
            Arc::new(InMemoryIdempotencyCache::new()),
            Arc::new(InMemoryJobQueue::new()),
        )
    }

    fn assemble(
        store: SharedStore,
        cache: Arc<dyn IdempotencyCache>,
        queue: Arc<dyn JobQueue>,
        config: &OrchestratorConfig,
    ) -> Self {
        let idempotency = IdempotencyStore::new(cache, store.clone());
        let handler =
            CommandHandler::new(store.clone(), idempotency).with_ttl(config.idempotency_ttl);
        let processor = OutboxProcessor::new(store.clone(), queue.clone(), config.outbox.clone());
        let listener = QueueBackupListener::new(
            store.clone(),
            handler.clone(),
            queue.clone(),
            StageRoutes::default(),
        );
        let sweeper = RetentionSweeper::new(store.clone(), config.retention);

        let services = Arc::new(AppServices {
            store,
            handler,
            health: processor.health(),
            health_max_age: (config.outbox.poll_max * 3).max(Duration::from_secs(15)),
        });

        Self {
            services,
            queue,
            processor,
            listener,
            sweeper,
            grace: config.outbox.shutdown_grace,
        }
    }

    /// Start the background tasks.
    pub fn start(self) -> (Arc<AppServices>, BackgroundTasks) {
        let tasks = BackgroundTasks {
            handles: vec![
                self.processor.spawn(),
                self.listener.spawn(),
                self.sweeper.spawn(),
            ],
            grace: self.grace,
        };
        (self.services, tasks)
    }
}

/// Handles of the running background tasks.
pub struct BackgroundTasks {
    handles: Vec<TaskHandle>,
    grace: Duration,
}

impl BackgroundTasks {
    /// Signal every task and wait (bounded by the grace period) for each.
    pub async fn shutdown(self) {
        let mut stops = tokio::task::JoinSet::new();
        for handle in self.handles {
            stops.spawn(handle.shutdown(self.grace));
        }
        while stops.join_next().await.is_some() {}
    }
}
