use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::store::r#trait::saturating_sub;
use crate::store::{SharedStore, StoreError};

use super::{ShutdownSignal, TaskHandle};

/// How long processed rows are kept and how often the sweep runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub processed_outbox: Duration,
    pub transition_events: Duration,
    pub interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            processed_outbox: Duration::from_secs(7 * 24 * 60 * 60),
            transition_events: Duration::from_secs(90 * 24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idempotency_records: u64,
    pub outbox_entries: u64,
    pub transition_events: u64,
}

/// Periodically purges expired idempotency records, processed outbox rows
/// and old transition events.
#[derive(Clone)]
pub struct RetentionSweeper {
    store: SharedStore,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(store: SharedStore, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    /// Run all three purges as of `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let report = SweepReport {
            idempotency_records: self.store.purge_expired_idempotency(now).await?,
            outbox_entries: self
                .store
                .purge_processed_outbox(saturating_sub(now, self.policy.processed_outbox))
                .await?,
            transition_events: self
                .store
                .purge_transition_events(saturating_sub(now, self.policy.transition_events))
                .await?,
        };
        debug!(
            idempotency_records = report.idempotency_records,
            outbox_entries = report.outbox_entries,
            transition_events = report.transition_events,
            "retention sweep finished"
        );
        Ok(report)
    }

    pub async fn run(self, mut shutdown: ShutdownSignal) {
        info!(interval = ?self.policy.interval, "retention sweeper started");
        loop {
            if let Err(e) = self.sweep_at(Utc::now()).await {
                warn!(error = %e, "retention sweep failed");
            }
            if shutdown.sleep(self.policy.interval).await {
                break;
            }
        }
        info!("retention sweeper stopped");
    }

    pub fn spawn(self) -> TaskHandle {
        TaskHandle::spawn("retention-sweeper", move |shutdown| self.run(shutdown))
    }
}

impl std::fmt::Debug for RetentionSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionSweeper")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use conduit_core::{EntityId, IdempotencyKey, InitiatedBy, Stage};
    use conduit_events::JobDescriptor;
    use serde_json::json;

    use crate::store::{CommandStore, InMemoryStore, InitializeCommand, OutboxStore};

    #[tokio::test]
    async fn sweep_purges_only_what_has_aged_out() {
        let store = Arc::new(InMemoryStore::new());
        let cmd = InitializeCommand::new(
            EntityId::new("course-1").unwrap(),
            Stage::first().init(),
            IdempotencyKey::new("key-1").unwrap(),
            InitiatedBy::Test,
        )
        .with_job(JobDescriptor::new("document-processing", json!({})));
        store.initialize_atomic(&cmd, Duration::from_secs(60)).await.unwrap();
        let row = store.outbox_rows()[0].outbox_id;
        store.mark_processed(row, Utc::now()).await.unwrap();

        let sweeper = RetentionSweeper::new(store.clone(), RetentionPolicy::default());

        let now = sweeper.sweep_at(Utc::now()).await.unwrap();
        assert_eq!(now, SweepReport::default());

        let later = Utc::now() + chrono::Duration::days(8);
        let report = sweeper.sweep_at(later).await.unwrap();
        assert_eq!(report.idempotency_records, 1);
        assert_eq!(report.outbox_entries, 1);
        assert_eq!(report.transition_events, 0);

        let much_later = Utc::now() + chrono::Duration::days(91);
        assert_eq!(sweeper.sweep_at(much_later).await.unwrap().transition_events, 1);
    }
}
