use serde_json::json;
use tracing::{debug, instrument, warn};

use conduit_core::{EntityId, IdempotencyKey, InitiatedBy, LifecycleState, Stage};

use crate::command_handler::CommandHandler;
use crate::store::{InitializeCommand, SharedStore};

use super::WORKER_HEAL_SCOPE;

/// Result of the pre-job consistency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealOutcome {
    /// Entity is already inside the job's stage.
    Consistent(LifecycleState),
    /// Entity is past the job's stage (a late or retried job).
    Ahead(LifecycleState),
    /// Entity is failed or cancelled; restarting is left to an operator.
    Halted(LifecycleState),
    /// Entity was behind and is now in this state.
    Healed(LifecycleState),
    /// The state could not be read or initialized. Processing continues.
    HealFailed(String),
}

/// Runs at the start of every job, before business logic.
///
/// If the entity is not yet inside the job's stage, initializes that stage
/// through the command handler. Never blocks the job: every failure turns
/// into [`HealOutcome::HealFailed`] plus a warning.
#[derive(Clone)]
pub struct SelfHealingCheck {
    store: SharedStore,
    handler: CommandHandler,
}

impl SelfHealingCheck {
    pub fn new(store: SharedStore, handler: CommandHandler) -> Self {
        Self { store, handler }
    }

    #[instrument(skip(self), fields(entity_id = %entity_id, stage = stage.name()))]
    pub async fn ensure_stage(
        &self,
        entity_id: &EntityId,
        stage: Stage,
        queue_name: &str,
        job_id: &str,
    ) -> HealOutcome {
        let current = match self.store.get_lifecycle(entity_id).await {
            Ok(record) => record.map(|r| r.state),
            Err(e) => {
                warn!(error = %e, "self-healing could not read lifecycle; continuing");
                return HealOutcome::HealFailed(e.to_string());
            }
        };

        if let Some(state) = current {
            match classify(state, stage) {
                Position::Inside => return HealOutcome::Consistent(state),
                Position::Ahead => {
                    debug!(state = %state, "entity already past job stage");
                    return HealOutcome::Ahead(state);
                }
                Position::Halted => {
                    warn!(state = %state, "job running for a halted entity");
                    return HealOutcome::Halted(state);
                }
                Position::Behind => {}
            }
        }

        let key = IdempotencyKey::derived(WORKER_HEAL_SCOPE, queue_name, job_id);
        let command = InitializeCommand::new(entity_id.clone(), stage.init(), key, InitiatedBy::Worker)
            .with_metadata(json!({
                "source": WORKER_HEAL_SCOPE,
                "queue": queue_name,
                "job_id": job_id,
                "observed_state": current.map(|s| s.to_string()),
            }));

        match self.handler.initialize(command).await {
            Ok(result) => {
                warn!(
                    observed = ?current.map(|s| s.to_string()),
                    state = %result.state,
                    "entity state lagged behind running job; healed"
                );
                HealOutcome::Healed(result.state)
            }
            Err(e) => {
                warn!(error = %e, "self-healing failed; continuing with job");
                HealOutcome::HealFailed(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for SelfHealingCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfHealingCheck").finish_non_exhaustive()
    }
}

enum Position {
    Behind,
    Inside,
    Ahead,
    Halted,
}

fn classify(state: LifecycleState, stage: Stage) -> Position {
    match state {
        LifecycleState::Pending => Position::Behind,
        LifecycleState::InStage { stage: current, .. } if current == stage => Position::Inside,
        LifecycleState::InStage { stage: current, .. } if current < stage => Position::Behind,
        LifecycleState::InStage { .. } | LifecycleState::Finalizing | LifecycleState::Completed => {
            Position::Ahead
        }
        LifecycleState::Failed | LifecycleState::Cancelled => Position::Halted,
    }
}
