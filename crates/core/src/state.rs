//! Lifecycle states of a generation entity.
//!
//! The pipeline is linear:
//!
//! ```text
//! pending → stage_2_init → stage_2_processing → stage_2_complete
//!         → stage_3_init → …                  → stage_5_complete
//!         → finalizing → completed
//! ```
//!
//! Every state name is qualified by its stage, so no two stages ever share a
//! state. Adding a stage means adding a `Stage` variant; it brings exactly the
//! three states `init`, `processing` and `complete` with it.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A pipeline stage, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    DocumentProcessing,
    Summarization,
    Analysis,
    StructureGeneration,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 4] = [
        Stage::DocumentProcessing,
        Stage::Summarization,
        Stage::Analysis,
        Stage::StructureGeneration,
    ];

    /// The stage every fresh pipeline run enters first.
    pub fn first() -> Self {
        Self::ALL[0]
    }

    /// The number used in persisted state names (`stage_<n>_…`).
    pub fn number(self) -> u8 {
        match self {
            Stage::DocumentProcessing => 2,
            Stage::Summarization => 3,
            Stage::Analysis => 4,
            Stage::StructureGeneration => 5,
        }
    }

    pub fn from_number(number: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.number() == number)
    }

    pub fn next(self) -> Option<Self> {
        let idx = Self::ALL.iter().position(|s| *s == self)?;
        Self::ALL.get(idx + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::DocumentProcessing => "document_processing",
            Stage::Summarization => "summarization",
            Stage::Analysis => "analysis",
            Stage::StructureGeneration => "structure_generation",
        }
    }

    /// Queue that carries this stage's jobs unless configured otherwise.
    pub fn default_queue(self) -> &'static str {
        match self {
            Stage::DocumentProcessing => "document-processing",
            Stage::Summarization => "summarization",
            Stage::Analysis => "analysis",
            Stage::StructureGeneration => "structure-generation",
        }
    }

    pub fn init(self) -> LifecycleState {
        LifecycleState::InStage { stage: self, phase: Phase::Init }
    }

    pub fn processing(self) -> LifecycleState {
        LifecycleState::InStage { stage: self, phase: Phase::Processing }
    }

    pub fn complete(self) -> LifecycleState {
        LifecycleState::InStage { stage: self, phase: Phase::Complete }
    }
}

/// Position inside a stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Processing,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Init, Phase::Processing, Phase::Complete];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Processing => "processing",
            Phase::Complete => "complete",
        }
    }
}

/// Lifecycle state of an entity.
///
/// Persisted as its text form (`pending`, `stage_3_processing`, …).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LifecycleState {
    Pending,
    InStage { stage: Stage, phase: Phase },
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl LifecycleState {
    /// Every state of the pipeline, in pipeline order followed by the failure states.
    pub fn all() -> Vec<LifecycleState> {
        let mut states = Vec::with_capacity(Stage::ALL.len() * Phase::ALL.len() + 5);
        states.push(LifecycleState::Pending);
        for stage in Stage::ALL {
            for phase in Phase::ALL {
                states.push(LifecycleState::InStage { stage, phase });
            }
        }
        states.extend([
            LifecycleState::Finalizing,
            LifecycleState::Completed,
            LifecycleState::Failed,
            LifecycleState::Cancelled,
        ]);
        states
    }

    pub fn stage(self) -> Option<Stage> {
        match self {
            LifecycleState::InStage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn phase(self) -> Option<Phase> {
        match self {
            LifecycleState::InStage { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// `completed`, `failed` and `cancelled`. Only a restart leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Failed | LifecycleState::Cancelled
        )
    }

    /// States a lifecycle record may be created in: `pending` or any `stage_N_init`.
    pub fn is_entry(self) -> bool {
        matches!(
            self,
            LifecycleState::Pending | LifecycleState::InStage { phase: Phase::Init, .. }
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Pending => f.write_str("pending"),
            LifecycleState::InStage { stage, phase } => {
                write!(f, "stage_{}_{}", stage.number(), phase.as_str())
            }
            LifecycleState::Finalizing => f.write_str("finalizing"),
            LifecycleState::Completed => f.write_str("completed"),
            LifecycleState::Failed => f.write_str("failed"),
            LifecycleState::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl FromStr for LifecycleState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => return Ok(LifecycleState::Pending),
            "finalizing" => return Ok(LifecycleState::Finalizing),
            "completed" => return Ok(LifecycleState::Completed),
            "failed" => return Ok(LifecycleState::Failed),
            "cancelled" => return Ok(LifecycleState::Cancelled),
            _ => {}
        }

        let rest = s
            .strip_prefix("stage_")
            .ok_or_else(|| DomainError::unknown_state(s))?;
        let (number, phase) = rest
            .split_once('_')
            .ok_or_else(|| DomainError::unknown_state(s))?;
        let stage = number
            .parse::<u8>()
            .ok()
            .and_then(Stage::from_number)
            .ok_or_else(|| DomainError::unknown_state(s))?;
        let phase = Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == phase)
            .ok_or_else(|| DomainError::unknown_state(s))?;

        Ok(LifecycleState::InStage { stage, phase })
    }
}

impl TryFrom<String> for LifecycleState {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LifecycleState> for String {
    fn from(value: LifecycleState) -> Self {
        value.to_string()
    }
}

/// Who initiated a state change (recorded on every transition event).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InitiatedBy {
    Api,
    Queue,
    Worker,
    Admin,
    Test,
}

impl InitiatedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            InitiatedBy::Api => "API",
            InitiatedBy::Queue => "QUEUE",
            InitiatedBy::Worker => "WORKER",
            InitiatedBy::Admin => "ADMIN",
            InitiatedBy::Test => "TEST",
        }
    }
}

impl fmt::Display for InitiatedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitiatedBy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "API" => Ok(InitiatedBy::Api),
            "QUEUE" => Ok(InitiatedBy::Queue),
            "WORKER" => Ok(InitiatedBy::Worker),
            "ADMIN" => Ok(InitiatedBy::Admin),
            "TEST" => Ok(InitiatedBy::Test),
            other => Err(DomainError::validation(format!(
                "unknown initiator '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_names_round_trip() {
        for state in LifecycleState::all() {
            let name = state.to_string();
            assert_eq!(name.parse::<LifecycleState>().unwrap(), state, "{name}");
        }
    }

    #[test]
    fn stage_states_are_stage_qualified() {
        assert_eq!(Stage::DocumentProcessing.init().to_string(), "stage_2_init");
        assert_eq!(Stage::Analysis.processing().to_string(), "stage_4_processing");
        assert_eq!(
            Stage::StructureGeneration.complete().to_string(),
            "stage_5_complete"
        );
    }

    #[test]
    fn state_names_are_unique() {
        let mut names: Vec<String> = LifecycleState::all().iter().map(ToString::to_string).collect();
        let total = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn unknown_states_are_rejected() {
        for bad in ["stage_5_generating", "stage_9_init", "stage_x_init", "initializing", ""] {
            assert!(
                matches!(bad.parse::<LifecycleState>(), Err(DomainError::UnknownState(_))),
                "{bad} should not parse"
            );
        }
    }

    #[test]
    fn stages_chain_in_order() {
        assert_eq!(Stage::first(), Stage::DocumentProcessing);
        assert_eq!(Stage::DocumentProcessing.next(), Some(Stage::Summarization));
        assert_eq!(Stage::StructureGeneration.next(), None);
        assert_eq!(Stage::from_number(4), Some(Stage::Analysis));
        assert_eq!(Stage::from_number(1), None);
    }

    #[test]
    fn serde_uses_text_form() {
        let json = serde_json::to_string(&Stage::Summarization.processing()).unwrap();
        assert_eq!(json, "\"stage_3_processing\"");

        let by: InitiatedBy = serde_json::from_str("\"WORKER\"").unwrap();
        assert_eq!(by, InitiatedBy::Worker);
    }

    #[test]
    fn entry_states() {
        assert!(LifecycleState::Pending.is_entry());
        assert!(Stage::Analysis.init().is_entry());
        assert!(!Stage::Analysis.processing().is_entry());
        assert!(!LifecycleState::Completed.is_entry());
    }
}
