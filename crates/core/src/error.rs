//! Domain error model.

use thiserror::Error;

use crate::state::LifecycleState;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, illegal state
/// changes). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The validator rejected a lifecycle state change.
    ///
    /// `from` is `None` when the entity has no lifecycle record yet.
    #[error("invalid transition for entity '{entity_id}': {} -> {to}", describe_from(.from))]
    InvalidTransition {
        entity_id: String,
        from: Option<LifecycleState>,
        to: LifecycleState,
    },

    /// A persisted or requested state name is not part of the pipeline.
    #[error("unknown lifecycle state: {0}")]
    UnknownState(String),

    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn invalid_transition(
        entity_id: impl Into<String>,
        from: Option<LifecycleState>,
        to: LifecycleState,
    ) -> Self {
        Self::InvalidTransition {
            entity_id: entity_id.into(),
            from,
            to,
        }
    }

    pub fn unknown_state(name: impl Into<String>) -> Self {
        Self::UnknownState(name.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

fn describe_from(from: &Option<LifecycleState>) -> String {
    match from {
        Some(state) => state.to_string(),
        None => "<none>".to_string(),
    }
}
