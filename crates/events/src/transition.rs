use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conduit_core::{EntityId, EventId, InitiatedBy, LifecycleState};

/// Metadata flag set on events recorded for an unchanged state.
pub const NOOP_FLAG: &str = "noop";

/// Append-only audit row describing one lifecycle change.
///
/// `old_state` is `None` for the event that created the record. A re-entry
/// that leaves the state alone is still recorded, with `old_state == new_state`
/// and `metadata.noop = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub event_id: EventId,
    pub entity_id: EntityId,
    pub old_state: Option<LifecycleState>,
    pub new_state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub initiated_by: InitiatedBy,
    pub metadata: JsonValue,
}

impl TransitionEvent {
    pub fn new(
        entity_id: EntityId,
        old_state: Option<LifecycleState>,
        new_state: LifecycleState,
        initiated_by: InitiatedBy,
        metadata: JsonValue,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            entity_id,
            old_state,
            new_state,
            created_at,
            initiated_by,
            metadata,
        }
    }

    /// Event for a call that left the state where it was.
    pub fn noop(
        entity_id: EntityId,
        state: LifecycleState,
        initiated_by: InitiatedBy,
        metadata: JsonValue,
        created_at: DateTime<Utc>,
    ) -> Self {
        let metadata = with_flag(metadata, NOOP_FLAG);
        Self::new(entity_id, Some(state), state, initiated_by, metadata, created_at)
    }

    pub fn is_noop(&self) -> bool {
        self.metadata
            .get(NOOP_FLAG)
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }
}

fn with_flag(metadata: JsonValue, flag: &str) -> JsonValue {
    let mut map = match metadata {
        JsonValue::Object(map) => map,
        JsonValue::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("context".to_string(), other);
            map
        }
    };
    map.insert(flag.to_string(), JsonValue::Bool(true));
    JsonValue::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::Stage;
    use serde_json::json;

    fn entity() -> EntityId {
        EntityId::new("course-1").unwrap()
    }

    #[test]
    fn noop_event_keeps_caller_metadata() {
        let event = TransitionEvent::noop(
            entity(),
            Stage::Analysis.processing(),
            InitiatedBy::Worker,
            json!({"request_id": "r-1"}),
            Utc::now(),
        );

        assert!(event.is_noop());
        assert_eq!(event.old_state, Some(event.new_state));
        assert_eq!(event.metadata["request_id"], "r-1");
    }

    #[test]
    fn regular_event_is_not_noop() {
        let event = TransitionEvent::new(
            entity(),
            None,
            Stage::first().init(),
            InitiatedBy::Api,
            JsonValue::Null,
            Utc::now(),
        );
        assert!(!event.is_noop());
    }

    #[test]
    fn serializes_states_as_text() {
        let event = TransitionEvent::new(
            entity(),
            Some(LifecycleState::Pending),
            Stage::first().init(),
            InitiatedBy::Test,
            json!({}),
            Utc::now(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["old_state"], "pending");
        assert_eq!(value["new_state"], "stage_2_init");
        assert_eq!(value["initiated_by"], "TEST");
    }
}
