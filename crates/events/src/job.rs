use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use conduit_core::EntityId;

/// Payload field that names the entity a job works on.
pub const ENTITY_ID_FIELD: &str = "entity_id";

/// A job to create in the distributed queue.
///
/// The payload is opaque to orchestration except for [`ENTITY_ID_FIELD`],
/// which the safety nets read to find the owning entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub queue_name: String,
    pub payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JsonValue>,
}

impl JobDescriptor {
    pub fn new(queue_name: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload,
            options: None,
        }
    }

    pub fn with_options(mut self, options: JsonValue) -> Self {
        self.options = Some(options);
        self
    }

    /// Entity named in the payload, if any.
    pub fn entity_id(&self) -> Option<EntityId> {
        entity_id_of(&self.payload)
    }
}

/// Announcement published by a queue once a job exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreated {
    pub queue_name: String,
    pub job_id: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl JobCreated {
    pub fn entity_id(&self) -> Option<EntityId> {
        entity_id_of(&self.payload)
    }
}

fn entity_id_of(payload: &JsonValue) -> Option<EntityId> {
    payload
        .get(ENTITY_ID_FIELD)
        .and_then(JsonValue::as_str)
        .and_then(|raw| EntityId::new(raw).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_id_is_read_from_payload() {
        let job = JobDescriptor::new("summarization", json!({"entity_id": "course-1", "n": 3}));
        assert_eq!(job.entity_id().unwrap().as_str(), "course-1");
    }

    #[test]
    fn missing_or_blank_entity_id_is_none() {
        assert!(JobDescriptor::new("q", json!({"other": 1})).entity_id().is_none());
        assert!(JobDescriptor::new("q", json!({"entity_id": "  "})).entity_id().is_none());
        assert!(JobDescriptor::new("q", json!("scalar")).entity_id().is_none());
    }

    #[test]
    fn options_are_optional_on_the_wire() {
        let job: JobDescriptor =
            serde_json::from_value(json!({"queue_name": "analysis", "payload": {}})).unwrap();
        assert_eq!(job.options, None);
        assert!(!serde_json::to_string(&job).unwrap().contains("options"));
    }
}
