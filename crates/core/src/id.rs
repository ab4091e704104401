//! Strongly-typed identifiers used across the orchestration layer.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of an outbox entry.
///
/// Doubles as the job id handed to the distributed queue, which is what makes
/// re-processing an entry idempotent.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(Uuid);

/// Identifier of a transition (audit) event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered).
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(OutboxId, "OutboxId");
impl_uuid_newtype!(EventId, "EventId");

/// Identifier of a generation entity (e.g. `course-1`).
///
/// Entity ids are chosen by collaborators, so they are free-form text with a
/// few structural limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub const MAX_LENGTH: usize = 255;

    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("EntityId cannot be empty"));
        }
        if trimmed.len() > Self::MAX_LENGTH {
            return Err(DomainError::invalid_id(format!(
                "EntityId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::invalid_id(
                "EntityId contains control characters",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for EntityId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityId> for String {
    fn from(value: EntityId) -> Self {
        value.0
    }
}

/// Caller-supplied token that makes a command take effect at most once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub const MAX_LENGTH: usize = 255;

    pub fn new(key: impl Into<String>) -> Result<Self, DomainError> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("IdempotencyKey cannot be empty"));
        }
        if trimmed.len() > Self::MAX_LENGTH {
            return Err(DomainError::invalid_id(format!(
                "IdempotencyKey exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if trimmed.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return Err(DomainError::invalid_id(
                "IdempotencyKey cannot contain whitespace or control characters",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Key derived from where a job came from, e.g. `queue-backup:<uuid>`.
    ///
    /// Job ids are chosen outside this system, so the queue name and job id
    /// are hashed into a UUIDv5 rather than embedded. Repeated observations
    /// of the same job collapse onto a single command.
    pub fn derived(scope: &str, queue_name: &str, job_id: &str) -> Self {
        let mut name = Vec::with_capacity(queue_name.len() + job_id.len() + 1);
        name.extend_from_slice(queue_name.as_bytes());
        name.push(0);
        name.extend_from_slice(job_id.as_bytes());
        let digest = Uuid::new_v5(&Uuid::NAMESPACE_OID, &name);
        Self(format!("{scope}:{digest}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IdempotencyKey> for String {
    fn from(value: IdempotencyKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_id_is_trimmed_and_validated() {
        assert_eq!(EntityId::new("  course-1 ").unwrap().as_str(), "course-1");
        assert!(EntityId::new("   ").is_err());
        assert!(EntityId::new("a".repeat(EntityId::MAX_LENGTH + 1)).is_err());
        assert!(EntityId::new("bad\nid").is_err());
    }

    #[test]
    fn idempotency_key_rejects_whitespace() {
        assert!(IdempotencyKey::new("key-1").is_ok());
        assert!(IdempotencyKey::new("key 1").is_err());
        assert!(IdempotencyKey::new("").is_err());
    }

    #[test]
    fn derived_key_is_scoped_by_queue_and_job() {
        let key = IdempotencyKey::derived("queue-backup", "analysis", "job-7");
        assert!(key.as_str().starts_with("queue-backup:"));
        assert_eq!(key, IdempotencyKey::derived("queue-backup", "analysis", "job-7"));
        assert_ne!(key, IdempotencyKey::derived("queue-backup", "analysis", "job-8"));
        assert_ne!(key, IdempotencyKey::derived("worker-heal", "analysis", "job-7"));
        assert_ne!(
            IdempotencyKey::derived("queue-backup", "a", "b:c"),
            IdempotencyKey::derived("queue-backup", "a:b", "c"),
        );
    }

    #[test]
    fn derived_key_accepts_any_job_id() {
        let long = "x".repeat(1_000);
        for job_id in ["admin retry 1", "tab\tseparated", long.as_str()] {
            let key = IdempotencyKey::derived("queue-backup", "analysis", job_id);
            assert!(key.as_str().len() <= IdempotencyKey::MAX_LENGTH);
            assert_eq!(IdempotencyKey::new(key.as_str()).unwrap(), key);
        }
    }

    #[test]
    fn entity_id_serde_goes_through_validation() {
        let ok: EntityId = serde_json::from_str("\"course-9\"").unwrap();
        assert_eq!(ok.as_str(), "course-9");
        assert!(serde_json::from_str::<EntityId>("\"\"").is_err());
    }

    #[test]
    fn outbox_id_parses_from_display() {
        let id = OutboxId::new();
        let parsed: OutboxId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<OutboxId>().is_err());
    }
}
