use serde::{Deserialize, Serialize};

use conduit_events::JobDescriptor;
use conduit_infra::store::{OutboxEntry, Pagination};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct InitializeRequest {
    pub initial_state: String,
    #[serde(default)]
    pub jobs: Vec<JobDescriptor>,
    pub idempotency_key: String,
    /// Defaults to `API`.
    #[serde(default)]
    pub initiated_by: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl From<PageQuery> for Pagination {
    fn from(value: PageQuery) -> Self {
        Pagination::new(value.limit, value.offset)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Outbox row as shown to operators.
#[derive(Debug, Serialize)]
pub struct OutboxEntryResponse {
    pub outbox_id: String,
    pub entity_id: String,
    pub queue_name: String,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub available_at: String,
    pub processed_at: Option<String>,
    pub abandoned_at: Option<String>,
}

impl From<OutboxEntry> for OutboxEntryResponse {
    fn from(entry: OutboxEntry) -> Self {
        Self {
            outbox_id: entry.outbox_id.to_string(),
            entity_id: entry.entity_id.to_string(),
            queue_name: entry.queue_name,
            attempts: entry.attempts,
            last_error: entry.last_error,
            created_at: entry.created_at.to_rfc3339(),
            available_at: entry.available_at.to_rfc3339(),
            processed_at: entry.processed_at.map(|t| t.to_rfc3339()),
            abandoned_at: entry.abandoned_at.map(|t| t.to_rfc3339()),
        }
    }
}
