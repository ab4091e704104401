use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use tracing::info;

use conduit_core::OutboxId;
use conduit_infra::store::OutboxStore;

use crate::app::dto::{LimitQuery, OutboxEntryResponse};
use crate::app::errors;
use crate::app::services::AppServices;

const DEFAULT_ABANDONED_LIMIT: usize = 100;
const MAX_ABANDONED_LIMIT: usize = 1000;

pub fn router() -> Router {
    Router::new()
        .route("/outbox/abandoned", get(list_abandoned))
        .route("/outbox/:outbox_id/requeue", post(requeue))
}

async fn list_abandoned(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<LimitQuery>,
) -> axum::response::Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ABANDONED_LIMIT)
        .min(MAX_ABANDONED_LIMIT);

    match services.store.list_abandoned(limit).await {
        Ok(rows) => {
            let rows: Vec<OutboxEntryResponse> = rows.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(rows)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

async fn requeue(
    Extension(services): Extension<Arc<AppServices>>,
    Path(outbox_id): Path<String>,
) -> axum::response::Response {
    let outbox_id: OutboxId = match outbox_id.parse() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.store.requeue(outbox_id, Utc::now()).await {
        Ok(entry) => {
            info!(outbox_id = %outbox_id, "abandoned outbox entry requeued");
            (StatusCode::OK, Json(OutboxEntryResponse::from(entry))).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
