use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;

use crate::app::services::AppServices;

/// Outbox processor liveness and backlog. 503 once the processor has stopped
/// or has not polled successfully within the allowed age.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let health = services.health.snapshot().await;
    let live = health.is_live(Utc::now(), services.health_max_age);
    let status = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if live { "ok" } else { "degraded" },
            "outbox": health,
        })),
    )
}
