use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use conduit_core::{EntityId, IdempotencyKey, InitiatedBy};
use conduit_infra::store::{InitializeCommand, LifecycleQuery};

use crate::app::dto::{InitializeRequest, OutboxEntryResponse, PageQuery};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/:entity_id", get(get_lifecycle))
        .route("/:entity_id/transitions", get(list_transitions))
        .route("/:entity_id/outbox", get(list_outbox))
        .route("/:entity_id/initialize", post(initialize))
}

fn parse_entity_id(raw: String) -> Result<EntityId, axum::response::Response> {
    EntityId::new(raw).map_err(errors::domain_error_to_response)
}

async fn get_lifecycle(
    Extension(services): Extension<Arc<AppServices>>,
    Path(entity_id): Path<String>,
) -> axum::response::Response {
    let entity_id = match parse_entity_id(entity_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store.get_lifecycle(&entity_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no lifecycle record for entity '{entity_id}'"),
        ),
        Err(e) => errors::store_error_to_response(e),
    }
}

async fn list_transitions(
    Extension(services): Extension<Arc<AppServices>>,
    Path(entity_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> axum::response::Response {
    let entity_id = match parse_entity_id(entity_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services
        .store
        .list_transitions(&entity_id, page.into())
        .await
    {
        Ok(events) => (StatusCode::OK, Json(events)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

async fn list_outbox(
    Extension(services): Extension<Arc<AppServices>>,
    Path(entity_id): Path<String>,
) -> axum::response::Response {
    let entity_id = match parse_entity_id(entity_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store.list_outbox_for_entity(&entity_id).await {
        Ok(rows) => {
            let rows: Vec<OutboxEntryResponse> =
                rows.into_iter().map(Into::into).collect();
            (StatusCode::OK, Json(rows)).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

async fn initialize(
    Extension(services): Extension<Arc<AppServices>>,
    Path(entity_id): Path<String>,
    body: Result<Json<InitializeRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::json_rejection_to_response(rejection),
    };
    let command = match build_command(&services, entity_id, req).await {
        Ok(command) => command,
        Err(resp) => return resp,
    };

    match services.handler.initialize(command).await {
        Ok(result) => {
            let status = if result.from_cache {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            (status, Json(result)).into_response()
        }
        Err(e) => errors::command_error_to_response(e),
    }
}

async fn build_command(
    services: &AppServices,
    entity_id: String,
    req: InitializeRequest,
) -> Result<InitializeCommand, axum::response::Response> {
    let entity_id = parse_entity_id(entity_id)?;
    let key = IdempotencyKey::new(req.idempotency_key).map_err(errors::domain_error_to_response)?;
    let initiated_by = match req.initiated_by.as_deref() {
        Some(raw) => raw
            .parse::<InitiatedBy>()
            .map_err(errors::domain_error_to_response)?,
        None => InitiatedBy::Api,
    };
    let state = services
        .handler
        .resolve_requested_state(&entity_id, &req.initial_state)
        .await
        .map_err(errors::command_error_to_response)?;

    let mut command = InitializeCommand::new(entity_id, state, key, initiated_by).with_jobs(req.jobs);
    if let Some(metadata) = req.metadata {
        command = command.with_metadata(metadata);
    }
    Ok(command)
}
