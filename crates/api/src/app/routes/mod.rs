use axum::Router;

pub mod admin;
pub mod entities;
pub mod system;

/// Router for lifecycle and admin endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/entities", entities::router())
        .nest("/admin", admin::router())
}
