pub mod backup;
pub mod jobs;

use crate::error::AppError;
use crate::state::AppState;
use axum::http::HeaderMap;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Header naming the principal a statement runs as.
pub const USER_HEADER: &str = "x-backup-user";

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/jobs", jobs::router(state.clone()))
        .nest("/api", backup::router(state.clone()))
        .route("/ws", axum::routing::get(crate::ws::ui::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub(crate) fn request_user(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::BadRequest(format!("missing {} header", USER_HEADER)))
}
