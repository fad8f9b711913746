use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::jobs::{JobId, JobRecord, JobStatus};
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
        .route("/{id}/pause", post(pause_job))
        .route("/{id}/resume", post(resume_job))
        .route("/{id}/cancel", post(cancel_job))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<JobRecord>>, AppError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<JobStatus>()
                .map_err(|_| AppError::BadRequest(format!("unknown job status '{}'", s)))?,
        ),
        None => None,
    };
    Ok(Json(state.service.jobs(status).await?))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobRecord>, AppError> {
    Ok(Json(state.service.job(id).await?))
}

async fn pause_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobRecord>, AppError> {
    let job = state.service.pause(id).await?;
    tracing::info!("Job {} pause requested", id);
    Ok(Json(job))
}

async fn resume_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobRecord>, AppError> {
    let job = state.service.resume(id).await?;
    tracing::info!("Job {} resumed", id);
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<JobId>,
) -> Result<Json<JobRecord>, AppError> {
    let job = state.service.cancel(id).await?;
    tracing::info!("Job {} cancel requested", id);
    Ok(Json(job))
}
