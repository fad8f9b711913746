use crate::error::AppError;
use crate::routes::request_user;
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::backup::show::ShowBackupRow;
use backup_engine::backup::{BackupStatement, Target};
use backup_engine::kv::Timestamp;
use backup_engine::restore::{RestoreOptions, RestoreStatement};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/backup", post(start_backup))
        .route("/backup/show", get(show_backup))
        .route("/restore", post(start_restore))
}

/// Targets use statement syntax: `DATABASE d`, `d.*` or `d.t`.
#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    pub targets: Vec<String>,
    pub uri: String,
    #[serde(default)]
    pub incremental_from: Vec<String>,
    pub as_of: Option<String>,
    #[serde(default)]
    pub revision_history: bool,
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub targets: Vec<String>,
    pub uris: Vec<String>,
    pub as_of: Option<String>,
    pub into_db: Option<String>,
    #[serde(default)]
    pub skip_missing_foreign_keys: bool,
}

#[derive(Deserialize)]
pub struct ShowQuery {
    pub uri: String,
}

fn parse_targets(targets: &[String]) -> Result<Vec<Target>, AppError> {
    if targets.is_empty() {
        return Err(AppError::BadRequest("targets must not be empty".into()));
    }
    targets
        .iter()
        .map(|t| t.parse::<Target>().map_err(AppError::from))
        .collect()
}

fn parse_as_of(as_of: Option<&str>) -> Result<Option<Timestamp>, AppError> {
    as_of
        .map(|s| s.parse::<Timestamp>().map_err(AppError::BadRequest))
        .transpose()
}

impl BackupRequest {
    fn into_statement(self) -> Result<BackupStatement, AppError> {
        Ok(BackupStatement {
            targets: parse_targets(&self.targets)?,
            as_of: parse_as_of(self.as_of.as_deref())?,
            uri: self.uri,
            incremental_from: self.incremental_from,
            revision_history: self.revision_history,
        })
    }
}

impl RestoreRequest {
    fn into_statement(self) -> Result<RestoreStatement, AppError> {
        if self.uris.is_empty() {
            return Err(AppError::BadRequest("uris must not be empty".into()));
        }
        Ok(RestoreStatement {
            targets: parse_targets(&self.targets)?,
            as_of: parse_as_of(self.as_of.as_deref())?,
            uris: self.uris,
            options: RestoreOptions {
                into_db: self.into_db,
                skip_missing_foreign_keys: self.skip_missing_foreign_keys,
            },
        })
    }
}

async fn start_backup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BackupRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let user = request_user(&headers)?;
    let stmt = body.into_statement()?;
    let description = stmt.description();
    let handle = state.service.backup(&user, stmt).await?;
    tracing::info!("Job {} started by {}: {}", handle.job_id, user, description);
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": handle.job_id }))))
}

async fn start_restore(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let user = request_user(&headers)?;
    let stmt = body.into_statement()?;
    let description = stmt.description();
    let handle = state.service.restore(&user, stmt).await?;
    tracing::info!("Job {} started by {}: {}", handle.job_id, user, description);
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": handle.job_id }))))
}

async fn show_backup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ShowQuery>,
) -> Result<Json<Vec<ShowBackupRow>>, AppError> {
    Ok(Json(state.service.show_backup(&query.uri).await?))
}
