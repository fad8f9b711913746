use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Periodically takes over jobs whose lease lapsed, e.g. after a node died.
pub fn start_job_adopter(state: Arc<AppState>, cancel: CancellationToken) {
    let period = Duration::from_secs(state.config.adopt_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match state.service.adopt_orphaned_jobs().await {
                        Ok(adopted) if !adopted.is_empty() => {
                            tracing::info!("Adopted {} orphaned job(s): {:?}", adopted.len(), adopted);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Job adoption pass failed: {}", e),
                    }
                }
            }
        }
        tracing::info!("Job adopter stopped");
    });
}
