//! The running side of a job: progress writes, control checks and the lease
//! heartbeat.

use super::{JobDetails, JobId, JobRecord, JobRegistry, JobStatus, JobUpdate, LeaseOwner};
use crate::events::{EventBroadcaster, JobEvent, JobProgressPayload};
use crate::progress::ChunkProgress;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct JobContext {
    job_id: JobId,
    registry: Arc<dyn JobRegistry>,
    owner: LeaseOwner,
    events: EventBroadcaster,
}

impl JobContext {
    pub fn new(job_id: JobId, registry: Arc<dyn JobRegistry>, owner: LeaseOwner, events: EventBroadcaster) -> Self {
        Self {
            job_id,
            registry,
            owner,
            events,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn owner(&self) -> &LeaseOwner {
        &self.owner
    }

    /// Fails with the control error an operator requested, or `LeaseLost`.
    pub async fn check_control(&self) -> Result<()> {
        let record = self.registry.load(self.job_id).await?;
        record.check_owner(&self.owner, chrono::Utc::now())?;
        control_error(&record)
    }

    /// Persists progress (and optionally new details), then observes control.
    pub async fn report_progress(
        &self,
        progress: &ChunkProgress,
        details: Option<JobDetails>,
    ) -> Result<()> {
        let record = self
            .registry
            .update_owned(
                self.job_id,
                &self.owner,
                JobUpdate {
                    progress: Some(progress.fraction()),
                    details,
                    ..Default::default()
                },
            )
            .await?;
        self.events.broadcast(JobEvent::Progress(JobProgressPayload {
            job_id: self.job_id,
            fraction: progress.fraction(),
            chunks_done: progress.chunks_done,
            chunks_total: progress.chunks_total,
            data_size: progress.counts.data_size,
            rows: progress.counts.rows,
        }));
        control_error(&record)
    }

    /// Moves a pending job to running.
    pub async fn mark_running(&self) -> Result<JobRecord> {
        let record = self.registry.load(self.job_id).await?;
        if record.status != JobStatus::Pending {
            return Ok(record);
        }
        self.registry
            .update_owned(
                self.job_id,
                &self.owner,
                JobUpdate {
                    status: Some(JobStatus::Running),
                    ..Default::default()
                },
            )
            .await
    }

    /// Records a final status.
    pub async fn finish(&self, status: JobStatus, error: Option<String>) -> Result<JobRecord> {
        self.registry
            .update_owned(
                self.job_id,
                &self.owner,
                JobUpdate {
                    progress: (status == JobStatus::Succeeded).then_some(1.0),
                    status: Some(status),
                    error,
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn release(&self) -> Result<()> {
        self.registry.release_lease(self.job_id, &self.owner).await
    }

    /// Renews the lease every third of `ttl` until `stop` fires or the lease is lost.
    pub fn spawn_heartbeat(&self, ttl: Duration, stop: CancellationToken) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let owner = self.owner;
        let job_id = self.job_id;
        let period = (ttl / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        match registry.renew_lease(job_id, &owner, ttl).await {
                            Ok(()) => debug!("Renewed lease for job {}", job_id),
                            Err(e) => {
                                warn!("Stopping heartbeat for job {}: {}", job_id, e);
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

fn control_error(record: &JobRecord) -> Result<()> {
    match record.status {
        JobStatus::Paused => Err(EngineError::JobPaused),
        JobStatus::CancelRequested => Err(EngineError::JobCanceled),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupDetails;
    use crate::jobs::{MemJobRegistry, NewJob};

    async fn setup() -> (JobContext, Arc<MemJobRegistry>) {
        let registry = Arc::new(MemJobRegistry::new());
        let owner = LeaseOwner::new(1);
        let job = registry
            .create(NewJob {
                details: JobDetails::Backup(BackupDetails::default()),
                username: "root".into(),
                description: String::new(),
                descriptor_ids: vec![],
                status: JobStatus::Pending,
                lease: Some(owner.lease(Duration::from_secs(30), chrono::Utc::now())),
            })
            .await
            .unwrap();
        let ctx = JobContext::new(job.id, registry.clone(), owner, EventBroadcaster::new());
        (ctx, registry)
    }

    #[tokio::test]
    async fn test_control_requests_surface_as_errors() {
        let (ctx, registry) = setup().await;
        ctx.mark_running().await.unwrap();
        ctx.check_control().await.unwrap();

        registry
            .set_status(ctx.job_id(), &[JobStatus::Running], JobStatus::Paused)
            .await
            .unwrap();
        let progress = ChunkProgress::new(2, 1);
        let err = ctx.report_progress(&progress, None).await.unwrap_err();
        assert!(matches!(err, EngineError::JobPaused));
        assert!((registry.load(ctx.job_id()).await.unwrap().progress - 0.5).abs() < 1e-9);

        registry
            .set_status(ctx.job_id(), &[JobStatus::Paused], JobStatus::CancelRequested)
            .await
            .unwrap();
        assert!(matches!(ctx.check_control().await, Err(EngineError::JobCanceled)));
        let rec = ctx.finish(JobStatus::Canceled, None).await.unwrap();
        assert_eq!(rec.status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_lost_lease_stops_progress() {
        let (ctx, registry) = setup().await;
        ctx.release().await.unwrap();
        let other = LeaseOwner::new(2);
        registry
            .try_adopt(ctx.job_id(), &other, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let err = ctx.report_progress(&ChunkProgress::new(1, 0), None).await.unwrap_err();
        assert_eq!(err.kind(), "lease_lost");
    }
}
