//! Job service: starts BACKUP and RESTORE jobs and runs their lifecycle.
//!
//! Each job runs on its own task while this node holds the job's lease. A
//! pause releases the lease so any node may resume the job later; a cancel
//! runs the job's cleanup before recording the final status.

use super::context::JobContext;
use super::planning::{self, require_admin};
use super::tracker::JobTracker;
use super::{JobDetails, JobId, JobRecord, JobRegistry, JobStatus, LeaseOwner, NewJob};
use crate::backup::chain::resolve_as_of;
use crate::backup::manifest::read_backup;
use crate::backup::show::{show_backup, ShowBackupRow};
use crate::backup::{BackupCoordinator, BackupDetails, BackupStatement};
use crate::catalog::descriptor::DescriptorId;
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::events::{EventBroadcaster, JobEvent};
use crate::kv::{EntryCounts, KvStore};
use crate::restore::{RestoreCoordinator, RestoreDetails, RestoreStatement};
use crate::storage::{ExternalStorage, StorageFactory};
use crate::utils::errors::{EngineError, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Outcome of a job that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub status: JobStatus,
    pub counts: EntryCounts,
}

/// Returned when a statement starts a job.
pub struct JobHandle {
    pub job_id: JobId,
    rx: oneshot::Receiver<Result<JobResult>>,
}

impl JobHandle {
    /// Waits for this run of the job to exit. A paused or canceled job
    /// yields `JobPaused` / `JobCanceled`.
    pub async fn wait(self) -> Result<JobResult> {
        self.rx
            .await
            .map_err(|_| EngineError::Internal(format!("job {} exited without a result", self.job_id)))?
    }
}

struct Inner {
    kv: Arc<dyn KvStore>,
    catalog: Arc<dyn Catalog>,
    storage: Arc<StorageFactory>,
    registry: Arc<dyn JobRegistry>,
    config: EngineConfig,
    owner: LeaseOwner,
    tracker: JobTracker,
    events: EventBroadcaster,
}

#[derive(Clone)]
pub struct JobService {
    inner: Arc<Inner>,
}

impl JobService {
    pub fn new(
        kv: Arc<dyn KvStore>,
        catalog: Arc<dyn Catalog>,
        storage: Arc<StorageFactory>,
        registry: Arc<dyn JobRegistry>,
        config: EngineConfig,
    ) -> Self {
        let owner = LeaseOwner::new(config.node.id);
        Self {
            inner: Arc::new(Inner {
                kv,
                catalog,
                storage,
                registry,
                config,
                owner,
                tracker: JobTracker::new(),
                events: EventBroadcaster::new(),
            }),
        }
    }

    pub fn owner(&self) -> LeaseOwner {
        self.inner.owner
    }

    pub fn registry(&self) -> &Arc<dyn JobRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.inner.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub async fn backup(&self, user: &str, stmt: BackupStatement) -> Result<JobHandle> {
        require_admin(self.inner.catalog.as_ref(), user, "BACKUP")?;
        let details = planning::plan_backup(
            self.inner.kv.as_ref(),
            self.inner.catalog.as_ref(),
            &self.inner.storage,
            &stmt,
        )
        .await?;
        let descriptor_ids = details.descriptors.iter().map(|d| d.id()).collect();
        self.start(user, stmt.description(), descriptor_ids, JobDetails::Backup(details))
            .await
    }

    pub async fn restore(&self, user: &str, stmt: RestoreStatement) -> Result<JobHandle> {
        require_admin(self.inner.catalog.as_ref(), user, "RESTORE")?;
        let details =
            planning::plan_restore_job(self.inner.catalog.as_ref(), &self.inner.storage, user, &stmt).await?;
        let mut descriptor_ids = details.plan.database_ids();
        descriptor_ids.extend(details.plan.table_ids());
        self.start(user, stmt.description(), descriptor_ids, JobDetails::Restore(details))
            .await
    }

    async fn start(
        &self,
        user: &str,
        description: String,
        descriptor_ids: Vec<DescriptorId>,
        details: JobDetails,
    ) -> Result<JobHandle> {
        let lease = self
            .inner
            .owner
            .lease(self.inner.config.lease_ttl(), chrono::Utc::now());
        let record = self
            .inner
            .registry
            .create(NewJob {
                details,
                username: user.to_string(),
                description,
                descriptor_ids,
                status: JobStatus::Pending,
                lease: Some(lease),
            })
            .await?;
        info!("Created job {}: {}", record.id, record.description);

        let (tx, rx) = oneshot::channel();
        let job_id = record.id;
        self.spawn_job(record, Some(tx)).await;
        Ok(JobHandle { job_id, rx })
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobRecord> {
        self.inner.registry.load(job_id).await
    }

    pub async fn jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        self.inner.registry.list(status).await
    }

    pub async fn pause(&self, job_id: JobId) -> Result<JobRecord> {
        let record = self
            .inner
            .registry
            .set_status(job_id, &[JobStatus::Pending, JobStatus::Running], JobStatus::Paused)
            .await?;
        info!("Pause requested for job {}", job_id);
        Ok(record)
    }

    /// Marks a paused job running and adopts it here unless it is still
    /// winding down locally.
    pub async fn resume(&self, job_id: JobId) -> Result<JobRecord> {
        let record = self
            .inner
            .registry
            .set_status(job_id, &[JobStatus::Paused], JobStatus::Running)
            .await?;
        info!("Resuming job {}", job_id);
        if !self.inner.tracker.is_running(job_id).await {
            self.adopt(job_id).await?;
        }
        Ok(record)
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord> {
        let record = self
            .inner
            .registry
            .set_status(
                job_id,
                &[JobStatus::Pending, JobStatus::Running, JobStatus::Paused],
                JobStatus::CancelRequested,
            )
            .await?;
        info!("Cancel requested for job {}", job_id);
        // Nobody may be running it (paused, or its node died); clean up here.
        if !self.inner.tracker.is_running(job_id).await {
            self.adopt(job_id).await?;
        }
        Ok(record)
    }

    /// Adopts every adoptable job whose lease is absent or expired.
    pub async fn adopt_orphaned_jobs(&self) -> Result<Vec<JobId>> {
        let now = chrono::Utc::now();
        let mut adopted = Vec::new();
        for record in self.inner.registry.list(None).await? {
            if !record.status.is_adoptable() {
                continue;
            }
            let orphaned = match &record.lease {
                None => true,
                Some(lease) => lease.is_expired(now),
            };
            if orphaned && !self.inner.tracker.is_running(record.id).await && self.adopt(record.id).await? {
                adopted.push(record.id);
            }
        }
        if !adopted.is_empty() {
            info!("Adopted {} orphaned job(s): {:?}", adopted.len(), adopted);
        }
        Ok(adopted)
    }

    /// Waits until this node is no longer running `job_id`.
    pub async fn wait_for_exit(&self, job_id: JobId) {
        self.inner.tracker.wait(job_id).await
    }

    pub async fn running_jobs(&self) -> usize {
        self.inner.tracker.running_count().await
    }

    pub async fn show_backup(&self, uri: &str) -> Result<Vec<ShowBackupRow>> {
        let storage = self.inner.storage.open(uri)?;
        let manifest = read_backup(storage.as_ref()).await?;
        Ok(show_backup(&manifest))
    }

    async fn adopt(&self, job_id: JobId) -> Result<bool> {
        let adopted = self
            .inner
            .registry
            .try_adopt(job_id, &self.inner.owner, self.inner.config.lease_ttl())
            .await?;
        match adopted {
            Some(record) => Ok(self.spawn_job(record, None).await),
            None => Ok(false),
        }
    }

    async fn spawn_job(&self, record: JobRecord, reply: Option<oneshot::Sender<Result<JobResult>>>) -> bool {
        let job_id = record.id;
        let Some(exit_guard) = self.inner.tracker.register(job_id).await else {
            warn!("Job {} is already running on this node", job_id);
            return false;
        };
        let service = self.clone();
        tokio::spawn(async move {
            let result = service.execute(record).await;
            service.inner.tracker.complete(job_id).await;
            drop(exit_guard);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        });
        true
    }

    async fn execute(&self, record: JobRecord) -> Result<JobResult> {
        let ctx = JobContext::new(
            record.id,
            self.inner.registry.clone(),
            self.inner.owner,
            self.inner.events.clone(),
        );
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = ctx.spawn_heartbeat(self.inner.config.lease_ttl(), stop_heartbeat.clone());

        let outcome = self.run(&ctx, &record).await;
        let result = self.settle(&ctx, &record, outcome).await;

        stop_heartbeat.cancel();
        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task for job {} panicked: {}", record.id, e);
        }
        result
    }

    async fn run(&self, ctx: &JobContext, record: &JobRecord) -> Result<EntryCounts> {
        ctx.check_control().await?;
        ctx.mark_running().await?;
        info!("Running {} job {}: {}", record.details.kind(), record.id, record.description);
        self.inner.events.broadcast(JobEvent::Started {
            job_id: record.id,
            kind: record.details.kind().to_string(),
            description: record.description.clone(),
        });

        match &record.details {
            JobDetails::Backup(details) => {
                let manifest = self.backup_coordinator(details)?.run(ctx, details).await?;
                Ok(manifest.entry_counts)
            }
            JobDetails::Restore(details) => {
                let chain = planning::load_chain(&self.inner.storage, &details.uris).await?;
                let chain = resolve_as_of(&chain, details.as_of)?;
                self.restore_coordinator(details)?.run(ctx, details, chain).await
            }
        }
    }

    /// Records how the run ended and reports it to subscribers.
    async fn settle(&self, ctx: &JobContext, record: &JobRecord, outcome: Result<EntryCounts>) -> Result<JobResult> {
        let job_id = record.id;
        let (status, counts, failure) = match outcome {
            Ok(counts) => (JobStatus::Succeeded, counts, None),
            Err(EngineError::JobPaused) => {
                if let Err(e) = ctx.release().await {
                    warn!("Could not release lease of paused job {}: {}", job_id, e);
                }
                info!("Job {} paused", job_id);
                self.inner.events.broadcast(JobEvent::Paused { job_id });
                return Err(EngineError::JobPaused);
            }
            Err(e @ EngineError::LeaseLost { .. }) => {
                warn!("Job {} stopped: {}", job_id, e);
                return Err(e);
            }
            Err(EngineError::JobCanceled) => {
                self.cleanup(record, true).await;
                (JobStatus::Canceled, EntryCounts::default(), Some(EngineError::JobCanceled))
            }
            Err(e) => {
                error!("Job {} failed: {}", job_id, e);
                self.cleanup(record, false).await;
                (JobStatus::Failed, EntryCounts::default(), Some(e))
            }
        };

        let message = match (&failure, status) {
            (Some(e), JobStatus::Failed) => Some(e.to_string()),
            _ => None,
        };
        ctx.finish(status, message.clone()).await?;
        if let Some(event) = JobEvent::for_exit(job_id, status, counts, message) {
            self.inner.events.broadcast(event);
        }
        info!("Job {} {}", job_id, status);
        match failure {
            Some(e) => Err(e),
            None => Ok(JobResult { job_id, status, counts }),
        }
    }

    /// Canceled backups remove what they wrote; failed ones keep their
    /// checkpoint. Restores always drop what they created.
    async fn cleanup(&self, record: &JobRecord, canceled: bool) {
        let result = match &record.details {
            JobDetails::Backup(details) if canceled => match self.backup_coordinator(details) {
                Ok(coordinator) => coordinator.cleanup().await,
                Err(e) => Err(e),
            },
            JobDetails::Backup(_) => Ok(()),
            JobDetails::Restore(details) => self.restore_cleaner().cleanup(details),
        };
        match result {
            Ok(()) => info!("Cleaned up after job {}", record.id),
            Err(e) => warn!("Cleanup after job {} failed: {}", record.id, e),
        }
    }

    fn backup_coordinator(&self, details: &BackupDetails) -> Result<BackupCoordinator> {
        Ok(BackupCoordinator::new(
            self.inner.kv.clone(),
            self.inner.storage.open(&details.uri)?,
            self.inner.config.export.clone(),
            self.inner.config.retry.clone(),
        ))
    }

    fn restore_coordinator(&self, details: &RestoreDetails) -> Result<RestoreCoordinator> {
        let storages = details
            .uris
            .iter()
            .map(|uri| self.inner.storage.open(uri))
            .collect::<Result<Vec<Arc<dyn ExternalStorage>>>>()?;
        Ok(RestoreCoordinator::new(
            self.inner.kv.clone(),
            self.inner.catalog.clone(),
            storages,
            self.inner.config.import.clone(),
            self.inner.config.retry.clone(),
        ))
    }

    /// Cleanup only touches the catalog, so it needs no storage handles.
    fn restore_cleaner(&self) -> RestoreCoordinator {
        RestoreCoordinator::new(
            self.inner.kv.clone(),
            self.inner.catalog.clone(),
            Vec::new(),
            self.inner.config.import.clone(),
            self.inner.config.retry.clone(),
        )
    }
}
