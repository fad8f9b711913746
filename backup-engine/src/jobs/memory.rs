use super::{JobId, JobRecord, JobRegistry, JobStatus, JobUpdate, LeaseOwner, NewJob};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;

/// Job registry kept in process memory; shared by every service holding it.
#[derive(Default)]
pub struct MemJobRegistry {
    jobs: Mutex<BTreeMap<JobId, JobRecord>>,
}

impl MemJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_job<T>(&self, id: JobId, f: impl FnOnce(&mut JobRecord) -> Result<T>) -> Result<T> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id).ok_or(EngineError::JobNotFound(id))?;
        // Mutate a copy so a failed check leaves the record untouched.
        let mut draft = job.clone();
        let out = f(&mut draft)?;
        *job = draft;
        Ok(out)
    }
}

#[async_trait]
impl JobRegistry for MemJobRegistry {
    async fn create(&self, job: NewJob) -> Result<JobRecord> {
        let mut jobs = self.jobs.lock();
        let id = jobs.keys().next_back().map_or(1, |last| last + 1);
        let record = JobRecord::from_new(id, job, Utc::now());
        jobs.insert(id, record.clone());
        Ok(record)
    }

    async fn load(&self, id: JobId) -> Result<JobRecord> {
        self.jobs
            .lock()
            .get(&id)
            .cloned()
            .ok_or(EngineError::JobNotFound(id))
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .rev()
            .filter(|job| status.map_or(true, |s| job.status == s))
            .cloned()
            .collect())
    }

    async fn update_owned(&self, id: JobId, owner: &LeaseOwner, update: JobUpdate) -> Result<JobRecord> {
        self.with_job(id, |job| {
            let now = Utc::now();
            job.check_owner(owner, now)?;
            job.apply_update(update, now)?;
            Ok(job.clone())
        })
    }

    async fn set_status(&self, id: JobId, from: &[JobStatus], to: JobStatus) -> Result<JobRecord> {
        self.with_job(id, |job| {
            job.apply_status(from, to, Utc::now())?;
            Ok(job.clone())
        })
    }

    async fn try_adopt(&self, id: JobId, owner: &LeaseOwner, ttl: Duration) -> Result<Option<JobRecord>> {
        self.with_job(id, |job| {
            Ok(job.try_adopt(owner, ttl, Utc::now()).then(|| job.clone()))
        })
    }

    async fn renew_lease(&self, id: JobId, owner: &LeaseOwner, ttl: Duration) -> Result<()> {
        self.with_job(id, |job| {
            let now = Utc::now();
            match &job.lease {
                Some(lease) if lease.is_held_by(owner) => {
                    job.lease = Some(owner.lease(ttl, now));
                    Ok(())
                }
                _ => job.check_owner(owner, now),
            }
        })
    }

    async fn release_lease(&self, id: JobId, owner: &LeaseOwner) -> Result<()> {
        self.with_job(id, |job| {
            if job.lease.as_ref().is_some_and(|l| l.is_held_by(owner)) {
                job.lease = None;
            }
            Ok(())
        })
    }
}
