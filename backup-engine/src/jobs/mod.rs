//! Durable, resumable jobs.
//!
//! A job record is the only state shared between the node running a job and
//! the operators controlling it. The running node holds a lease on the record
//! and may only write progress while the lease is current; operators flip the
//! status, and the running node observes the change at its next chunk
//! boundary.

pub mod context;
pub mod memory;
pub mod planning;
pub mod service;
pub mod tracker;

use crate::backup::BackupDetails;
use crate::catalog::descriptor::DescriptorId;
use crate::restore::RestoreDetails;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub use context::JobContext;
pub use memory::MemJobRegistry;
pub use service::{JobHandle, JobResult, JobService};

pub type JobId = i64;

const MAX_LEASE_MS: u128 = 365 * 24 * 3600 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    CancelRequested,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::CancelRequested,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::CancelRequested => "cancel-requested",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled)
    }

    /// Statuses a node may pick up and run.
    pub fn is_adoptable(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::CancelRequested
        )
    }

    /// Transitions written by the node that holds the lease.
    ///
    /// A job whose work completed may still record success after a late
    /// pause or cancel request.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Paused, Succeeded)
                | (CancelRequested, Succeeded)
                | (CancelRequested, Canceled)
                | (CancelRequested, Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::JobRegistry(format!("unknown job status '{}'", s)))
    }
}

/// Identity of one engine instance on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOwner {
    pub node_id: u32,
    pub instance_id: Uuid,
}

impl LeaseOwner {
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn lease(&self, ttl: Duration, now: DateTime<Utc>) -> Lease {
        Lease {
            node_id: self.node_id,
            instance_id: self.instance_id,
            expires_at: now + chrono::Duration::milliseconds(ttl.as_millis().min(MAX_LEASE_MS) as i64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub node_id: u32,
    pub instance_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_held_by(&self, owner: &LeaseOwner) -> bool {
        self.node_id == owner.node_id && self.instance_id == owner.instance_id
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobDetails {
    Backup(BackupDetails),
    Restore(RestoreDetails),
}

impl JobDetails {
    pub fn kind(&self) -> &'static str {
        match self {
            JobDetails::Backup(_) => "backup",
            JobDetails::Restore(_) => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// Fraction of work completed, in `[0, 1]`.
    pub progress: f64,
    pub details: JobDetails,
    pub lease: Option<Lease>,
    pub error: Option<String>,
    pub username: String,
    pub description: String,
    pub descriptor_ids: Vec<DescriptorId>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn from_new(id: JobId, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: job.status,
            progress: 0.0,
            details: job.details,
            lease: job.lease,
            error: None,
            username: job.username,
            description: job.description,
            descriptor_ids: job.descriptor_ids,
            created_at: now,
            modified_at: now,
        }
    }

    /// The lease must be current and held by `owner`.
    pub fn check_owner(&self, owner: &LeaseOwner, now: DateTime<Utc>) -> Result<()> {
        match &self.lease {
            Some(lease) if lease.is_held_by(owner) && !lease.is_expired(now) => Ok(()),
            Some(lease) if lease.is_held_by(owner) => Err(EngineError::LeaseLost {
                job_id: self.id,
                detail: format!("lease expired at {}", lease.expires_at),
            }),
            Some(lease) => Err(EngineError::LeaseLost {
                job_id: self.id,
                detail: format!("lease held by node {}", lease.node_id),
            }),
            None => Err(EngineError::LeaseLost {
                job_id: self.id,
                detail: "no lease".into(),
            }),
        }
    }

    /// Applies an owner's update after ownership was checked.
    pub fn apply_update(&mut self, update: JobUpdate, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition(update.status.unwrap_or(self.status)));
        }
        if let Some(to) = update.status {
            if to != self.status && !self.status.can_transition_to(to) {
                return Err(self.invalid_transition(to));
            }
            self.status = to;
            if to.is_terminal() {
                self.lease = None;
            }
        }
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(details) = update.details {
            self.details = details;
        }
        if let Some(error) = update.error {
            self.error = Some(error);
        }
        self.modified_at = now;
        Ok(())
    }

    /// Operator transition from one of `from` to `to`.
    pub fn apply_status(&mut self, from: &[JobStatus], to: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !from.contains(&self.status) {
            return Err(self.invalid_transition(to));
        }
        self.status = to;
        self.modified_at = now;
        Ok(())
    }

    /// Takes the lease when it is absent, expired or already ours.
    pub fn try_adopt(&mut self, owner: &LeaseOwner, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !self.status.is_adoptable() {
            return false;
        }
        let free = match &self.lease {
            None => true,
            Some(lease) => lease.is_held_by(owner) || lease.is_expired(now),
        };
        if free {
            self.lease = Some(owner.lease(ttl, now));
            self.modified_at = now;
        }
        free
    }

    fn invalid_transition(&self, to: JobStatus) -> EngineError {
        EngineError::InvalidStatusTransition {
            job_id: self.id,
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub details: JobDetails,
    pub username: String,
    pub description: String,
    pub descriptor_ids: Vec<DescriptorId>,
    pub status: JobStatus,
    pub lease: Option<Lease>,
}

#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub progress: Option<f64>,
    pub details: Option<JobDetails>,
    pub status: Option<JobStatus>,
    pub error: Option<String>,
}

/// Durable job table with check-and-set updates.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn create(&self, job: NewJob) -> Result<JobRecord>;

    async fn load(&self, id: JobId) -> Result<JobRecord>;

    /// Jobs newest first, optionally filtered by status.
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>>;

    /// Writes progress or a final status; requires the caller's current lease.
    async fn update_owned(&self, id: JobId, owner: &LeaseOwner, update: JobUpdate) -> Result<JobRecord>;

    /// Operator transition; fails unless the current status is in `from`.
    async fn set_status(&self, id: JobId, from: &[JobStatus], to: JobStatus) -> Result<JobRecord>;

    /// Takes over an adoptable job whose lease is absent, expired or ours.
    async fn try_adopt(&self, id: JobId, owner: &LeaseOwner, ttl: Duration) -> Result<Option<JobRecord>>;

    async fn renew_lease(&self, id: JobId, owner: &LeaseOwner, ttl: Duration) -> Result<()>;

    /// Gives up the lease so another node may adopt the job.
    async fn release_lease(&self, id: JobId, owner: &LeaseOwner) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupDetails;

    fn record() -> JobRecord {
        let owner = LeaseOwner::new(1);
        let now = Utc::now();
        JobRecord::from_new(
            7,
            NewJob {
                details: JobDetails::Backup(BackupDetails::default()),
                username: "root".into(),
                description: "BACKUP".into(),
                descriptor_ids: vec![],
                status: JobStatus::Running,
                lease: Some(owner.lease(Duration::from_secs(30), now)),
            },
            now,
        )
    }

    #[test]
    fn test_status_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&JobStatus::CancelRequested).unwrap(),
            "\"cancel-requested\""
        );
    }

    #[test]
    fn test_restore_details_survive_json() {
        use crate::kv::{Key, Timestamp};
        use crate::restore::rewrite::TableRewrite;
        use crate::restore::RestoreDetails;

        let mut details = RestoreDetails {
            uris: vec!["nodelocal:///full".into()],
            end_time: Timestamp::new(9, 1),
            low_water_mark: Some(Key::new(vec![0xbd, 0x89])),
            ..Default::default()
        };
        details.plan.rewrites.insert(
            51,
            TableRewrite {
                table_id: 70,
                parent_id: 69,
            },
        );
        details.plan.rewrites.insert(
            52,
            TableRewrite {
                table_id: 71,
                parent_id: 69,
            },
        );
        let job = JobDetails::Restore(details);

        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"kind\":\"restore\""));
        let back: JobDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        match back {
            JobDetails::Restore(d) => assert_eq!(d.plan.rewrites.new_id(52), Some(71)),
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_check_owner() {
        let mut rec = record();
        let owner = LeaseOwner {
            node_id: 1,
            instance_id: rec.lease.as_ref().unwrap().instance_id,
        };
        rec.check_owner(&owner, Utc::now()).unwrap();
        assert_eq!(
            rec.check_owner(&LeaseOwner::new(2), Utc::now()).unwrap_err().kind(),
            "lease_lost"
        );
        let later = Utc::now() + chrono::Duration::seconds(60);
        assert!(rec.check_owner(&owner, later).is_err());
        assert!(rec.try_adopt(&LeaseOwner::new(2), Duration::from_secs(30), later));
        assert!(rec.check_owner(&owner, Utc::now()).is_err());
    }

    #[test]
    fn test_terminal_records_reject_updates() {
        let mut rec = record();
        rec.apply_update(
            JobUpdate {
                status: Some(JobStatus::Succeeded),
                progress: Some(1.0),
                ..Default::default()
            },
            Utc::now(),
        )
        .unwrap();
        assert!(rec.lease.is_none());
        let err = rec
            .apply_update(
                JobUpdate {
                    progress: Some(0.5),
                    ..Default::default()
                },
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_status_transition");
    }

    #[test]
    fn test_operator_transitions() {
        let mut rec = record();
        rec.apply_status(&[JobStatus::Running], JobStatus::Paused, Utc::now())
            .unwrap();
        assert!(rec
            .apply_status(&[JobStatus::Running], JobStatus::Paused, Utc::now())
            .is_err());
        assert!(!rec.try_adopt(&LeaseOwner::new(3), Duration::from_secs(1), Utc::now()));
    }
}
