//! The `jobs` table as a [`JobRegistry`].
//!
//! Every check-and-set runs inside an immediate transaction, so two nodes
//! racing for the same record serialize on the SQLite write lock.

use crate::db::connection::DbPool;
use async_trait::async_trait;
use backup_engine::jobs::{
    JobDetails, JobId, JobRecord, JobRegistry, JobStatus, JobUpdate, Lease, LeaseOwner, NewJob,
};
use backup_engine::{EngineError, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use uuid::Uuid;

fn db_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::JobRegistry(e.to_string())
}

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn row_to_record(row: &Row) -> rusqlite::Result<JobRecord> {
    let status: String = row.get("status")?;
    let details: String = row.get("details")?;
    let descriptor_ids: String = row.get("descriptor_ids")?;
    let created_at: String = row.get("created_at")?;
    let modified_at: String = row.get("modified_at")?;

    let lease_node: Option<u32> = row.get("lease_node_id")?;
    let lease_instance: Option<String> = row.get("lease_instance_id")?;
    let lease_expires: Option<String> = row.get("lease_expires_at")?;
    let lease = match (lease_node, lease_instance, lease_expires) {
        (Some(node_id), Some(instance), Some(expires)) => Some(Lease {
            node_id,
            instance_id: Uuid::parse_str(&instance).map_err(|e| conversion_err(6, e))?,
            expires_at: parse_time(7, &expires)?,
        }),
        _ => None,
    };

    Ok(JobRecord {
        id: row.get("id")?,
        status: status.parse::<JobStatus>().map_err(|e| conversion_err(2, e))?,
        progress: row.get("progress")?,
        details: serde_json::from_str::<JobDetails>(&details).map_err(|e| conversion_err(4, e))?,
        lease,
        error: row.get("error")?,
        username: row.get("username")?,
        description: row.get("description")?,
        descriptor_ids: serde_json::from_str(&descriptor_ids).map_err(|e| conversion_err(11, e))?,
        created_at: parse_time(12, &created_at)?,
        modified_at: parse_time(13, &modified_at)?,
    })
}

fn find(conn: &Connection, id: JobId) -> Result<Option<JobRecord>> {
    conn.query_row("SELECT * FROM jobs WHERE id = ?", params![id], row_to_record)
        .optional()
        .map_err(db_err)
}

fn save(conn: &Connection, job: &JobRecord) -> Result<()> {
    let details = serde_json::to_string(&job.details)?;
    let (node_id, instance_id, expires_at) = match &job.lease {
        Some(lease) => (
            Some(lease.node_id),
            Some(lease.instance_id.to_string()),
            Some(lease.expires_at.to_rfc3339()),
        ),
        None => (None, None, None),
    };
    conn.execute(
        "UPDATE jobs SET status = ?1, progress = ?2, details = ?3, lease_node_id = ?4,
                lease_instance_id = ?5, lease_expires_at = ?6, error = ?7, modified_at = ?8
         WHERE id = ?9",
        params![
            job.status.as_str(),
            job.progress,
            details,
            node_id,
            instance_id,
            expires_at,
            job.error,
            job.modified_at.to_rfc3339(),
            job.id,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

pub struct SqliteJobRegistry {
    pool: DbPool,
}

impl SqliteJobRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(db_err)?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| EngineError::Internal(e.to_string()))?
    }

    /// Loads, mutates and writes back one record under the write lock. A
    /// failing `f` rolls the transaction back.
    async fn with_job<T, F>(&self, id: JobId, f: F) -> Result<T>
    where
        F: FnOnce(&mut JobRecord) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let mut job = find(&tx, id)?.ok_or(EngineError::JobNotFound(id))?;
            let out = f(&mut job)?;
            save(&tx, &job)?;
            tx.commit().map_err(db_err)?;
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl JobRegistry for SqliteJobRegistry {
    async fn create(&self, job: NewJob) -> Result<JobRecord> {
        self.blocking(move |conn| {
            let now = Utc::now();
            let details = serde_json::to_string(&job.details)?;
            let descriptor_ids = serde_json::to_string(&job.descriptor_ids)?;
            let (node_id, instance_id, expires_at) = match &job.lease {
                Some(lease) => (
                    Some(lease.node_id),
                    Some(lease.instance_id.to_string()),
                    Some(lease.expires_at.to_rfc3339()),
                ),
                None => (None, None, None),
            };
            conn.execute(
                "INSERT INTO jobs (kind, status, progress, details, lease_node_id, lease_instance_id,
                                   lease_expires_at, username, description, descriptor_ids,
                                   created_at, modified_at)
                 VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
                params![
                    job.details.kind(),
                    job.status.as_str(),
                    details,
                    node_id,
                    instance_id,
                    expires_at,
                    job.username,
                    job.description,
                    descriptor_ids,
                    now.to_rfc3339(),
                ],
            )
            .map_err(db_err)?;
            let id = conn.last_insert_rowid();
            // Reread so the returned record carries the stored time precision.
            find(conn, id)?.ok_or(EngineError::JobNotFound(id))
        })
        .await
    }

    async fn load(&self, id: JobId) -> Result<JobRecord> {
        self.blocking(move |conn| find(conn, id)?.ok_or(EngineError::JobNotFound(id)))
            .await
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        self.blocking(move |conn| {
            let rows = match status {
                Some(status) => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM jobs WHERE status = ? ORDER BY id DESC")
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map(params![status.as_str()], row_to_record)
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>();
                    rows
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT * FROM jobs ORDER BY id DESC")
                        .map_err(db_err)?;
                    let rows = stmt
                        .query_map([], row_to_record)
                        .map_err(db_err)?
                        .collect::<rusqlite::Result<Vec<_>>>();
                    rows
                }
            };
            rows.map_err(db_err)
        })
        .await
    }

    async fn update_owned(&self, id: JobId, owner: &LeaseOwner, update: JobUpdate) -> Result<JobRecord> {
        let owner = *owner;
        self.with_job(id, move |job| {
            let now = Utc::now();
            job.check_owner(&owner, now)?;
            job.apply_update(update, now)?;
            Ok(job.clone())
        })
        .await
    }

    async fn set_status(&self, id: JobId, from: &[JobStatus], to: JobStatus) -> Result<JobRecord> {
        let from = from.to_vec();
        self.with_job(id, move |job| {
            job.apply_status(&from, to, Utc::now())?;
            Ok(job.clone())
        })
        .await
    }

    async fn try_adopt(&self, id: JobId, owner: &LeaseOwner, ttl: Duration) -> Result<Option<JobRecord>> {
        let owner = *owner;
        self.with_job(id, move |job| {
            Ok(job.try_adopt(&owner, ttl, Utc::now()).then(|| job.clone()))
        })
        .await
    }

    async fn renew_lease(&self, id: JobId, owner: &LeaseOwner, ttl: Duration) -> Result<()> {
        let owner = *owner;
        self.with_job(id, move |job| {
            let now = Utc::now();
            match &job.lease {
                Some(lease) if lease.is_held_by(&owner) => {
                    job.lease = Some(owner.lease(ttl, now));
                    Ok(())
                }
                _ => job.check_owner(&owner, now),
            }
        })
        .await
    }

    async fn release_lease(&self, id: JobId, owner: &LeaseOwner) -> Result<()> {
        let owner = *owner;
        self.with_job(id, move |job| {
            if job.lease.as_ref().is_some_and(|l| l.is_held_by(&owner)) {
                job.lease = None;
            }
            Ok(())
        })
        .await
    }
}
