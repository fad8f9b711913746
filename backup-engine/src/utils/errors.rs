//! Error taxonomy for the backup engine.
//!
//! Every rejection a caller may want to branch on has its own variant; the
//! display strings are stable and surface verbatim in job records.

use crate::kv::Timestamp;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // ── chain validation ──
    #[error("no backup covers time [{start},{end}) for {detail}")]
    NoBackupCoversTime {
        start: Timestamp,
        end: Timestamp,
        detail: String,
    },

    #[error("backups listed out of order: backup starting at {next_start} follows backup ending at {previous_end}")]
    BackupsOutOfOrder {
        previous_end: Timestamp,
        next_start: Timestamp,
    },

    #[error("incompatible RESTORE timestamp {0}: the backup covering it does not include revision history")]
    IncompatibleRestoreTimestamp(Timestamp),

    #[error("table \"{table}\" is not covered by the backup chain: {detail}")]
    TableCoverage { table: String, detail: String },

    #[error("backups in the chain were taken from different clusters ({expected} and {found})")]
    ChainClusterMismatch { expected: String, found: String },

    // ── target resolution ──
    #[error("table \"{0}\" does not exist")]
    TableNotFound(String),

    #[error("database \"{0}\" does not exist")]
    DatabaseNotFound(String),

    #[error("cannot RESTORE DATABASE from a backup of individual tables (database \"{0}\")")]
    DatabaseFromTableBackup(String),

    #[error("cannot RESTORE {0}.* from a backup of individual tables")]
    WildcardFromTableBackup(String),

    #[error("database \"{0}\" already exists")]
    DatabaseExists(String),

    #[error("relation \"{0}\" already exists")]
    TableExists(String),

    #[error("a database named \"{0}\" needs to exist to RESTORE into it")]
    DatabaseMissing(String),

    #[error("cannot use \"into_db\" with RESTORE DATABASE")]
    IntoDbWithDatabase,

    // ── dependency resolution ──
    #[error("cannot restore table \"{table}\" without interleave parent \"{parent}\"")]
    WithoutInterleaveParent { table: String, parent: String },

    #[error("cannot restore table \"{table}\" without interleave child \"{child}\"")]
    WithoutInterleaveChild { table: String, child: String },

    #[error("cannot restore table \"{table}\" without referenced table \"{referenced}\" (or \"skip_missing_foreign_keys\" option)")]
    MissingForeignKeyTarget { table: String, referenced: String },

    #[error("cannot restore table \"{table}\" without referencing table \"{origin}\" (or \"skip_missing_foreign_keys\" option)")]
    MissingForeignKeyOrigin { table: String, origin: String },

    #[error("cannot restore \"{view}\" without restoring referenced table \"{referenced}\"")]
    ViewMissingDependency { view: String, referenced: String },

    // ── integrity ──
    #[error("checksum mismatch for {path}: manifest records {expected:08x}, file has {actual:08x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("{0}: no such file")]
    FileNotFound(String),

    #[error("corrupt data file: {0}")]
    Corruption(String),

    #[error("foreign key violation on \"{table}\": {detail}")]
    ForeignKeyViolation { table: String, detail: String },

    #[error("invalid row for table \"{table}\": {detail}")]
    InvalidRow { table: String, detail: String },

    #[error("catalog error: {0}")]
    Catalog(String),

    // ── backup preconditions ──
    #[error("{0} already contains a BACKUP file")]
    DestinationExists(String),

    #[error("previous backups do not contain table \"{0}\": a new full backup may be required")]
    NewFullBackupRequired(String),

    #[error("cannot specify timestamp {requested} in the future (now {now})")]
    TimestampInFuture { requested: Timestamp, now: Timestamp },

    #[error("incremental backup end time {end} must be after the previous backup's end time {previous}")]
    IncrementalNotAfter { end: Timestamp, previous: Timestamp },

    #[error("backup manifest error: {0}")]
    Manifest(String),

    // ── job control ──
    #[error("job paused")]
    JobPaused,

    #[error("job canceled")]
    JobCanceled,

    #[error("job {job_id} lease is no longer held by this node: {detail}")]
    LeaseLost { job_id: i64, detail: String },

    #[error("job {job_id} cannot transition from {from} to {to}")]
    InvalidStatusTransition {
        job_id: i64,
        from: String,
        to: String,
    },

    #[error("job {0} not found")]
    JobNotFound(i64),

    #[error("job registry error: {0}")]
    JobRegistry(String),

    // ── permissions ──
    #[error("{0}")]
    PermissionDenied(String),

    // ── storage ──
    #[error("local file access to paths outside of external-io-dir is not allowed: {0}")]
    PathOutsideRoot(String),

    #[error("unsupported storage URI: {0}")]
    UnsupportedStorage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── transient ──
    #[error("transient error: {0}")]
    Transient(String),

    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors worth retrying at the chunk level.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }

    /// Operator-issued interruptions; not failures of the job itself.
    pub fn is_control(&self) -> bool {
        matches!(self, EngineError::JobPaused | EngineError::JobCanceled)
    }

    /// Stable tag for API responses and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NoBackupCoversTime { .. } => "no_backup_covers_time",
            EngineError::BackupsOutOfOrder { .. } => "backups_out_of_order",
            EngineError::IncompatibleRestoreTimestamp(_) => "incompatible_restore_timestamp",
            EngineError::TableCoverage { .. } => "table_coverage",
            EngineError::ChainClusterMismatch { .. } => "chain_cluster_mismatch",
            EngineError::TableNotFound(_) => "table_not_found",
            EngineError::DatabaseNotFound(_) => "database_not_found",
            EngineError::DatabaseFromTableBackup(_) => "database_from_table_backup",
            EngineError::WildcardFromTableBackup(_) => "wildcard_from_table_backup",
            EngineError::DatabaseExists(_) => "database_exists",
            EngineError::TableExists(_) => "table_exists",
            EngineError::DatabaseMissing(_) => "database_missing",
            EngineError::IntoDbWithDatabase => "into_db_with_database",
            EngineError::WithoutInterleaveParent { .. } => "without_interleave_parent",
            EngineError::WithoutInterleaveChild { .. } => "without_interleave_child",
            EngineError::MissingForeignKeyTarget { .. } => "missing_foreign_key_target",
            EngineError::MissingForeignKeyOrigin { .. } => "missing_foreign_key_origin",
            EngineError::ViewMissingDependency { .. } => "view_missing_dependency",
            EngineError::ChecksumMismatch { .. } => "checksum_mismatch",
            EngineError::FileNotFound(_) => "file_not_found",
            EngineError::Corruption(_) => "corruption",
            EngineError::ForeignKeyViolation { .. } => "foreign_key_violation",
            EngineError::InvalidRow { .. } => "invalid_row",
            EngineError::Catalog(_) => "catalog",
            EngineError::DestinationExists(_) => "destination_exists",
            EngineError::NewFullBackupRequired(_) => "new_full_backup_required",
            EngineError::TimestampInFuture { .. } => "timestamp_in_future",
            EngineError::IncrementalNotAfter { .. } => "incremental_not_after",
            EngineError::Manifest(_) => "manifest",
            EngineError::JobPaused => "job_paused",
            EngineError::JobCanceled => "job_canceled",
            EngineError::LeaseLost { .. } => "lease_lost",
            EngineError::InvalidStatusTransition { .. } => "invalid_status_transition",
            EngineError::JobNotFound(_) => "job_not_found",
            EngineError::JobRegistry(_) => "job_registry",
            EngineError::PermissionDenied(_) => "permission_denied",
            EngineError::PathOutsideRoot(_) => "path_outside_root",
            EngineError::UnsupportedStorage(_) => "unsupported_storage",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "serialization",
            EngineError::Compression(_) => "compression",
            EngineError::Config(_) => "config",
            EngineError::Transient(_) => "transient",
            EngineError::RetriesExhausted { .. } => "retries_exhausted",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
