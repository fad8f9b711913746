//! Backup Engine Library
//!
//! Consistent, resumable BACKUP and RESTORE jobs over a transactional
//! key-value store: export of key spans to external storage, chains of
//! incremental backups, and restore into a live catalog.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod events;
pub mod jobs;
pub mod kv;
pub mod progress;
pub mod restore;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::EngineConfig;
pub use jobs::{JobHandle, JobResult, JobService};
pub use utils::errors::{EngineError, Result};
