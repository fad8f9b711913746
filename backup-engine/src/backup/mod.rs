//! BACKUP: statements, job details and the export coordinator.

pub mod chain;
pub mod export;
pub mod manifest;
pub mod show;

use crate::catalog::descriptor::{Descriptor, DescriptorId};
use crate::kv::{Span, Timestamp};
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use export::BackupCoordinator;
pub use manifest::{BackupManifest, ManifestFile};

/// A statement target: `DATABASE d`, `d.*` or `d.t`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Database { name: String },
    AllTables { database: String },
    Table { database: String, table: String },
}

impl Target {
    pub fn database(&self) -> &str {
        match self {
            Target::Database { name } => name,
            Target::AllTables { database } | Target::Table { database, .. } => database,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Database { name } => write!(f, "DATABASE {}", name),
            Target::AllTables { database } => write!(f, "{}.*", database),
            Target::Table { database, table } => write!(f, "{}.{}", database, table),
        }
    }
}

impl FromStr for Target {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || EngineError::Config(format!("invalid target '{}'", s));
        if let Some(name) = s.strip_prefix("DATABASE ").or_else(|| s.strip_prefix("database ")) {
            let name = name.trim();
            if name.is_empty() || name.contains('.') {
                return Err(invalid());
            }
            return Ok(Target::Database { name: name.to_string() });
        }
        let (database, table) = s.split_once('.').ok_or_else(invalid)?;
        if database.is_empty() || table.is_empty() || table.contains('.') {
            return Err(invalid());
        }
        if table == "*" {
            Ok(Target::AllTables {
                database: database.to_string(),
            })
        } else {
            Ok(Target::Table {
                database: database.to_string(),
                table: table.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupStatement {
    pub targets: Vec<Target>,
    pub uri: String,
    /// Prior backups of the chain, oldest first; empty for a full backup.
    #[serde(default)]
    pub incremental_from: Vec<String>,
    #[serde(default)]
    pub as_of: Option<Timestamp>,
    #[serde(default)]
    pub revision_history: bool,
}

impl BackupStatement {
    pub fn description(&self) -> String {
        let targets: Vec<String> = self.targets.iter().map(ToString::to_string).collect();
        let mut out = format!("BACKUP {} TO '{}'", targets.join(", "), self.uri);
        if let Some(as_of) = self.as_of {
            out.push_str(&format!(" AS OF SYSTEM TIME '{}'", as_of));
        }
        if !self.incremental_from.is_empty() {
            let from: Vec<String> = self.incremental_from.iter().map(|u| format!("'{}'", u)).collect();
            out.push_str(&format!(" INCREMENTAL FROM {}", from.join(", ")));
        }
        if self.revision_history {
            out.push_str(" WITH revision_history");
        }
        out
    }
}

/// Everything a node needs to run or resume a backup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupDetails {
    pub backup_id: Uuid,
    pub uri: String,
    #[serde(default)]
    pub incremental_from: Vec<String>,
    pub cluster_id: Uuid,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    #[serde(default)]
    pub revision_history: bool,
    pub spans: Vec<Span>,
    pub descriptors: Vec<Descriptor>,
    #[serde(default)]
    pub complete_dbs: Vec<DescriptorId>,
    /// Spans already written to the destination.
    #[serde(default)]
    pub exported_spans: Vec<Span>,
}
