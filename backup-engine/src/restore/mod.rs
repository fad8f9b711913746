//! RESTORE: statements, job details and the import coordinator.

pub mod deps;
pub mod import;
pub mod rewrite;
pub mod spans;
pub mod validate;

use crate::backup::Target;
use crate::kv::{Key, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use deps::{plan_restore, RestoreOptions, RestorePlan};
pub use import::RestoreCoordinator;
pub use rewrite::RewriteMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreStatement {
    pub targets: Vec<Target>,
    /// The backup chain, full backup first.
    pub uris: Vec<String>,
    #[serde(default)]
    pub as_of: Option<Timestamp>,
    #[serde(default)]
    pub options: RestoreOptions,
}

impl RestoreStatement {
    pub fn description(&self) -> String {
        let targets: Vec<String> = self.targets.iter().map(ToString::to_string).collect();
        let uris: Vec<String> = self.uris.iter().map(|u| format!("'{}'", u)).collect();
        let mut out = format!("RESTORE {} FROM {}", targets.join(", "), uris.join(", "));
        if let Some(as_of) = self.as_of {
            out.push_str(&format!(" AS OF SYSTEM TIME '{}'", as_of));
        }
        let mut opts = Vec::new();
        if let Some(db) = &self.options.into_db {
            opts.push(format!("into_db = '{}'", db));
        }
        if self.options.skip_missing_foreign_keys {
            opts.push("skip_missing_foreign_keys".to_string());
        }
        if !opts.is_empty() {
            out.push_str(&format!(" WITH {}", opts.join(", ")));
        }
        out
    }
}

/// Everything a node needs to run or resume a restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreDetails {
    pub uris: Vec<String>,
    #[serde(default)]
    pub as_of: Option<Timestamp>,
    /// Time the restored data reflects.
    pub end_time: Timestamp,
    /// Cluster the chain was taken from, fixed at planning.
    pub cluster_id: Uuid,
    pub plan: RestorePlan,
    /// Everything below this key has been imported.
    #[serde(default)]
    pub low_water_mark: Option<Key>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description() {
        let stmt = RestoreStatement {
            targets: vec!["data.bank".parse().unwrap()],
            uris: vec!["nodelocal:///full".into(), "nodelocal:///inc".into()],
            as_of: Some(Timestamp::new(5, 1)),
            options: RestoreOptions {
                into_db: Some("restored".into()),
                skip_missing_foreign_keys: true,
            },
        };
        assert_eq!(
            stmt.description(),
            "RESTORE data.bank FROM 'nodelocal:///full', 'nodelocal:///inc' AS OF SYSTEM TIME '5.0000000001' WITH into_db = 'restored', skip_missing_foreign_keys"
        );
    }
}
