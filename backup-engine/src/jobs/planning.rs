//! Statement planning: everything that can fail before a job record exists.

use crate::backup::chain::{check_incremental, check_table_coverage, resolve_as_of, validate_chain};
use crate::backup::manifest::{read_backup, BACKUP_MANIFEST_NAME};
use crate::backup::{BackupDetails, BackupManifest, BackupStatement, Target};
use crate::catalog::descriptor::{Descriptor, DescriptorId, TableDescriptor};
use crate::catalog::Catalog;
use crate::kv::{KvStore, Span};
use crate::restore::{plan_restore, RestoreDetails, RestoreStatement};
use crate::storage::StorageFactory;
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;
use uuid::Uuid;

pub fn require_admin(catalog: &dyn Catalog, user: &str, statement: &str) -> Result<()> {
    if catalog.is_admin(user) {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(format!(
            "only root is allowed to {}",
            statement
        )))
    }
}

/// Reads the completed manifest at every URI, in order.
pub async fn load_chain(storage: &StorageFactory, uris: &[String]) -> Result<Vec<BackupManifest>> {
    let mut manifests = Vec::with_capacity(uris.len());
    for uri in uris {
        let handle = storage.open(uri)?;
        manifests.push(read_backup(handle.as_ref()).await?);
    }
    Ok(manifests)
}

/// Resolves a BACKUP statement into job details.
pub async fn plan_backup(
    kv: &dyn KvStore,
    catalog: &dyn Catalog,
    storage: &StorageFactory,
    stmt: &BackupStatement,
) -> Result<BackupDetails> {
    let now = kv.now();
    let end_time = match stmt.as_of {
        Some(as_of) if as_of > now => {
            return Err(EngineError::TimestampInFuture { requested: as_of, now });
        }
        Some(as_of) => as_of,
        None => now,
    };

    let destination = storage.open(&stmt.uri)?;
    if destination.exists(BACKUP_MANIFEST_NAME).await? {
        return Err(EngineError::DestinationExists(stmt.uri.clone()));
    }

    let mut databases = BTreeMap::new();
    let mut tables: BTreeMap<DescriptorId, TableDescriptor> = BTreeMap::new();
    let mut complete_dbs = BTreeSet::new();
    for target in &stmt.targets {
        let db = catalog
            .database_by_name(target.database())
            .ok_or_else(|| EngineError::DatabaseNotFound(target.database().to_string()))?;
        match target {
            Target::Database { .. } | Target::AllTables { .. } => {
                complete_dbs.insert(db.id);
                for t in catalog.tables_in_database(db.id) {
                    tables.insert(t.id, t);
                }
            }
            Target::Table { database, table } => {
                let t = catalog
                    .table_by_name(db.id, table)
                    .ok_or_else(|| EngineError::TableNotFound(format!("{}.{}", database, table)))?;
                tables.insert(t.id, t);
            }
        }
        databases.insert(db.id, db);
    }
    tables.retain(|_, t| t.is_public() && !t.is_dropped());

    let spans: Vec<Span> = tables.values().filter(|t| !t.is_view()).map(|t| t.table_span()).collect();

    let mut start_time = crate::kv::Timestamp::ZERO;
    if !stmt.incremental_from.is_empty() {
        let previous = load_chain(storage, &stmt.incremental_from).await?;
        let cluster_id = kv.cluster_id();
        if let Some(m) = previous.iter().find(|m| m.cluster_id != cluster_id) {
            return Err(EngineError::ChainClusterMismatch {
                expected: cluster_id.to_string(),
                found: m.cluster_id.to_string(),
            });
        }
        let targeted: Vec<&TableDescriptor> = tables.values().collect();
        check_incremental(&previous, &targeted, &spans, end_time)?;
        if let Some(last) = previous.last() {
            start_time = last.end_time;
        }
    }

    let descriptors: Vec<Descriptor> = databases
        .into_values()
        .map(Descriptor::Database)
        .chain(tables.into_values().map(Descriptor::Table))
        .collect();
    debug!(
        "Planned backup to {}: {} descriptor(s), {} span(s), ({}, {}]",
        stmt.uri,
        descriptors.len(),
        spans.len(),
        start_time,
        end_time
    );

    Ok(BackupDetails {
        backup_id: Uuid::new_v4(),
        uri: stmt.uri.clone(),
        incremental_from: stmt.incremental_from.clone(),
        cluster_id: kv.cluster_id(),
        start_time,
        end_time,
        revision_history: stmt.revision_history,
        spans,
        descriptors,
        complete_dbs: complete_dbs.into_iter().collect(),
        exported_spans: Vec::new(),
    })
}

/// Resolves a RESTORE statement against its backup chain.
pub async fn plan_restore_job(
    catalog: &dyn Catalog,
    storage: &StorageFactory,
    user: &str,
    stmt: &RestoreStatement,
) -> Result<RestoreDetails> {
    let chain = load_chain(storage, &stmt.uris).await?;
    validate_chain(&chain)?;
    let chain = resolve_as_of(&chain, stmt.as_of)?;
    let last = chain
        .last()
        .ok_or_else(|| EngineError::Manifest("no backups specified".into()))?;

    let plan = plan_restore(last, &stmt.targets, &stmt.options, catalog, user)?;
    for old_id in plan.rewrites.tables.keys() {
        if let Some(table) = last.table(*old_id) {
            check_table_coverage(chain, table)?;
        }
    }

    Ok(RestoreDetails {
        uris: stmt.uris.clone(),
        as_of: stmt.as_of,
        end_time: stmt.as_of.unwrap_or(last.end_time),
        cluster_id: last.cluster_id,
        plan,
        low_water_mark: None,
    })
}
