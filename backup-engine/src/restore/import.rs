//! Import coordinator.
//!
//! Creates the restored descriptors offline, imports every import span above
//! the low-water mark, validates the result and publishes the tables. A
//! failed or canceled restore drops what it created.

use super::spans::{import_spans, low_water_mark, spans_below, ImportSpan};
use super::validate::{validate_foreign_keys, validate_views};
use super::RestoreDetails;
use crate::backup::manifest::{BackupManifest, Compression};
use crate::catalog::descriptor::DescriptorState;
use crate::catalog::Catalog;
use crate::config::ImportConfig;
use crate::jobs::{JobContext, JobDetails};
use crate::kv::keys::Key;
use crate::kv::sst::{file_checksum, read_sst, MvccEntry, SstWriter};
use crate::kv::{EntryCounts, ImportRequest, KvStore, Timestamp};
use crate::progress::ChunkProgress;
use crate::restore::rewrite::RewriteMap;
use crate::storage::ExternalStorage;
use crate::utils::errors::{EngineError, Result};
use crate::utils::retry::{with_retry, RetryConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct RestoreCoordinator {
    kv: Arc<dyn KvStore>,
    catalog: Arc<dyn Catalog>,
    /// One storage per backup of the chain, full backup first.
    storages: Vec<Arc<dyn ExternalStorage>>,
    config: ImportConfig,
    retry: RetryConfig,
}

#[derive(Clone)]
struct SpanWorker {
    kv: Arc<dyn KvStore>,
    storages: Vec<Arc<dyn ExternalStorage>>,
    rewrites: Arc<RewriteMap>,
    retry: RetryConfig,
    end_time: Timestamp,
}

impl SpanWorker {
    async fn read_file(&self, backup: usize, path: &str, checksum: u32, compression: Compression) -> Result<Vec<MvccEntry>> {
        let storage = self
            .storages
            .get(backup)
            .ok_or_else(|| EngineError::Internal(format!("no storage for backup {}", backup)))?;
        let data = storage.read_file(path).await?;
        let actual = file_checksum(&data);
        if actual != checksum {
            return Err(EngineError::ChecksumMismatch {
                path: format!("{}/{}", storage.uri().trim_end_matches('/'), path),
                expected: checksum,
                actual,
            });
        }
        let data = match compression {
            Compression::None => data,
            Compression::Zstd => {
                zstd::decode_all(&data[..]).map_err(|e| EngineError::Compression(format!("{}: {}", path, e)))?
            }
        };
        read_sst(&data)
    }

    /// Imports the newest revision at or below the restore time of every key
    /// in `item`; deleted keys are left out.
    async fn run(&self, item: ImportSpan) -> Result<EntryCounts> {
        let mut latest: BTreeMap<Key, MvccEntry> = BTreeMap::new();
        for file_ref in &item.files {
            let entries = self
                .read_file(
                    file_ref.backup,
                    &file_ref.file.path,
                    file_ref.file.checksum,
                    file_ref.file.compression,
                )
                .await?;
            for entry in entries {
                if !item.span.contains_key(&entry.key) || entry.timestamp > self.end_time {
                    continue;
                }
                match latest.get(&entry.key) {
                    Some(existing) if existing.timestamp >= entry.timestamp => {}
                    _ => {
                        latest.insert(entry.key.clone(), entry);
                    }
                }
            }
        }

        let mut writer = SstWriter::new();
        for entry in latest.into_values().filter(|e| !e.is_tombstone()) {
            writer.add(&MvccEntry {
                key: self.rewrites.rewrite_key(&entry.key)?,
                timestamp: entry.timestamp,
                value: entry.value,
            })?;
        }
        if writer.is_empty() {
            return Ok(EntryCounts::default());
        }
        let request = ImportRequest {
            span: self.rewrites.rewrite_span(&item.span)?,
            data: writer.finish()?,
        };
        let response = with_retry(&self.retry, &format!("import {}", item.span), || {
            self.kv.import_range(request.clone())
        })
        .await?;
        Ok(response.counts)
    }
}

impl RestoreCoordinator {
    pub fn new(
        kv: Arc<dyn KvStore>,
        catalog: Arc<dyn Catalog>,
        storages: Vec<Arc<dyn ExternalStorage>>,
        config: ImportConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            kv,
            catalog,
            storages,
            config,
            retry,
        }
    }

    /// Runs (or resumes) the restore; `manifests` is the as-of truncated chain.
    pub async fn run(&self, ctx: &JobContext, details: &RestoreDetails, manifests: &[BackupManifest]) -> Result<EntryCounts> {
        if let Some(m) = manifests.iter().find(|m| m.cluster_id != details.cluster_id) {
            return Err(EngineError::ChainClusterMismatch {
                expected: details.cluster_id.to_string(),
                found: m.cluster_id.to_string(),
            });
        }
        self.create_offline(details)?;

        let spans = import_spans(&details.plan.source_spans, manifests, details.low_water_mark.as_ref());
        let already_done = spans_below(&details.plan.source_spans, manifests, details.low_water_mark.as_ref());
        let mut done = vec![false; spans.len()];
        let mut progress = ChunkProgress::new(already_done + spans.len(), already_done);
        info!(
            "Importing {} span(s) for job {} (resume from {:?}, concurrency {})",
            spans.len(),
            ctx.job_id(),
            details.low_water_mark,
            self.config.concurrency
        );

        let worker = SpanWorker {
            kv: self.kv.clone(),
            storages: self.storages.clone(),
            rewrites: Arc::new(details.plan.rewrites.clone()),
            retry: self.retry.clone(),
            end_time: details.end_time,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let stop = CancellationToken::new();
        let mut tasks: JoinSet<(usize, Result<Option<EntryCounts>>)> = JoinSet::new();

        for (idx, item) in spans.iter().cloned().enumerate() {
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = stop.cancelled() => return (idx, Ok(None)),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(e) => return (idx, Err(EngineError::Internal(format!("import semaphore closed: {}", e)))),
                    },
                };
                if stop.is_cancelled() {
                    return (idx, Ok(None));
                }
                (idx, worker.run(item).await.map(Some))
            });
        }

        let interval = Duration::from_millis(self.config.checkpoint_interval_ms);
        let mut last_checkpoint = Instant::now();
        let mut first_error: Option<EngineError> = None;
        let mut counts = EntryCounts::default();

        while let Some(joined) = tasks.join_next().await {
            let step = match joined {
                Err(e) => Err(EngineError::Internal(format!("import task panicked: {}", e))),
                Ok((_, Ok(None))) => Ok(()),
                Ok((_, Err(e))) => Err(e),
                Ok((idx, Ok(Some(span_counts)))) => {
                    done[idx] = true;
                    counts.add(&span_counts);
                    progress.complete_chunk(&span_counts);
                    if first_error.is_some() {
                        Ok(())
                    } else if last_checkpoint.elapsed() >= interval {
                        last_checkpoint = Instant::now();
                        ctx.report_progress(&progress, Some(self.checkpoint(details, &spans, &done)))
                            .await
                    } else {
                        ctx.check_control().await
                    }
                }
            };
            if let Err(e) = step {
                if first_error.is_none() {
                    if e.is_control() {
                        info!("Restore job {} stopping: {}", ctx.job_id(), e);
                    } else {
                        error!("Restore job {} failed: {}", ctx.job_id(), e);
                    }
                    stop.cancel();
                    first_error = Some(e);
                }
            }
        }

        if let Some(e) = first_error {
            if e.is_control() {
                // Persists the low-water mark; the control error it returns is already known.
                let _ = ctx
                    .report_progress(&progress, Some(self.checkpoint(details, &spans, &done)))
                    .await;
            }
            return Err(e);
        }

        let at = self.kv.now();
        validate_foreign_keys(self.kv.as_ref(), &details.plan.tables, at).await?;
        validate_views(self.catalog.as_ref(), &details.plan.tables)?;
        ctx.check_control().await?;

        self.catalog
            .set_table_state(&details.plan.table_ids(), DescriptorState::Public)?;
        info!(
            "Restore job {} published {} table(s): {} rows, {} index entries",
            ctx.job_id(),
            details.plan.tables.len(),
            counts.rows,
            counts.index_entries
        );
        Ok(counts)
    }

    fn checkpoint(&self, details: &RestoreDetails, spans: &[ImportSpan], done: &[bool]) -> JobDetails {
        let mut updated = details.clone();
        if let Some(lwm) = low_water_mark(spans, done) {
            updated.low_water_mark = Some(lwm);
        }
        JobDetails::Restore(updated)
    }

    /// Writes databases and offline tables unless an earlier run already did.
    fn create_offline(&self, details: &RestoreDetails) -> Result<()> {
        for db in &details.plan.databases {
            if self.catalog.database_by_id(db.id).is_none() {
                self.catalog.create_database(db.clone())?;
            }
        }
        for table in &details.plan.tables {
            if self.catalog.table_by_id(table.id).is_none() {
                self.catalog.write_table(table.clone())?;
            }
        }
        Ok(())
    }

    /// Drops the tables and databases a failed or canceled restore created.
    pub fn cleanup(&self, details: &RestoreDetails) -> Result<()> {
        let existing: Vec<_> = details
            .plan
            .table_ids()
            .into_iter()
            .filter(|id| self.catalog.table_by_id(*id).is_some())
            .collect();
        if !existing.is_empty() {
            self.catalog.set_table_state(&existing, DescriptorState::Drop)?;
        }
        for db in &details.plan.databases {
            if self.catalog.database_by_id(db.id).is_some() {
                if let Err(e) = self.catalog.drop_database(db.id) {
                    warn!("Could not drop database {} after restore: {}", db.name, e);
                }
            }
        }
        Ok(())
    }
}
