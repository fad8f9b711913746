//! Export coordinator.
//!
//! Splits the requested spans at range boundaries, exports the chunks
//! concurrently, and tracks finished chunks in a checkpoint manifest so an
//! interrupted backup resumes where it stopped. Only the coordinator task
//! mutates the manifest; workers hand back file entries.

use super::manifest::{
    read_manifest, write_manifest, BackupManifest, Compression, ManifestFile, BACKUP_CHECKPOINT_NAME,
    BACKUP_MANIFEST_NAME,
};
use super::BackupDetails;
use crate::config::ExportConfig;
use crate::jobs::{JobContext, JobDetails};
use crate::kv::keys::{merge_spans, subtract_spans, Span};
use crate::kv::sst::file_checksum;
use crate::kv::{EntryCounts, ExportRequest, KvStore, Timestamp};
use crate::progress::{format_bytes, ChunkProgress};
use crate::storage::ExternalStorage;
use crate::utils::errors::{EngineError, Result};
use crate::utils::retry::{with_retry, RetryConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct BackupCoordinator {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn ExternalStorage>,
    config: ExportConfig,
    retry: RetryConfig,
}

/// Inputs one export worker needs.
#[derive(Clone)]
struct ChunkWorker {
    kv: Arc<dyn KvStore>,
    storage: Arc<dyn ExternalStorage>,
    retry: RetryConfig,
    compression: Compression,
    compression_level: i32,
    start_time: Timestamp,
    end_time: Timestamp,
    revision_history: bool,
}

impl ChunkWorker {
    /// Exports one chunk and stores its data files.
    ///
    /// Returns entries tiling `chunk`; parts without data get an empty path.
    async fn run(&self, chunk: Span) -> Result<Vec<ManifestFile>> {
        let request = ExportRequest {
            span: chunk.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            revision_history: self.revision_history,
        };
        let response = with_retry(&self.retry, &format!("export {}", chunk), || {
            self.kv.export_range(request.clone())
        })
        .await?;

        let mut entries = Vec::with_capacity(response.files.len() + 1);
        for file in response.files {
            let stored = match self.compression {
                Compression::None => file.data,
                Compression::Zstd => zstd::encode_all(&file.data[..], self.compression_level)
                    .map_err(|e| EngineError::Compression(e.to_string()))?,
            };
            let path = format!("{}.sst", Uuid::new_v4().simple());
            let checksum = file_checksum(&stored);
            self.storage.write_file(&path, stored).await?;
            entries.push(self.entry(file.span, path, checksum, file.counts));
        }

        let covered: Vec<Span> = entries.iter().map(|e| e.span.clone()).collect();
        for gap in subtract_spans(&[chunk], &covered) {
            entries.push(self.entry(gap, String::new(), 0, EntryCounts::default()));
        }
        Ok(entries)
    }

    fn entry(&self, span: Span, path: String, checksum: u32, counts: EntryCounts) -> ManifestFile {
        ManifestFile {
            path,
            span,
            start_time: self.start_time,
            end_time: self.end_time,
            checksum,
            counts,
            compression: self.compression,
        }
    }
}

/// Parts of each requested span missing from `done`. Spans are not merged
/// with their neighbours, so no chunk crosses a table boundary.
fn pending_spans(spans: &[Span], done: &[Span]) -> Vec<Span> {
    spans
        .iter()
        .flat_map(|span| subtract_spans(std::slice::from_ref(span), done))
        .collect()
}

fn append_entries(manifest: &mut BackupManifest, progress: &mut ChunkProgress, entries: Vec<ManifestFile>) -> Result<()> {
    let mut counts = EntryCounts::default();
    for entry in entries {
        counts.add(&entry.counts);
        manifest.append_file(entry)?;
    }
    progress.complete_chunk(&counts);
    Ok(())
}

impl BackupCoordinator {
    pub fn new(
        kv: Arc<dyn KvStore>,
        storage: Arc<dyn ExternalStorage>,
        config: ExportConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            kv,
            storage,
            config,
            retry,
        }
    }

    /// Runs (or resumes) the backup described by `details`.
    pub async fn run(&self, ctx: &JobContext, details: &BackupDetails) -> Result<BackupManifest> {
        let uri = self.storage.uri().to_string();
        if self.storage.exists(BACKUP_MANIFEST_NAME).await? {
            let existing = read_manifest(self.storage.as_ref(), BACKUP_MANIFEST_NAME).await?;
            if existing.id == details.backup_id && existing.completed {
                info!("Backup {} already finalized at {}", details.backup_id, uri);
                return Ok(existing);
            }
            return Err(EngineError::DestinationExists(uri));
        }

        let mut manifest = match self.load_checkpoint(details).await {
            Some(checkpoint) => checkpoint,
            None => {
                let mut m = BackupManifest::new(
                    details.cluster_id,
                    details.start_time,
                    details.end_time,
                    details.spans.clone(),
                    details.descriptors.clone(),
                );
                m.id = details.backup_id;
                m.revision_history = details.revision_history;
                m.complete_dbs = details.complete_dbs.clone();
                m
            }
        };

        let remaining = pending_spans(&details.spans, &manifest.file_spans());
        let mut chunks = Vec::new();
        for span in &remaining {
            chunks.extend(self.kv.range_spans(span).await?);
        }
        let already_done = manifest.files.len();
        let mut progress = ChunkProgress::new(already_done + chunks.len(), already_done);
        info!(
            "Exporting {} chunk(s) to {} ({} already checkpointed, concurrency {})",
            chunks.len(),
            uri,
            already_done,
            self.config.concurrency
        );

        let worker = ChunkWorker {
            kv: self.kv.clone(),
            storage: self.storage.clone(),
            retry: self.retry.clone(),
            compression: self.config.compression,
            compression_level: self.config.compression_level,
            start_time: details.start_time,
            end_time: details.end_time,
            revision_history: details.revision_history,
        };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let stop = CancellationToken::new();
        let mut tasks: JoinSet<Result<Option<Vec<ManifestFile>>>> = JoinSet::new();

        for chunk in chunks {
            let worker = worker.clone();
            let semaphore = semaphore.clone();
            let stop = stop.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    _ = stop.cancelled() => return Ok(None),
                    permit = semaphore.acquire_owned() => permit
                        .map_err(|e| EngineError::Internal(format!("export semaphore closed: {}", e)))?,
                };
                if stop.is_cancelled() {
                    return Ok(None);
                }
                worker.run(chunk).await.map(Some)
            });
        }

        let interval = Duration::from_millis(self.config.checkpoint_interval_ms);
        let mut last_checkpoint = Instant::now();
        let mut first_error: Option<EngineError> = None;

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| EngineError::Internal(format!("export task panicked: {}", e)))
                .and_then(|r| r);
            let step = match outcome {
                Ok(None) => Ok(()),
                // Stopping: keep the file in the checkpoint, skip control checks.
                Ok(Some(entries)) if first_error.is_some() => {
                    append_entries(&mut manifest, &mut progress, entries)
                }
                Ok(Some(entries)) => {
                    self.record_chunk(ctx, details, &mut manifest, &mut progress, entries, interval, &mut last_checkpoint)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = step {
                if first_error.is_none() {
                    if e.is_control() {
                        info!("Backup job {} stopping: {}", ctx.job_id(), e);
                    } else {
                        error!("Backup job {} failed: {}", ctx.job_id(), e);
                    }
                    stop.cancel();
                    first_error = Some(e);
                }
            }
        }

        if let Some(e) = first_error {
            if let Err(cp) = write_manifest(self.storage.as_ref(), BACKUP_CHECKPOINT_NAME, &manifest).await {
                warn!("Could not write checkpoint for job {}: {}", ctx.job_id(), cp);
            }
            return Err(e);
        }

        manifest.completed = true;
        manifest.validate_tiling()?;
        write_manifest(self.storage.as_ref(), BACKUP_MANIFEST_NAME, &manifest).await?;
        self.storage.delete(BACKUP_CHECKPOINT_NAME).await?;
        info!(
            "Backup job {} wrote {} file(s), {} rows, {} in {:?}",
            ctx.job_id(),
            manifest.files.iter().filter(|f| f.has_data()).count(),
            manifest.entry_counts.rows,
            format_bytes(manifest.entry_counts.data_size),
            progress.elapsed()
        );
        Ok(manifest)
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_chunk(
        &self,
        ctx: &JobContext,
        details: &BackupDetails,
        manifest: &mut BackupManifest,
        progress: &mut ChunkProgress,
        entries: Vec<ManifestFile>,
        interval: Duration,
        last_checkpoint: &mut Instant,
    ) -> Result<()> {
        append_entries(manifest, progress, entries)?;

        if last_checkpoint.elapsed() >= interval {
            write_manifest(self.storage.as_ref(), BACKUP_CHECKPOINT_NAME, manifest).await?;
            *last_checkpoint = Instant::now();
            let mut updated = details.clone();
            updated.exported_spans = merge_spans(&manifest.file_spans());
            ctx.report_progress(progress, Some(JobDetails::Backup(updated))).await
        } else {
            ctx.check_control().await
        }
    }

    /// Reuses a checkpoint written by an earlier run of the same backup.
    async fn load_checkpoint(&self, details: &BackupDetails) -> Option<BackupManifest> {
        match self.storage.exists(BACKUP_CHECKPOINT_NAME).await {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("Could not check for backup checkpoint: {}", e);
                return None;
            }
        }
        let checkpoint = match read_manifest(self.storage.as_ref(), BACKUP_CHECKPOINT_NAME).await {
            Ok(m) => m,
            Err(e) => {
                warn!("Discarding unreadable backup checkpoint: {}", e);
                return None;
            }
        };
        if checkpoint.cluster_id != details.cluster_id
            || checkpoint.start_time != details.start_time
            || checkpoint.end_time != details.end_time
        {
            warn!(
                "Discarding backup checkpoint for ({}, {}] from cluster {}",
                checkpoint.start_time, checkpoint.end_time, checkpoint.cluster_id
            );
            return None;
        }
        info!("Resuming from checkpoint with {} file(s)", checkpoint.files.len());
        Some(checkpoint)
    }

    /// Removes everything a canceled backup wrote.
    pub async fn cleanup(&self) -> Result<()> {
        if !self.storage.exists(BACKUP_CHECKPOINT_NAME).await? {
            return Ok(());
        }
        match read_manifest(self.storage.as_ref(), BACKUP_CHECKPOINT_NAME).await {
            Ok(checkpoint) => {
                for file in checkpoint.files.iter().filter(|f| f.has_data()) {
                    self.storage.delete(&file.path).await?;
                }
            }
            Err(e) => warn!("Checkpoint unreadable during cleanup: {}", e),
        }
        self.storage.delete(BACKUP_CHECKPOINT_NAME).await
    }
}
