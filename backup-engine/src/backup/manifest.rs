//! The backup manifest: the self-describing record of one backup.
//!
//! A destination holds `BACKUP` once the backup finished and
//! `BACKUP-CHECKPOINT` while it is in progress; both use this schema.

use crate::catalog::descriptor::{DatabaseDescriptor, Descriptor, DescriptorId, TableDescriptor};
use crate::kv::keys::{merge_spans, Span};
use crate::kv::{EntryCounts, Timestamp};
use crate::storage::ExternalStorage;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

pub const BACKUP_MANIFEST_NAME: &str = "BACKUP";
pub const BACKUP_CHECKPOINT_NAME: &str = "BACKUP-CHECKPOINT";
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
}

/// One exported chunk. An empty `path` records a chunk that held no data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub span: Span,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub checksum: u32,
    #[serde(default)]
    pub counts: EntryCounts,
    #[serde(default)]
    pub compression: Compression,
}

impl ManifestFile {
    pub fn has_data(&self) -> bool {
        !self.path.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Whether every revision in `(start_time, end_time]` was kept.
    #[serde(default)]
    pub revision_history: bool,
    pub spans: Vec<Span>,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    pub descriptors: Vec<Descriptor>,
    /// Databases backed up as a whole.
    #[serde(default)]
    pub complete_dbs: Vec<DescriptorId>,
    #[serde(default)]
    pub entry_counts: EntryCounts,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub build_info: String,
}

impl BackupManifest {
    pub fn new(
        cluster_id: Uuid,
        start_time: Timestamp,
        end_time: Timestamp,
        spans: Vec<Span>,
        descriptors: Vec<Descriptor>,
    ) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            id: Uuid::new_v4(),
            cluster_id,
            start_time,
            end_time,
            revision_history: false,
            spans,
            files: Vec::new(),
            descriptors,
            complete_dbs: Vec::new(),
            entry_counts: EntryCounts::default(),
            completed: false,
            created_at: Utc::now(),
            build_info: format!("backup-engine {}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn is_full(&self) -> bool {
        self.start_time.is_zero()
    }

    /// Appends a chunk result; each span may be recorded once.
    pub fn append_file(&mut self, file: ManifestFile) -> Result<()> {
        if self.files.iter().any(|f| f.span == file.span) {
            return Err(EngineError::Manifest(format!(
                "span {} already recorded in manifest",
                file.span
            )));
        }
        self.entry_counts.add(&file.counts);
        self.files.push(file);
        Ok(())
    }

    /// Spans with a recorded file entry.
    pub fn file_spans(&self) -> Vec<Span> {
        self.files.iter().map(|f| f.span.clone()).collect()
    }

    /// File spans must tile the requested spans exactly.
    pub fn validate_tiling(&self) -> Result<()> {
        let mut spans = self.file_spans();
        spans.sort();
        for pair in spans.windows(2) {
            if pair[0].overlaps(&pair[1]) {
                return Err(EngineError::Manifest(format!(
                    "file spans {} and {} overlap",
                    pair[0], pair[1]
                )));
            }
        }
        if merge_spans(&spans) != merge_spans(&self.spans) {
            return Err(EngineError::Manifest(
                "file spans do not cover the requested spans exactly".into(),
            ));
        }
        Ok(())
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDescriptor> {
        self.descriptors.iter().filter_map(Descriptor::as_table)
    }

    pub fn databases(&self) -> impl Iterator<Item = &DatabaseDescriptor> {
        self.descriptors.iter().filter_map(Descriptor::as_database)
    }

    pub fn table(&self, id: DescriptorId) -> Option<&TableDescriptor> {
        self.tables().find(|t| t.id == id)
    }

    pub fn database(&self, id: DescriptorId) -> Option<&DatabaseDescriptor> {
        self.databases().find(|db| db.id == id)
    }

    pub fn database_named(&self, name: &str) -> Option<&DatabaseDescriptor> {
        self.databases().find(|db| db.name == name)
    }

    pub fn table_ids(&self) -> HashSet<DescriptorId> {
        self.tables().map(|t| t.id).collect()
    }

    /// Files overlapping `span` that carry data.
    pub fn files_overlapping<'a>(&'a self, span: &'a Span) -> impl Iterator<Item = &'a ManifestFile> + 'a {
        self.files.iter().filter(move |f| f.has_data() && f.span.overlaps(span))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let manifest: BackupManifest = serde_json::from_slice(data)
            .map_err(|e| EngineError::Manifest(format!("could not decode manifest: {}", e)))?;
        if manifest.format_version > MANIFEST_FORMAT_VERSION {
            return Err(EngineError::Manifest(format!(
                "unsupported manifest format version {}",
                manifest.format_version
            )));
        }
        Ok(manifest)
    }
}

pub async fn read_manifest(storage: &dyn ExternalStorage, name: &str) -> Result<BackupManifest> {
    let data = storage.read_file(name).await?;
    BackupManifest::decode(&data)
}

pub async fn write_manifest(storage: &dyn ExternalStorage, name: &str, manifest: &BackupManifest) -> Result<()> {
    storage.write_file(name, manifest.encode()?).await
}

/// Reads the final manifest of a finished backup.
pub async fn read_backup(storage: &dyn ExternalStorage) -> Result<BackupManifest> {
    let manifest = read_manifest(storage, BACKUP_MANIFEST_NAME).await?;
    if !manifest.completed {
        return Err(EngineError::Manifest(format!(
            "backup at {} is not complete",
            storage.uri()
        )));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::keys::Key;

    fn sp(a: u8, b: u8) -> Span {
        Span::new(Key::new(vec![a]), Key::new(vec![b]))
    }

    fn file(span: Span, path: &str) -> ManifestFile {
        ManifestFile {
            path: path.into(),
            span,
            start_time: Timestamp::ZERO,
            end_time: Timestamp::new(10, 0),
            checksum: 0,
            counts: EntryCounts {
                data_size: 5,
                rows: 1,
                index_entries: 0,
            },
            compression: Compression::None,
        }
    }

    fn manifest() -> BackupManifest {
        BackupManifest::new(
            Uuid::new_v4(),
            Timestamp::ZERO,
            Timestamp::new(10, 0),
            vec![sp(1, 5)],
            Vec::new(),
        )
    }

    #[test]
    fn test_duplicate_span_rejected() {
        let mut m = manifest();
        m.append_file(file(sp(1, 3), "a.sst")).unwrap();
        assert!(m.append_file(file(sp(1, 3), "b.sst")).is_err());
        assert_eq!(m.entry_counts.rows, 1);
    }

    #[test]
    fn test_tiling() {
        let mut m = manifest();
        m.append_file(file(sp(1, 3), "a.sst")).unwrap();
        assert!(m.validate_tiling().is_err());
        m.append_file(file(sp(3, 5), "")).unwrap();
        m.validate_tiling().unwrap();

        let mut overlapping = manifest();
        overlapping.append_file(file(sp(1, 4), "a.sst")).unwrap();
        overlapping.append_file(file(sp(3, 5), "b.sst")).unwrap();
        assert!(overlapping.validate_tiling().is_err());
    }

    #[test]
    fn test_encoding_survives_decode() {
        let mut m = manifest();
        m.append_file(file(sp(1, 5), "a.sst")).unwrap();
        m.completed = true;
        let decoded = BackupManifest::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.files_overlapping(&sp(4, 9)).count(), 1);
    }

    #[test]
    fn test_newer_format_rejected() {
        let mut m = manifest();
        m.format_version = MANIFEST_FORMAT_VERSION + 1;
        let err = BackupManifest::decode(&m.encode().unwrap()).unwrap_err();
        assert_eq!(err.kind(), "manifest");
    }
}
