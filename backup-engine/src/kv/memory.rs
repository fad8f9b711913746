//! In-process MVCC key-value store.
//!
//! Keeps every revision of every key, stamps writes with a hybrid clock and
//! models range boundaries as a set of split keys. Test knobs can hold
//! export/import responses behind a semaphore, count requests and inject
//! transient failures.

use super::keys::{Key, Span};
use super::sst::{read_sst, MvccEntry, SstWriter};
use super::timestamp::{HybridClock, Timestamp};
use super::{
    EntryCounts, ExportRequest, ExportResponse, ExportedFile, ImportRequest, ImportResponse,
    KvStore,
};
use crate::catalog::descriptor::TableDescriptor;
use crate::catalog::rowenc::{self, Datum, Row};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Version {
    ts: Timestamp,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct TestingKnobs {
    response_gate: Mutex<Option<Arc<Semaphore>>>,
    transient_failures: AtomicUsize,
    export_requests: AtomicUsize,
    import_requests: AtomicUsize,
}

pub struct MemKv {
    cluster_id: Uuid,
    clock: HybridClock,
    /// Versions per key, newest first.
    data: RwLock<BTreeMap<Key, Vec<Version>>>,
    splits: RwLock<BTreeSet<Key>>,
    knobs: TestingKnobs,
}

impl MemKv {
    pub fn new() -> Self {
        Self::with_cluster_id(Uuid::new_v4())
    }

    pub fn with_cluster_id(cluster_id: Uuid) -> Self {
        Self {
            cluster_id,
            clock: HybridClock::new(),
            data: RwLock::new(BTreeMap::new()),
            splits: RwLock::new(BTreeSet::new()),
            knobs: TestingKnobs::default(),
        }
    }

    /// Applies all writes atomically at one fresh timestamp.
    pub fn write_batch(&self, writes: Vec<(Key, Option<Vec<u8>>)>) -> Timestamp {
        let mut data = self.data.write();
        let ts = self.clock.now();
        for (key, value) in writes {
            data.entry(key).or_default().insert(0, Version { ts, value });
        }
        ts
    }

    pub fn put(&self, key: Key, value: Vec<u8>) -> Timestamp {
        self.write_batch(vec![(key, Some(value))])
    }

    pub fn delete(&self, key: Key) -> Timestamp {
        self.write_batch(vec![(key, None)])
    }

    /// Inserts or replaces rows, keeping secondary indexes in sync.
    pub fn upsert_rows(&self, table: &TableDescriptor, rows: &[Row]) -> Result<Timestamp> {
        let mut data = self.data.write();
        // Last write per key wins, so an unchanged index entry is not also tombstoned.
        let mut writes: BTreeMap<Key, Option<Vec<u8>>> = BTreeMap::new();
        for row in rows {
            let pk = rowenc::primary_key(table, row)?;
            if let Some(old) = latest_live(&data, &pk, self.clock_reading()) {
                let old_row = rowenc::decode_row(table, &old)?;
                for index in &table.indexes {
                    writes.insert(rowenc::secondary_key(table, index, &old_row)?, None);
                }
            }
            for (key, value) in rowenc::encode_row(table, row)? {
                writes.insert(key, Some(value));
            }
        }
        let ts = self.clock.now();
        for (key, value) in writes {
            data.entry(key).or_default().insert(0, Version { ts, value });
        }
        Ok(ts)
    }

    /// Deletes rows by primary key values.
    pub fn delete_rows(&self, table: &TableDescriptor, keys: &[Vec<Datum>]) -> Result<Timestamp> {
        let mut data = self.data.write();
        let mut writes = Vec::new();
        for values in keys {
            let pk = rowenc::primary_key_for(table.id, values);
            if let Some(old) = latest_live(&data, &pk, self.clock_reading()) {
                let old_row = rowenc::decode_row(table, &old)?;
                for index in &table.indexes {
                    writes.push(rowenc::secondary_key(table, index, &old_row)?);
                }
                writes.push(pk);
            }
        }
        let ts = self.clock.now();
        for key in writes {
            data.entry(key).or_default().insert(0, Version { ts, value: None });
        }
        Ok(ts)
    }

    /// Rows of `table` as of `at`, in primary key order.
    pub fn scan_rows(&self, table: &TableDescriptor, at: Timestamp) -> Result<Vec<Row>> {
        let span = table.index_spans().into_iter().next();
        let Some(span) = span else {
            return Ok(Vec::new());
        };
        self.scan_sync(&span, at)
            .into_iter()
            .map(|(_, value)| rowenc::decode_row(table, &value))
            .collect()
    }

    /// Number of live entries in one index of `table` as of `at`.
    pub fn count_index_entries(&self, table: &TableDescriptor, index_id: u32, at: Timestamp) -> usize {
        self.scan_sync(&Span::index(table.id, index_id), at).len()
    }

    /// Adds a range boundary at `key`.
    pub fn split_at(&self, key: Key) {
        self.splits.write().insert(key);
    }

    /// Holds every subsequent export/import response until a permit is available.
    pub fn set_response_gate(&self, gate: Option<Arc<Semaphore>>) {
        *self.knobs.response_gate.lock() = gate;
    }

    /// The next `n` export/import requests fail with a transient error.
    pub fn inject_transient_failures(&self, n: usize) {
        self.knobs.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn export_requests(&self) -> usize {
        self.knobs.export_requests.load(Ordering::SeqCst)
    }

    pub fn import_requests(&self) -> usize {
        self.knobs.import_requests.load(Ordering::SeqCst)
    }

    fn clock_reading(&self) -> Timestamp {
        Timestamp::new(i64::MAX, i32::MAX)
    }

    async fn pass_knobs(&self) -> Result<()> {
        let gate = self.knobs.response_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|e| EngineError::Transient(format!("response gate closed: {}", e)))?
                .forget();
        }
        let injected = self
            .knobs
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(EngineError::Transient("injected range unavailability".into()));
        }
        Ok(())
    }

    fn scan_sync(&self, span: &Span, at: Timestamp) -> Vec<(Key, Vec<u8>)> {
        if span.is_empty() {
            return Vec::new();
        }
        let data = self.data.read();
        data.range(span.key.clone()..span.end_key.clone())
            .filter_map(|(key, versions)| {
                versions
                    .iter()
                    .find(|v| v.ts <= at)
                    .and_then(|v| v.value.clone())
                    .map(|value| (key.clone(), value))
            })
            .collect()
    }

    fn export_sync(&self, request: &ExportRequest) -> Result<Option<ExportedFile>> {
        if request.span.is_empty() {
            return Ok(None);
        }
        let data = self.data.read();
        let mut writer = SstWriter::new();
        let mut counts = EntryCounts::default();
        let full = request.start_time.is_zero();

        for (key, versions) in data.range(request.span.key.clone()..request.span.end_key.clone()) {
            let in_window = |v: &&Version| v.ts > request.start_time && v.ts <= request.end_time;
            let selected: Vec<&Version> = if request.revision_history {
                versions.iter().filter(in_window).collect()
            } else {
                match versions.iter().find(|v| v.ts <= request.end_time) {
                    // Unchanged since the previous backup.
                    Some(v) if v.ts <= request.start_time => Vec::new(),
                    // A full backup has no use for deletions.
                    Some(v) if full && v.value.is_none() => Vec::new(),
                    Some(v) => vec![v],
                    None => Vec::new(),
                }
            };
            for v in selected {
                let entry = MvccEntry {
                    key: key.clone(),
                    timestamp: v.ts,
                    value: v.value.clone(),
                };
                counts.record(&entry.key, entry.size());
                writer.add(&entry)?;
            }
        }

        if writer.is_empty() {
            return Ok(None);
        }
        let data = writer.finish()?;
        Ok(Some(ExportedFile {
            span: request.span.clone(),
            checksum: super::sst::file_checksum(&data),
            data,
            counts,
        }))
    }

    fn import_sync(&self, request: &ImportRequest) -> Result<ImportResponse> {
        let entries = read_sst(&request.data)?;
        let mut counts = EntryCounts::default();
        for entry in &entries {
            if !request.span.contains_key(&entry.key) {
                return Err(EngineError::Internal(format!(
                    "import key {} outside of request span {}",
                    entry.key, request.span
                )));
            }
        }
        let mut data = self.data.write();
        let ts = self.clock.now();
        for entry in entries {
            counts.record(&entry.key, entry.size());
            data.entry(entry.key).or_default().insert(
                0,
                Version {
                    ts,
                    value: entry.value,
                },
            );
        }
        Ok(ImportResponse { counts })
    }
}

impl Default for MemKv {
    fn default() -> Self {
        Self::new()
    }
}

fn latest_live(data: &BTreeMap<Key, Vec<Version>>, key: &Key, at: Timestamp) -> Option<Vec<u8>> {
    data.get(key)?
        .iter()
        .find(|v| v.ts <= at)
        .and_then(|v| v.value.clone())
}

#[async_trait]
impl KvStore for MemKv {
    fn cluster_id(&self) -> Uuid {
        self.cluster_id
    }

    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    async fn range_spans(&self, span: &Span) -> Result<Vec<Span>> {
        if span.is_empty() {
            return Ok(Vec::new());
        }
        let splits = self.splits.read();
        let mut out = Vec::new();
        let mut start = span.key.clone();
        for split in splits.range(span.key.clone()..span.end_key.clone()) {
            if *split > start {
                out.push(Span::new(start, split.clone()));
                start = split.clone();
            }
        }
        out.push(Span::new(start, span.end_key.clone()));
        Ok(out)
    }

    async fn export_range(&self, request: ExportRequest) -> Result<ExportResponse> {
        self.knobs.export_requests.fetch_add(1, Ordering::SeqCst);
        self.pass_knobs().await?;
        let file = self.export_sync(&request)?;
        debug!(
            "exported {} ({}, {}]: {} bytes",
            request.span,
            request.start_time,
            request.end_time,
            file.as_ref().map_or(0, |f| f.data.len())
        );
        Ok(ExportResponse {
            files: file.into_iter().collect(),
        })
    }

    async fn import_range(&self, request: ImportRequest) -> Result<ImportResponse> {
        self.knobs.import_requests.fetch_add(1, Ordering::SeqCst);
        self.pass_knobs().await?;
        self.import_sync(&request)
    }

    async fn scan(&self, span: &Span, at: Timestamp) -> Result<Vec<(Key, Vec<u8>)>> {
        Ok(self.scan_sync(span, at))
    }

    async fn get(&self, key: &Key, at: Timestamp) -> Result<Option<Vec<u8>>> {
        Ok(latest_live(&self.data.read(), key, at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::descriptor::ColumnType;

    fn k(s: &str) -> Key {
        Key::new(s.as_bytes().to_vec())
    }

    fn export(kv: &MemKv, start: Timestamp, end: Timestamp, revisions: bool) -> Vec<MvccEntry> {
        let file = kv
            .export_sync(&ExportRequest {
                span: Span::new(k("a"), k("z")),
                start_time: start,
                end_time: end,
                revision_history: revisions,
            })
            .unwrap();
        file.map(|f| read_sst(&f.data).unwrap()).unwrap_or_default()
    }

    #[test]
    fn test_full_export_skips_deleted_keys() {
        let kv = MemKv::new();
        kv.put(k("b"), b"1".to_vec());
        kv.put(k("c"), b"2".to_vec());
        let end = kv.delete(k("c"));
        let entries = export(&kv, Timestamp::ZERO, end, false);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, k("b"));
    }

    #[test]
    fn test_incremental_export_keeps_deletions() {
        let kv = MemKv::new();
        kv.put(k("b"), b"1".to_vec());
        let t1 = kv.put(k("c"), b"2".to_vec());
        kv.delete(k("c"));
        let t2 = kv.put(k("d"), b"3".to_vec());
        let entries = export(&kv, t1, t2, false);
        let keys: Vec<_> = entries.iter().map(|e| (e.key.clone(), e.is_tombstone())).collect();
        assert_eq!(keys, vec![(k("c"), true), (k("d"), false)]);
    }

    #[test]
    fn test_revision_history_export() {
        let kv = MemKv::new();
        kv.put(k("b"), b"1".to_vec());
        kv.put(k("b"), b"2".to_vec());
        let end = kv.put(k("b"), b"3".to_vec());
        kv.put(k("b"), b"4".to_vec());
        let entries = export(&kv, Timestamp::ZERO, end, true);
        let values: Vec<_> = entries.iter().map(|e| e.value.clone().unwrap()).collect();
        assert_eq!(values, vec![b"3".to_vec(), b"2".to_vec(), b"1".to_vec()]);
    }

    #[tokio::test]
    async fn test_range_spans_follow_splits() {
        let kv = MemKv::new();
        kv.split_at(k("f"));
        kv.split_at(k("m"));
        kv.split_at(k("zz"));
        let spans = kv.range_spans(&Span::new(k("a"), k("p"))).await.unwrap();
        assert_eq!(
            spans,
            vec![
                Span::new(k("a"), k("f")),
                Span::new(k("f"), k("m")),
                Span::new(k("m"), k("p"))
            ]
        );
    }

    #[tokio::test]
    async fn test_import_rejects_keys_outside_span() {
        let kv = MemKv::new();
        let mut writer = SstWriter::new();
        writer
            .add(&MvccEntry {
                key: k("q"),
                timestamp: Timestamp::new(1, 0),
                value: Some(b"v".to_vec()),
            })
            .unwrap();
        let data = writer.finish().unwrap();
        let result = kv
            .import_range(ImportRequest {
                span: Span::new(k("a"), k("m")),
                data: data.clone(),
            })
            .await;
        assert!(result.is_err());
        let ok = kv
            .import_range(ImportRequest {
                span: Span::new(k("a"), k("z")),
                data,
            })
            .await
            .unwrap();
        assert_eq!(ok.counts.index_entries + ok.counts.rows, 1);
        assert_eq!(kv.get(&k("q"), kv.now()).await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let kv = MemKv::new();
        kv.inject_transient_failures(1);
        let request = ExportRequest {
            span: Span::new(k("a"), k("b")),
            start_time: Timestamp::ZERO,
            end_time: kv.now(),
            revision_history: false,
        };
        let err = kv.export_range(request.clone()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(kv.export_range(request).await.is_ok());
        assert_eq!(kv.export_requests(), 2);
    }

    #[test]
    fn test_row_helpers_maintain_indexes() {
        let kv = MemKv::new();
        let mut t = TableDescriptor::new("bank")
            .column("id", ColumnType::Int, false)
            .column("balance", ColumnType::Int, false)
            .primary_key(&["id"])
            .index("balance_idx", &["balance"], false);
        t.id = 60;
        let rows: Vec<Row> = (0..10).map(|i| vec![Datum::Int(i), Datum::Int(0)]).collect();
        let t0 = kv.upsert_rows(&t, &rows).unwrap();
        let updated: Vec<Row> = (0..10).map(|i| vec![Datum::Int(i), Datum::Int(i * 10)]).collect();
        kv.upsert_rows(&t, &updated).unwrap();
        let t2 = kv.delete_rows(&t, &[vec![Datum::Int(3)]]).unwrap();

        assert_eq!(kv.scan_rows(&t, t0).unwrap(), rows);
        assert_eq!(kv.scan_rows(&t, t2).unwrap().len(), 9);
        assert_eq!(kv.count_index_entries(&t, 2, t2), 9);
        assert_eq!(kv.count_index_entries(&t, 2, t0), 10);
    }
}
