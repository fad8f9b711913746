//! Key-value layer contract.
//!
//! The engine only talks to the replicated store through [`KvStore`]:
//! range discovery, range export over a time interval, range import, and
//! as-of reads. [`memory::MemKv`] is the in-process implementation.

pub mod keys;
pub mod memory;
pub mod sst;
pub mod timestamp;

pub use keys::{Key, Span};
pub use timestamp::Timestamp;

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-file (and per-backup) entry accounting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCounts {
    pub data_size: u64,
    pub rows: u64,
    pub index_entries: u64,
}

impl EntryCounts {
    pub fn add(&mut self, other: &EntryCounts) {
        self.data_size += other.data_size;
        self.rows += other.rows;
        self.index_entries += other.index_entries;
    }

    /// Counts one entry under `key`: primary index entries are rows.
    pub fn record(&mut self, key: &Key, size: u64) {
        self.data_size += size;
        if key.index_id() == Some(keys::PRIMARY_INDEX_ID) {
            self.rows += 1;
        } else {
            self.index_entries += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub span: Span,
    /// Exclusive lower bound; zero exports everything up to `end_time`.
    pub start_time: Timestamp,
    /// Inclusive upper bound.
    pub end_time: Timestamp,
    pub revision_history: bool,
}

#[derive(Debug, Clone)]
pub struct ExportedFile {
    /// Sub-span of the request this file covers.
    pub span: Span,
    pub data: Vec<u8>,
    pub checksum: u32,
    pub counts: EntryCounts,
}

#[derive(Debug, Clone, Default)]
pub struct ExportResponse {
    /// Files tiling the requested span; empty when the span has no data.
    pub files: Vec<ExportedFile>,
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Rewritten span the data belongs to.
    pub span: Span,
    /// Encoded data file with rewritten keys.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportResponse {
    pub counts: EntryCounts,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    fn cluster_id(&self) -> Uuid;

    /// Current cluster time.
    fn now(&self) -> Timestamp;

    /// Splits `span` at the store's range boundaries.
    async fn range_spans(&self, span: &Span) -> Result<Vec<Span>>;

    async fn export_range(&self, request: ExportRequest) -> Result<ExportResponse>;

    async fn import_range(&self, request: ImportRequest) -> Result<ImportResponse>;

    /// Live key/values in `span` as of `at`.
    async fn scan(&self, span: &Span, at: Timestamp) -> Result<Vec<(Key, Vec<u8>)>>;

    async fn get(&self, key: &Key, at: Timestamp) -> Result<Option<Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_counts_split_rows_and_index_entries() {
        let mut counts = EntryCounts::default();
        counts.record(&keys::index_prefix(51, keys::PRIMARY_INDEX_ID), 10);
        counts.record(&keys::index_prefix(51, 2), 4);
        assert_eq!(counts.rows, 1);
        assert_eq!(counts.index_entries, 1);
        assert_eq!(counts.data_size, 14);

        let mut total = EntryCounts::default();
        total.add(&counts);
        total.add(&counts);
        assert_eq!(total.rows, 2);
        assert_eq!(total.data_size, 28);
    }
}
