//! Shared fixtures: an in-memory cluster whose nodelocal storage lives in a
//! temp dir that other clusters can share.

#![allow(dead_code)]

use backup_engine::backup::manifest::Compression;
use backup_engine::backup::{BackupStatement, Target};
use backup_engine::catalog::descriptor::{ColumnType, TableDescriptor};
use backup_engine::catalog::rowenc::{Datum, Row};
use backup_engine::catalog::{Catalog, MemCatalog};
use backup_engine::jobs::{JobId, JobRecord, JobRegistry, JobStatus, MemJobRegistry};
use backup_engine::kv::memory::MemKv;
use backup_engine::kv::{KvStore, Timestamp};
use backup_engine::restore::{RestoreOptions, RestoreStatement};
use backup_engine::storage::StorageFactory;
use backup_engine::{EngineConfig, JobService};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn test_config(node_id: u32) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.node.id = node_id;
    config.export.concurrency = 2;
    config.export.checkpoint_interval_ms = 0;
    config.export.compression = Compression::Zstd;
    config.import.concurrency = 2;
    config.import.checkpoint_interval_ms = 0;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config
}

pub struct TestCluster {
    pub kv: Arc<MemKv>,
    pub catalog: Arc<MemCatalog>,
    pub registry: Arc<MemJobRegistry>,
    pub storage: Arc<StorageFactory>,
    pub service: JobService,
    pub extern_dir: PathBuf,
    _dir: Option<Arc<TempDir>>,
}

impl TestCluster {
    pub fn new() -> Self {
        let dir = Arc::new(TempDir::new().unwrap());
        Self::build(dir.path().to_path_buf(), Some(dir), test_config(1))
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let dir = Arc::new(TempDir::new().unwrap());
        Self::build(dir.path().to_path_buf(), Some(dir), config)
    }

    /// A separate cluster reading and writing the same external storage.
    pub fn sharing_storage(&self) -> Self {
        self.sharing_storage_with(test_config(1))
    }

    pub fn sharing_storage_with(&self, config: EngineConfig) -> Self {
        Self::build(self.extern_dir.clone(), self._dir.clone(), config)
    }

    fn build(extern_dir: PathBuf, dir: Option<Arc<TempDir>>, config: EngineConfig) -> Self {
        let kv = Arc::new(MemKv::new());
        let catalog = Arc::new(MemCatalog::new());
        let registry = Arc::new(MemJobRegistry::new());
        let storage = Arc::new(StorageFactory::new(&extern_dir));
        let service = JobService::new(
            kv.clone() as Arc<dyn KvStore>,
            catalog.clone() as Arc<dyn Catalog>,
            storage.clone(),
            registry.clone() as Arc<dyn JobRegistry>,
            config,
        );
        Self {
            kv,
            catalog,
            registry,
            storage,
            service,
            extern_dir,
            _dir: dir,
        }
    }

    /// Another node of this cluster: same data, catalog and job table.
    pub fn second_node(&self, node_id: u32) -> JobService {
        JobService::new(
            self.kv.clone() as Arc<dyn KvStore>,
            self.catalog.clone() as Arc<dyn Catalog>,
            self.storage.clone(),
            self.registry.clone() as Arc<dyn JobRegistry>,
            test_config(node_id),
        )
    }

    pub fn dir_of(&self, name: &str) -> PathBuf {
        self.extern_dir.join(name)
    }

    /// `data.bank(id, name, balance)` with a secondary index on name,
    /// filled with `rows` rows and split into several ranges.
    pub fn create_bank(&self, rows: i64) -> TableDescriptor {
        if self.catalog.database_by_name("data").is_none() {
            self.catalog.create_database_named("data").unwrap();
        }
        let table = self
            .catalog
            .create_table_in(
                "data",
                TableDescriptor::new("bank")
                    .column("id", ColumnType::Int, false)
                    .column("name", ColumnType::String, true)
                    .column("balance", ColumnType::Int, true)
                    .primary_key(&["id"])
                    .index("bank_name_idx", &["name"], false),
            )
            .unwrap();
        self.kv.upsert_rows(&table, &bank_rows(0, rows, 100)).unwrap();
        self.split_table(&table, rows, 4);
        table
    }

    /// A single-int-key table `data.<name>`.
    pub fn create_simple(&self, name: &str, keys: &[i64]) -> TableDescriptor {
        if self.catalog.database_by_name("data").is_none() {
            self.catalog.create_database_named("data").unwrap();
        }
        let table = self
            .catalog
            .create_table_in(
                "data",
                TableDescriptor::new(name)
                    .column("id", ColumnType::Int, false)
                    .column("ref_id", ColumnType::Int, true)
                    .primary_key(&["id"]),
            )
            .unwrap();
        let rows: Vec<Row> = keys.iter().map(|k| vec![Datum::Int(*k), Datum::Null]).collect();
        self.kv.upsert_rows(&table, &rows).unwrap();
        table
    }

    pub fn split_table(&self, table: &TableDescriptor, rows: i64, parts: i64) {
        let step = (rows / parts).max(1);
        let mut at = step;
        while at < rows {
            self.kv
                .split_at(backup_engine::catalog::rowenc::primary_key_for(table.id, &[Datum::Int(at)]));
            at += step;
        }
    }

    pub fn rows(&self, database: &str, table: &str) -> Vec<Row> {
        let desc = self.catalog.table(database, table).unwrap();
        self.kv.scan_rows(&desc, self.kv.now()).unwrap()
    }

    pub fn rows_at(&self, database: &str, table: &str, at: Timestamp) -> Vec<Row> {
        let desc = self.catalog.table(database, table).unwrap();
        self.kv.scan_rows(&desc, at).unwrap()
    }

    pub async fn status(&self, job_id: JobId) -> JobStatus {
        self.service.job(job_id).await.unwrap().status
    }

    pub async fn record(&self, job_id: JobId) -> JobRecord {
        self.service.job(job_id).await.unwrap()
    }
}

pub fn bank_rows(from: i64, to: i64, balance: i64) -> Vec<Row> {
    (from..to)
        .map(|i| {
            vec![
                Datum::Int(i),
                Datum::String(format!("customer-{:04}", i)),
                Datum::Int(balance),
            ]
        })
        .collect()
}

pub fn uri(name: &str) -> String {
    format!("nodelocal:///{}", name)
}

pub fn targets(targets: &[&str]) -> Vec<Target> {
    targets.iter().map(|t| t.parse().unwrap()).collect()
}

pub fn backup_stmt(t: &[&str], dest: &str) -> BackupStatement {
    BackupStatement {
        targets: targets(t),
        uri: uri(dest),
        incremental_from: vec![],
        as_of: None,
        revision_history: false,
    }
}

pub fn incremental_stmt(t: &[&str], dest: &str, from: &[&str]) -> BackupStatement {
    BackupStatement {
        incremental_from: from.iter().map(|f| uri(f)).collect(),
        ..backup_stmt(t, dest)
    }
}

pub fn restore_stmt(t: &[&str], from: &[&str]) -> RestoreStatement {
    RestoreStatement {
        targets: targets(t),
        uris: from.iter().map(|f| uri(f)).collect(),
        as_of: None,
        options: RestoreOptions::default(),
    }
}

/// Files (not directories) directly under `dir`, sorted.
pub fn files_in(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Polls `check` until it holds, panicking after five seconds.
pub async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_for_status(service: &JobService, job_id: JobId, status: JobStatus) {
    for _ in 0..500 {
        if service.job(job_id).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for job {} to reach {}", job_id, status);
}
